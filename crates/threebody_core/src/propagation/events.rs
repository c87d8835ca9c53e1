//! Terminal event functions and the sensitivities of event-terminated arcs.

use nalgebra::{Matrix6, RowVector6, Vector6};
use serde::{Deserialize, Serialize};

use crate::error::{Cr3bpError, Result};
use crate::types::{State, STATE_DIM};

/// Which sign changes of an event function count as a crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CrossingDirection {
    #[default]
    Either,
    /// g goes from negative to positive.
    Increasing,
    /// g goes from positive to negative.
    Decreasing,
}

impl CrossingDirection {
    pub(crate) fn admits(self, before: f64, after: f64) -> bool {
        if before == 0.0 {
            return false;
        }
        match self {
            CrossingDirection::Either => before * after <= 0.0,
            CrossingDirection::Increasing => before < 0.0 && after >= 0.0,
            CrossingDirection::Decreasing => before > 0.0 && after <= 0.0,
        }
    }
}

/// Scalar function of the state whose sign change terminates a propagation.
pub trait EventFunction: Send + Sync {
    fn value(&self, state: &State) -> f64;

    /// Gradient of `value` with respect to the state.
    fn gradient(&self, state: &State) -> State;

    fn direction(&self) -> CrossingDirection {
        CrossingDirection::Either
    }
}

/// Plane crossing `state[component] == value`, e.g. y = 0 for the x-z plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentCrossing {
    pub component: usize,
    pub value: f64,
    #[serde(default)]
    pub direction: CrossingDirection,
}

impl ComponentCrossing {
    pub fn new(component: usize, value: f64, direction: CrossingDirection) -> Result<Self> {
        if component >= STATE_DIM {
            return Err(Cr3bpError::invalid(format!(
                "event component {component} out of range"
            )));
        }
        Ok(Self {
            component,
            value,
            direction,
        })
    }

    /// The x-z plane (y = 0), crossed in either direction.
    pub fn xz_plane() -> Self {
        Self {
            component: 1,
            value: 0.0,
            direction: CrossingDirection::Either,
        }
    }
}

impl EventFunction for ComponentCrossing {
    fn value(&self, state: &State) -> f64 {
        state[self.component] - self.value
    }

    fn gradient(&self, _state: &State) -> State {
        let mut grad = [0.0; STATE_DIM];
        grad[self.component] = 1.0;
        grad
    }

    fn direction(&self) -> CrossingDirection {
        self.direction
    }
}

/// Sensitivities of the terminal state and time of an arc that ends at g(x) = 0.
///
/// Returns (dx_f/dx_0, dt_f/dx_0), where the first is
/// Phi - f(x_f) (grad g . Phi) / (grad g . f(x_f)).
pub fn event_corrected_sensitivity(
    stm: &Matrix6<f64>,
    terminal_derivative: &State,
    gradient: &State,
) -> Result<(Matrix6<f64>, RowVector6<f64>)> {
    let f = Vector6::from_column_slice(terminal_derivative);
    let g = RowVector6::from_row_slice(gradient);
    let rate = (g * f)[(0, 0)];
    if rate.abs() < f64::EPSILON {
        return Err(Cr3bpError::Linalg(format!(
            "flow is tangent to the event surface (dg/dt = {rate:e})"
        )));
    }
    let dt_dx0 = -(g * stm) / rate;
    Ok((stm + f * dt_dx0, dt_dx0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_filters_sign_changes() {
        assert!(CrossingDirection::Either.admits(1.0, -1.0));
        assert!(CrossingDirection::Increasing.admits(-1.0, 0.5));
        assert!(!CrossingDirection::Increasing.admits(1.0, -0.5));
        assert!(CrossingDirection::Decreasing.admits(1.0, 0.0));
        // Starting on the surface is never a crossing.
        assert!(!CrossingDirection::Either.admits(0.0, 1.0));
    }

    #[test]
    fn component_crossing_rejects_bad_index() {
        assert!(ComponentCrossing::new(6, 0.0, CrossingDirection::Either).is_err());
        let plane = ComponentCrossing::new(2, 0.5, CrossingDirection::Increasing).expect("plane");
        let state = [0.0, 0.0, 0.75, 0.0, 0.0, 0.0];
        assert_eq!(plane.value(&state), 0.25);
        assert_eq!(plane.gradient(&state)[2], 1.0);
    }

    #[test]
    fn corrected_sensitivity_keeps_terminal_on_surface() {
        let stm = Matrix6::from_fn(|i, j| if i == j { 1.0 } else { 0.1 * (i + j) as f64 });
        let f = [0.3, -0.8, 0.0, 0.2, 0.1, 0.0];
        let grad = ComponentCrossing::xz_plane().gradient(&[0.0; 6]);
        let (dxf, dtf) = event_corrected_sensitivity(&stm, &f, &grad).expect("sensitivity");
        // Every perturbation keeps the terminal state on y = 0.
        for j in 0..6 {
            assert!(dxf[(1, j)].abs() < 1e-14);
        }
        assert!((dtf[0] - stm[(1, 0)] / 0.8).abs() < 1e-14);
        assert!(event_corrected_sensitivity(&stm, &[1.0, 0.0, 0.0, 0.0, 0.0, 0.0], &grad).is_err());
    }
}
