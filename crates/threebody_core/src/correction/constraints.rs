//! Boundary conditions a periodic orbit is corrected against.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{Cr3bpError, Result};
use crate::propagation::{ComponentCrossing, EventFunction};
use crate::types::{State, STATE_DIM};

/// A quantity the corrector may adjust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FreeVariable {
    /// Component of the initial state.
    State(usize),
    /// Duration of the propagated arc. Only meaningful for fixed-time horizons.
    Period,
}

/// Where the arc whose terminal state enters the residual ends.
pub enum Horizon<'a> {
    /// One full period (the period is either free or fixed by the seed).
    Period,
    /// First admissible crossing of `event`, searched for up to `max_time`.
    Event {
        event: &'a dyn EventFunction,
        max_time: f64,
    },
}

/// Residual function of an arc's endpoints plus the variables it may move.
///
/// Partial derivatives are returned with respect to the initial and the
/// terminal state; the corrector chains them with the state-transition
/// matrix, so no finite differences are involved.
pub trait Constraint: Send + Sync {
    fn name(&self) -> &str;

    fn free_variables(&self) -> &[FreeVariable];

    fn horizon(&self) -> Horizon<'_>;

    fn residual(&self, initial: &State, terminal: &State) -> Result<Vec<f64>>;

    /// (dR/dx0, dR/dxf), each residual-length by 6.
    fn partials(&self, initial: &State, terminal: &State) -> Result<(DMatrix<f64>, DMatrix<f64>)>;

    /// Orbit period implied by an arc of duration `arc_time`.
    fn period_from_arc(&self, arc_time: f64) -> f64 {
        arc_time
    }
}

fn check_components(components: &[usize], what: &str) -> Result<()> {
    if components.is_empty() {
        return Err(Cr3bpError::invalid(format!("{what} list is empty")));
    }
    if let Some(bad) = components.iter().find(|&&c| c >= STATE_DIM) {
        return Err(Cr3bpError::invalid(format!("{what} component {bad} out of range")));
    }
    Ok(())
}

fn check_free(free: &[FreeVariable]) -> Result<()> {
    if free.is_empty() {
        return Err(Cr3bpError::invalid("no free variables"));
    }
    for (i, var) in free.iter().enumerate() {
        if let FreeVariable::State(c) = var {
            if *c >= STATE_DIM {
                return Err(Cr3bpError::invalid(format!("free state component {c} out of range")));
            }
        }
        if free[..i].contains(var) {
            return Err(Cr3bpError::invalid(format!("free variable {var:?} listed twice")));
        }
    }
    Ok(())
}

fn selection(rows: &[usize]) -> DMatrix<f64> {
    let mut m = DMatrix::zeros(rows.len(), STATE_DIM);
    for (r, &c) in rows.iter().enumerate() {
        m[(r, c)] = 1.0;
    }
    m
}

/// Orbit symmetric about the x-z plane: starting perpendicular to it, the
/// selected velocity components vanish again at the next crossing, which
/// happens after half a period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymmetricCrossing {
    free: Vec<FreeVariable>,
    vanishing: Vec<usize>,
    plane: ComponentCrossing,
    max_time: f64,
}

impl SymmetricCrossing {
    pub fn new(free: Vec<FreeVariable>, vanishing: Vec<usize>, max_time: f64) -> Result<Self> {
        check_free(&free)?;
        check_components(&vanishing, "vanishing")?;
        if free.contains(&FreeVariable::Period) {
            return Err(Cr3bpError::invalid(
                "the half period of a symmetric crossing is fixed by the event",
            ));
        }
        if !max_time.is_finite() || max_time <= 0.0 {
            return Err(Cr3bpError::invalid(format!("max_time must be positive, got {max_time}")));
        }
        Ok(Self {
            free,
            vanishing,
            plane: ComponentCrossing::xz_plane(),
            max_time,
        })
    }

    /// Planar Lyapunov-type orbits: x and vy free, vx = 0 at the crossing.
    pub fn planar(max_time: f64) -> Result<Self> {
        Self::new(vec![FreeVariable::State(0), FreeVariable::State(4)], vec![3], max_time)
    }

    /// Halo-type orbits with z, x and vy free, vx = vz = 0 at the crossing.
    pub fn spatial(max_time: f64) -> Result<Self> {
        Self::new(
            vec![FreeVariable::State(0), FreeVariable::State(2), FreeVariable::State(4)],
            vec![3, 5],
            max_time,
        )
    }
}

impl Constraint for SymmetricCrossing {
    fn name(&self) -> &str {
        "symmetric-crossing"
    }

    fn free_variables(&self) -> &[FreeVariable] {
        &self.free
    }

    fn horizon(&self) -> Horizon<'_> {
        Horizon::Event {
            event: &self.plane,
            max_time: self.max_time,
        }
    }

    fn residual(&self, _initial: &State, terminal: &State) -> Result<Vec<f64>> {
        Ok(self.vanishing.iter().map(|&c| terminal[c]).collect())
    }

    fn partials(&self, _initial: &State, _terminal: &State) -> Result<(DMatrix<f64>, DMatrix<f64>)> {
        Ok((
            DMatrix::zeros(self.vanishing.len(), STATE_DIM),
            selection(&self.vanishing),
        ))
    }

    fn period_from_arc(&self, arc_time: f64) -> f64 {
        2.0 * arc_time
    }
}

/// x(T) - x(0) = 0 on the selected components after one full period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullPeriodicity {
    free: Vec<FreeVariable>,
    components: Vec<usize>,
}

impl FullPeriodicity {
    pub fn new(free: Vec<FreeVariable>, components: Vec<usize>) -> Result<Self> {
        check_free(&free)?;
        check_components(&components, "periodic")?;
        Ok(Self { free, components })
    }
}

impl Constraint for FullPeriodicity {
    fn name(&self) -> &str {
        "full-periodicity"
    }

    fn free_variables(&self) -> &[FreeVariable] {
        &self.free
    }

    fn horizon(&self) -> Horizon<'_> {
        Horizon::Period
    }

    fn residual(&self, initial: &State, terminal: &State) -> Result<Vec<f64>> {
        Ok(self
            .components
            .iter()
            .map(|&c| terminal[c] - initial[c])
            .collect())
    }

    fn partials(&self, _initial: &State, _terminal: &State) -> Result<(DMatrix<f64>, DMatrix<f64>)> {
        let sel = selection(&self.components);
        Ok((-&sel, sel))
    }
}
