//! Equations of motion of the circular restricted three-body problem in the
//! rotating, nondimensional synodic frame.
//!
//! The larger primary (mass 1 - mu) sits at (-mu, 0, 0) and the smaller one
//! (mass mu) at (1 - mu, 0, 0). Units are chosen so that the primaries are
//! one length unit apart and the frame rotates at unit rate.

use nalgebra::Matrix6;
use serde::{Deserialize, Serialize};

use crate::autodiff;
use crate::error::{Cr3bpError, Result};
use crate::traits::{DynamicalSystem, Scalar};
use crate::types::{State, STATE_DIM};

/// Evaluations closer than this to a primary are refused.
pub const DEFAULT_SINGULARITY_TOLERANCE: f64 = 1e-10;

/// Mass ratio mu = m2 / (m1 + m2), restricted to (0, 0.5].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct MassParameter(f64);

impl MassParameter {
    pub fn new(mu: f64) -> Result<Self> {
        if !mu.is_finite() || mu <= 0.0 || mu > 0.5 {
            return Err(Cr3bpError::invalid(format!(
                "mass parameter must lie in (0, 0.5], got {mu}"
            )));
        }
        Ok(Self(mu))
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// Position of the primary with index 1 (larger) or 2 (smaller) on the x-axis.
    pub fn primary_x(self, primary: usize) -> f64 {
        if primary == 1 {
            -self.0
        } else {
            1.0 - self.0
        }
    }
}

impl TryFrom<f64> for MassParameter {
    type Error = Cr3bpError;

    fn try_from(value: f64) -> Result<Self> {
        MassParameter::new(value)
    }
}

impl From<MassParameter> for f64 {
    fn from(value: MassParameter) -> Self {
        value.0
    }
}

/// Source of derivatives and Jacobians for the propagator.
///
/// The built-in [`Cr3bpField`] evaluates the closed-form expressions; any other
/// numerically equivalent evaluator can be substituted.
pub trait VectorField: Sync {
    fn mu(&self) -> f64;

    fn derivative(&self, state: &State) -> Result<State>;

    /// Jacobian of `derivative` with respect to the state.
    fn jacobian(&self, state: &State) -> Result<Matrix6<f64>>;

    fn evaluate(&self, state: &State) -> Result<(State, Matrix6<f64>)> {
        Ok((self.derivative(state)?, self.jacobian(state)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cr3bpField {
    mu: MassParameter,
    singularity_tolerance: f64,
}

struct PrimaryDistances {
    dx1: f64,
    dx2: f64,
    r1: f64,
    r2: f64,
}

impl Cr3bpField {
    pub fn new(mu: MassParameter) -> Self {
        Self {
            mu,
            singularity_tolerance: DEFAULT_SINGULARITY_TOLERANCE,
        }
    }

    pub fn with_singularity_tolerance(mu: MassParameter, tolerance: f64) -> Result<Self> {
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(Cr3bpError::invalid(format!(
                "singularity tolerance must be finite and non-negative, got {tolerance}"
            )));
        }
        Ok(Self {
            mu,
            singularity_tolerance: tolerance,
        })
    }

    pub fn mass_parameter(&self) -> MassParameter {
        self.mu
    }

    pub fn singularity_tolerance(&self) -> f64 {
        self.singularity_tolerance
    }

    fn distances(&self, position: [f64; 3]) -> Result<PrimaryDistances> {
        let mu = self.mu.value();
        let [x, y, z] = position;
        let dx1 = x + mu;
        let dx2 = x - 1.0 + mu;
        let yz = y * y + z * z;
        let r1 = (dx1 * dx1 + yz).sqrt();
        let r2 = (dx2 * dx2 + yz).sqrt();
        for (primary, distance) in [(1usize, r1), (2usize, r2)] {
            if distance <= self.singularity_tolerance || distance == 0.0 {
                return Err(Cr3bpError::Singularity {
                    primary,
                    position,
                    distance,
                    tolerance: self.singularity_tolerance,
                });
            }
        }
        Ok(PrimaryDistances { dx1, dx2, r1, r2 })
    }

    /// Jacobian via forward-mode dual numbers; agrees with [`VectorField::jacobian`]
    /// to rounding and serves as an independent check of the closed form.
    pub fn jacobian_autodiff(&self, state: &State) -> Result<Matrix6<f64>> {
        let jac = autodiff::jacobian::<Self>(self, 0.0, state)?;
        Ok(Matrix6::from_fn(|i, j| jac[(i, j)]))
    }
}

impl<T: Scalar> DynamicalSystem<T> for Cr3bpField {
    fn dimension(&self) -> usize {
        STATE_DIM
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) -> Result<()> {
        self.distances([x[0].value(), x[1].value(), x[2].value()])?;

        let mu = T::from_f64(self.mu.value());
        let one = T::one();
        let two = T::from_f64(2.0);
        let one_minus_mu = one - mu;

        let dx1 = x[0] + mu;
        let dx2 = x[0] - one_minus_mu;
        let yz = x[1] * x[1] + x[2] * x[2];
        let r1_sq = dx1 * dx1 + yz;
        let r2_sq = dx2 * dx2 + yz;
        let r1_3 = r1_sq * r1_sq.sqrt();
        let r2_3 = r2_sq * r2_sq.sqrt();
        let k1 = one_minus_mu / r1_3;
        let k2 = mu / r2_3;

        out[0] = x[3];
        out[1] = x[4];
        out[2] = x[5];
        out[3] = two * x[4] + x[0] - k1 * dx1 - k2 * dx2;
        out[4] = -two * x[3] + x[1] - (k1 + k2) * x[1];
        out[5] = -(k1 + k2) * x[2];
        Ok(())
    }
}

impl VectorField for Cr3bpField {
    fn mu(&self) -> f64 {
        self.mu.value()
    }

    fn derivative(&self, state: &State) -> Result<State> {
        let mut out = [0.0; STATE_DIM];
        DynamicalSystem::<f64>::apply(self, 0.0, state, &mut out)?;
        Ok(out)
    }

    fn jacobian(&self, state: &State) -> Result<Matrix6<f64>> {
        let mu = self.mu.value();
        let d = self.distances([state[0], state[1], state[2]])?;
        let (y, z) = (state[1], state[2]);

        let r1_3 = d.r1.powi(3);
        let r2_3 = d.r2.powi(3);
        let r1_5 = r1_3 * d.r1 * d.r1;
        let r2_5 = r2_3 * d.r2 * d.r2;
        let a1 = (1.0 - mu) / r1_3;
        let a2 = mu / r2_3;
        let b1 = 3.0 * (1.0 - mu) / r1_5;
        let b2 = 3.0 * mu / r2_5;

        let uxx = 1.0 - a1 - a2 + b1 * d.dx1 * d.dx1 + b2 * d.dx2 * d.dx2;
        let uyy = 1.0 - a1 - a2 + (b1 + b2) * y * y;
        let uzz = -a1 - a2 + (b1 + b2) * z * z;
        let uxy = (b1 * d.dx1 + b2 * d.dx2) * y;
        let uxz = (b1 * d.dx1 + b2 * d.dx2) * z;
        let uyz = (b1 + b2) * y * z;

        let mut jac = Matrix6::zeros();
        jac[(0, 3)] = 1.0;
        jac[(1, 4)] = 1.0;
        jac[(2, 5)] = 1.0;
        jac[(3, 0)] = uxx;
        jac[(3, 1)] = uxy;
        jac[(3, 2)] = uxz;
        jac[(4, 0)] = uxy;
        jac[(4, 1)] = uyy;
        jac[(4, 2)] = uyz;
        jac[(5, 0)] = uxz;
        jac[(5, 1)] = uyz;
        jac[(5, 2)] = uzz;
        jac[(3, 4)] = 2.0;
        jac[(4, 3)] = -2.0;
        Ok(jac)
    }
}

/// Effective (pseudo-)potential U = (x^2 + y^2)/2 + (1 - mu)/r1 + mu/r2.
pub fn effective_potential(mu: f64, state: &State) -> f64 {
    let [x, y, z, ..] = *state;
    let r1 = ((x + mu).powi(2) + y * y + z * z).sqrt();
    let r2 = ((x - 1.0 + mu).powi(2) + y * y + z * z).sqrt();
    0.5 * (x * x + y * y) + (1.0 - mu) / r1 + mu / r2
}

/// Jacobi integral C = 2U - |v|^2, conserved along every trajectory.
pub fn jacobi_constant(mu: f64, state: &State) -> f64 {
    let v_sq = state[3] * state[3] + state[4] * state[4] + state[5] * state[5];
    2.0 * effective_potential(mu, state) - v_sq
}

/// Energy E = |v|^2 / 2 - U, so that C = -2E.
pub fn energy(mu: f64, state: &State) -> f64 {
    -0.5 * jacobi_constant(mu, state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MU_EARTH_MOON: f64 = 0.01215;

    fn field() -> Cr3bpField {
        Cr3bpField::new(MassParameter::new(MU_EARTH_MOON).expect("mu"))
    }

    #[test]
    fn mass_parameter_rejects_out_of_range() {
        assert!(MassParameter::new(0.0).is_err());
        assert!(MassParameter::new(-0.1).is_err());
        assert!(MassParameter::new(0.6).is_err());
        assert!(MassParameter::new(f64::NAN).is_err());
        assert!(MassParameter::new(0.5).is_ok());
    }

    #[test]
    fn mass_parameter_deserialization_validates() {
        let ok: MassParameter = serde_json::from_str("0.01215").expect("valid mu");
        assert_eq!(ok.value(), 0.01215);
        assert!(serde_json::from_str::<MassParameter>("0.75").is_err());
    }

    #[test]
    fn derivative_copies_velocity_into_position_rates() {
        let state = [0.5, 0.2, 0.1, 0.3, -0.4, 0.05];
        let d = field().derivative(&state).expect("derivative");
        assert_eq!(&d[0..3], &[0.3, -0.4, 0.05]);
    }

    #[test]
    fn analytic_jacobian_matches_dual_numbers() {
        let f = field();
        let state = [0.83, 0.07, -0.04, 0.01, 0.12, -0.02];
        let analytic = f.jacobian(&state).expect("analytic");
        let dual = f.jacobian_autodiff(&state).expect("dual");
        assert!((analytic - dual).abs().max() < 1e-10);
    }

    #[test]
    fn evaluation_at_primary_is_a_singularity() {
        let f = field();
        let at_moon = [1.0 - MU_EARTH_MOON, 0.0, 0.0, 0.0, 0.0, 0.0];
        let err = f.derivative(&at_moon).expect_err("moon is singular");
        match err {
            Cr3bpError::Singularity { primary, .. } => assert_eq!(primary, 2),
            other => panic!("unexpected error {other:?}"),
        }
        let at_earth = [-MU_EARTH_MOON, 0.0, 0.0, 0.0, 0.0, 0.0];
        assert!(f.jacobian(&at_earth).expect_err("earth is singular").is_singularity());
    }

    #[test]
    fn singularity_tolerance_is_configurable() {
        let mu = MassParameter::new(MU_EARTH_MOON).expect("mu");
        let f = Cr3bpField::with_singularity_tolerance(mu, 1e-3).expect("field");
        let near_moon = [1.0 - MU_EARTH_MOON + 5e-4, 0.0, 0.0, 0.0, 0.0, 0.0];
        assert!(f.derivative(&near_moon).is_err());
        assert!(field().derivative(&near_moon).is_ok());
        assert!(Cr3bpField::with_singularity_tolerance(mu, -1.0).is_err());
    }

    #[test]
    fn jacobi_constant_relates_to_energy() {
        let state = [0.8, 0.1, 0.0, 0.0, 0.2, 0.0];
        let c = jacobi_constant(MU_EARTH_MOON, &state);
        assert!((c + 2.0 * energy(MU_EARTH_MOON, &state)).abs() < 1e-14);
    }

    #[test]
    fn jacobian_has_symmetric_potential_block_and_coriolis_terms() {
        let jac = field().jacobian(&[0.7, 0.2, 0.1, 0.0, 0.0, 0.0]).expect("jacobian");
        let hessian = jac.fixed_view::<3, 3>(3, 0).into_owned();
        assert!((hessian - hessian.transpose()).abs().max() < 1e-14);
        assert_eq!(jac[(3, 4)], 2.0);
        assert_eq!(jac[(4, 3)], -2.0);
    }

    proptest! {
        #[test]
        fn analytic_jacobian_agrees_with_dual_numbers_for_any_mu(
            m in 1e-7f64..=0.5f64,
            x in -1.5f64..1.5f64,
            y in 0.05f64..1.0f64,
            z in -0.5f64..0.5f64,
            vx in -1.0f64..1.0f64,
            vy in -1.0f64..1.0f64,
        ) {
            let f = Cr3bpField::new(MassParameter::new(m).expect("mu"));
            // y bounded away from zero keeps the point off both primaries.
            let state = [x, y, z, vx, vy, 0.0];
            let analytic = f.jacobian(&state).expect("analytic");
            let dual = f.jacobian_autodiff(&state).expect("dual");
            let scale = analytic.abs().max().max(1.0);
            prop_assert!((analytic - dual).abs().max() < 1e-9 * scale);
        }
    }
}
