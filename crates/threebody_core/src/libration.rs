//! Equilibrium (libration) points and their linearised dynamics.
//!
//! The collinear points are located through the quintic in gamma, the
//! distance from the point to its nearest primary; the triangular points
//! form equilateral triangles with the primaries.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::dynamics::MassParameter;
use crate::error::{Cr3bpError, Result};
use crate::types::State;

const GAMMA_BISECTION_ITERS: usize = 200;
const GAMMA_TOL: f64 = 1e-15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LibrationPoint {
    L1,
    L2,
    L3,
    L4,
    L5,
}

impl LibrationPoint {
    pub fn is_collinear(self) -> bool {
        matches!(self, LibrationPoint::L1 | LibrationPoint::L2 | LibrationPoint::L3)
    }

    /// Position (x, y, z) in the synodic frame.
    pub fn position(self, mu: MassParameter) -> Result<[f64; 3]> {
        let m = mu.value();
        match self {
            LibrationPoint::L1 => Ok([1.0 - m - self.gamma(mu)?, 0.0, 0.0]),
            LibrationPoint::L2 => Ok([1.0 - m + self.gamma(mu)?, 0.0, 0.0]),
            LibrationPoint::L3 => Ok([-m - self.gamma(mu)?, 0.0, 0.0]),
            LibrationPoint::L4 => Ok([0.5 - m, 3f64.sqrt() / 2.0, 0.0]),
            LibrationPoint::L5 => Ok([0.5 - m, -3f64.sqrt() / 2.0, 0.0]),
        }
    }

    /// Equilibrium as a full state (zero velocity).
    pub fn state(self, mu: MassParameter) -> Result<State> {
        let [x, y, z] = self.position(mu)?;
        Ok([x, y, z, 0.0, 0.0, 0.0])
    }

    /// Distance from a collinear point to its nearest primary (L3: to the larger one).
    pub fn gamma(self, mu: MassParameter) -> Result<f64> {
        let m = mu.value();
        let (coeffs, lo, hi) = match self {
            LibrationPoint::L1 => (
                [1.0, -(3.0 - m), 3.0 - 2.0 * m, -m, 2.0 * m, -m],
                0.0,
                1.0,
            ),
            LibrationPoint::L2 => (
                [1.0, 3.0 - m, 3.0 - 2.0 * m, -m, -2.0 * m, -m],
                0.0,
                1.0,
            ),
            LibrationPoint::L3 => {
                let m1 = 1.0 - m;
                (
                    [1.0, 2.0 + m, 1.0 + 2.0 * m, -m1, -2.0 * m1, -m1],
                    0.5,
                    1.5,
                )
            }
            LibrationPoint::L4 | LibrationPoint::L5 => {
                return Err(Cr3bpError::invalid(format!(
                    "{self:?} is not a collinear point"
                )))
            }
        };
        solve_quintic_in_bracket(&coeffs, lo, hi)
    }

    /// Linearised collinear dynamics; `None` for the triangular points.
    pub fn linear_data(self, mu: MassParameter) -> Result<Option<LinearData>> {
        if !self.is_collinear() {
            return Ok(None);
        }
        let m = mu.value();
        let [x, _, _] = self.position(mu)?;
        let r1 = (x + m).abs();
        let r2 = (x - 1.0 + m).abs();
        let c2 = (1.0 - m) / r1.powi(3) + m / r2.powi(3);

        let disc = 9.0 * c2 * c2 - 8.0 * c2;
        if disc < 0.0 {
            return Err(Cr3bpError::Linalg(format!(
                "negative discriminant {disc} in linear modes (c2 = {c2})"
            )));
        }
        let root = disc.sqrt();
        let lambda1 = (0.5 * (c2 - 2.0 + root)).sqrt();
        let omega1 = (0.5 * (2.0 - c2 + root)).sqrt();
        let omega2 = c2.sqrt();
        Ok(Some(LinearData {
            point: self,
            mu: m,
            c2,
            lambda1,
            omega1,
            omega2,
        }))
    }
}

/// Eigen-structure of the collinear equilibrium: a saddle (rate `lambda1`)
/// times an in-plane centre (`omega1`) times a vertical centre (`omega2`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearData {
    pub point: LibrationPoint,
    pub mu: f64,
    pub c2: f64,
    pub lambda1: f64,
    pub omega1: f64,
    pub omega2: f64,
}

/// Initial guess for a planar Lyapunov orbit from the linear in-plane oscillation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LyapunovSeed {
    pub state: State,
    pub period: f64,
}

/// Linear planar Lyapunov seed with x-amplitude `amplitude` (nondimensional).
///
/// The orbit starts on the x-axis, displaced by -amplitude from the point,
/// moving perpendicular to it; the period guess is 2 pi / omega1.
pub fn lyapunov_seed(point: LibrationPoint, mu: MassParameter, amplitude: f64) -> Result<LyapunovSeed> {
    if !amplitude.is_finite() || amplitude <= 0.0 {
        return Err(Cr3bpError::invalid(format!(
            "Lyapunov amplitude must be positive, got {amplitude}"
        )));
    }
    let data = point.linear_data(mu)?.ok_or_else(|| {
        Cr3bpError::invalid(format!("{point:?} has no planar Lyapunov family"))
    })?;
    let [x_l, _, _] = point.position(mu)?;
    let w = data.omega1;
    let kappa = (w * w + 1.0 + 2.0 * data.c2) / (2.0 * w);
    Ok(LyapunovSeed {
        state: [x_l - amplitude, 0.0, 0.0, 0.0, kappa * w * amplitude, 0.0],
        period: 2.0 * PI / w,
    })
}

fn eval_poly(coeffs: &[f64], x: f64) -> (f64, f64) {
    let mut p = 0.0;
    let mut dp = 0.0;
    for &c in coeffs {
        dp = dp * x + p;
        p = p * x + c;
    }
    (p, dp)
}

fn solve_quintic_in_bracket(coeffs: &[f64], mut lo: f64, mut hi: f64) -> Result<f64> {
    let (mut p_lo, _) = eval_poly(coeffs, lo);
    let (p_hi, _) = eval_poly(coeffs, hi);
    if p_lo * p_hi > 0.0 {
        return Err(Cr3bpError::Linalg(format!(
            "gamma polynomial is not bracketed on [{lo}, {hi}]"
        )));
    }
    for _ in 0..GAMMA_BISECTION_ITERS {
        let mid = 0.5 * (lo + hi);
        let (p_mid, _) = eval_poly(coeffs, mid);
        if p_mid == 0.0 {
            return Ok(mid);
        }
        if p_lo * p_mid < 0.0 {
            hi = mid;
        } else {
            lo = mid;
            p_lo = p_mid;
        }
        if hi - lo < GAMMA_TOL {
            break;
        }
    }
    // Newton polish from the bracket midpoint.
    let mut gamma = 0.5 * (lo + hi);
    for _ in 0..3 {
        let (p, dp) = eval_poly(coeffs, gamma);
        if dp == 0.0 {
            break;
        }
        let next = gamma - p / dp;
        if !next.is_finite() || next < lo - GAMMA_TOL || next > hi + GAMMA_TOL {
            break;
        }
        gamma = next;
    }
    Ok(gamma)
}
