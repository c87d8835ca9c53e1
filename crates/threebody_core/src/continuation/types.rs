//! Settings and parameter choices for family continuation.

use serde::{Deserialize, Serialize};

use crate::correction::FreeVariable;
use crate::error::{Cr3bpError, Result};

/// Quantity stepped from one family member to the next.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ContinuationParameter {
    /// Step one free variable and hold it fixed while correcting the rest.
    Natural(FreeVariable),
    /// Pseudo-arclength along the solution curve in the space of all free
    /// variables; passes through turning points of the natural parameters.
    Arclength,
}

/// Settings controlling the predictor-corrector loop.
///
/// The sign of `step_size` selects the direction of travel; magnitudes are
/// adapted between `min_step_size` and `max_step_size`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuationSettings {
    pub step_size: f64,
    pub min_step_size: f64,
    pub max_step_size: f64,
    /// Consecutive halvings tolerated before the family is declared stalled.
    pub max_halvings: usize,
    pub growth_factor: f64,
    /// A member counts as fast when it converged within this many iterations.
    pub fast_iterations: usize,
    /// Fast members in a row needed before the step grows.
    pub fast_streak: usize,
    /// Members whose initial positions lie closer than this are duplicates.
    pub duplicate_tolerance: f64,
    /// A corrected member may move at most this many step lengths away from
    /// its prediction in any free variable; further means another family.
    pub max_corrector_drift: f64,
    /// Includes the seed orbit.
    pub max_members: usize,
    /// Stop once the parameter leaves [lo, hi].
    pub parameter_range: Option<(f64, f64)>,
}

impl Default for ContinuationSettings {
    fn default() -> Self {
        Self {
            step_size: 1e-3,
            min_step_size: 1e-7,
            max_step_size: 5e-2,
            max_halvings: 8,
            growth_factor: 2.0,
            fast_iterations: 4,
            fast_streak: 3,
            duplicate_tolerance: 1e-10,
            max_corrector_drift: 10.0,
            max_members: 50,
            parameter_range: None,
        }
    }
}

impl ContinuationSettings {
    pub fn validate(&self) -> Result<()> {
        if !self.step_size.is_finite() || self.step_size == 0.0 {
            return Err(Cr3bpError::invalid(format!(
                "continuation step must be finite and non-zero, got {}",
                self.step_size
            )));
        }
        if !(self.min_step_size > 0.0 && self.min_step_size <= self.max_step_size) {
            return Err(Cr3bpError::invalid(format!(
                "continuation step bounds [{}, {}] are inconsistent",
                self.min_step_size, self.max_step_size
            )));
        }
        if self.step_size.abs() < self.min_step_size || self.step_size.abs() > self.max_step_size {
            return Err(Cr3bpError::invalid(format!(
                "initial step {} outside [{}, {}]",
                self.step_size, self.min_step_size, self.max_step_size
            )));
        }
        if !(self.growth_factor >= 1.0) {
            return Err(Cr3bpError::invalid(format!(
                "growth factor must be at least 1, got {}",
                self.growth_factor
            )));
        }
        if !(self.max_corrector_drift > 0.0) {
            return Err(Cr3bpError::invalid(format!(
                "corrector drift bound must be positive, got {}",
                self.max_corrector_drift
            )));
        }
        if self.max_members < 1 {
            return Err(Cr3bpError::invalid("max_members must be at least 1"));
        }
        if let Some((lo, hi)) = self.parameter_range {
            if !(lo <= hi) {
                return Err(Cr3bpError::invalid(format!(
                    "parameter range [{lo}, {hi}] is empty"
                )));
            }
        }
        Ok(())
    }
}
