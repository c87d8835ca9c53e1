//! Error taxonomy shared by every stage of the engine.
//!
//! Field and propagation failures bubble up through correction and
//! continuation unchanged; the outer stages only wrap them with the
//! iteration, member or seed index they occurred at.

use thiserror::Error;

use crate::types::{Family, Trajectory};

pub type Result<T> = std::result::Result<T, Cr3bpError>;

/// Why an integration was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergenceReason {
    /// The accepted-plus-rejected step budget ran out.
    StepBudgetExhausted,
    /// The controller asked for a step below the minimum representable size.
    StepSizeUnderflow,
    /// A state component became NaN or infinite.
    NonFiniteState,
}

impl std::fmt::Display for DivergenceReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            DivergenceReason::StepBudgetExhausted => "step budget exhausted",
            DivergenceReason::StepSizeUnderflow => "step size underflow",
            DivergenceReason::NonFiniteState => "non-finite state",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error)]
pub enum Cr3bpError {
    /// The evaluation point lies on (or within tolerance of) a primary.
    #[error("state {position:?} lies within {distance:e} of primary {primary} (tolerance {tolerance:e})")]
    Singularity {
        primary: usize,
        position: [f64; 3],
        distance: f64,
        tolerance: f64,
    },

    /// The integrator gave up. The samples produced so far are preserved.
    #[error("propagation diverged at t = {time} after {steps} steps: {reason}")]
    PropagationDiverged {
        reason: DivergenceReason,
        time: f64,
        steps: usize,
        last_state: Vec<f64>,
        partial: Box<Trajectory>,
    },

    /// A terminal event was requested but the trajectory never reached it.
    #[error("event did not occur within a span of {span}")]
    EventNotFound { span: f64 },

    #[error(
        "differential correction failed to converge in {iterations} iterations (|R| = {residual_norm:e})"
    )]
    ConvergenceFailed {
        iterations: usize,
        residual_norm: f64,
        residual: Vec<f64>,
        last_iterate: [f64; 6],
        last_period: f64,
    },

    /// Step halving ran out before a new member could be corrected.
    /// `family` holds every member accepted before the stall.
    #[error(
        "continuation stalled after {members} members ({halvings} halvings, step {step_size:e}): {source}"
    )]
    ContinuationStalled {
        members: usize,
        halvings: usize,
        step_size: f64,
        family: Box<Family>,
        #[source]
        source: Box<Cr3bpError>,
    },

    #[error("correction iteration {iteration}: {source}")]
    CorrectionStep {
        iteration: usize,
        #[source]
        source: Box<Cr3bpError>,
    },

    #[error("family member {member}: {source}")]
    ContinuationMember {
        member: usize,
        #[source]
        source: Box<Cr3bpError>,
    },

    #[error("manifold seed {seed}: {source}")]
    ManifoldSeed {
        seed: usize,
        #[source]
        source: Box<Cr3bpError>,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("linear algebra failure: {0}")]
    Linalg(String),

    /// Failure raised by a caller-implemented constraint.
    #[error("constraint evaluation failed: {0}")]
    Constraint(#[from] anyhow::Error),
}

impl Cr3bpError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Cr3bpError::InvalidInput(message.into())
    }

    pub(crate) fn at_iteration(self, iteration: usize) -> Self {
        Cr3bpError::CorrectionStep {
            iteration,
            source: Box::new(self),
        }
    }

    pub(crate) fn at_member(self, member: usize) -> Self {
        Cr3bpError::ContinuationMember {
            member,
            source: Box::new(self),
        }
    }

    pub(crate) fn at_seed(self, seed: usize) -> Self {
        Cr3bpError::ManifoldSeed {
            seed,
            source: Box::new(self),
        }
    }

    /// Strips the contextual wrappers and returns the error that started it all.
    pub fn root_cause(&self) -> &Cr3bpError {
        match self {
            Cr3bpError::CorrectionStep { source, .. }
            | Cr3bpError::ContinuationMember { source, .. }
            | Cr3bpError::ManifoldSeed { source, .. }
            | Cr3bpError::ContinuationStalled { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_singularity(&self) -> bool {
        matches!(self.root_cause(), Cr3bpError::Singularity { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_unwraps_nested_context() {
        let inner = Cr3bpError::Singularity {
            primary: 2,
            position: [1.0, 0.0, 0.0],
            distance: 0.0,
            tolerance: 1e-12,
        };
        let wrapped = inner.at_iteration(3).at_member(7);
        assert!(wrapped.is_singularity());
        let message = format!("{wrapped}");
        assert!(message.contains("family member 7"));
        assert!(message.contains("correction iteration 3"));
    }

    #[test]
    fn constraint_errors_convert_from_anyhow() {
        let err: Cr3bpError = anyhow::anyhow!("bad target").into();
        assert!(format!("{err}").contains("bad target"));
    }
}
