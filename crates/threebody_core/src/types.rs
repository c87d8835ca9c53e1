//! Records exchanged between the engine stages and with the outside world.
//!
//! Everything here is created once and read afterwards; the persistence and
//! plotting layers consume these through serde.

use serde::{Deserialize, Serialize};

use crate::continuation::ContinuationParameter;
use crate::dynamics::{jacobi_constant, Cr3bpField, MassParameter};
use crate::error::Result;
use crate::propagation::{propagate, PropagationSettings, Sampling};

/// Position (x, y, z) and velocity (vx, vy, vz) in the rotating synodic frame.
pub type State = [f64; 6];

pub const STATE_DIM: usize = 6;
/// State plus a row-major 6x6 state-transition matrix.
pub const AUGMENTED_DIM: usize = STATE_DIM + STATE_DIM * STATE_DIM;

/// Where an event function crossed zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub time: f64,
    pub state: State,
    pub value: f64,
}

/// Samples of one propagation call, in integration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub times: Vec<f64>,
    pub states: Vec<State>,
    /// Set when the propagation was cut short by an event.
    #[serde(default)]
    pub event: Option<EventRecord>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn initial_state(&self) -> Option<&State> {
        self.states.first()
    }

    pub fn final_state(&self) -> Option<&State> {
        self.states.last()
    }

    pub fn final_time(&self) -> Option<f64> {
        self.times.last().copied()
    }
}

/// A converged periodic orbit. `state` is the corrected initial condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicOrbit {
    pub state: State,
    pub period: f64,
    pub mu: f64,
    /// Infinity norm of the final constraint residual.
    pub residual_norm: f64,
    pub residual: Vec<f64>,
    pub iterations: usize,
    /// Set when a minimum-norm step had to be taken on a near-singular Jacobian.
    pub low_confidence: bool,
    /// Smallest-to-largest singular value ratio of the last correction Jacobian.
    pub conditioning: f64,
    /// Name of the constraint the orbit was corrected against.
    pub constraint: String,
}

impl PeriodicOrbit {
    pub fn jacobi_constant(&self) -> f64 {
        jacobi_constant(self.mu, &self.state)
    }

    pub fn mass_parameter(&self) -> Result<MassParameter> {
        MassParameter::new(self.mu)
    }

    /// Propagates one full period and returns `samples` uniformly spaced states.
    pub fn trajectory(&self, settings: &PropagationSettings, samples: usize) -> Result<Trajectory> {
        let field = Cr3bpField::new(self.mass_parameter()?);
        let settings = PropagationSettings {
            sampling: Sampling::Uniform(samples.max(2)),
            ..settings.clone()
        };
        propagate(&field, &self.state, self.period, &settings, None)
    }
}

/// Identity of the orbit a derived record was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrbitFingerprint {
    pub state: State,
    pub period: f64,
    pub mu: f64,
}

impl OrbitFingerprint {
    pub fn of(orbit: &PeriodicOrbit) -> Self {
        Self {
            state: orbit.state,
            period: orbit.period,
            mu: orbit.mu,
        }
    }

    pub fn matches(&self, orbit: &PeriodicOrbit) -> bool {
        *self == Self::of(orbit)
    }
}

/// Why continuation stopped producing members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    MaxMembers,
    ParameterRange,
    Predicate,
    /// Step halving ran out; see `Cr3bpError::ContinuationStalled`.
    Stalled,
}

/// Orbits in continuation order. Index 0 is the seed orbit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Family {
    pub mu: f64,
    pub constraint: String,
    pub parameter: ContinuationParameter,
    pub members: Vec<PeriodicOrbit>,
    /// Value of the continuation parameter for each member (arclength for PALC).
    pub parameter_values: Vec<f64>,
    pub stop_reason: StopReason,
}

impl Family {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn last(&self) -> Option<&PeriodicOrbit> {
        self.members.last()
    }

    pub fn periods(&self) -> Vec<f64> {
        self.members.iter().map(|orbit| orbit.period).collect()
    }
}

pub(crate) fn inf_norm(v: &[f64]) -> f64 {
    v.iter().fold(0.0, |acc, value| acc.max(value.abs()))
}

pub(crate) fn l2_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}
