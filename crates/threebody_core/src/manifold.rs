//! Stable and unstable manifolds of periodic orbits.
//!
//! Seeds are spread uniformly in time along the orbit. At each seed the
//! reference eigenvector is carried along by the state-transition matrix,
//! rescaled to unit position length and used as the displacement direction.
//! Every seed is propagated independently on the rayon pool and results are
//! collected in seed order, so regenerating a branch reproduces it exactly.

use nalgebra::Vector6;
use num_complex::Complex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dynamics::VectorField;
use crate::error::{Cr3bpError, Result};
use crate::propagation::{
    propagate, propagate_with_stm, ComponentCrossing, EventFunction, PropagationSettings, Sampling,
};
use crate::stability::StabilityIndex;
use crate::types::{OrbitFingerprint, PeriodicOrbit, State, Trajectory, STATE_DIM};

/// Imaginary parts below this mark a multiplier as real.
const REAL_MULTIPLIER_TOL: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifoldStability {
    /// Propagated backward in time from the seeds.
    Stable,
    /// Propagated forward in time from the seeds.
    Unstable,
}

/// Side of the orbit the seeds are displaced to. `Positive` follows the
/// eigenvector oriented with a positive x component at the reference state
/// (or, when x vanishes, a positive first non-zero component); `Negative` is
/// its mirror image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifoldSide {
    Positive,
    Negative,
}

impl ManifoldSide {
    fn sign(self) -> f64 {
        match self {
            ManifoldSide::Positive => 1.0,
            ManifoldSide::Negative => -1.0,
        }
    }
}

fn default_seeds() -> usize {
    50
}

fn default_integration_time() -> f64 {
    5.0
}

/// Branch request. There is deliberately no default `perturbation`: the
/// displacement trades linear validity against the time needed to leave the
/// orbit, and a value near 1e-6 (a few hundred metres in Earth-Moon units)
/// is a common starting point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifoldSettings {
    pub stability: ManifoldStability,
    pub side: ManifoldSide,
    /// Nondimensional displacement along the position part of the eigenvector.
    pub perturbation: f64,
    #[serde(default = "default_seeds")]
    pub seeds: usize,
    /// Length of each propagation; the sign is taken from `stability`.
    #[serde(default = "default_integration_time")]
    pub integration_time: f64,
    /// Terminates each trajectory at its first crossing.
    #[serde(default)]
    pub event: Option<ComponentCrossing>,
    #[serde(default)]
    pub propagation: PropagationSettings,
}

impl ManifoldSettings {
    pub fn new(stability: ManifoldStability, side: ManifoldSide, perturbation: f64) -> Self {
        Self {
            stability,
            side,
            perturbation,
            seeds: default_seeds(),
            integration_time: default_integration_time(),
            event: None,
            propagation: PropagationSettings::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.perturbation.is_finite() || self.perturbation <= 0.0 {
            return Err(Cr3bpError::invalid(format!(
                "manifold perturbation must be positive, got {}",
                self.perturbation
            )));
        }
        if self.seeds == 0 {
            return Err(Cr3bpError::invalid("manifold needs at least one seed"));
        }
        if !self.integration_time.is_finite() || self.integration_time <= 0.0 {
            return Err(Cr3bpError::invalid(format!(
                "manifold integration time must be positive, got {}",
                self.integration_time
            )));
        }
        self.propagation.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifoldTrajectory {
    pub seed_index: usize,
    /// Time along the orbit, measured from its reference state.
    pub seed_time: f64,
    /// Unperturbed orbit state at `seed_time`.
    pub orbit_state: State,
    pub seed_state: State,
    pub trajectory: Trajectory,
}

impl ManifoldTrajectory {
    pub fn terminated_by_event(&self) -> bool {
        self.trajectory.event.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifoldBranch {
    pub source: OrbitFingerprint,
    pub stability: ManifoldStability,
    pub side: ManifoldSide,
    pub perturbation: f64,
    pub multiplier: Complex<f64>,
    pub trajectories: Vec<ManifoldTrajectory>,
}

impl ManifoldBranch {
    /// False once `orbit` differs from the orbit the branch was seeded from.
    pub fn is_valid_for(&self, orbit: &PeriodicOrbit) -> bool {
        self.source.matches(orbit)
    }

    pub fn len(&self) -> usize {
        self.trajectories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }
}

/// Eigenvector of the requested branch, oriented so its x component is
/// positive, falling back to the first non-zero component when x vanishes.
fn reference_direction(
    index: &StabilityIndex,
    stability: ManifoldStability,
) -> Result<(Complex<f64>, Vector6<f64>)> {
    let pair = match stability {
        ManifoldStability::Unstable => index.dominant_unstable(),
        ManifoldStability::Stable => index.dominant_stable(),
    }
    .ok_or_else(|| {
        Cr3bpError::invalid(format!("orbit has no {stability:?} multiplier"))
    })?;
    if !pair.is_real(REAL_MULTIPLIER_TOL) {
        return Err(Cr3bpError::invalid(format!(
            "{stability:?} multiplier {} is complex; manifolds need a real one",
            pair.value
        )));
    }
    let mut v = Vector6::from_row_slice(&pair.real_vector());
    let pivot = if v[0].abs() > f64::EPSILON {
        v[0]
    } else {
        v.iter().copied().find(|c| c.abs() > f64::EPSILON).unwrap_or(0.0)
    };
    if pivot < 0.0 {
        v = -v;
    }
    Ok((pair.value, v))
}

/// Generates one branch of the stable or unstable manifold of `orbit`.
pub fn generate_branch<F: VectorField>(
    field: &F,
    orbit: &PeriodicOrbit,
    index: &StabilityIndex,
    settings: &ManifoldSettings,
) -> Result<ManifoldBranch> {
    settings.validate()?;
    if let Some(source) = &index.source {
        if !source.matches(orbit) {
            return Err(Cr3bpError::invalid(
                "stability index was computed for a different orbit",
            ));
        }
    }
    if orbit.mu != field.mu() {
        return Err(Cr3bpError::invalid(format!(
            "orbit was computed for mu = {}, field has mu = {}",
            orbit.mu,
            field.mu()
        )));
    }
    let (multiplier, direction) = reference_direction(index, settings.stability)?;

    // Orbit states and STMs at t_k = k T / N, k = 0..N-1.
    let n = settings.seeds;
    let sampled = PropagationSettings {
        sampling: Sampling::Uniform(n + 1),
        ..settings.propagation.clone()
    };
    let along_orbit = propagate_with_stm(field, &orbit.state, orbit.period, &sampled, None)?;

    let sign = settings.side.sign();
    let seeds: Vec<(usize, f64, State, State)> = (0..n)
        .map(|k| {
            let orbit_state = along_orbit.trajectory.states[k];
            let mapped = along_orbit.stms[k] * direction;
            let position_norm = mapped.fixed_rows::<3>(0).norm();
            let scale = if position_norm > 0.0 { position_norm } else { mapped.norm() };
            if !(scale > 0.0) {
                return Err(Cr3bpError::Linalg(format!(
                    "mapped eigenvector vanishes at seed {k}"
                ))
                .at_seed(k));
            }
            let mut seed_state = orbit_state;
            for (i, value) in seed_state.iter_mut().enumerate() {
                *value += sign * settings.perturbation * mapped[i] / scale;
            }
            Ok((k, along_orbit.trajectory.times[k], orbit_state, seed_state))
        })
        .collect::<Result<_>>()?;

    let span = match settings.stability {
        ManifoldStability::Unstable => settings.integration_time,
        ManifoldStability::Stable => -settings.integration_time,
    };
    let event = settings.event.as_ref().map(|e| e as &dyn EventFunction);

    let results: Vec<Result<ManifoldTrajectory>> = seeds
        .par_iter()
        .map(|&(seed_index, seed_time, orbit_state, seed_state)| {
            let trajectory = propagate(field, &seed_state, span, &settings.propagation, event)
                .map_err(|e| e.at_seed(seed_index))?;
            Ok(ManifoldTrajectory {
                seed_index,
                seed_time,
                orbit_state,
                seed_state,
                trajectory,
            })
        })
        .collect();
    // The first failing seed in seed order wins, independent of scheduling.
    let trajectories = results.into_iter().collect::<Result<Vec<_>>>()?;

    let terminated = trajectories.iter().filter(|t| t.terminated_by_event()).count();
    debug!(seeds = n, terminated, "propagated manifold seeds");
    info!(
        stability = ?settings.stability,
        side = ?settings.side,
        seeds = n,
        multiplier = multiplier.re,
        "manifold branch generated"
    );

    Ok(ManifoldBranch {
        source: OrbitFingerprint::of(orbit),
        stability: settings.stability,
        side: settings.side,
        perturbation: settings.perturbation,
        multiplier,
        trajectories,
    })
}

/// Linear check of a seed direction: how far the displaced state has moved
/// away from the orbit, relative to the initial displacement, after `time`.
pub fn displacement_growth<F: VectorField>(
    field: &F,
    trajectory: &ManifoldTrajectory,
    time: f64,
    propagation: &PropagationSettings,
) -> Result<f64> {
    let settings = PropagationSettings {
        sampling: Sampling::Steps,
        ..propagation.clone()
    };
    let end_of = |x0: &State| -> Result<State> {
        let traj = propagate(field, x0, time, &settings, None)?;
        traj.final_state()
            .copied()
            .ok_or_else(|| Cr3bpError::invalid("empty propagation"))
    };
    let reference = end_of(&trajectory.orbit_state)?;
    let displaced = end_of(&trajectory.seed_state)?;
    let distance = |a: &State, b: &State| -> f64 {
        (0..STATE_DIM).map(|i| (a[i] - b[i]).powi(2)).sum::<f64>().sqrt()
    };
    let initial = distance(&trajectory.seed_state, &trajectory.orbit_state);
    if initial == 0.0 {
        return Err(Cr3bpError::invalid("seed coincides with the orbit"));
    }
    Ok(distance(&displaced, &reference) / initial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::{correct, CorrectorSettings, SymmetricCrossing};
    use crate::dynamics::{Cr3bpField, MassParameter};
    use crate::libration::{lyapunov_seed, LibrationPoint};
    use crate::propagation::CrossingDirection;
    use crate::stability::{stability_index, StabilitySettings};

    fn lyapunov() -> (Cr3bpField, PeriodicOrbit, StabilityIndex) {
        let mu = MassParameter::new(0.01215).expect("mu");
        let field = Cr3bpField::new(mu);
        let seed = lyapunov_seed(LibrationPoint::L1, mu, 0.005).expect("seed");
        let constraint = SymmetricCrossing::planar(seed.period).expect("constraint");
        let corrector = CorrectorSettings::default();
        let orbit = correct(&field, &seed.state, seed.period, &constraint, &corrector).expect("orbit");
        let index = stability_index(
            &field,
            &orbit,
            &StabilitySettings {
                reciprocal_tolerance: 1e-3,
                ..StabilitySettings::default()
            },
            &corrector.propagation,
        )
        .expect("stability");
        (field, orbit, index)
    }

    fn settings(stability: ManifoldStability, side: ManifoldSide) -> ManifoldSettings {
        ManifoldSettings {
            seeds: 6,
            integration_time: 1.0,
            ..ManifoldSettings::new(stability, side, 1e-6)
        }
    }

    #[test]
    fn regenerating_a_branch_is_bit_for_bit_identical() {
        let (field, orbit, index) = lyapunov();
        let request = settings(ManifoldStability::Unstable, ManifoldSide::Positive);
        let first = generate_branch(&field, &orbit, &index, &request).expect("branch");
        let second = generate_branch(&field, &orbit, &index, &request).expect("branch");
        assert_eq!(first, second);
        assert_eq!(first.len(), 6);
        assert!(first.is_valid_for(&orbit));
        let seeds: Vec<usize> = first.trajectories.iter().map(|t| t.seed_index).collect();
        assert_eq!(seeds, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn seeds_sit_at_the_requested_distance() {
        let (field, orbit, index) = lyapunov();
        let request = settings(ManifoldStability::Stable, ManifoldSide::Negative);
        let branch = generate_branch(&field, &orbit, &index, &request).expect("branch");
        for t in &branch.trajectories {
            let dp: f64 = (0..3)
                .map(|i| (t.seed_state[i] - t.orbit_state[i]).powi(2))
                .sum::<f64>()
                .sqrt();
            assert!((dp - 1e-6).abs() < 1e-12, "position offset {dp}");
            // Stable branches run backward in time.
            assert!(t.trajectory.final_time().expect("time") < 0.0);
        }
        assert_eq!(branch.trajectories[0].orbit_state, orbit.state);
    }

    #[test]
    fn sides_mirror_each_other_about_the_orbit() {
        let (field, orbit, index) = lyapunov();
        let positive = generate_branch(
            &field,
            &orbit,
            &index,
            &settings(ManifoldStability::Unstable, ManifoldSide::Positive),
        )
        .expect("positive branch");
        let negative = generate_branch(
            &field,
            &orbit,
            &index,
            &settings(ManifoldStability::Unstable, ManifoldSide::Negative),
        )
        .expect("negative branch");

        // At the reference state the positive side steps toward larger x.
        let first = &positive.trajectories[0];
        assert!(first.seed_state[0] > first.orbit_state[0]);
        for (p, n) in positive.trajectories.iter().zip(&negative.trajectories) {
            assert_eq!(p.orbit_state, n.orbit_state);
            for i in 0..6 {
                let up = p.seed_state[i] - p.orbit_state[i];
                let down = n.seed_state[i] - n.orbit_state[i];
                assert!((up + down).abs() < 1e-15, "component {i}: {up} vs {down}");
            }
        }
    }

    #[test]
    fn unstable_seeds_depart_from_the_orbit() {
        let (field, orbit, index) = lyapunov();
        let request = settings(ManifoldStability::Unstable, ManifoldSide::Positive);
        let branch = generate_branch(&field, &orbit, &index, &request).expect("branch");
        let growth = displacement_growth(
            &field,
            &branch.trajectories[0],
            orbit.period,
            &request.propagation,
        )
        .expect("growth");
        // Close to the unstable multiplier after one period.
        let lambda = branch.multiplier.re;
        assert!(growth > 0.5 * lambda && growth < 2.0 * lambda, "growth {growth} vs {lambda}");
    }

    #[test]
    fn event_terminates_trajectories() {
        let (field, orbit, index) = lyapunov();
        let mut request = settings(ManifoldStability::Unstable, ManifoldSide::Positive);
        request.integration_time = 6.0;
        request.event = Some(
            ComponentCrossing::new(0, 1.0 - 0.01215, CrossingDirection::Either).expect("plane"),
        );
        let branch = generate_branch(&field, &orbit, &index, &request).expect("branch");
        for t in &branch.trajectories {
            if let Some(record) = t.trajectory.event {
                assert!((record.state[0] - (1.0 - 0.01215)).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn changed_orbit_invalidates_branch() {
        let (field, orbit, index) = lyapunov();
        let request = settings(ManifoldStability::Unstable, ManifoldSide::Positive);
        let branch = generate_branch(&field, &orbit, &index, &request).expect("branch");
        let mut moved = orbit.clone();
        moved.state[0] += 1e-9;
        assert!(!branch.is_valid_for(&moved));
        assert!(generate_branch(&field, &moved, &index, &request).is_err());
    }

    #[test]
    fn perturbation_has_no_default() {
        let json = r#"{"stability":"Unstable","side":"Positive"}"#;
        assert!(serde_json::from_str::<ManifoldSettings>(json).is_err());
        let json = r#"{"stability":"Stable","side":"Negative","perturbation":1e-6}"#;
        let parsed: ManifoldSettings = serde_json::from_str(json).expect("settings");
        assert_eq!(parsed.seeds, 50);
        assert!(ManifoldSettings::new(ManifoldStability::Stable, ManifoldSide::Positive, 0.0)
            .validate()
            .is_err());
    }
}
