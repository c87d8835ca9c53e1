//! Predictor-corrector continuation of periodic-orbit families.
//!
//! Two predictors are available: a natural-parameter step in one free
//! variable (moving the others along the family tangent), and
//! pseudo-arclength continuation (PALC) along the null vector of the
//! residual Jacobian. Both share the same step-size policy: halve and retry
//! on failure, grow after a streak of fast convergences. A corrected member
//! that lands far from its prediction counts as a failure, since the
//! corrector has then jumped to another family.

mod types;
mod util;

pub use types::{ContinuationParameter, ContinuationSettings};
pub use util::compute_nullspace_tangent;

use nalgebra::{DMatrix, DVector};
use tracing::{debug, info, warn};

use crate::correction::{
    conditioning, correct_pinned, iteration_failure, newton_step, Constraint, CorrectorSettings,
    FreeVariable, ShootingProblem,
};
use crate::dynamics::VectorField;
use crate::error::{Cr3bpError, Result};
use crate::types::{inf_norm, l2_distance, Family, PeriodicOrbit, StopReason};

/// Below this |t_p| the family tangent cannot be parameterized by p.
const TURNING_POINT_TOL: f64 = 1e-8;

/// Predicate that ends the family once it returns true for an accepted member.
pub type StopPredicate<'a> = &'a dyn Fn(&PeriodicOrbit) -> bool;

/// Outcome of one predictor-corrector attempt.
struct Member {
    orbit: PeriodicOrbit,
    parameter: f64,
    /// Largest change of a free variable made by the corrector.
    drift: f64,
    /// PALC only: unknowns and tangent at the new member.
    palc: Option<(DVector<f64>, DVector<f64>)>,
}

fn free_value(orbit: &PeriodicOrbit, var: FreeVariable) -> f64 {
    match var {
        FreeVariable::State(c) => orbit.state[c],
        FreeVariable::Period => orbit.period,
    }
}

fn set_free_value(state: &mut [f64; 6], period: &mut f64, var: FreeVariable, value: f64) {
    match var {
        FreeVariable::State(c) => state[c] = value,
        FreeVariable::Period => *period = value,
    }
}

/// Extends `seed` into a family.
///
/// On failure the error is [`Cr3bpError::ContinuationStalled`] carrying every
/// member accepted so far; singularities end the family immediately.
pub fn continue_family<F: VectorField>(
    field: &F,
    seed: &PeriodicOrbit,
    constraint: &dyn Constraint,
    parameter: ContinuationParameter,
    settings: &ContinuationSettings,
    corrector: &CorrectorSettings,
    predicate: Option<StopPredicate<'_>>,
) -> Result<Family> {
    settings.validate()?;
    corrector.validate()?;
    if seed.mu != field.mu() {
        return Err(Cr3bpError::invalid(format!(
            "seed orbit was computed for mu = {}, field has mu = {}",
            seed.mu,
            field.mu()
        )));
    }

    let mut family = Family {
        mu: seed.mu,
        constraint: constraint.name().to_string(),
        parameter,
        members: vec![seed.clone()],
        parameter_values: Vec::with_capacity(settings.max_members),
        stop_reason: StopReason::MaxMembers,
    };

    let mut palc_state = match parameter {
        ContinuationParameter::Natural(var) => {
            if !constraint.free_variables().contains(&var) {
                return Err(Cr3bpError::invalid(format!(
                    "{var:?} is not a free variable of '{}'",
                    constraint.name()
                )));
            }
            family.parameter_values.push(free_value(seed, var));
            None
        }
        ContinuationParameter::Arclength => {
            family.parameter_values.push(0.0);
            Some(initial_palc_state(field, seed, constraint, settings, corrector)?)
        }
    };

    let direction = settings.step_size.signum();
    let mut step = settings.step_size.abs();
    let mut halvings = 0usize;
    let mut fast = 0usize;

    while family.len() < settings.max_members {
        let index = family.len();
        let attempt = match (parameter, palc_state.as_ref()) {
            (ContinuationParameter::Natural(var), _) => {
                natural_step(field, &family, constraint, var, direction * step, corrector)
            }
            (ContinuationParameter::Arclength, Some((u, tangent))) => {
                palc_step(field, &family, constraint, u, tangent, step, corrector)
            }
            (ContinuationParameter::Arclength, None) => {
                Err(Cr3bpError::invalid("pseudo-arclength state missing"))
            }
        };

        let failure = match attempt {
            Ok(member) => {
                let previous = &family.members[index - 1];
                let distance = l2_distance(&member.orbit.state[..3], &previous.state[..3]);
                let drift_bound = settings.max_corrector_drift * step;
                if member.drift > drift_bound {
                    warn!(
                        member = index,
                        drift = member.drift,
                        bound = drift_bound,
                        "corrected member left the family"
                    );
                    Err(Cr3bpError::invalid(format!(
                        "member {index} corrected {:e} away from its prediction (bound {drift_bound:e})",
                        member.drift
                    )))
                } else if distance < settings.duplicate_tolerance {
                    warn!(member = index, distance, "rejecting duplicate family member");
                    Err(Cr3bpError::invalid(format!(
                        "member {index} reconverged onto its predecessor (distance {distance:e})"
                    )))
                } else {
                    Ok(member)
                }
            }
            Err(err) if err.is_singularity() => {
                let source = err.at_member(index);
                return Err(stalled(family, halvings, step, source));
            }
            Err(err) => Err(err.at_member(index)),
        };

        let member = match failure {
            Ok(member) => member,
            Err(source) => {
                halvings += 1;
                step *= 0.5;
                fast = 0;
                if halvings > settings.max_halvings || step < settings.min_step_size {
                    warn!(members = family.len(), halvings, step, "continuation stalled");
                    return Err(stalled(family, halvings, step, source));
                }
                warn!(member = index, step, error = %source, "halving continuation step");
                continue;
            }
        };

        halvings = 0;
        if member.orbit.iterations <= settings.fast_iterations {
            fast += 1;
            if fast >= settings.fast_streak {
                step = (step * settings.growth_factor).min(settings.max_step_size);
                fast = 0;
            }
        } else {
            fast = 0;
        }

        if let Some((lo, hi)) = settings.parameter_range {
            if !(lo..=hi).contains(&member.parameter) {
                family.stop_reason = StopReason::ParameterRange;
                break;
            }
        }

        debug!(
            member = index,
            parameter = member.parameter,
            period = member.orbit.period,
            iterations = member.orbit.iterations,
            step,
            "accepted family member"
        );
        let stop = predicate.is_some_and(|p| p(&member.orbit));
        if member.palc.is_some() {
            palc_state = member.palc;
        }
        family.members.push(member.orbit);
        family.parameter_values.push(member.parameter);
        if stop {
            family.stop_reason = StopReason::Predicate;
            break;
        }
    }

    info!(
        members = family.len(),
        reason = ?family.stop_reason,
        constraint = %family.constraint,
        "family continuation finished"
    );
    Ok(family)
}

fn stalled(mut family: Family, halvings: usize, step: f64, source: Cr3bpError) -> Cr3bpError {
    family.stop_reason = StopReason::Stalled;
    Cr3bpError::ContinuationStalled {
        members: family.len(),
        halvings,
        step_size: step,
        family: Box::new(family),
        source: Box::new(source),
    }
}

/// Rate of change of every free variable per unit change of `var` along the
/// family: the null vector of the residual Jacobian when it has one, else the
/// secant through the last two members, else a pure step in `var`.
fn natural_direction<F: VectorField>(
    field: &F,
    family: &Family,
    constraint: &dyn Constraint,
    var: FreeVariable,
    pinned: usize,
    corrector: &CorrectorSettings,
) -> Vec<f64> {
    let free = constraint.free_variables();
    let n = family.members.len();
    let last = &family.members[n - 1];

    let tangent = ShootingProblem::new(field, constraint, last.state, last.period, free.to_vec(), corrector)
        .and_then(|problem| problem.linearize(&problem.values()))
        .and_then(|lin| {
            if lin.jacobian.ncols() == lin.jacobian.nrows() + 1 {
                compute_nullspace_tangent(&lin.jacobian)
            } else {
                Err(Cr3bpError::invalid("residual Jacobian has no one-dimensional kernel"))
            }
        });
    match tangent {
        Ok(t) if t[pinned].abs() > TURNING_POINT_TOL => {
            return t.iter().map(|ti| ti / t[pinned]).collect();
        }
        Ok(_) => debug!("family tangent is orthogonal to the parameter, using secant"),
        Err(err) => debug!(error = %err, "no family tangent, using secant"),
    }

    if n >= 2 {
        let before = &family.members[n - 2];
        let dp = free_value(last, var) - free_value(before, var);
        if dp != 0.0 {
            return free
                .iter()
                .map(|&other| (free_value(last, other) - free_value(before, other)) / dp)
                .collect();
        }
    }
    free.iter().map(|&other| if other == var { 1.0 } else { 0.0 }).collect()
}

fn natural_step<F: VectorField>(
    field: &F,
    family: &Family,
    constraint: &dyn Constraint,
    var: FreeVariable,
    step: f64,
    corrector: &CorrectorSettings,
) -> Result<Member> {
    let free = constraint.free_variables();
    let pinned = free
        .iter()
        .position(|&other| other == var)
        .ok_or_else(|| Cr3bpError::invalid(format!("{var:?} is not a free variable")))?;
    let last = &family.members[family.members.len() - 1];
    let rates = natural_direction(field, family, constraint, var, pinned, corrector);

    let mut state = last.state;
    let mut period = last.period;
    let predicted: Vec<f64> = free
        .iter()
        .zip(&rates)
        .map(|(&other, rate)| free_value(last, other) + step * rate)
        .collect();
    for (&other, &value) in free.iter().zip(&predicted) {
        set_free_value(&mut state, &mut period, other, value);
    }

    let orbit = correct_pinned(field, &state, period, constraint, Some(var), corrector)?;
    let drift = free
        .iter()
        .zip(&predicted)
        .map(|(&other, value)| (free_value(&orbit, other) - value).abs())
        .fold(0.0, f64::max);
    Ok(Member {
        parameter: free_value(&orbit, var),
        drift,
        orbit,
        palc: None,
    })
}

fn initial_palc_state<F: VectorField>(
    field: &F,
    seed: &PeriodicOrbit,
    constraint: &dyn Constraint,
    settings: &ContinuationSettings,
    corrector: &CorrectorSettings,
) -> Result<(DVector<f64>, DVector<f64>)> {
    let problem = ShootingProblem::new(
        field,
        constraint,
        seed.state,
        seed.period,
        constraint.free_variables().to_vec(),
        corrector,
    )?;
    let u = problem.values();
    let lin = problem.linearize(&u)?;
    if lin.jacobian.nrows() + 1 != lin.jacobian.ncols() {
        return Err(Cr3bpError::invalid(format!(
            "pseudo-arclength continuation needs one more free variable than residuals, '{}' has {} and {}",
            constraint.name(),
            lin.jacobian.ncols(),
            lin.jacobian.nrows()
        )));
    }
    let mut tangent = compute_nullspace_tangent(&lin.jacobian)?;
    // The step sign selects travel along the first free variable.
    if tangent[0] * settings.step_size < 0.0 {
        tangent = -tangent;
    }
    Ok((u, tangent))
}

fn palc_step<F: VectorField>(
    field: &F,
    family: &Family,
    constraint: &dyn Constraint,
    u: &DVector<f64>,
    tangent: &DVector<f64>,
    step: f64,
    corrector: &CorrectorSettings,
) -> Result<Member> {
    let last = &family.members[family.members.len() - 1];
    let problem = ShootingProblem::new(
        field,
        constraint,
        last.state,
        last.period,
        constraint.free_variables().to_vec(),
        corrector,
    )?;
    let predicted = u + tangent * step;
    let (orbit, u_new, tangent_new) = solve_palc(&problem, &predicted, tangent, corrector)?;
    let arclength = family.parameter_values.last().copied().unwrap_or(0.0) + (&u_new - u).norm();
    let drift = (&u_new - &predicted).amax();
    Ok(Member {
        orbit,
        parameter: arclength,
        drift,
        palc: Some((u_new, tangent_new)),
    })
}

/// Newton on the bordered system [R(u); t . (u - u_pred)] = 0.
fn solve_palc<F: VectorField>(
    problem: &ShootingProblem<'_, F>,
    predicted: &DVector<f64>,
    prev_tangent: &DVector<f64>,
    settings: &CorrectorSettings,
) -> Result<(PeriodicOrbit, DVector<f64>, DVector<f64>)> {
    let dim = problem.dimension();
    let mut current = predicted.clone();
    let mut low_confidence = false;
    let mut last_residual = DVector::zeros(0);

    for iteration in 0..=settings.max_iterations {
        let lin = problem
            .linearize(&current)
            .map_err(|e| iteration_failure(e, problem, &current, iteration))?;
        let norm = inf_norm(lin.residual.as_slice());
        let arc = prev_tangent.dot(&(&current - predicted));

        let mut bordered = DMatrix::zeros(dim, dim);
        bordered.view_mut((0, 0), (dim - 1, dim)).copy_from(&lin.jacobian);
        for j in 0..dim {
            bordered[(dim - 1, j)] = prev_tangent[j];
        }

        if norm < settings.tolerance && arc.abs() < settings.tolerance.max(1e-12) {
            let mut tangent = compute_nullspace_tangent(&lin.jacobian)?;
            if tangent.dot(prev_tangent) < 0.0 {
                tangent = -tangent;
            }
            let cond = conditioning(&bordered);
            let (_, x0, period) = problem
                .residual(&current)
                .map_err(|e| iteration_failure(e, problem, &current, iteration))?;
            let orbit = problem.orbit(
                x0,
                period,
                &lin.residual,
                iteration,
                low_confidence || cond < settings.conditioning_threshold,
                cond,
            );
            return Ok((orbit, current, tangent));
        }
        last_residual = lin.residual.clone();
        if iteration == settings.max_iterations {
            break;
        }

        let mut rhs = DVector::zeros(dim);
        for i in 0..dim - 1 {
            rhs[i] = -lin.residual[i];
        }
        rhs[dim - 1] = -arc;
        let (delta, ill, cond) = newton_step(&bordered, &rhs, settings.conditioning_threshold)
            .map_err(|e| e.at_iteration(iteration))?;
        if ill {
            warn!(iteration, conditioning = cond, "ill-conditioned PALC system, taking minimum-norm step");
            low_confidence = true;
        }
        debug!(iteration, residual = norm, "PALC corrector iteration");
        current += &delta;
    }

    let (state, period) = problem.compose(&current);
    Err(Cr3bpError::ConvergenceFailed {
        iterations: settings.max_iterations,
        residual_norm: inf_norm(last_residual.as_slice()),
        residual: last_residual.iter().copied().collect(),
        last_iterate: state,
        last_period: period,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::{correct, SymmetricCrossing};
    use crate::dynamics::{Cr3bpField, MassParameter};
    use crate::libration::{lyapunov_seed, LibrationPoint};
    use crate::propagation::{propagate, PropagationSettings};

    const MU_EARTH_MOON: f64 = 0.01215;

    fn seed_orbit() -> (Cr3bpField, SymmetricCrossing, PeriodicOrbit) {
        let mu = MassParameter::new(MU_EARTH_MOON).expect("mu");
        let field = Cr3bpField::new(mu);
        let seed = lyapunov_seed(LibrationPoint::L1, mu, 0.005).expect("seed");
        let constraint = SymmetricCrossing::planar(2.0 * seed.period).expect("constraint");
        let orbit = correct(&field, &seed.state, seed.period, &constraint, &CorrectorSettings::default())
            .expect("seed orbit");
        (field, constraint, orbit)
    }

    #[test]
    fn natural_parameter_family_grows_in_period() {
        let (field, constraint, seed) = seed_orbit();
        let settings = ContinuationSettings {
            step_size: -2e-3,
            max_members: 8,
            ..ContinuationSettings::default()
        };
        let family = continue_family(
            &field,
            &seed,
            &constraint,
            ContinuationParameter::Natural(FreeVariable::State(0)),
            &settings,
            &CorrectorSettings::default(),
            None,
        )
        .expect("family");
        assert_eq!(family.len(), 8);
        assert_eq!(family.stop_reason, StopReason::MaxMembers);
        for orbit in &family.members {
            assert!(orbit.residual_norm < 1e-10);
        }
        let periods = family.periods();
        assert!(periods.windows(2).all(|w| w[1] > w[0]), "periods {periods:?}");
        let xs = &family.parameter_values;
        assert!(xs.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn natural_family_stays_on_one_branch() {
        let (field, constraint, seed) = seed_orbit();
        let settings = ContinuationSettings {
            step_size: -2e-3,
            max_members: 8,
            ..ContinuationSettings::default()
        };
        let family = continue_family(
            &field,
            &seed,
            &constraint,
            ContinuationParameter::Natural(FreeVariable::State(0)),
            &settings,
            &CorrectorSettings::default(),
            None,
        )
        .expect("family");

        let jacobi: Vec<f64> = family.members.iter().map(PeriodicOrbit::jacobi_constant).collect();
        for pair in jacobi.windows(2) {
            assert!(pair[1] < pair[0], "jacobi constants {jacobi:?}");
            assert!(pair[0] - pair[1] < 0.05, "jacobi constants {jacobi:?}");
        }
        let propagation = PropagationSettings::default();
        for orbit in &family.members {
            let trajectory = propagate(&field, &orbit.state, orbit.period, &propagation, None).expect("full period");
            let end = trajectory.final_state().expect("end state");
            let gap = l2_distance(end, &orbit.state);
            assert!(gap < 1e-8, "member at x = {} misses its start by {gap:e}", orbit.state[0]);
        }
    }

    #[test]
    fn tight_drift_bound_halves_the_step() {
        let (field, constraint, seed) = seed_orbit();
        let settings = ContinuationSettings {
            step_size: -2e-3,
            max_members: 3,
            max_halvings: 2,
            max_corrector_drift: 1e-12,
            ..ContinuationSettings::default()
        };
        let err = continue_family(
            &field,
            &seed,
            &constraint,
            ContinuationParameter::Natural(FreeVariable::State(0)),
            &settings,
            &CorrectorSettings::default(),
            None,
        )
        .expect_err("every member drifts past the bound");
        match err {
            Cr3bpError::ContinuationStalled {
                family, halvings, source, ..
            } => {
                assert_eq!(family.len(), 1);
                assert_eq!(halvings, 3);
                assert!(matches!(*source, Cr3bpError::InvalidInput(_)));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn arclength_family_matches_natural_direction() {
        let (field, constraint, seed) = seed_orbit();
        let settings = ContinuationSettings {
            step_size: -2e-3,
            max_members: 5,
            ..ContinuationSettings::default()
        };
        let family = continue_family(
            &field,
            &seed,
            &constraint,
            ContinuationParameter::Arclength,
            &settings,
            &CorrectorSettings::default(),
            None,
        )
        .expect("family");
        assert_eq!(family.len(), 5);
        assert!(family.members.iter().all(|o| o.residual_norm < 1e-10));
        assert!(family.members[4].state[0] < family.members[0].state[0]);
        assert!(family.parameter_values.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn predicate_and_range_stop_the_family() {
        let (field, constraint, seed) = seed_orbit();
        let bound = seed.period + 0.01;
        let by_period = |orbit: &PeriodicOrbit| orbit.period > bound;
        let settings = ContinuationSettings {
            step_size: -5e-3,
            max_members: 40,
            ..ContinuationSettings::default()
        };
        let family = continue_family(
            &field,
            &seed,
            &constraint,
            ContinuationParameter::Natural(FreeVariable::State(0)),
            &settings,
            &CorrectorSettings::default(),
            Some(&by_period),
        )
        .expect("family");
        assert_eq!(family.stop_reason, StopReason::Predicate);
        assert!(family.last().expect("member").period > bound);

        let x0 = seed.state[0];
        let ranged = ContinuationSettings {
            parameter_range: Some((x0 - 0.012, x0 + 1.0)),
            ..settings
        };
        let family = continue_family(
            &field,
            &seed,
            &constraint,
            ContinuationParameter::Natural(FreeVariable::State(0)),
            &ranged,
            &CorrectorSettings::default(),
            None,
        )
        .expect("family");
        assert_eq!(family.stop_reason, StopReason::ParameterRange);
        assert!(family.parameter_values.iter().all(|&x| x >= x0 - 0.012));
    }

    #[test]
    fn stalled_family_keeps_accepted_members() {
        let (field, constraint, seed) = seed_orbit();
        let settings = ContinuationSettings {
            step_size: -1e-3,
            max_members: 4,
            max_halvings: 1,
            ..ContinuationSettings::default()
        };
        // A corrector that can never meet its tolerance.
        let corrector = CorrectorSettings {
            tolerance: 1e-30,
            max_iterations: 2,
            ..CorrectorSettings::default()
        };
        let err = continue_family(
            &field,
            &seed,
            &constraint,
            ContinuationParameter::Natural(FreeVariable::State(0)),
            &settings,
            &corrector,
            None,
        )
        .expect_err("stall");
        match err {
            Cr3bpError::ContinuationStalled {
                family, halvings, source, ..
            } => {
                assert_eq!(family.len(), 1);
                assert_eq!(family.stop_reason, StopReason::Stalled);
                assert_eq!(halvings, 2);
                assert!(matches!(*source, Cr3bpError::ContinuationMember { member: 1, .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejects_parameter_outside_free_variables() {
        let (field, constraint, seed) = seed_orbit();
        let err = continue_family(
            &field,
            &seed,
            &constraint,
            ContinuationParameter::Natural(FreeVariable::State(2)),
            &ContinuationSettings::default(),
            &CorrectorSettings::default(),
            None,
        )
        .expect_err("z is not free");
        assert!(matches!(err, Cr3bpError::InvalidInput(_)));
    }

    #[test]
    fn settings_round_trip_through_json() {
        let settings = ContinuationSettings {
            parameter_range: Some((0.7, 0.85)),
            ..ContinuationSettings::default()
        };
        let json = serde_json::to_string(&settings).expect("serialize");
        let back: ContinuationSettings = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, settings);
        let partial: ContinuationSettings = serde_json::from_str(r#"{"step_size": -0.01}"#).expect("defaults");
        assert_eq!(partial.step_size, -0.01);
        assert_eq!(partial.max_halvings, 8);
        assert!(ContinuationSettings { step_size: 0.0, ..partial }.validate().is_err());
    }
}
