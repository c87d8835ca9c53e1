//! Differential correction of periodic orbits by single shooting.
//!
//! The free variables (a subset of the initial state and possibly the
//! period) are driven to a zero of the constraint residual with Newton's
//! method. The residual Jacobian comes from the state-transition matrix,
//! event-corrected when the arc is cut by an event.

mod constraints;

pub use constraints::{Constraint, FreeVariable, FullPeriodicity, Horizon, SymmetricCrossing};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dynamics::VectorField;
use crate::error::{Cr3bpError, Result};
use crate::propagation::{
    event_corrected_sensitivity, propagate, terminal_sensitivity, PropagationSettings, Sampling,
};
use crate::types::{inf_norm, PeriodicOrbit, State, STATE_DIM};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectorSettings {
    /// Convergence bound on the infinity norm of the residual.
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Step halvings tried when a Newton update increases the residual.
    pub max_line_search: usize,
    /// Below this ratio of extreme singular values the Jacobian counts as
    /// rank deficient and a minimum-norm step is taken instead.
    pub conditioning_threshold: f64,
    /// Integrate the STM columns of each Jacobian in parallel.
    pub parallel_columns: bool,
    pub propagation: PropagationSettings,
}

impl Default for CorrectorSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-11,
            max_iterations: 25,
            max_line_search: 8,
            conditioning_threshold: 1e-9,
            parallel_columns: false,
            propagation: PropagationSettings::default(),
        }
    }
}

impl CorrectorSettings {
    pub fn validate(&self) -> Result<()> {
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err(Cr3bpError::invalid(format!(
                "corrector tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(Cr3bpError::invalid("corrector max_iterations must be non-zero"));
        }
        if !(0.0..1.0).contains(&self.conditioning_threshold) {
            return Err(Cr3bpError::invalid(format!(
                "conditioning threshold must lie in [0, 1), got {}",
                self.conditioning_threshold
            )));
        }
        self.propagation.validate()
    }
}

/// Residual and Jacobian of the shooting map at one point.
pub(crate) struct Linearization {
    pub residual: DVector<f64>,
    pub jacobian: DMatrix<f64>,
}

/// Shooting map z -> R(z) over the active free variables; the remaining
/// coordinates stay at their base values.
pub(crate) struct ShootingProblem<'a, F> {
    field: &'a F,
    constraint: &'a dyn Constraint,
    base_state: State,
    base_period: f64,
    active: Vec<FreeVariable>,
    settings: &'a CorrectorSettings,
}

impl<'a, F: VectorField> ShootingProblem<'a, F> {
    pub fn new(
        field: &'a F,
        constraint: &'a dyn Constraint,
        base_state: State,
        base_period: f64,
        active: Vec<FreeVariable>,
        settings: &'a CorrectorSettings,
    ) -> Result<Self> {
        if active.is_empty() {
            return Err(Cr3bpError::invalid("no active free variables"));
        }
        if active.contains(&FreeVariable::Period)
            && matches!(constraint.horizon(), Horizon::Event { .. })
        {
            return Err(Cr3bpError::invalid(format!(
                "constraint '{}' ends at an event, so the period cannot be free",
                constraint.name()
            )));
        }
        if !base_period.is_finite() {
            return Err(Cr3bpError::invalid(format!("period guess is not finite: {base_period}")));
        }
        Ok(Self {
            field,
            constraint,
            base_state,
            base_period,
            active,
            settings,
        })
    }

    pub fn dimension(&self) -> usize {
        self.active.len()
    }

    pub fn values(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.active.len(),
            self.active.iter().map(|var| match var {
                FreeVariable::State(c) => self.base_state[*c],
                FreeVariable::Period => self.base_period,
            }),
        )
    }

    /// Initial state and arc duration (for fixed-time horizons) at `z`.
    pub fn compose(&self, z: &DVector<f64>) -> (State, f64) {
        let mut state = self.base_state;
        let mut period = self.base_period;
        for (var, value) in self.active.iter().zip(z.iter()) {
            match var {
                FreeVariable::State(c) => state[*c] = *value,
                FreeVariable::Period => period = *value,
            }
        }
        (state, period)
    }

    /// Residual, initial state and orbit period at `z`, without sensitivities.
    pub fn residual(&self, z: &DVector<f64>) -> Result<(DVector<f64>, State, f64)> {
        let (x0, period) = self.compose(z);
        let propagation = PropagationSettings {
            sampling: Sampling::Steps,
            ..self.settings.propagation.clone()
        };
        let (terminal, orbit_period) = match self.constraint.horizon() {
            Horizon::Period => {
                let traj = propagate(self.field, &x0, period, &propagation, None)?;
                let terminal = *traj
                    .final_state()
                    .ok_or_else(|| Cr3bpError::invalid("empty propagation"))?;
                (terminal, period)
            }
            Horizon::Event { event, max_time } => {
                let traj = propagate(self.field, &x0, max_time, &propagation, Some(event))?;
                let record = traj
                    .event
                    .ok_or(Cr3bpError::EventNotFound { span: max_time })?;
                (record.state, self.constraint.period_from_arc(record.time))
            }
        };
        let residual = self.constraint.residual(&x0, &terminal)?;
        Ok((DVector::from_vec(residual), x0, orbit_period))
    }

    pub fn linearize(&self, z: &DVector<f64>) -> Result<Linearization> {
        let (x0, period) = self.compose(z);
        let parallel = self.settings.parallel_columns;
        let propagation = &self.settings.propagation;

        let (terminal, dxf_dx0, dxf_dt) = match self.constraint.horizon() {
            Horizon::Period => {
                let sens = terminal_sensitivity(self.field, &x0, period, propagation, None, parallel)?;
                (sens.state, sens.stm, Some(sens.derivative))
            }
            Horizon::Event { event, max_time } => {
                let sens =
                    terminal_sensitivity(self.field, &x0, max_time, propagation, Some(event), parallel)?;
                let gradient = event.gradient(&sens.state);
                let (corrected, _) =
                    event_corrected_sensitivity(&sens.stm, &sens.derivative, &gradient)?;
                (sens.state, corrected, None)
            }
        };

        let residual = DVector::from_vec(self.constraint.residual(&x0, &terminal)?);
        let (r_x0, r_xf) = self.constraint.partials(&x0, &terminal)?;
        if r_x0.nrows() != residual.len() || r_xf.nrows() != residual.len() {
            return Err(Cr3bpError::invalid(format!(
                "constraint '{}' partials do not match its {} residuals",
                self.constraint.name(),
                residual.len()
            )));
        }
        let dxf_dx0 = DMatrix::from_fn(STATE_DIM, STATE_DIM, |i, j| dxf_dx0[(i, j)]);
        let chained = &r_xf * &dxf_dx0;

        let mut jacobian = DMatrix::zeros(residual.len(), self.active.len());
        for (j, var) in self.active.iter().enumerate() {
            match var {
                FreeVariable::State(c) => {
                    let column = r_x0.column(*c) + chained.column(*c);
                    jacobian.set_column(j, &column);
                }
                FreeVariable::Period => {
                    let f = dxf_dt.ok_or_else(|| {
                        Cr3bpError::invalid("period sensitivity requested on an event horizon")
                    })?;
                    let column = &r_xf * DVector::from_column_slice(&f);
                    jacobian.set_column(j, &column);
                }
            }
        }
        Ok(Linearization { residual, jacobian })
    }

    pub fn orbit(
        &self,
        x0: State,
        period: f64,
        residual: &DVector<f64>,
        iterations: usize,
        low_confidence: bool,
        conditioning: f64,
    ) -> PeriodicOrbit {
        PeriodicOrbit {
            state: x0,
            period,
            mu: self.field.mu(),
            residual_norm: inf_norm(residual.as_slice()),
            residual: residual.iter().copied().collect(),
            iterations,
            low_confidence,
            conditioning,
            constraint: self.constraint.name().to_string(),
        }
    }
}

/// Failure of one correction iteration. An arc that loses its terminal event
/// means the iterate left the basin of the constraint, which is a convergence
/// failure at `z` rather than bad input.
pub(crate) fn iteration_failure<F: VectorField>(
    err: Cr3bpError,
    problem: &ShootingProblem<'_, F>,
    z: &DVector<f64>,
    iteration: usize,
) -> Cr3bpError {
    match err {
        Cr3bpError::EventNotFound { .. } => {
            let (state, period) = problem.compose(z);
            Cr3bpError::ConvergenceFailed {
                iterations: iteration,
                residual_norm: f64::INFINITY,
                residual: Vec::new(),
                last_iterate: state,
                last_period: period,
            }
        }
        other => other.at_iteration(iteration),
    }
}

/// Ratio of the smallest to the largest singular value (0 for a zero matrix).
pub(crate) fn conditioning(matrix: &DMatrix<f64>) -> f64 {
    let sv = matrix.singular_values();
    let max = sv.iter().copied().fold(0.0, f64::max);
    let min = sv.iter().copied().fold(f64::INFINITY, f64::min);
    if max > 0.0 && min.is_finite() {
        min / max
    } else {
        0.0
    }
}

/// Solves J dz = rhs. Returns the step and whether the minimum-norm
/// (pseudo-inverse) fallback on a rank-deficient J was needed.
pub(crate) fn newton_step(
    jacobian: &DMatrix<f64>,
    rhs: &DVector<f64>,
    threshold: f64,
) -> Result<(DVector<f64>, bool, f64)> {
    let cond = conditioning(jacobian);
    if jacobian.is_square() && cond >= threshold {
        if let Some(step) = jacobian.clone().lu().solve(rhs) {
            return Ok((step, false, cond));
        }
    }
    let svd = jacobian.clone().svd(true, true);
    let largest = svd.singular_values.iter().copied().fold(0.0, f64::max);
    let ill = cond < threshold;
    let cutoff = if ill { largest * threshold } else { largest * f64::EPSILON };
    let step = svd.solve(rhs, cutoff).map_err(|e| Cr3bpError::Linalg(e.to_string()))?;
    Ok((step, ill, cond))
}

/// Corrects `seed` (with period guess `period`) against `constraint`,
/// adjusting all of its free variables.
pub fn correct<F: VectorField>(
    field: &F,
    seed: &State,
    period: f64,
    constraint: &dyn Constraint,
    settings: &CorrectorSettings,
) -> Result<PeriodicOrbit> {
    correct_pinned(field, seed, period, constraint, None, settings)
}

/// As [`correct`], holding `pinned` at its seed value.
pub fn correct_pinned<F: VectorField>(
    field: &F,
    seed: &State,
    period: f64,
    constraint: &dyn Constraint,
    pinned: Option<FreeVariable>,
    settings: &CorrectorSettings,
) -> Result<PeriodicOrbit> {
    settings.validate()?;
    let active: Vec<FreeVariable> = constraint
        .free_variables()
        .iter()
        .copied()
        .filter(|var| Some(*var) != pinned)
        .collect();
    if let Some(var) = pinned {
        if active.len() == constraint.free_variables().len() {
            return Err(Cr3bpError::invalid(format!(
                "{var:?} is not a free variable of '{}'",
                constraint.name()
            )));
        }
    }
    let problem = ShootingProblem::new(field, constraint, *seed, period, active, settings)?;
    newton(&problem, settings)
}

fn newton<F: VectorField>(
    problem: &ShootingProblem<'_, F>,
    settings: &CorrectorSettings,
) -> Result<PeriodicOrbit> {
    let mut z = problem.values();
    let mut low_confidence = false;
    let mut last = None;
    let mut reached = settings.max_iterations;

    for iteration in 0..=settings.max_iterations {
        let lin = problem
            .linearize(&z)
            .map_err(|e| iteration_failure(e, problem, &z, iteration))?;
        let norm = inf_norm(lin.residual.as_slice());
        let (step, ill, cond) = newton_step(&lin.jacobian, &(-&lin.residual), settings.conditioning_threshold)
            .map_err(|e| e.at_iteration(iteration))?;
        debug!(iteration, residual = norm, conditioning = cond, "newton iteration");

        if norm < settings.tolerance {
            let (_, x0, period) = problem
                .residual(&z)
                .map_err(|e| iteration_failure(e, problem, &z, iteration))?;
            let orbit = problem.orbit(x0, period, &lin.residual, iteration, low_confidence || ill, cond);
            info!(
                iterations = iteration,
                residual = norm,
                period,
                low_confidence = orbit.low_confidence,
                "differential correction converged"
            );
            return Ok(orbit);
        }
        if iteration == settings.max_iterations {
            last = Some(lin.residual);
            break;
        }
        if ill {
            warn!(
                iteration,
                conditioning = cond,
                "ill-conditioned correction Jacobian, taking minimum-norm step"
            );
            low_confidence = true;
        }
        if step.norm() <= f64::EPSILON * z.norm().max(1.0) {
            last = Some(lin.residual);
            reached = iteration;
            break;
        }

        let mut scale = 1.0;
        let mut accepted = None;
        for attempt in 0..=settings.max_line_search {
            let trial = &z + &step * scale;
            let trial_norm = match problem.residual(&trial) {
                Ok((trial_residual, _, _)) => inf_norm(trial_residual.as_slice()),
                // Overshooting the crossing: shorten the step.
                Err(Cr3bpError::EventNotFound { .. }) if attempt < settings.max_line_search => {
                    f64::INFINITY
                }
                Err(e) => return Err(iteration_failure(e, problem, &trial, iteration)),
            };
            if trial_norm < norm || attempt == settings.max_line_search {
                accepted = Some(trial);
                break;
            }
            scale *= 0.5;
        }
        if let Some(next) = accepted {
            z = next;
        }
    }

    let residual = last.unwrap_or_else(|| DVector::zeros(0));
    let (state, period) = problem.compose(&z);
    Err(Cr3bpError::ConvergenceFailed {
        iterations: reached,
        residual_norm: inf_norm(residual.as_slice()),
        residual: residual.iter().copied().collect(),
        last_iterate: state,
        last_period: period,
    })
}
