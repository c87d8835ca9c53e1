//! Adaptive propagation of states and state-transition matrices.
//!
//! All entry points integrate forward or backward depending on the sign of
//! the span and never truncate silently: a run either reaches the end of the
//! span (or its terminal event) or fails with
//! [`Cr3bpError::PropagationDiverged`] carrying the samples produced so far.

mod events;
mod rkf78;

pub use events::{event_corrected_sensitivity, ComponentCrossing, CrossingDirection, EventFunction};

use nalgebra::Matrix6;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::dynamics::VectorField;
use crate::error::{Cr3bpError, DivergenceReason, Result};
use crate::types::{EventRecord, State, Trajectory, AUGMENTED_DIM, STATE_DIM};
use rkf78::{Rhs, Rkf78};

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 5.0;
const ERROR_EXPONENT: f64 = 1.0 / 8.0;
const MAX_EVENT_ITERS: usize = 100;

/// Which samples a propagation keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Sampling {
    /// Every accepted integrator step.
    #[default]
    Steps,
    /// This many samples evenly spaced in time, endpoints included.
    Uniform(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationSettings {
    pub abs_tol: f64,
    pub rel_tol: f64,
    pub initial_step: f64,
    pub min_step: f64,
    pub max_step: f64,
    /// Accepted plus rejected steps before the run is declared diverged.
    pub max_steps: usize,
    /// Convergence bound on |g| when locating an event.
    pub event_tol: f64,
    /// A run that underflows or blows up this close to a primary collided with it.
    pub collision_radius: f64,
    pub sampling: Sampling,
}

impl Default for PropagationSettings {
    fn default() -> Self {
        Self {
            abs_tol: 1e-12,
            rel_tol: 1e-12,
            initial_step: 1e-3,
            min_step: 1e-14,
            max_step: 1.0,
            max_steps: 200_000,
            event_tol: 1e-13,
            collision_radius: 1e-5,
            sampling: Sampling::Steps,
        }
    }
}

impl PropagationSettings {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("abs_tol", self.abs_tol),
            ("rel_tol", self.rel_tol),
            ("initial_step", self.initial_step),
            ("min_step", self.min_step),
            ("max_step", self.max_step),
            ("event_tol", self.event_tol),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(Cr3bpError::invalid(format!(
                    "propagation {name} must be positive, got {value}"
                )));
            }
        }
        if !self.collision_radius.is_finite() || self.collision_radius < 0.0 {
            return Err(Cr3bpError::invalid(format!(
                "propagation collision_radius must be non-negative, got {}",
                self.collision_radius
            )));
        }
        if self.min_step > self.max_step {
            return Err(Cr3bpError::invalid("propagation min_step exceeds max_step"));
        }
        if self.max_steps == 0 {
            return Err(Cr3bpError::invalid("propagation max_steps must be non-zero"));
        }
        if let Sampling::Uniform(n) = self.sampling {
            if n < 2 {
                return Err(Cr3bpError::invalid("uniform sampling needs at least 2 samples"));
            }
        }
        Ok(())
    }
}

/// Trajectory plus the state-transition matrix at every sample.
#[derive(Debug, Clone, PartialEq)]
pub struct StmPropagation {
    pub trajectory: Trajectory,
    pub stms: Vec<Matrix6<f64>>,
}

impl StmPropagation {
    pub fn final_stm(&self) -> Option<&Matrix6<f64>> {
        self.stms.last()
    }
}

/// End point of a propagation and its sensitivity to the initial state.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalSensitivity {
    pub time: f64,
    pub state: State,
    /// Field derivative at `state`.
    pub derivative: State,
    pub stm: Matrix6<f64>,
    pub event: Option<EventRecord>,
}

struct StateRhs<'a, F>(&'a F);

impl<F: VectorField> Rhs for StateRhs<'_, F> {
    fn dim(&self) -> usize {
        STATE_DIM
    }

    fn eval(&self, y: &[f64], out: &mut [f64]) -> Result<()> {
        let f = self.0.derivative(&head(y))?;
        out.copy_from_slice(&f);
        Ok(())
    }
}

/// State plus a row-major STM, Phi' = A Phi.
struct StmRhs<'a, F>(&'a F);

impl<F: VectorField> Rhs for StmRhs<'_, F> {
    fn dim(&self) -> usize {
        AUGMENTED_DIM
    }

    fn eval(&self, y: &[f64], out: &mut [f64]) -> Result<()> {
        let (f, a) = self.0.evaluate(&head(y))?;
        out[..STATE_DIM].copy_from_slice(&f);
        let phi = &y[STATE_DIM..];
        for i in 0..STATE_DIM {
            for j in 0..STATE_DIM {
                let mut acc = 0.0;
                for k in 0..STATE_DIM {
                    acc += a[(i, k)] * phi[k * STATE_DIM + j];
                }
                out[STATE_DIM + i * STATE_DIM + j] = acc;
            }
        }
        Ok(())
    }
}

/// State plus one STM column.
struct ColumnRhs<'a, F>(&'a F);

impl<F: VectorField> Rhs for ColumnRhs<'_, F> {
    fn dim(&self) -> usize {
        2 * STATE_DIM
    }

    fn eval(&self, y: &[f64], out: &mut [f64]) -> Result<()> {
        let (f, a) = self.0.evaluate(&head(y))?;
        out[..STATE_DIM].copy_from_slice(&f);
        for i in 0..STATE_DIM {
            out[STATE_DIM + i] = (0..STATE_DIM).map(|k| a[(i, k)] * y[STATE_DIM + k]).sum();
        }
        Ok(())
    }
}

fn head(y: &[f64]) -> State {
    let mut state = [0.0; STATE_DIM];
    state.copy_from_slice(&y[..STATE_DIM]);
    state
}

fn stm_from_flat(y: &[f64]) -> Matrix6<f64> {
    Matrix6::from_row_slice(&y[STATE_DIM..AUGMENTED_DIM])
}

fn augmented_initial(x0: &State) -> Vec<f64> {
    let mut y = vec![0.0; AUGMENTED_DIM];
    y[..STATE_DIM].copy_from_slice(x0);
    for i in 0..STATE_DIM {
        y[STATE_DIM + i * STATE_DIM + i] = 1.0;
    }
    y
}

/// Raw samples of one integration in flat storage.
struct Run {
    times: Vec<f64>,
    ys: Vec<Vec<f64>>,
    event: Option<EventRecord>,
}

impl Run {
    fn trajectory(&self) -> Trajectory {
        Trajectory {
            times: self.times.clone(),
            states: self.ys.iter().map(|y| head(y)).collect(),
            event: self.event,
        }
    }
}

fn check_inputs(x0: &State, span: f64, settings: &PropagationSettings) -> Result<()> {
    settings.validate()?;
    if !span.is_finite() {
        return Err(Cr3bpError::invalid(format!("time span must be finite, got {span}")));
    }
    if x0.iter().any(|v| !v.is_finite()) {
        return Err(Cr3bpError::invalid(format!("initial state is not finite: {x0:?}")));
    }
    Ok(())
}

fn error_norm(y: &[f64], y_new: &[f64], err: &[f64], settings: &PropagationSettings) -> f64 {
    y.iter()
        .zip(y_new)
        .zip(err)
        .map(|((a, b), e)| e.abs() / (settings.abs_tol + settings.rel_tol * a.abs().max(b.abs())))
        .fold(0.0, f64::max)
}

/// Locates the zero of g on (0, h) from the accepted step start with the
/// Illinois variant of regula falsi.
fn locate_event<R: Rhs>(
    rhs: &R,
    stepper: &mut Rkf78,
    event: &dyn EventFunction,
    y: &[f64],
    h: f64,
    g_start: f64,
    g_end: f64,
    y_end: &[f64],
    tol: f64,
) -> Result<(f64, Vec<f64>, f64)> {
    let n = y.len();
    let mut scratch_err = vec![0.0; n];
    let (mut a, mut ga) = (0.0, g_start);
    let (mut b, mut gb) = (h, g_end);
    let mut best = (h, y_end.to_vec(), g_end);
    if g_end.abs() <= tol {
        return Ok(best);
    }
    let mut side = 0i8;
    for _ in 0..MAX_EVENT_ITERS {
        let s = (a * gb - b * ga) / (gb - ga);
        let mut y_s = vec![0.0; n];
        stepper.step(rhs, y, s, &mut y_s, &mut scratch_err)?;
        let gs = event.value(&head(&y_s));
        best = (s, y_s, gs);
        if gs.abs() <= tol || (b - a).abs() <= f64::EPSILON * h.abs() {
            break;
        }
        if gs * gb > 0.0 {
            b = s;
            gb = gs;
            if side == -1 {
                ga *= 0.5;
            }
            side = -1;
        } else {
            a = s;
            ga = gs;
            if side == 1 {
                gb *= 0.5;
            }
            side = 1;
        }
    }
    Ok(best)
}

fn integrate<R: Rhs>(
    rhs: &R,
    y0: Vec<f64>,
    span: f64,
    settings: &PropagationSettings,
    event: Option<&dyn EventFunction>,
) -> Result<Run> {
    let mut run = Run {
        times: vec![0.0],
        ys: vec![y0.clone()],
        event: None,
    };
    if span == 0.0 {
        return Ok(run);
    }

    let n = rhs.dim();
    let direction = span.signum();
    let uniform = match settings.sampling {
        Sampling::Uniform(samples) => Some(samples),
        Sampling::Steps => None,
    };
    let output_time = |k: usize| match uniform {
        Some(samples) if k + 1 < samples => span * k as f64 / (samples - 1) as f64,
        _ => span,
    };
    let mut next_output = 1usize;

    let mut stepper = Rkf78::new(n);
    let mut t = 0.0;
    let mut y = y0;
    let mut y_new = vec![0.0; n];
    let mut err = vec![0.0; n];
    let mut h = settings.initial_step.min(settings.max_step).min(span.abs());
    let mut g_prev = event.map(|e| e.value(&head(&y)));
    let mut attempts = 0usize;
    let mut rejected = 0usize;

    loop {
        if attempts >= settings.max_steps {
            return Err(diverged(DivergenceReason::StepBudgetExhausted, t, &y, &run, attempts));
        }
        attempts += 1;

        let target = output_time(next_output);
        let remaining = (target - t).abs();
        let hits_output = h >= remaining || remaining - h < settings.min_step;
        let step = if hits_output { remaining } else { h };
        if (step < settings.min_step && !hits_output) || t + direction * step == t {
            return Err(diverged(DivergenceReason::StepSizeUnderflow, t, &y, &run, attempts));
        }

        stepper.step(rhs, &y, direction * step, &mut y_new, &mut err)?;
        if y_new.iter().any(|v| !v.is_finite()) {
            return Err(diverged(DivergenceReason::NonFiniteState, t, &y, &run, attempts));
        }
        let norm = error_norm(&y, &y_new, &err, settings);

        if norm > 1.0 {
            rejected += 1;
            let factor = (SAFETY * norm.powf(-ERROR_EXPONENT)).clamp(MIN_FACTOR, 1.0);
            h = step * factor;
            continue;
        }

        let factor = if norm == 0.0 {
            MAX_FACTOR
        } else {
            (SAFETY * norm.powf(-ERROR_EXPONENT)).clamp(MIN_FACTOR, MAX_FACTOR)
        };

        if let (Some(event), Some(g_start)) = (event, g_prev) {
            let g_end = event.value(&head(&y_new));
            if event.direction().admits(g_start, g_end) {
                let (s, y_event, g_event) = locate_event(
                    rhs,
                    &mut stepper,
                    event,
                    &y,
                    direction * step,
                    g_start,
                    g_end,
                    &y_new,
                    settings.event_tol,
                )?;
                let t_event = t + s;
                let state = head(&y_event);
                run.times.push(t_event);
                run.ys.push(y_event);
                run.event = Some(EventRecord {
                    time: t_event,
                    state,
                    value: g_event,
                });
                trace!(t_event, attempts, rejected, "propagation stopped at event");
                return Ok(run);
            }
            g_prev = Some(g_end);
        }

        t = if hits_output { target } else { t + direction * step };
        std::mem::swap(&mut y, &mut y_new);
        let at_end = hits_output && next_output_is_last(uniform, next_output);
        if hits_output || uniform.is_none() {
            run.times.push(t);
            run.ys.push(y.clone());
        }
        if hits_output {
            next_output += 1;
        }
        if at_end {
            trace!(span, attempts, rejected, "propagation reached end of span");
            return Ok(run);
        }
        // Grow from the nominal step, not the one shortened to hit an output.
        h = (h.max(step) * factor).min(settings.max_step);
    }
}

fn diverged(reason: DivergenceReason, t: f64, y: &[f64], run: &Run, attempts: usize) -> Cr3bpError {
    Cr3bpError::PropagationDiverged {
        reason,
        time: t,
        steps: attempts,
        last_state: y.to_vec(),
        partial: Box::new(run.trajectory()),
    }
}

/// Integrates and reports a run that stalled next to a primary as a collision.
fn run_checked<R: Rhs>(
    mu: f64,
    rhs: &R,
    y0: Vec<f64>,
    span: f64,
    settings: &PropagationSettings,
    event: Option<&dyn EventFunction>,
) -> Result<Run> {
    integrate(rhs, y0, span, settings, event).map_err(|err| collision(mu, settings, err))
}

fn collision(mu: f64, settings: &PropagationSettings, err: Cr3bpError) -> Cr3bpError {
    let Cr3bpError::PropagationDiverged {
        reason: DivergenceReason::StepSizeUnderflow | DivergenceReason::NonFiniteState,
        last_state,
        ..
    } = &err
    else {
        return err;
    };
    if last_state.len() < 3 || last_state[..3].iter().any(|v| !v.is_finite()) {
        return err;
    }
    let position = [last_state[0], last_state[1], last_state[2]];
    let nearest = [(1usize, -mu), (2usize, 1.0 - mu)]
        .into_iter()
        .map(|(primary, x)| {
            let d = ((position[0] - x).powi(2) + position[1].powi(2) + position[2].powi(2)).sqrt();
            (primary, d)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1));
    match nearest {
        Some((primary, distance)) if distance <= settings.collision_radius => {
            Cr3bpError::Singularity {
                primary,
                position,
                distance,
                tolerance: settings.collision_radius,
            }
        }
        _ => err,
    }
}

fn next_output_is_last(uniform: Option<usize>, next_output: usize) -> bool {
    match uniform {
        Some(samples) => next_output + 1 >= samples,
        None => true,
    }
}

/// Propagates `x0` over `span` (negative for backward time), stopping early
/// at the first admissible crossing of `event` if one is given.
pub fn propagate<F: VectorField>(
    field: &F,
    x0: &State,
    span: f64,
    settings: &PropagationSettings,
    event: Option<&dyn EventFunction>,
) -> Result<Trajectory> {
    check_inputs(x0, span, settings)?;
    let run = run_checked(field.mu(), &StateRhs(field), x0.to_vec(), span, settings, event)?;
    Ok(run.trajectory())
}

/// Like [`propagate`] but also integrates the variational equations; the
/// STM starts as the identity at t = 0.
pub fn propagate_with_stm<F: VectorField>(
    field: &F,
    x0: &State,
    span: f64,
    settings: &PropagationSettings,
    event: Option<&dyn EventFunction>,
) -> Result<StmPropagation> {
    check_inputs(x0, span, settings)?;
    let run = run_checked(field.mu(), &StmRhs(field), augmented_initial(x0), span, settings, event)?;
    let stms = run.ys.iter().map(|y| stm_from_flat(y)).collect();
    Ok(StmPropagation {
        trajectory: run.trajectory(),
        stms,
    })
}

/// Final state and STM of a propagation.
///
/// With `parallel_columns` the six STM columns are integrated as independent
/// 12-dimensional systems on the rayon pool. If an event is given its time is
/// found first from the bare state and the columns then run over that fixed
/// span.
pub fn terminal_sensitivity<F: VectorField>(
    field: &F,
    x0: &State,
    span: f64,
    settings: &PropagationSettings,
    event: Option<&dyn EventFunction>,
    parallel_columns: bool,
) -> Result<TerminalSensitivity> {
    check_inputs(x0, span, settings)?;
    let settings = PropagationSettings {
        sampling: Sampling::Steps,
        ..settings.clone()
    };

    let (time, state, stm, event_record) = if parallel_columns {
        let (time, event_record) = match event {
            Some(event) => {
                let run = run_checked(field.mu(), &StateRhs(field), x0.to_vec(), span, &settings, Some(event))?;
                let record = run.event.ok_or_else(|| missing_event(span))?;
                (record.time, Some(record))
            }
            None => (span, None),
        };
        let columns = (0..STATE_DIM)
            .into_par_iter()
            .map(|j| {
                let mut y0 = vec![0.0; 2 * STATE_DIM];
                y0[..STATE_DIM].copy_from_slice(x0);
                y0[STATE_DIM + j] = 1.0;
                let run = run_checked(field.mu(), &ColumnRhs(field), y0, time, &settings, None)?;
                run.ys
                    .last()
                    .cloned()
                    .ok_or_else(|| Cr3bpError::invalid("column propagation produced no samples"))
            })
            .collect::<Result<Vec<_>>>()?;
        let stm = Matrix6::from_fn(|i, j| columns[j][STATE_DIM + i]);
        let state = match event_record {
            Some(record) => record.state,
            None => head(&columns[0]),
        };
        (time, state, stm, event_record)
    } else {
        let run = run_checked(field.mu(), &StmRhs(field), augmented_initial(x0), span, &settings, event)?;
        if event.is_some() && run.event.is_none() {
            return Err(missing_event(span));
        }
        let (time, y) = match (run.times.last(), run.ys.last()) {
            (Some(&t), Some(y)) => (t, y),
            _ => return Err(missing_event(span)),
        };
        (time, head(y), stm_from_flat(y), run.event)
    };

    Ok(TerminalSensitivity {
        time,
        state,
        derivative: field.derivative(&state)?,
        stm,
        event: event_record,
    })
}

fn missing_event(span: f64) -> Cr3bpError {
    Cr3bpError::EventNotFound { span }
}
