//! Floquet analysis of periodic orbits.
//!
//! The monodromy matrix of a CR3BP periodic orbit is symplectic, so its
//! eigenvalues (Floquet multipliers) come in reciprocal pairs, and the flow
//! direction contributes a double multiplier at 1 that says nothing about
//! stability. The pair is located through eigenvector alignment with the
//! flow and kept apart from the classification.

use nalgebra::{DMatrix, Matrix6};
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dynamics::VectorField;
use crate::error::{Cr3bpError, Result};
use crate::propagation::{terminal_sensitivity, PropagationSettings};
use crate::types::{OrbitFingerprint, PeriodicOrbit, State, STATE_DIM};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilitySettings {
    /// Multipliers with ||lambda| - 1| below this are on the unit circle.
    pub unit_tolerance: f64,
    /// Multipliers closer than this to 1 are candidates for the trivial pair.
    pub trivial_tolerance: f64,
    /// Pairing defects |lambda mu - 1| above this are reported.
    pub reciprocal_tolerance: f64,
}

impl Default for StabilitySettings {
    fn default() -> Self {
        Self {
            unit_tolerance: 1e-5,
            trivial_tolerance: 1e-3,
            reciprocal_tolerance: 1e-4,
        }
    }
}

impl StabilitySettings {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("unit_tolerance", self.unit_tolerance),
            ("trivial_tolerance", self.trivial_tolerance),
            ("reciprocal_tolerance", self.reciprocal_tolerance),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(Cr3bpError::invalid(format!(
                    "stability {name} must be positive, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Multiplier with its unit-norm eigenvector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EigenPair {
    pub value: Complex<f64>,
    pub vector: Vec<Complex<f64>>,
}

impl EigenPair {
    pub fn modulus(&self) -> f64 {
        self.value.norm()
    }

    pub fn is_real(&self, tolerance: f64) -> bool {
        self.value.im.abs() <= tolerance
    }

    /// Real part of the eigenvector.
    pub fn real_vector(&self) -> State {
        let mut v = [0.0; STATE_DIM];
        for (out, c) in v.iter_mut().zip(&self.vector) {
            *out = c.re;
        }
        v
    }
}

/// Two multipliers matched as (lambda, 1/lambda).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReciprocalPair {
    pub first: Complex<f64>,
    pub second: Complex<f64>,
    /// |first * second - 1|.
    pub defect: f64,
    /// Stability index nu = (lambda + 1/lambda) / 2.
    pub index: Complex<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityIndex {
    /// Orbit the monodromy matrix belongs to, when computed from one.
    pub source: Option<OrbitFingerprint>,
    /// Row-major monodromy matrix.
    pub monodromy: [[f64; STATE_DIM]; STATE_DIM],
    pub eigenvalues: Vec<Complex<f64>>,
    pub stable: Vec<EigenPair>,
    pub unstable: Vec<EigenPair>,
    pub center: Vec<EigenPair>,
    /// Multipliers attributed to time-translation, excluded from the above.
    pub trivial: Vec<EigenPair>,
    /// Largest |<v, f>| between a trivial eigenvector and the unit flow direction.
    pub trivial_alignment: f64,
    pub pairs: Vec<ReciprocalPair>,
    /// Non-trivial multipliers left over after pairing.
    pub unpaired: Vec<Complex<f64>>,
    pub max_pairing_defect: f64,
    pub pairing_within_tolerance: bool,
}

impl StabilityIndex {
    pub fn is_linearly_stable(&self) -> bool {
        self.stable.is_empty() && self.unstable.is_empty()
    }

    pub fn monodromy_matrix(&self) -> Matrix6<f64> {
        Matrix6::from_fn(|i, j| self.monodromy[i][j])
    }

    /// Unstable multiplier of largest modulus.
    pub fn dominant_unstable(&self) -> Option<&EigenPair> {
        self.unstable
            .iter()
            .max_by(|a, b| a.modulus().total_cmp(&b.modulus()))
    }

    /// Stable multiplier of smallest modulus.
    pub fn dominant_stable(&self) -> Option<&EigenPair> {
        self.stable
            .iter()
            .min_by(|a, b| a.modulus().total_cmp(&b.modulus()))
    }
}

/// State-transition matrix over one period of `orbit`.
pub fn monodromy<F: VectorField>(
    field: &F,
    orbit: &PeriodicOrbit,
    propagation: &PropagationSettings,
) -> Result<Matrix6<f64>> {
    if !(orbit.period > 0.0) {
        return Err(Cr3bpError::invalid(format!(
            "orbit period must be positive, got {}",
            orbit.period
        )));
    }
    let sens = terminal_sensitivity(field, &orbit.state, orbit.period, propagation, None, false)?;
    Ok(sens.stm)
}

/// Propagates the monodromy matrix of `orbit` and classifies its multipliers.
pub fn stability_index<F: VectorField>(
    field: &F,
    orbit: &PeriodicOrbit,
    settings: &StabilitySettings,
    propagation: &PropagationSettings,
) -> Result<StabilityIndex> {
    let m = monodromy(field, orbit, propagation)?;
    let flow = field.derivative(&orbit.state)?;
    let mut index = analyze_monodromy(&m, &flow, settings)?;
    index.source = Some(OrbitFingerprint::of(orbit));
    Ok(index)
}

/// Eigen-analysis of a monodromy matrix; `flow` is the vector field at the
/// reference state and identifies the trivial multipliers.
pub fn analyze_monodromy(
    monodromy: &Matrix6<f64>,
    flow: &State,
    settings: &StabilitySettings,
) -> Result<StabilityIndex> {
    settings.validate()?;
    if monodromy.iter().any(|v| !v.is_finite()) {
        return Err(Cr3bpError::Linalg("monodromy matrix is not finite".into()));
    }
    let dense = DMatrix::from_fn(STATE_DIM, STATE_DIM, |i, j| monodromy[(i, j)]);
    let eigenvalues: Vec<Complex<f64>> = dense.clone().complex_eigenvalues().iter().copied().collect();
    let mut pairs: Vec<EigenPair> = eigenvalues
        .iter()
        .map(|&value| {
            Ok(EigenPair {
                value,
                vector: eigenvector(&dense, value)?,
            })
        })
        .collect::<Result<_>>()?;

    let flow_norm = flow.iter().map(|v| v * v).sum::<f64>().sqrt();
    let unit_flow: Vec<f64> = if flow_norm > 0.0 {
        flow.iter().map(|v| v / flow_norm).collect()
    } else {
        vec![0.0; STATE_DIM]
    };
    let alignment = |pair: &EigenPair| -> f64 {
        pair.vector
            .iter()
            .zip(&unit_flow)
            .map(|(v, &f)| v.conj() * f)
            .sum::<Complex<f64>>()
            .norm()
    };

    // Up to two multipliers nearest 1, preferring those aligned with the flow.
    let mut candidates: Vec<usize> = (0..pairs.len())
        .filter(|&i| (pairs[i].value - 1.0).norm() < settings.trivial_tolerance)
        .collect();
    candidates.sort_by(|&a, &b| {
        let score = |i: usize| (pairs[i].value - 1.0).norm() - alignment(&pairs[i]);
        score(a).total_cmp(&score(b))
    });
    candidates.truncate(2);
    candidates.sort_unstable_by(|a, b| b.cmp(a));
    let mut trivial = Vec::with_capacity(2);
    for i in candidates {
        trivial.push(pairs.remove(i));
    }
    let trivial_alignment = trivial.iter().map(alignment).fold(0.0, f64::max);
    if trivial.len() < 2 {
        warn!(found = trivial.len(), "monodromy matrix lacks the double unit multiplier");
    }

    let values: Vec<Complex<f64>> = pairs.iter().map(|p| p.value).collect();
    let (reciprocal, unpaired) = pair_reciprocals(&values);
    let max_pairing_defect = reciprocal.iter().map(|p| p.defect).fold(0.0, f64::max);
    let pairing_within_tolerance = max_pairing_defect <= settings.reciprocal_tolerance;
    if !pairing_within_tolerance {
        warn!(
            defect = max_pairing_defect,
            tolerance = settings.reciprocal_tolerance,
            "multipliers deviate from reciprocal pairing"
        );
    }

    let mut stable = Vec::new();
    let mut unstable = Vec::new();
    let mut center = Vec::new();
    for pair in pairs {
        let modulus = pair.modulus();
        if modulus < 1.0 - settings.unit_tolerance {
            stable.push(pair);
        } else if modulus > 1.0 + settings.unit_tolerance {
            unstable.push(pair);
        } else {
            center.push(pair);
        }
    }
    debug!(
        stable = stable.len(),
        unstable = unstable.len(),
        center = center.len(),
        trivial = trivial.len(),
        defect = max_pairing_defect,
        "classified monodromy multipliers"
    );

    let mut rows = [[0.0; STATE_DIM]; STATE_DIM];
    for (i, row) in rows.iter_mut().enumerate() {
        for (j, value) in row.iter_mut().enumerate() {
            *value = monodromy[(i, j)];
        }
    }

    Ok(StabilityIndex {
        source: None,
        monodromy: rows,
        eigenvalues,
        stable,
        unstable,
        center,
        trivial,
        trivial_alignment,
        pairs: reciprocal,
        unpaired,
        max_pairing_defect,
        pairing_within_tolerance,
    })
}

/// Greedy matching of each multiplier with the partner minimising |lambda mu - 1|.
fn pair_reciprocals(values: &[Complex<f64>]) -> (Vec<ReciprocalPair>, Vec<Complex<f64>>) {
    let mut remaining: Vec<Complex<f64>> = values.to_vec();
    // Largest moduli first so each saddle is matched with its own reciprocal.
    remaining.sort_by(|a, b| b.norm().total_cmp(&a.norm()));
    let mut pairs = Vec::new();
    while remaining.len() >= 2 {
        let first = remaining.remove(0);
        let (best, defect) = remaining
            .iter()
            .enumerate()
            .map(|(i, &other)| (i, (first * other - 1.0).norm()))
            .fold((0, f64::INFINITY), |acc, cur| if cur.1 < acc.1 { cur } else { acc });
        let second = remaining.remove(best);
        pairs.push(ReciprocalPair {
            first,
            second,
            defect,
            index: (first + second) * 0.5,
        });
    }
    (pairs, remaining)
}

/// Unit eigenvector for `value`: the right singular vector of M - value I
/// with the smallest singular value, phase-normalised so that its largest
/// component is real and positive.
fn eigenvector(matrix: &DMatrix<f64>, value: Complex<f64>) -> Result<Vec<Complex<f64>>> {
    let n = matrix.nrows();
    let shifted = DMatrix::from_fn(n, n, |i, j| {
        let entry = Complex::new(matrix[(i, j)], 0.0);
        if i == j {
            entry - value
        } else {
            entry
        }
    });
    let svd = shifted.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| Cr3bpError::Linalg("SVD did not produce right singular vectors".into()))?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |acc, (i, &s)| if s < acc.1 { (i, s) } else { acc });
    let mut vector: Vec<Complex<f64>> = v_t.row(min_idx).iter().map(|c| c.conj()).collect();

    let pivot = vector
        .iter()
        .copied()
        .max_by(|a, b| a.norm().total_cmp(&b.norm()))
        .unwrap_or(Complex::new(1.0, 0.0));
    let norm = vector.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt();
    if pivot.norm() == 0.0 || norm == 0.0 {
        return Err(Cr3bpError::Linalg(format!("zero eigenvector for multiplier {value}")));
    }
    let phase = pivot.conj() / pivot.norm();
    for c in vector.iter_mut() {
        *c = *c * phase / norm;
    }
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::{correct, CorrectorSettings, SymmetricCrossing};
    use crate::dynamics::{Cr3bpField, MassParameter};
    use crate::libration::{lyapunov_seed, LibrationPoint};

    fn synthetic_monodromy() -> Matrix6<f64> {
        let theta: f64 = 0.7;
        let mut m = Matrix6::zeros();
        m[(0, 0)] = 4.0;
        m[(1, 1)] = 0.25;
        m[(2, 2)] = theta.cos();
        m[(2, 3)] = -theta.sin();
        m[(3, 2)] = theta.sin();
        m[(3, 3)] = theta.cos();
        m[(4, 4)] = 1.0;
        m[(4, 5)] = 0.3;
        m[(5, 5)] = 1.0;
        m
    }

    #[test]
    fn classifies_saddle_centre_and_trivial_blocks() {
        let flow = [0.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let index = analyze_monodromy(&synthetic_monodromy(), &flow, &StabilitySettings::default())
            .expect("analysis");
        assert_eq!(index.trivial.len(), 2);
        assert!(index.trivial_alignment > 0.999);
        assert_eq!(index.unstable.len(), 1);
        assert_eq!(index.stable.len(), 1);
        assert_eq!(index.center.len(), 2);
        assert!((index.unstable[0].value.re - 4.0).abs() < 1e-12);
        assert!((index.stable[0].value.re - 0.25).abs() < 1e-12);
        assert!(index.pairing_within_tolerance);
        assert!(!index.is_linearly_stable());

        let saddle = index.pairs.iter().find(|p| p.first.re > 2.0).expect("saddle pair");
        assert!((saddle.second.re - 0.25).abs() < 1e-12);
        assert!((saddle.index.re - 2.125).abs() < 1e-12);

        // The unstable eigenvector is e0 up to sign.
        let v = index.unstable[0].real_vector();
        assert!((v[0].abs() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn reports_broken_reciprocity() {
        let mut m = synthetic_monodromy();
        m[(1, 1)] = 0.5;
        let flow = [0.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let index = analyze_monodromy(&m, &flow, &StabilitySettings::default()).expect("analysis");
        assert!(!index.pairing_within_tolerance);
        assert!((index.max_pairing_defect - 1.0).abs() < 1e-9);
    }

    #[test]
    fn lyapunov_orbit_is_a_saddle_with_paired_multipliers() {
        let mu = MassParameter::new(0.01215).expect("mu");
        let field = Cr3bpField::new(mu);
        let seed = lyapunov_seed(LibrationPoint::L1, mu, 0.005).expect("seed");
        let constraint = SymmetricCrossing::planar(seed.period).expect("constraint");
        let settings = CorrectorSettings::default();
        let orbit = correct(&field, &seed.state, seed.period, &constraint, &settings).expect("orbit");

        let index = stability_index(
            &field,
            &orbit,
            &StabilitySettings {
                reciprocal_tolerance: 1e-3,
                ..StabilitySettings::default()
            },
            &settings.propagation,
        )
        .expect("stability");
        assert_eq!(index.trivial.len(), 2);
        assert!(index.trivial_alignment > 0.99);
        assert_eq!(index.unstable.len(), 1);
        assert_eq!(index.stable.len(), 1);
        assert!(index.pairing_within_tolerance, "defect {}", index.max_pairing_defect);
        let lambda = index.dominant_unstable().expect("unstable").value;
        let inverse = index.dominant_stable().expect("stable").value;
        assert!(lambda.re > 100.0);
        assert!((lambda * inverse - 1.0).norm() < 1e-3);
        assert!(index.source.expect("fingerprint").matches(&orbit));
    }

    #[test]
    fn index_round_trips_through_json() {
        let flow = [0.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let index = analyze_monodromy(&synthetic_monodromy(), &flow, &StabilitySettings::default())
            .expect("analysis");
        let json = serde_json::to_string(&index).expect("serialize");
        let back: StabilityIndex = serde_json::from_str(&json).expect("deserialize");
        assert!((back.monodromy_matrix() - synthetic_monodromy()).abs().max() < 1e-15);
        assert_eq!(back.unstable.len(), 1);
    }
}
