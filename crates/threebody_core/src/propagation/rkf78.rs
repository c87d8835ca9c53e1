//! Runge-Kutta-Fehlberg 7(8) stepper.
//!
//! Thirteen stages; the eighth-order solution is propagated and the
//! embedded seventh-order solution only feeds the error estimate.

use crate::error::Result;

const STAGES: usize = 13;

// Stage abscissae. The fields integrated here are autonomous, so only the
// tableau consistency test reads them.
#[allow(dead_code)]
const C: [f64; STAGES] = [
    0.0,
    2.0 / 27.0,
    1.0 / 9.0,
    1.0 / 6.0,
    5.0 / 12.0,
    1.0 / 2.0,
    5.0 / 6.0,
    1.0 / 6.0,
    2.0 / 3.0,
    1.0 / 3.0,
    1.0,
    0.0,
    1.0,
];

// Lower-triangular coupling coefficients, row i uses stages 0..i.
const A: [&[f64]; STAGES] = [
    &[],
    &[2.0 / 27.0],
    &[1.0 / 36.0, 1.0 / 12.0],
    &[1.0 / 24.0, 0.0, 1.0 / 8.0],
    &[5.0 / 12.0, 0.0, -25.0 / 16.0, 25.0 / 16.0],
    &[1.0 / 20.0, 0.0, 0.0, 1.0 / 4.0, 1.0 / 5.0],
    &[-25.0 / 108.0, 0.0, 0.0, 125.0 / 108.0, -65.0 / 27.0, 125.0 / 54.0],
    &[31.0 / 300.0, 0.0, 0.0, 0.0, 61.0 / 225.0, -2.0 / 9.0, 13.0 / 900.0],
    &[2.0, 0.0, 0.0, -53.0 / 6.0, 704.0 / 45.0, -107.0 / 9.0, 67.0 / 90.0, 3.0],
    &[
        -91.0 / 108.0,
        0.0,
        0.0,
        23.0 / 108.0,
        -976.0 / 135.0,
        311.0 / 54.0,
        -19.0 / 60.0,
        17.0 / 6.0,
        -1.0 / 12.0,
    ],
    &[
        2383.0 / 4100.0,
        0.0,
        0.0,
        -341.0 / 164.0,
        4496.0 / 1025.0,
        -301.0 / 82.0,
        2133.0 / 4100.0,
        45.0 / 82.0,
        45.0 / 164.0,
        18.0 / 41.0,
    ],
    &[
        3.0 / 205.0,
        0.0,
        0.0,
        0.0,
        0.0,
        -6.0 / 41.0,
        -3.0 / 205.0,
        -3.0 / 41.0,
        3.0 / 41.0,
        6.0 / 41.0,
        0.0,
    ],
    &[
        -1777.0 / 4100.0,
        0.0,
        0.0,
        -341.0 / 164.0,
        4496.0 / 1025.0,
        -289.0 / 82.0,
        2193.0 / 4100.0,
        51.0 / 82.0,
        33.0 / 164.0,
        12.0 / 41.0,
        0.0,
        1.0,
    ],
];

const B8: [f64; STAGES] = [
    0.0,
    0.0,
    0.0,
    0.0,
    0.0,
    34.0 / 105.0,
    9.0 / 35.0,
    9.0 / 35.0,
    9.0 / 280.0,
    9.0 / 280.0,
    0.0,
    41.0 / 840.0,
    41.0 / 840.0,
];

/// Weight of (k0 + k10 - k11 - k12) in the seventh-minus-eighth order difference.
const ERR_WEIGHT: f64 = 41.0 / 840.0;

/// Autonomous right-hand side of a first-order system in flat storage.
pub(crate) trait Rhs {
    fn dim(&self) -> usize;
    fn eval(&self, y: &[f64], out: &mut [f64]) -> Result<()>;
}

pub(crate) struct Rkf78 {
    k: Vec<Vec<f64>>,
    tmp: Vec<f64>,
}

impl Rkf78 {
    pub fn new(dim: usize) -> Self {
        Self {
            k: vec![vec![0.0; dim]; STAGES],
            tmp: vec![0.0; dim],
        }
    }

    /// One step of size `h` from `y`. Writes the eighth-order solution to
    /// `y_out` and the local error estimate to `err_out`.
    pub fn step<R: Rhs>(
        &mut self,
        rhs: &R,
        y: &[f64],
        h: f64,
        y_out: &mut [f64],
        err_out: &mut [f64],
    ) -> Result<()> {
        let n = y.len();
        for stage in 0..STAGES {
            let row = A[stage];
            for i in 0..n {
                let mut acc = 0.0;
                for (j, &a) in row.iter().enumerate() {
                    if a != 0.0 {
                        acc += a * self.k[j][i];
                    }
                }
                self.tmp[i] = y[i] + h * acc;
            }
            rhs.eval(&self.tmp, &mut self.k[stage])?;
        }

        for i in 0..n {
            let mut acc = 0.0;
            for (stage, &b) in B8.iter().enumerate() {
                if b != 0.0 {
                    acc += b * self.k[stage][i];
                }
            }
            y_out[i] = y[i] + h * acc;
            err_out[i] =
                ERR_WEIGHT * h * (self.k[0][i] + self.k[10][i] - self.k[11][i] - self.k[12][i]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Decay;

    impl Rhs for Decay {
        fn dim(&self) -> usize {
            1
        }

        fn eval(&self, y: &[f64], out: &mut [f64]) -> Result<()> {
            out[0] = -y[0];
            Ok(())
        }
    }

    #[test]
    fn tableau_rows_are_consistent_with_abscissae() {
        for (row, &c) in A.iter().zip(C.iter()) {
            let sum: f64 = row.iter().sum();
            assert!((sum - c).abs() < 1e-13, "row sum {sum} vs c {c}");
        }
        let weights: f64 = B8.iter().sum();
        assert!((weights - 1.0).abs() < 1e-14);
    }

    #[test]
    fn single_step_error_shrinks_at_eighth_order() {
        let step_error = |h: f64| {
            let mut stepper = Rkf78::new(1);
            let mut y = [0.0];
            let mut err = [0.0];
            stepper.step(&Decay, &[1.0], h, &mut y, &mut err).expect("step");
            (y[0] - (-h).exp()).abs()
        };
        let coarse = step_error(0.5);
        let fine = step_error(0.25);
        assert!(coarse < 1e-9, "error {coarse}");
        // Local error is O(h^9): halving h divides it by about 512.
        let ratio = coarse / fine;
        assert!(ratio > 256.0 && ratio < 1024.0, "ratio {ratio}");
    }
}
