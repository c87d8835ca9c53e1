use std::fmt::Debug;
use std::ops::Neg;

use num_traits::Num;

use crate::error::Result;

/// A trait for types that can be used as scalars in the equations of motion.
/// The CR3BP right-hand side only needs field arithmetic and a square root,
/// so both `f64` and the forward-mode `Dual` satisfy it.
pub trait Scalar: Num + Copy + Neg<Output = Self> + Debug + Send + Sync + 'static {
    fn from_f64(value: f64) -> Self;
    fn sqrt(self) -> Self;
    /// Real (primal) part, used for singularity checks and diagnostics.
    fn value(self) -> f64;
}

impl Scalar for f64 {
    fn from_f64(value: f64) -> Self {
        value
    }

    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }

    fn value(self) -> f64 {
        self
    }
}

/// An autonomous or time-dependent flow x' = f(t, x).
pub trait DynamicalSystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// t: current time
    /// x: current state
    /// out: buffer receiving dx/dt
    ///
    /// Evaluation can fail (e.g. at a singular point of the field).
    fn apply(&self, t: T, x: &[T], out: &mut [T]) -> Result<()>;
}
