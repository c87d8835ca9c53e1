pub mod autodiff;
pub mod config;
pub mod continuation;
pub mod correction;
pub mod dynamics;
pub mod error;
pub mod libration;
pub mod manifold;
pub mod propagation;
pub mod stability;
/// The `threebody_core` crate computes periodic orbits of the circular restricted
/// three-body problem, continues them into families, and derives their Floquet
/// stability and invariant manifolds.
///
/// Key components:
/// - **Dynamics**: `VectorField` and the closed-form `Cr3bpField`, written once over `Scalar` so the
///   Jacobian can be cross-checked with dual numbers.
/// - **Propagation**: RKF7(8) integration of the state and its state-transition matrix, with events.
/// - **Correction**: single-shooting Newton on a `Constraint`, with minimum-norm fallback steps.
/// - **Continuation**: natural-parameter and pseudo-arclength families.
/// - **Stability / Manifold**: monodromy eigen-analysis and manifold branches seeded from it.
pub mod traits;
pub mod types;

pub use config::SolverConfig;
pub use continuation::{continue_family, ContinuationParameter, ContinuationSettings};
pub use correction::{
    correct, Constraint, CorrectorSettings, FreeVariable, FullPeriodicity, SymmetricCrossing,
};
pub use dynamics::{Cr3bpField, MassParameter, VectorField};
pub use error::{Cr3bpError, Result};
pub use libration::LibrationPoint;
pub use manifold::{generate_branch, ManifoldBranch, ManifoldSettings, ManifoldSide, ManifoldStability};
pub use propagation::{propagate, propagate_with_stm, PropagationSettings};
pub use stability::{stability_index, StabilityIndex, StabilitySettings};
pub use types::{Family, PeriodicOrbit, State, Trajectory};
