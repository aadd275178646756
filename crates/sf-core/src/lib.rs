//! sf-core: numeric foundation for stepflow.
//!
//! Contains:
//! - numeric (Real, unit roundoff, float helpers)
//! - vector (weighted norms and linear combinations on `DVector`)
//! - weights (tolerance specification and error-weight vectors)
//! - eval (recoverable/fatal failure signal for user callbacks)
//! - error (shared error types)

pub mod error;
pub mod eval;
pub mod numeric;
pub mod vector;
pub mod weights;

pub use error::{CoreError, CoreResult};
pub use eval::{EvalError, EvalResult};
pub use numeric::*;
pub use vector::VectorOps;
pub use weights::{AbsoluteTolerance, ToleranceSpec};
