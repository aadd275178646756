//! Adaptive time integration for ODE and DAE initial-value problems.
//!
//! Provides:
//! - Variable-order BDF (optionally NDF) for explicit and implicit systems
//! - Embedded DIRK methods (SDIRK-2-1-2, TR-BDF2, ARK3(2)4L[2]SA) for explicit systems
//! - Söderlind step-size control with graduated failure handling
//! - Dense output, root finding and stop times
//! - Evaluation and solver statistics

pub mod controller;
pub mod error;
pub mod estimator;
pub mod integrator;
pub mod method;
pub mod model;
pub mod options;
pub mod stats;

// Internal modules
mod initial_step;
mod roots;
mod stage;

// Re-exports for public API
pub use controller::{
    ControlLaw, Controller, ControllerConfig, Gains, OrderBiases, OrderSelection, StepDecision,
    StepSample,
};
pub use error::{IntegratorError, SimResult};
pub use estimator::{ErrorAccumulation, ErrorEstimator};
pub use integrator::{Advance, AdvanceStatus, Integrator, Task};
pub use method::tableau::{DirkTableau, Tableau};
pub use model::{DaeSystem, EvalCounters, Explicit, Implicit, Model, OdeSystem};
pub use options::{
    BdfConfig, DirkConfig, IntegratorOptions, MAX_BDF_ORDER, MethodKind, Predictor, RootDirection,
};
pub use roots::RootCrossing;
pub use stats::IntegratorStats;
