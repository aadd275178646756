//! Error types for the benchmark harness.

use sf_sim::IntegratorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Unknown problem: {name}")]
    UnknownProblem { name: String },

    #[error("Integration failed: {0}")]
    Integrator(#[from] IntegratorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type BenchResult<T> = Result<T, BenchError>;
