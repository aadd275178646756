//! Error types for nonlinear and linear solver operations.

use sf_core::{CoreError, EvalError};
use thiserror::Error;

/// Errors that can occur inside a stage solve.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("Problem setup error: {what}")]
    ProblemSetup { what: String },

    #[error("Singular matrix: zero pivot in column {column}")]
    Singular { column: usize },

    #[error("Numeric error: {what}")]
    Numeric { what: String },

    #[error("Evaluation error: {0}")]
    Eval(#[from] EvalError),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl SolverError {
    /// Failures the integrator may retry with a smaller step.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SolverError::Singular { .. } => true,
            SolverError::Eval(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

pub type SolverResult<T> = Result<T, SolverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(SolverError::Singular { column: 0 }.is_recoverable());
        assert!(SolverError::from(EvalError::recoverable("domain")).is_recoverable());
        assert!(!SolverError::from(EvalError::fatal("nan")).is_recoverable());
        assert!(
            !SolverError::Numeric {
                what: "x".to_string()
            }
            .is_recoverable()
        );
    }
}
