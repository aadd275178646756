//! Failure signal returned by user-supplied callbacks.

use thiserror::Error;

pub type EvalResult<T> = Result<T, EvalError>;

/// Outcome of a failed right-hand-side, residual, Jacobian or root evaluation.
///
/// `Recoverable` asks the integrator to retry with a smaller step;
/// `Fatal` stops integration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("Recoverable evaluation failure: {what}")]
    Recoverable { what: String },

    #[error("Unrecoverable evaluation failure: {what}")]
    Fatal { what: String },
}

impl EvalError {
    pub fn recoverable(what: impl Into<String>) -> Self {
        EvalError::Recoverable { what: what.into() }
    }

    pub fn fatal(what: impl Into<String>) -> Self {
        EvalError::Fatal { what: what.into() }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, EvalError::Recoverable { .. })
    }
}
