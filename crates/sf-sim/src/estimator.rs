//! Local error norms and their optional accumulation.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use sf_core::VectorOps;

/// How accepted local errors are accumulated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAccumulation {
    #[default]
    None,
    Max,
    Sum,
}

#[derive(Clone, Debug, Default)]
pub struct ErrorEstimator {
    accumulation: ErrorAccumulation,
    accumulated: f64,
}

impl ErrorEstimator {
    pub fn new(accumulation: ErrorAccumulation) -> Self {
        Self {
            accumulation,
            accumulated: 0.0,
        }
    }

    /// Weighted RMS norm of a local error vector.
    pub fn norm(&self, error: &DVector<f64>, ewt: &DVector<f64>) -> f64 {
        error.wrms_norm(ewt)
    }

    /// Fold in the norm of an accepted step.
    pub fn record(&mut self, norm: f64) {
        match self.accumulation {
            ErrorAccumulation::None => {}
            ErrorAccumulation::Max => self.accumulated = self.accumulated.max(norm),
            ErrorAccumulation::Sum => self.accumulated += norm,
        }
    }

    pub fn accumulated(&self) -> Option<f64> {
        match self.accumulation {
            ErrorAccumulation::None => None,
            _ => Some(self.accumulated),
        }
    }

    pub fn reset(&mut self) {
        self.accumulated = 0.0;
    }
}
