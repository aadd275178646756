//! Tolerance specification and error-weight vectors.
//!
//! The error weight of component `i` is `1 / (rtol*|y_i| + atol_i)`. Every
//! norm used for accept/reject decisions is taken with these weights, so an
//! error norm of 1 means "exactly at tolerance" for any problem scaling.

use crate::error::{CoreError, CoreResult};
use crate::numeric::Real;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Absolute tolerance, shared by all components or given per component.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AbsoluteTolerance {
    Scalar(Real),
    Vector(Vec<Real>),
}

impl AbsoluteTolerance {
    pub fn at(&self, i: usize) -> Real {
        match self {
            AbsoluteTolerance::Scalar(a) => *a,
            AbsoluteTolerance::Vector(v) => v[i],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToleranceSpec {
    pub rtol: Real,
    pub atol: AbsoluteTolerance,
}

impl Default for ToleranceSpec {
    fn default() -> Self {
        Self {
            rtol: 1e-4,
            atol: AbsoluteTolerance::Scalar(1e-8),
        }
    }
}

impl ToleranceSpec {
    pub fn scalar(rtol: Real, atol: Real) -> Self {
        Self {
            rtol,
            atol: AbsoluteTolerance::Scalar(atol),
        }
    }

    pub fn vector(rtol: Real, atol: Vec<Real>) -> Self {
        Self {
            rtol,
            atol: AbsoluteTolerance::Vector(atol),
        }
    }

    /// Check that the tolerances can only ever produce finite, positive weights
    /// for a system of dimension `n`.
    pub fn validate(&self, n: usize) -> CoreResult<()> {
        if !(self.rtol.is_finite() && self.rtol > 0.0) {
            return Err(CoreError::InvalidArg {
                what: format!("rtol must be positive and finite, got {}", self.rtol),
            });
        }
        match &self.atol {
            AbsoluteTolerance::Scalar(a) => {
                if !(a.is_finite() && *a > 0.0) {
                    return Err(CoreError::InvalidArg {
                        what: format!("atol must be positive and finite, got {a}"),
                    });
                }
            }
            AbsoluteTolerance::Vector(v) => {
                if v.len() != n {
                    return Err(CoreError::DimensionMismatch {
                        what: "atol",
                        expected: n,
                        found: v.len(),
                    });
                }
                if let Some((i, a)) = v
                    .iter()
                    .enumerate()
                    .find(|(_, a)| !(a.is_finite() && **a > 0.0))
                {
                    return Err(CoreError::InvalidArg {
                        what: format!("atol[{i}] must be positive and finite, got {a}"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Fill `ewt` with the error weights for `y`.
    pub fn error_weights(&self, y: &DVector<Real>, ewt: &mut DVector<Real>) -> CoreResult<()> {
        if ewt.len() != y.len() {
            return Err(CoreError::DimensionMismatch {
                what: "error weights",
                expected: y.len(),
                found: ewt.len(),
            });
        }
        for (i, (w, yi)) in ewt.iter_mut().zip(y.iter()).enumerate() {
            let denom = self.rtol * yi.abs() + self.atol.at(i);
            if !denom.is_finite() || denom <= 0.0 {
                return Err(CoreError::NonFinite {
                    what: "error weight",
                    value: denom,
                });
            }
            *w = 1.0 / denom;
        }
        Ok(())
    }
}
