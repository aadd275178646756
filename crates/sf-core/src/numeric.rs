use crate::CoreError;
use nalgebra::DVector;

/// Floating point type used throughout the integrator
pub type Real = f64;

/// Unit roundoff of `Real`.
pub const UNIT_ROUNDOFF: Real = Real::EPSILON;

/// Fails on the first non-finite component.
pub fn ensure_finite_vector(v: &DVector<Real>, what: &'static str) -> Result<(), CoreError> {
    match v.iter().find(|x| !x.is_finite()) {
        Some(&value) => Err(CoreError::NonFinite { what, value }),
        None => Ok(()),
    }
}

/// Time roundoff used for "same instant" checks near `t` with step `h`.
pub fn time_roundoff(t: Real, h: Real) -> Real {
    100.0 * UNIT_ROUNDOFF * (t.abs() + h.abs())
}
