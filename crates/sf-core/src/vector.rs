//! Vector operations used by the integrator core.
//!
//! All reductions run sequentially in index order so that identical inputs
//! give bit-identical results.

use crate::numeric::Real;
use nalgebra::DVector;

pub trait VectorOps {
    /// `self = a*x + b*y`
    fn linear_sum(&mut self, a: Real, x: &Self, b: Real, y: &Self);

    /// `self = c*x`
    fn scale_from(&mut self, c: Real, x: &Self);

    /// `sqrt(1/N * sum (self_i * w_i)^2)`
    fn wrms_norm(&self, weights: &Self) -> Real;

    /// `max |self_i|`
    fn max_norm(&self) -> Real;
}

impl VectorOps for DVector<Real> {
    fn linear_sum(&mut self, a: Real, x: &Self, b: Real, y: &Self) {
        debug_assert_eq!(self.len(), x.len());
        debug_assert_eq!(self.len(), y.len());
        for ((out, xi), yi) in self.iter_mut().zip(x.iter()).zip(y.iter()) {
            *out = a * xi + b * yi;
        }
    }

    fn scale_from(&mut self, c: Real, x: &Self) {
        debug_assert_eq!(self.len(), x.len());
        for (out, xi) in self.iter_mut().zip(x.iter()) {
            *out = c * xi;
        }
    }

    fn wrms_norm(&self, weights: &Self) -> Real {
        debug_assert_eq!(self.len(), weights.len());
        if self.is_empty() {
            return 0.0;
        }
        let mut sum = 0.0;
        for (vi, wi) in self.iter().zip(weights.iter()) {
            let prod = vi * wi;
            sum += prod * prod;
        }
        (sum / self.len() as Real).sqrt()
    }

    fn max_norm(&self) -> Real {
        self.iter().fold(0.0, |acc: Real, v| acc.max(v.abs()))
    }
}
