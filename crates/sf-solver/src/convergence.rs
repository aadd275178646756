//! Convergence test shared by the Newton and fixed-point iterations.

use serde::{Deserialize, Serialize};

/// Tuning for the correction-based convergence test.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Safety coefficient on the nonlinear tolerance.
    pub nlscoef: f64,
    /// Decay applied to the carried rate estimate.
    pub crdown: f64,
    /// Growth of the correction norm treated as divergence.
    pub rdiv: f64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            nlscoef: 0.1,
            crdown: 0.3,
            rdiv: 2.3,
        }
    }
}

impl ConvergenceConfig {
    /// Tolerance on the weighted correction norm.
    pub fn tolerance(&self, error_scale: f64) -> f64 {
        self.nlscoef / error_scale
    }
}

/// Outcome of testing one correction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Converged,
    Continue,
    Diverged,
}

/// Snapshot of the most recent solve.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ConvergenceInfo {
    pub iterations: usize,
    pub rate: f64,
    pub last_correction_norm: f64,
}

/// State of one nonlinear solve attempt.
#[derive(Clone, Debug)]
pub struct ConvergenceTest {
    crdown: f64,
    rdiv: f64,
    tol: f64,
    rate: f64,
    del_prev: f64,
    iterations: usize,
    measured: bool,
}

impl ConvergenceTest {
    /// Start a test with the rate carried over from earlier solves.
    pub fn new(config: &ConvergenceConfig, tol: f64, rate: f64) -> Self {
        Self {
            crdown: config.crdown,
            rdiv: config.rdiv,
            tol,
            rate,
            del_prev: 0.0,
            iterations: 0,
            measured: false,
        }
    }

    /// Test the correction norm `del` produced by iteration `m` (0-based).
    pub fn check(&mut self, m: usize, del: f64) -> Verdict {
        self.iterations = m + 1;
        if !del.is_finite() {
            return Verdict::Diverged;
        }
        if m > 0 {
            self.rate = (self.crdown * self.rate).max(del / self.del_prev);
            self.measured = true;
        }

        let dcon = del * self.rate.min(1.0) / self.tol;
        if dcon <= 1.0 {
            self.del_prev = del;
            return Verdict::Converged;
        }
        if m >= 1 && del > self.rdiv * self.del_prev {
            self.del_prev = del;
            return Verdict::Diverged;
        }
        self.del_prev = del;
        Verdict::Continue
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Whether a contraction rate was observed (at least two iterations).
    pub fn measured(&self) -> bool {
        self.measured
    }

    pub fn info(&self) -> ConvergenceInfo {
        ConvergenceInfo {
            iterations: self.iterations,
            rate: self.rate,
            last_correction_norm: self.del_prev,
        }
    }
}
