//! Step-size and order controller.
//!
//! Accepted steps use a Söderlind-type law
//! `η = e1^(-k1/k) e2^(-k2/k) e3^(-k3/k) (h/h_p)^k4 (h_p/h_pp)^k5` with
//! `k = p + 1` and biased error norms `e_i`. Rejected steps use the I law with
//! a graduated cap. Variable-order methods may instead ask for an order
//! choice among `q - 1`, `q`, `q + 1`.

use crate::error::{IntegratorError, SimResult};
use serde::{Deserialize, Serialize};

/// Floor for biased error norms.
const TINY: f64 = 1e-10;

/// Söderlind gains.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Gains {
    pub k1: f64,
    #[serde(default)]
    pub k2: f64,
    #[serde(default)]
    pub k3: f64,
    #[serde(default)]
    pub k4: f64,
    #[serde(default)]
    pub k5: f64,
}

impl Gains {
    pub const I: Gains = Gains {
        k1: 1.0,
        k2: 0.0,
        k3: 0.0,
        k4: 0.0,
        k5: 0.0,
    };

    pub const PI: Gains = Gains {
        k1: 0.8,
        k2: -0.31,
        k3: 0.0,
        k4: 0.0,
        k5: 0.0,
    };

    fn needs_two_steps(&self) -> bool {
        self.k3 != 0.0 || self.k5 != 0.0
    }
}

/// Controller law presets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlLaw {
    I,
    Pi,
    #[default]
    Pid,
    /// Explicit Gustafsson.
    ExpGus,
    /// Implicit Gustafsson.
    ImpGus,
    Custom(Gains),
}

impl ControlLaw {
    pub fn gains(&self) -> Gains {
        match self {
            ControlLaw::I => Gains::I,
            ControlLaw::Pi => Gains::PI,
            ControlLaw::Pid => Gains {
                k1: 0.58,
                k2: -0.21,
                k3: 0.1,
                k4: 0.0,
                k5: 0.0,
            },
            ControlLaw::ExpGus => Gains {
                k1: 0.367 + 0.268,
                k2: -0.268,
                k3: 0.0,
                k4: 0.0,
                k5: 0.0,
            },
            ControlLaw::ImpGus => Gains {
                k1: 0.98 + 0.95,
                k2: -0.95,
                k3: 0.0,
                k4: 1.0,
                k5: 0.0,
            },
            ControlLaw::Custom(g) => *g,
        }
    }
}

/// Biases for choosing among neighbouring orders.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderBiases {
    pub lower: f64,
    pub same: f64,
    pub higher: f64,
    pub addon: f64,
}

impl Default for OrderBiases {
    fn default() -> Self {
        Self {
            lower: 6.0,
            same: 6.0,
            higher: 10.0,
            addon: 1e-6,
        }
    }
}

/// Step-size policy, including failure handling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub law: ControlLaw,
    pub safety: f64,
    /// Multiplier on the error norm before the law is applied
    pub bias: f64,
    /// Largest growth factor on ordinary steps
    pub growth: f64,
    /// Largest growth factor after the very first step
    pub first_step_growth: f64,
    /// Smallest factor applied on any step
    pub growth_lower_bound: f64,
    /// Cap on the factor after repeated error-test failures
    pub error_failure_growth: f64,
    /// Error-test failures in one step before the cap applies
    pub small_failure_count: u32,
    /// Factors in `[lower, upper)` leave the step size unchanged
    pub fixed_step_window: (f64, f64),
    pub convergence_failure_factor: f64,
    pub recoverable_damping: f64,
    pub max_error_failures: u32,
    pub max_convergence_failures: u32,
    pub max_recoverable_failures: u32,
    pub h_min: f64,
    pub h_max: Option<f64>,
    pub order_biases: OrderBiases,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            law: ControlLaw::default(),
            safety: 0.96,
            bias: 1.5,
            growth: 20.0,
            first_step_growth: 10_000.0,
            growth_lower_bound: 0.1,
            error_failure_growth: 0.3,
            small_failure_count: 2,
            fixed_step_window: (1.0, 1.5),
            convergence_failure_factor: 0.25,
            recoverable_damping: 0.5,
            max_error_failures: 7,
            max_convergence_failures: 10,
            max_recoverable_failures: 5,
            h_min: 0.0,
            h_max: None,
            order_biases: OrderBiases::default(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> SimResult<()> {
        let unit_open = |v: f64| v > 0.0 && v < 1.0;
        if !(self.safety > 0.0 && self.safety <= 1.0) {
            return Err(IntegratorError::invalid("safety must lie in (0, 1]"));
        }
        if !(self.bias > 0.0 && self.bias.is_finite()) {
            return Err(IntegratorError::invalid("bias must be positive"));
        }
        if !(self.growth > 1.0) || self.first_step_growth < 1.0 {
            return Err(IntegratorError::invalid("growth bounds must exceed 1"));
        }
        if !unit_open(self.growth_lower_bound) {
            return Err(IntegratorError::invalid(
                "growth_lower_bound must lie in (0, 1)",
            ));
        }
        if !(self.error_failure_growth > 0.0 && self.error_failure_growth <= 1.0) {
            return Err(IntegratorError::invalid(
                "error_failure_growth must lie in (0, 1]",
            ));
        }
        let (lo, hi) = self.fixed_step_window;
        if lo > hi || lo <= 0.0 {
            return Err(IntegratorError::invalid("fixed_step_window is empty"));
        }
        if !unit_open(self.convergence_failure_factor) || !unit_open(self.recoverable_damping) {
            return Err(IntegratorError::invalid(
                "failure shrink factors must lie in (0, 1)",
            ));
        }
        if self.max_error_failures == 0 || self.max_convergence_failures == 0 {
            return Err(IntegratorError::invalid("failure limits must be positive"));
        }
        if !(self.h_min >= 0.0 && self.h_min.is_finite()) {
            return Err(IntegratorError::invalid("h_min must be finite and >= 0"));
        }
        if let Some(h_max) = self.h_max {
            if !(h_max > self.h_min) {
                return Err(IntegratorError::invalid("h_max must exceed h_min"));
            }
        }
        Ok(())
    }
}

/// How the next order is chosen on acceptance.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum OrderSelection {
    /// Fixed-order method: apply the control law.
    #[default]
    Fixed,
    /// Keep both step size and order.
    Hold,
    /// Error norms the method would have at `q - 1` and `q + 1`.
    Candidates {
        lower: Option<f64>,
        upper: Option<f64>,
    },
}

/// What the controller is told about one attempt.
#[derive(Clone, Copy, Debug)]
pub struct StepSample {
    pub error_norm: f64,
    pub h: f64,
    /// Order `p` in the exponent `1/(p + 1)`.
    pub order: usize,
    /// Error-test failures already seen in this step.
    pub failures: u32,
    /// Any failed attempt in this step.
    pub retried: bool,
    pub first_step: bool,
    pub orders: OrderSelection,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepDecision {
    pub accept: bool,
    pub h_next: f64,
    pub order_next: usize,
    pub eta: f64,
}

#[derive(Clone, Debug)]
pub struct Controller {
    config: ControllerConfig,
    /// Biased error norms of the last two accepted steps.
    errors: [f64; 2],
    /// Sizes of the last two accepted steps.
    steps: [f64; 2],
    accepted: usize,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            errors: [1.0; 2],
            steps: [0.0; 2],
            accepted: 0,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Accepted steps remembered by the law.
    pub fn history_len(&self) -> usize {
        self.accepted
    }

    pub fn reset(&mut self) {
        self.errors = [1.0; 2];
        self.steps = [0.0; 2];
        self.accepted = 0;
    }

    pub fn update(&mut self, sample: &StepSample) -> StepDecision {
        let dsm = sample.error_norm;
        if dsm.is_finite() && dsm <= 1.0 {
            self.accept(sample)
        } else {
            self.reject(sample)
        }
    }

    /// Step size after a nonlinear convergence failure.
    pub fn after_convergence_failure(&self, h: f64) -> f64 {
        self.clamp(h * self.config.convergence_failure_factor)
    }

    /// Step size after a recoverable evaluation failure.
    pub fn after_recoverable_failure(&self, h: f64) -> f64 {
        self.clamp(h * self.config.recoverable_damping)
    }

    /// Apply `[h_min, h_max]`.
    pub fn clamp(&self, h: f64) -> f64 {
        let mut h = h;
        if let Some(h_max) = self.config.h_max {
            h = h.min(h_max);
        }
        h.max(self.config.h_min).max(f64::MIN_POSITIVE)
    }

    fn accept(&mut self, sample: &StepSample) -> StepDecision {
        let c = &self.config;
        let (raw, order_next) = match sample.orders {
            OrderSelection::Fixed => (c.safety * self.law(sample), sample.order),
            OrderSelection::Hold => (1.0, sample.order),
            OrderSelection::Candidates { lower, upper } => {
                self.select_order(sample.order, sample.error_norm, lower, upper)
            }
        };

        let cap = if sample.first_step {
            c.first_step_growth
        } else if sample.retried {
            1.0
        } else {
            c.growth
        };
        let mut eta = raw.min(cap).max(c.growth_lower_bound);
        let (lo, hi) = c.fixed_step_window;
        if eta >= lo && eta < hi {
            eta = 1.0;
        }

        self.errors[1] = self.errors[0];
        self.errors[0] = (c.bias * sample.error_norm).max(TINY);
        self.steps[1] = self.steps[0];
        self.steps[0] = sample.h;
        self.accepted += 1;
        if order_next != sample.order {
            self.reset();
        }

        let h_next = self.clamp(sample.h * eta);
        StepDecision {
            accept: true,
            h_next,
            order_next,
            eta: h_next / sample.h,
        }
    }

    fn reject(&mut self, sample: &StepSample) -> StepDecision {
        let c = &self.config;
        let failures = sample.failures + 1;
        let mut eta = if sample.error_norm.is_finite() {
            let k = sample.order as f64 + 1.0;
            c.safety * (c.bias * sample.error_norm).max(TINY).powf(-1.0 / k)
        } else {
            c.growth_lower_bound
        };
        eta = eta.max(c.growth_lower_bound).min(1.0);
        if failures >= c.small_failure_count {
            eta = eta.min(c.error_failure_growth);
        }

        let h_next = self.clamp(sample.h * eta);
        StepDecision {
            accept: false,
            h_next,
            order_next: sample.order,
            eta: h_next / sample.h,
        }
    }

    /// Raw factor from the control law, without safety or bounds.
    fn law(&self, sample: &StepSample) -> f64 {
        let k = sample.order as f64 + 1.0;
        let e1 = (self.config.bias * sample.error_norm).max(TINY);
        let configured = self.config.law.gains();
        let gains = match self.accepted {
            0 => Gains::I,
            1 if configured.needs_two_steps() => Gains::PI,
            _ => configured,
        };

        let mut eta = e1.powf(-gains.k1 / k);
        if gains.k2 != 0.0 {
            eta *= self.errors[0].powf(-gains.k2 / k);
        }
        if gains.k3 != 0.0 {
            eta *= self.errors[1].powf(-gains.k3 / k);
        }
        if gains.k4 != 0.0 && self.steps[0] > 0.0 {
            eta *= (sample.h / self.steps[0]).powf(gains.k4);
        }
        if gains.k5 != 0.0 && self.steps[1] > 0.0 {
            eta *= (self.steps[0] / self.steps[1]).powf(gains.k5);
        }
        eta
    }

    /// Pick among `q - 1`, `q`, `q + 1`; ties keep `q`.
    fn select_order(
        &self,
        q: usize,
        dsm: f64,
        lower: Option<f64>,
        upper: Option<f64>,
    ) -> (f64, usize) {
        let b = &self.config.order_biases;
        let factor = |bias: f64, err: f64, k: f64| 1.0 / ((bias * err).powf(1.0 / k) + b.addon);

        let eta_same = factor(b.same, dsm, q as f64 + 1.0);
        let eta_lower = match lower {
            Some(err) if q > 1 => factor(b.lower, err, q as f64),
            _ => 0.0,
        };
        let eta_upper = match upper {
            Some(err) => factor(b.higher, err, q as f64 + 2.0),
            None => 0.0,
        };

        let best = eta_same.max(eta_lower).max(eta_upper);
        if best < self.config.fixed_step_window.1 {
            return (1.0, q);
        }
        if best == eta_same {
            (eta_same, q)
        } else if best == eta_lower {
            (eta_lower, q - 1)
        } else {
            (eta_upper, q + 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(error_norm: f64, h: f64) -> StepSample {
        StepSample {
            error_norm,
            h,
            order: 1,
            failures: 0,
            retried: false,
            first_step: false,
            orders: OrderSelection::Fixed,
        }
    }

    #[test]
    fn graduated_shrink_after_repeated_failures() {
        let mut controller = Controller::new(ControllerConfig {
            growth_lower_bound: 0.5,
            ..ControllerConfig::default()
        });
        let mut h = 0.01;
        let mut etas = Vec::new();
        for (failures, dsm) in [10.0, 5.0, 1.5].into_iter().enumerate() {
            let d = controller.update(&StepSample {
                failures: failures as u32,
                retried: failures > 0,
                ..sample(dsm, h)
            });
            assert!(!d.accept);
            etas.push(d.eta);
            h = d.h_next;
        }
        assert!((etas[0] - 0.5).abs() < 1e-12);
        assert!((etas[1] - 0.3).abs() < 1e-12);
        assert!((etas[2] - 0.3).abs() < 1e-12);
        assert!((h - 4.5e-4).abs() < 1e-15);
    }

    #[test]
    fn non_finite_norm_rejects_with_minimum_factor() {
        let mut controller = Controller::new(ControllerConfig::default());
        let d = controller.update(&sample(f64::NAN, 1.0));
        assert!(!d.accept);
        assert!((d.eta - 0.1).abs() < 1e-12);
    }

    #[test]
    fn first_step_may_grow_beyond_growth_bound() {
        let mut controller = Controller::new(ControllerConfig::default());
        let d = controller.update(&StepSample {
            first_step: true,
            ..sample(1e-12, 1e-6)
        });
        assert!(d.accept);
        assert!(d.eta > 20.0);
        assert!(d.eta <= 10_000.0);
    }

    #[test]
    fn growth_capped_at_one_after_failure() {
        let mut controller = Controller::new(ControllerConfig::default());
        let d = controller.update(&StepSample {
            retried: true,
            ..sample(1e-6, 1.0)
        });
        assert!(d.accept);
        assert_eq!(d.eta, 1.0);
    }

    #[test]
    fn small_changes_keep_step_fixed() {
        let mut controller = Controller::new(ControllerConfig::default());
        // 0.96 / sqrt(1.5 * 0.3) = 1.43
        let d = controller.update(&sample(0.3, 0.5));
        assert!(d.accept);
        assert_eq!(d.h_next, 0.5);
        assert_eq!(controller.history_len(), 1);
    }

    #[test]
    fn h_max_bounds_growth() {
        let mut controller = Controller::new(ControllerConfig {
            h_max: Some(0.2),
            ..ControllerConfig::default()
        });
        let d = controller.update(&sample(1e-8, 0.1));
        assert_eq!(d.h_next, 0.2);
    }

    #[test]
    fn hold_keeps_step_and_order() {
        let mut controller = Controller::new(ControllerConfig::default());
        let d = controller.update(&StepSample {
            orders: OrderSelection::Hold,
            order: 3,
            ..sample(1e-6, 0.1)
        });
        assert_eq!((d.h_next, d.order_next), (0.1, 3));
    }

    #[test]
    fn order_raised_when_higher_order_error_is_small() {
        let mut controller = Controller::new(ControllerConfig::default());
        let d = controller.update(&StepSample {
            order: 2,
            orders: OrderSelection::Candidates {
                lower: Some(0.5),
                upper: Some(1e-8),
            },
            ..sample(0.1, 0.01)
        });
        assert!(d.accept);
        assert_eq!(d.order_next, 3);
        assert!(d.eta > 1.5);
        assert_eq!(controller.history_len(), 0);
    }

    #[test]
    fn order_lowered_when_lower_order_error_is_smaller() {
        let mut controller = Controller::new(ControllerConfig::default());
        let d = controller.update(&StepSample {
            order: 3,
            orders: OrderSelection::Candidates {
                lower: Some(1e-6),
                upper: Some(0.9),
            },
            ..sample(0.9, 0.01)
        });
        assert_eq!(d.order_next, 2);
    }

    #[test]
    fn marginal_candidates_keep_order_and_step() {
        let mut controller = Controller::new(ControllerConfig::default());
        let d = controller.update(&StepSample {
            order: 2,
            orders: OrderSelection::Candidates {
                lower: Some(0.9),
                upper: Some(0.9),
            },
            ..sample(0.9, 0.01)
        });
        assert_eq!((d.eta, d.order_next), (1.0, 2));
    }

    #[test]
    fn presets_translate_to_gains() {
        assert_eq!(ControlLaw::I.gains(), Gains::I);
        let pid = ControlLaw::Pid.gains();
        assert!(pid.needs_two_steps());
        let imp = ControlLaw::ImpGus.gains();
        assert!((imp.k1 - 1.93).abs() < 1e-12);
        assert_eq!(imp.k4, 1.0);
    }

    #[test]
    fn validation_rejects_bad_bounds() {
        let bad = ControllerConfig {
            growth_lower_bound: 1.5,
            ..ControllerConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = ControllerConfig {
            h_max: Some(0.0),
            ..ControllerConfig::default()
        };
        assert!(bad.validate().is_err());
        assert!(ControllerConfig::default().validate().is_ok());
    }
}
