//! Integrator options.

use crate::controller::ControllerConfig;
use crate::error::{IntegratorError, SimResult};
use crate::estimator::ErrorAccumulation;
use crate::method::tableau::DirkTableau;
use serde::{Deserialize, Serialize};
use sf_core::ToleranceSpec;
use sf_solver::{LinearSolverKind, NonlinearSolverKind};

pub const MAX_BDF_ORDER: usize = 5;

/// Variable-order BDF settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BdfConfig {
    pub max_order: usize,
    /// Use the numerical differentiation formula variant.
    pub ndf: bool,
}

impl Default for BdfConfig {
    fn default() -> Self {
        Self {
            max_order: MAX_BDF_ORDER,
            ndf: false,
        }
    }
}

/// Initial guess for DIRK stage solves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predictor {
    /// Start every stage from the current solution.
    #[default]
    Trivial,
    /// Extrapolate the previous step's Hermite interpolant.
    Hermite,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirkConfig {
    pub tableau: DirkTableau,
    pub predictor: Predictor,
}

/// Step method selection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MethodKind {
    Bdf(BdfConfig),
    Dirk(DirkConfig),
}

impl Default for MethodKind {
    fn default() -> Self {
        MethodKind::Bdf(BdfConfig::default())
    }
}

/// Which crossings of a root function are reported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootDirection {
    #[default]
    Both,
    Rising,
    Falling,
}

impl RootDirection {
    pub fn sign(&self) -> f64 {
        match self {
            RootDirection::Both => 0.0,
            RootDirection::Rising => 1.0,
            RootDirection::Falling => -1.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorOptions {
    pub method: MethodKind,
    pub tolerances: ToleranceSpec,
    pub nonlinear: NonlinearSolverKind,
    pub controller: ControllerConfig,
    /// First step size; estimated when unset
    pub h_init: Option<f64>,
    /// Internal steps allowed per `advance` call
    pub max_steps: u64,
    /// Warnings issued for `t + h == t`
    pub max_hnil_warnings: u32,
    pub stop_time: Option<f64>,
    /// Per root function; empty means all directions
    pub root_directions: Vec<RootDirection>,
    pub error_accumulation: ErrorAccumulation,
    /// Largest residual accepted for implicit initial conditions
    pub initial_residual_tolerance: f64,
}

impl Default for IntegratorOptions {
    fn default() -> Self {
        Self {
            method: MethodKind::default(),
            tolerances: ToleranceSpec::default(),
            nonlinear: NonlinearSolverKind::default(),
            controller: ControllerConfig::default(),
            h_init: None,
            max_steps: 500,
            max_hnil_warnings: 10,
            stop_time: None,
            root_directions: Vec::new(),
            error_accumulation: ErrorAccumulation::None,
            initial_residual_tolerance: 1e-8,
        }
    }
}

impl IntegratorOptions {
    pub fn bdf() -> Self {
        Self::default()
    }

    pub fn dirk(tableau: DirkTableau) -> Self {
        Self {
            method: MethodKind::Dirk(DirkConfig {
                tableau,
                ..DirkConfig::default()
            }),
            ..Self::default()
        }
    }

    pub fn with_tolerances(mut self, rtol: f64, atol: f64) -> Self {
        self.tolerances = ToleranceSpec::scalar(rtol, atol);
        self
    }

    pub fn linear_solver(&self) -> Option<LinearSolverKind> {
        match &self.nonlinear {
            NonlinearSolverKind::Newton(c) => Some(c.linear),
            NonlinearSolverKind::FixedPoint(_) => None,
        }
    }

    /// Check the options against a problem's shape.
    pub fn validate(&self, dimension: usize, root_count: usize, implicit: bool) -> SimResult<()> {
        if dimension == 0 {
            return Err(IntegratorError::invalid("problem dimension must be positive"));
        }
        self.tolerances
            .validate(dimension)
            .map_err(|e| IntegratorError::invalid(e.to_string()))?;
        self.controller.validate()?;

        match &self.method {
            MethodKind::Bdf(c) => {
                if c.max_order == 0 || c.max_order > MAX_BDF_ORDER {
                    return Err(IntegratorError::invalid(format!(
                        "BDF max_order must lie in 1..={MAX_BDF_ORDER}"
                    )));
                }
            }
            MethodKind::Dirk(_) => {
                if implicit {
                    return Err(IntegratorError::invalid(
                        "DIRK methods support explicit problems only",
                    ));
                }
            }
        }

        match &self.nonlinear {
            NonlinearSolverKind::Newton(c) => {
                if c.max_iterations == 0 {
                    return Err(IntegratorError::invalid("Newton max_iterations must be positive"));
                }
                if let LinearSolverKind::Banded { upper, lower } = c.linear {
                    if upper >= dimension || lower >= dimension {
                        return Err(IntegratorError::invalid(format!(
                            "bandwidth ({upper}, {lower}) too wide for dimension {dimension}"
                        )));
                    }
                }
            }
            NonlinearSolverKind::FixedPoint(c) => {
                if implicit {
                    return Err(IntegratorError::invalid(
                        "fixed-point iteration requires an explicit problem",
                    ));
                }
                if c.max_iterations == 0 || !(c.damping > 0.0 && c.damping <= 1.0) {
                    return Err(IntegratorError::invalid(
                        "fixed-point iterations and damping must be positive",
                    ));
                }
            }
        }

        let conv = self.nonlinear.convergence();
        if !(conv.nlscoef > 0.0 && conv.crdown > 0.0 && conv.rdiv > 1.0) {
            return Err(IntegratorError::invalid("invalid convergence test settings"));
        }

        if let Some(h) = self.h_init {
            if !(h > 0.0 && h.is_finite()) {
                return Err(IntegratorError::invalid("h_init must be positive"));
            }
        }
        if self.max_steps == 0 {
            return Err(IntegratorError::invalid("max_steps must be positive"));
        }
        if !self.root_directions.is_empty() && self.root_directions.len() != root_count {
            return Err(IntegratorError::invalid(format!(
                "{} root directions given for {root_count} root functions",
                self.root_directions.len()
            )));
        }
        if !(self.initial_residual_tolerance > 0.0) {
            return Err(IntegratorError::invalid(
                "initial_residual_tolerance must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sf_solver::FixedPointConfig;

    #[test]
    fn defaults_validate() {
        assert!(IntegratorOptions::default().validate(3, 0, false).is_ok());
        assert!(IntegratorOptions::default().validate(3, 0, true).is_ok());
    }

    #[test]
    fn zero_rtol_is_rejected() {
        let opts = IntegratorOptions::default().with_tolerances(0.0, 1e-8);
        let err = opts.validate(2, 0, false).unwrap_err();
        assert!(matches!(err, IntegratorError::InvalidInput { .. }));
    }

    #[test]
    fn atol_length_must_match() {
        let opts = IntegratorOptions {
            tolerances: ToleranceSpec::vector(1e-6, vec![1e-8; 2]),
            ..IntegratorOptions::default()
        };
        assert!(opts.validate(3, 0, false).is_err());
    }

    #[test]
    fn implicit_problems_need_bdf_newton() {
        let dirk = IntegratorOptions::dirk(DirkTableau::Trbdf2);
        assert!(dirk.validate(2, 0, true).is_err());

        let fixed = IntegratorOptions {
            nonlinear: NonlinearSolverKind::FixedPoint(FixedPointConfig::default()),
            ..IntegratorOptions::default()
        };
        assert!(fixed.validate(2, 0, true).is_err());
        assert!(fixed.validate(2, 0, false).is_ok());
    }

    #[test]
    fn root_directions_must_match_count() {
        let opts = IntegratorOptions {
            root_directions: vec![RootDirection::Falling],
            ..IntegratorOptions::default()
        };
        assert!(opts.validate(1, 2, false).is_err());
        assert!(opts.validate(1, 1, false).is_ok());
    }

    #[test]
    fn yaml_with_partial_fields() {
        let yaml = r#"
method:
  kind: dirk
  tableau: trbdf2
tolerances:
  rtol: 1.0e-6
  atol: [1.0e-8, 1.0e-10]
nonlinear:
  kind: newton
  max_iterations: 4
  linear:
    banded:
      upper: 1
      lower: 1
controller:
  law:
    kind: pi
  growth: 10.0
max_steps: 2000
"#;
        let opts: IntegratorOptions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            opts.method,
            MethodKind::Dirk(DirkConfig {
                tableau: DirkTableau::Trbdf2,
                predictor: Predictor::Trivial,
            })
        );
        assert_eq!(opts.max_steps, 2000);
        assert_eq!(opts.controller.growth, 10.0);
        assert_eq!(opts.controller.safety, 0.96);
        assert_eq!(
            opts.linear_solver(),
            Some(LinearSolverKind::Banded { upper: 1, lower: 1 })
        );
        assert!(opts.validate(2, 0, false).is_ok());
    }
}
