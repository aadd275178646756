//! Reference problems.
//!
//! Each [`ProblemId`] names a system together with its initial state, end
//! time, output schedule and the options it is usually run with. [`solve`]
//! drives any of them through an [`Integrator`] and samples a [`Trajectory`].

use crate::error::{BenchError, BenchResult};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use sf_core::{EvalResult, ToleranceSpec};
use sf_sim::{
    AdvanceStatus, DaeSystem, DirkTableau, Integrator, IntegratorOptions, IntegratorStats, Model,
    OdeSystem, RootCrossing, RootDirection, Task,
};
use sf_solver::{LinearSolverKind, NewtonConfig, NonlinearSolverKind};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

const GRAVITY: f64 = 9.81;

/// `y' = -rate·y`.
#[derive(Clone, Debug)]
pub struct Decay {
    pub rate: f64,
}

impl Default for Decay {
    fn default() -> Self {
        Self { rate: 100.0 }
    }
}

impl OdeSystem for Decay {
    fn dimension(&self) -> usize {
        1
    }

    fn rhs(&mut self, _t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) -> EvalResult<()> {
        ydot[0] = -self.rate * y[0];
        Ok(())
    }

    fn has_jacobian(&self) -> bool {
        true
    }

    fn jacobian(&mut self, _t: f64, _y: &DVector<f64>, jac: &mut DMatrix<f64>) -> EvalResult<()> {
        jac[(0, 0)] = -self.rate;
        Ok(())
    }
}

/// Robertson chemical kinetics, three species.
#[derive(Clone, Copy, Debug, Default)]
pub struct Robertson;

impl OdeSystem for Robertson {
    fn dimension(&self) -> usize {
        3
    }

    fn rhs(&mut self, _t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) -> EvalResult<()> {
        let slow = 0.04 * y[0];
        let mid = 1.0e4 * y[1] * y[2];
        let fast = 3.0e7 * y[1] * y[1];
        ydot[0] = -slow + mid;
        ydot[1] = slow - mid - fast;
        ydot[2] = fast;
        Ok(())
    }

    fn has_jacobian(&self) -> bool {
        true
    }

    fn jacobian(&mut self, _t: f64, y: &DVector<f64>, jac: &mut DMatrix<f64>) -> EvalResult<()> {
        jac.fill(0.0);
        jac[(0, 0)] = -0.04;
        jac[(0, 1)] = 1.0e4 * y[2];
        jac[(0, 2)] = 1.0e4 * y[1];
        jac[(1, 0)] = 0.04;
        jac[(1, 1)] = -1.0e4 * y[2] - 6.0e7 * y[1];
        jac[(1, 2)] = -1.0e4 * y[1];
        jac[(2, 1)] = 6.0e7 * y[1];
        Ok(())
    }
}

/// Robertson kinetics with the third species replaced by mass conservation.
#[derive(Clone, Copy, Debug, Default)]
pub struct RobertsonDae;

impl DaeSystem for RobertsonDae {
    fn dimension(&self) -> usize {
        3
    }

    fn residual(
        &mut self,
        _t: f64,
        y: &DVector<f64>,
        yp: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> EvalResult<()> {
        out[0] = yp[0] + 0.04 * y[0] - 1.0e4 * y[1] * y[2];
        out[1] = yp[1] - 0.04 * y[0] + 1.0e4 * y[1] * y[2] + 3.0e7 * y[1] * y[1];
        out[2] = y[0] + y[1] + y[2] - 1.0;
        Ok(())
    }

    fn has_jacobian(&self) -> bool {
        true
    }

    fn jacobian(
        &mut self,
        _t: f64,
        y: &DVector<f64>,
        _yp: &DVector<f64>,
        cj: f64,
        jac: &mut DMatrix<f64>,
    ) -> EvalResult<()> {
        jac[(0, 0)] = cj + 0.04;
        jac[(0, 1)] = -1.0e4 * y[2];
        jac[(0, 2)] = -1.0e4 * y[1];
        jac[(1, 0)] = -0.04;
        jac[(1, 1)] = cj + 1.0e4 * y[2] + 6.0e7 * y[1];
        jac[(1, 2)] = 1.0e4 * y[1];
        jac[(2, 0)] = 1.0;
        jac[(2, 1)] = 1.0;
        jac[(2, 2)] = 1.0;
        Ok(())
    }
}

/// Van der Pol oscillator in first-order form.
#[derive(Clone, Debug)]
pub struct VanDerPol {
    pub mu: f64,
}

impl Default for VanDerPol {
    fn default() -> Self {
        Self { mu: 10.0 }
    }
}

impl OdeSystem for VanDerPol {
    fn dimension(&self) -> usize {
        2
    }

    fn rhs(&mut self, _t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) -> EvalResult<()> {
        ydot[0] = y[1];
        ydot[1] = self.mu * ((1.0 - y[0] * y[0]) * y[1] - y[0]);
        Ok(())
    }

    fn has_jacobian(&self) -> bool {
        true
    }

    fn jacobian(&mut self, _t: f64, y: &DVector<f64>, jac: &mut DMatrix<f64>) -> EvalResult<()> {
        jac[(0, 0)] = 0.0;
        jac[(0, 1)] = 1.0;
        jac[(1, 0)] = self.mu * (-2.0 * y[0] * y[1] - 1.0);
        jac[(1, 1)] = self.mu * (1.0 - y[0] * y[0]);
        Ok(())
    }
}

/// Two-species Brusselator with `A = a`, `B = b`.
#[derive(Clone, Debug)]
pub struct Brusselator {
    pub a: f64,
    pub b: f64,
}

impl Default for Brusselator {
    fn default() -> Self {
        Self { a: 1.0, b: 3.0 }
    }
}

impl OdeSystem for Brusselator {
    fn dimension(&self) -> usize {
        2
    }

    fn rhs(&mut self, _t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) -> EvalResult<()> {
        let (u, v) = (y[0], y[1]);
        ydot[0] = self.a + u * u * v - (self.b + 1.0) * u;
        ydot[1] = self.b * u - u * u * v;
        Ok(())
    }
}

/// Method-of-lines heat equation on `(0, 1)` with zero boundary values.
///
/// No analytic Jacobian, so banded Newton goes through column-grouped
/// difference quotients.
#[derive(Clone, Debug)]
pub struct Heat1d {
    pub points: usize,
}

impl Default for Heat1d {
    fn default() -> Self {
        Self { points: 20 }
    }
}

impl Heat1d {
    pub fn spacing(&self) -> f64 {
        1.0 / (self.points as f64 + 1.0)
    }

    /// Decay rate of the `sin(πx)` mode of the discrete operator.
    pub fn mode_rate(&self) -> f64 {
        let dx = self.spacing();
        let s = (PI * dx / 2.0).sin();
        4.0 * s * s / (dx * dx)
    }

    pub fn mode(&self) -> DVector<f64> {
        let dx = self.spacing();
        DVector::from_fn(self.points, |i, _| (PI * (i as f64 + 1.0) * dx).sin())
    }
}

impl OdeSystem for Heat1d {
    fn dimension(&self) -> usize {
        self.points
    }

    fn rhs(&mut self, _t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) -> EvalResult<()> {
        let n = self.points;
        let inv_dx2 = 1.0 / (self.spacing() * self.spacing());
        for i in 0..n {
            let left = if i > 0 { y[i - 1] } else { 0.0 };
            let right = if i + 1 < n { y[i + 1] } else { 0.0 };
            ydot[i] = (left - 2.0 * y[i] + right) * inv_dx2;
        }
        Ok(())
    }
}

/// Body dropped from `height`; the root function is the height.
#[derive(Clone, Debug)]
pub struct FallingBody {
    pub height: f64,
}

impl Default for FallingBody {
    fn default() -> Self {
        Self { height: 10.0 }
    }
}

impl OdeSystem for FallingBody {
    fn dimension(&self) -> usize {
        2
    }

    fn rhs(&mut self, _t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) -> EvalResult<()> {
        ydot[0] = y[1];
        ydot[1] = -GRAVITY;
        Ok(())
    }

    fn has_jacobian(&self) -> bool {
        true
    }

    fn jacobian(&mut self, _t: f64, _y: &DVector<f64>, jac: &mut DMatrix<f64>) -> EvalResult<()> {
        jac.fill(0.0);
        jac[(0, 1)] = 1.0;
        Ok(())
    }

    fn root_count(&self) -> usize {
        1
    }

    fn roots(&mut self, _t: f64, y: &DVector<f64>, out: &mut [f64]) -> EvalResult<()> {
        out[0] = y[0];
        Ok(())
    }
}

/// Catalog of built-in problems.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProblemId {
    Decay,
    Robertson,
    RobertsonDae,
    VanDerPol,
    Brusselator,
    Heat,
    FallingBody,
}

impl ProblemId {
    pub const ALL: [ProblemId; 7] = [
        ProblemId::Decay,
        ProblemId::Robertson,
        ProblemId::RobertsonDae,
        ProblemId::VanDerPol,
        ProblemId::Brusselator,
        ProblemId::Heat,
        ProblemId::FallingBody,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ProblemId::Decay => "decay",
            ProblemId::Robertson => "robertson",
            ProblemId::RobertsonDae => "robertson-dae",
            ProblemId::VanDerPol => "van-der-pol",
            ProblemId::Brusselator => "brusselator",
            ProblemId::Heat => "heat",
            ProblemId::FallingBody => "falling-body",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ProblemId::Decay => "stiff scalar decay y' = -100 y",
            ProblemId::Robertson => "Robertson kinetics, stiff 3-species ODE",
            ProblemId::RobertsonDae => "Robertson kinetics as an index-1 DAE",
            ProblemId::VanDerPol => "Van der Pol oscillator, mu = 10",
            ProblemId::Brusselator => "Brusselator limit cycle, A = 1, B = 3",
            ProblemId::Heat => "1-D heat equation, 20 points, banded Jacobian",
            ProblemId::FallingBody => "falling body with a ground-contact root",
        }
    }

    pub fn dimension(&self) -> usize {
        match self {
            ProblemId::Decay => 1,
            ProblemId::Robertson | ProblemId::RobertsonDae => 3,
            ProblemId::VanDerPol | ProblemId::Brusselator | ProblemId::FallingBody => 2,
            ProblemId::Heat => Heat1d::default().points,
        }
    }

    pub fn is_implicit(&self) -> bool {
        matches!(self, ProblemId::RobertsonDae)
    }

    pub fn t_end(&self) -> f64 {
        match self {
            ProblemId::Decay => 1.0,
            ProblemId::Robertson | ProblemId::RobertsonDae => 40.0,
            ProblemId::VanDerPol | ProblemId::Brusselator => 20.0,
            ProblemId::Heat => 0.1,
            ProblemId::FallingBody => 2.0,
        }
    }

    pub fn initial_state(&self) -> DVector<f64> {
        match self {
            ProblemId::Decay => DVector::from_element(1, 1.0),
            ProblemId::Robertson | ProblemId::RobertsonDae => {
                DVector::from_vec(vec![1.0, 0.0, 0.0])
            }
            ProblemId::VanDerPol => DVector::from_vec(vec![2.0, 0.0]),
            ProblemId::Brusselator => DVector::from_vec(vec![1.5, 3.0]),
            ProblemId::Heat => Heat1d::default().mode(),
            ProblemId::FallingBody => DVector::from_vec(vec![FallingBody::default().height, 0.0]),
        }
    }

    /// Output times, ending exactly at [`ProblemId::t_end`].
    pub fn output_times(&self) -> Vec<f64> {
        match self {
            ProblemId::Robertson | ProblemId::RobertsonDae => vec![0.4, 4.0, 40.0],
            _ => {
                let count = 10;
                let t_end = self.t_end();
                (1..=count)
                    .map(|k| t_end * k as f64 / count as f64)
                    .collect()
            }
        }
    }

    /// Known solution at [`ProblemId::t_end`], where one exists.
    pub fn reference(&self) -> Option<Vec<f64>> {
        match self {
            ProblemId::Decay => Some(vec![(-Decay::default().rate * self.t_end()).exp()]),
            ProblemId::Robertson | ProblemId::RobertsonDae => {
                Some(vec![7.158271e-1, 9.185535e-6, 2.841638e-1])
            }
            ProblemId::Heat => {
                let heat = Heat1d::default();
                let scale = (-heat.mode_rate() * self.t_end()).exp();
                Some(heat.mode().iter().map(|v| v * scale).collect())
            }
            ProblemId::FallingBody => {
                let t = self.t_end();
                let h0 = FallingBody::default().height;
                Some(vec![h0 - 0.5 * GRAVITY * t * t, -GRAVITY * t])
            }
            ProblemId::VanDerPol | ProblemId::Brusselator => None,
        }
    }

    /// Options the problem is usually run with.
    pub fn default_options(&self) -> IntegratorOptions {
        match self {
            ProblemId::Decay => IntegratorOptions::bdf().with_tolerances(1e-6, 1e-10),
            ProblemId::Robertson => IntegratorOptions {
                tolerances: ToleranceSpec::vector(1e-4, vec![1e-8, 1e-14, 1e-6]),
                ..IntegratorOptions::bdf()
            },
            ProblemId::RobertsonDae => IntegratorOptions {
                tolerances: ToleranceSpec::vector(1e-4, vec![1e-8, 1e-12, 1e-6]),
                ..IntegratorOptions::bdf()
            },
            ProblemId::VanDerPol => IntegratorOptions::bdf().with_tolerances(1e-6, 1e-8),
            ProblemId::Brusselator => {
                IntegratorOptions::dirk(DirkTableau::Ark324).with_tolerances(1e-6, 1e-8)
            }
            ProblemId::Heat => IntegratorOptions {
                nonlinear: NonlinearSolverKind::Newton(NewtonConfig {
                    linear: LinearSolverKind::Banded { upper: 1, lower: 1 },
                    ..NewtonConfig::default()
                }),
                ..IntegratorOptions::bdf().with_tolerances(1e-6, 1e-9)
            },
            ProblemId::FallingBody => IntegratorOptions {
                root_directions: vec![RootDirection::Falling],
                ..IntegratorOptions::bdf().with_tolerances(1e-8, 1e-10)
            },
        }
    }
}

impl fmt::Display for ProblemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProblemId {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProblemId::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| BenchError::UnknownProblem {
                name: s.to_string(),
            })
    }
}

/// A root crossing as seen at an output.
#[derive(Clone, Debug, Serialize)]
pub struct RootEvent {
    pub t: f64,
    pub crossings: Vec<RootCrossing>,
    pub state: Vec<f64>,
}

/// Sampled solution of one run.
#[derive(Clone, Debug, Serialize)]
pub struct Trajectory {
    pub problem: ProblemId,
    /// Output times, starting with the initial time
    pub times: Vec<f64>,
    pub states: Vec<Vec<f64>>,
    pub events: Vec<RootEvent>,
    pub stats: IntegratorStats,
}

impl Trajectory {
    pub fn final_state(&self) -> Option<&[f64]> {
        self.states.last().map(Vec::as_slice)
    }

    /// Largest absolute deviation of the final state from `reference`.
    pub fn final_error(&self, reference: &[f64]) -> Option<f64> {
        let last = self.final_state()?;
        if last.len() != reference.len() {
            return None;
        }
        Some(
            last.iter()
                .zip(reference)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max),
        )
    }
}

/// Integrate `problem` from `t = 0`, recording the solution at each of
/// `outputs` and at every root or stop-time return.
pub fn solve(
    problem: ProblemId,
    options: IntegratorOptions,
    outputs: &[f64],
) -> BenchResult<Trajectory> {
    let y0 = problem.initial_state();
    match problem {
        ProblemId::Decay => sample(
            problem,
            Integrator::new(Decay::default(), 0.0, &y0, options)?,
            outputs,
        ),
        ProblemId::Robertson => sample(
            problem,
            Integrator::new(Robertson, 0.0, &y0, options)?,
            outputs,
        ),
        ProblemId::RobertsonDae => {
            let yp0 = DVector::from_vec(vec![-0.04, 0.04, 0.0]);
            sample(
                problem,
                Integrator::new_implicit(RobertsonDae, 0.0, &y0, &yp0, options)?,
                outputs,
            )
        }
        ProblemId::VanDerPol => sample(
            problem,
            Integrator::new(VanDerPol::default(), 0.0, &y0, options)?,
            outputs,
        ),
        ProblemId::Brusselator => sample(
            problem,
            Integrator::new(Brusselator::default(), 0.0, &y0, options)?,
            outputs,
        ),
        ProblemId::Heat => sample(
            problem,
            Integrator::new(Heat1d::default(), 0.0, &y0, options)?,
            outputs,
        ),
        ProblemId::FallingBody => sample(
            problem,
            Integrator::new(FallingBody::default(), 0.0, &y0, options)?,
            outputs,
        ),
    }
}

fn sample<M: Model>(
    problem: ProblemId,
    mut integrator: Integrator<M>,
    outputs: &[f64],
) -> BenchResult<Trajectory> {
    let mut y = DVector::zeros(integrator.model().dimension());
    let mut trajectory = Trajectory {
        problem,
        times: vec![integrator.t()],
        states: vec![integrator.solution().iter().copied().collect()],
        events: Vec::new(),
        stats: IntegratorStats::default(),
    };

    for &tout in outputs {
        loop {
            let advance = integrator.advance(tout, Task::Normal, &mut y)?;
            match advance.status {
                AdvanceStatus::Root(crossings) => {
                    tracing::debug!(t = advance.t, count = crossings.len(), "root found");
                    trajectory.events.push(RootEvent {
                        t: advance.t,
                        crossings,
                        state: y.iter().copied().collect(),
                    });
                }
                AdvanceStatus::StopTime => {
                    trajectory.times.push(advance.t);
                    trajectory.states.push(y.iter().copied().collect());
                }
                AdvanceStatus::Reached => break,
            }
        }
        trajectory.times.push(tout);
        trajectory.states.push(y.iter().copied().collect());
    }

    trajectory.stats = integrator.stats();
    Ok(trajectory)
}
