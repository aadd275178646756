//! Reference problems and a benchmark harness for the StepFlow integrators.

pub mod error;
pub mod problems;

pub use error::{BenchError, BenchResult};
pub use problems::{ProblemId, RootEvent, Trajectory, solve};

use serde::{Deserialize, Serialize};
use sf_sim::{BdfConfig, DirkTableau, IntegratorOptions, IntegratorStats, MethodKind};
use sf_solver::{FixedPointConfig, NonlinearSolverKind};
use std::path::Path;
use std::time::Instant;

/// A benchmark scenario definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkScenario {
    /// Unique identifier for this benchmark.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    pub problem: ProblemId,
    pub options: IntegratorOptions,
    /// Notes about this benchmark.
    pub notes: Option<String>,
}

impl BenchmarkScenario {
    fn new(id: &str, name: &str, problem: ProblemId, options: IntegratorOptions) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            problem,
            options,
            notes: None,
        }
    }

    fn with_notes(mut self, notes: &str) -> Self {
        self.notes = Some(notes.to_string());
        self
    }
}

/// Counters and timing of a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub total_time_s: f64,
    pub steps: u64,
    pub step_attempts: u64,
    pub rhs_evals: u64,
    pub rhs_evals_jacobian: u64,
    pub jacobian_evals: u64,
    pub linear_setups: u64,
    pub nonlinear_iterations: u64,
    pub error_test_failures: u64,
    pub step_convergence_failures: u64,
    pub root_events: usize,
    /// Max-norm deviation from the known final state
    pub final_error: Option<f64>,
}

impl RunMetrics {
    fn from_run(total_time_s: f64, trajectory: &Trajectory) -> Self {
        let stats: &IntegratorStats = &trajectory.stats;
        let final_error = trajectory
            .problem
            .reference()
            .and_then(|r| trajectory.final_error(&r));
        Self {
            total_time_s,
            steps: stats.steps,
            step_attempts: stats.step_attempts,
            rhs_evals: stats.rhs_evals,
            rhs_evals_jacobian: stats.rhs_evals_jacobian,
            jacobian_evals: stats.jacobian_evals,
            linear_setups: stats.linear_setups,
            nonlinear_iterations: stats.nonlinear_iterations,
            error_test_failures: stats.error_test_failures,
            step_convergence_failures: stats.step_convergence_failures,
            root_events: trajectory.events.len(),
            final_error,
        }
    }

    /// Everything except wall-clock time.
    fn same_work(&self, other: &RunMetrics) -> bool {
        RunMetrics {
            total_time_s: 0.0,
            ..self.clone()
        } == RunMetrics {
            total_time_s: 0.0,
            ..other.clone()
        }
    }
}

/// Aggregated statistics for multiple runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub run_count: usize,
    pub total_time_median_s: f64,
    pub total_time_min_s: f64,
    pub total_time_max_s: f64,
    pub steps_median: u64,
    pub rhs_evals_median: u64,
    pub jacobian_evals_median: u64,
    pub error_test_failures_total: u64,
    pub step_convergence_failures_total: u64,
    pub final_error_max: Option<f64>,
    /// All runs did identical work.
    pub deterministic: bool,
}

/// Complete benchmark result for a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub scenario: BenchmarkScenario,
    pub runs: Vec<RunMetrics>,
    pub aggregate: AggregateMetrics,
}

/// Collection of benchmark results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkSuite {
    pub timestamp: String,
    pub results: Vec<BenchmarkResult>,
}

/// Run a single benchmark scenario N times.
pub fn run_scenario(scenario: &BenchmarkScenario, times: usize) -> BenchResult<BenchmarkResult> {
    let outputs = scenario.problem.output_times();
    let mut runs = Vec::with_capacity(times);

    for _ in 0..times {
        let start = Instant::now();
        let trajectory = solve(scenario.problem, scenario.options.clone(), &outputs)?;
        let elapsed = start.elapsed().as_secs_f64();
        runs.push(RunMetrics::from_run(elapsed, &trajectory));
    }

    let aggregate = compute_aggregates(&runs);
    tracing::debug!(
        id = %scenario.id,
        median_s = aggregate.total_time_median_s,
        steps = aggregate.steps_median,
        "scenario finished"
    );

    Ok(BenchmarkResult {
        scenario: scenario.clone(),
        runs,
        aggregate,
    })
}

fn median_u64(values: impl Iterator<Item = u64>) -> u64 {
    let mut v: Vec<u64> = values.collect();
    if v.is_empty() {
        return 0;
    }
    v.sort_unstable();
    v[v.len() / 2]
}

pub fn compute_aggregates(runs: &[RunMetrics]) -> AggregateMetrics {
    if runs.is_empty() {
        return AggregateMetrics {
            run_count: 0,
            total_time_median_s: 0.0,
            total_time_min_s: 0.0,
            total_time_max_s: 0.0,
            steps_median: 0,
            rhs_evals_median: 0,
            jacobian_evals_median: 0,
            error_test_failures_total: 0,
            step_convergence_failures_total: 0,
            final_error_max: None,
            deterministic: true,
        };
    }

    let mut total_times: Vec<f64> = runs.iter().map(|r| r.total_time_s).collect();
    total_times.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let final_error_max = runs
        .iter()
        .filter_map(|r| r.final_error)
        .reduce(f64::max);

    AggregateMetrics {
        run_count: runs.len(),
        total_time_median_s: total_times[total_times.len() / 2],
        total_time_min_s: total_times[0],
        total_time_max_s: total_times[total_times.len() - 1],
        steps_median: median_u64(runs.iter().map(|r| r.steps)),
        rhs_evals_median: median_u64(runs.iter().map(|r| r.rhs_evals)),
        jacobian_evals_median: median_u64(runs.iter().map(|r| r.jacobian_evals)),
        error_test_failures_total: runs.iter().map(|r| r.error_test_failures).sum(),
        step_convergence_failures_total: runs.iter().map(|r| r.step_convergence_failures).sum(),
        final_error_max,
        deterministic: runs.windows(2).all(|w| w[0].same_work(&w[1])),
    }
}

/// The standard benchmark set.
pub fn default_benchmarks() -> Vec<BenchmarkScenario> {
    let decay = ProblemId::Decay;
    let robertson = ProblemId::Robertson;
    let brusselator = ProblemId::Brusselator;

    let ndf = IntegratorOptions {
        method: MethodKind::Bdf(BdfConfig {
            ndf: true,
            ..BdfConfig::default()
        }),
        ..robertson.default_options()
    };
    let trbdf2 = IntegratorOptions {
        method: IntegratorOptions::dirk(DirkTableau::Trbdf2).method,
        ..decay.default_options()
    };
    let anderson = IntegratorOptions {
        nonlinear: NonlinearSolverKind::FixedPoint(FixedPointConfig {
            anderson_depth: 3,
            ..FixedPointConfig::default()
        }),
        ..brusselator.default_options()
    };

    vec![
        BenchmarkScenario::new("decay-bdf", "Stiff decay (BDF)", decay, decay.default_options()),
        BenchmarkScenario::new("decay-trbdf2", "Stiff decay (TR-BDF2)", decay, trbdf2),
        BenchmarkScenario::new(
            "robertson-bdf",
            "Robertson ODE (BDF)",
            robertson,
            robertson.default_options(),
        ),
        BenchmarkScenario::new("robertson-ndf", "Robertson ODE (NDF)", robertson, ndf),
        BenchmarkScenario::new(
            "robertson-dae",
            "Robertson DAE (BDF)",
            ProblemId::RobertsonDae,
            ProblemId::RobertsonDae.default_options(),
        ),
        BenchmarkScenario::new(
            "van-der-pol-bdf",
            "Van der Pol (BDF)",
            ProblemId::VanDerPol,
            ProblemId::VanDerPol.default_options(),
        ),
        BenchmarkScenario::new(
            "brusselator-ark324",
            "Brusselator (ARK3(2)4L[2]SA)",
            brusselator,
            brusselator.default_options(),
        ),
        BenchmarkScenario::new(
            "brusselator-anderson",
            "Brusselator (ARK324, Anderson fixed point)",
            brusselator,
            anderson,
        )
        .with_notes("nonstiff problem; no Jacobian is formed"),
        BenchmarkScenario::new(
            "heat-banded",
            "1-D heat (BDF, banded Newton)",
            ProblemId::Heat,
            ProblemId::Heat.default_options(),
        )
        .with_notes("column-grouped difference-quotient Jacobian"),
        BenchmarkScenario::new(
            "falling-body-roots",
            "Falling body (BDF, root finding)",
            ProblemId::FallingBody,
            ProblemId::FallingBody.default_options(),
        ),
    ]
}

/// Write `suite` as pretty-printed JSON, creating parent directories.
pub fn write_baseline(path: &Path, suite: &BenchmarkSuite) -> BenchResult<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(suite)?;
    std::fs::write(path, json)?;
    Ok(())
}
