use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use sf_bench::{ProblemId, Trajectory, solve};
use sf_core::ToleranceSpec;
use sf_sim::{BdfConfig, DirkTableau, IntegratorOptions, MethodKind};
use sf_solver::{FixedPointConfig, NonlinearSolverKind};
use std::error::Error;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn Error>>;

#[derive(Parser)]
#[command(name = "sf-cli")]
#[command(about = "StepFlow CLI - adaptive ODE/DAE integration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the built-in problems
    Problems,
    /// Print a run configuration template as YAML
    Template {
        /// Fill in the defaults of this problem
        #[arg(long)]
        problem: Option<ProblemId>,
    },
    /// Integrate a built-in problem
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Problem name (see `problems`)
    problem: ProblemId,
    /// Run configuration YAML; flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum)]
    method: Option<MethodArg>,
    #[arg(long)]
    rtol: Option<f64>,
    /// Scalar absolute tolerance
    #[arg(long)]
    atol: Option<f64>,
    /// Use fixed-point iteration with this Anderson depth instead of Newton
    #[arg(long)]
    anderson: Option<usize>,
    /// End time; defaults to the problem's
    #[arg(long)]
    t_end: Option<f64>,
    /// Number of equally spaced outputs
    #[arg(long)]
    outputs: Option<usize>,
    #[arg(long, value_enum, default_value_t = Format::Table)]
    format: Format,
    /// Write the solution here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Print integrator statistics
    #[arg(long)]
    stats: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum MethodArg {
    Bdf,
    Ndf,
    Sdirk212,
    Trbdf2,
    Ark324,
}

impl MethodArg {
    fn kind(self) -> MethodKind {
        match self {
            MethodArg::Bdf => MethodKind::Bdf(BdfConfig::default()),
            MethodArg::Ndf => MethodKind::Bdf(BdfConfig {
                ndf: true,
                ..BdfConfig::default()
            }),
            MethodArg::Sdirk212 => IntegratorOptions::dirk(DirkTableau::Sdirk212).method,
            MethodArg::Trbdf2 => IntegratorOptions::dirk(DirkTableau::Trbdf2).method,
            MethodArg::Ark324 => IntegratorOptions::dirk(DirkTableau::Ark324).method,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Table,
    Csv,
    Yaml,
}

/// Contents of a `--config` file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RunConfig {
    t_end: Option<f64>,
    outputs: Option<usize>,
    options: IntegratorOptions,
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Problems => cmd_problems(),
        Commands::Template { problem } => cmd_template(problem),
        Commands::Run(args) => cmd_run(&args),
    }
}

fn cmd_problems() -> CliResult<()> {
    println!("Built-in problems:");
    for problem in ProblemId::ALL {
        let kind = if problem.is_implicit() { "DAE" } else { "ODE" };
        println!(
            "  {:<14} {} n={:<3} t_end={:<6} {}",
            problem.name(),
            kind,
            problem.dimension(),
            problem.t_end(),
            problem.description()
        );
    }
    Ok(())
}

fn cmd_template(problem: Option<ProblemId>) -> CliResult<()> {
    let config = match problem {
        Some(p) => RunConfig {
            t_end: Some(p.t_end()),
            outputs: None,
            options: p.default_options(),
        },
        None => RunConfig::default(),
    };
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

fn load_config(path: &Path) -> CliResult<RunConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    Ok(serde_yaml::from_str(&text)?)
}

fn resolve(args: &RunArgs) -> CliResult<(IntegratorOptions, Vec<f64>)> {
    let problem = args.problem;
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => RunConfig {
            options: problem.default_options(),
            ..RunConfig::default()
        },
    };

    if let Some(method) = args.method {
        config.options.method = method.kind();
    }
    if args.rtol.is_some() || args.atol.is_some() {
        let current = &config.options.tolerances;
        let rtol = args.rtol.unwrap_or(current.rtol);
        config.options.tolerances = match args.atol {
            Some(atol) => ToleranceSpec::scalar(rtol, atol),
            None => ToleranceSpec {
                rtol,
                ..current.clone()
            },
        };
    }
    if let Some(depth) = args.anderson {
        config.options.nonlinear = NonlinearSolverKind::FixedPoint(FixedPointConfig {
            anderson_depth: depth,
            ..FixedPointConfig::default()
        });
    }
    if args.t_end.is_some() {
        config.t_end = args.t_end;
    }
    if args.outputs.is_some() {
        config.outputs = args.outputs;
    }

    let outputs = match (config.t_end, config.outputs) {
        (None, None) => problem.output_times(),
        (t_end, count) => {
            let t_end = t_end.unwrap_or_else(|| problem.t_end());
            let count = count.unwrap_or(10).max(1);
            (1..=count)
                .map(|k| t_end * k as f64 / count as f64)
                .collect()
        }
    };
    Ok((config.options, outputs))
}

fn cmd_run(args: &RunArgs) -> CliResult<()> {
    let (options, outputs) = resolve(args)?;
    tracing::info!(problem = %args.problem, outputs = outputs.len(), "starting run");

    let start = Instant::now();
    let trajectory = solve(args.problem, options, &outputs)?;
    let elapsed = start.elapsed().as_secs_f64();

    let rendered = match args.format {
        Format::Table => render_table(&trajectory),
        Format::Csv => render_csv(&trajectory),
        Format::Yaml => serde_yaml::to_string(&trajectory)?,
    };

    if let Some(path) = &args.output {
        std::fs::write(path, rendered)?;
        println!(
            "✓ Wrote {} output points to {}",
            trajectory.times.len(),
            path.display()
        );
    } else {
        print!("{}", rendered);
    }

    if args.format != Format::Yaml {
        for event in &trajectory.events {
            let which: Vec<String> = event
                .crossings
                .iter()
                .map(|c| format!("g{} ({:+})", c.index, c.direction))
                .collect();
            println!("Root at t = {:.10e}: {}", event.t, which.join(", "));
        }
    }

    println!("✓ {} integrated in {:.4}s", args.problem, elapsed);
    if args.stats {
        print!("{}", serde_yaml::to_string(&trajectory.stats)?);
    }
    if let Some(err) = args
        .problem
        .reference()
        .and_then(|r| trajectory.final_error(&r))
    {
        // Reference values hold at t_end only.
        if trajectory.times.last() == Some(&args.problem.t_end()) {
            println!("  Final error vs reference: {:.3e}", err);
        }
    }

    Ok(())
}

fn render_table(trajectory: &Trajectory) -> String {
    let n = trajectory.states.first().map_or(0, Vec::len);
    let mut out = String::new();
    let _ = write!(out, "{:>14}", "t");
    for i in 0..n {
        let _ = write!(out, " {:>14}", format!("y{}", i));
    }
    out.push('\n');
    for (t, state) in trajectory.times.iter().zip(&trajectory.states) {
        let _ = write!(out, "{:>14.6e}", t);
        for v in state {
            let _ = write!(out, " {:>14.6e}", v);
        }
        out.push('\n');
    }
    out
}

fn render_csv(trajectory: &Trajectory) -> String {
    let n = trajectory.states.first().map_or(0, Vec::len);
    let mut out = String::from("t");
    for i in 0..n {
        let _ = write!(out, ",y{}", i);
    }
    out.push('\n');
    for (t, state) in trajectory.times.iter().zip(&trajectory.states) {
        let _ = write!(out, "{}", t);
        for v in state {
            let _ = write!(out, ",{}", v);
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(problem: ProblemId) -> RunArgs {
        RunArgs {
            problem,
            config: None,
            method: None,
            rtol: None,
            atol: None,
            anderson: None,
            t_end: None,
            outputs: None,
            format: Format::Table,
            output: None,
            stats: false,
        }
    }

    #[test]
    fn defaults_follow_the_problem() {
        let (options, outputs) = resolve(&args(ProblemId::Robertson)).expect("resolve");
        assert_eq!(options, ProblemId::Robertson.default_options());
        assert_eq!(outputs, vec![0.4, 4.0, 40.0]);
    }

    #[test]
    fn flags_override_defaults() {
        let mut a = args(ProblemId::Decay);
        a.method = Some(MethodArg::Trbdf2);
        a.rtol = Some(1e-3);
        a.t_end = Some(2.0);
        a.outputs = Some(4);
        let (options, outputs) = resolve(&a).expect("resolve");
        assert!(matches!(options.method, MethodKind::Dirk(_)));
        assert_eq!(options.tolerances.rtol, 1e-3);
        assert_eq!(outputs, vec![0.5, 1.0, 1.5, 2.0]);
    }

    #[test]
    fn template_parses_back() {
        let config = RunConfig {
            t_end: Some(3.0),
            outputs: Some(5),
            options: ProblemId::Heat.default_options(),
        };
        let yaml = serde_yaml::to_string(&config).expect("serialize");
        let back: RunConfig = serde_yaml::from_str(&yaml).expect("parse");
        assert_eq!(back.t_end, Some(3.0));
        assert_eq!(back.options.method, config.options.method);
        assert_eq!(back.options.linear_solver(), config.options.linear_solver());
    }

    #[test]
    fn partial_config_uses_defaults() {
        let back: RunConfig = serde_yaml::from_str("outputs: 3\n").expect("parse");
        assert_eq!(back.outputs, Some(3));
        assert_eq!(back.options.max_steps, IntegratorOptions::default().max_steps);
    }

    #[test]
    fn csv_has_a_header_and_one_row_per_output() {
        let problem = ProblemId::Decay;
        let trajectory =
            solve(problem, problem.default_options(), &[0.5, 1.0]).expect("decay integrates");
        let csv = render_csv(&trajectory);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "t,y0");
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("0,1"));
    }
}
