//! Standalone benchmark runner for StepFlow.

use sf_bench::{BenchmarkSuite, default_benchmarks, run_scenario, write_baseline};
use std::path::PathBuf;
use std::time::SystemTime;
use tracing_subscriber::EnvFilter;

const RUNS: usize = 5;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Determine repo root (two levels up from crate root).
    let crate_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let repo_root = crate_path
        .parent()
        .and_then(|p| p.parent())
        .ok_or("Could not determine repo root")?
        .to_path_buf();

    println!("StepFlow Benchmark Suite");
    println!("========================\n");

    let benchmarks = default_benchmarks();
    println!(
        "Running {} benchmarks, {} runs each...\n",
        benchmarks.len(),
        RUNS
    );

    let mut results = Vec::new();

    for (idx, scenario) in benchmarks.iter().enumerate() {
        print!("[{}/{}] {} ... ", idx + 1, benchmarks.len(), scenario.name);
        std::io::Write::flush(&mut std::io::stdout())?;

        match run_scenario(scenario, RUNS) {
            Ok(result) => {
                println!("OK ({:.4}s median)", result.aggregate.total_time_median_s);
                results.push(result);
            }
            Err(e) => {
                println!("FAILED");
                eprintln!("  Error: {}", e);
            }
        }
    }

    println!("\n========================");
    println!("Benchmark Results Summary");
    println!("========================\n");

    for result in &results {
        let agg = &result.aggregate;

        println!("{} [{}]", result.scenario.name, result.scenario.problem);
        println!(
            "  Time:        {:.4}s (median), min: {:.4}s, max: {:.4}s",
            agg.total_time_median_s, agg.total_time_min_s, agg.total_time_max_s
        );
        println!("  Steps:       {} (median)", agg.steps_median);
        println!("  RHS evals:   {} (median)", agg.rhs_evals_median);
        println!("  Jacobians:   {} (median)", agg.jacobian_evals_median);
        if agg.error_test_failures_total > 0 {
            println!("  Error-test failures: {} (total)", agg.error_test_failures_total);
        }
        if agg.step_convergence_failures_total > 0 {
            println!(
                "  Convergence failures: {} (total)",
                agg.step_convergence_failures_total
            );
        }
        if let Some(err) = agg.final_error_max {
            println!("  Final error: {:.3e}", err);
        }
        if !agg.deterministic {
            println!("  WARNING: runs did not do identical work");
        }
        if let Some(notes) = &result.scenario.notes {
            println!("  Notes: {}", notes);
        }

        println!();
    }

    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)?
        .as_secs();
    let suite = BenchmarkSuite {
        timestamp: format!("timestamp_{}", timestamp),
        results,
    };

    let baseline_path = repo_root.join("benchmarks").join("baseline.json");
    write_baseline(&baseline_path, &suite)?;

    println!("Baseline saved to: {}", baseline_path.display());

    Ok(())
}
