//! kfsbench - benchmark sweeps against the KernFS daemon.

use std::io::IsTerminal;

use anyhow::{Context, Result};
use clap::Parser;
use kfsbench::cli::Cli;
use kfsbench::{BenchConfig, BenchError, DaemonController, SweepReport, SweepRunner};
use kfsbench_proc::signal;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    if let Err(e) = signal::install_signal_handler() {
        tracing::warn!("Failed to install signal handler: {}", e);
    }

    let cli = Cli::parse();

    // RUST_LOG wins; otherwise --verbose selects info
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.common.verbose {
            EnvFilter::new("info")
        } else {
            EnvFilter::new("warn")
        }
    });

    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(indicatif_layer.get_stderr_writer()),
        )
        .with(indicatif_layer)
        .with(filter)
        .init();

    let config = cli.config().context("Invalid benchmark configuration")?;
    validate_environment(&config)?;

    let family = cli.family(&config).context("Failed to set up workload family")?;
    print_banner(&config, family.name());

    let daemon = DaemonController::new(cli.daemon_spec(&config));
    let mut runner = SweepRunner::new(daemon, family, config);

    let report = match runner.run() {
        Ok(report) => report,
        Err(BenchError::Interrupted) => {
            eprintln!("\nBenchmark interrupted.");
            std::process::exit(130);
        }
        Err(e) => return Err(e).context("Benchmark sweep failed"),
    };

    print_report(&report);
    Ok(())
}

/// The daemon's scripts must exist before anything is formatted.
fn validate_environment(config: &BenchConfig) -> Result<()> {
    let tests = config.root.join("kernfs").join("tests");
    for name in ["mkfs.sh", "run.sh", "kernfs"] {
        let path = tests.join(name);
        if !path.exists() {
            anyhow::bail!(
                "{} not found; is {} the repository root? (set --root or KFSBENCH_ROOT)",
                path.display(),
                config.root.display()
            );
        }
    }
    Ok(())
}

fn print_banner(config: &BenchConfig, family: &str) {
    use owo_colors::OwoColorize;

    let structures = config
        .structures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    let layouts = config
        .layouts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");

    println!();
    if std::io::stdout().is_terminal() {
        println!(
            "{}: {} on {} - layouts {} - {} trial(s)",
            "kfsbench".cyan().bold(),
            family,
            structures,
            layouts,
            config.trials
        );
    } else {
        println!(
            "kfsbench: {} on {} - layouts {} - {} trial(s)",
            family, structures, layouts, config.trials
        );
    }
    println!();
}

fn print_report(report: &SweepReport) {
    use owo_colors::OwoColorize;

    println!(
        "{} result(s) from {} workload(s), {} retries",
        report.results, report.workloads, report.retries
    );
    for path in &report.files {
        println!("  {}", path.display());
    }
    if !report.failures.is_empty() {
        println!();
        println!("{}", "Abandoned trials:".yellow());
        for failure in &report.failures {
            println!("  {} ({}) [{}]", failure.command, failure.reason, failure.env);
        }
    }
}
