//! Replay saved inputs outside the fuzzer.
//!
//! Each file is run exactly as the fuzz target would run it, with logging
//! enabled. `RUST_LOG=pageheap_exerciser=trace` shows every subject call.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use pageheap_exerciser::config::{RuntimeConfig, MAX_NUMA_PARTITIONS};
use pageheap_exerciser::invariant::fatal;
use pageheap_exerciser::subject::HugePageAwareAllocator;
use pageheap_exerciser::{run_with, RunOutcome};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hpaa-replay")]
#[command(about = "Replay page heap exerciser inputs.", long_about = None)]
struct Cli {
    /// Input files to run, in order.
    #[arg(required = true, value_name = "INPUT")]
    inputs: Vec<PathBuf>,

    /// Override the NUMA partition count from the environment.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u8).range(1..=MAX_NUMA_PARTITIONS as i64))]
    numa_partitions: Option<u8>,

    /// Only log warnings and errors.
    #[arg(long)]
    quiet: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.quiet);
    match try_main(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("hpaa-replay: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn init_logging(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn try_main(cli: &Cli) -> Result<()> {
    let mut runtime = RuntimeConfig::from_env().unwrap_or_else(|err| {
        warn!(%err, "ignoring invalid runtime configuration, using defaults");
        RuntimeConfig::default()
    });
    if let Some(n) = cli.numa_partitions {
        runtime.numa_partitions = n as usize;
    }

    for path in &cli.inputs {
        let data =
            std::fs::read(path).with_context(|| format!("read input: {}", path.display()))?;
        match run_with::<HugePageAwareAllocator>(&data, &runtime) {
            Ok(RunOutcome::Skipped) => {
                info!(input = %path.display(), len = data.len(), "skipped")
            }
            Ok(RunOutcome::Completed(report)) => info!(
                input = %path.display(),
                ops = report.ops.total(),
                peak_live_spans = report.peak_live_spans,
                forced_releases = report.forced_releases,
                "ok"
            ),
            Err(violation) => {
                warn!(input = %path.display(), "violation");
                fatal(&violation)
            }
        }
    }
    Ok(())
}
