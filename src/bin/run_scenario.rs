//! run-scenario - execute a declarative simulation scenario
//!
//! Usage: `run-scenario <config-path> [--output <path>]`
//!
//! Loads the scenario (JSON or YAML), runs it to completion, writes the
//! result artifact and prints its path last. On failure a single
//! structured error line goes to stderr and the exit code encodes the
//! error class: 2 invalid config, 3 wiring error, 4 topology cycle,
//! 5 runtime failure.

use std::path::{Path, PathBuf};

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use water_simulator_core_rs::scenario::{load_scenario, write_result};
use water_simulator_core_rs::SimulationError;

#[derive(Parser)]
#[command(
    name = "run-scenario",
    about = "Run a water-network simulation scenario",
    version
)]
struct Cli {
    /// Scenario configuration file (.json, .yaml or .yml)
    config_path: PathBuf,

    /// Override the configured result path
    #[arg(long)]
    output: Option<PathBuf>,
}

fn run(cli: &Cli) -> Result<PathBuf, SimulationError> {
    let loaded = load_scenario(&cli.config_path)?;
    let mut harness = loaded.harness;
    harness.run(loaded.mode)?;

    let result = harness.result();
    let base_dir = cli
        .config_path
        .parent()
        .unwrap_or(Path::new("."))
        .to_path_buf();
    write_result(&result, &loaded.output, &base_dir, cli.output.as_deref())
}

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(path) => {
            // The artifact path is always the last stdout line
            println!("{}", path.display());
        }
        Err(err) => {
            eprintln!("error kind={} detail=\"{}\"", err.kind(), err);
            std::process::exit(err.exit_code());
        }
    }
}
