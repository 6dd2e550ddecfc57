//! M2K calibration CLI
//!
//! Runs offset and gain calibration against the configured instrument and
//! writes a JSON report.
//!
//! # Usage
//!
//! ```bash
//! # Full pipeline with the default configuration
//! m2k-calibrate
//!
//! # ADC offset only, verbose, report to a file
//! m2k-calibrate --procedure adc-offset --log-level debug --output run.json
//!
//! # Push the resulting corrections to the hardware
//! m2k-calibrate --apply
//! ```
//!
//! Ctrl+C cancels the running procedure; the hardware is restored before
//! the process exits.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use m2k_calibration::{AppConfig, CalibrationRunner, ProcedureSelection, RunStatus};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "m2k-calibrate")]
#[command(about = "Calibrate ADC and DAC offsets and gains of an M2K-class instrument")]
#[command(version)]
struct Cli {
    /// Path to the configuration TOML
    #[arg(short, long, default_value = m2k_calibration::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Procedure to run; prerequisites run first
    #[arg(short, long, value_enum, default_value_t = ProcedureSelection::All)]
    procedure: ProcedureSelection,

    /// Output JSON report path (overrides application.report_path)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log level (overrides application.log_level; RUST_LOG wins over both)
    #[arg(long)]
    log_level: Option<String>,

    /// Push the coefficients to the hardware after a completed run
    #[arg(long)]
    apply: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
        config.validate()?;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        "{}: running {:?} calibration",
        config.application.name, cli.procedure
    );

    let runner = CalibrationRunner::simulated(&config);
    let report = runner
        .run(cli.procedure, cli.apply, shutdown_signal())
        .await?;

    println!("{}", report.summary());

    if let Some(path) = cli.output.or(config.application.report_path) {
        report.write_json(&path)?;
        info!("Report written to {}", path.display());
    }

    match report.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Cancelled => anyhow::bail!("calibration cancelled"),
        RunStatus::Failed => anyhow::bail!(
            "calibration failed: {}",
            report.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", err);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, cancelling...");
}
