//! Async calibration runner.
//!
//! The engine blocks on hardware I/O, so a run executes on Tokio's blocking
//! pool while the async side waits for either the result or a shutdown
//! signal. On shutdown the engine's cancel token is raised and the runner
//! still waits for the worker, so the hardware is always restored before the
//! report is returned.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use clap::ValueEnum;
use daq_calibration::{
    CalibrationEngine, CalibrationOutcome, CalibrationSettings, HardwareHandle,
    Procedure, SimulatedM2k,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::report::{CalibrationReport, RunStatus};

/// Which procedures a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ProcedureSelection {
    /// Full pipeline
    All,
    /// ADC offset only
    AdcOffset,
    /// ADC gain, after ADC offset
    AdcGain,
    /// DAC offset, after ADC offset
    DacOffset,
    /// DAC gain, after everything it depends on
    DacGain,
}

impl ProcedureSelection {
    /// Procedures to run, prerequisites included, in pipeline order.
    pub fn procedures(self) -> Vec<Procedure> {
        let target = match self {
            Self::All => return Procedure::PIPELINE.to_vec(),
            Self::AdcOffset => Procedure::OffsetAdc,
            Self::AdcGain => Procedure::GainAdc,
            Self::DacOffset => Procedure::OffsetDac,
            Self::DacGain => Procedure::GainDac,
        };

        let mut needed = vec![target];
        let mut i = 0;
        while i < needed.len() {
            for &req in needed[i].prerequisites() {
                if !needed.contains(&req) {
                    needed.push(req);
                }
            }
            i += 1;
        }
        Procedure::PIPELINE
            .into_iter()
            .filter(|p| needed.contains(p))
            .collect()
    }
}

/// Runs calibrations against one instrument.
pub struct CalibrationRunner {
    hw: Arc<dyn HardwareHandle>,
    settings: CalibrationSettings,
    application: String,
}

impl CalibrationRunner {
    /// Runner over `hw`, creating a fresh engine with `settings` per run.
    pub fn new(
        hw: Arc<dyn HardwareHandle>,
        settings: CalibrationSettings,
        application: impl Into<String>,
    ) -> Self {
        Self {
            hw,
            settings,
            application: application.into(),
        }
    }

    /// Runner over a simulated instrument described by `config.simulation`.
    pub fn simulated(config: &AppConfig) -> Self {
        let hw = Arc::new(SimulatedM2k::new(config.simulation.clone()));
        Self::new(hw, config.calibration.clone(), &config.application.name)
    }

    /// Execute `selection` and return the report.
    ///
    /// When `shutdown` resolves first, the run is cancelled and the report
    /// has status [`RunStatus::Cancelled`]. With `apply`, the coefficients of
    /// a completed run are pushed to the hardware.
    pub async fn run<F>(
        &self,
        selection: ProcedureSelection,
        apply: bool,
        shutdown: F,
    ) -> AppResult<CalibrationReport>
    where
        F: Future<Output = ()>,
    {
        let mut engine = CalibrationEngine::new(self.hw.clone(), self.settings.clone());
        let token = engine.cancel_token();
        let application = self.application.clone();

        let mut worker = tokio::task::spawn_blocking(move || {
            execute(&mut engine, &application, selection, apply)
        });

        tokio::pin!(shutdown);
        let joined = tokio::select! {
            result = &mut worker => result,
            _ = &mut shutdown => {
                info!("Shutdown requested, cancelling calibration");
                token.cancel();
                worker.await
            }
        };

        joined.map_err(|e| AppError::Worker(e.to_string()))
    }
}

/// Blocking body of a run.
fn execute(
    engine: &mut CalibrationEngine,
    application: &str,
    selection: ProcedureSelection,
    apply: bool,
) -> CalibrationReport {
    let started_at = Utc::now();
    let procedures = selection.procedures();

    let mut warnings = Vec::new();
    let mut status = RunStatus::Completed;
    let mut interrupted = None;
    let mut error_message = None;
    let mut temperatures = BTreeMap::new();

    match engine.initialize() {
        Ok(()) => {
            temperatures.extend(engine.device_temperatures());
            match engine.calibrate_sequence(&procedures) {
                Ok(CalibrationOutcome::Completed { warnings: w }) => warnings = w,
                Ok(CalibrationOutcome::Cancelled { procedure }) => {
                    status = RunStatus::Cancelled;
                    interrupted = Some(procedure);
                }
                Err(err) => {
                    status = RunStatus::Failed;
                    interrupted = procedures.iter().copied().find(|&p| !engine.is_completed(p));
                    error!("Calibration failed: {}", err);
                    error_message = Some(err.to_string());
                }
            }
        }
        Err(err) => {
            error!("Engine initialization failed: {}", err);
            status = RunStatus::Failed;
            error_message = Some(err.to_string());
        }
    }

    let completed = procedures
        .iter()
        .copied()
        .filter(|&p| engine.is_completed(p))
        .collect();

    let mut applied = false;
    if apply && status == RunStatus::Completed {
        match engine.update_corrections() {
            Ok(()) => applied = true,
            Err(err) => {
                warn!("Applying corrections failed: {}", err);
                status = RunStatus::Failed;
                error_message = Some(format!("applying corrections: {}", err));
            }
        }
    }

    info!("Calibration run finished: {:?}", status);
    CalibrationReport {
        application: application.to_string(),
        started_at,
        finished_at: Utc::now(),
        procedures,
        completed,
        status,
        interrupted,
        error: error_message,
        warnings,
        coefficients: *engine.coefficients(),
        temperatures,
        applied,
    }
}
