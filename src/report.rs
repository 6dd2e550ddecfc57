//! JSON calibration report.
//!
//! A report is produced for every run, including failed and cancelled ones,
//! so the coefficients of the steps that did complete are never lost.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use daq_calibration::{CalibrationWarning, CorrectionCoefficients, Procedure};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every requested procedure completed
    Completed,
    /// Cancelled by the operator
    Cancelled,
    /// A procedure or the engine setup failed
    Failed,
}

/// Record of one calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    /// Application name from the configuration
    pub application: String,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run ended
    pub finished_at: DateTime<Utc>,
    /// Procedures requested, in execution order
    pub procedures: Vec<Procedure>,
    /// Procedures that ran to completion
    pub completed: Vec<Procedure>,
    /// How the run ended
    pub status: RunStatus,
    /// Procedure that was running when the run was cancelled or failed
    pub interrupted: Option<Procedure>,
    /// Error message for failed runs
    pub error: Option<String>,
    /// Non-fatal findings of completed procedures
    pub warnings: Vec<CalibrationWarning>,
    /// Coefficients at the end of the run
    pub coefficients: CorrectionCoefficients,
    /// Die temperatures read at the start of the run (°C)
    pub temperatures: BTreeMap<String, f64>,
    /// Whether the coefficients were pushed to the hardware
    pub applied: bool,
}

impl CalibrationReport {
    /// Check if the run completed.
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Write the report as pretty-printed JSON.
    pub fn write_json(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| AppError::Report {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|source| AppError::Report {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read a report written by [`CalibrationReport::write_json`].
    pub fn read_json(path: &Path) -> AppResult<Self> {
        let json = fs::read_to_string(path).map_err(|source| AppError::Report {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Human-readable summary for the terminal.
    pub fn summary(&self) -> String {
        let c = &self.coefficients;
        let mut out = String::new();
        let _ = writeln!(out, "=== {} ===", self.application);
        let _ = writeln!(
            out,
            "Status: {:?} ({:.1} s)",
            self.status,
            (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
        );
        if let Some(procedure) = self.interrupted {
            let _ = writeln!(out, "Interrupted during: {}", procedure);
        }
        if let Some(err) = &self.error {
            let _ = writeln!(out, "Error: {}", err);
        }
        let _ = writeln!(
            out,
            "ADC offset: [{}, {}]  gain: [{:.6e}, {:.6e}]",
            c.adc_offset[0], c.adc_offset[1], c.adc_gain[0], c.adc_gain[1]
        );
        let _ = writeln!(
            out,
            "DAC offset: [{}, {}]  V/LSB: [{:.6e}, {:.6e}]",
            c.dac_offset[0], c.dac_offset[1], c.dac_vlsb[0], c.dac_vlsb[1]
        );
        for (device, temp) in &self.temperatures {
            let _ = writeln!(out, "{}: {:.1} °C", device, temp);
        }
        for warning in &self.warnings {
            let _ = writeln!(out, "Warning: {}", warning);
        }
        if self.applied {
            let _ = writeln!(out, "Corrections applied to hardware");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CalibrationReport {
        let now = Utc::now();
        CalibrationReport {
            application: "bench".to_string(),
            started_at: now,
            finished_at: now,
            procedures: vec![Procedure::OffsetAdc, Procedure::GainAdc],
            completed: vec![Procedure::OffsetAdc],
            status: RunStatus::Failed,
            interrupted: Some(Procedure::GainAdc),
            error: Some("Capture error: short read".to_string()),
            warnings: vec![],
            coefficients: CorrectionCoefficients::identity(),
            temperatures: BTreeMap::from([("m2k-adc".to_string(), 40.5)]),
            applied: false,
        }
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&RunStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }

    #[test]
    fn test_summary_mentions_failure() {
        let summary = sample().summary();
        assert!(summary.contains("Status: Failed"));
        assert!(summary.contains("Interrupted during: ADC gain calibration"));
        assert!(summary.contains("m2k-adc: 40.5"));
    }

    #[test]
    fn test_write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/run.json");
        let report = sample();

        report.write_json(&path).unwrap();
        assert_eq!(CalibrationReport::read_json(&path).unwrap(), report);
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CalibrationReport::read_json(&dir.path().join("none.json")).unwrap_err();
        assert!(matches!(err, AppError::Report { .. }));
    }
}
