//! Runner and configuration tests against the simulated instrument.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use daq_calibration::{CalibrationSettings, Procedure, SimulatedM2k, SimulationConfig};
use m2k_calibration::{
    AppConfig, CalibrationReport, CalibrationRunner, ConfigError, ProcedureSelection, RunStatus,
};

fn fast_settings() -> CalibrationSettings {
    CalibrationSettings {
        offset_samples: 2048,
        gain_samples: 2048,
        dac_samples: 2048,
        dac_settle_ms: 0,
        ..Default::default()
    }
}

fn runner_with(hw: Arc<SimulatedM2k>, settings: CalibrationSettings) -> CalibrationRunner {
    CalibrationRunner::new(hw, settings, "bench")
}

// =============================================================================
// Runs
// =============================================================================

#[tokio::test]
async fn full_run_reports_coefficients() {
    let hw = Arc::new(SimulatedM2k::default());
    let runner = runner_with(hw.clone(), fast_settings());

    let report = runner
        .run(ProcedureSelection::All, false, std::future::pending())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.completed, Procedure::PIPELINE.to_vec());
    assert_eq!(report.coefficients.adc_offset, [-12, 7]);
    assert_eq!(report.coefficients.dac_offset, [25, -31]);
    assert_eq!(report.temperatures.len(), 3);
    assert!(!report.applied);
    assert_eq!(hw.attr("m2k-adc", Some("voltage0"), "calibbias"), None);
}

#[tokio::test]
async fn apply_pushes_corrections() {
    let hw = Arc::new(SimulatedM2k::default());
    let runner = runner_with(hw.clone(), fast_settings());

    let report = runner
        .run(ProcedureSelection::AdcOffset, true, std::future::pending())
        .await
        .unwrap();

    assert!(report.is_success());
    assert!(report.applied);
    assert_eq!(report.procedures, vec![Procedure::OffsetAdc]);
    assert_eq!(
        hw.attr("m2k-adc", Some("voltage0"), "calibbias").as_deref(),
        Some("-12")
    );
}

#[tokio::test]
async fn missing_device_fails_run() {
    let hw = Arc::new(SimulatedM2k::default().without_device("m2k-adc"));
    let runner = runner_with(hw, fast_settings());

    let report = runner
        .run(ProcedureSelection::All, true, std::future::pending())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("Hardware unavailable"));
    assert!(report.completed.is_empty());
    assert!(report.coefficients.is_identity());
    assert!(!report.applied);
}

#[tokio::test]
async fn failed_step_is_reported_with_partial_results() {
    let hw = Arc::new(SimulatedM2k::default());
    hw.fail_captures_in_mode(Some(daq_calibration::CalibrationMode::AdcRef2));
    let runner = runner_with(hw, fast_settings());

    let report = runner
        .run(ProcedureSelection::All, false, std::future::pending())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.completed, vec![Procedure::OffsetAdc]);
    assert_eq!(report.interrupted, Some(Procedure::GainAdc));
    assert_eq!(report.coefficients.adc_offset, [-12, 7]);
    assert_eq!(report.coefficients.adc_gain, [1.0, 1.0]);
}

#[tokio::test]
async fn shutdown_cancels_run() {
    let hw = Arc::new(SimulatedM2k::default());
    let runner = runner_with(
        hw.clone(),
        CalibrationSettings {
            dac_settle_ms: 20,
            ..fast_settings()
        },
    );

    let probe = hw.clone();
    let shutdown = async move {
        while probe.dac_push_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };

    let report = runner
        .run(ProcedureSelection::All, true, shutdown)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.interrupted, Some(Procedure::OffsetDac));
    assert_eq!(report.coefficients.dac_offset, [0, 0]);
    assert!(!report.applied);
    assert_eq!(hw.live_buffers(), 0);
    assert_eq!(
        hw.attr("m2k-fabric", None, "calibration_mode").as_deref(),
        Some("none")
    );
}

#[tokio::test]
async fn shutdown_before_start_cancels_run() {
    let hw = Arc::new(SimulatedM2k::default());
    let runner = runner_with(
        hw.clone(),
        CalibrationSettings {
            dac_settle_ms: 20,
            ..fast_settings()
        },
    );

    let report = runner
        .run(ProcedureSelection::All, true, std::future::ready(()))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert!(report.interrupted.is_some());
    assert!(!report.completed.contains(&Procedure::GainDac));
    assert!(!report.applied);
    assert_eq!(hw.attr("m2k-adc", Some("voltage0"), "calibbias"), None);
    assert_eq!(hw.live_buffers(), 0);
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn config_file_overrides_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("m2k.toml");
    fs::write(
        &path,
        r#"
[application]
name = "bench-7"
log_level = "debug"

[calibration]
offset_samples = 1024
fine_tune_tolerance = 0.25

[calibration.layout]
adc = "adc-x"

[simulation]
noise_lsb = 0.0
adc_offset = [3, -4]
"#,
    )
    .unwrap();

    let config = AppConfig::load_from(&path).unwrap();
    assert_eq!(config.application.name, "bench-7");
    assert_eq!(config.application.log_level, "debug");
    assert_eq!(config.calibration.offset_samples, 1024);
    assert_eq!(config.calibration.fine_tune_tolerance, 0.25);
    assert_eq!(config.calibration.gain_samples, 16384);
    assert_eq!(config.calibration.layout.adc, "adc-x");
    assert_eq!(config.calibration.layout.dac_a, "m2k-dac-a");
    assert_eq!(config.simulation.adc_offset, [3, -4]);
    assert_eq!(config.simulation.noise_lsb, 0.0);
}

#[test]
fn missing_config_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.calibration, CalibrationSettings::default());
    assert_eq!(config.simulation, SimulationConfig::default());
}

#[test]
fn invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    fs::write(&path, "[calibration]\ndac_gain_delta = 0\n").unwrap();

    let err = AppConfig::load_from(&path).unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(_)));
}

#[test]
fn malformed_config_is_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[calibration\noffset_samples = ").unwrap();

    let err = AppConfig::load_from(&path).unwrap_err();
    assert!(matches!(err, ConfigError::LoadError(_)));
}

#[test]
fn shipped_config_loads() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/m2k-calibration.toml");
    let config = AppConfig::load_from(path).unwrap();
    assert!(config.validate().is_ok());

    // Round trip through TOML keeps every field
    let text = toml::to_string(&config).unwrap();
    let parsed: AppConfig = toml::from_str(&text).unwrap();
    assert_eq!(parsed, config);
}

// =============================================================================
// Report
// =============================================================================

#[tokio::test]
async fn report_written_by_run_reads_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reports/run.json");

    let hw = Arc::new(SimulatedM2k::default());
    let report = runner_with(hw, fast_settings())
        .run(ProcedureSelection::DacOffset, false, std::future::pending())
        .await
        .unwrap();
    report.write_json(&path).unwrap();

    let loaded = CalibrationReport::read_json(&path).unwrap();
    assert_eq!(loaded, report);
    assert_eq!(
        loaded.procedures,
        vec![Procedure::OffsetAdc, Procedure::OffsetDac]
    );
}
