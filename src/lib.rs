//! Application layer for the M2K calibration engine.
//!
//! Wraps [`daq_calibration`] with the pieces a bench tool needs:
//!
//! - [`config`]: Figment-based configuration (TOML file + `M2KCAL_` env)
//! - [`runner`]: async runner executing the blocking engine on Tokio's
//!   blocking pool, with shutdown-driven cancellation
//! - [`report`]: JSON report of a run
//! - [`error`]: application error type
//!
//! The `m2k-calibrate` binary ties them together.

pub mod config;
pub mod error;
pub mod report;
pub mod runner;

pub use config::{AppConfig, ApplicationConfig, ConfigError};
pub use error::{AppError, AppResult};
pub use report::{CalibrationReport, RunStatus};
pub use runner::{CalibrationRunner, ProcedureSelection};
