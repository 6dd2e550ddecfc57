//! Application error types.
//!
//! `AppError` wraps everything the calibration runner can fail with. Engine
//! failures inside a run are not errors at this level: they are recorded in
//! the [`CalibrationReport`](crate::report::CalibrationReport) so the
//! coefficients that did complete are still reported.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: loading or validating the TOML/env configuration.
//! - **`Calibration`**: engine errors surfaced outside a run (e.g. pushing
//!   corrections to the hardware).
//! - **`Report`**: writing or reading the JSON report file.
//! - **`Worker`**: the blocking calibration task panicked or was aborted.

use std::path::PathBuf;

use daq_calibration::CalibrationError;
use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Application-level errors.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration could not be loaded or is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Engine error outside a run
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    /// Report file could not be written or read
    #[error("Report file {path}: {source}")]
    Report {
        /// File or directory that failed
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Report JSON could not be encoded or decoded
    #[error("Report serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Blocking worker panicked or was aborted
    #[error("Calibration worker failed: {0}")]
    Worker(String),
}
