//! Error types for the calibration engine.
//!
//! Every error is local to the procedure that detects it. None of them leave
//! partially computed coefficients behind: a coefficient is only written once
//! its procedure has completed.

use thiserror::Error;

use crate::engine::Procedure;
use crate::hardware::HardwareError;

/// Convenience alias for engine results.
pub type Result<T> = std::result::Result<T, CalibrationError>;

/// Errors raised by the calibration engine.
#[derive(Error, Debug)]
pub enum CalibrationError {
    /// A required device or channel is missing. Fatal to `initialize`.
    #[error("Hardware unavailable: {what}")]
    HardwareUnavailable {
        /// Missing device or `device/channel`
        what: String,
    },

    /// `initialize` has not succeeded yet.
    #[error("Calibration engine is not initialized")]
    NotInitialized,

    /// Entering calibration mode failed earlier; the engine is unusable.
    #[error("Calibration engine failed during hardware setup")]
    EngineFailed,

    /// Another procedure is running.
    #[error("Calibration engine is busy with {procedure}")]
    Busy {
        /// Procedure currently running
        procedure: Procedure,
    },

    /// A procedure this one depends on has not completed since the last reset.
    #[error("{procedure} requires {requires} to be completed first")]
    MissingPrerequisite {
        /// Procedure that was requested
        procedure: Procedure,
        /// Procedure that has not completed yet
        requires: Procedure,
    },

    /// Capture returned too few samples or failed in transport.
    #[error("Capture error: {message}")]
    Capture {
        /// Description of the failure
        message: String,
    },

    /// DAC buffer setup or enable failed.
    #[error("DAC driver error: {message}")]
    Driver {
        /// Description of the failure
        message: String,
    },

    /// Two reference measurements did not differ enough to compute a gain.
    #[error("{procedure}: degenerate reference on channel {channel} (delta {delta:.6})")]
    DegenerateReference {
        /// Procedure that measured the references
        procedure: Procedure,
        /// Channel index
        channel: usize,
        /// Measured difference
        delta: f64,
    },

    /// Attribute I/O outside capture and buffer handling.
    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    /// Cancellation observed inside a procedure. Engine entry points report
    /// this as `CalibrationOutcome::Cancelled` instead of an error.
    #[error("Calibration cancelled")]
    Cancelled,
}

impl CalibrationError {
    pub(crate) fn capture(err: impl std::fmt::Display) -> Self {
        Self::Capture {
            message: err.to_string(),
        }
    }

    pub(crate) fn driver(err: impl std::fmt::Display) -> Self {
        Self::Driver {
            message: err.to_string(),
        }
    }
}
