//! Offset and gain calibration for two-channel M2K-class instruments.
//!
//! The instrument pairs a two-channel 12-bit ADC with two 12-bit DACs whose
//! outputs can be looped back into the ADC through an internal calibration
//! switch matrix. This crate determines, per channel:
//!
//! - the ADC offset (raw reading at zero volts),
//! - the ADC gain (measured against two internal reference voltages),
//! - the DAC offset (raw code that reads back as zero volts),
//! - the DAC volts-per-LSB (measured through the calibrated ADC).
//!
//! # Architecture
//!
//! ```text
//! CalibrationEngine
//!   ├── capture      - synchronous two-channel capture + averaging
//!   ├── dac          - cyclic-buffer DC output per DAC channel
//!   ├── fine_tune    - bisection over DAC codes against ADC readback
//!   └── conversion   - pure raw <-> volts helpers
//!         │
//!         ▼
//!   HardwareHandle (trait)  ──  SimulatedM2k (in-process implementation)
//! ```
//!
//! All procedures block on hardware I/O and are meant to run on a worker
//! thread. Cancellation is cooperative through a [`CancelToken`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use daq_calibration::{CalibrationEngine, CalibrationSettings, SimulatedM2k};
//!
//! let hw = Arc::new(SimulatedM2k::default());
//! let mut engine = CalibrationEngine::new(hw, CalibrationSettings::default());
//! engine.initialize()?;
//! let outcome = engine.calibrate_all()?;
//! println!("{:?} -> {:?}", outcome, engine.coefficients());
//! ```

pub mod cancel;
pub mod capture;
pub mod conversion;
pub mod dac;
pub mod engine;
pub mod error;
pub mod fine_tune;
pub mod hardware;
pub mod settings;
pub mod simulated;

pub use cancel::CancelToken;
pub use capture::{average, capture_averages};
pub use conversion::{sample_to_volts, volts_to_sample, ADC_VOLTS_PER_LSB};
pub use dac::DacOutput;
pub use engine::{
    AdcChannel, CalibrationEngine, CalibrationMode, CalibrationOutcome, CalibrationWarning,
    CorrectionCoefficients, DacChannel, EngineState, GainMode, Procedure,
};
pub use error::{CalibrationError, Result};
pub use fine_tune::{fine_tune, DacLoopback, FineTuneOutcome, FineTuneRequest};
pub use hardware::{BufferId, HardwareError, HardwareHandle};
pub use settings::{CalibrationSettings, DeviceLayout};
pub use simulated::{SimulatedM2k, SimulationConfig};

/// Number of ADC channels and of DAC channels on the instrument.
pub const CHANNELS: usize = 2;

/// Smallest raw code of the 12-bit signed converters.
pub const RAW_MIN: i32 = -2048;

/// Largest raw code of the 12-bit signed converters.
pub const RAW_MAX: i32 = 2047;
