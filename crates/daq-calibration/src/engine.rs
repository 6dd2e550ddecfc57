//! Calibration engine: lifecycle, hardware bracket and the four procedures.
//!
//! # Procedures
//!
//! | Procedure   | Calibration mode      | Result              |
//! |-------------|-----------------------|---------------------|
//! | ADC offset  | `AdcGround`           | `adc_offset[ch]`    |
//! | ADC gain    | `AdcRef1`, `AdcRef2`  | `adc_gain[ch]`      |
//! | DAC offset  | `Dac` (loopback)      | `dac_offset[ch]`    |
//! | DAC gain    | `Dac` (loopback)      | `dac_vlsb[ch]`      |
//!
//! DAC calibration measures the DAC output with the ADC, so the procedures
//! depend on each other. [`Procedure::prerequisites`] encodes the dependency
//! and [`CalibrationEngine::calibrate_all`] runs [`Procedure::PIPELINE`] in
//! order, stopping at the first failure or cancellation.
//!
//! # State machine
//!
//! ```text
//! Uninitialized --initialize--> Initialized --procedure--> Busy(p)
//!                                   ^                        |
//!                                   +--- success / error ----+
//!                                   |                        |
//!                               Cancelled <--- cancel -------+
//!                   Failed <--- calibration-mode setup error
//! ```
//!
//! Every procedure runs between [`CalibrationEngine::set_hardware_in_calib_mode`]
//! and [`CalibrationEngine::restore_hardware_from_calib_mode`]; restoration
//! runs on success, error and cancellation alike.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::capture::capture_averages;
use crate::conversion::clamp_raw;
use crate::dac::DacOutput;
use crate::error::{CalibrationError, Result};
use crate::fine_tune::{fine_tune, DacLoopback, FineTuneOutcome, FineTuneRequest};
use crate::hardware::HardwareHandle;
use crate::settings::{CalibrationSettings, DeviceLayout};
use crate::CHANNELS;

// =============================================================================
// Attribute names
// =============================================================================

const ATTR_SAMPLE_RATE: &str = "sampling_frequency";
const ATTR_OVERSAMPLING: &str = "oversampling_ratio";
const ATTR_TRIGGER_MODE: &str = "mode";
const ATTR_CALIBRATION_MODE: &str = "calibration_mode";
const ATTR_GAIN: &str = "gain";
const ATTR_CALIBBIAS: &str = "calibbias";
const ATTR_CALIBSCALE: &str = "calibscale";
const ATTR_POWERDOWN: &str = "powerdown";

const TRIGGER_ALWAYS: &str = "always";

// =============================================================================
// Modes and channels
// =============================================================================

/// ADC input channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdcChannel {
    /// Channel 0
    Ch0,
    /// Channel 1
    Ch1,
}

impl AdcChannel {
    /// Index into per-channel arrays.
    pub fn index(self) -> usize {
        match self {
            Self::Ch0 => 0,
            Self::Ch1 => 1,
        }
    }
}

/// DAC output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DacChannel {
    /// DAC A
    A,
    /// DAC B
    B,
}

impl DacChannel {
    /// Index into per-channel arrays. DAC A loops back into ADC channel 0.
    pub fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }
}

/// Signal-path configuration of the calibration switch matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalibrationMode {
    /// First internal reference voltage on both ADC inputs
    AdcRef1,
    /// Second internal reference voltage on both ADC inputs
    AdcRef2,
    /// ADC inputs grounded
    AdcGround,
    /// DAC outputs looped back into the ADC inputs
    Dac,
    /// Normal signal path
    None,
}

impl CalibrationMode {
    /// Value written to the fabric `calibration_mode` attribute.
    pub fn attr_value(self) -> &'static str {
        match self {
            Self::AdcRef1 => "adc_ref1",
            Self::AdcRef2 => "adc_ref2",
            Self::AdcGround => "adc_gnd",
            Self::Dac => "dac",
            Self::None => "none",
        }
    }

    /// Parse a fabric `calibration_mode` attribute value.
    pub fn from_attr_value(value: &str) -> Option<Self> {
        match value.trim() {
            "adc_ref1" => Some(Self::AdcRef1),
            "adc_ref2" => Some(Self::AdcRef2),
            "adc_gnd" => Some(Self::AdcGround),
            "dac" => Some(Self::Dac),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// ADC front-end attenuation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GainMode {
    /// Wide input range
    Low,
    /// Narrow input range, higher resolution
    High,
}

impl GainMode {
    /// Value written to the fabric `gain` attribute.
    pub fn attr_value(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::High => "high",
        }
    }
}

// =============================================================================
// Procedures
// =============================================================================

/// One of the four calibration procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Procedure {
    /// ADC offset from grounded inputs
    OffsetAdc,
    /// ADC gain from the two internal references
    GainAdc,
    /// DAC zero code through the ADC loopback
    OffsetDac,
    /// DAC volts per code through the ADC loopback
    GainDac,
}

impl Procedure {
    /// Dependency order used by [`CalibrationEngine::calibrate_all`].
    pub const PIPELINE: [Procedure; 4] = [
        Procedure::OffsetAdc,
        Procedure::GainAdc,
        Procedure::OffsetDac,
        Procedure::GainDac,
    ];

    /// Procedures that must have completed since the last reset.
    pub fn prerequisites(self) -> &'static [Procedure] {
        match self {
            Self::OffsetAdc => &[],
            Self::GainAdc => &[Procedure::OffsetAdc],
            Self::OffsetDac => &[Procedure::OffsetAdc],
            Self::GainDac => &[Procedure::GainAdc, Procedure::OffsetDac],
        }
    }

    fn index(self) -> usize {
        match self {
            Self::OffsetAdc => 0,
            Self::GainAdc => 1,
            Self::OffsetDac => 2,
            Self::GainDac => 3,
        }
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OffsetAdc => write!(f, "ADC offset calibration"),
            Self::GainAdc => write!(f, "ADC gain calibration"),
            Self::OffsetDac => write!(f, "DAC offset calibration"),
            Self::GainDac => write!(f, "DAC gain calibration"),
        }
    }
}

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// `initialize` has not succeeded
    Uninitialized,
    /// Ready for a procedure
    Initialized,
    /// Running a procedure
    Busy(Procedure),
    /// Last procedure was cancelled; ready for a new one.
    Cancelled,
    /// Hardware could not be put into (or out of) calibration mode.
    Failed,
}

/// Non-fatal findings of a completed procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CalibrationWarning {
    /// Fine-tune search ended without reaching tolerance; the closest code
    /// was stored.
    NotConverged {
        /// Procedure that ran the search
        procedure: Procedure,
        /// Channel index
        channel: usize,
        /// Stored DAC code
        code: i16,
        /// Remaining error in ADC raw units
        residual: f64,
    },
}

impl fmt::Display for CalibrationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConverged {
                procedure,
                channel,
                code,
                residual,
            } => write!(
                f,
                "{}: channel {} did not converge (code {}, residual {:.3})",
                procedure, channel, code, residual
            ),
        }
    }
}

/// Terminal outcome of a procedure or pipeline that did not fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CalibrationOutcome {
    /// Every requested procedure ran to the end
    Completed {
        /// Non-fatal findings, in procedure order
        warnings: Vec<CalibrationWarning>,
    },
    /// Stopped by a cancel request; no coefficients were written for `procedure`
    Cancelled {
        /// Procedure that was running or about to start
        procedure: Procedure,
    },
}

impl CalibrationOutcome {
    fn completed() -> Self {
        Self::Completed {
            warnings: Vec::new(),
        }
    }

    /// Whether the procedure ran to the end.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Whether the procedure was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

// =============================================================================
// Correction coefficients
// =============================================================================

/// Per-channel correction coefficients.
///
/// `adc_gain` holds the measured reference slope `(V2 - V1) / (m2 - m1)`, i.e.
/// volts per offset-corrected raw unit; `dac_vlsb` holds volts per DAC code.
/// Both are 1.0 when uncorrected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrectionCoefficients {
    /// Raw-unit offset added to ADC readings
    pub adc_offset: [i32; CHANNELS],
    /// Volts per offset-corrected ADC raw unit. Not a dimensionless factor,
    /// so not a valid `gain` argument for [`sample_to_volts`](crate::sample_to_volts)
    pub adc_gain: [f64; CHANNELS],
    /// DAC code that reads back as zero volts
    pub dac_offset: [i32; CHANNELS],
    /// Volts per DAC code
    pub dac_vlsb: [f64; CHANNELS],
}

impl Default for CorrectionCoefficients {
    fn default() -> Self {
        Self::identity()
    }
}

impl CorrectionCoefficients {
    /// Uncorrected coefficients: offsets 0, gains 1.0.
    pub fn identity() -> Self {
        Self {
            adc_offset: [0; CHANNELS],
            adc_gain: [1.0; CHANNELS],
            dac_offset: [0; CHANNELS],
            dac_vlsb: [1.0; CHANNELS],
        }
    }

    /// Check if every coefficient is at identity.
    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    /// Offset-corrected ADC reading.
    pub fn correct_adc(&self, channel: AdcChannel, raw: f64) -> f64 {
        raw + self.adc_offset[channel.index()] as f64
    }

    /// Volts of a raw ADC reading: `(raw + adc_offset) * adc_gain`.
    ///
    /// Only meaningful once ADC gain has been calibrated; at identity the
    /// result is the offset-corrected raw value.
    pub fn corrected_volts(&self, channel: AdcChannel, raw: f64) -> f64 {
        self.correct_adc(channel, raw) * self.adc_gain[channel.index()]
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Hardware configuration saved on entry to calibration mode.
#[derive(Debug, Clone)]
struct SavedHardware {
    trigger_modes: Vec<String>,
    adc_sample_rate: String,
    adc_oversampling: String,
    dac_sample_rates: Vec<String>,
    dac_oversampling: Vec<String>,
    dac_powerdown: Vec<String>,
}

/// Calibration engine for one instrument.
///
/// Owns the correction coefficients and lifecycle state. The hardware handle
/// is shared, but no other component may capture from or drive the same
/// channels while a procedure runs.
///
/// Procedures take `&mut self` and block; run them on a worker thread and use
/// [`CalibrationEngine::cancel_token`] to cancel from elsewhere.
pub struct CalibrationEngine {
    hw: Arc<dyn HardwareHandle>,
    settings: CalibrationSettings,
    coefficients: CorrectionCoefficients,
    state: EngineState,
    mode: CalibrationMode,
    cancel: CancelToken,
    completed: [bool; 4],
    saved: Option<SavedHardware>,
    dacs: [DacOutput; CHANNELS],
}

impl fmt::Debug for CalibrationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalibrationEngine")
            .field("state", &self.state)
            .field("mode", &self.mode)
            .field("coefficients", &self.coefficients)
            .finish_non_exhaustive()
    }
}

impl CalibrationEngine {
    /// Create an uninitialized engine.
    pub fn new(hw: Arc<dyn HardwareHandle>, settings: CalibrationSettings) -> Self {
        let dacs = [
            DacOutput::new(&settings.layout.dac_a, &settings.layout.dac_channel),
            DacOutput::new(&settings.layout.dac_b, &settings.layout.dac_channel),
        ];
        Self {
            hw,
            settings,
            coefficients: CorrectionCoefficients::identity(),
            state: EngineState::Uninitialized,
            mode: CalibrationMode::None,
            cancel: CancelToken::new(),
            completed: [false; 4],
            saved: None,
            dacs,
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Verify the hardware and configure calibration sampling.
    ///
    /// Idempotent once initialized. On failure the engine stays
    /// `Uninitialized`.
    pub fn initialize(&mut self) -> Result<()> {
        match self.state {
            EngineState::Uninitialized => {}
            EngineState::Failed => return Err(CalibrationError::EngineFailed),
            _ => return Ok(()),
        }

        self.check_hardware()?;
        self.configure_sampling()?;

        self.state = EngineState::Initialized;
        info!(
            "Calibration engine initialized (ADC {} Hz x{}, DAC {} Hz x{})",
            self.settings.adc_sample_rate,
            self.settings.adc_oversampling,
            self.settings.dac_sample_rate,
            self.settings.dac_oversampling
        );
        Ok(())
    }

    /// Whether `initialize` has succeeded.
    pub fn is_initialized(&self) -> bool {
        !matches!(self.state, EngineState::Uninitialized | EngineState::Failed)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Whether `procedure` has completed since the last reset.
    pub fn is_completed(&self, procedure: Procedure) -> bool {
        self.completed[procedure.index()]
    }

    /// Settings the engine was created with.
    pub fn settings(&self) -> &CalibrationSettings {
        &self.settings
    }

    fn layout(&self) -> &DeviceLayout {
        &self.settings.layout
    }

    fn check_hardware(&self) -> Result<()> {
        let layout = self.layout();
        let missing = |what: String| {
            warn!("Calibration hardware missing: {}", what);
            CalibrationError::HardwareUnavailable { what }
        };

        for device in [
            &layout.adc,
            &layout.adc_trigger,
            &layout.dac_a,
            &layout.dac_b,
            &layout.fabric,
        ] {
            if !self.hw.has_device(device) {
                return Err(missing(device.clone()));
            }
        }

        for channel in &layout.adc_channels {
            for device in [&layout.adc, &layout.adc_trigger, &layout.fabric] {
                if !self.hw.has_channel(device, channel, false) {
                    return Err(missing(format!("{}/{}", device, channel)));
                }
            }
        }

        for device in [&layout.dac_a, &layout.dac_b] {
            if !self.hw.has_channel(device, &layout.dac_channel, true) {
                return Err(missing(format!("{}/{}", device, layout.dac_channel)));
            }
        }

        Ok(())
    }

    fn configure_sampling(&self) -> Result<()> {
        let s = &self.settings;
        let layout = &s.layout;

        self.hw.write_attr(
            &layout.adc,
            None,
            ATTR_SAMPLE_RATE,
            &s.adc_sample_rate.to_string(),
        )?;
        self.hw.write_attr(
            &layout.adc,
            None,
            ATTR_OVERSAMPLING,
            &s.adc_oversampling.to_string(),
        )?;
        for dac in [&layout.dac_a, &layout.dac_b] {
            self.hw
                .write_attr(dac, None, ATTR_SAMPLE_RATE, &s.dac_sample_rate.to_string())?;
            self.hw
                .write_attr(dac, None, ATTR_OVERSAMPLING, &s.dac_oversampling.to_string())?;
        }
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            EngineState::Initialized | EngineState::Cancelled => Ok(()),
            EngineState::Uninitialized => Err(CalibrationError::NotInitialized),
            EngineState::Failed => Err(CalibrationError::EngineFailed),
            EngineState::Busy(procedure) => Err(CalibrationError::Busy { procedure }),
        }
    }

    // -------------------------------------------------------------------------
    // Calibration-mode bracket
    // -------------------------------------------------------------------------

    /// Save the live acquisition configuration and switch to calibration
    /// configuration (free-running triggers, calibration sampling, DACs
    /// powered up). Does nothing if already in calibration mode.
    pub fn set_hardware_in_calib_mode(&mut self) -> Result<()> {
        if !self.is_initialized() {
            return Err(CalibrationError::NotInitialized);
        }
        if self.saved.is_some() {
            return Ok(());
        }

        let saved = self.read_hardware_config()?;
        self.saved = Some(saved);

        if let Err(err) = self.apply_calib_config() {
            warn!("Entering calibration mode failed: {}", err);
            if let Err(restore_err) = self.restore_hardware_from_calib_mode() {
                error!("Restoring after failed setup also failed: {}", restore_err);
            }
            return Err(err);
        }

        debug!("Hardware in calibration mode");
        Ok(())
    }

    fn read_hardware_config(&self) -> Result<SavedHardware> {
        let layout = self.layout();
        let hw = &self.hw;

        let trigger_modes = layout
            .adc_channels
            .iter()
            .map(|ch| hw.read_attr(&layout.adc_trigger, Some(ch.as_str()), ATTR_TRIGGER_MODE))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let dacs = [&layout.dac_a, &layout.dac_b];
        let dac_sample_rates = dacs
            .iter()
            .map(|dac| hw.read_attr(dac, None, ATTR_SAMPLE_RATE))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let dac_oversampling = dacs
            .iter()
            .map(|dac| hw.read_attr(dac, None, ATTR_OVERSAMPLING))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let dac_powerdown = dacs
            .iter()
            .map(|dac| hw.read_attr(dac, Some(layout.dac_channel.as_str()), ATTR_POWERDOWN))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(SavedHardware {
            trigger_modes,
            adc_sample_rate: hw.read_attr(&layout.adc, None, ATTR_SAMPLE_RATE)?,
            adc_oversampling: hw.read_attr(&layout.adc, None, ATTR_OVERSAMPLING)?,
            dac_sample_rates,
            dac_oversampling,
            dac_powerdown,
        })
    }

    fn apply_calib_config(&self) -> Result<()> {
        let layout = self.layout();
        for ch in &layout.adc_channels {
            self.hw.write_attr(
                &layout.adc_trigger,
                Some(ch.as_str()),
                ATTR_TRIGGER_MODE,
                TRIGGER_ALWAYS,
            )?;
        }
        self.configure_sampling()?;
        self.set_dac_powerdown(false)?;
        Ok(())
    }

    /// Leave calibration mode: stop DAC outputs, select the normal signal
    /// path, and write back the configuration saved on entry (trigger modes,
    /// sampling attributes, DAC power-down).
    ///
    /// Every restore step is attempted; the first failure is returned.
    pub fn restore_hardware_from_calib_mode(&mut self) -> Result<()> {
        self.stop_dacs();

        let mut first_err: Option<CalibrationError> = None;
        let mut keep = |result: Result<()>| {
            if let Err(err) = result {
                warn!("Restoring hardware: {}", err);
                first_err.get_or_insert(err);
            }
        };

        keep(self.write_calibration_mode(CalibrationMode::None));

        if let Some(saved) = self.saved.take() {
            let layout = &self.settings.layout;
            let hw = &self.hw;

            for (ch, mode) in layout.adc_channels.iter().zip(&saved.trigger_modes) {
                keep(
                    hw.write_attr(&layout.adc_trigger, Some(ch.as_str()), ATTR_TRIGGER_MODE, mode)
                        .map_err(Into::into),
                );
            }
            keep(
                hw.write_attr(&layout.adc, None, ATTR_SAMPLE_RATE, &saved.adc_sample_rate)
                    .map_err(Into::into),
            );
            keep(
                hw.write_attr(&layout.adc, None, ATTR_OVERSAMPLING, &saved.adc_oversampling)
                    .map_err(Into::into),
            );
            for (i, dac) in [&layout.dac_a, &layout.dac_b].into_iter().enumerate() {
                keep(
                    hw.write_attr(dac, None, ATTR_SAMPLE_RATE, &saved.dac_sample_rates[i])
                        .map_err(Into::into),
                );
                keep(
                    hw.write_attr(dac, None, ATTR_OVERSAMPLING, &saved.dac_oversampling[i])
                        .map_err(Into::into),
                );
                keep(
                    hw.write_attr(
                        dac,
                        Some(layout.dac_channel.as_str()),
                        ATTR_POWERDOWN,
                        &saved.dac_powerdown[i],
                    )
                    .map_err(Into::into),
                );
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => {
                debug!("Hardware restored from calibration mode");
                Ok(())
            }
        }
    }

    /// Run `body` as `procedure` inside the calibration-mode bracket.
    ///
    /// Returns `Ok(None)` when the body observed cancellation.
    fn run_procedure<T>(
        &mut self,
        procedure: Procedure,
        body: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<Option<T>> {
        self.ensure_ready()?;
        for &requires in procedure.prerequisites() {
            if !self.completed[requires.index()] {
                return Err(CalibrationError::MissingPrerequisite {
                    procedure,
                    requires,
                });
            }
        }

        info!("Starting {}", procedure);
        self.state = EngineState::Busy(procedure);

        if let Err(err) = self.set_hardware_in_calib_mode() {
            error!("{}: hardware setup failed: {}", procedure, err);
            self.state = EngineState::Failed;
            return Err(err);
        }

        let result = body(self);

        if let Err(err) = self.restore_hardware_from_calib_mode() {
            error!("{}: hardware restore failed: {}", procedure, err);
            self.state = EngineState::Failed;
            return Err(err);
        }

        match result {
            Ok(value) => {
                self.state = EngineState::Initialized;
                self.completed[procedure.index()] = true;
                Ok(Some(value))
            }
            Err(CalibrationError::Cancelled) => {
                info!("{} cancelled", procedure);
                self.state = EngineState::Cancelled;
                Ok(None)
            }
            Err(err) => {
                warn!("{} failed: {}", procedure, err);
                self.state = EngineState::Initialized;
                Err(err)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Procedures
    // -------------------------------------------------------------------------

    /// Run all four procedures in dependency order.
    ///
    /// Stops at the first error or cancellation. Coefficients of steps that
    /// already completed are kept.
    pub fn calibrate_all(&mut self) -> Result<CalibrationOutcome> {
        self.ensure_ready()?;
        self.cancel.reset();
        self.calibrate_sequence(&Procedure::PIPELINE)
    }

    /// Run `procedures` in the given order, stopping at the first error or
    /// cancellation.
    ///
    /// Unlike [`calibrate`](Self::calibrate) this does not clear the cancel
    /// flag: a cancel requested before the call, or between two steps, stops
    /// the sequence before the next step enters calibration mode. The flag is
    /// cleared once the cancellation has been reported.
    pub fn calibrate_sequence(&mut self, procedures: &[Procedure]) -> Result<CalibrationOutcome> {
        self.ensure_ready()?;

        for (device, temp) in self.device_temperatures() {
            info!("{} temperature: {:.1} °C", device, temp);
        }

        let mut warnings = Vec::new();
        for &procedure in procedures {
            if self.cancel.is_cancelled() {
                info!("{} cancelled before start", procedure);
                self.cancel.reset();
                self.state = EngineState::Cancelled;
                return Ok(CalibrationOutcome::Cancelled { procedure });
            }
            match self.run_step(procedure)? {
                CalibrationOutcome::Completed { warnings: w } => warnings.extend(w),
                cancelled => {
                    self.cancel.reset();
                    return Ok(cancelled);
                }
            }
        }

        info!("Calibration complete: {:?}", self.coefficients);
        Ok(CalibrationOutcome::Completed { warnings })
    }

    /// Run a single procedure.
    pub fn calibrate(&mut self, procedure: Procedure) -> Result<CalibrationOutcome> {
        self.cancel.reset();
        self.run_step(procedure)
    }

    /// Measure the zero-volt ADC reading and store its negation.
    pub fn calibrate_adc_offset(&mut self) -> Result<CalibrationOutcome> {
        self.calibrate(Procedure::OffsetAdc)
    }

    /// Measure both reference voltages and store the ADC gain.
    pub fn calibrate_adc_gain(&mut self) -> Result<CalibrationOutcome> {
        self.calibrate(Procedure::GainAdc)
    }

    /// Search the DAC codes that read back as zero volts.
    pub fn calibrate_dac_offset(&mut self) -> Result<CalibrationOutcome> {
        self.calibrate(Procedure::OffsetDac)
    }

    /// Measure volts per DAC code through the calibrated ADC.
    pub fn calibrate_dac_gain(&mut self) -> Result<CalibrationOutcome> {
        self.calibrate(Procedure::GainDac)
    }

    fn run_step(&mut self, procedure: Procedure) -> Result<CalibrationOutcome> {
        let cancelled = CalibrationOutcome::Cancelled { procedure };
        match procedure {
            Procedure::OffsetAdc => {
                let Some(offsets) = self.run_procedure(procedure, Self::measure_adc_offset)? else {
                    return Ok(cancelled);
                };
                self.coefficients.adc_offset = offsets;
                info!("ADC offsets: {:?}", offsets);
                Ok(CalibrationOutcome::completed())
            }
            Procedure::GainAdc => {
                let Some(gains) = self.run_procedure(procedure, Self::measure_adc_gain)? else {
                    return Ok(cancelled);
                };
                self.coefficients.adc_gain = gains;
                info!("ADC gains: {:?}", gains);
                Ok(CalibrationOutcome::completed())
            }
            Procedure::OffsetDac => {
                let Some((offsets, warnings)) =
                    self.run_procedure(procedure, Self::measure_dac_offset)?
                else {
                    return Ok(cancelled);
                };
                self.coefficients.dac_offset = offsets;
                info!("DAC offsets: {:?}", offsets);
                Ok(CalibrationOutcome::Completed { warnings })
            }
            Procedure::GainDac => {
                let Some(vlsb) = self.run_procedure(procedure, Self::measure_dac_gain)? else {
                    return Ok(cancelled);
                };
                self.coefficients.dac_vlsb = vlsb;
                info!("DAC volts/LSB: {:?}", vlsb);
                Ok(CalibrationOutcome::completed())
            }
        }
    }

    fn measure_adc_offset(&mut self) -> Result<[i32; CHANNELS]> {
        self.write_calibration_mode(CalibrationMode::AdcGround)?;
        let means = self.measure_adc(self.settings.offset_samples)?;
        Ok(means.map(|mean| -(mean.round() as i32)))
    }

    fn measure_adc_gain(&mut self) -> Result<[f64; CHANNELS]> {
        let samples = self.settings.gain_samples;

        self.write_calibration_mode(CalibrationMode::AdcRef1)?;
        let ref1 = self.measure_adc_corrected(samples)?;
        self.write_calibration_mode(CalibrationMode::AdcRef2)?;
        let ref2 = self.measure_adc_corrected(samples)?;

        let dv = self.settings.reference2_volts - self.settings.reference1_volts;
        let mut gains = [1.0; CHANNELS];
        for ch in 0..CHANNELS {
            let delta = ref2[ch] - ref1[ch];
            let gain = dv / delta;
            let usable = gain.is_finite() && gain > 0.0;
            if delta.abs() < self.settings.min_reference_delta || !usable {
                return Err(CalibrationError::DegenerateReference {
                    procedure: Procedure::GainAdc,
                    channel: ch,
                    delta,
                });
            }
            gains[ch] = gain;
        }
        Ok(gains)
    }

    fn measure_dac_offset(&mut self) -> Result<([i32; CHANNELS], Vec<CalibrationWarning>)> {
        self.write_calibration_mode(CalibrationMode::Dac)?;

        let request = FineTuneRequest {
            start: [0; CHANNELS],
            span: self.settings.fine_tune_span,
            targets: [0.0; CHANNELS],
            samples: self.settings.dac_samples,
            tolerance: self.settings.fine_tune_tolerance,
            max_iterations: self.settings.fine_tune_max_iterations,
        };

        let mut loopback = EngineLoopback {
            hw: self.hw.as_ref(),
            dacs: &mut self.dacs,
            settings: &self.settings,
            adc_offset: self.coefficients.adc_offset,
            cancel: &self.cancel,
        };

        match fine_tune(&mut loopback, &self.cancel, &request)? {
            FineTuneOutcome::Converged { codes, .. } => Ok((codes.map(i32::from), Vec::new())),
            FineTuneOutcome::NotConverged {
                codes, residuals, ..
            } => {
                let warnings = (0..CHANNELS)
                    .filter(|&ch| residuals[ch] > request.tolerance)
                    .map(|ch| CalibrationWarning::NotConverged {
                        procedure: Procedure::OffsetDac,
                        channel: ch,
                        code: codes[ch],
                        residual: residuals[ch],
                    })
                    .collect::<Vec<_>>();
                for warning in &warnings {
                    warn!("{}", warning);
                }
                Ok((codes.map(i32::from), warnings))
            }
            FineTuneOutcome::Cancelled => Err(CalibrationError::Cancelled),
        }
    }

    fn measure_dac_gain(&mut self) -> Result<[f64; CHANNELS]> {
        self.write_calibration_mode(CalibrationMode::Dac)?;

        let delta = i32::from(self.settings.dac_gain_delta);
        let offsets = self.coefficients.dac_offset;
        let low = offsets.map(|o| clamp_raw(f64::from(o - delta)));
        let high = offsets.map(|o| clamp_raw(f64::from(o + delta)));
        let adc_gain = self.coefficients.adc_gain;
        let samples = self.settings.dac_samples;

        let mut loopback = EngineLoopback {
            hw: self.hw.as_ref(),
            dacs: &mut self.dacs,
            settings: &self.settings,
            adc_offset: self.coefficients.adc_offset,
            cancel: &self.cancel,
        };

        loopback.drive(low)?;
        let reading_low = loopback.measure(samples)?;
        loopback.drive(high)?;
        let reading_high = loopback.measure(samples)?;

        let mut vlsb = [1.0; CHANNELS];
        for ch in 0..CHANNELS {
            let raw_delta = reading_high[ch] - reading_low[ch];
            let volts = raw_delta * adc_gain[ch];
            let codes = f64::from(high[ch]) - f64::from(low[ch]);
            let value = volts / codes;
            if raw_delta.abs() < self.settings.min_reference_delta
                || !(value.is_finite() && value > 0.0)
            {
                return Err(CalibrationError::DegenerateReference {
                    procedure: Procedure::GainDac,
                    channel: ch,
                    delta: raw_delta,
                });
            }
            vlsb[ch] = value;
        }
        Ok(vlsb)
    }

    fn measure_adc(&self, samples: usize) -> Result<[f64; CHANNELS]> {
        if self.cancel.is_cancelled() {
            return Err(CalibrationError::Cancelled);
        }
        let layout = self.layout();
        capture_averages(
            self.hw.as_ref(),
            &layout.adc,
            [layout.adc_channels[0].as_str(), layout.adc_channels[1].as_str()],
            samples,
        )
    }

    fn measure_adc_corrected(&self, samples: usize) -> Result<[f64; CHANNELS]> {
        let means = self.measure_adc(samples)?;
        Ok([AdcChannel::Ch0, AdcChannel::Ch1]
            .map(|ch| self.coefficients.correct_adc(ch, means[ch.index()])))
    }

    // -------------------------------------------------------------------------
    // Cancellation and coefficients
    // -------------------------------------------------------------------------

    /// Ask the running procedure to stop at its next capture, drive or
    /// search iteration.
    pub fn cancel_calibration(&self) {
        info!("Calibration cancel requested");
        self.cancel.cancel();
    }

    /// Token sharing the engine's cancellation flag, for use from another
    /// thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Reset every coefficient to identity.
    pub fn reset_calibration(&mut self) -> Result<()> {
        self.ensure_ready()?;
        self.coefficients = CorrectionCoefficients::identity();
        self.completed = [false; 4];
        self.state = EngineState::Initialized;
        info!("Calibration reset to identity");
        Ok(())
    }

    /// Push the current coefficients to the hardware so that live
    /// acquisition and generation use them.
    pub fn update_corrections(&self) -> Result<()> {
        self.ensure_ready()?;
        let layout = self.layout();
        let c = &self.coefficients;

        for (i, ch) in layout.adc_channels.iter().enumerate() {
            let ch = Some(ch.as_str());
            self.hw
                .write_attr(&layout.adc, ch, ATTR_CALIBBIAS, &c.adc_offset[i].to_string())?;
            self.hw
                .write_attr(&layout.adc, ch, ATTR_CALIBSCALE, &c.adc_gain[i].to_string())?;
        }
        for (i, dac) in [&layout.dac_a, &layout.dac_b].into_iter().enumerate() {
            let ch = Some(layout.dac_channel.as_str());
            self.hw
                .write_attr(dac, ch, ATTR_CALIBBIAS, &c.dac_offset[i].to_string())?;
            self.hw
                .write_attr(dac, ch, ATTR_CALIBSCALE, &c.dac_vlsb[i].to_string())?;
        }

        debug!("Corrections pushed to hardware");
        Ok(())
    }

    /// Current coefficients.
    pub fn coefficients(&self) -> &CorrectionCoefficients {
        &self.coefficients
    }

    /// ADC channel 0 offset.
    pub fn adc_offset_channel0(&self) -> i32 {
        self.coefficients.adc_offset[0]
    }

    /// ADC channel 1 offset.
    pub fn adc_offset_channel1(&self) -> i32 {
        self.coefficients.adc_offset[1]
    }

    /// ADC channel 0 gain.
    pub fn adc_gain_channel0(&self) -> f64 {
        self.coefficients.adc_gain[0]
    }

    /// ADC channel 1 gain.
    pub fn adc_gain_channel1(&self) -> f64 {
        self.coefficients.adc_gain[1]
    }

    /// DAC A offset.
    pub fn dac_a_offset(&self) -> i32 {
        self.coefficients.dac_offset[0]
    }

    /// DAC B offset.
    pub fn dac_b_offset(&self) -> i32 {
        self.coefficients.dac_offset[1]
    }

    /// DAC A volts per LSB.
    pub fn dac_a_vlsb(&self) -> f64 {
        self.coefficients.dac_vlsb[0]
    }

    /// DAC B volts per LSB.
    pub fn dac_b_vlsb(&self) -> f64 {
        self.coefficients.dac_vlsb[1]
    }

    // -------------------------------------------------------------------------
    // Hardware configuration hooks
    // -------------------------------------------------------------------------

    /// Select a calibration switch configuration.
    pub fn set_calibration_mode(&mut self, mode: CalibrationMode) -> Result<()> {
        self.ensure_ready()?;
        self.write_calibration_mode(mode)
    }

    /// Currently selected calibration mode.
    pub fn calibration_mode(&self) -> CalibrationMode {
        self.mode
    }

    fn write_calibration_mode(&mut self, mode: CalibrationMode) -> Result<()> {
        let fabric = self.settings.layout.fabric.clone();
        self.hw
            .write_attr(&fabric, None, ATTR_CALIBRATION_MODE, mode.attr_value())?;
        self.mode = mode;
        debug!("Calibration mode: {:?}", mode);
        Ok(())
    }

    /// Select the attenuation path of an ADC channel.
    pub fn set_gain_mode(&self, channel: AdcChannel, mode: GainMode) -> Result<()> {
        self.ensure_ready()?;
        let layout = self.layout();
        self.hw.write_attr(
            &layout.fabric,
            Some(layout.adc_channels[channel.index()].as_str()),
            ATTR_GAIN,
            mode.attr_value(),
        )?;
        debug!("{:?} gain mode: {:?}", channel, mode);
        Ok(())
    }

    /// Enable or disable a streaming channel.
    pub fn set_channel_enable_state(
        &self,
        device: &str,
        channel: &str,
        output: bool,
        enabled: bool,
    ) -> Result<()> {
        self.hw
            .set_channel_enabled(device, channel, output, enabled)
            .map_err(Into::into)
    }

    /// Die temperature of a device in °C. Diagnostic only.
    pub fn device_temperature(&self, device: &str) -> Result<f64> {
        self.hw.device_temperature(device).map_err(Into::into)
    }

    /// Temperatures of the ADC and both DACs that could be read.
    pub fn device_temperatures(&self) -> Vec<(String, f64)> {
        let layout = self.layout();
        [&layout.adc, &layout.dac_a, &layout.dac_b]
            .into_iter()
            .filter_map(|device| match self.hw.device_temperature(device) {
                Ok(temp) => Some((device.clone(), temp)),
                Err(err) => {
                    debug!("No temperature for {}: {}", device, err);
                    None
                }
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // DAC output
    // -------------------------------------------------------------------------

    /// Drive a raw DC code on a DAC output.
    pub fn dac_output_dc(&mut self, channel: DacChannel, raw: i16) -> Result<()> {
        self.ensure_ready()?;
        let ch = channel.index();
        let device = self.dacs[ch].device().to_string();
        self.hw.write_attr(
            &device,
            Some(self.settings.layout.dac_channel.as_str()),
            ATTR_POWERDOWN,
            "0",
        )?;
        self.dacs[ch].output_dc(self.hw.as_ref(), raw)
    }

    /// Drive a DC voltage on a DAC output using the calibrated offset and
    /// volts per LSB.
    pub fn dac_output_dc_volts(&mut self, channel: DacChannel, volts: f64) -> Result<()> {
        let ch = channel.index();
        let raw = self.coefficients.dac_offset[ch] as f64 + volts / self.coefficients.dac_vlsb[ch];
        self.dac_output_dc(channel, clamp_raw(raw))
    }

    /// Release both DAC buffers.
    pub fn dac_output_stop(&mut self) {
        self.stop_dacs();
    }

    /// Release both DAC buffers and power the outputs down.
    pub fn turn_dac_output_off(&mut self) -> Result<()> {
        self.stop_dacs();
        self.set_dac_powerdown(true)
    }

    fn stop_dacs(&mut self) {
        for dac in &mut self.dacs {
            dac.stop(self.hw.as_ref());
        }
    }

    fn set_dac_powerdown(&self, powerdown: bool) -> Result<()> {
        let layout = self.layout();
        let value = if powerdown { "1" } else { "0" };
        for dac in [&layout.dac_a, &layout.dac_b] {
            self.hw
                .write_attr(dac, Some(layout.dac_channel.as_str()), ATTR_POWERDOWN, value)?;
        }
        Ok(())
    }
}

impl Drop for CalibrationEngine {
    fn drop(&mut self) {
        self.stop_dacs();
    }
}

/// Drive/measure adapter over the engine's hardware for the fine-tune search
/// and the DAC gain measurement.
struct EngineLoopback<'a> {
    hw: &'a dyn HardwareHandle,
    dacs: &'a mut [DacOutput; CHANNELS],
    settings: &'a CalibrationSettings,
    adc_offset: [i32; CHANNELS],
    cancel: &'a CancelToken,
}

impl DacLoopback for EngineLoopback<'_> {
    fn drive(&mut self, codes: [i16; CHANNELS]) -> Result<()> {
        for (dac, code) in self.dacs.iter_mut().zip(codes) {
            if self.cancel.is_cancelled() {
                return Err(CalibrationError::Cancelled);
            }
            dac.output_dc(self.hw, code)?;
        }
        let settle = self.settings.dac_settle();
        if !settle.is_zero() {
            std::thread::sleep(settle);
        }
        Ok(())
    }

    fn measure(&mut self, samples: usize) -> Result<[f64; CHANNELS]> {
        if self.cancel.is_cancelled() {
            return Err(CalibrationError::Cancelled);
        }
        let layout = &self.settings.layout;
        let means = capture_averages(
            self.hw,
            &layout.adc,
            [layout.adc_channels[0].as_str(), layout.adc_channels[1].as_str()],
            samples,
        )?;
        Ok([0, 1].map(|ch| means[ch] + self.adc_offset[ch] as f64))
    }
}
