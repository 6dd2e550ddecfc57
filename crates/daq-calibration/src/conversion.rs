//! Raw sample <-> volts conversion.
//!
//! Pure functions, safe to call without an initialized engine.

use crate::{RAW_MAX, RAW_MIN};

/// Volts represented by one raw ADC unit at the nominal full scale
/// (0.78 V reference across 2^11 codes behind a 1.3x front-end gain).
pub const ADC_VOLTS_PER_LSB: f64 = 0.78 / ((1 << 11) as f64 * 1.3);

/// Gain correction meaning "uncorrected".
pub const UNITY_GAIN: f64 = 1.0;

/// Convert a raw ADC value to volts.
///
/// `volts = raw * ADC_VOLTS_PER_LSB / gain`, with `gain` defaulting to 1.0.
///
/// `gain` is a dimensionless correction around 1.0. It is not the calibrated
/// `CorrectionCoefficients::adc_gain`, which is already in volts per raw unit;
/// use `CorrectionCoefficients::corrected_volts` for calibrated readings.
pub fn sample_to_volts(raw: f64, gain: Option<f64>) -> f64 {
    raw * ADC_VOLTS_PER_LSB / gain.unwrap_or(UNITY_GAIN)
}

/// Convert volts to the nearest representable raw ADC value.
///
/// Exact inverse of [`sample_to_volts`], rounded and clamped to the 12-bit
/// signed range.
pub fn volts_to_sample(volts: f64, gain: Option<f64>) -> i16 {
    let raw = (volts * gain.unwrap_or(UNITY_GAIN) / ADC_VOLTS_PER_LSB).round();
    clamp_raw(raw)
}

/// Round and clamp a floating-point raw value to the converter range.
pub(crate) fn clamp_raw(raw: f64) -> i16 {
    if raw.is_nan() {
        return 0;
    }
    raw.round().clamp(RAW_MIN as f64, RAW_MAX as f64) as i16
}
