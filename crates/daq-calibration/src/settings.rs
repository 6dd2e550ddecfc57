//! Tunable calibration constants and device naming.
//!
//! Sample counts, search budgets and reference voltages depend on the noise
//! characteristics of the target hardware, so they are configuration rather
//! than constants. Defaults match an ADALM2000 on a quiet bench.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Logical names of the devices and channels the engine drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceLayout {
    /// Two-channel ADC
    pub adc: String,
    /// ADC trigger block (per-channel trigger mode)
    pub adc_trigger: String,
    /// DAC driving output A
    pub dac_a: String,
    /// DAC driving output B
    pub dac_b: String,
    /// Fabric device holding the calibration switch matrix and gain relays
    pub fabric: String,
    /// Input channel names on the ADC, in channel order
    pub adc_channels: [String; 2],
    /// Output channel name on each DAC device
    pub dac_channel: String,
}

impl Default for DeviceLayout {
    fn default() -> Self {
        Self {
            adc: "m2k-adc".to_string(),
            adc_trigger: "m2k-adc-trigger".to_string(),
            dac_a: "m2k-dac-a".to_string(),
            dac_b: "m2k-dac-b".to_string(),
            fabric: "m2k-fabric".to_string(),
            adc_channels: ["voltage0".to_string(), "voltage1".to_string()],
            dac_channel: "voltage0".to_string(),
        }
    }
}

/// Calibration tuning parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    /// Device and channel names
    pub layout: DeviceLayout,

    /// ADC sample rate used during calibration (Hz)
    pub adc_sample_rate: f64,
    /// ADC oversampling ratio used during calibration
    pub adc_oversampling: u32,
    /// DAC sample rate used during calibration (Hz)
    pub dac_sample_rate: f64,
    /// DAC oversampling ratio used during calibration
    pub dac_oversampling: u32,

    /// Samples averaged per channel for the ADC offset
    pub offset_samples: usize,
    /// Samples averaged per channel at each ADC reference
    pub gain_samples: usize,
    /// Samples averaged per channel for each DAC measurement
    pub dac_samples: usize,

    /// Voltage presented to the ADC in `AdcRef1` mode (V)
    pub reference1_volts: f64,
    /// Voltage presented to the ADC in `AdcRef2` mode (V)
    pub reference2_volts: f64,
    /// Smallest raw difference between two reference readings that still
    /// yields a usable gain
    pub min_reference_delta: f64,

    /// Width of the DAC code interval searched for the DAC offset
    pub fine_tune_span: u16,
    /// Accepted residual of the fine-tune search, in ADC raw units
    pub fine_tune_tolerance: f64,
    /// Iteration budget of the fine-tune search
    pub fine_tune_max_iterations: u32,

    /// Distance from the DAC offset of the two codes driven for DAC gain
    pub dac_gain_delta: u16,

    /// Wait after every DAC drive before capturing (ms)
    pub dac_settle_ms: u64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            layout: DeviceLayout::default(),
            adc_sample_rate: 1e8,
            adc_oversampling: 1,
            dac_sample_rate: 75e6,
            dac_oversampling: 1,
            offset_samples: 16384,
            gain_samples: 16384,
            dac_samples: 4096,
            reference1_volts: 1.0,
            reference2_volts: -1.0,
            min_reference_delta: 1.0,
            fine_tune_span: 1024,
            fine_tune_tolerance: 0.5,
            fine_tune_max_iterations: 16,
            dac_gain_delta: 1024,
            dac_settle_ms: 10,
        }
    }
}

impl CalibrationSettings {
    /// Settle delay as a [`Duration`].
    pub fn dac_settle(&self) -> Duration {
        Duration::from_millis(self.dac_settle_ms)
    }

    /// Check the settings for values the procedures cannot work with.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.offset_samples == 0 || self.gain_samples == 0 || self.dac_samples == 0 {
            return Err("sample counts must be greater than zero".to_string());
        }
        if (self.reference1_volts - self.reference2_volts).abs() < f64::EPSILON {
            return Err("reference voltages must differ".to_string());
        }
        if self.fine_tune_span == 0 || self.fine_tune_max_iterations == 0 {
            return Err("fine-tune span and iteration budget must be non-zero".to_string());
        }
        if self.fine_tune_tolerance < 0.0 {
            return Err("fine-tune tolerance must not be negative".to_string());
        }
        if self.dac_gain_delta == 0 {
            return Err("DAC gain delta must be non-zero".to_string());
        }
        if self.adc_sample_rate <= 0.0 || self.dac_sample_rate <= 0.0 {
            return Err("sample rates must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(CalibrationSettings::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_equal_references() {
        let settings = CalibrationSettings {
            reference1_volts: 0.5,
            reference2_volts: 0.5,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let settings: CalibrationSettings =
            serde_json::from_str(r#"{"offset_samples": 100, "layout": {"adc": "adc0"}}"#)
                .unwrap();
        assert_eq!(settings.offset_samples, 100);
        assert_eq!(settings.layout.adc, "adc0");
        assert_eq!(settings.layout.dac_a, "m2k-dac-a");
        assert_eq!(settings.gain_samples, 16384);
    }
}
