//! DC output on a DAC channel through a cyclic buffer.

use tracing::{debug, warn};

use crate::error::{CalibrationError, Result};
use crate::hardware::{BufferId, HardwareHandle};

/// Length of the repeating pattern played to hold a constant output.
pub const DC_BUFFER_SAMPLES: usize = 256;

/// Drives a constant raw value on one DAC output.
///
/// Owns at most one live cyclic buffer. Requesting a different value releases
/// the old buffer before the new one starts, and [`DacOutput::stop`] releases
/// it for good so nothing keeps being driven after calibration.
#[derive(Debug)]
pub struct DacOutput {
    device: String,
    channel: String,
    buffer: Option<BufferId>,
    value: Option<i16>,
}

impl DacOutput {
    /// Create an idle output on `device/channel`.
    pub fn new(device: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            channel: channel.into(),
            buffer: None,
            value: None,
        }
    }

    /// Device name this output drives.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Raw value currently played, if any.
    pub fn value(&self) -> Option<i16> {
        self.value
    }

    /// Whether a buffer is currently live.
    pub fn is_active(&self) -> bool {
        self.buffer.is_some()
    }

    /// Output `value` continuously.
    pub fn output_dc(&mut self, hw: &dyn HardwareHandle, value: i16) -> Result<()> {
        if self.buffer.is_some() && self.value == Some(value) {
            return Ok(());
        }

        self.stop(hw);

        hw.set_channel_enabled(&self.device, &self.channel, true, true)
            .map_err(CalibrationError::driver)?;

        let buffer = hw
            .create_output_buffer(&self.device, &self.channel, DC_BUFFER_SAMPLES, true)
            .map_err(CalibrationError::driver)?;

        let pattern = [value; DC_BUFFER_SAMPLES];
        if let Err(err) = hw.push_output_buffer(buffer, &pattern) {
            hw.destroy_output_buffer(buffer);
            warn!("{}: failed to push DC buffer: {}", self.device, err);
            return Err(CalibrationError::driver(err));
        }

        debug!("{}: driving DC raw {}", self.device, value);
        self.buffer = Some(buffer);
        self.value = Some(value);
        Ok(())
    }

    /// Release the live buffer, if any.
    pub fn stop(&mut self, hw: &dyn HardwareHandle) {
        if let Some(buffer) = self.buffer.take() {
            hw.destroy_output_buffer(buffer);
            debug!("{}: released {}", self.device, buffer);
        }
        self.value = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedM2k;

    #[test]
    fn test_output_dc_fills_buffer() {
        let hw = SimulatedM2k::default();
        let mut dac = DacOutput::new("m2k-dac-a", "voltage0");

        dac.output_dc(&hw, 321).unwrap();
        assert!(dac.is_active());
        assert_eq!(dac.value(), Some(321));
        assert_eq!(hw.dac_value(0), Some(321));
        assert_eq!(hw.live_buffers(), 1);
    }

    #[test]
    fn test_same_value_reuses_buffer() {
        let hw = SimulatedM2k::default();
        let mut dac = DacOutput::new("m2k-dac-a", "voltage0");

        dac.output_dc(&hw, 10).unwrap();
        dac.output_dc(&hw, 10).unwrap();
        assert_eq!(hw.dac_push_count(), 1);
    }

    #[test]
    fn test_new_value_replaces_buffer() {
        let hw = SimulatedM2k::default();
        let mut dac = DacOutput::new("m2k-dac-b", "voltage0");

        dac.output_dc(&hw, 10).unwrap();
        dac.output_dc(&hw, -10).unwrap();
        assert_eq!(hw.live_buffers(), 1);
        assert_eq!(hw.dac_value(1), Some(-10));
    }

    #[test]
    fn test_stop_releases_buffer() {
        let hw = SimulatedM2k::default();
        let mut dac = DacOutput::new("m2k-dac-a", "voltage0");

        dac.output_dc(&hw, 5).unwrap();
        dac.stop(&hw);
        assert!(!dac.is_active());
        assert_eq!(hw.live_buffers(), 0);
        assert_eq!(hw.dac_value(0), None);

        // Stopping twice is harmless
        dac.stop(&hw);
    }

    #[test]
    fn test_buffer_failure_is_driver_error() {
        let hw = SimulatedM2k::default();
        hw.fail_next_buffers(1);
        let mut dac = DacOutput::new("m2k-dac-a", "voltage0");

        let err = dac.output_dc(&hw, 5).unwrap_err();
        assert!(matches!(err, CalibrationError::Driver { .. }));
        assert!(!dac.is_active());
        assert_eq!(hw.live_buffers(), 0);
    }
}
