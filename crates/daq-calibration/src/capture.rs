//! Synchronous two-channel capture and averaging.
//!
//! Every voltage measurement the engine makes goes through
//! [`capture_averages`]; single raw samples are never trusted.

use tracing::debug;

use crate::error::{CalibrationError, Result};
use crate::hardware::HardwareHandle;
use crate::CHANNELS;

/// Arithmetic mean of raw samples.
///
/// The sum is accumulated in `i64`, wide enough for any capture length the
/// hardware supports. An empty slice averages to 0.0.
pub fn average(data: &[i16]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let sum: i64 = data.iter().map(|&s| i64::from(s)).sum();
    sum as f64 / data.len() as f64
}

/// Capture `count` samples from both `channels` of `device` and return the
/// per-channel means.
///
/// Fails with [`CalibrationError::Capture`] on transport errors, when a
/// channel is missing from the result, or when fewer than `count` samples
/// arrive on any channel.
pub fn capture_averages(
    hw: &dyn HardwareHandle,
    device: &str,
    channels: [&str; CHANNELS],
    count: usize,
) -> Result<[f64; CHANNELS]> {
    if count == 0 {
        return Err(CalibrationError::Capture {
            message: "requested zero samples".to_string(),
        });
    }

    let data = hw
        .capture(device, &channels, count)
        .map_err(CalibrationError::capture)?;

    if data.len() < CHANNELS {
        return Err(CalibrationError::Capture {
            message: format!(
                "expected {} channels from {}, got {}",
                CHANNELS,
                device,
                data.len()
            ),
        });
    }

    let mut means = [0.0; CHANNELS];
    for (ch, samples) in data.iter().take(CHANNELS).enumerate() {
        if samples.len() < count {
            return Err(CalibrationError::Capture {
                message: format!(
                    "{}/{}: expected {} samples, got {}",
                    device,
                    channels[ch],
                    count,
                    samples.len()
                ),
            });
        }
        means[ch] = average(&samples[..count]);
    }

    debug!(
        "Captured {} samples from {}: means = [{:.3}, {:.3}]",
        count, device, means[0], means[1]
    );
    Ok(means)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{SimulatedM2k, SimulationConfig};

    #[test]
    fn test_average_identical_values() {
        for v in [-2048_i16, -3, 0, 5, 2047] {
            let data = vec![v; 4096];
            assert_eq!(average(&data), v as f64);
        }
    }

    #[test]
    fn test_average_symmetric_pair() {
        assert_eq!(average(&[1234, -1234]), 0.0);
        assert_eq!(average(&[i16::MAX, -i16::MAX]), 0.0);
    }

    #[test]
    fn test_average_does_not_overflow() {
        let data = vec![i16::MAX; 1 << 20];
        assert_eq!(average(&data), i16::MAX as f64);
    }

    #[test]
    fn test_average_empty() {
        assert_eq!(average(&[]), 0.0);
    }

    #[test]
    fn test_capture_averages_ground() {
        let config = SimulationConfig {
            adc_offset: [12, -7],
            noise_lsb: 0.0,
            ..Default::default()
        };
        let hw = SimulatedM2k::new(config);
        let means =
            capture_averages(&hw, "m2k-adc", ["voltage0", "voltage1"], 1024).unwrap();
        assert_eq!(means, [12.0, -7.0]);
    }

    #[test]
    fn test_capture_short_read_is_error() {
        let hw = SimulatedM2k::default();
        hw.set_short_capture(Some(10));
        let err =
            capture_averages(&hw, "m2k-adc", ["voltage0", "voltage1"], 100).unwrap_err();
        assert!(matches!(err, CalibrationError::Capture { .. }));
        assert!(err.to_string().contains("expected 100 samples, got 10"));
    }

    #[test]
    fn test_capture_transport_error() {
        let hw = SimulatedM2k::default();
        hw.fail_next_captures(1);
        let err =
            capture_averages(&hw, "m2k-adc", ["voltage0", "voltage1"], 100).unwrap_err();
        assert!(matches!(err, CalibrationError::Capture { .. }));
    }

    #[test]
    fn test_capture_zero_count() {
        let hw = SimulatedM2k::default();
        assert!(capture_averages(&hw, "m2k-adc", ["voltage0", "voltage1"], 0).is_err());
    }
}
