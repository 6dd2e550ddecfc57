//! In-process M2K simulation implementing [`HardwareHandle`].
//!
//! The simulated instrument has configurable true offsets and gains, so a
//! calibration run against it has a known answer. It provides:
//! - Switch-matrix physics driven by the fabric `calibration_mode` attribute
//! - Seeded uniform noise (reproducible captures)
//! - Call logging for test verification
//! - Failure injection for captures, buffers and attribute writes
//! - A cancel trigger after a given number of DAC pushes

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::engine::CalibrationMode;
use crate::hardware::{BufferId, HardwareError, HardwareHandle, HwResult};
use crate::settings::DeviceLayout;
use crate::{CHANNELS, RAW_MAX, RAW_MIN};

/// True electrical parameters of the simulated instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Device and channel names
    pub layout: DeviceLayout,
    /// Raw ADC reading at zero volts
    pub adc_offset: [i32; CHANNELS],
    /// Volts per raw ADC unit
    pub adc_volts_per_lsb: [f64; CHANNELS],
    /// DAC code that produces zero volts
    pub dac_offset: [i32; CHANNELS],
    /// Volts per DAC code
    pub dac_volts_per_lsb: [f64; CHANNELS],
    /// Reference voltages in `AdcRef1` and `AdcRef2` mode
    pub reference_volts: [f64; 2],
    /// Peak amplitude of uniform noise added before quantization, raw units
    pub noise_lsb: f64,
    /// RNG seed
    pub seed: u64,
    /// Reported die temperature (°C)
    pub temperature_c: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            layout: DeviceLayout::default(),
            adc_offset: [12, -7],
            adc_volts_per_lsb: [0.00101, 0.00099],
            dac_offset: [25, -31],
            dac_volts_per_lsb: [0.00098, 0.00102],
            reference_volts: [1.0, -1.0],
            noise_lsb: 2.0,
            seed: 0x5eed,
            temperature_c: 42.5,
        }
    }
}

type AttrKey = (String, Option<String>, String);

#[derive(Debug)]
struct SimBuffer {
    dac: usize,
    value: Option<i16>,
}

#[derive(Debug)]
struct SimState {
    attrs: HashMap<AttrKey, String>,
    buffers: HashMap<u64, SimBuffer>,
    next_buffer: u64,
    push_count: usize,
    enabled: HashSet<(String, String, bool)>,
    call_log: Vec<String>,
    rng: ChaCha8Rng,
    fail_captures: usize,
    fail_buffers: usize,
    fail_capture_mode: Option<CalibrationMode>,
    fail_write_attr: Option<String>,
    short_capture: Option<usize>,
    cancel_trigger: Option<(usize, CancelToken)>,
}

/// Simulated two-channel ADC / two-DAC instrument.
#[derive(Debug)]
pub struct SimulatedM2k {
    config: SimulationConfig,
    missing: HashSet<String>,
    state: Mutex<SimState>,
}

impl Default for SimulatedM2k {
    fn default() -> Self {
        Self::new(SimulationConfig::default())
    }
}

impl SimulatedM2k {
    /// Create a simulator powered up in the normal signal path.
    pub fn new(config: SimulationConfig) -> Self {
        let layout = &config.layout;
        let mut attrs = HashMap::new();
        let mut set = |device: &str, channel: Option<&str>, attr: &str, value: &str| {
            attrs.insert(
                (
                    device.to_string(),
                    channel.map(str::to_string),
                    attr.to_string(),
                ),
                value.to_string(),
            );
        };

        set(&layout.adc, None, "sampling_frequency", "100000000");
        set(&layout.adc, None, "oversampling_ratio", "1");
        for ch in &layout.adc_channels {
            set(&layout.adc_trigger, Some(ch), "mode", "analog");
            set(&layout.fabric, Some(ch), "gain", "low");
        }
        for dac in [&layout.dac_a, &layout.dac_b] {
            set(dac, None, "sampling_frequency", "75000000");
            set(dac, None, "oversampling_ratio", "1");
            set(dac, Some(&layout.dac_channel), "powerdown", "0");
        }
        set(&layout.fabric, None, "calibration_mode", "none");

        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self {
            config,
            missing: HashSet::new(),
            state: Mutex::new(SimState {
                attrs,
                buffers: HashMap::new(),
                next_buffer: 1,
                push_count: 0,
                enabled: HashSet::new(),
                call_log: Vec::new(),
                rng,
                fail_captures: 0,
                fail_buffers: 0,
                fail_capture_mode: None,
                fail_write_attr: None,
                short_capture: None,
                cancel_trigger: None,
            }),
        }
    }

    /// Remove a device, as if it were not enumerated.
    pub fn without_device(mut self, device: &str) -> Self {
        self.missing.insert(device.to_string());
        self
    }

    /// Simulation parameters.
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Fail the next `n` captures with a transport error.
    pub fn fail_next_captures(&self, n: usize) {
        self.state.lock().fail_captures = n;
    }

    /// Fail every capture taken while the switch matrix is in `mode`.
    pub fn fail_captures_in_mode(&self, mode: Option<CalibrationMode>) {
        self.state.lock().fail_capture_mode = mode;
    }

    /// Return at most `n` samples per channel from every capture.
    pub fn set_short_capture(&self, n: Option<usize>) {
        self.state.lock().short_capture = n;
    }

    /// Fail the next `n` output buffer allocations.
    pub fn fail_next_buffers(&self, n: usize) {
        self.state.lock().fail_buffers = n;
    }

    /// Fail every write of the named attribute.
    pub fn fail_attr_writes(&self, attr: &str) {
        self.state.lock().fail_write_attr = Some(attr.to_string());
    }

    /// Cancel `token` once `pushes` DAC buffers have been pushed in total.
    pub fn cancel_after_dac_pushes(&self, pushes: usize, token: CancelToken) {
        self.state.lock().cancel_trigger = Some((pushes, token));
    }

    /// Current value of an attribute.
    pub fn attr(&self, device: &str, channel: Option<&str>, attr: &str) -> Option<String> {
        self.state
            .lock()
            .attrs
            .get(&(
                device.to_string(),
                channel.map(str::to_string),
                attr.to_string(),
            ))
            .cloned()
    }

    /// Get the call log
    pub fn call_log(&self) -> Vec<String> {
        self.state.lock().call_log.clone()
    }

    /// Value played on DAC `index` (0 = A, 1 = B), if a buffer is live.
    pub fn dac_value(&self, index: usize) -> Option<i16> {
        let state = self.state.lock();
        state
            .buffers
            .iter()
            .filter(|(_, b)| b.dac == index)
            .max_by_key(|(id, _)| **id)
            .and_then(|(_, b)| b.value)
    }

    /// Number of output buffers not yet destroyed.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Total number of DAC buffer pushes.
    pub fn dac_push_count(&self) -> usize {
        self.state.lock().push_count
    }

    fn device_exists(&self, device: &str) -> bool {
        let layout = &self.config.layout;
        !self.missing.contains(device)
            && [
                &layout.adc,
                &layout.adc_trigger,
                &layout.dac_a,
                &layout.dac_b,
                &layout.fabric,
            ]
            .iter()
            .any(|d| d.as_str() == device)
    }

    fn dac_index(&self, device: &str) -> Option<usize> {
        let layout = &self.config.layout;
        if device == layout.dac_a {
            Some(0)
        } else if device == layout.dac_b {
            Some(1)
        } else {
            None
        }
    }

    fn calibration_mode(state: &SimState, layout: &DeviceLayout) -> CalibrationMode {
        state
            .attrs
            .get(&(layout.fabric.clone(), None, "calibration_mode".to_string()))
            .and_then(|v| CalibrationMode::from_attr_value(v))
            .unwrap_or(CalibrationMode::None)
    }

    /// Voltage at the ADC input of channel `ch` in the current mode.
    fn input_volts(&self, state: &SimState, ch: usize) -> f64 {
        let cfg = &self.config;
        match Self::calibration_mode(state, &cfg.layout) {
            CalibrationMode::AdcRef1 => cfg.reference_volts[0],
            CalibrationMode::AdcRef2 => cfg.reference_volts[1],
            CalibrationMode::AdcGround | CalibrationMode::None => 0.0,
            CalibrationMode::Dac => {
                let device = if ch == 0 { &cfg.layout.dac_a } else { &cfg.layout.dac_b };
                let powered_down = state
                    .attrs
                    .get(&(
                        device.clone(),
                        Some(cfg.layout.dac_channel.clone()),
                        "powerdown".to_string(),
                    ))
                    .is_some_and(|v| v == "1");
                let code = state
                    .buffers
                    .iter()
                    .filter(|(_, b)| b.dac == ch)
                    .max_by_key(|(id, _)| **id)
                    .and_then(|(_, b)| b.value);
                match code {
                    Some(code) if !powered_down => {
                        f64::from(i32::from(code) - cfg.dac_offset[ch]) * cfg.dac_volts_per_lsb[ch]
                    }
                    _ => 0.0,
                }
            }
        }
    }
}

impl HardwareHandle for SimulatedM2k {
    fn has_device(&self, device: &str) -> bool {
        self.device_exists(device)
    }

    fn has_channel(&self, device: &str, channel: &str, output: bool) -> bool {
        if !self.device_exists(device) {
            return false;
        }
        let layout = &self.config.layout;
        if self.dac_index(device).is_some() {
            output && channel == layout.dac_channel
        } else {
            !output && layout.adc_channels.iter().any(|c| c == channel)
        }
    }

    fn read_attr(&self, device: &str, channel: Option<&str>, attr: &str) -> HwResult<String> {
        if !self.device_exists(device) {
            return Err(HardwareError::DeviceNotFound(device.to_string()));
        }
        let state = self.state.lock();
        state
            .attrs
            .get(&(
                device.to_string(),
                channel.map(str::to_string),
                attr.to_string(),
            ))
            .cloned()
            .ok_or_else(|| HardwareError::Attribute {
                target: target_name(device, channel),
                attribute: attr.to_string(),
                message: "no such attribute".to_string(),
            })
    }

    fn write_attr(
        &self,
        device: &str,
        channel: Option<&str>,
        attr: &str,
        value: &str,
    ) -> HwResult<()> {
        if !self.device_exists(device) {
            return Err(HardwareError::DeviceNotFound(device.to_string()));
        }
        let target = target_name(device, channel);
        let mut state = self.state.lock();
        state
            .call_log
            .push(format!("write {} {}={}", target, attr, value));

        let attribute_error = |message: &str| HardwareError::Attribute {
            target: target.clone(),
            attribute: attr.to_string(),
            message: message.to_string(),
        };

        if state.fail_write_attr.as_deref() == Some(attr) {
            return Err(attribute_error("injected failure"));
        }
        if attr == "calibration_mode" && CalibrationMode::from_attr_value(value).is_none() {
            return Err(attribute_error("invalid calibration mode"));
        }

        state.attrs.insert(
            (
                device.to_string(),
                channel.map(str::to_string),
                attr.to_string(),
            ),
            value.to_string(),
        );
        Ok(())
    }

    fn capture(
        &self,
        device: &str,
        channels: &[&str],
        samples_per_channel: usize,
    ) -> HwResult<Vec<Vec<i16>>> {
        let layout = &self.config.layout;
        if !self.device_exists(device) || device != layout.adc {
            return Err(HardwareError::DeviceNotFound(device.to_string()));
        }

        let mut state = self.state.lock();
        state
            .call_log
            .push(format!("capture {} x{}", device, samples_per_channel));

        if state.fail_captures > 0 {
            state.fail_captures -= 1;
            return Err(HardwareError::Transport("injected capture failure".to_string()));
        }
        if let Some(mode) = state.fail_capture_mode {
            if Self::calibration_mode(&state, layout) == mode {
                return Err(HardwareError::Transport(format!(
                    "injected capture failure in {:?}",
                    mode
                )));
            }
        }

        let count = state
            .short_capture
            .map_or(samples_per_channel, |n| n.min(samples_per_channel));
        let noise = self.config.noise_lsb;

        let mut data = Vec::with_capacity(channels.len());
        for name in channels {
            let ch = layout
                .adc_channels
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| HardwareError::ChannelNotFound {
                    device: device.to_string(),
                    channel: name.to_string(),
                })?;

            let analog = f64::from(self.config.adc_offset[ch])
                + self.input_volts(&state, ch) / self.config.adc_volts_per_lsb[ch];
            let samples = (0..count)
                .map(|_| {
                    let n = if noise > 0.0 {
                        state.rng.gen_range(-noise..=noise)
                    } else {
                        0.0
                    };
                    (analog + n)
                        .round()
                        .clamp(f64::from(RAW_MIN), f64::from(RAW_MAX)) as i16
                })
                .collect();
            data.push(samples);
        }
        Ok(data)
    }

    fn create_output_buffer(
        &self,
        device: &str,
        channel: &str,
        len: usize,
        cyclic: bool,
    ) -> HwResult<BufferId> {
        let dac = self
            .dac_index(device)
            .filter(|_| self.device_exists(device))
            .ok_or_else(|| HardwareError::DeviceNotFound(device.to_string()))?;
        if channel != self.config.layout.dac_channel {
            return Err(HardwareError::ChannelNotFound {
                device: device.to_string(),
                channel: channel.to_string(),
            });
        }

        let mut state = self.state.lock();
        if state.fail_buffers > 0 {
            state.fail_buffers -= 1;
            return Err(HardwareError::Buffer("injected allocation failure".to_string()));
        }

        let id = state.next_buffer;
        state.next_buffer += 1;
        state.buffers.insert(id, SimBuffer { dac, value: None });
        state.call_log.push(format!(
            "create {}/{} len={} cyclic={}",
            device, channel, len, cyclic
        ));
        Ok(BufferId(id))
    }

    fn push_output_buffer(&self, buffer: BufferId, data: &[i16]) -> HwResult<()> {
        let mut state = self.state.lock();
        let first = *data
            .first()
            .ok_or_else(|| HardwareError::Buffer("empty push".to_string()))?;
        let slot = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| HardwareError::Buffer(format!("unknown {}", buffer)))?;
        slot.value = Some(first);

        state.push_count += 1;
        state.call_log.push(format!("push {} value={}", buffer, first));

        if let Some((after, token)) = &state.cancel_trigger {
            if state.push_count >= *after {
                debug!("Simulated cancel after {} DAC pushes", state.push_count);
                token.cancel();
            }
        }
        Ok(())
    }

    fn destroy_output_buffer(&self, buffer: BufferId) {
        let mut state = self.state.lock();
        if state.buffers.remove(&buffer.0).is_some() {
            state.call_log.push(format!("destroy {}", buffer));
        }
    }

    fn set_channel_enabled(
        &self,
        device: &str,
        channel: &str,
        output: bool,
        enabled: bool,
    ) -> HwResult<()> {
        if !self.has_channel(device, channel, output) {
            return Err(HardwareError::ChannelNotFound {
                device: device.to_string(),
                channel: channel.to_string(),
            });
        }
        let mut state = self.state.lock();
        let key = (device.to_string(), channel.to_string(), output);
        if enabled {
            state.enabled.insert(key);
        } else {
            state.enabled.remove(&key);
        }
        Ok(())
    }

    fn device_temperature(&self, device: &str) -> HwResult<f64> {
        if !self.device_exists(device) {
            return Err(HardwareError::DeviceNotFound(device.to_string()));
        }
        Ok(self.config.temperature_c)
    }
}

fn target_name(device: &str, channel: Option<&str>) -> String {
    match channel {
        Some(ch) => format!("{}/{}", device, ch),
        None => device.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> SimulatedM2k {
        SimulatedM2k::new(SimulationConfig {
            noise_lsb: 0.0,
            ..Default::default()
        })
    }

    #[test]
    fn test_reference_mode_reading() {
        let hw = quiet();
        hw.write_attr("m2k-fabric", None, "calibration_mode", "adc_ref1")
            .unwrap();
        let data = hw.capture("m2k-adc", &["voltage0", "voltage1"], 8).unwrap();
        // 12 + 1.0 / 0.00101 and -7 + 1.0 / 0.00099
        assert_eq!(data[0][0], 12 + 990);
        assert_eq!(data[1][0], -7 + 1010);
    }

    #[test]
    fn test_dac_loopback_reading() {
        let hw = quiet();
        hw.write_attr("m2k-fabric", None, "calibration_mode", "dac")
            .unwrap();
        let buffer = hw
            .create_output_buffer("m2k-dac-a", "voltage0", 4, true)
            .unwrap();
        hw.push_output_buffer(buffer, &[25; 4]).unwrap();

        let data = hw.capture("m2k-adc", &["voltage0"], 4).unwrap();
        assert_eq!(data[0], vec![12; 4]);

        hw.write_attr("m2k-dac-a", Some("voltage0"), "powerdown", "1")
            .unwrap();
        hw.push_output_buffer(buffer, &[525; 4]).unwrap();
        let data = hw.capture("m2k-adc", &["voltage0"], 4).unwrap();
        assert_eq!(data[0], vec![12; 4]);
    }

    #[test]
    fn test_noise_is_seeded() {
        let a = SimulatedM2k::default();
        let b = SimulatedM2k::default();
        let ca = a.capture("m2k-adc", &["voltage0"], 64).unwrap();
        let cb = b.capture("m2k-adc", &["voltage0"], 64).unwrap();
        assert_eq!(ca, cb);
        assert!(ca[0].iter().any(|&s| s != ca[0][0]));
    }

    #[test]
    fn test_readings_clamp_to_raw_range() {
        let hw = SimulatedM2k::new(SimulationConfig {
            reference_volts: [10.0, -10.0],
            noise_lsb: 0.0,
            ..Default::default()
        });
        hw.write_attr("m2k-fabric", None, "calibration_mode", "adc_ref1")
            .unwrap();
        let data = hw.capture("m2k-adc", &["voltage0"], 1).unwrap();
        assert_eq!(data[0][0], RAW_MAX as i16);
    }

    #[test]
    fn test_unknown_channel_and_device() {
        let hw = SimulatedM2k::default().without_device("m2k-fabric");
        assert!(!hw.has_device("m2k-fabric"));
        assert!(hw.has_channel("m2k-dac-a", "voltage0", true));
        assert!(!hw.has_channel("m2k-dac-a", "voltage0", false));
        assert!(matches!(
            hw.capture("m2k-adc", &["voltage7"], 1),
            Err(HardwareError::ChannelNotFound { .. })
        ));
        assert!(matches!(
            hw.read_attr("m2k-adc", None, "nope"),
            Err(HardwareError::Attribute { .. })
        ));
    }

    #[test]
    fn test_invalid_calibration_mode_rejected() {
        let hw = quiet();
        assert!(hw
            .write_attr("m2k-fabric", None, "calibration_mode", "sideways")
            .is_err());
        assert_eq!(
            hw.attr("m2k-fabric", None, "calibration_mode").as_deref(),
            Some("none")
        );
    }

    #[test]
    fn test_cancel_trigger() {
        let hw = quiet();
        let token = CancelToken::new();
        hw.cancel_after_dac_pushes(2, token.clone());
        let buffer = hw
            .create_output_buffer("m2k-dac-b", "voltage0", 4, true)
            .unwrap();

        hw.push_output_buffer(buffer, &[1; 4]).unwrap();
        assert!(!token.is_cancelled());
        hw.push_output_buffer(buffer, &[2; 4]).unwrap();
        assert!(token.is_cancelled());
    }
}
