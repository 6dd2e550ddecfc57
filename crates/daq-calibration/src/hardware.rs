//! Hardware abstraction consumed by the calibration engine.
//!
//! The engine never touches device drivers directly. Everything it needs from
//! the instrument goes through [`HardwareHandle`]: named device/channel
//! lookup, string attributes, synchronous capture, cyclic output buffers,
//! channel enables and temperature readback. This mirrors the IIO model the
//! instrument firmware exposes, without leaking raw handle lifetimes.

use std::fmt;

use thiserror::Error;

/// Opaque identifier of an output buffer created by the hardware layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Errors reported by a [`HardwareHandle`] implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    /// No device with this name exists.
    #[error("device '{0}' not found")]
    DeviceNotFound(String),

    /// The device exists but has no such channel.
    #[error("channel '{channel}' not found on device '{device}'")]
    ChannelNotFound {
        /// Device name
        device: String,
        /// Channel name
        channel: String,
    },

    /// An attribute could not be read or written.
    #[error("attribute '{attribute}' on '{target}': {message}")]
    Attribute {
        /// `device` or `device/channel`
        target: String,
        /// Attribute name
        attribute: String,
        /// Driver message
        message: String,
    },

    /// Buffer allocation, push or enable failed.
    #[error("buffer error: {0}")]
    Buffer(String),

    /// Low-level transport failure (USB, network, kernel).
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result alias for hardware calls.
pub type HwResult<T> = std::result::Result<T, HardwareError>;

/// Capability object giving the engine access to the instrument.
///
/// Implementations must be callable from a worker thread. A call may block
/// for as long as the underlying transfer takes; the engine adds no timeouts.
pub trait HardwareHandle: Send + Sync {
    /// Whether a device with this name exists.
    fn has_device(&self, device: &str) -> bool;

    /// Whether `device` exposes `channel`. `output` selects output channels
    /// (DAC side) instead of input channels.
    fn has_channel(&self, device: &str, channel: &str, output: bool) -> bool;

    /// Read an attribute. `channel = None` addresses a device attribute.
    fn read_attr(&self, device: &str, channel: Option<&str>, attr: &str) -> HwResult<String>;

    /// Write an attribute. `channel = None` addresses a device attribute.
    fn write_attr(
        &self,
        device: &str,
        channel: Option<&str>,
        attr: &str,
        value: &str,
    ) -> HwResult<()>;

    /// Capture `samples_per_channel` raw samples from every channel in
    /// `channels`, acquired synchronously. Returns one vector per channel, in
    /// request order.
    fn capture(
        &self,
        device: &str,
        channels: &[&str],
        samples_per_channel: usize,
    ) -> HwResult<Vec<Vec<i16>>>;

    /// Create an output buffer of `len` samples on `device/channel`.
    fn create_output_buffer(
        &self,
        device: &str,
        channel: &str,
        len: usize,
        cyclic: bool,
    ) -> HwResult<BufferId>;

    /// Fill and submit an output buffer. For cyclic buffers playback loops
    /// until the buffer is destroyed.
    fn push_output_buffer(&self, buffer: BufferId, data: &[i16]) -> HwResult<()>;

    /// Stop playback and release an output buffer. Unknown ids are ignored.
    fn destroy_output_buffer(&self, buffer: BufferId);

    /// Enable or disable a channel for streaming.
    fn set_channel_enabled(
        &self,
        device: &str,
        channel: &str,
        output: bool,
        enabled: bool,
    ) -> HwResult<()>;

    /// Die temperature of a device, in degrees Celsius.
    fn device_temperature(&self, device: &str) -> HwResult<f64>;
}
