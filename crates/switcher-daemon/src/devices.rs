use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::DeviceError;

/// An output device as last reported by the OS.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioDevice {
    pub id: String,
    pub name: String,
    pub nominal_sample_rate_hz: f64,
    /// Device order; stable between refreshes but not sorted.
    pub supported_sample_rates: Vec<f64>,
    pub is_default_output: bool,
}

/// Change notifications from the host audio subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    ListChanged,
    DefaultChanged,
}

/// Read/write view of the host's output devices.
///
/// Writes are best effort: a busy device may reject or silently ignore a new
/// rate, and callers treat every [`DeviceError`] as non-fatal.
#[async_trait]
pub trait DeviceController: Send + Sync {
    async fn list_output_devices(&self) -> Result<Vec<AudioDevice>, DeviceError>;

    async fn default_output_device(&self) -> Result<Option<AudioDevice>, DeviceError>;

    /// Rates the device can be set to.  May be empty.
    async fn supported_rates(&self, device: &AudioDevice) -> Result<Vec<f64>, DeviceError>;

    /// The device's current hardware rate.
    async fn nominal_sample_rate(&self, device: &AudioDevice) -> Result<f64, DeviceError>;

    async fn set_nominal_sample_rate(
        &self,
        device: &AudioDevice,
        rate_hz: f64,
    ) -> Result<(), DeviceError>;

    /// Device-list and default-device change events.  Delivery happens on
    /// whatever task notices the change.
    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent>;
}
