//! In-memory log source and device controller for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::devices::{AudioDevice, DeviceController, DeviceEvent};
use crate::error::{DeviceError, LogFetchError};
use crate::logsource::LogSource;

pub fn music_line(khz: &str) -> String {
    format!(
        "2024-03-01 21:14:07.123 Df Music[812:1a2b] [com.apple.Music:Player] audioCapabilities: asbdSampleRate = {} kHz, sdBitDepth = 24 bit",
        khz
    )
}

pub fn device(id: &str, nominal: f64, supported: &[f64]) -> AudioDevice {
    AudioDevice {
        id: id.to_string(),
        name: format!("{} output", id),
        nominal_sample_rate_hz: nominal,
        supported_sample_rates: supported.to_vec(),
        is_default_output: false,
    }
}

/// Scripted log source: each fetch pops the next response, and once the
/// script runs out it keeps returning the last successful one.
#[derive(Default)]
pub struct FakeLogs {
    script: Mutex<VecDeque<Result<Vec<String>, String>>>,
    last_ok: Mutex<Vec<String>>,
    pub fetches: Mutex<usize>,
}

impl FakeLogs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_lines(&self, lines: Vec<String>) {
        self.script.lock().unwrap().push_back(Ok(lines));
    }

    pub fn push_error(&self, reason: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(reason.to_string()));
    }

    pub fn fetch_count(&self) -> usize {
        *self.fetches.lock().unwrap()
    }
}

#[async_trait]
impl LogSource for FakeLogs {
    async fn fetch_recent_entries(&self, _process: &str) -> Result<Vec<String>, LogFetchError> {
        *self.fetches.lock().unwrap() += 1;
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(lines)) => {
                *self.last_ok.lock().unwrap() = lines.clone();
                Ok(lines)
            }
            Some(Err(reason)) => Err(LogFetchError::Status {
                status: "exit status: 1".to_string(),
                stderr: reason,
            }),
            None => Ok(self.last_ok.lock().unwrap().clone()),
        }
    }
}

struct FakeDeviceState {
    devices: Vec<AudioDevice>,
    default_id: Option<String>,
    writes: Vec<(String, f64)>,
    fail_writes: bool,
}

pub struct FakeDevices {
    state: Mutex<FakeDeviceState>,
    events: broadcast::Sender<DeviceEvent>,
}

impl FakeDevices {
    pub fn new(devices: Vec<AudioDevice>, default_id: Option<&str>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(FakeDeviceState {
                devices,
                default_id: default_id.map(str::to_string),
                writes: Vec::new(),
                fail_writes: false,
            }),
            events,
        }
    }

    /// Every rate write attempted, successful or not.
    pub fn writes(&self) -> Vec<(String, f64)> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_writes = fail;
    }

    /// Replace the device list and default, then publish both events.
    pub fn replace(&self, devices: Vec<AudioDevice>, default_id: Option<&str>) {
        {
            let mut state = self.state.lock().unwrap();
            state.devices = devices;
            state.default_id = default_id.map(str::to_string);
        }
        let _ = self.events.send(DeviceEvent::ListChanged);
        let _ = self.events.send(DeviceEvent::DefaultChanged);
    }

    fn lookup(&self, id: &str) -> Result<AudioDevice, DeviceError> {
        let state = self.state.lock().unwrap();
        state
            .devices
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .map(|mut d| {
                d.is_default_output = state.default_id.as_deref() == Some(id);
                d
            })
            .ok_or_else(|| DeviceError::Unavailable(id.to_string()))
    }
}

#[async_trait]
impl DeviceController for FakeDevices {
    async fn list_output_devices(&self) -> Result<Vec<AudioDevice>, DeviceError> {
        let ids: Vec<String> = {
            let state = self.state.lock().unwrap();
            state.devices.iter().map(|d| d.id.clone()).collect()
        };
        ids.iter().map(|id| self.lookup(id)).collect()
    }

    async fn default_output_device(&self) -> Result<Option<AudioDevice>, DeviceError> {
        let default_id = self.state.lock().unwrap().default_id.clone();
        match default_id {
            Some(id) => self.lookup(&id).map(Some),
            None => Ok(None),
        }
    }

    async fn supported_rates(&self, device: &AudioDevice) -> Result<Vec<f64>, DeviceError> {
        Ok(self.lookup(&device.id)?.supported_sample_rates)
    }

    async fn nominal_sample_rate(&self, device: &AudioDevice) -> Result<f64, DeviceError> {
        Ok(self.lookup(&device.id)?.nominal_sample_rate_hz)
    }

    async fn set_nominal_sample_rate(
        &self,
        device: &AudioDevice,
        rate_hz: f64,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        state.writes.push((device.id.clone(), rate_hz));
        if state.fail_writes {
            return Err(DeviceError::WriteFailed {
                device: device.name.clone(),
                rate_hz,
                reason: "device busy".to_string(),
            });
        }
        match state.devices.iter_mut().find(|d| d.id == device.id) {
            Some(d) => {
                d.nominal_sample_rate_hz = rate_hz;
                Ok(())
            }
            None => Err(DeviceError::Unavailable(device.id.clone())),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}
