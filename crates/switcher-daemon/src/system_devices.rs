//! Host-backed [`DeviceController`].
//!
//! Enumeration goes through cpal on a blocking thread; a fresh host is opened
//! for every query so no cpal handle ever crosses a thread.  Changing the
//! hardware rate goes through a configurable command when one is set
//! (PipeWire's `pw-metadata` by default on Linux), otherwise through CoreAudio
//! on macOS.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::devices::{AudioDevice, DeviceController, DeviceEvent};
use crate::error::DeviceError;

/// Rates checked against a device's supported configuration ranges.
const STANDARD_RATES: [u32; 8] = [
    44_100, 48_000, 88_200, 96_000, 176_400, 192_000, 352_800, 384_000,
];

const RATE_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// What cpal tells us about one output device.
#[derive(Debug, Clone, PartialEq)]
struct ScannedDevice {
    name: String,
    current_rate: Option<u32>,
    /// Inclusive (min, max) sample rate ranges.
    rate_ranges: Vec<(u32, u32)>,
}

#[derive(Debug, Clone, PartialEq)]
struct HostScan {
    devices: Vec<ScannedDevice>,
    default_name: Option<String>,
}

impl HostScan {
    fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.iter().map(|d| d.name.clone()).collect();
        names.sort();
        names
    }
}

fn scan_blocking() -> Result<HostScan, DeviceError> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    let outputs = host
        .output_devices()
        .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

    let mut devices = Vec::new();
    for device in outputs {
        let name = match device.name() {
            Ok(n) => n,
            Err(_) => continue,
        };
        let rate_ranges = device
            .supported_output_configs()
            .map(|configs| {
                configs
                    .map(|c| (c.min_sample_rate().0, c.max_sample_rate().0))
                    .collect()
            })
            .unwrap_or_default();
        let current_rate = device
            .default_output_config()
            .ok()
            .map(|c| c.sample_rate().0);
        #[cfg(target_os = "macos")]
        let current_rate = crate::coreaudio::nominal_rate(
            &name,
            default_name.as_deref() == Some(name.as_str()),
        )
        .map(|r| r.round() as u32)
        .or(current_rate);
        devices.push(ScannedDevice {
            name,
            current_rate,
            rate_ranges,
        });
    }

    Ok(HostScan {
        devices,
        default_name,
    })
}

async fn scan() -> Result<HostScan, DeviceError> {
    tokio::task::spawn_blocking(scan_blocking)
        .await
        .map_err(|e| DeviceError::Unavailable(format!("device scan panicked: {}", e)))?
}

/// Standard rates covered by any of the given ranges, in ascending order.
fn rates_from_ranges(ranges: &[(u32, u32)]) -> Vec<f64> {
    STANDARD_RATES
        .iter()
        .filter(|rate| ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(*rate)))
        .map(|rate| *rate as f64)
        .collect()
}

fn expand_rate_command(template: &[String], device: &str, rate_hz: f64) -> Vec<String> {
    let rate = format!("{}", rate_hz.round() as u64);
    template
        .iter()
        .map(|arg| arg.replace("{rate}", &rate).replace("{device}", device))
        .collect()
}

/// A rate set through the rate command.  The host keeps reporting the
/// device's default config afterwards, so `reported` is what it showed at
/// write time; any other value means the rate changed behind our back.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ForcedRate {
    rate_hz: f64,
    reported: Option<u32>,
}

/// Drop forced rates for devices that went away or whose reported rate moved.
fn prune_forced(forced: &mut HashMap<String, ForcedRate>, host: &HostScan) {
    forced.retain(|name, entry| {
        let keep = host
            .devices
            .iter()
            .any(|d| &d.name == name && d.current_rate == entry.reported);
        if !keep {
            debug!("forgetting forced rate for {}", name);
        }
        keep
    });
}

pub struct SystemDevices {
    rate_command: Vec<String>,
    /// Rates set through `rate_command`, by device id.
    forced_rates: Mutex<HashMap<String, ForcedRate>>,
    events: broadcast::Sender<DeviceEvent>,
}

impl SystemDevices {
    pub fn new(rate_command: Vec<String>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            rate_command,
            forced_rates: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Re-enumerate devices every `interval` and publish a [`DeviceEvent`]
    /// whenever the device set or the default device changes.  Exits when
    /// `stop` flips to true.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        interval: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut last: Option<HostScan> = None;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    res = stop.changed() => {
                        if res.is_err() || *stop.borrow() {
                            debug!("device watcher: stopping");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let current = match scan().await {
                            Ok(p) => p,
                            Err(e) => {
                                warn!("device watcher: {}", e);
                                continue;
                            }
                        };
                        prune_forced(&mut *this.forced_rates.lock().await, &current);
                        if let Some(prev) = &last {
                            if prev.device_names() != current.device_names() {
                                info!("Output device list changed");
                                let _ = this.events.send(DeviceEvent::ListChanged);
                            }
                            if prev.default_name != current.default_name {
                                info!("Default output device changed to {:?}", current.default_name);
                                let _ = this.events.send(DeviceEvent::DefaultChanged);
                            }
                        }
                        last = Some(current);
                    }
                }
            }
        })
    }

    async fn to_audio_device(&self, scanned: &ScannedDevice, is_default: bool) -> AudioDevice {
        let forced = self
            .forced_rates
            .lock()
            .await
            .get(&scanned.name)
            .filter(|f| f.reported == scanned.current_rate)
            .map(|f| f.rate_hz);
        AudioDevice {
            id: scanned.name.clone(),
            name: scanned.name.clone(),
            nominal_sample_rate_hz: forced
                .or(scanned.current_rate.map(f64::from))
                .unwrap_or(0.0),
            supported_sample_rates: rates_from_ranges(&scanned.rate_ranges),
            is_default_output: is_default,
        }
    }

    #[cfg(target_os = "macos")]
    async fn set_rate_natively(&self, device: &AudioDevice, rate_hz: f64) -> Result<(), DeviceError> {
        let name = device.name.clone();
        let is_default = device.is_default_output;
        tokio::task::spawn_blocking(move || {
            crate::coreaudio::set_nominal_rate(&name, is_default, rate_hz)
        })
        .await
        .map_err(|e| DeviceError::Unavailable(format!("rate write panicked: {}", e)))??;
        debug!("{} set to {} Hz through CoreAudio", device.name, rate_hz);
        Ok(())
    }

    #[cfg(not(target_os = "macos"))]
    async fn set_rate_natively(&self, _device: &AudioDevice, _rate_hz: f64) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported(
            "no devices.rate_command configured".to_string(),
        ))
    }

    async fn find(&self, device: &AudioDevice) -> Result<AudioDevice, DeviceError> {
        let host = scan().await?;
        let scanned = host
            .devices
            .iter()
            .find(|d| d.name == device.id)
            .ok_or_else(|| DeviceError::Unavailable(device.name.clone()))?;
        let is_default = host.default_name.as_deref() == Some(scanned.name.as_str());
        Ok(self.to_audio_device(scanned, is_default).await)
    }
}

#[async_trait]
impl DeviceController for SystemDevices {
    async fn list_output_devices(&self) -> Result<Vec<AudioDevice>, DeviceError> {
        let host = scan().await?;
        prune_forced(&mut *self.forced_rates.lock().await, &host);
        let mut out = Vec::with_capacity(host.devices.len());
        for d in &host.devices {
            let is_default = host.default_name.as_deref() == Some(d.name.as_str());
            out.push(self.to_audio_device(d, is_default).await);
        }
        Ok(out)
    }

    async fn default_output_device(&self) -> Result<Option<AudioDevice>, DeviceError> {
        let host = scan().await?;
        let Some(default_name) = host.default_name.as_deref() else {
            return Ok(None);
        };
        match host.devices.iter().find(|d| d.name == default_name) {
            Some(d) => Ok(Some(self.to_audio_device(d, true).await)),
            None => Ok(None),
        }
    }

    async fn supported_rates(&self, device: &AudioDevice) -> Result<Vec<f64>, DeviceError> {
        Ok(self.find(device).await?.supported_sample_rates)
    }

    async fn nominal_sample_rate(&self, device: &AudioDevice) -> Result<f64, DeviceError> {
        let rate = self.find(device).await?.nominal_sample_rate_hz;
        if rate > 0.0 {
            Ok(rate)
        } else {
            Err(DeviceError::Unavailable(format!(
                "{} does not report its rate",
                device.name
            )))
        }
    }

    async fn set_nominal_sample_rate(
        &self,
        device: &AudioDevice,
        rate_hz: f64,
    ) -> Result<(), DeviceError> {
        let args = expand_rate_command(&self.rate_command, &device.name, rate_hz);
        let Some((program, rest)) = args.split_first() else {
            return self.set_rate_natively(device, rate_hz).await;
        };

        let write_failed = |reason: String| DeviceError::WriteFailed {
            device: device.name.clone(),
            rate_hz,
            reason,
        };

        let output = tokio::time::timeout(
            RATE_COMMAND_TIMEOUT,
            tokio::process::Command::new(program)
                .args(rest)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| write_failed("rate command timed out".to_string()))?
        .map_err(|e| write_failed(e.to_string()))?;

        if !output.status.success() {
            return Err(write_failed(format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        debug!("{} set to {} Hz", device.name, rate_hz);
        let reported = scan().await.ok().and_then(|p| {
            p.devices
                .into_iter()
                .find(|d| d.name == device.id)
                .and_then(|d| d.current_rate)
        });
        self.forced_rates
            .lock()
            .await
            .insert(device.id.clone(), ForcedRate { rate_hz, reported });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}
