//! Single-owner loop for detection and device writes.
//!
//! Every tick (2 s by default) the engine pulls the player's recent log
//! lines, takes the most recent playback stat, matches it to the nearest rate
//! the default output device supports, and, when auto-switching is on and the
//! device is not already there, writes the new rate.  Device change events,
//! preference changes and observer commands are handled on the same task, so
//! device I/O is never concurrent.
//!
//! ```text
//!   Idle ──tick/device event──▶ Detecting ──no stat / no change──▶ Idle
//!                                  │  │
//!                                  │  └─ fetch error ─▶ Faulted ──next tick──▶ Idle
//!                                  └─ rate differs / forced ─▶ Applying ─▶ Idle
//! ```
use std::sync::Arc;
use std::time::Duration;

use switcher_proto::protocol::Command;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::devices::{AudioDevice, DeviceController, DeviceEvent};
use crate::logsource::LogSource;
use crate::prefs::Preferences;
use crate::stats::parse_playback_stats;
use crate::store::StateStore;

/// Forced applies at or below this are treated as uninitialised values.
pub const MIN_FORCED_RATE_HZ: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePhase {
    Idle,
    Detecting,
    Applying,
    Faulted(String),
}

/// What a single detection cycle ended with.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Log fetch failed; state untouched.
    Faulted,
    /// No line produced a playback stat.
    NoDetection,
    NoDevice,
    /// The device reported no supported rates.
    NoSupportedRates,
    /// Detected rate recorded; device left alone.
    Detected { rate_hz: f64 },
    /// Device write attempted.  `written` is false if the device refused.
    Applied { rate_hz: f64, written: bool },
}

/// Pick the element of `rates` closest to `target`.
///
/// Exact ties go to the first candidate in iteration order.  Returns `None`
/// for an empty set (non-finite candidates are ignored).
pub fn nearest_supported_rate(target: f64, rates: &[f64]) -> Option<f64> {
    let mut best: Option<f64> = None;
    for &rate in rates.iter().filter(|r| r.is_finite()) {
        match best {
            Some(b) if (rate - target).abs() >= (b - target).abs() => {}
            _ => best = Some(rate),
        }
    }
    best
}

fn same_rate(a: f64, b: f64) -> bool {
    (a - b).abs() < 0.5
}

pub struct SwitchEngine {
    process: String,
    poll_interval: Duration,
    store: Arc<StateStore>,
    devices: Arc<dyn DeviceController>,
    logs: Arc<dyn LogSource>,
    prefs: Preferences,
    phase: EnginePhase,
    default_device: Option<AudioDevice>,
    output_devices: Vec<AudioDevice>,
    /// Last device write error, so a persistent failure is warned about once.
    last_write_error: Option<String>,
}

impl SwitchEngine {
    pub fn new(
        process: impl Into<String>,
        poll_interval: Duration,
        store: Arc<StateStore>,
        devices: Arc<dyn DeviceController>,
        logs: Arc<dyn LogSource>,
        prefs: Preferences,
    ) -> Self {
        Self {
            process: process.into(),
            poll_interval,
            store,
            devices,
            logs,
            prefs,
            phase: EnginePhase::Idle,
            default_device: None,
            output_devices: Vec::new(),
            last_write_error: None,
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> &EnginePhase {
        &self.phase
    }

    #[cfg(test)]
    pub fn output_devices(&self) -> &[AudioDevice] {
        &self.output_devices
    }

    fn set_phase(&mut self, phase: EnginePhase) {
        if self.phase != phase {
            debug!("engine: {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
    }

    /// Initial device read.  The device's current rate becomes the displayed
    /// rate, and the stored auto-switch flag follows the preference.
    pub async fn start(&mut self) {
        self.store.set_auto_switch(self.prefs.auto_switch()).await;
        self.refresh_devices(true).await;
    }

    /// Re-read the device list and default device.  With `reread_rate`, the
    /// default device's nominal rate is forced into the displayed rate.
    pub async fn refresh_devices(&mut self, reread_rate: bool) {
        match self.devices.list_output_devices().await {
            Ok(list) => {
                self.output_devices = list;
                debug!(
                    "output devices: {:?}",
                    self.output_devices.iter().map(|d| &d.name).collect::<Vec<_>>()
                );
            }
            Err(e) => warn!("Failed to list output devices: {}", e),
        }

        let default = match self.devices.default_output_device().await {
            Ok(d) => d,
            Err(e) => {
                warn!("Failed to read default output device: {}", e);
                return;
            }
        };

        match &default {
            Some(d) => info!(
                "Default output: {} ({} Hz, supports {:?})",
                d.name, d.nominal_sample_rate_hz, d.supported_sample_rates
            ),
            None => warn!("No default output device"),
        }

        if reread_rate {
            if let Some(d) = &default {
                if d.nominal_sample_rate_hz > 0.0 {
                    self.store.force_current(d.nominal_sample_rate_hz).await;
                }
            }
        }
        self.default_device = default.clone();
        self.store.set_default_device(default).await;
    }

    pub async fn handle_device_event(&mut self, event: DeviceEvent) {
        info!("Device event: {:?}", event);
        match event {
            DeviceEvent::ListChanged => self.refresh_devices(false).await,
            DeviceEvent::DefaultChanged => self.refresh_devices(true).await,
        }
        self.run_cycle().await;
    }

    /// One detection cycle.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        if let EnginePhase::Faulted(reason) = &self.phase {
            debug!("engine: retrying after fault: {}", reason);
        }
        self.set_phase(EnginePhase::Detecting);

        let lines = match self.logs.fetch_recent_entries(&self.process).await {
            Ok(lines) => lines,
            Err(e) => {
                warn!("Log fetch failed: {}", e);
                self.set_phase(EnginePhase::Faulted(e.to_string()));
                return CycleOutcome::Faulted;
            }
        };

        let Some(stat) = parse_playback_stats(lines.iter().map(String::as_str)).next() else {
            self.set_phase(EnginePhase::Idle);
            return CycleOutcome::NoDetection;
        };
        debug!(
            "stat at {}: {} Hz, {:?} bit ({})",
            stat.observed_at, stat.sample_rate_hz, stat.bit_depth, stat.raw
        );

        let Some(device) = self.default_device.clone() else {
            self.set_phase(EnginePhase::Idle);
            return CycleOutcome::NoDevice;
        };

        let supported = match self.devices.supported_rates(&device).await {
            Ok(rates) => rates,
            Err(e) => {
                debug!("supported rates unavailable for {}: {}", device.name, e);
                device.supported_sample_rates.clone()
            }
        };
        let Some(nearest) = nearest_supported_rate(stat.sample_rate_hz, &supported) else {
            debug!("{} reports no supported rates", device.name);
            self.set_phase(EnginePhase::Idle);
            return CycleOutcome::NoSupportedRates;
        };

        let auto = self.store.current().await.auto_switch_enabled;
        if !auto {
            self.store.set_detected(nearest, false).await;
            self.set_phase(EnginePhase::Idle);
            return CycleOutcome::Detected { rate_hz: nearest };
        }

        let nominal = self.current_nominal(&device).await;
        if same_rate(nominal, nearest) {
            self.store.set_detected(nearest, true).await;
            self.set_phase(EnginePhase::Idle);
            return CycleOutcome::Detected { rate_hz: nearest };
        }

        self.set_phase(EnginePhase::Applying);
        info!(
            "Switching {} from {} Hz to {} Hz (stream {} Hz)",
            device.name, nominal, nearest, stat.sample_rate_hz
        );
        let written = self.write_rate(&device, nearest).await;
        self.store.set_detected(nearest, true).await;
        self.set_phase(EnginePhase::Idle);
        CycleOutcome::Applied {
            rate_hz: nearest,
            written,
        }
    }

    /// Forced apply.  Uses `explicit` or the last nearest match, bypasses the
    /// auto-switch gate, and skips the device write when the device already
    /// runs at the target.  Returns false when there was nothing to apply.
    pub async fn set_device_sample_rate(&mut self, explicit: Option<f64>) -> bool {
        let cached = self.store.current().await.last_nearest_sample_rate_hz;
        let Some(target) = explicit.or(cached) else {
            debug!("forced apply: no rate detected yet");
            return false;
        };
        if !(target > MIN_FORCED_RATE_HZ) {
            warn!("Ignoring forced apply of {} Hz", target);
            return false;
        }

        self.set_phase(EnginePhase::Applying);
        if let Some(device) = self.default_device.clone() {
            let nominal = self.current_nominal(&device).await;
            if !same_rate(nominal, target) {
                info!("Setting {} to {} Hz", device.name, target);
                self.write_rate(&device, target).await;
            }
        }
        self.store.force_current(target).await;
        self.set_phase(EnginePhase::Idle);
        true
    }

    async fn current_nominal(&self, device: &AudioDevice) -> f64 {
        match self.devices.nominal_sample_rate(device).await {
            Ok(rate) => rate,
            Err(e) => {
                debug!("nominal rate unavailable for {}: {}", device.name, e);
                device.nominal_sample_rate_hz
            }
        }
    }

    async fn write_rate(&mut self, device: &AudioDevice, rate_hz: f64) -> bool {
        match self.devices.set_nominal_sample_rate(device, rate_hz).await {
            Ok(()) => {
                self.last_write_error = None;
                if let Some(d) = self.default_device.as_mut() {
                    if d.id == device.id {
                        d.nominal_sample_rate_hz = rate_hz;
                    }
                }
                true
            }
            Err(e) => {
                let reason = e.to_string();
                if self.last_write_error.as_deref() == Some(reason.as_str()) {
                    debug!("Device write failed again: {}", reason);
                } else {
                    warn!("Device write failed: {}", reason);
                    self.last_write_error = Some(reason);
                }
                false
            }
        }
    }

    /// Handle one receive from the device event stream.  Returns false once
    /// the stream has closed.
    pub async fn handle_device_recv(&mut self, received: Result<DeviceEvent, RecvError>) -> bool {
        match received {
            Ok(event) => self.handle_device_event(event).await,
            Err(RecvError::Lagged(n)) => {
                warn!("SwitchEngine: missed {} device events, re-reading devices", n);
                self.handle_device_event(DeviceEvent::DefaultChanged).await;
            }
            Err(RecvError::Closed) => {
                warn!("SwitchEngine: device event stream closed");
                return false;
            }
        }
        true
    }

    pub async fn handle_command(&mut self, cmd: Command) {
        info!("Command: {:?}", cmd);
        match cmd {
            Command::GetState => {}
            Command::SetAutoSwitch { enabled } => {
                self.prefs.set_auto_switch(enabled).await;
                self.store.set_auto_switch(enabled).await;
            }
            Command::ApplyDetected => {
                self.set_device_sample_rate(None).await;
            }
            Command::ApplyRate { rate_hz } => {
                self.set_device_sample_rate(Some(rate_hz)).await;
            }
        }
    }

    /// Run until `stop` flips to true.  No cycle starts after that.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut stop: watch::Receiver<bool>) {
        info!("SwitchEngine: watching {} every {:?}", self.process, self.poll_interval);

        let mut device_events = self.devices.subscribe();
        let mut events_open = true;
        let mut auto_switch = self.prefs.subscribe();

        self.start().await;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                biased;

                res = stop.changed() => {
                    if res.is_err() || *stop.borrow() {
                        break;
                    }
                }

                Some(cmd) = commands.recv() => {
                    self.handle_command(cmd).await;
                }

                evt = device_events.recv(), if events_open => {
                    events_open = self.handle_device_recv(evt).await;
                }

                res = auto_switch.changed() => {
                    if res.is_ok() {
                        let enabled = *auto_switch.borrow_and_update();
                        self.store.set_auto_switch(enabled).await;
                    }
                }

                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }

        info!("SwitchEngine: stopped");
    }
}
