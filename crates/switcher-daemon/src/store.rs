use std::sync::Arc;

use switcher_proto::protocol::SwitchSnapshot;
use tokio::sync::RwLock;

use crate::devices::AudioDevice;

/// Callback run after every state change, with the completed state.
///
/// Subscribers run while the store's write lock is held, so they must not
/// block and must not call back into the store.
pub type Subscriber = Box<dyn Fn(&SwitchState) + Send + Sync>;

/// Authoritative switcher state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SwitchState {
    /// Bumped by the store on every change; mutators never touch it.
    pub rev: u64,
    /// Applied/displayed rate in kHz.
    pub current_sample_rate_khz: Option<f64>,
    /// Nearest supported rate to the last parsed stat, in kHz.
    pub detected_sample_rate_khz: Option<f64>,
    /// Last nearest match in Hz; used by a forced apply with no explicit rate.
    pub last_nearest_sample_rate_hz: Option<f64>,
    pub auto_switch_enabled: bool,
    pub default_device: Option<AudioDevice>,
}

impl SwitchState {
    pub fn snapshot(&self) -> SwitchSnapshot {
        let (device_name, supported) = match &self.default_device {
            Some(d) => (
                d.name.clone(),
                d.supported_sample_rates.iter().map(|r| r / 1000.0).collect(),
            ),
            None => (String::new(), Vec::new()),
        };
        SwitchSnapshot {
            rev: self.rev,
            current_sample_rate_khz: self.current_sample_rate_khz,
            detected_sample_rate_khz: self.detected_sample_rate_khz,
            device_name,
            auto_switch_enabled: self.auto_switch_enabled,
            supported_sample_rates_khz: supported,
        }
    }
}

struct Inner {
    state: SwitchState,
    subscribers: Vec<Subscriber>,
}

/// Single point of mutation for [`SwitchState`].
///
/// `update` runs the mutator and notifies subscribers under one write lock,
/// so readers and subscribers only ever see whole updates, and subscribers
/// see updates in the order they completed.
pub struct StateStore {
    inner: RwLock<Inner>,
}

impl StateStore {
    pub fn new(auto_switch_enabled: bool) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: SwitchState {
                    rev: 1,
                    auto_switch_enabled,
                    ..Default::default()
                },
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn shared(auto_switch_enabled: bool) -> Arc<Self> {
        Arc::new(Self::new(auto_switch_enabled))
    }

    pub async fn current(&self) -> SwitchState {
        self.inner.read().await.state.clone()
    }

    pub async fn snapshot(&self) -> SwitchSnapshot {
        self.inner.read().await.state.snapshot()
    }

    /// Apply `mutator`.  If the state actually changed, bump `rev` and notify
    /// every subscriber.  Returns the resulting state.
    pub async fn update<F>(&self, mutator: F) -> SwitchState
    where
        F: FnOnce(&mut SwitchState),
    {
        let mut inner = self.inner.write().await;
        let before = inner.state.clone();
        mutator(&mut inner.state);
        inner.state.rev = before.rev;

        if inner.state != before {
            inner.state.rev += 1;
            let Inner { state, subscribers } = &*inner;
            for subscriber in subscribers {
                subscriber(state);
            }
        }
        inner.state.clone()
    }

    pub async fn on_change<F>(&self, subscriber: F)
    where
        F: Fn(&SwitchState) + Send + Sync + 'static,
    {
        self.inner.write().await.subscribers.push(Box::new(subscriber));
    }

    // ── named mutations ───────────────────────────────────────────────────────

    /// Record a detection.  `current` follows only when `apply` is set.
    pub async fn set_detected(&self, nearest_hz: f64, apply: bool) -> SwitchState {
        self.update(|s| {
            s.last_nearest_sample_rate_hz = Some(nearest_hz);
            s.detected_sample_rate_khz = Some(nearest_hz / 1000.0);
            if apply {
                s.current_sample_rate_khz = Some(nearest_hz / 1000.0);
            }
        })
        .await
    }

    /// Force the displayed current rate, bypassing the auto-switch gate.
    pub async fn force_current(&self, rate_hz: f64) -> SwitchState {
        self.update(|s| s.current_sample_rate_khz = Some(rate_hz / 1000.0))
            .await
    }

    pub async fn set_auto_switch(&self, enabled: bool) -> SwitchState {
        self.update(|s| s.auto_switch_enabled = enabled).await
    }

    pub async fn set_default_device(&self, device: Option<AudioDevice>) -> SwitchState {
        self.update(|s| s.default_device = device).await
    }
}
