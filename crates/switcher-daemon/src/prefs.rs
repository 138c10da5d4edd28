use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistentPreferences {
    auto_switch: bool,
}

/// The user's auto-switch preference, with change notification.
///
/// Cheap to clone; all clones share one value.  Saving is best effort: a
/// failed write is logged and the in-memory value still changes.
#[derive(Clone)]
pub struct Preferences {
    file: Option<Arc<PathBuf>>,
    auto_switch: Arc<watch::Sender<bool>>,
}

impl Preferences {
    /// Load from `file`, falling back to `default_auto_switch` when the file
    /// is missing or unreadable.
    pub fn load(file: PathBuf, default_auto_switch: bool) -> Self {
        let auto_switch = Self::load_persistent(&file)
            .map(|p| p.auto_switch)
            .unwrap_or(default_auto_switch);
        let (tx, _) = watch::channel(auto_switch);
        Self {
            file: Some(Arc::new(file)),
            auto_switch: Arc::new(tx),
        }
    }

    /// Preferences that are never written to disk.
    pub fn in_memory(auto_switch: bool) -> Self {
        let (tx, _) = watch::channel(auto_switch);
        Self {
            file: None,
            auto_switch: Arc::new(tx),
        }
    }

    pub fn auto_switch(&self) -> bool {
        *self.auto_switch.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.auto_switch.subscribe()
    }

    pub async fn set_auto_switch(&self, enabled: bool) {
        let changed = self.auto_switch.send_if_modified(|current| {
            if *current == enabled {
                false
            } else {
                *current = enabled;
                true
            }
        });
        if !changed {
            return;
        }
        debug!("auto switch preference set to {}", enabled);
        if let Err(e) = self.save(enabled).await {
            warn!("Failed to save preferences: {}", e);
        }
    }

    async fn save(&self, auto_switch: bool) -> anyhow::Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&PersistentPreferences { auto_switch })?;
        tokio::fs::write(file.as_ref(), json).await?;
        Ok(())
    }

    fn load_persistent(file: &PathBuf) -> Option<PersistentPreferences> {
        let content = std::fs::read_to_string(file).ok()?;
        serde_json::from_str(&content).ok()
    }
}
