#[cfg(target_os = "macos")]
mod coreaudio;
mod devices;
mod engine;
mod error;
mod logsource;
mod prefs;
mod privilege;
mod socket;
mod stats;
mod store;
mod system_devices;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use switcher_proto::config::Config;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::engine::SwitchEngine;
use crate::logsource::CommandLogSource;
use crate::prefs::Preferences;
use crate::privilege::PrivilegeStatus;
use crate::socket::{Broadcaster, ServerContext};
use crate::store::StateStore;
use crate::system_devices::SystemDevices;

/// A custom tracing layer that forwards log messages to connected observers
struct BroadcastLayer {
    sender: broadcast::Sender<String>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<String>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only WARN and ERROR go to observers
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is fine
        let _ = self.sender.send(message);
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Log channel first so the tracing layer can feed it
    let (log_tx, _) = broadcast::channel::<String>(100);

    let data_dir = switcher_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(BroadcastLayer::new(log_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,switcher_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    match privilege::check(config.detection.required_group.as_deref()).await {
        PrivilegeStatus::Granted => {}
        PrivilegeStatus::Denied => {
            let group = config.detection.required_group.unwrap_or_default();
            error!(
                "User is not in the '{}' group; playback logs cannot be read",
                group
            );
            anyhow::bail!("missing required group membership: {}", group);
        }
        PrivilegeStatus::Unknown(reason) => {
            warn!("Could not verify log access ({}); continuing", reason);
        }
    }

    let (stop_tx, stop_rx) = watch::channel(false);

    let prefs = Preferences::load(
        config.preferences.file.clone(),
        config.preferences.auto_switch,
    );
    let store = StateStore::shared(prefs.auto_switch());

    let broadcaster = Broadcaster::new();
    broadcaster.attach(&store).await;

    let devices = Arc::new(SystemDevices::new(config.devices.rate_command.clone()));
    let watcher = devices.spawn_watcher(
        Duration::from_millis(config.devices.watch_interval_ms),
        stop_rx.clone(),
    );

    let logs = Arc::new(CommandLogSource::new(
        config.detection.log_command.clone(),
        Duration::from_millis(config.detection.fetch_timeout_ms),
    ));

    let (command_tx, command_rx) = mpsc::channel(32);

    let (addr, server) = socket::start_server(
        &config.server.bind_address,
        config.server.port,
        ServerContext {
            broadcaster,
            store: store.clone(),
            command_tx,
            log_tx,
            write_timeout: Duration::from_millis(config.server.write_timeout_ms),
        },
        stop_rx.clone(),
    )
    .await?;
    info!("Observers can connect at {}", addr);

    let engine = SwitchEngine::new(
        config.detection.process.clone(),
        Duration::from_millis(config.detection.poll_interval_ms),
        store,
        devices,
        logs,
        prefs,
    );
    let engine = tokio::spawn(engine.run(command_rx, stop_rx));

    info!("Daemon initialised, watching '{}'", config.detection.process);
    shutdown_signal().await;
    info!("Shutting down");

    let _ = stop_tx.send(true);
    let _ = tokio::join!(engine, server, watcher);
    Ok(())
}
