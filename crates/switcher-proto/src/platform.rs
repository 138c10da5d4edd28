use std::path::PathBuf;

pub const DAEMON_TCP_PORT: u16 = 9877;

const APP_DIR: &str = "lossless-switcher";

pub fn data_dir() -> PathBuf {
    // Use ~/.local/share/lossless-switcher/ on every unix, including macOS,
    // so logs and preferences live in one predictable place.
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join(APP_DIR)
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

/// Command used to pull the player's recent log lines.  `{process}` is
/// replaced with the configured process name.
#[cfg(target_os = "macos")]
pub fn default_log_command() -> Vec<String> {
    [
        "log",
        "show",
        "--style",
        "compact",
        "--last",
        "5s",
        "--predicate",
        "process == \"{process}\"",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(not(target_os = "macos"))]
pub fn default_log_command() -> Vec<String> {
    [
        "journalctl",
        "--no-pager",
        "-o",
        "short-iso",
        "--since",
        "-5s",
        "_COMM={process}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Command used to force the output rate.  `{rate}` is replaced with the
/// integer rate in Hz, `{device}` with the device name.  Empty means the
/// daemon uses the native API where it has one (CoreAudio on macOS).
#[cfg(target_os = "linux")]
pub fn default_rate_command() -> Vec<String> {
    ["pw-metadata", "-n", "settings", "0", "clock.force-rate", "{rate}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[cfg(not(target_os = "linux"))]
pub fn default_rate_command() -> Vec<String> {
    Vec::new()
}

/// Group whose members may read the system log store.
#[cfg(target_os = "macos")]
pub fn default_required_group() -> Option<String> {
    Some("admin".to_string())
}

#[cfg(not(target_os = "macos"))]
pub fn default_required_group() -> Option<String> {
    None
}
