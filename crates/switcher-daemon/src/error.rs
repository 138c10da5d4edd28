//! Error types for the switcher daemon.
//!
//! Transient conditions (log fetch, device write) are absorbed by the engine;
//! only privilege failures stop the daemon.

use thiserror::Error;

/// Failure to pull recent log lines for the target process.
#[derive(Error, Debug)]
pub enum LogFetchError {
    #[error("log command is empty")]
    NotConfigured,

    #[error("failed to run log command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("log command exited with {status}: {stderr}")]
    Status { status: String, stderr: String },

    #[error("log command timed out after {0} ms")]
    Timeout(u64),
}

/// Output device errors.  None of these are fatal to the engine.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device unavailable: {0}")]
    Unavailable(String),

    #[error("setting the sample rate is not supported: {0}")]
    Unsupported(String),

    #[error("failed to set {device} to {rate_hz} Hz: {reason}")]
    WriteFailed {
        device: String,
        rate_hz: f64,
        reason: String,
    },
}

/// Could not determine whether the user may read the log store.
#[derive(Error, Debug)]
pub enum PrivilegeError {
    #[error("failed to query group membership: {0}")]
    Query(#[from] std::io::Error),

    #[error("group query exited with {0}")]
    Status(String),
}
