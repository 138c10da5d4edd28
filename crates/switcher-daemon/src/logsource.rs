//! Access to the player's recent log output.
//!
//! Reading the OS log store is delegated to an external command (`log show`
//! on macOS, `journalctl` elsewhere); the engine only sees [`LogSource`].

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::LogFetchError;

#[async_trait]
pub trait LogSource: Send + Sync {
    /// Recent raw log lines for `process`, most recent first.
    async fn fetch_recent_entries(&self, process: &str) -> Result<Vec<String>, LogFetchError>;
}

/// Runs a command template and returns its stdout lines, newest first.
///
/// `{process}` in any argument is replaced with the requested process name.
pub struct CommandLogSource {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandLogSource {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    fn expand(&self, process: &str) -> Vec<String> {
        self.command
            .iter()
            .map(|arg| arg.replace("{process}", process))
            .collect()
    }
}

#[async_trait]
impl LogSource for CommandLogSource {
    async fn fetch_recent_entries(&self, process: &str) -> Result<Vec<String>, LogFetchError> {
        let args = self.expand(process);
        let (program, rest) = args.split_first().ok_or(LogFetchError::NotConfigured)?;

        let child = tokio::process::Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| LogFetchError::Timeout(self.timeout.as_millis() as u64))??;

        if !output.status.success() {
            return Err(LogFetchError::Status {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines: Vec<String> = stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();
        // Both log tools print oldest first.
        lines.reverse();
        debug!("log source: {} lines for {}", lines.len(), process);
        Ok(lines)
    }
}
