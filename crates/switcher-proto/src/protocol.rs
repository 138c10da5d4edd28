use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Observers check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from an observer to the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Ask for a fresh `State` broadcast.
    GetState,
    /// Turn automatic switching on or off (persisted by the daemon).
    SetAutoSwitch { enabled: bool },
    /// Apply the last detected rate to the device, regardless of auto-switch.
    ApplyDetected,
    /// Apply an explicit rate (Hz) to the device, regardless of auto-switch.
    ApplyRate { rate_hz: f64 },
}

/// Messages sent from the daemon to observers (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full state snapshot.
    Hello {
        protocol_version: u32,
        state: SwitchSnapshot,
    },
    /// Full snapshot, pushed after every state change.
    State {
        data: SwitchSnapshot,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Full observable state of the switcher.  `rev` is a monotonically increasing
/// counter bumped on every state change; observers can use it to discard
/// out-of-order snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SwitchSnapshot {
    #[serde(default)]
    pub rev: u64,
    /// Rate the device was last set to (or read from), in kHz.
    pub current_sample_rate_khz: Option<f64>,
    /// Nearest supported rate to what the player is outputting, in kHz.
    pub detected_sample_rate_khz: Option<f64>,
    /// Name of the default output device, empty when there is none.
    #[serde(default)]
    pub device_name: String,
    pub auto_switch_enabled: bool,
    #[serde(default)]
    pub supported_sample_rates_khz: Vec<f64>,
}

impl SwitchSnapshot {
    /// Compact title for status displays, e.g. `C:44.1 | D:96.0 kHz`.
    ///
    /// A missing current rate falls back to the detected one; a missing
    /// detected rate renders as `-`.
    pub fn status_title(&self) -> String {
        let detected = self
            .detected_sample_rate_khz
            .map(|d| format!("{:.1}", d))
            .unwrap_or_else(|| "-".to_string());
        let current = self
            .current_sample_rate_khz
            .or(self.detected_sample_rate_khz)
            .map(|c| format!("{:.1}", c))
            .unwrap_or_else(|| "-".to_string());
        format!("C:{} | D:{} kHz", current, detected)
    }
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encode_decode() {
        let msg = Message::Command(Command::SetAutoSwitch { enabled: false });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(cmd) => assert_eq!(cmd, Command::SetAutoSwitch { enabled: false }),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_hello_encode_decode() {
        let state = SwitchSnapshot {
            rev: 42,
            current_sample_rate_khz: Some(44.1),
            device_name: "DAC".to_string(),
            ..Default::default()
        };
        let msg = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            state: state.clone(),
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                state: decoded_state,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(decoded_state, state);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_decode_partial_frame() {
        let encoded = Message::Command(Command::GetState).encode().unwrap();
        assert!(Message::decode(&encoded[..2]).is_err());
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_status_title() {
        let snap = SwitchSnapshot {
            current_sample_rate_khz: Some(44.1),
            detected_sample_rate_khz: Some(96.0),
            ..Default::default()
        };
        assert_eq!(snap.status_title(), "C:44.1 | D:96.0 kHz");

        let only_detected = SwitchSnapshot {
            detected_sample_rate_khz: Some(48.0),
            ..Default::default()
        };
        assert_eq!(only_detected.status_title(), "C:48.0 | D:48.0 kHz");
        assert_eq!(SwitchSnapshot::default().status_title(), "C:- | D:- kHz");
    }
}
