use serde::{Deserialize, Serialize};

use crate::resilience::Phase;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  The TUI checks this on connect and can refuse to talk to
/// an incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a client (TUI or HTTP API) to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Start (or restart) the stream.  `force_reload` re-fetches the source
    /// with a fresh cache-busting stamp before playing.
    Play { force_reload: bool },
    /// Deliberate user pause — sticky until the next Play.
    Pause,
    TogglePause,
    Volume { value: f32 },
    /// The client regained foreground (window focus, terminal un-suspend).
    ForegroundRegained,
    GetState,
}

/// Messages sent from the daemon to clients (broadcasts).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full state snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: DaemonState,
    },
    State {
        data: DaemonState,
    },
    Log {
        message: String,
    },
}

/// Health of the mpv process as observed by the daemon.
///
/// Transitions:
///   Absent -> Starting -> Running -> Dead -> Restarting -> Starting ...
///   Running -> Degraded(reason) -> Running | Dead
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub enum MediaHealth {
    /// mpv process does not exist yet (before first use).
    #[default]
    Absent,
    /// Process is spawning / socket not yet available.
    Starting,
    /// Socket connected, IPC responding normally.
    Running,
    /// Connected but IPC is slow / returning errors.
    Degraded(String),
    /// Process exited or socket closed.
    Dead,
    /// Restarting after death.
    Restarting,
}

impl MediaHealth {
    /// Short label for the status bar (≤5 chars); `None` when nothing needs
    /// the user's attention.
    pub fn badge_label(&self) -> Option<&str> {
        match self {
            MediaHealth::Absent => None,
            MediaHealth::Starting => Some("INIT"),
            MediaHealth::Running => None,
            MediaHealth::Degraded(_) => Some("DEGD"),
            MediaHealth::Dead => Some("DEAD"),
            MediaHealth::Restarting => Some("REST"),
        }
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(
            self,
            MediaHealth::Degraded(_) | MediaHealth::Dead | MediaHealth::Restarting
        )
    }
}

/// Full state of the daemon.  `rev` is a monotonically increasing counter
/// incremented every time the state changes.  Clients can use it to detect
/// missed updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonState {
    /// Monotonic revision counter — incremented on every state change.
    #[serde(default)]
    pub rev: u64,
    pub station_name: String,
    pub station_url: String,
    pub volume: f32,
    pub phase: Phase,
    /// True while the network watcher believes the stream origin is
    /// reachable.
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub media_health: MediaHealth,
}

impl DaemonState {
    pub fn is_playing(&self) -> bool {
        self.phase == Phase::Playing
    }
}

/// Wrapper for socket communication.
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
    fn test_message_encode_decode() {
        let msg = Message::Command(Command::Play { force_reload: true });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::Play { force_reload }) => assert!(force_reload),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_hello_encode_decode() {
        let state = DaemonState {
            rev: 42,
            station_name: "Test FM".into(),
            ..Default::default()
        };
        let msg = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            daemon_rev: 42,
            state,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                daemon_rev,
                state,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(daemon_rev, 42);
                assert_eq!(state.station_name, "Test FM");
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_truncated_frame_is_rejected() {
        let msg = Message::Command(Command::Pause);
        let encoded = msg.encode().unwrap();
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(Message::decode(&encoded[..2]).is_err());
    }
}
