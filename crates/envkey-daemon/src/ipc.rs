//! The daemon's local IPC surface: the binary `/fetch` response body and
//! the line-delimited TCP notification alphabet.
//!
//! Both ends of each format live in this module so the encoder and decoder
//! can't drift apart. The binary encoding is private to this machine; only
//! symmetry matters.

pub use envkey_core::EnvMap;
use serde::{Deserialize, Serialize};

use envkey_core::defaults::{DAEMON_HTTP_PORT, DAEMON_TCP_PORT};
pub use envkey_core::defaults::{DEFAULT_ROLLING_PCT, DEFAULT_WATCH_THROTTLE_MS};

/// Loopback address of the daemon's HTTP control surface.
pub fn http_base() -> String {
    format!("http://127.0.0.1:{DAEMON_HTTP_PORT}")
}

/// Loopback address of the daemon's TCP notification stream.
pub fn tcp_addr() -> String {
    format!("127.0.0.1:{DAEMON_TCP_PORT}")
}

/// Body of a successful `/fetch` call: the env now, and the env it
/// replaced when the daemon observed a change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub current_env: EnvMap,
    pub previous_env: EnvMap,
}

impl DaemonResponse {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// One line on a subscriber's TCP stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    EnvUpdate,
    WillReconnect,
    Reconnected,
    ReconnectedNoChange,
    Suspended,
    SuspendedNoChange,
    EnvkeyInvalid,
    ConnectionThrottled,
    StartRolling { batch: u16, total: u16 },
    RollingComplete,
}

impl Notification {
    /// The wire line, without the trailing newline.
    pub fn as_line(&self) -> String {
        match self {
            Notification::EnvUpdate => "env_update".to_string(),
            Notification::WillReconnect => "will_reconnect".to_string(),
            Notification::Reconnected => "reconnected".to_string(),
            Notification::ReconnectedNoChange => "reconnected_no_change".to_string(),
            Notification::Suspended => "suspended".to_string(),
            Notification::SuspendedNoChange => "suspended_no_change".to_string(),
            Notification::EnvkeyInvalid => "envkey_invalid".to_string(),
            Notification::ConnectionThrottled => "connection_throttled".to_string(),
            Notification::StartRolling { batch, total } => {
                format!("start_rolling|{batch}|{total}")
            }
            Notification::RollingComplete => "rolling_complete".to_string(),
        }
    }

    /// Parse a received line. Anything unrecognized is an env update, so
    /// an older daemon can still drive a newer client.
    pub fn parse(line: &str) -> Notification {
        let line = line.trim();
        match line {
            "will_reconnect" => Notification::WillReconnect,
            "reconnected" => Notification::Reconnected,
            "reconnected_no_change" => Notification::ReconnectedNoChange,
            "suspended" => Notification::Suspended,
            "suspended_no_change" => Notification::SuspendedNoChange,
            "envkey_invalid" => Notification::EnvkeyInvalid,
            "connection_throttled" => Notification::ConnectionThrottled,
            "rolling_complete" => Notification::RollingComplete,
            _ => {
                if let Some(rest) = line.strip_prefix("start_rolling|") {
                    if let Some((batch, total)) = rest.split_once('|') {
                        if let (Ok(batch), Ok(total)) = (batch.parse(), total.parse()) {
                            return Notification::StartRolling { batch, total };
                        }
                    }
                }
                Notification::EnvUpdate
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_encode_decode_symmetry() {
        let mut current = EnvMap::new();
        current.insert("GO_TEST".into(), "it".into());
        let mut previous = EnvMap::new();
        previous.insert("GO_TEST".into(), "was".into());

        let response = DaemonResponse {
            current_env: current,
            previous_env: previous,
        };

        let decoded = DaemonResponse::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_empty_response_roundtrip() {
        let response = DaemonResponse::default();
        let decoded = DaemonResponse::decode(&response.encode().unwrap()).unwrap();
        assert!(decoded.current_env.is_empty());
        assert!(decoded.previous_env.is_empty());
    }

    #[test]
    fn test_notification_lines_roundtrip() {
        let all = [
            Notification::EnvUpdate,
            Notification::WillReconnect,
            Notification::Reconnected,
            Notification::ReconnectedNoChange,
            Notification::Suspended,
            Notification::SuspendedNoChange,
            Notification::EnvkeyInvalid,
            Notification::ConnectionThrottled,
            Notification::StartRolling { batch: 2, total: 4 },
            Notification::RollingComplete,
        ];
        for notification in all {
            assert_eq!(Notification::parse(&notification.as_line()), notification);
        }
    }

    #[test]
    fn test_unknown_line_is_env_update() {
        assert_eq!(Notification::parse("mystery"), Notification::EnvUpdate);
        assert_eq!(Notification::parse(""), Notification::EnvUpdate);
        assert_eq!(
            Notification::parse("start_rolling|x|y"),
            Notification::EnvUpdate
        );
    }
}
