//! JSON wire messages exchanged with the relay server

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Platform tag sent with registration
pub const PLATFORM: &str = "native";

/// Milliseconds since the Unix epoch, the wire's timestamp format
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Registration control message, sent once per successful connect
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub device_id: String,
    pub timestamp: u64,
    pub platform: String,
}

impl RegisterMessage {
    pub fn new(device_id: &str) -> Self {
        Self {
            kind: "register".to_string(),
            device_id: device_id.to_string(),
            timestamp: now_ms(),
            platform: PLATFORM.to_string(),
        }
    }
}

/// Peripheral data forwarded up to the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub device_id: String,
    pub data: String,
    pub timestamp: u64,
}

impl DataMessage {
    pub fn new(device_id: &str, payload: &[u8]) -> Self {
        Self {
            kind: "data".to_string(),
            device_id: device_id.to_string(),
            data: String::from_utf8_lossy(payload).into_owned(),
            timestamp: now_ms(),
        }
    }
}

/// Telemetry for a command sent from the local side
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandTelemetry {
    pub device_id: String,
    pub command: String,
    pub timestamp: u64,
    pub source: String,
}

impl CommandTelemetry {
    pub fn new(device_id: &str, command: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            command: command.to_string(),
            timestamp: now_ms(),
            source: "native_client".to_string(),
        }
    }
}

/// Raw wire shape of an inbound message, typed by the `type` discriminator
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireInbound {
    Command {
        data: String,
    },
    Registered,
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// A parsed inbound server message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Data to forward to the peripheral
    Command { data: String },
    /// Registration acknowledged; informational only
    Registered,
    /// Server-side error report; informational only
    ServerError { message: String },
    /// Unknown kind, ignored without failing the link
    Ignored,
}

/// Parse an inbound text payload
///
/// Never fails: a payload that does not parse as a known JSON message is
/// treated as a bare command, preserving compatibility with servers that
/// send plain text.
pub fn parse_inbound(text: &str) -> Inbound {
    match serde_json::from_str::<WireInbound>(text) {
        Ok(WireInbound::Command { data }) => Inbound::Command { data },
        Ok(WireInbound::Registered) => Inbound::Registered,
        Ok(WireInbound::Error { message }) => Inbound::ServerError {
            message: message.unwrap_or_default(),
        },
        Ok(WireInbound::Unknown) => Inbound::Ignored,
        Err(_) => Inbound::Command {
            data: text.to_string(),
        },
    }
}

/// Malformed inbound traffic that cannot even be treated as text
///
/// Logged and discarded, never fatal to the link.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("non-text frame of {0} bytes")]
    NonText(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_message_shape() {
        let msg = RegisterMessage::new("bridge-1");
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(json["type"], "register");
        assert_eq!(json["device_id"], "bridge-1");
        assert_eq!(json["platform"], "native");
        assert!(json["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_command_telemetry_shape() {
        let msg = CommandTelemetry::new("bridge-1", "AT+VERSION");
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(json["device_id"], "bridge-1");
        assert_eq!(json["command"], "AT+VERSION");
        assert_eq!(json["source"], "native_client");
        // Telemetry carries no type tag.
        assert!(json.get("type").is_none());
    }

    #[test]
    fn test_data_message_lossy_payload() {
        let msg = DataMessage::new("bridge-1", b"OK\r\n");
        assert_eq!(msg.data, "OK\r\n");
        let msg = DataMessage::new("bridge-1", &[0x4f, 0x4b, 0xff]);
        assert!(msg.data.starts_with("OK"));
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(
            parse_inbound(r#"{"type":"command","data":"AT"}"#),
            Inbound::Command { data: "AT".into() }
        );
    }

    #[test]
    fn test_parse_registered_and_error() {
        assert_eq!(parse_inbound(r#"{"type":"registered"}"#), Inbound::Registered);
        assert_eq!(
            parse_inbound(r#"{"type":"error","message":"unknown device"}"#),
            Inbound::ServerError {
                message: "unknown device".into()
            }
        );
        assert_eq!(
            parse_inbound(r#"{"type":"error"}"#),
            Inbound::ServerError {
                message: String::new()
            }
        );
    }

    #[test]
    fn test_parse_unknown_kind_is_ignored_not_fatal() {
        assert_eq!(parse_inbound(r#"{"type":"heartbeat"}"#), Inbound::Ignored);
    }

    #[test]
    fn test_parse_bare_text_falls_back_to_raw_command() {
        assert_eq!(
            parse_inbound("AT+RESET"),
            Inbound::Command {
                data: "AT+RESET".into()
            }
        );
        // JSON that misses the discriminator entirely is raw too.
        assert_eq!(
            parse_inbound(r#"{"data":"AT"}"#),
            Inbound::Command {
                data: r#"{"data":"AT"}"#.into()
            }
        );
    }

    #[test]
    fn test_now_ms_is_sane() {
        // Anything after 2020-01-01.
        assert!(now_ms() > 1_577_836_800_000);
    }
}
