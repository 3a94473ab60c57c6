//! Link lifecycle types shared by the peripheral and server links
//!
//! Each link owns exactly one [`LinkState`]; the two links never share
//! state, and only the bridge controller mutates it.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identifies one of the two links the bridge controller owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkKind {
    /// The BLE serial peripheral link
    Peripheral,
    /// The relay server link
    Server,
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKind::Peripheral => write!(f, "peripheral"),
            LinkKind::Server => write!(f, "server"),
        }
    }
}

/// Connection lifecycle state machine, tracked independently per link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// No connection and no retry pending
    Disconnected,
    /// A connect attempt is in flight
    Connecting,
    /// Fully connected
    Connected,
    /// Connection lost, a retry is scheduled
    Reconnecting,
}

impl LinkState {
    /// Check if the link is usable for sending
    pub fn is_connected(&self) -> bool {
        *self == LinkState::Connected
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Why a connection went away
///
/// A close is clean only if it was the direct result of a local
/// `disconnect()` call. Every other close is abnormal and schedules a
/// reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Clean,
    Abnormal,
}

/// Errors raised while establishing a connection
///
/// Non-fatal: a failed connect degrades the link and feeds the
/// reconnect policy, never the whole bridge.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("serial service not found: {0}")]
    ServiceMissing(String),

    #[error("serial characteristic not found: {0}")]
    CharacteristicMissing(String),

    #[error("notification subscription failed: {0}")]
    SubscribeFailed(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("no last-known identity to reconnect to")]
    NoLastKnown,

    #[error("bridge controller stopped")]
    BridgeStopped,
}

/// Errors raised while writing to a link
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// Write attempted while the link is not `Connected`. Checked before
    /// touching the transport so we fail fast instead of writing into an
    /// absent session.
    #[error("link is not connected")]
    NotConnected,

    #[error("write failed: {0}")]
    Transport(String),
}

/// The last failure recorded against a link, surfaced in status snapshots
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Send(#[from] SendError),

    /// Reconnect ceiling reached. Terminal for the link until a manual
    /// `force_reconnect`.
    #[error("gave up after {attempts} reconnect attempts")]
    GivenUp { attempts: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_state_display() {
        assert_eq!(LinkState::Disconnected.to_string(), "disconnected");
        assert_eq!(LinkState::Connecting.to_string(), "connecting");
        assert_eq!(LinkState::Connected.to_string(), "connected");
        assert_eq!(LinkState::Reconnecting.to_string(), "reconnecting");
    }

    #[test]
    fn test_only_connected_is_connected() {
        assert!(LinkState::Connected.is_connected());
        assert!(!LinkState::Disconnected.is_connected());
        assert!(!LinkState::Connecting.is_connected());
        assert!(!LinkState::Reconnecting.is_connected());
    }

    #[test]
    fn test_link_kind_display() {
        assert_eq!(LinkKind::Peripheral.to_string(), "peripheral");
        assert_eq!(LinkKind::Server.to_string(), "server");
    }

    #[test]
    fn test_send_error_display() {
        assert_eq!(SendError::NotConnected.to_string(), "link is not connected");
        assert!(SendError::Transport("gatt write refused".into())
            .to_string()
            .contains("gatt write refused"));
    }

    #[test]
    fn test_link_error_wraps_typed_kinds() {
        let err: LinkError = SendError::NotConnected.into();
        assert_eq!(err, LinkError::Send(SendError::NotConnected));

        let err: LinkError = ConnectError::Unreachable("down".into()).into();
        assert!(matches!(err, LinkError::Connect(_)));

        let err = LinkError::GivenUp { attempts: 10 };
        assert!(err.to_string().contains("10 reconnect attempts"));
    }
}
