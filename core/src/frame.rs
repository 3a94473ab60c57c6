//! Forwarded payload units
//!
//! A [`Frame`] is one opaque payload crossing the bridge, tagged with its
//! direction and a sequence number assigned at ingress. Frames are
//! immutable once created; ownership moves from the ingress link through
//! the controller to the egress link, and a frame that cannot be delivered
//! immediately is dropped, never buffered.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which way a frame is travelling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    PeripheralToServer,
    ServerToPeripheral,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::PeripheralToServer => write!(f, "peripheral->server"),
            Direction::ServerToPeripheral => write!(f, "server->peripheral"),
        }
    }
}

/// One forwarded payload unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Monotonically increasing, assigned by the controller at ingress
    pub seq: u64,
    pub direction: Direction,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(seq: u64, direction: Direction, payload: Vec<u8>) -> Self {
        Self {
            seq,
            direction,
            payload,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame {{ seq: {}, direction: {}, len: {} }}",
            self.seq,
            self.direction,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_display() {
        assert_eq!(
            Direction::PeripheralToServer.to_string(),
            "peripheral->server"
        );
        assert_eq!(
            Direction::ServerToPeripheral.to_string(),
            "server->peripheral"
        );
    }

    #[test]
    fn test_frame_carries_payload_unchanged() {
        let frame = Frame::new(7, Direction::PeripheralToServer, b"OK\r\n".to_vec());
        assert_eq!(frame.seq, 7);
        assert_eq!(frame.payload, b"OK\r\n");
    }

    #[test]
    fn test_frame_display_reports_length_not_contents() {
        let frame = Frame::new(1, Direction::ServerToPeripheral, vec![0xff; 16]);
        let text = frame.to_string();
        assert!(text.contains("seq: 1"));
        assert!(text.contains("len: 16"));
        assert!(!text.contains("255"));
    }
}
