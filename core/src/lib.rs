//! BLE-serial to WebSocket bridge
//!
//! Connects one Bluetooth LE serial peripheral (HC-05/06, JDY, Nordic UART
//! and friends) to one relay server over WebSocket and forwards traffic in
//! both directions. The two links reconnect independently with exponential
//! backoff; a frame that arrives while its egress link is down is dropped,
//! never buffered.
//!
//! The entry point is [`bridge::BridgeController::spawn`], which returns a
//! cloneable [`bridge::BridgeHandle`] plus an event stream for UI or log
//! consumers. Platform backends plug in behind
//! [`peripheral::PeripheralTransport`] and [`server::ServerTransport`].

pub mod backoff;
pub mod bridge;
pub mod config;
pub mod frame;
pub mod link;
pub mod peripheral;
pub mod server;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use backoff::{ReconnectConfig, RetryDecision};
pub use bridge::{BridgeController, BridgeEvent, BridgeHandle, BridgeStatus};
pub use config::{BridgeConfig, ConfigStore, JsonFileStore, MemoryStore};
pub use frame::{Direction, Frame};
pub use link::{CloseReason, ConnectError, LinkError, LinkKind, LinkState, SendError};
pub use peripheral::{
    DeviceClass, DiscoveryError, DiscoveryFilter, PeripheralEvent, PeripheralIdentity,
    PeripheralTransport,
};
pub use server::{ServerTransport, ServerTransportEvent};
