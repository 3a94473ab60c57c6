//! Peripheral link — one BLE serial device behind a transport seam
//!
//! The bridge controller is written against [`PeripheralTransport`] only;
//! platform backends (btleplug in [`ble`], the channel-backed fake in
//! `testing`) implement the same capability interface, so a new backend
//! never touches controller logic.

use crate::backoff::{ReconnectConfig, ReconnectState, RetryDecision};
use crate::link::{CloseReason, ConnectError, LinkError, LinkState, SendError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

#[cfg(not(target_arch = "wasm32"))]
pub mod ble;

/// Line terminator the serial modules expect on inbound commands
pub const LINE_TERMINATOR: &str = "\r\n";

/// Known serial-bridge GATT service UUIDs
///
/// FFE0 covers the HC/JDY/MLT module family; the other two are the Nordic
/// UART service and the classic SPP UUID some modules advertise.
pub const SERIAL_SERVICE_UUIDS: [Uuid; 3] = [
    Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb),
    Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e),
    Uuid::from_u128(0x00001101_0000_1000_8000_00805f9b34fb),
];

/// Name prefixes of known serial-bridge module families
pub const SERIAL_NAME_PREFIXES: [&str; 7] = ["HC-", "BT", "JDY", "RN-", "MLT-", "SPP", "UART"];

/// Device family inferred from the advertised name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceClass {
    /// HC-05/HC-06 family
    HcModule,
    /// JDY family
    JdyModule,
    /// BT-prefixed modules
    BtModule,
    /// RN (Roving Networks / Microchip) family
    RnModule,
    /// Anything advertising itself as a serial/UART adapter
    SerialAdapter,
    /// Matched the filter but no known family
    Generic,
}

impl DeviceClass {
    /// Infer the family from an advertised name
    pub fn from_name(name: &str) -> Self {
        let upper = name.to_uppercase();
        if upper.contains("HC-") {
            DeviceClass::HcModule
        } else if upper.contains("JDY") {
            DeviceClass::JdyModule
        } else if upper.contains("RN-") {
            DeviceClass::RnModule
        } else if upper.contains("BT-") || upper.starts_with("BT") {
            DeviceClass::BtModule
        } else if upper.contains("SERIAL") || upper.contains("UART") || upper.contains("SPP") {
            DeviceClass::SerialAdapter
        } else {
            DeviceClass::Generic
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::HcModule => write!(f, "HC-series module"),
            DeviceClass::JdyModule => write!(f, "JDY-series module"),
            DeviceClass::BtModule => write!(f, "BT-series module"),
            DeviceClass::RnModule => write!(f, "RN-series module"),
            DeviceClass::SerialAdapter => write!(f, "serial adapter"),
            DeviceClass::Generic => write!(f, "bluetooth device"),
        }
    }
}

/// One discovered peripheral
///
/// Created at discovery, immutable afterwards; retained across reconnects
/// so the controller can re-dial the last known device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralIdentity {
    /// Opaque platform identifier
    pub id: String,
    /// Advertised name
    pub name: String,
    /// Family inferred from the name
    pub class: DeviceClass,
}

impl PeripheralIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        let class = DeviceClass::from_name(&name);
        Self {
            id: id.into(),
            name,
            class,
        }
    }
}

impl fmt::Display for PeripheralIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.class)
    }
}

/// Capability filter for discovery
///
/// A peripheral matches if it advertises one of the service UUIDs or its
/// name starts with one of the prefixes.
#[derive(Debug, Clone)]
pub struct DiscoveryFilter {
    pub services: Vec<Uuid>,
    pub name_prefixes: Vec<String>,
}

impl Default for DiscoveryFilter {
    fn default() -> Self {
        Self {
            services: SERIAL_SERVICE_UUIDS.to_vec(),
            name_prefixes: SERIAL_NAME_PREFIXES.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl DiscoveryFilter {
    /// Check a discovered device against the filter
    pub fn matches(&self, name: Option<&str>, services: &[Uuid]) -> bool {
        if services.iter().any(|s| self.services.contains(s)) {
            return true;
        }
        match name {
            Some(name) => {
                let upper = name.to_uppercase();
                self.name_prefixes
                    .iter()
                    .any(|p| upper.starts_with(&p.to_uppercase()))
            }
            None => false,
        }
    }
}

/// Errors raised during discovery
///
/// Non-fatal and never retried: surfaced to the UI collaborator as-is.
/// User cancellation and "nothing found" are an empty result list, not an
/// error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("bluetooth permission denied: {0}")]
    PermissionDenied(String),

    #[error("scan failed: {0}")]
    ScanFailed(String),
}

/// Events a peripheral backend streams into the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralEvent {
    /// Notification payload from the serial characteristic
    Data(Vec<u8>),
    /// The underlying connection went away
    Closed,
}

/// Capability interface every peripheral backend implements
#[async_trait]
pub trait PeripheralTransport: Send + Sync {
    /// Scan for nearby peripherals matching the filter
    ///
    /// Always returns the full list; picking one (even when there is
    /// exactly one) is the caller's policy.
    async fn discover(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<Vec<PeripheralIdentity>, DiscoveryError>;

    /// Connect, negotiate the serial characteristic and start notifications
    ///
    /// Inbound data and disconnects are streamed into `events`.
    async fn connect(
        &self,
        identity: &PeripheralIdentity,
        events: mpsc::UnboundedSender<PeripheralEvent>,
    ) -> Result<(), ConnectError>;

    /// Write bytes to the serial characteristic
    async fn send(&self, bytes: &[u8]) -> Result<(), SendError>;

    /// Tear down the session; idempotent
    async fn disconnect(&self);
}

/// State machine for the one peripheral connection the bridge owns
///
/// All mutation happens inside the controller actor, so transitions are
/// serial and a connect attempt always reaches a terminal outcome before
/// the next one starts.
pub struct PeripheralLink {
    transport: Arc<dyn PeripheralTransport>,
    state: LinkState,
    identity: Option<PeripheralIdentity>,
    retry: ReconnectState,
    local_close: bool,
    last_error: Option<LinkError>,
}

impl PeripheralLink {
    pub fn new(transport: Arc<dyn PeripheralTransport>) -> Self {
        Self {
            transport,
            state: LinkState::Disconnected,
            identity: None,
            retry: ReconnectState::new(),
            local_close: false,
            last_error: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Last identity a connect was attempted against
    pub fn identity(&self) -> Option<&PeripheralIdentity> {
        self.identity.as_ref()
    }

    pub fn last_error(&self) -> Option<&LinkError> {
        self.last_error.as_ref()
    }

    pub fn retry_attempt(&self) -> u32 {
        self.retry.attempt()
    }

    /// Establish the connection and start notifications
    ///
    /// `Disconnected`/`Reconnecting` -> `Connecting` -> `Connected`, or back
    /// to `Disconnected` on failure with the error recorded.
    pub async fn connect(
        &mut self,
        identity: PeripheralIdentity,
        events: mpsc::UnboundedSender<PeripheralEvent>,
    ) -> Result<(), ConnectError> {
        if self.state == LinkState::Connected {
            // Re-dialing (possibly a different device) releases the old
            // session first; one active connection per link.
            self.transport.disconnect().await;
        }
        self.state = LinkState::Connecting;
        self.local_close = false;
        self.identity = Some(identity.clone());

        match self.transport.connect(&identity, events).await {
            Ok(()) => {
                self.state = LinkState::Connected;
                self.retry.reset();
                self.last_error = None;
                Ok(())
            }
            Err(err) => {
                self.state = LinkState::Disconnected;
                self.last_error = Some(err.clone().into());
                Err(err)
            }
        }
    }

    /// Write to the serial characteristic, failing fast when not connected
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), SendError> {
        if !self.state.is_connected() {
            return Err(SendError::NotConnected);
        }
        match self.transport.send(bytes).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.last_error = Some(err.clone().into());
                Err(err)
            }
        }
    }

    /// Local, clean disconnect; idempotent
    pub async fn disconnect(&mut self) {
        self.local_close = true;
        self.transport.disconnect().await;
        self.state = LinkState::Disconnected;
    }

    /// Classify a transport close event
    ///
    /// Consumes the local-close marker: only a close directly caused by
    /// [`PeripheralLink::disconnect`] is clean.
    pub fn classify_close(&mut self) -> CloseReason {
        if std::mem::take(&mut self.local_close) {
            CloseReason::Clean
        } else {
            CloseReason::Abnormal
        }
    }

    /// Enter the reconnecting state after an abnormal close
    pub fn begin_reconnect(&mut self) {
        debug!(state = %self.state, "peripheral link entering reconnect");
        self.state = LinkState::Reconnecting;
    }

    /// Consult the reconnect policy
    pub fn schedule_retry(&mut self, config: &ReconnectConfig) -> RetryDecision {
        self.retry.schedule(config)
    }

    /// Manual reconnect request: forget accumulated attempts
    pub fn reset_retry(&mut self) {
        self.retry.reset();
        if matches!(self.last_error, Some(LinkError::GivenUp { .. })) {
            self.last_error = None;
        }
    }

    /// Ceiling reached: terminal until a manual reconnect
    pub fn mark_given_up(&mut self) {
        self.last_error = Some(LinkError::GivenUp {
            attempts: self.retry.attempt(),
        });
        self.state = LinkState::Disconnected;
    }
}
