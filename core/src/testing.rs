//! Channel-backed transport fakes shared by unit and integration tests

use crate::link::{ConnectError, SendError};
use crate::peripheral::{
    DiscoveryError, DiscoveryFilter, PeripheralEvent, PeripheralIdentity, PeripheralTransport,
};
use crate::server::{ServerTransport, ServerTransportEvent};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Scriptable in-process peripheral
///
/// Tests drive the device side through [`FakePeripheral::emit_data`] and
/// [`FakePeripheral::drop_link`], and inspect outbound writes via
/// [`FakePeripheral::sent`]. Configured errors are sticky until cleared.
#[derive(Default)]
pub struct FakePeripheral {
    devices: Mutex<Vec<PeripheralIdentity>>,
    discover_error: Mutex<Option<DiscoveryError>>,
    connect_error: Mutex<Option<ConnectError>>,
    send_error: Mutex<Option<SendError>>,
    connected: AtomicBool,
    connect_calls: AtomicU64,
    sent: Mutex<Vec<Vec<u8>>>,
    events: Mutex<Option<mpsc::UnboundedSender<PeripheralEvent>>>,
}

impl FakePeripheral {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, identity: PeripheralIdentity) {
        self.devices.lock().unwrap().push(identity);
    }

    pub fn set_discover_error(&self, error: Option<DiscoveryError>) {
        *self.discover_error.lock().unwrap() = error;
    }

    pub fn set_connect_error(&self, error: Option<ConnectError>) {
        *self.connect_error.lock().unwrap() = error;
    }

    pub fn set_send_error(&self, error: Option<SendError>) {
        *self.send_error.lock().unwrap() = error;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Connect attempts observed, successful or not
    pub fn connect_calls(&self) -> u64 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Everything written to the device so far
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// Simulate a notification from the device
    pub fn emit_data(&self, bytes: &[u8]) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(PeripheralEvent::Data(bytes.to_vec()));
        }
    }

    /// Simulate the device going out of range
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(PeripheralEvent::Closed);
        }
    }
}

#[async_trait]
impl PeripheralTransport for FakePeripheral {
    async fn discover(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<Vec<PeripheralIdentity>, DiscoveryError> {
        if let Some(error) = self.discover_error.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(self
            .devices
            .lock()
            .unwrap()
            .iter()
            .filter(|d| filter.matches(Some(&d.name), &[]))
            .cloned()
            .collect())
    }

    async fn connect(
        &self,
        _identity: &PeripheralIdentity,
        events: mpsc::UnboundedSender<PeripheralEvent>,
    ) -> Result<(), ConnectError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.connect_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.connected.store(true, Ordering::SeqCst);
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), SendError> {
        if let Some(error) = self.send_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.sent.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.events.lock().unwrap().take();
    }
}

/// Scriptable in-process relay server, mirror of [`FakePeripheral`]
#[derive(Default)]
pub struct FakeServer {
    connect_error: Mutex<Option<ConnectError>>,
    send_error: Mutex<Option<SendError>>,
    connected: AtomicBool,
    connect_calls: AtomicU64,
    sent: Mutex<Vec<String>>,
    events: Mutex<Option<mpsc::UnboundedSender<ServerTransportEvent>>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connect_error(&self, error: Option<ConnectError>) {
        *self.connect_error.lock().unwrap() = error;
    }

    pub fn set_send_error(&self, error: Option<SendError>) {
        *self.send_error.lock().unwrap() = error;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> u64 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Every text payload sent, the registration message included
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Simulate an inbound server message
    pub fn push_inbound(&self, text: &str) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(ServerTransportEvent::Message(text.to_string()));
        }
    }

    /// Simulate the connection dropping
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(ServerTransportEvent::Closed);
        }
    }
}

#[async_trait]
impl ServerTransport for FakeServer {
    async fn connect(
        &self,
        _url: &str,
        events: mpsc::UnboundedSender<ServerTransportEvent>,
    ) -> Result<(), ConnectError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.connect_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.connected.store(true, Ordering::SeqCst);
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn send(&self, text: String) -> Result<(), SendError> {
        if let Some(error) = self.send_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.events.lock().unwrap().take();
    }
}
