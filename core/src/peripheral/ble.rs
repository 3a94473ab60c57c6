//! btleplug peripheral backend

use super::{
    DiscoveryError, DiscoveryFilter, PeripheralEvent, PeripheralIdentity, PeripheralTransport,
    SERIAL_SERVICE_UUIDS,
};
use crate::link::{ConnectError, SendError};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(4);

struct Session {
    peripheral: Peripheral,
    write_char: Characteristic,
    notify_pump: JoinHandle<()>,
    event_pump: JoinHandle<()>,
}

/// BLE transport over the first system adapter, one session at a time
pub struct BleTransport {
    adapter: Adapter,
    scan_window: Duration,
    session: Mutex<Option<Session>>,
}

impl BleTransport {
    /// Bind to the first available bluetooth adapter
    pub async fn new() -> Result<Self, DiscoveryError> {
        let manager = Manager::new()
            .await
            .map_err(|e| DiscoveryError::AdapterUnavailable(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| DiscoveryError::AdapterUnavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                DiscoveryError::AdapterUnavailable("no bluetooth adapter found".to_string())
            })?;
        Ok(Self {
            adapter,
            scan_window: DEFAULT_SCAN_WINDOW,
            session: Mutex::new(None),
        })
    }

    pub fn with_scan_window(mut self, window: Duration) -> Self {
        self.scan_window = window;
        self
    }

    async fn teardown(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.notify_pump.abort();
            session.event_pump.abort();
            if let Err(e) = session.peripheral.disconnect().await {
                debug!(error = %e, "peripheral disconnect during teardown failed");
            }
        }
    }

    async fn find_peripheral(&self, id: &str) -> Result<Peripheral, ConnectError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;
        peripherals
            .into_iter()
            .find(|p| p.id().to_string() == id)
            .ok_or_else(|| ConnectError::Unreachable(format!("device {} not in range", id)))
    }
}

/// Pick the notify and write characteristics from a discovered peripheral
///
/// Prefers characteristics inside a known serial service; modules like the
/// HC family expose a single FFE1 characteristic that is both notify and
/// write, so the two picks may be the same characteristic.
fn select_characteristics(
    peripheral: &Peripheral,
) -> Result<(Characteristic, Characteristic), ConnectError> {
    let services = peripheral.services();
    let serial_service = services
        .iter()
        .find(|s| SERIAL_SERVICE_UUIDS.contains(&s.uuid));

    let candidates: Vec<&Characteristic> = match serial_service {
        Some(service) => service.characteristics.iter().collect(),
        None => {
            // Fall back to every characteristic on the device; some clones
            // advertise nonstandard service UUIDs around the usual FFE1.
            services
                .iter()
                .flat_map(|s| s.characteristics.iter())
                .collect()
        }
    };
    if candidates.is_empty() {
        return Err(ConnectError::ServiceMissing(
            "no GATT serial service advertised".to_string(),
        ));
    }

    let notify = candidates
        .iter()
        .find(|c| {
            c.properties.contains(CharPropFlags::NOTIFY)
                || c.properties.contains(CharPropFlags::INDICATE)
        })
        .copied()
        .cloned();
    let write = candidates
        .iter()
        .find(|c| {
            c.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
                || c.properties.contains(CharPropFlags::WRITE)
        })
        .copied()
        .cloned();

    match (notify, write) {
        (Some(n), Some(w)) => Ok((n, w)),
        _ => Err(ConnectError::CharacteristicMissing(
            "no notify/write characteristic pair".to_string(),
        )),
    }
}

#[async_trait]
impl PeripheralTransport for BleTransport {
    async fn discover(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<Vec<PeripheralIdentity>, DiscoveryError> {
        let map_scan_err = |e: btleplug::Error| match e {
            btleplug::Error::PermissionDenied => DiscoveryError::PermissionDenied(e.to_string()),
            other => DiscoveryError::ScanFailed(other.to_string()),
        };

        self.adapter
            .start_scan(ScanFilter {
                services: filter.services.clone(),
            })
            .await
            .map_err(map_scan_err)?;
        sleep(self.scan_window).await;
        if let Err(e) = self.adapter.stop_scan().await {
            debug!(error = %e, "stop_scan failed");
        }

        let peripherals = self.adapter.peripherals().await.map_err(map_scan_err)?;
        let mut found = Vec::new();
        for p in peripherals {
            let props = match p.properties().await {
                Ok(Some(props)) => props,
                _ => continue,
            };
            if filter.matches(props.local_name.as_deref(), &props.services) {
                let name = props
                    .local_name
                    .unwrap_or_else(|| "Unknown device".to_string());
                found.push(PeripheralIdentity::new(p.id().to_string(), name));
            }
        }
        info!(count = found.len(), "peripheral scan complete");
        Ok(found)
    }

    async fn connect(
        &self,
        identity: &PeripheralIdentity,
        events: mpsc::UnboundedSender<PeripheralEvent>,
    ) -> Result<(), ConnectError> {
        self.teardown().await;

        let peripheral = self.find_peripheral(&identity.id).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| ConnectError::ServiceMissing(e.to_string()))?;

        let (notify_char, write_char) = select_characteristics(&peripheral)?;
        debug!(
            notify = %notify_char.uuid,
            write = %write_char.uuid,
            "serial characteristics selected"
        );

        peripheral
            .subscribe(&notify_char)
            .await
            .map_err(|e| ConnectError::SubscribeFailed(e.to_string()))?;

        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| ConnectError::SubscribeFailed(e.to_string()))?;
        let data_events = events.clone();
        let notify_pump = tokio::spawn(async move {
            // Only data flows here; the adapter event pump owns the Closed
            // signal so a disconnect is reported exactly once.
            while let Some(notification) = notifications.next().await {
                if data_events
                    .send(PeripheralEvent::Data(notification.value))
                    .is_err()
                {
                    return;
                }
            }
        });

        let device_id = peripheral.id();
        let mut adapter_events = self
            .adapter
            .events()
            .await
            .map_err(|e| ConnectError::SubscribeFailed(e.to_string()))?;
        let event_pump = tokio::spawn(async move {
            while let Some(event) = adapter_events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == device_id {
                        let _ = events.send(PeripheralEvent::Closed);
                        return;
                    }
                }
            }
        });

        info!(device = %identity, "peripheral connected");
        *self.session.lock().await = Some(Session {
            peripheral,
            write_char,
            notify_pump,
            event_pump,
        });
        Ok(())
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), SendError> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(SendError::NotConnected)?;
        session
            .peripheral
            .write(&session.write_char, bytes, WriteType::WithoutResponse)
            .await
            .map_err(|e| {
                warn!(error = %e, "gatt write failed");
                SendError::Transport(e.to_string())
            })
    }

    async fn disconnect(&self) {
        self.teardown().await;
    }
}
