//! btleplug-backed transport
//!
//! Maps [`Transport`] requests onto the platform BLE central. Every request
//! runs on its own task and reports back through the event channel, so the
//! session engine never blocks on the radio.
//!
//! Device identities are UUIDv5 digests of the platform peripheral id, which
//! keeps them stable across runs on the same host.
//!
//! Adapter power changes are forwarded as `PoweredOn`/`PoweredOff`; the
//! state at startup is reported once the adapter is open.

use super::{PeripheralInfo, ScanFilter, Transport, TransportEvent, WriteKind};
use crate::device::{Advertisement, AdvertisementPayload, DeviceId};
use crate::error::{TransportError, TransportErrorKind};
use crate::gatt::{CharacteristicInfo, CharacteristicProperties, CharacteristicRef, CharacteristicRole};
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter as BtleScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Namespace for deriving device identities
const DEVICE_ID_NAMESPACE: Uuid = uuid::uuid!("5b1f6a8e-2d43-4c1e-9f77-0e6c3a9d2b10");

fn device_id(peripheral: &PeripheralId) -> DeviceId {
    let raw = format!("{:?}", peripheral);
    DeviceId(Uuid::new_v5(&DEVICE_ID_NAMESPACE, raw.as_bytes()))
}

fn map_error(error: btleplug::Error) -> TransportError {
    let message = error.to_string();
    let lower = message.to_lowercase();
    let kind = match error {
        btleplug::Error::NotConnected => TransportErrorKind::NotConnected,
        btleplug::Error::TimedOut(_) => TransportErrorKind::Timeout,
        btleplug::Error::PermissionDenied => TransportErrorKind::InsufficientAuthentication,
        _ if lower.contains("authentication") => TransportErrorKind::InsufficientAuthentication,
        _ if lower.contains("encryption") => TransportErrorKind::InsufficientEncryption,
        _ => TransportErrorKind::Other,
    };
    TransportError::new(kind, message)
}

fn map_properties(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

fn power_event(state: CentralState) -> Option<TransportEvent> {
    match state {
        CentralState::PoweredOn => Some(TransportEvent::PoweredOn),
        CentralState::PoweredOff => Some(TransportEvent::PoweredOff),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct Shared {
    peripherals: HashMap<DeviceId, Peripheral>,
    /// Disconnects we asked for, reported without an error
    requested_disconnects: HashSet<DeviceId>,
    /// Peripherals with a running notification pump
    pumps: HashMap<DeviceId, JoinHandle<()>>,
}

/// Transport over the first system Bluetooth adapter
#[derive(Debug)]
pub struct BtleplugTransport {
    adapter: Adapter,
    events: mpsc::UnboundedSender<TransportEvent>,
    shared: Arc<Mutex<Shared>>,
    central_task: JoinHandle<()>,
}

impl BtleplugTransport {
    /// Open the first adapter and start forwarding central events
    pub async fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Result<Self> {
        let manager = Manager::new().await.map_err(|e| {
            ProtocolError::Transport(TransportError::other(format!(
                "Failed to create BLE manager: {}",
                e
            )))
        })?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| ProtocolError::Transport(map_error(e)))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ProtocolError::Transport(TransportError::other("No Bluetooth adapter found"))
            })?;

        let shared = Arc::new(Mutex::new(Shared::default()));
        let central_task = Self::spawn_central_pump(&adapter, events.clone(), shared.clone()).await?;
        match adapter.adapter_state().await {
            Ok(state) => {
                debug!("Adapter state at startup: {:?}", state);
                if let Some(event) = power_event(state) {
                    let _ = events.send(event);
                }
            }
            Err(e) => debug!("Adapter state unavailable: {}", e),
        }
        info!("BLE transport ready");

        Ok(Self {
            adapter,
            events,
            shared,
            central_task,
        })
    }

    async fn spawn_central_pump(
        adapter: &Adapter,
        events: mpsc::UnboundedSender<TransportEvent>,
        shared: Arc<Mutex<Shared>>,
    ) -> Result<JoinHandle<()>> {
        let mut stream = adapter
            .events()
            .await
            .map_err(|e| ProtocolError::Transport(map_error(e)))?;
        let adapter = adapter.clone();

        Ok(tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(pid)
                    | CentralEvent::DeviceUpdated(pid)
                    | CentralEvent::ManufacturerDataAdvertisement { id: pid, .. }
                    | CentralEvent::ServicesAdvertisement { id: pid, .. } => {
                        let Ok(peripheral) = adapter.peripheral(&pid).await else {
                            continue;
                        };
                        let props = match peripheral.properties().await {
                            Ok(Some(props)) => props,
                            _ => continue,
                        };
                        let id = device_id(&pid);
                        shared.lock().await.peripherals.insert(id, peripheral);

                        let manufacturer_data = props.manufacturer_data.values().next().cloned();
                        let adv = Advertisement {
                            id,
                            name: props.local_name,
                            rssi: props.rssi,
                            payload: AdvertisementPayload {
                                manufacturer_data,
                                services: props.services,
                            },
                        };
                        if events.send(TransportEvent::Advertisement(adv)).is_err() {
                            break;
                        }
                    }
                    CentralEvent::StateUpdate(state) => {
                        info!("Adapter state changed: {:?}", state);
                        if let Some(event) = power_event(state) {
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    CentralEvent::DeviceDisconnected(pid) => {
                        let id = device_id(&pid);
                        let requested = {
                            let mut guard = shared.lock().await;
                            if let Some(pump) = guard.pumps.remove(&id) {
                                pump.abort();
                            }
                            guard.requested_disconnects.remove(&id)
                        };
                        let error = (!requested)
                            .then(|| TransportError::other("Peripheral disconnected"));
                        if events
                            .send(TransportEvent::Disconnected { id, error })
                            .is_err()
                        {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            debug!("BLE central event stream ended");
        }))
    }

    async fn peripheral(&self, id: DeviceId) -> Result<Peripheral> {
        self.shared
            .lock()
            .await
            .peripherals
            .get(&id)
            .cloned()
            .ok_or_else(|| {
                ProtocolError::Transport(TransportError::other(format!("Unknown peripheral {}", id)))
            })
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        characteristic: CharacteristicRef,
    ) -> std::result::Result<Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service)
            .ok_or_else(|| {
                TransportError::other(format!("Characteristic {} not discovered", characteristic.uuid))
            })
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            warn!("Session engine no longer listening for transport events");
        }
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.central_task.abort();
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn start_scan(&self, filter: ScanFilter) -> Result<()> {
        self.adapter
            .start_scan(BtleScanFilter {
                services: filter.services,
            })
            .await
            .map_err(|e| ProtocolError::Transport(map_error(e)))
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| ProtocolError::Transport(map_error(e)))
    }

    async fn connect(&self, id: DeviceId) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        let events = self.events.clone();
        tokio::spawn(async move {
            let event = match peripheral.connect().await {
                Ok(()) => TransportEvent::Connected { id },
                Err(e) => TransportEvent::ConnectFailed {
                    id,
                    error: map_error(e),
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    async fn discover_services(&self, id: DeviceId, services: &[Uuid]) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        let wanted: HashSet<Uuid> = services.iter().copied().collect();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => Ok(peripheral
                    .services()
                    .into_iter()
                    .map(|s| s.uuid)
                    .filter(|uuid| wanted.is_empty() || wanted.contains(uuid))
                    .collect()),
                Err(e) => Err(map_error(e)),
            };
            let _ = events.send(TransportEvent::ServicesDiscovered { id, result });
        });
        Ok(())
    }

    async fn discover_characteristics(&self, id: DeviceId, service: Uuid) -> Result<()> {
        // btleplug discovers characteristics together with services
        let peripheral = self.peripheral(id).await?;
        let result = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .map(|s| {
                s.characteristics
                    .into_iter()
                    .map(|c| CharacteristicInfo {
                        uuid: c.uuid,
                        properties: map_properties(c.properties),
                    })
                    .collect()
            })
            .ok_or_else(|| TransportError::other(format!("Service {} not found", service)));
        self.emit(TransportEvent::CharacteristicsDiscovered {
            id,
            service,
            result,
        });
        Ok(())
    }

    async fn read(&self, id: DeviceId, characteristic: CharacteristicRef) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        let events = self.events.clone();
        tokio::spawn(async move {
            let value = match Self::find_characteristic(&peripheral, characteristic) {
                Ok(c) => peripheral.read(&c).await.map_err(map_error),
                Err(e) => Err(e),
            };
            let _ = events.send(TransportEvent::ValueUpdated {
                id,
                characteristic,
                value,
            });
        });
        Ok(())
    }

    async fn write(
        &self,
        id: DeviceId,
        characteristic: CharacteristicRef,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        let c = Self::find_characteristic(&peripheral, characteristic)?;
        let write_type = match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        };
        // Awaited in place so frames reach the radio in order
        peripheral
            .write(&c, data, write_type)
            .await
            .map_err(|e| ProtocolError::Transport(map_error(e)))
    }

    async fn subscribe(&self, id: DeviceId, characteristic: CharacteristicRef) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        let c = Self::find_characteristic(&peripheral, characteristic)?;
        peripheral
            .subscribe(&c)
            .await
            .map_err(|e| ProtocolError::Transport(map_error(e)))?;

        let mut shared = self.shared.lock().await;
        if shared.pumps.contains_key(&id) {
            return Ok(());
        }
        let mut stream = peripheral
            .notifications()
            .await
            .map_err(|e| ProtocolError::Transport(map_error(e)))?;
        let events = self.events.clone();
        let pump = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                let Some(role) = CharacteristicRole::from_uuid(notification.uuid) else {
                    continue;
                };
                let characteristic = CharacteristicRef::new(role.service_uuid(), notification.uuid);
                let event = TransportEvent::ValueUpdated {
                    id,
                    characteristic,
                    value: Ok(notification.value),
                };
                if events.send(event).is_err() {
                    break;
                }
            }
        });
        shared.pumps.insert(id, pump);
        Ok(())
    }

    async fn read_rssi(&self, id: DeviceId) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        let result = match peripheral.properties().await {
            Ok(Some(props)) => props
                .rssi
                .ok_or_else(|| TransportError::other("RSSI unavailable")),
            Ok(None) => Err(TransportError::other("Peripheral properties unavailable")),
            Err(e) => Err(map_error(e)),
        };
        self.emit(TransportEvent::Rssi { id, result });
        Ok(())
    }

    async fn disconnect(&self, id: DeviceId) -> Result<()> {
        let peripheral = self.peripheral(id).await?;
        self.shared.lock().await.requested_disconnects.insert(id);
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Disconnect of {} failed: {}", id, e);
                let _ = events.send(TransportEvent::Disconnected {
                    id,
                    error: Some(map_error(e)),
                });
            }
        });
        Ok(())
    }

    async fn resolve_peripheral(&self, id: DeviceId) -> Option<PeripheralInfo> {
        if let Some(peripheral) = self.shared.lock().await.peripherals.get(&id).cloned() {
            let name = peripheral
                .properties()
                .await
                .ok()
                .flatten()
                .and_then(|p| p.local_name);
            return Some(PeripheralInfo { id, name });
        }

        let peripherals = self.adapter.peripherals().await.ok()?;
        for peripheral in peripherals {
            if device_id(&peripheral.id()) == id {
                let name = peripheral
                    .properties()
                    .await
                    .ok()
                    .flatten()
                    .and_then(|p| p.local_name);
                self.shared.lock().await.peripherals.insert(id, peripheral);
                return Some(PeripheralInfo { id, name });
            }
        }
        None
    }
}
