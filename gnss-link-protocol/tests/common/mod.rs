//! Shared integration test harness
//!
//! `SimulatedLogger` implements the transport by answering requests the way
//! a logger accessory would, posting the replies on the engine's event channel.

#![allow(dead_code)]

use async_trait::async_trait;
use gnss_link_protocol::gatt::{
    CharacteristicProperties, DEVICE_INFORMATION_SERVICE_UUID, FILE_IN_CHAR_UUID,
    FILE_OUT_CHAR_UUID, FILE_SERVICE_UUID, FIRMWARE_REVISION_CHAR_UUID, GNSS_CONTROL_CHAR_UUID,
    GNSS_MEASUREMENT_CHAR_UUID, GNSS_SERVICE_UUID, START_CONTROL_CHAR_UUID,
    START_RESULT_CHAR_UUID, START_SERVICE_UUID,
};
use gnss_link_protocol::packet::{opcode, FRAME_PAYLOAD_SIZE};
use gnss_link_protocol::{
    Advertisement, AdvertisementPayload, BondStore, CharacteristicInfo, CharacteristicRef,
    DeviceId, EngineConfig, PeripheralInfo, Result, ScanFilter, SessionEngine, SessionHandle,
    Transport, TransportError, TransportEvent, WriteKind,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const DEVICE: DeviceId = DeviceId(Uuid::from_u128(0x6e40_0001));

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("gnss_link_protocol=debug")
        .try_init();
}

/// Engine settings that keep tests fast and deterministic
pub fn test_config() -> EngineConfig {
    EngineConfig {
        upload_settle_delay_ms: 0,
        auto_reconnect: false,
        ..EngineConfig::default()
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    files: HashMap<String, Vec<u8>>,
    listing: Vec<[u8; 22]>,
    mask: u8,
    /// Upload being received: path and bytes so far
    receiving: Option<(String, Vec<u8>)>,
    hold_acks: bool,
    held: Vec<u8>,
    frames_seen: usize,
}

#[derive(Debug)]
pub struct SimulatedLogger {
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<DeviceState>,
}

fn file_ref(uuid: Uuid) -> CharacteristicRef {
    CharacteristicRef::new(FILE_SERVICE_UUID, uuid)
}

fn info(uuid: Uuid) -> CharacteristicInfo {
    CharacteristicInfo {
        uuid,
        properties: CharacteristicProperties::default(),
    }
}

/// 22-byte directory entry dated 2025-01-01
pub fn entry(name: &str, size: u32, attributes: u8) -> [u8; 22] {
    let mut body = [0u8; 22];
    body[0..4].copy_from_slice(&size.to_le_bytes());
    body[4..6].copy_from_slice(&0x5A21u16.to_le_bytes());
    body[8] = attributes;
    body[9..9 + name.len()].copy_from_slice(name.as_bytes());
    body
}

impl SimulatedLogger {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            events,
            state: Mutex::new(DeviceState {
                mask: 0x1F,
                ..Default::default()
            }),
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn notify(&self, characteristic: CharacteristicRef, value: Vec<u8>) {
        self.emit(TransportEvent::ValueUpdated {
            id: DEVICE,
            characteristic,
            value: Ok(value),
        });
    }

    fn notify_file_out(&self, value: Vec<u8>) {
        self.notify(file_ref(FILE_OUT_CHAR_UUID), value);
    }

    pub fn add_file(&self, path: &str, data: Vec<u8>) {
        self.state.lock().unwrap().files.insert(path.to_string(), data);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn set_listing(&self, entries: Vec<[u8; 22]>) {
        self.state.lock().unwrap().listing = entries;
    }

    pub fn mask(&self) -> u8 {
        self.state.lock().unwrap().mask
    }

    /// Stop acknowledging upload frames until [`Self::release_acks`]
    pub fn hold_acks(&self) {
        self.state.lock().unwrap().hold_acks = true;
    }

    /// Acknowledge every held frame and resume acknowledging immediately
    pub fn release_acks(&self) {
        let held = {
            let mut state = self.state.lock().unwrap();
            state.hold_acks = false;
            std::mem::take(&mut state.held)
        };
        for counter in held {
            self.notify_file_out(vec![opcode::DATA_ACK, counter]);
        }
    }

    pub fn held_count(&self) -> usize {
        self.state.lock().unwrap().held.len()
    }

    pub fn frames_seen(&self) -> usize {
        self.state.lock().unwrap().frames_seen
    }

    /// Simulate a link loss
    pub fn drop_link(&self) {
        self.emit(TransportEvent::Disconnected {
            id: DEVICE,
            error: Some(TransportError::other("link supervision timeout")),
        });
    }

    fn on_file_command(&self, data: &[u8]) {
        let Some((&op, body)) = data.split_first() else {
            return;
        };
        let path_of = |bytes: &[u8]| {
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            String::from_utf8_lossy(&bytes[..end]).to_string()
        };

        match op {
            opcode::LIST_DIRECTORY => {
                let listing = self.state.lock().unwrap().listing.clone();
                for body in listing.iter().chain(std::iter::once(&[0u8; 22])) {
                    let mut packet = vec![opcode::DIRECTORY_ENTRY];
                    packet.extend_from_slice(body);
                    self.notify_file_out(packet);
                }
            }
            opcode::READ_FILE => {
                let path = path_of(&body[8..]);
                let Some(contents) = self.file(&path) else {
                    self.notify_file_out(vec![opcode::NAK, opcode::READ_FILE]);
                    return;
                };
                let mut counter = 0u8;
                for chunk in contents.chunks(FRAME_PAYLOAD_SIZE) {
                    let mut packet = vec![opcode::FILE_DATA, counter];
                    packet.extend_from_slice(chunk);
                    self.notify_file_out(packet);
                    counter = counter.wrapping_add(1);
                }
                self.notify_file_out(vec![opcode::FILE_DATA, counter]);
            }
            opcode::OPEN_FOR_WRITE => {
                self.state.lock().unwrap().receiving = Some((path_of(body), Vec::new()));
                self.notify_file_out(vec![opcode::ACK, opcode::OPEN_FOR_WRITE]);
            }
            opcode::FILE_DATA => {
                let Some((&counter, payload)) = body.split_first() else {
                    return;
                };
                let ack_now = {
                    let mut state = self.state.lock().unwrap();
                    state.frames_seen += 1;
                    if let Some((path, buffer)) = state.receiving.as_mut() {
                        if payload.is_empty() {
                            let path = path.clone();
                            let buffer = std::mem::take(buffer);
                            state.files.insert(path, buffer);
                            state.receiving = None;
                        } else {
                            buffer.extend_from_slice(payload);
                        }
                    }
                    if state.hold_acks {
                        state.held.push(counter);
                        false
                    } else {
                        true
                    }
                };
                if ack_now {
                    self.notify_file_out(vec![opcode::DATA_ACK, counter]);
                }
            }
            _ => {}
        }
    }

    fn on_gnss_control(&self, data: &[u8]) {
        let reply = match data {
            [0x01] => vec![0xF0, 0x01, 0x00, self.mask()],
            [0x02, mask] => {
                self.state.lock().unwrap().mask = *mask;
                // acknowledged without echoing the new value
                vec![0xF0, 0x02, 0x00]
            }
            [op, ..] => vec![0xF0, *op, 0x01],
            [] => return,
        };
        self.notify(
            CharacteristicRef::new(GNSS_SERVICE_UUID, GNSS_CONTROL_CHAR_UUID),
            reply,
        );
    }
}

#[async_trait]
impl Transport for SimulatedLogger {
    async fn start_scan(&self, filter: ScanFilter) -> Result<()> {
        let flags = if filter.allow_duplicates { 0x01 } else { 0x00 };
        self.emit(TransportEvent::Advertisement(Advertisement {
            id: DEVICE,
            name: Some("GNSS Logger".to_string()),
            rssi: Some(-58),
            payload: AdvertisementPayload {
                manufacturer_data: Some(vec![flags]),
                services: vec![FILE_SERVICE_UUID],
            },
        }));
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(&self, id: DeviceId) -> Result<()> {
        self.emit(TransportEvent::Connected { id });
        Ok(())
    }

    async fn discover_services(&self, id: DeviceId, _services: &[Uuid]) -> Result<()> {
        self.emit(TransportEvent::ServicesDiscovered {
            id,
            result: Ok(vec![
                FILE_SERVICE_UUID,
                GNSS_SERVICE_UUID,
                START_SERVICE_UUID,
                DEVICE_INFORMATION_SERVICE_UUID,
            ]),
        });
        Ok(())
    }

    async fn discover_characteristics(&self, id: DeviceId, service: Uuid) -> Result<()> {
        let characteristics = match service {
            s if s == FILE_SERVICE_UUID => vec![info(FILE_IN_CHAR_UUID), info(FILE_OUT_CHAR_UUID)],
            s if s == GNSS_SERVICE_UUID => vec![
                info(GNSS_MEASUREMENT_CHAR_UUID),
                info(GNSS_CONTROL_CHAR_UUID),
            ],
            s if s == START_SERVICE_UUID => vec![
                info(START_CONTROL_CHAR_UUID),
                info(START_RESULT_CHAR_UUID),
            ],
            _ => vec![info(FIRMWARE_REVISION_CHAR_UUID)],
        };
        self.emit(TransportEvent::CharacteristicsDiscovered {
            id,
            service,
            result: Ok(characteristics),
        });
        Ok(())
    }

    async fn read(&self, id: DeviceId, characteristic: CharacteristicRef) -> Result<()> {
        let value = if characteristic.uuid == FIRMWARE_REVISION_CHAR_UUID {
            b"3.1.0".to_vec()
        } else {
            Vec::new()
        };
        self.emit(TransportEvent::ValueUpdated {
            id,
            characteristic,
            value: Ok(value),
        });
        Ok(())
    }

    async fn write(
        &self,
        _id: DeviceId,
        characteristic: CharacteristicRef,
        data: &[u8],
        _kind: WriteKind,
    ) -> Result<()> {
        match characteristic.uuid {
            u if u == FILE_IN_CHAR_UUID => self.on_file_command(data),
            u if u == GNSS_CONTROL_CHAR_UUID => self.on_gnss_control(data),
            _ => {}
        }
        Ok(())
    }

    async fn subscribe(&self, _id: DeviceId, _characteristic: CharacteristicRef) -> Result<()> {
        Ok(())
    }

    async fn read_rssi(&self, id: DeviceId) -> Result<()> {
        self.emit(TransportEvent::Rssi { id, result: Ok(-60) });
        Ok(())
    }

    async fn disconnect(&self, id: DeviceId) -> Result<()> {
        self.emit(TransportEvent::Disconnected { id, error: None });
        Ok(())
    }

    async fn resolve_peripheral(&self, _id: DeviceId) -> Option<PeripheralInfo> {
        None
    }
}

/// Spawn an engine wired to a fresh simulated logger
pub fn spawn_engine(
    config: EngineConfig,
    store: Box<dyn BondStore>,
) -> (SessionHandle, Arc<SimulatedLogger>) {
    init_tracing();
    let (tx, rx) = mpsc::unbounded_channel();
    let logger = Arc::new(SimulatedLogger::new(tx));
    let (handle, _task) = SessionEngine::spawn(config, logger.clone(), rx, store);
    (handle, logger)
}

/// Connect to the simulated logger and wait for the operational state
pub async fn connect(handle: &SessionHandle) {
    handle.connect(DEVICE).await.unwrap();
    within(handle.wait_for(|s| s.state.is_connected()))
        .await
        .unwrap();
}

/// Bound a wait so a broken test fails instead of hanging
pub async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}
