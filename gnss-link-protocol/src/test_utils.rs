//! Test utilities
//!
//! A recording [`Transport`] for driving the session engine without a radio.

use crate::device::DeviceId;
use crate::gatt::CharacteristicRef;
use crate::transport::{PeripheralInfo, ScanFilter, Transport, WriteKind};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use uuid::Uuid;

/// One request the engine issued
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    StartScan(ScanFilter),
    StopScan,
    Connect(DeviceId),
    DiscoverServices(DeviceId),
    DiscoverCharacteristics(DeviceId, Uuid),
    Read(CharacteristicRef),
    Write {
        characteristic: CharacteristicRef,
        data: Vec<u8>,
        kind: WriteKind,
    },
    Subscribe(CharacteristicRef),
    ReadRssi(DeviceId),
    Disconnect(DeviceId),
}

/// Accepts every request and records it
#[derive(Debug, Default)]
pub struct MockTransport {
    calls: Mutex<Vec<TransportCall>>,
    resolvable: Mutex<HashSet<DeviceId>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Payloads written to a characteristic, in order
    pub fn writes_to(&self, uuid: Uuid) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Write {
                    characteristic,
                    data,
                    ..
                } if characteristic.uuid == uuid => Some(data),
                _ => None,
            })
            .collect()
    }

    pub fn make_resolvable(&self, id: DeviceId) {
        self.resolvable.lock().unwrap().insert(id);
    }

    fn record(&self, call: TransportCall) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start_scan(&self, filter: ScanFilter) -> Result<()> {
        self.record(TransportCall::StartScan(filter))
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(TransportCall::StopScan)
    }

    async fn connect(&self, id: DeviceId) -> Result<()> {
        self.record(TransportCall::Connect(id))
    }

    async fn discover_services(&self, id: DeviceId, _services: &[Uuid]) -> Result<()> {
        self.record(TransportCall::DiscoverServices(id))
    }

    async fn discover_characteristics(&self, id: DeviceId, service: Uuid) -> Result<()> {
        self.record(TransportCall::DiscoverCharacteristics(id, service))
    }

    async fn read(&self, _id: DeviceId, characteristic: CharacteristicRef) -> Result<()> {
        self.record(TransportCall::Read(characteristic))
    }

    async fn write(
        &self,
        _id: DeviceId,
        characteristic: CharacteristicRef,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<()> {
        self.record(TransportCall::Write {
            characteristic,
            data: data.to_vec(),
            kind,
        })
    }

    async fn subscribe(&self, _id: DeviceId, characteristic: CharacteristicRef) -> Result<()> {
        self.record(TransportCall::Subscribe(characteristic))
    }

    async fn read_rssi(&self, id: DeviceId) -> Result<()> {
        self.record(TransportCall::ReadRssi(id))
    }

    async fn disconnect(&self, id: DeviceId) -> Result<()> {
        self.record(TransportCall::Disconnect(id))
    }

    async fn resolve_peripheral(&self, id: DeviceId) -> Option<PeripheralInfo> {
        self.resolvable
            .lock()
            .unwrap()
            .contains(&id)
            .then(|| PeripheralInfo {
                id,
                name: Some("GNSS Logger".to_string()),
            })
    }
}
