//! Device registry
//!
//! Tracks bonded ("known") accessories and accessories currently
//! advertising pairing mode.
//!
//! ## Lifecycle
//!
//! 1. **Sighting**: a record is created on the first advertisement or when
//!    a bonded identity is resolved by the transport
//! 2. **Updates**: advertisements, connects, disconnects and RSSI reads
//!    mutate the record in place
//! 3. **Removal**: only an explicit forget, or the pairing-disappearance
//!    timer for a device that never bonded
//!
//! Records compare and hash by identity alone.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

/// Bit in the first manufacturer-data byte set while the accessory accepts pairing
pub const PAIRING_MODE_FLAG: u8 = 0x01;

/// Stable 128-bit device identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub Uuid);

impl DeviceId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(DeviceId)
    }
}

impl From<Uuid> for DeviceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Raw advertisement content relevant to the registry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisementPayload {
    /// Manufacturer-specific data, company identifier stripped
    pub manufacturer_data: Option<Vec<u8>>,
    /// Advertised service UUIDs
    pub services: Vec<Uuid>,
}

impl AdvertisementPayload {
    /// Whether the accessory announces pairing mode
    pub fn is_pairing_mode(&self) -> bool {
        self.manufacturer_data
            .as_ref()
            .and_then(|d| d.first())
            .is_some_and(|b| b & PAIRING_MODE_FLAG != 0)
    }
}

/// One advertisement sighting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub id: DeviceId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub payload: AdvertisementPayload,
}

/// An accessory the registry knows about
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub name: Option<String>,
    /// Last observed signal strength in dBm
    pub rssi: Option<i16>,
    pub is_connected: bool,
    pub is_advertising_pairing_mode: bool,
    pub is_bonded: bool,
}

impl DeviceRecord {
    pub fn new(id: DeviceId) -> Self {
        Self {
            id,
            name: None,
            rssi: None,
            is_connected: false,
            is_advertising_pairing_mode: false,
            is_bonded: false,
        }
    }

    /// Name for display, falling back to the identity
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.to_string())
    }
}

impl PartialEq for DeviceRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DeviceRecord {}

impl Hash for DeviceRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Stronger signal first, unknown signal last
fn by_rssi(a: &DeviceRecord, b: &DeviceRecord) -> Ordering {
    match (a.rssi, b.rssi) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn known_order(a: &DeviceRecord, b: &DeviceRecord) -> Ordering {
    b.is_connected
        .cmp(&a.is_connected)
        .then_with(|| by_rssi(a, b))
        .then_with(|| a.display_name().cmp(&b.display_name()))
}

fn pairing_order(a: &DeviceRecord, b: &DeviceRecord) -> Ordering {
    by_rssi(a, b).then_with(|| a.display_name().cmp(&b.display_name()))
}

/// Registry of known and pairing-candidate devices
#[derive(Debug, Default, Clone)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, DeviceRecord>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &DeviceId) -> Option<&DeviceRecord> {
        self.devices.get(id)
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Record an advertisement
    ///
    /// Returns `true` when the device is now a pairing candidate, meaning
    /// its disappearance timer should be (re)armed.
    pub fn observe(&mut self, adv: &Advertisement, bonded: bool) -> bool {
        let record = self.devices.entry(adv.id).or_insert_with(|| {
            debug!("New device sighted: {}", adv.id);
            DeviceRecord::new(adv.id)
        });
        if adv.name.is_some() {
            record.name = adv.name.clone();
        }
        if adv.rssi.is_some() {
            record.rssi = adv.rssi;
        }
        record.is_bonded = bonded;
        record.is_advertising_pairing_mode = adv.payload.is_pairing_mode();
        record.is_advertising_pairing_mode && !record.is_bonded
    }

    /// Ensure a record exists for an identity resolved without an advertisement
    pub fn ensure(&mut self, id: DeviceId, name: Option<String>, bonded: bool) -> &DeviceRecord {
        let record = self
            .devices
            .entry(id)
            .or_insert_with(|| DeviceRecord::new(id));
        if name.is_some() {
            record.name = name;
        }
        record.is_bonded = bonded;
        record
    }

    pub fn set_connected(&mut self, id: &DeviceId, connected: bool) {
        if let Some(record) = self.devices.get_mut(id) {
            record.is_connected = connected;
        }
    }

    /// Clear every connected flag (adapter powered off)
    pub fn clear_connected(&mut self) {
        for record in self.devices.values_mut() {
            record.is_connected = false;
        }
    }

    pub fn set_rssi(&mut self, id: &DeviceId, rssi: i16) {
        if let Some(record) = self.devices.get_mut(id) {
            record.rssi = Some(rssi);
        }
    }

    pub fn set_bonded(&mut self, id: &DeviceId, bonded: bool) {
        if let Some(record) = self.devices.get_mut(id) {
            record.is_bonded = bonded;
            if bonded {
                record.is_advertising_pairing_mode = false;
            }
        }
    }

    /// Remove a device outright (forget)
    pub fn remove(&mut self, id: &DeviceId) -> Option<DeviceRecord> {
        let removed = self.devices.remove(id);
        if removed.is_some() {
            info!("Removed device {}", id);
        }
        removed
    }

    /// Pairing advertisement timed out
    ///
    /// Bonded or connected devices are kept. Returns whether the record
    /// was removed.
    pub fn expire_pairing(&mut self, id: &DeviceId) -> bool {
        let expired = self
            .devices
            .get(id)
            .is_some_and(|r| !r.is_bonded && !r.is_connected);
        if expired {
            debug!("Pairing advertisement from {} disappeared", id);
            self.devices.remove(id);
        }
        expired
    }

    /// Bonded devices, connected first then by signal strength
    pub fn known_devices(&self) -> Vec<DeviceRecord> {
        let mut list: Vec<_> = self
            .devices
            .values()
            .filter(|r| r.is_bonded)
            .cloned()
            .collect();
        list.sort_by(known_order);
        list
    }

    /// Unbonded devices advertising pairing mode, strongest first
    pub fn pairing_devices(&self) -> Vec<DeviceRecord> {
        let mut list: Vec<_> = self
            .devices
            .values()
            .filter(|r| r.is_advertising_pairing_mode && !r.is_bonded)
            .cloned()
            .collect();
        list.sort_by(pairing_order);
        list
    }
}
