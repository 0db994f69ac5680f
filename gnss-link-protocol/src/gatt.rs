//! GATT layout of the accessory
//!
//! Service and characteristic UUIDs, the logical role each characteristic
//! plays, and the per-connection table mapping roles to transport handles.

use crate::{ProtocolError, Result};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// File transfer service (directory listing, download, upload)
pub const FILE_SERVICE_UUID: Uuid = uuid::uuid!("6e400001-b5a3-f393-e0a9-e50e24dc4179");

/// File-in characteristic: client → device commands and data (write)
pub const FILE_IN_CHAR_UUID: Uuid = uuid::uuid!("6e400002-b5a3-f393-e0a9-e50e24dc4179");

/// File-out characteristic: device → client responses and data (notify)
pub const FILE_OUT_CHAR_UUID: Uuid = uuid::uuid!("6e400003-b5a3-f393-e0a9-e50e24dc4179");

/// GNSS service (live telemetry and field mask)
pub const GNSS_SERVICE_UUID: Uuid = uuid::uuid!("6e400101-b5a3-f393-e0a9-e50e24dc4179");

/// Live GNSS measurement notifications
pub const GNSS_MEASUREMENT_CHAR_UUID: Uuid =
    uuid::uuid!("6e400102-b5a3-f393-e0a9-e50e24dc4179");

/// GNSS control point (mask get/set)
pub const GNSS_CONTROL_CHAR_UUID: Uuid = uuid::uuid!("6e400103-b5a3-f393-e0a9-e50e24dc4179");

/// Remote start service
pub const START_SERVICE_UUID: Uuid = uuid::uuid!("6e400201-b5a3-f393-e0a9-e50e24dc4179");

/// Start control point (start / cancel countdown)
pub const START_CONTROL_CHAR_UUID: Uuid = uuid::uuid!("6e400202-b5a3-f393-e0a9-e50e24dc4179");

/// Asynchronous start result notifications
pub const START_RESULT_CHAR_UUID: Uuid = uuid::uuid!("6e400203-b5a3-f393-e0a9-e50e24dc4179");

/// Device mode service
pub const DEVICE_SERVICE_UUID: Uuid = uuid::uuid!("6e400301-b5a3-f393-e0a9-e50e24dc4179");

/// Current device mode (read / notify)
pub const DEVICE_MODE_CHAR_UUID: Uuid = uuid::uuid!("6e400302-b5a3-f393-e0a9-e50e24dc4179");

/// Device mode control (write)
pub const DEVICE_CONTROL_CHAR_UUID: Uuid = uuid::uuid!("6e400303-b5a3-f393-e0a9-e50e24dc4179");

/// Bluetooth SIG Device Information service
pub const DEVICE_INFORMATION_SERVICE_UUID: Uuid =
    uuid::uuid!("0000180a-0000-1000-8000-00805f9b34fb");

/// Bluetooth SIG Firmware Revision String characteristic
pub const FIRMWARE_REVISION_CHAR_UUID: Uuid = uuid::uuid!("00002a26-0000-1000-8000-00805f9b34fb");

/// Services requested during service discovery
pub const DISCOVERY_SERVICES: [Uuid; 5] = [
    FILE_SERVICE_UUID,
    GNSS_SERVICE_UUID,
    START_SERVICE_UUID,
    DEVICE_SERVICE_UUID,
    DEVICE_INFORMATION_SERVICE_UUID,
];

/// Logical role of a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CharacteristicRole {
    FileIn,
    FileOut,
    GnssMeasurement,
    GnssControl,
    StartControl,
    StartResult,
    DeviceMode,
    DeviceControl,
    FirmwareRevision,
}

impl CharacteristicRole {
    /// All roles, in discovery order
    pub const ALL: [CharacteristicRole; 9] = [
        CharacteristicRole::FileIn,
        CharacteristicRole::FileOut,
        CharacteristicRole::GnssMeasurement,
        CharacteristicRole::GnssControl,
        CharacteristicRole::StartControl,
        CharacteristicRole::StartResult,
        CharacteristicRole::DeviceMode,
        CharacteristicRole::DeviceControl,
        CharacteristicRole::FirmwareRevision,
    ];

    /// Characteristic UUID for this role
    pub fn uuid(self) -> Uuid {
        match self {
            CharacteristicRole::FileIn => FILE_IN_CHAR_UUID,
            CharacteristicRole::FileOut => FILE_OUT_CHAR_UUID,
            CharacteristicRole::GnssMeasurement => GNSS_MEASUREMENT_CHAR_UUID,
            CharacteristicRole::GnssControl => GNSS_CONTROL_CHAR_UUID,
            CharacteristicRole::StartControl => START_CONTROL_CHAR_UUID,
            CharacteristicRole::StartResult => START_RESULT_CHAR_UUID,
            CharacteristicRole::DeviceMode => DEVICE_MODE_CHAR_UUID,
            CharacteristicRole::DeviceControl => DEVICE_CONTROL_CHAR_UUID,
            CharacteristicRole::FirmwareRevision => FIRMWARE_REVISION_CHAR_UUID,
        }
    }

    /// Service UUID the role lives in
    pub fn service_uuid(self) -> Uuid {
        match self {
            CharacteristicRole::FileIn | CharacteristicRole::FileOut => FILE_SERVICE_UUID,
            CharacteristicRole::GnssMeasurement | CharacteristicRole::GnssControl => {
                GNSS_SERVICE_UUID
            }
            CharacteristicRole::StartControl | CharacteristicRole::StartResult => {
                START_SERVICE_UUID
            }
            CharacteristicRole::DeviceMode | CharacteristicRole::DeviceControl => {
                DEVICE_SERVICE_UUID
            }
            CharacteristicRole::FirmwareRevision => DEVICE_INFORMATION_SERVICE_UUID,
        }
    }

    /// Map a characteristic UUID back to its role
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.uuid() == uuid)
    }

    /// Whether the engine subscribes to notifications on this role
    pub fn is_notify_source(self) -> bool {
        matches!(
            self,
            CharacteristicRole::FileOut
                | CharacteristicRole::GnssMeasurement
                | CharacteristicRole::GnssControl
                | CharacteristicRole::StartControl
                | CharacteristicRole::StartResult
                | CharacteristicRole::DeviceMode
        )
    }

    /// Stable kebab-case name
    pub fn as_str(self) -> &'static str {
        match self {
            CharacteristicRole::FileIn => "file-in",
            CharacteristicRole::FileOut => "file-out",
            CharacteristicRole::GnssMeasurement => "gnss-measurement",
            CharacteristicRole::GnssControl => "gnss-control",
            CharacteristicRole::StartControl => "start-control",
            CharacteristicRole::StartResult => "start-result",
            CharacteristicRole::DeviceMode => "device-mode",
            CharacteristicRole::DeviceControl => "device-control",
            CharacteristicRole::FirmwareRevision => "firmware-revision",
        }
    }
}

impl fmt::Display for CharacteristicRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-level handle of a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    /// Owning service
    pub service: Uuid,
    /// Characteristic UUID
    pub uuid: Uuid,
}

impl CharacteristicRef {
    pub fn new(service: Uuid, uuid: Uuid) -> Self {
        Self { service, uuid }
    }
}

/// GATT properties advertised by a characteristic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    /// Whether the characteristic accepts any kind of write
    pub fn writable(&self) -> bool {
        self.write || self.write_without_response
    }

    /// Whether the characteristic can push values
    pub fn pushes_values(&self) -> bool {
        self.notify || self.indicate
    }
}

/// A characteristic reported by characteristic discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// Role → handle table for the connected peripheral
///
/// Populated during characteristic discovery and cleared on disconnect.
#[derive(Debug, Default, Clone)]
pub struct CharacteristicTable {
    entries: HashMap<CharacteristicRole, CharacteristicRef>,
}

impl CharacteristicTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the characteristics discovered for one service
    ///
    /// Returns the roles that were recognised.
    pub fn record_service(
        &mut self,
        service: Uuid,
        characteristics: &[CharacteristicInfo],
    ) -> Vec<CharacteristicRole> {
        let mut found = Vec::new();
        for info in characteristics {
            let Some(role) = CharacteristicRole::from_uuid(info.uuid) else {
                continue;
            };
            if role.service_uuid() != service {
                continue;
            }
            self.entries
                .insert(role, CharacteristicRef::new(service, info.uuid));
            found.push(role);
        }
        found
    }

    pub fn get(&self, role: CharacteristicRole) -> Option<CharacteristicRef> {
        self.entries.get(&role).copied()
    }

    /// Look up a role, failing with [`ProtocolError::CharacteristicMissing`]
    pub fn require(&self, role: CharacteristicRole) -> Result<CharacteristicRef> {
        self.get(role)
            .ok_or(ProtocolError::CharacteristicMissing(role))
    }

    pub fn contains(&self, role: CharacteristicRole) -> bool {
        self.entries.contains_key(&role)
    }

    /// Role of a transport handle, if it belongs to this table
    pub fn role_of(&self, characteristic: &CharacteristicRef) -> Option<CharacteristicRole> {
        self.entries
            .iter()
            .find(|(_, r)| *r == characteristic)
            .map(|(role, _)| *role)
    }

    /// The write/notify pair required for any file operation
    pub fn has_file_transfer_pair(&self) -> bool {
        self.contains(CharacteristicRole::FileIn) && self.contains(CharacteristicRole::FileOut)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
