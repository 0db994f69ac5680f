//! GNSS Link Protocol Implementation
//!
//! Client side of the BLE protocol spoken by GNSS logger accessories:
//! connection and bonding, Go-Back-N file transfer, directory listing,
//! control-point commands and live position telemetry.
//!
//! The [`SessionEngine`] owns all per-device state and is driven by a
//! [`Transport`] implementation. Callers interact with it through a
//! [`SessionHandle`].

pub mod config;
pub mod control;
pub mod device;
pub mod directory;
pub mod gatt;
pub mod packet;
pub mod router;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod transfer;
pub mod transport;

mod error;

pub use config::EngineConfig;
pub use control::{
    ControlPointStatus, GnssMaskControl, GnssMaskStatus, StartOutcome, StartResult, StartTrigger,
    StartTriggerState,
};
pub use device::{Advertisement, AdvertisementPayload, DeviceId, DeviceRecord, DeviceRegistry};
pub use directory::{DirectoryEntry, DirectoryListing, FatAttributes};
pub use error::{ProtocolError, Result, TransportError, TransportErrorKind};
pub use gatt::{CharacteristicInfo, CharacteristicRef, CharacteristicRole, CharacteristicTable};
pub use router::{Consumer, NotificationRouter};
pub use session::{SessionEngine, SessionHandle, SessionSnapshot, SessionState};
pub use store::{BondStore, JsonBondStore, MemoryBondStore};
pub use telemetry::LiveGnssSample;
pub use transfer::{TransferDirection, TransferProgress};
pub use transport::{PeripheralInfo, ScanFilter, Transport, TransportEvent, WriteKind};

#[cfg(feature = "btleplug")]
pub use transport::BtleplugTransport;

#[cfg(test)]
pub mod test_utils;
