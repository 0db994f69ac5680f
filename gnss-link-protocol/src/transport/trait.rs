//! Transport Trait Abstraction
//!
//! The BLE stack is an external collaborator. Request methods return as soon
//! as the request is issued; outcomes arrive later as [`TransportEvent`]s on
//! the channel the transport was created with.

use crate::device::{Advertisement, DeviceId};
use crate::error::TransportError;
use crate::gatt::{CharacteristicInfo, CharacteristicRef};
use crate::Result;
use async_trait::async_trait;
use std::fmt::{self, Debug};
use uuid::Uuid;

/// Scan parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only report peripherals advertising one of these services
    pub services: Vec<Uuid>,
    /// Report every advertisement, not just the first
    pub allow_duplicates: bool,
}

/// Write acknowledgment mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

impl WriteKind {
    pub fn ack_requested(self) -> bool {
        self == WriteKind::WithResponse
    }
}

/// A peripheral resolved by identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralInfo {
    pub id: DeviceId,
    pub name: Option<String>,
}

/// Asynchronous outcome delivered by the transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    PoweredOn,
    PoweredOff,
    Advertisement(Advertisement),
    Connected {
        id: DeviceId,
    },
    ConnectFailed {
        id: DeviceId,
        error: TransportError,
    },
    /// `error` is `None` for a requested disconnect
    Disconnected {
        id: DeviceId,
        error: Option<TransportError>,
    },
    ServicesDiscovered {
        id: DeviceId,
        result: std::result::Result<Vec<Uuid>, TransportError>,
    },
    CharacteristicsDiscovered {
        id: DeviceId,
        service: Uuid,
        result: std::result::Result<Vec<CharacteristicInfo>, TransportError>,
    },
    /// Read response or notification
    ValueUpdated {
        id: DeviceId,
        characteristic: CharacteristicRef,
        value: std::result::Result<Vec<u8>, TransportError>,
    },
    Rssi {
        id: DeviceId,
        result: std::result::Result<i16, TransportError>,
    },
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::PoweredOn => write!(f, "powered on"),
            TransportEvent::PoweredOff => write!(f, "powered off"),
            TransportEvent::Advertisement(adv) => write!(f, "advertisement from {}", adv.id),
            TransportEvent::Connected { id } => write!(f, "connected to {}", id),
            TransportEvent::ConnectFailed { id, error } => {
                write!(f, "connect to {} failed: {}", id, error)
            }
            TransportEvent::Disconnected { id, error: None } => {
                write!(f, "disconnected from {}", id)
            }
            TransportEvent::Disconnected {
                id,
                error: Some(error),
            } => write!(f, "disconnected from {}: {}", id, error),
            TransportEvent::ServicesDiscovered { id, .. } => {
                write!(f, "services discovered on {}", id)
            }
            TransportEvent::CharacteristicsDiscovered { id, service, .. } => {
                write!(f, "characteristics of {} discovered on {}", service, id)
            }
            TransportEvent::ValueUpdated { characteristic, .. } => {
                write!(f, "value update on {}", characteristic.uuid)
            }
            TransportEvent::Rssi { id, .. } => write!(f, "rssi of {}", id),
        }
    }
}

/// BLE central operations consumed by the session engine
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Start reporting advertisements
    async fn start_scan(&self, filter: ScanFilter) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;

    /// Request a connection; answered by `Connected` or `ConnectFailed`
    async fn connect(&self, id: DeviceId) -> Result<()>;

    /// Answered by `ServicesDiscovered`
    async fn discover_services(&self, id: DeviceId, services: &[Uuid]) -> Result<()>;

    /// Answered by `CharacteristicsDiscovered`, once per service
    async fn discover_characteristics(&self, id: DeviceId, service: Uuid) -> Result<()>;

    /// Answered by `ValueUpdated`
    async fn read(&self, id: DeviceId, characteristic: CharacteristicRef) -> Result<()>;

    async fn write(
        &self,
        id: DeviceId,
        characteristic: CharacteristicRef,
        data: &[u8],
        kind: WriteKind,
    ) -> Result<()>;

    /// Enable notifications; values then arrive as `ValueUpdated`
    async fn subscribe(&self, id: DeviceId, characteristic: CharacteristicRef) -> Result<()>;

    /// Answered by `Rssi`
    async fn read_rssi(&self, id: DeviceId) -> Result<()>;

    /// Answered by `Disconnected`
    async fn disconnect(&self, id: DeviceId) -> Result<()>;

    /// Retrieve a previously seen peripheral by identity
    async fn resolve_peripheral(&self, id: DeviceId) -> Option<PeripheralInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportErrorKind;

    #[test]
    fn test_event_display() {
        let id = DeviceId(Uuid::nil());
        let event = TransportEvent::Disconnected {
            id,
            error: Some(TransportError::new(TransportErrorKind::Timeout, "link supervision")),
        };
        assert_eq!(
            event.to_string(),
            "disconnected from 00000000-0000-0000-0000-000000000000: link supervision"
        );
        assert_eq!(TransportEvent::PoweredOff.to_string(), "powered off");
    }

    #[test]
    fn test_write_kind() {
        assert!(WriteKind::WithResponse.ack_requested());
        assert!(!WriteKind::WithoutResponse.ack_requested());
    }
}
