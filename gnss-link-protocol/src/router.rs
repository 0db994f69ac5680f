//! Notification router
//!
//! Maps incoming value updates to the protocol handler that owns them.
//! Routes are keyed by characteristic role and, for the multiplexed
//! file-out channel, by leading opcode:
//!
//! ```text
//! (FileOut, Some(0x11))  directory entries
//! (FileOut, Some(0x05))  NAK/ACK of a list request
//! (FileOut, None)        everything else (active transfer)
//! (GnssMeasurement, None) ...
//! ```
//!
//! `[0xF0|0xF1][opcode]` replies are routed by the opcode they answer.
//! Each key has at most one owner; registering a new one evicts the old.

use crate::gatt::CharacteristicRole;
use crate::packet::opcode;
use std::collections::HashMap;
use tracing::{debug, trace, warn};

/// Protocol handler that can own a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Consumer {
    Directory,
    Transfer,
    Keepalive,
    Telemetry,
    GnssControl,
    StartControl,
    StartResult,
    DeviceMode,
    FirmwareRevision,
}

/// Route key
pub type RouteKey = (CharacteristicRole, Option<u8>);

#[derive(Debug, Default)]
pub struct NotificationRouter {
    routes: HashMap<RouteKey, Consumer>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a route, returning the consumer that held it
    pub fn register(
        &mut self,
        role: CharacteristicRole,
        opcode: Option<u8>,
        consumer: Consumer,
    ) -> Option<Consumer> {
        let evicted = self.routes.insert((role, opcode), consumer);
        match evicted {
            Some(previous) if previous != consumer => {
                warn!(
                    "{:?} replaced {:?} on {} (opcode {:?})",
                    consumer, previous, role, opcode
                );
            }
            _ => trace!("{:?} registered on {} (opcode {:?})", consumer, role, opcode),
        }
        evicted.filter(|previous| *previous != consumer)
    }

    /// Release one route if `consumer` still owns it
    pub fn unregister(
        &mut self,
        role: CharacteristicRole,
        opcode: Option<u8>,
        consumer: Consumer,
    ) -> bool {
        if self.routes.get(&(role, opcode)) == Some(&consumer) {
            self.routes.remove(&(role, opcode));
            true
        } else {
            false
        }
    }

    pub fn owner(&self, role: CharacteristicRole, opcode: Option<u8>) -> Option<Consumer> {
        self.routes.get(&(role, opcode)).copied()
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }

    /// Find the consumer for a value update
    pub fn route_value(&self, role: CharacteristicRole, value: &[u8]) -> Option<Consumer> {
        if role != CharacteristicRole::FileOut {
            return self.owner(role, None);
        }

        let key = match value {
            [opcode::NAK | opcode::ACK, original, ..] => Some(*original),
            [op, ..] => Some(*op),
            [] => None,
        };
        let consumer = key
            .and_then(|op| self.owner(role, Some(op)))
            .or_else(|| self.owner(role, None));
        if consumer.is_none() {
            debug!("No consumer for file-out opcode {:?}", key);
        }
        consumer
    }

    /// Every consumer holding a route on a channel that reported an error
    ///
    /// An error carries no opcode, so opcode-keyed owners hear about it too.
    pub fn route_error(&self, role: CharacteristicRole) -> Vec<Consumer> {
        let mut consumers: Vec<Consumer> = self
            .routes
            .iter()
            .filter(|((r, _), _)| *r == role)
            .map(|(_, consumer)| *consumer)
            .collect();
        consumers.sort();
        consumers.dedup();
        consumers
    }
}
