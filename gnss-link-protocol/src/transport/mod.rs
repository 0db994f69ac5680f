//! BLE Transport Layer
//!
//! The session engine talks to the radio only through the [`Transport`]
//! trait. A btleplug-backed implementation is available behind the
//! `btleplug` feature.

mod r#trait;

#[cfg(feature = "btleplug")]
pub mod ble;

pub use r#trait::{PeripheralInfo, ScanFilter, Transport, TransportEvent, WriteKind};

#[cfg(feature = "btleplug")]
pub use ble::BtleplugTransport;
