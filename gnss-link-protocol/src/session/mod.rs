//! Device session
//!
//! A single-owner actor that drives one accessory from advertisement to the
//! operational state and owns every piece of per-device protocol state.
//!
//! ## State machine
//!
//! ```text
//! Idle ──scan──▶ ScanningKnown / ScanningPairing
//!   │                     │
//!   └──────connect────────┴──▶ Connecting ──▶ DiscoveringServices
//!                                   │                 │
//!                                 fail            services
//!                                   ▼                 ▼
//!                                 Idle      DiscoveringCharacteristics
//!                                                     │ file pair found + bonded
//!                                                     ▼
//!                           Disconnecting ◀──── Connected
//! ```
//!
//! Callers talk to the engine through a cloneable [`SessionHandle`] and
//! observe it through a `watch` channel of [`SessionSnapshot`]s.

mod engine;
mod handle;

pub use engine::SessionEngine;
pub use handle::SessionHandle;

use crate::control::{GnssMaskStatus, StartResult, StartTriggerState};
use crate::device::{DeviceId, DeviceRecord};
use crate::directory::DirectoryListing;
use crate::telemetry::LiveGnssSample;
use crate::transfer::{TransferProgress, TransferResult};
use crate::transport::TransportEvent;
use crate::Result;
use std::fmt;
use tokio::sync::oneshot;

/// What the engine is doing with the radio right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    ScanningKnown,
    ScanningPairing,
    Connecting(DeviceId),
    DiscoveringServices(DeviceId),
    DiscoveringCharacteristics(DeviceId),
    Connected(DeviceId),
    Disconnecting(DeviceId),
}

impl SessionState {
    /// Peripheral this state refers to
    pub fn target(&self) -> Option<DeviceId> {
        match self {
            SessionState::Idle | SessionState::ScanningKnown | SessionState::ScanningPairing => {
                None
            }
            SessionState::Connecting(id)
            | SessionState::DiscoveringServices(id)
            | SessionState::DiscoveringCharacteristics(id)
            | SessionState::Connected(id)
            | SessionState::Disconnecting(id) => Some(*id),
        }
    }

    pub fn is_scanning(&self) -> bool {
        matches!(self, SessionState::ScanningKnown | SessionState::ScanningPairing)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected(_))
    }

    /// Idle or scanning; a connect may start from here
    pub fn is_unattached(&self) -> bool {
        self.target().is_none()
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::ScanningKnown => write!(f, "scanning for known devices"),
            SessionState::ScanningPairing => write!(f, "scanning for pairing devices"),
            SessionState::Connecting(id) => write!(f, "connecting to {}", id),
            SessionState::DiscoveringServices(id) => write!(f, "discovering services on {}", id),
            SessionState::DiscoveringCharacteristics(id) => {
                write!(f, "discovering characteristics on {}", id)
            }
            SessionState::Connected(id) => write!(f, "connected to {}", id),
            SessionState::Disconnecting(id) => write!(f, "disconnecting from {}", id),
        }
    }
}

/// Everything the engine publishes
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// Set from transport connect until disconnect
    pub connected_device: Option<DeviceId>,
    pub powered: bool,
    pub known_devices: Vec<DeviceRecord>,
    pub pairing_devices: Vec<DeviceRecord>,
    pub directory: DirectoryListing,
    /// Active transfer, if any
    pub transfer: Option<TransferProgress>,
    /// Last reported download fraction
    pub download_progress: f64,
    /// Last reported upload fraction
    pub upload_progress: f64,
    pub live_sample: Option<LiveGnssSample>,
    pub gnss_mask: Option<u8>,
    pub gnss_mask_status: GnssMaskStatus,
    pub start_trigger: StartTriggerState,
    pub start_result: Option<StartResult>,
    /// Start or cancel request awaiting its response
    pub start_pending: bool,
    /// Why the last start or cancel request failed
    pub start_error: Option<String>,
    pub firmware_revision: Option<String>,
    pub device_mode: Option<u8>,
    pub rssi: Option<i16>,
}

/// Fire-and-forget operations; the reply only reports precondition or
/// request-issue failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Request {
    StartScan { pairing: bool },
    StopScan,
    Connect(DeviceId),
    Disconnect,
    Forget(DeviceId),
    ListDirectory(String),
    CancelTransfer,
    GetMask,
    SetMask(u8),
    StartCountdown,
    CancelCountdown,
    SetDeviceMode(u8),
    Ping,
    RefreshRssi,
}

#[derive(Debug)]
pub(crate) enum SessionCommand {
    Request(Request, oneshot::Sender<Result<()>>),
    Download {
        path: String,
        expected_size: u64,
        completion: oneshot::Sender<TransferResult>,
    },
    Upload {
        path: String,
        data: Vec<u8>,
        completion: oneshot::Sender<TransferResult>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    Keepalive,
    UploadSettle,
    PairingTimeout(DeviceId),
}

/// Tick posted by a timer task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerEvent {
    pub kind: TimerKind,
    pub generation: u64,
}

/// Input to one engine step
#[derive(Debug)]
pub(crate) enum Message {
    Command(SessionCommand),
    Transport(TransportEvent),
    Timer(TimerEvent),
}
