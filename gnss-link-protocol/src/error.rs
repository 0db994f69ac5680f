//! Error handling for the GNSS link protocol engine
//!
//! One error enum covers every failure the engine can surface. Errors are
//! converted from underlying library errors using `thiserror`.
//!
//! ## Error Categories
//!
//! ### Connection Errors
//! Transport failures and unexpected link loss. These are recovered by the
//! session engine itself (reconnect / rescan) and only resolve pending
//! operations:
//! - `Transport`: the transport collaborator reported a failure
//! - `ConnectionLost`: the link dropped while an operation was pending
//! - `TransferInProgress`: a newer transfer took over the file channel
//!
//! ### Precondition Errors
//! Raised before any wire traffic is sent:
//! - `NotConnected`: no device is in the `Connected` state
//! - `CharacteristicMissing`: the device lacks a required characteristic
//!
//! ### Protocol Errors
//! - `Nak`: the device rejected a command
//! - `ControlPoint`: a control-point request completed with a non-zero status
//! - `InvalidPacket`: a payload failed length or decode validation
//!
//! ### Cancellation
//! `Cancelled` is a distinct outcome, produced only by an explicit caller
//! action.
//!
//! ## Example
//!
//! ```rust
//! use gnss_link_protocol::{ProtocolError, Result};
//!
//! fn require_connection(connected: bool) -> Result<()> {
//!     if !connected {
//!         return Err(ProtocolError::NotConnected);
//!     }
//!     Ok(())
//! }
//!
//! assert!(matches!(require_connection(false), Err(ProtocolError::NotConnected)));
//! ```

use crate::control::ControlPointStatus;
use crate::gatt::CharacteristicRole;
use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
///
/// # Examples
///
/// ```rust
/// use gnss_link_protocol::ProtocolError;
///
/// let error = ProtocolError::Nak { opcode: 0x03 };
/// assert_eq!(error.to_string(), "Device rejected command 0x03");
///
/// let error = ProtocolError::NotConnected;
/// assert_eq!(error.to_string(), "Not connected");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (persistence files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport layer error
    ///
    /// The transport collaborator failed a request or reported an error
    /// in one of its events.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The connection dropped while an operation was pending
    #[error("Connection lost")]
    ConnectionLost,

    /// No device is currently connected
    #[error("Not connected")]
    NotConnected,

    /// A characteristic needed for the operation was not discovered
    #[error("Characteristic missing: {0}")]
    CharacteristicMissing(CharacteristicRole),

    /// A newer transfer session took over the file channel
    #[error("Transfer replaced by a newer one")]
    TransferInProgress,

    /// The device answered a command with a negative acknowledgment
    #[error("Device rejected command 0x{opcode:02X}")]
    Nak {
        /// Opcode of the rejected command
        opcode: u8,
    },

    /// A control-point request completed with a non-zero status
    #[error("Control point request 0x{opcode:02X} failed: {status}")]
    ControlPoint {
        /// Opcode of the request
        opcode: u8,
        /// Status reported by the device
        status: ControlPointStatus,
    },

    /// Invalid or malformed packet
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Operation cancelled by the caller
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Operation attempted in a state that does not allow it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Persistence collaborator failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// The session engine task is gone
    #[error("Session engine stopped")]
    EngineStopped,
}

impl ProtocolError {
    /// Check if this error is recoverable (transient error that can be retried)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use gnss_link_protocol::ProtocolError;
    ///
    /// assert!(ProtocolError::ConnectionLost.is_recoverable());
    /// assert!(!ProtocolError::Nak { opcode: 0x02 }.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::ConnectionLost
                | ProtocolError::NotConnected
                | ProtocolError::Transport(_)
                | ProtocolError::TransferInProgress
                | ProtocolError::Io(_)
        )
    }

    /// Whether this error is the explicit-cancellation outcome
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ProtocolError::Cancelled(_))
    }

    /// Get a user-friendly error message suitable for display
    ///
    /// # Examples
    ///
    /// ```rust
    /// use gnss_link_protocol::ProtocolError;
    ///
    /// assert_eq!(
    ///     ProtocolError::NotConnected.user_message(),
    ///     "No accessory connected. Connect a device first."
    /// );
    /// ```
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::NotConnected => {
                "No accessory connected. Connect a device first.".to_string()
            }
            ProtocolError::ConnectionLost => {
                "Connection to the accessory was lost. It will reconnect automatically."
                    .to_string()
            }
            ProtocolError::CharacteristicMissing(role) => {
                format!(
                    "The accessory does not expose the {} characteristic. Check its firmware.",
                    role
                )
            }
            ProtocolError::TransferInProgress => {
                "A newer file transfer replaced this one.".to_string()
            }
            ProtocolError::Nak { opcode } => {
                format!("The accessory rejected the request (0x{:02X}).", opcode)
            }
            ProtocolError::ControlPoint { status, .. } => {
                format!("The accessory reported an error: {}.", status)
            }
            ProtocolError::Transport(e) => {
                format!("Bluetooth error: {}. Check that the accessory is in range.", e)
            }
            ProtocolError::InvalidPacket(msg) => format!("Invalid data received: {}.", msg),
            ProtocolError::Cancelled(msg) => format!("Operation cancelled: {}.", msg),
            ProtocolError::InvalidState(msg) => format!("Invalid state: {}.", msg),
            ProtocolError::Configuration(msg) => {
                format!("Configuration error: {}. Check your settings.", msg)
            }
            ProtocolError::Storage(msg) => format!("Could not save pairing data: {}.", msg),
            ProtocolError::Io(e) => format!("I/O error: {}.", e),
            ProtocolError::Json(e) => format!("Data format error: {}.", e),
            ProtocolError::EngineStopped => "The Bluetooth session has stopped.".to_string(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        ProtocolError::InvalidState(msg.into())
    }
}

/// Classification of transport-level failures
///
/// The bonding trigger depends on telling the two security kinds apart from
/// everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// ATT "insufficient authentication"
    InsufficientAuthentication,
    /// ATT "insufficient encryption"
    InsufficientEncryption,
    /// The peripheral is not connected
    NotConnected,
    /// The operation timed out
    Timeout,
    /// Anything else
    Other,
}

/// Error reported by the transport collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    /// Failure classification
    pub kind: TransportErrorKind,
    /// Human readable detail from the platform
    pub message: String,
}

impl TransportError {
    /// Create a transport error
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create an unclassified transport error
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Other, message)
    }

    /// Whether the failure means the platform is in the middle of pairing
    ///
    /// ```rust
    /// use gnss_link_protocol::{TransportError, TransportErrorKind};
    ///
    /// let err = TransportError::new(TransportErrorKind::InsufficientEncryption, "encrypt");
    /// assert!(err.is_security_pending());
    /// assert!(!TransportError::other("gatt failure").is_security_pending());
    /// ```
    pub fn is_security_pending(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::InsufficientAuthentication
                | TransportErrorKind::InsufficientEncryption
        )
    }
}
