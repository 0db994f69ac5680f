//! Control-point protocol
//!
//! Request/response exchanges used for GNSS field-mask configuration and
//! the remote start trigger.
//!
//! ```text
//! request   [opcode] | [opcode][parameter]
//! response  [0xF0][original opcode][status][data...]
//! ```
//!
//! The state holders here are pure: they build the request bytes and
//! interpret responses. Writing to the characteristic is the session
//! engine's job.

use crate::packet::{control_request, ControlPointResponse};
use crate::ProtocolError;
use chrono::{DateTime, Utc};
use std::fmt;
use tracing::{debug, info, warn};

/// GNSS control point opcodes
pub mod gnss_opcode {
    pub const GET_MASK: u8 = 0x01;
    pub const SET_MASK: u8 = 0x02;
}

/// Start control point opcodes
pub mod start_opcode {
    pub const START_COUNTDOWN: u8 = 0x01;
    pub const CANCEL_COUNTDOWN: u8 = 0x02;
}

/// Status byte of a control-point response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPointStatus {
    Success,
    OpcodeNotSupported,
    InvalidParameter,
    OperationFailed,
    Busy,
    NotPermitted,
    Unknown(u8),
}

impl From<u8> for ControlPointStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => ControlPointStatus::Success,
            1 => ControlPointStatus::OpcodeNotSupported,
            2 => ControlPointStatus::InvalidParameter,
            3 => ControlPointStatus::OperationFailed,
            4 => ControlPointStatus::Busy,
            5 => ControlPointStatus::NotPermitted,
            other => ControlPointStatus::Unknown(other),
        }
    }
}

impl ControlPointStatus {
    pub fn is_success(self) -> bool {
        self == ControlPointStatus::Success
    }

    pub fn description(self) -> &'static str {
        match self {
            ControlPointStatus::Success => "success",
            ControlPointStatus::OpcodeNotSupported => "opcode not supported",
            ControlPointStatus::InvalidParameter => "invalid parameter",
            ControlPointStatus::OperationFailed => "operation failed",
            ControlPointStatus::Busy => "device busy",
            ControlPointStatus::NotPermitted => "not permitted in current mode",
            ControlPointStatus::Unknown(_) => "unknown error",
        }
    }
}

impl fmt::Display for ControlPointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Turn a non-zero status into a [`ProtocolError::ControlPoint`]
fn check_status(response: &ControlPointResponse) -> std::result::Result<(), ProtocolError> {
    let status = ControlPointStatus::from(response.status);
    if status.is_success() {
        Ok(())
    } else {
        Err(ProtocolError::ControlPoint {
            opcode: response.opcode,
            status,
        })
    }
}

/// Outcome of the last mask get/set exchange
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GnssMaskStatus {
    #[default]
    Idle,
    Pending,
    Failure(String),
}

/// What the engine must do after a mask response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaskFollowUp {
    Nothing,
    /// Send this request next
    Send(Vec<u8>),
}

/// GNSS field mask state
#[derive(Debug, Clone, Default)]
pub struct GnssMaskControl {
    mask: Option<u8>,
    status: GnssMaskStatus,
    last_attempted: Option<u8>,
}

impl GnssMaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently applied mask, if known
    pub fn mask(&self) -> Option<u8> {
        self.mask
    }

    pub fn status(&self) -> &GnssMaskStatus {
        &self.status
    }

    /// Build a get-mask request and mark the exchange pending
    pub fn request_get(&mut self) -> Vec<u8> {
        self.status = GnssMaskStatus::Pending;
        control_request(gnss_opcode::GET_MASK, None)
    }

    /// Build a set-mask request, remembering the attempted value
    pub fn request_set(&mut self, mask: u8) -> Vec<u8> {
        self.status = GnssMaskStatus::Pending;
        self.last_attempted = Some(mask);
        control_request(gnss_opcode::SET_MASK, Some(mask))
    }

    /// The request could not be written
    pub fn write_failed(&mut self, reason: impl Into<String>) {
        self.last_attempted = None;
        self.status = GnssMaskStatus::Failure(reason.into());
    }

    /// The control point reported an error; fails an outstanding exchange
    pub fn fail_pending(&mut self, reason: impl Into<String>) -> bool {
        if self.status != GnssMaskStatus::Pending {
            return false;
        }
        self.write_failed(reason);
        true
    }

    /// Interpret a notification from the GNSS control point
    pub fn handle_response(&mut self, bytes: &[u8]) -> MaskFollowUp {
        let response = match ControlPointResponse::parse(bytes) {
            Ok(r) => r,
            Err(e) => {
                debug!("Dropping GNSS control response: {}", e);
                return MaskFollowUp::Nothing;
            }
        };

        if let Err(e) = check_status(&response) {
            warn!("GNSS mask exchange failed: {}", e);
            self.last_attempted = None;
            self.status = GnssMaskStatus::Failure(e.to_string());
            return MaskFollowUp::Nothing;
        }

        match response.opcode {
            gnss_opcode::GET_MASK => match response.data.first() {
                Some(&mask) => {
                    self.apply(mask);
                    MaskFollowUp::Nothing
                }
                None => {
                    self.status = GnssMaskStatus::Failure("response carried no mask".to_string());
                    MaskFollowUp::Nothing
                }
            },
            gnss_opcode::SET_MASK => {
                let attempted = self.last_attempted.take();
                match response.data.first().copied().or(attempted) {
                    Some(mask) => {
                        self.apply(mask);
                        MaskFollowUp::Nothing
                    }
                    None => {
                        info!("Mask set acknowledged without a known value, re-reading");
                        MaskFollowUp::Send(self.request_get())
                    }
                }
            }
            other => {
                debug!("Ignoring GNSS control response for opcode 0x{:02X}", other);
                MaskFollowUp::Nothing
            }
        }
    }

    fn apply(&mut self, mask: u8) {
        debug!("GNSS field mask is now 0x{:02X}", mask);
        self.mask = Some(mask);
        self.status = GnssMaskStatus::Idle;
    }

    /// Forget everything learned from the current device
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Local view of the remote start trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartTriggerState {
    #[default]
    Idle,
    Counting,
}

/// Outcome reported on the start-result characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Triggered,
    Cancelled,
    Aborted(u8),
}

impl From<u8> for StartOutcome {
    fn from(value: u8) -> Self {
        match value {
            0 => StartOutcome::Triggered,
            1 => StartOutcome::Cancelled,
            other => StartOutcome::Aborted(other),
        }
    }
}

/// An asynchronous start result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartResult {
    pub outcome: StartOutcome,
    /// Device time of week at the trigger, when reported
    pub time_of_week_ms: Option<u32>,
    /// Local reception time
    pub received_at: DateTime<Utc>,
}

/// Start trigger state
#[derive(Debug, Clone, Default)]
pub struct StartTrigger {
    state: StartTriggerState,
    /// Opcode of the request awaiting its response
    pending: Option<u8>,
    last_result: Option<StartResult>,
    last_error: Option<String>,
}

impl StartTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> StartTriggerState {
        self.state
    }

    pub fn last_result(&self) -> Option<&StartResult> {
        self.last_result.as_ref()
    }

    /// Why the last start/cancel request failed
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn request_start(&mut self) -> Vec<u8> {
        self.request(start_opcode::START_COUNTDOWN)
    }

    pub fn request_cancel(&mut self) -> Vec<u8> {
        self.request(start_opcode::CANCEL_COUNTDOWN)
    }

    fn request(&mut self, opcode: u8) -> Vec<u8> {
        self.pending = Some(opcode);
        self.last_error = None;
        control_request(opcode, None)
    }

    /// The request never got an answer: write failure or channel error
    pub fn fail_pending(&mut self, reason: impl Into<String>) -> bool {
        match self.pending.take() {
            Some(opcode) => {
                let reason = reason.into();
                warn!("Start request 0x{:02X} failed: {}", opcode, reason);
                self.last_error = Some(reason);
                true
            }
            None => false,
        }
    }

    /// Interpret a notification from the start control point
    ///
    /// Failures leave the state unchanged; the result characteristic has
    /// the final word.
    pub fn handle_response(&mut self, bytes: &[u8]) {
        let response = match ControlPointResponse::parse(bytes) {
            Ok(r) => r,
            Err(e) => {
                debug!("Dropping start control response: {}", e);
                return;
            }
        };

        if self.pending == Some(response.opcode) {
            self.pending = None;
        }
        if let Err(e) = check_status(&response) {
            warn!("Start trigger request failed: {}", e);
            self.last_error = Some(e.to_string());
            return;
        }

        self.last_error = None;
        match response.opcode {
            start_opcode::START_COUNTDOWN => {
                info!("Start countdown running");
                self.state = StartTriggerState::Counting;
            }
            start_opcode::CANCEL_COUNTDOWN => {
                info!("Start countdown cancelled");
                self.state = StartTriggerState::Idle;
            }
            other => debug!("Ignoring start response for opcode 0x{:02X}", other),
        }
    }

    /// Interpret a start-result notification `[outcome][u32 LE tow]?`
    pub fn handle_result(&mut self, bytes: &[u8], received_at: DateTime<Utc>) {
        let Some((&outcome, rest)) = bytes.split_first() else {
            debug!("Dropping empty start result");
            return;
        };
        let time_of_week_ms = match rest {
            [a, b, c, d, ..] => Some(u32::from_le_bytes([*a, *b, *c, *d])),
            _ => None,
        };
        let result = StartResult {
            outcome: StartOutcome::from(outcome),
            time_of_week_ms,
            received_at,
        };
        info!("Start result: {:?}", result.outcome);
        self.state = StartTriggerState::Idle;
        self.last_result = Some(result);
    }

    pub fn reset(&mut self) {
        self.state = StartTriggerState::Idle;
        self.pending = None;
        self.last_error = None;
    }
}
