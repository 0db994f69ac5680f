//! Go-Back-N file transfer
//!
//! Reliable chunked download and upload over the file-in (write) and
//! file-out (notify) characteristics.
//!
//! ## Framing
//!
//! ```text
//! data   [0x10][counter mod 256][0..242 bytes]    empty payload = EOF
//! ack    [0x12][counter]
//! ```
//!
//! Sequence numbers are tracked as `u32` internally and truncated to one
//! byte on the wire. At most one transfer is active per connection; the
//! caller awaits a oneshot that [`ActiveTransfer`] resolves exactly once.

mod download;
mod upload;

pub use download::{DownloadEvent, DownloadSession};
pub use upload::{UploadEvent, UploadSession};

use crate::packet::FilePacket;
use crate::Result;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Maximum unacknowledged packets in flight
pub const WINDOW_SIZE: u32 = 8;

/// One-byte wire form of an internal sequence number
pub fn wire_counter(seq: u32) -> u8 {
    (seq % 256) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Download,
    Upload,
}

/// Published progress of the active transfer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferProgress {
    pub direction: TransferDirection,
    pub path: String,
    /// 0.0 ..= 1.0
    pub fraction: f64,
}

/// Value a finished transfer resolves with
///
/// Downloads carry the file contents; uploads resolve with an empty buffer.
pub type TransferResult = Result<Vec<u8>>;

#[derive(Debug)]
pub enum TransferSession {
    Download(DownloadSession),
    Upload(UploadSession),
}

/// What the engine must do after feeding a packet
#[derive(Debug)]
pub enum TransferStep {
    /// Keep going; write these frames to file-in in order
    Continue(Vec<Vec<u8>>),
    /// Write these frames, then resolve the transfer
    Finish(Vec<Vec<u8>>, TransferResult),
}

/// The single in-flight transfer and its completion handle
#[derive(Debug)]
pub struct ActiveTransfer {
    session: TransferSession,
    completion: oneshot::Sender<TransferResult>,
}

impl ActiveTransfer {
    pub fn new(session: TransferSession, completion: oneshot::Sender<TransferResult>) -> Self {
        Self {
            session,
            completion,
        }
    }

    pub fn direction(&self) -> TransferDirection {
        match self.session {
            TransferSession::Download(_) => TransferDirection::Download,
            TransferSession::Upload(_) => TransferDirection::Upload,
        }
    }

    pub fn path(&self) -> &str {
        match &self.session {
            TransferSession::Download(d) => d.path(),
            TransferSession::Upload(u) => u.path(),
        }
    }

    pub fn progress(&self) -> TransferProgress {
        let fraction = match &self.session {
            TransferSession::Download(d) => d.progress(),
            TransferSession::Upload(u) => u.progress(),
        };
        TransferProgress {
            direction: self.direction(),
            path: self.path().to_string(),
            fraction,
        }
    }

    /// Upload settle interval elapsed
    pub fn start_upload(&mut self) -> Vec<Vec<u8>> {
        match &mut self.session {
            TransferSession::Upload(u) => u.start(),
            TransferSession::Download(_) => Vec::new(),
        }
    }

    pub fn on_packet(&mut self, packet: FilePacket<'_>) -> TransferStep {
        match &mut self.session {
            TransferSession::Download(d) => match d.on_packet(packet) {
                DownloadEvent::Ignored => TransferStep::Continue(Vec::new()),
                DownloadEvent::Accepted { ack } => TransferStep::Continue(vec![ack.to_vec()]),
                // bytes are taken in finish()
                DownloadEvent::Complete { ack } => {
                    TransferStep::Finish(vec![ack.to_vec()], Ok(Vec::new()))
                }
                DownloadEvent::Failed(e) => TransferStep::Finish(Vec::new(), Err(e)),
            },
            TransferSession::Upload(u) => match u.on_packet(packet) {
                UploadEvent::Ignored => TransferStep::Continue(Vec::new()),
                UploadEvent::Send(frames) => TransferStep::Continue(frames),
                UploadEvent::Complete => TransferStep::Finish(Vec::new(), Ok(Vec::new())),
                UploadEvent::Failed(e) => TransferStep::Finish(Vec::new(), Err(e)),
            },
        }
    }

    /// Resolve the caller's future; consumes the transfer
    pub fn finish(self, result: TransferResult) {
        let path = self.path().to_string();
        let result = match (self.session, result) {
            (TransferSession::Download(d), Ok(_)) => Ok(d.into_bytes()),
            (_, other) => other,
        };
        match &result {
            Ok(bytes) => debug!("Transfer {} resolved ({} bytes)", path, bytes.len()),
            Err(e) => debug!("Transfer {} failed: {}", path, e),
        }
        if self.completion.send(result).is_err() {
            warn!("Transfer {} finished but the caller stopped waiting", path);
        }
    }
}
