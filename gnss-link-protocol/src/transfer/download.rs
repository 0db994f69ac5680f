//! Download receiver
//!
//! Accepts only the next expected counter and ACKs it at once. Anything
//! else is dropped unacknowledged; the device's own retransmission drives
//! recovery.

use super::wire_counter;
use crate::packet::{self, opcode, FilePacket};
use crate::{ProtocolError, Result};
use tracing::{debug, trace};

/// Result of feeding one packet to the receiver
#[derive(Debug)]
pub enum DownloadEvent {
    /// Not for us, or out of order
    Ignored,
    /// In-order data appended; send the ACK
    Accepted { ack: [u8; 2] },
    /// End-of-file marker accepted; send the ACK and resolve
    Complete { ack: [u8; 2] },
    Failed(ProtocolError),
}

#[derive(Debug)]
pub struct DownloadSession {
    path: String,
    expected_size: u64,
    next_expected: u32,
    buffer: Vec<u8>,
}

impl DownloadSession {
    /// `expected_size` only feeds progress reporting
    pub fn new(path: impl Into<String>, expected_size: u64) -> Self {
        Self {
            path: path.into(),
            expected_size,
            next_expected: 0,
            buffer: Vec::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The `0x02` request that starts the stream
    pub fn request(&self) -> Result<Vec<u8>> {
        packet::read_file(&self.path, 0, 0)
    }

    pub fn received(&self) -> u64 {
        self.buffer.len() as u64
    }

    /// Received bytes over the caller-supplied size, clamped to 1.0
    pub fn progress(&self) -> f64 {
        if self.expected_size == 0 {
            return 0.0;
        }
        (self.received() as f64 / self.expected_size as f64).min(1.0)
    }

    /// Next counter the receiver will accept (wire form)
    pub fn next_counter(&self) -> u8 {
        wire_counter(self.next_expected)
    }

    pub fn on_packet(&mut self, packet: FilePacket<'_>) -> DownloadEvent {
        match packet {
            FilePacket::Data { counter, payload } => {
                if counter != self.next_counter() {
                    trace!(
                        "Dropping out-of-order packet {} (expected {})",
                        counter,
                        self.next_counter()
                    );
                    return DownloadEvent::Ignored;
                }
                self.next_expected = self.next_expected.wrapping_add(1);
                let ack = packet::data_ack(counter);
                if payload.is_empty() {
                    debug!(
                        "Download of {} complete: {} bytes",
                        self.path,
                        self.buffer.len()
                    );
                    DownloadEvent::Complete { ack }
                } else {
                    self.buffer.extend_from_slice(payload);
                    DownloadEvent::Accepted { ack }
                }
            }
            FilePacket::Nak {
                opcode: opcode::READ_FILE,
            } => DownloadEvent::Failed(ProtocolError::Nak {
                opcode: opcode::READ_FILE,
            }),
            other => {
                trace!("Download ignoring {:?}", other);
                DownloadEvent::Ignored
            }
        }
    }

    /// Hand over the assembled file
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}
