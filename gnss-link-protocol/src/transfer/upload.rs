//! Upload sender
//!
//! Packets are numbered from 0; the last one is a zero-payload EOF marker
//! whose number is `ceil(size / 242)`. At most [`WINDOW_SIZE`] packets are
//! outstanding and the base only moves on an ACK that matches it exactly.

use super::{wire_counter, WINDOW_SIZE};
use crate::packet::{self, opcode, FilePacket, FRAME_PAYLOAD_SIZE};
use crate::{ProtocolError, Result};
use tracing::{debug, trace};

#[derive(Debug)]
pub enum UploadEvent {
    Ignored,
    /// Write these packets in order
    Send(Vec<Vec<u8>>),
    Complete,
    Failed(ProtocolError),
}

#[derive(Debug)]
pub struct UploadSession {
    path: String,
    data: Vec<u8>,
    /// Oldest unacknowledged packet
    base: u32,
    /// Next packet to transmit
    next_seq: u32,
    eof_seq: u32,
    started: bool,
}

impl UploadSession {
    pub fn new(path: impl Into<String>, data: Vec<u8>) -> Self {
        let eof_seq = data.len().div_ceil(FRAME_PAYLOAD_SIZE) as u32;
        Self {
            path: path.into(),
            data,
            base: 0,
            next_seq: 0,
            eof_seq,
            started: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The `0x03` open command
    pub fn open_request(&self) -> Result<Vec<u8>> {
        packet::open_for_write(&self.path)
    }

    /// Counter of the EOF marker
    pub fn eof_seq(&self) -> u32 {
        self.eof_seq
    }

    /// Packets sent but not yet acknowledged
    pub fn outstanding(&self) -> u32 {
        self.next_seq - self.base
    }

    /// Acknowledged packets over total packets including the EOF marker
    pub fn progress(&self) -> f64 {
        f64::from(self.base) / f64::from(self.eof_seq + 1)
    }

    /// Settle interval elapsed; send the first window
    pub fn start(&mut self) -> Vec<Vec<u8>> {
        if self.started {
            return Vec::new();
        }
        debug!(
            "Uploading {} bytes to {} in {} packets",
            self.data.len(),
            self.path,
            self.eof_seq + 1
        );
        self.started = true;
        self.fill_window()
    }

    fn packet(&self, seq: u32) -> Vec<u8> {
        let counter = wire_counter(seq);
        if seq == self.eof_seq {
            return packet::data_chunk(counter, &[]);
        }
        let start = seq as usize * FRAME_PAYLOAD_SIZE;
        let end = (start + FRAME_PAYLOAD_SIZE).min(self.data.len());
        packet::data_chunk(counter, &self.data[start..end])
    }

    fn fill_window(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while self.next_seq <= self.eof_seq && self.next_seq < self.base + WINDOW_SIZE {
            out.push(self.packet(self.next_seq));
            self.next_seq += 1;
        }
        out
    }

    pub fn on_packet(&mut self, packet: FilePacket<'_>) -> UploadEvent {
        match packet {
            FilePacket::DataAck { counter } => {
                if !self.started || self.base >= self.next_seq {
                    trace!("Ignoring ACK {} with nothing outstanding", counter);
                    return UploadEvent::Ignored;
                }
                if counter != wire_counter(self.base) {
                    trace!(
                        "Ignoring ACK {} (base {})",
                        counter,
                        wire_counter(self.base)
                    );
                    return UploadEvent::Ignored;
                }
                self.base += 1;
                if self.base > self.eof_seq {
                    debug!("Upload of {} complete", self.path);
                    return UploadEvent::Complete;
                }
                UploadEvent::Send(self.fill_window())
            }
            FilePacket::Nak {
                opcode: op @ (opcode::OPEN_FOR_WRITE | opcode::FILE_DATA),
            } => UploadEvent::Failed(ProtocolError::Nak { opcode: op }),
            other => {
                trace!("Upload ignoring {:?}", other);
                UploadEvent::Ignored
            }
        }
    }
}
