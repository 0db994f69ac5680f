//! Wire Packets
//!
//! Byte-exact framing for everything written to, or notified from, the
//! accessory's file-transfer and control-point characteristics.
//!
//! ## File Channel Format
//!
//! ```text
//! list directory   [0x05][path...][0x00]
//! read file        [0x02][offset u32 LE][stride u32 LE][path...][0x00]
//! open for write   [0x03][path...][0x00]
//! data / EOF       [0x10][counter][0..242 payload bytes]
//! directory entry  [0x11][22-byte entry]
//! data ACK         [0x12][counter]
//! NAK              [0xF0][original opcode]
//! ACK              [0xF1][original opcode]
//! ping             [0xFE]
//! cancel transfer  [0xFF]
//! ```
//!
//! ## Control Point Format
//!
//! ```text
//! request   [opcode] | [opcode][parameter]
//! response  [0xF0][original opcode][status][data...]
//! ```

use crate::{ProtocolError, Result};

/// Wire opcodes (device-facing, bit-exact)
pub mod opcode {
    /// Read (download) a file
    pub const READ_FILE: u8 = 0x02;
    /// Open a file for writing (upload)
    pub const OPEN_FOR_WRITE: u8 = 0x03;
    /// List a directory
    pub const LIST_DIRECTORY: u8 = 0x05;
    /// File data chunk or end-of-file marker
    pub const FILE_DATA: u8 = 0x10;
    /// Directory entry or end-of-listing marker
    pub const DIRECTORY_ENTRY: u8 = 0x11;
    /// Data chunk acknowledgment
    pub const DATA_ACK: u8 = 0x12;
    /// Negative acknowledgment / control-point response prefix
    pub const NAK: u8 = 0xF0;
    /// Positive command acknowledgment
    pub const ACK: u8 = 0xF1;
    /// Keepalive ping
    pub const PING: u8 = 0xFE;
    /// Cancel the running transfer
    pub const CANCEL_TRANSFER: u8 = 0xFF;
}

/// Application payload bytes per data packet
pub const FRAME_PAYLOAD_SIZE: usize = 242;

/// Largest single write accepted by the accessory (opcode + counter + payload)
pub const MAX_WRITE_SIZE: usize = FRAME_PAYLOAD_SIZE + 2;

/// Size of a directory entry payload (excluding the opcode)
pub const DIRECTORY_ENTRY_SIZE: usize = 22;

fn encode_path(path: &str, out: &mut Vec<u8>) -> Result<()> {
    if path.as_bytes().contains(&0) {
        return Err(ProtocolError::InvalidPacket(format!(
            "path contains NUL byte: {:?}",
            path
        )));
    }
    out.extend_from_slice(path.as_bytes());
    out.push(0);
    if out.len() > MAX_WRITE_SIZE {
        return Err(ProtocolError::InvalidPacket(format!(
            "command too long: {} bytes (max {})",
            out.len(),
            MAX_WRITE_SIZE
        )));
    }
    Ok(())
}

/// Build a list-directory request
///
/// ```rust
/// use gnss_link_protocol::packet::list_directory;
///
/// assert_eq!(list_directory("/").unwrap(), vec![0x05, b'/', 0x00]);
/// ```
pub fn list_directory(path: &str) -> Result<Vec<u8>> {
    let mut out = vec![opcode::LIST_DIRECTORY];
    encode_path(path, &mut out)?;
    Ok(out)
}

/// Build a read-file request
///
/// `offset` and `stride` are both zero for default full-file streaming.
pub fn read_file(path: &str, offset: u32, stride: u32) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(path.len() + 10);
    out.push(opcode::READ_FILE);
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&stride.to_le_bytes());
    encode_path(path, &mut out)?;
    Ok(out)
}

/// Build an open-for-write request
pub fn open_for_write(path: &str) -> Result<Vec<u8>> {
    let mut out = vec![opcode::OPEN_FOR_WRITE];
    encode_path(path, &mut out)?;
    Ok(out)
}

/// Build a data packet; an empty payload is the end-of-file marker
pub fn data_chunk(counter: u8, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= FRAME_PAYLOAD_SIZE);
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(opcode::FILE_DATA);
    out.push(counter);
    out.extend_from_slice(payload);
    out
}

/// Build a data ACK
pub fn data_ack(counter: u8) -> [u8; 2] {
    [opcode::DATA_ACK, counter]
}

/// Build a keepalive ping
pub fn ping() -> [u8; 1] {
    [opcode::PING]
}

/// Build a cancel-transfer command
pub fn cancel_transfer() -> [u8; 1] {
    [opcode::CANCEL_TRANSFER]
}

/// A packet received on the file-out channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilePacket<'a> {
    /// File data; an empty payload marks end-of-file
    Data { counter: u8, payload: &'a [u8] },
    /// Raw directory entry payload (validated by the directory decoder)
    DirectoryEntry(&'a [u8]),
    /// Acknowledgment of an uploaded data packet
    DataAck { counter: u8 },
    /// The device rejected a command
    Nak { opcode: u8 },
    /// The device accepted a command
    Ack { opcode: u8 },
    /// Keepalive echo
    Ping,
}

impl FilePacket<'_> {
    /// Whether this is the end-of-file marker
    pub fn is_eof(&self) -> bool {
        matches!(self, FilePacket::Data { payload, .. } if payload.is_empty())
    }
}

/// Parse a file-out notification
///
/// ```rust
/// use gnss_link_protocol::packet::{parse_file_packet, FilePacket};
///
/// let packet = parse_file_packet(&[0x10, 0x07]).unwrap();
/// assert!(packet.is_eof());
/// assert_eq!(parse_file_packet(&[0x12, 0x03]).unwrap(), FilePacket::DataAck { counter: 3 });
/// ```
pub fn parse_file_packet(bytes: &[u8]) -> Result<FilePacket<'_>> {
    let (&op, body) = bytes
        .split_first()
        .ok_or_else(|| ProtocolError::InvalidPacket("empty file packet".to_string()))?;

    let need = |n: usize| -> Result<()> {
        if body.len() < n {
            Err(ProtocolError::InvalidPacket(format!(
                "opcode 0x{:02X}: {} byte body, expected at least {}",
                op,
                body.len(),
                n
            )))
        } else {
            Ok(())
        }
    };

    match op {
        opcode::FILE_DATA => {
            need(1)?;
            if body.len() > FRAME_PAYLOAD_SIZE + 1 {
                return Err(ProtocolError::InvalidPacket(format!(
                    "data packet payload {} exceeds {}",
                    body.len() - 1,
                    FRAME_PAYLOAD_SIZE
                )));
            }
            Ok(FilePacket::Data {
                counter: body[0],
                payload: &body[1..],
            })
        }
        opcode::DIRECTORY_ENTRY => {
            need(DIRECTORY_ENTRY_SIZE)?;
            Ok(FilePacket::DirectoryEntry(body))
        }
        opcode::DATA_ACK => {
            need(1)?;
            Ok(FilePacket::DataAck { counter: body[0] })
        }
        opcode::NAK => {
            need(1)?;
            Ok(FilePacket::Nak { opcode: body[0] })
        }
        opcode::ACK => {
            need(1)?;
            Ok(FilePacket::Ack { opcode: body[0] })
        }
        opcode::PING => Ok(FilePacket::Ping),
        other => Err(ProtocolError::InvalidPacket(format!(
            "unknown file opcode 0x{:02X}",
            other
        ))),
    }
}

/// Response read from a control-point characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPointResponse {
    /// Opcode of the request being answered
    pub opcode: u8,
    /// Raw status byte (0 = success)
    pub status: u8,
    /// Optional response data
    pub data: Vec<u8>,
}

impl ControlPointResponse {
    /// Parse `[0xF0][original opcode][status][data...]`
    ///
    /// ```rust
    /// use gnss_link_protocol::packet::ControlPointResponse;
    ///
    /// let resp = ControlPointResponse::parse(&[0xF0, 0x01, 0x00, 0x1F]).unwrap();
    /// assert_eq!(resp.opcode, 0x01);
    /// assert!(resp.is_success());
    /// assert_eq!(resp.data, vec![0x1F]);
    /// ```
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        match bytes {
            [opcode::NAK, op, status, data @ ..] => Ok(Self {
                opcode: *op,
                status: *status,
                data: data.to_vec(),
            }),
            [first, ..] if *first != opcode::NAK => Err(ProtocolError::InvalidPacket(format!(
                "control point response prefix 0x{:02X}",
                first
            ))),
            _ => Err(ProtocolError::InvalidPacket(format!(
                "control point response too short: {} bytes",
                bytes.len()
            ))),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

/// Build a control-point request
pub fn control_request(opcode: u8, parameter: Option<u8>) -> Vec<u8> {
    match parameter {
        Some(p) => vec![opcode, p],
        None => vec![opcode],
    }
}
