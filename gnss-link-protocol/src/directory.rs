//! Directory Protocol
//!
//! Decodes the `0x11` directory-entry packets streamed in answer to a
//! list-directory request, and accumulates them into an ordered listing.
//!
//! ## Entry Layout (22 bytes, after the opcode)
//!
//! | Offset | Size | Field                          |
//! |--------|------|--------------------------------|
//! | 0      | 4    | size in bytes, little endian   |
//! | 4      | 2    | FAT date, little endian        |
//! | 6      | 2    | FAT time, little endian        |
//! | 8      | 1    | FAT attribute bitmask          |
//! | 9      | 13   | name, NUL padded               |
//!
//! A name whose first byte is `0x00` is the end-of-listing marker.

use crate::packet::DIRECTORY_ENTRY_SIZE;
use crate::{ProtocolError, Result};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use std::cmp::Ordering;
use std::fmt;
use tracing::debug;

const NAME_OFFSET: usize = 9;
const NAME_LEN: usize = 13;

/// FAT attribute bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FatAttributes(pub u8);

impl FatAttributes {
    pub const READ_ONLY: u8 = 0x01;
    pub const HIDDEN: u8 = 0x02;
    pub const SYSTEM: u8 = 0x04;
    pub const DIRECTORY: u8 = 0x10;
    pub const ARCHIVE: u8 = 0x20;

    pub fn is_directory(self) -> bool {
        self.0 & Self::DIRECTORY != 0
    }

    pub fn is_archive(self) -> bool {
        self.0 & Self::ARCHIVE != 0
    }

    pub fn is_read_only(self) -> bool {
        self.0 & Self::READ_ONLY != 0
    }

    pub fn is_hidden(self) -> bool {
        self.0 & Self::HIDDEN != 0
    }

    pub fn is_system(self) -> bool {
        self.0 & Self::SYSTEM != 0
    }

    /// Fixed five-character `d/a/r/h/s` flag string, `-` for cleared bits
    ///
    /// ```rust
    /// use gnss_link_protocol::directory::FatAttributes;
    ///
    /// assert_eq!(FatAttributes(0x10).flag_string(), "d----");
    /// assert_eq!(FatAttributes(0x21).flag_string(), "-ar--");
    /// assert_eq!(FatAttributes(0x37).flag_string(), "darhs");
    /// ```
    pub fn flag_string(self) -> String {
        [
            (self.is_directory(), 'd'),
            (self.is_archive(), 'a'),
            (self.is_read_only(), 'r'),
            (self.is_hidden(), 'h'),
            (self.is_system(), 's'),
        ]
        .iter()
        .map(|&(set, c)| if set { c } else { '-' })
        .collect()
    }
}

impl fmt::Display for FatAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.flag_string())
    }
}

/// Decode a FAT date/time pair as UTC
///
/// Returns `None` for bit patterns that do not name a real instant
/// (month 0, day 0, hour 24, second 60 and so on).
pub fn decode_fat_timestamp(date: u16, time: u16) -> Option<DateTime<Utc>> {
    let year = i32::from(date >> 9) + 1980;
    let month = u32::from((date >> 5) & 0x0F);
    let day = u32::from(date & 0x1F);

    let hour = u32::from(time >> 11);
    let minute = u32::from((time >> 5) & 0x3F);
    let second = u32::from(time & 0x1F) * 2;

    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Encode a UTC instant as a FAT date/time pair
///
/// Seconds are truncated to even values. Returns `None` outside the
/// representable years 1980..=2107.
pub fn encode_fat_timestamp(timestamp: &DateTime<Utc>) -> Option<(u16, u16)> {
    let year = timestamp.year();
    if !(1980..=2107).contains(&year) {
        return None;
    }
    let date = ((year - 1980) as u16) << 9
        | (timestamp.month() as u16) << 5
        | timestamp.day() as u16;
    let time = (timestamp.hour() as u16) << 11
        | (timestamp.minute() as u16) << 5
        | (timestamp.second() / 2) as u16;
    Some((date, time))
}

/// A real entry in a remote directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub size: u32,
    pub modified: DateTime<Utc>,
    pub attributes: FatAttributes,
}

impl DirectoryEntry {
    pub fn is_directory(&self) -> bool {
        self.attributes.is_directory()
    }

    /// Listing order: directories first, then case-insensitive name
    pub fn listing_order(a: &DirectoryEntry, b: &DirectoryEntry) -> Ordering {
        b.is_directory()
            .cmp(&a.is_directory())
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .then_with(|| a.name.cmp(&b.name))
    }
}

/// One decoded `0x11` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryRecord {
    Entry(DirectoryEntry),
    EndOfListing,
}

/// Decode the 22-byte body of a `0x11` packet
///
/// ```rust
/// use gnss_link_protocol::directory::{decode_entry, DirectoryRecord};
///
/// let mut body = [0u8; 22];
/// assert_eq!(decode_entry(&body).unwrap(), DirectoryRecord::EndOfListing);
///
/// body[9..14].copy_from_slice(b"A.TXT");
/// body[4..6].copy_from_slice(&0x5A21u16.to_le_bytes()); // 2025-01-01
/// assert!(matches!(decode_entry(&body).unwrap(), DirectoryRecord::Entry(e) if e.name == "A.TXT"));
/// ```
pub fn decode_entry(body: &[u8]) -> Result<DirectoryRecord> {
    if body.len() < DIRECTORY_ENTRY_SIZE {
        return Err(ProtocolError::InvalidPacket(format!(
            "directory entry is {} bytes, expected {}",
            body.len(),
            DIRECTORY_ENTRY_SIZE
        )));
    }

    let name_bytes = &body[NAME_OFFSET..NAME_OFFSET + NAME_LEN];
    if name_bytes[0] == 0 {
        return Ok(DirectoryRecord::EndOfListing);
    }

    let size = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let date = u16::from_le_bytes([body[4], body[5]]);
    let time = u16::from_le_bytes([body[6], body[7]]);
    let attributes = FatAttributes(body[8]);

    let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    let name = std::str::from_utf8(&name_bytes[..name_end])
        .map_err(|e| ProtocolError::InvalidPacket(format!("entry name is not UTF-8: {}", e)))?
        .to_string();

    let modified = decode_fat_timestamp(date, time).ok_or_else(|| {
        ProtocolError::InvalidPacket(format!(
            "invalid FAT timestamp date=0x{:04X} time=0x{:04X} for {}",
            date, time, name
        ))
    })?;

    Ok(DirectoryRecord::Entry(DirectoryEntry {
        name,
        size,
        modified,
        attributes,
    }))
}

/// Directory listing as published to observers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryListing {
    /// Path of the last requested listing
    pub path: String,
    /// Entries, ordered once the listing completes
    pub entries: Vec<DirectoryEntry>,
    /// A request is outstanding and the end marker has not arrived
    pub awaiting_response: bool,
    /// Failure of the last request, if any
    pub error: Option<String>,
}

impl DirectoryListing {
    /// Discard the previous listing and start waiting for `path`
    pub fn begin(&mut self, path: &str) {
        self.path = path.to_string();
        self.entries.clear();
        self.awaiting_response = true;
        self.error = None;
    }

    /// Feed one raw `0x11` body
    ///
    /// Returns `true` when the end-of-listing marker completed the listing.
    /// Malformed bodies are dropped.
    pub fn accept(&mut self, body: &[u8]) -> bool {
        match decode_entry(body) {
            Ok(DirectoryRecord::Entry(entry)) => {
                if !self.awaiting_response {
                    debug!("Directory entry {} arrived with no listing pending", entry.name);
                    return false;
                }
                self.entries.push(entry);
                false
            }
            Ok(DirectoryRecord::EndOfListing) => {
                self.entries.sort_by(DirectoryEntry::listing_order);
                let was_waiting = self.awaiting_response;
                self.awaiting_response = false;
                was_waiting
            }
            Err(e) => {
                debug!("Dropping directory entry: {}", e);
                false
            }
        }
    }

    /// End the pending request with an error
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.awaiting_response = false;
        self.error = Some(reason.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_body(name: &str, size: u32, attrs: u8, date: u16, time: u16) -> Vec<u8> {
        let mut body = vec![0u8; DIRECTORY_ENTRY_SIZE];
        body[0..4].copy_from_slice(&size.to_le_bytes());
        body[4..6].copy_from_slice(&date.to_le_bytes());
        body[6..8].copy_from_slice(&time.to_le_bytes());
        body[8] = attrs;
        body[NAME_OFFSET..NAME_OFFSET + name.len()].copy_from_slice(name.as_bytes());
        body
    }

    const DATE_2024_06_15: u16 = (44 << 9) | (6 << 5) | 15;
    const TIME_13_45_30: u16 = (13 << 11) | (45 << 5) | 15;

    #[test]
    fn test_decode_fat_timestamp() {
        let ts = decode_fat_timestamp(DATE_2024_06_15, TIME_13_45_30).unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-06-15T13:45:30+00:00");
        assert!(decode_fat_timestamp(0, 0).is_none());
        assert!(decode_fat_timestamp(DATE_2024_06_15, 24 << 11).is_none());
    }

    #[test]
    fn test_encode_fat_timestamp_range() {
        let early = Utc.with_ymd_and_hms(1979, 12, 31, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2108, 1, 1, 0, 0, 0).unwrap();
        assert!(encode_fat_timestamp(&early).is_none());
        assert!(encode_fat_timestamp(&late).is_none());

        let ts = Utc.with_ymd_and_hms(2024, 6, 15, 13, 45, 31).unwrap();
        assert_eq!(
            encode_fat_timestamp(&ts),
            Some((DATE_2024_06_15, TIME_13_45_30))
        );
    }

    #[test]
    fn test_decode_entry_fields() {
        let body = entry_body("LOG001.UBX", 123_456, 0x20, DATE_2024_06_15, TIME_13_45_30);
        let DirectoryRecord::Entry(entry) = decode_entry(&body).unwrap() else {
            panic!("expected an entry");
        };
        assert_eq!(entry.name, "LOG001.UBX");
        assert_eq!(entry.size, 123_456);
        assert_eq!(entry.attributes.flag_string(), "-a---");
        assert!(!entry.is_directory());
    }

    #[test]
    fn test_end_marker_wins_over_garbage() {
        let mut body = entry_body("", 0xFFFF_FFFF, 0xFF, 0, 0xFFFF);
        body.extend_from_slice(&[0xAB; 8]);
        assert_eq!(decode_entry(&body).unwrap(), DirectoryRecord::EndOfListing);
    }

    #[test]
    fn test_malformed_entries_rejected() {
        assert!(decode_entry(&[0u8; 21]).is_err());

        let mut bad_name = entry_body("X", 0, 0, DATE_2024_06_15, 0);
        bad_name[NAME_OFFSET] = 0xFF;
        assert!(decode_entry(&bad_name).is_err());

        let bad_date = entry_body("X", 0, 0, 0, 0);
        assert!(decode_entry(&bad_date).is_err());
    }

    #[test]
    fn test_listing_order_and_completion() {
        let mut listing = DirectoryListing::default();
        listing.begin("/");

        for (name, attrs) in [
            ("zeta.txt", 0x20),
            ("Beta", 0x10),
            ("alpha.txt", 0x20),
            ("ARCHIVE", 0x10),
            ("Gamma.txt", 0x00),
        ] {
            assert!(!listing.accept(&entry_body(name, 1, attrs, DATE_2024_06_15, 0)));
        }
        // malformed packet is dropped, listing keeps waiting
        assert!(!listing.accept(&[1, 2, 3]));
        assert!(listing.awaiting_response);

        assert!(listing.accept(&[0u8; DIRECTORY_ENTRY_SIZE]));
        assert!(!listing.awaiting_response);

        let names: Vec<&str> = listing.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["ARCHIVE", "Beta", "alpha.txt", "Gamma.txt", "zeta.txt"]
        );
    }

    #[test]
    fn test_begin_discards_previous_listing() {
        let mut listing = DirectoryListing::default();
        listing.begin("/a");
        listing.accept(&entry_body("ONE", 1, 0, DATE_2024_06_15, 0));
        listing.accept(&[0u8; DIRECTORY_ENTRY_SIZE]);
        assert_eq!(listing.entries.len(), 1);

        listing.begin("/b");
        assert!(listing.entries.is_empty());
        assert_eq!(listing.path, "/b");

        listing.fail("rejected");
        assert!(!listing.awaiting_response);
        assert_eq!(listing.error.as_deref(), Some("rejected"));
    }
}
