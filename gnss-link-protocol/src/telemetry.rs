//! Live GNSS telemetry decoder
//!
//! Each measurement notification starts with a field-presence mask. Only
//! the groups whose bit is set follow, in this fixed order:
//!
//! | Bit | Group      | Bytes | Encoding                                    |
//! |-----|------------|-------|---------------------------------------------|
//! | 0   | time       | 4     | u32 time-of-week, ms                        |
//! | 1   | position   | 12    | i32 lon, i32 lat (1e-7 deg), i32 height mm  |
//! | 2   | velocity   | 12    | i32 north, east, down, mm/s                 |
//! | 3   | accuracy   | 12    | u32 horizontal mm, vertical mm, speed mm/s  |
//! | 4   | satellites | 1     | u8 count                                    |
//!
//! The same bit layout is used as the GNSS field mask configured through
//! the control point.

use tracing::trace;

/// Field-presence bits
pub mod field {
    pub const TIME_OF_WEEK: u8 = 0x01;
    pub const POSITION: u8 = 0x02;
    pub const VELOCITY: u8 = 0x04;
    pub const ACCURACY: u8 = 0x08;
    pub const SATELLITES: u8 = 0x10;
    pub const ALL: u8 = TIME_OF_WEEK | POSITION | VELOCITY | ACCURACY | SATELLITES;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    /// Degrees
    pub longitude: f64,
    /// Degrees
    pub latitude: f64,
    /// Metres
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Velocity {
    /// Metres per second
    pub north: f64,
    pub east: f64,
    pub down: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Accuracy {
    /// Metres
    pub horizontal: f64,
    /// Metres
    pub vertical: f64,
    /// Metres per second
    pub speed: f64,
}

/// One decoded measurement
///
/// Immutable snapshot; a newer notification replaces it wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LiveGnssSample {
    /// Presence mask as received
    pub mask: u8,
    /// GPS time of week in milliseconds
    pub time_of_week_ms: Option<u32>,
    pub position: Option<Position>,
    pub velocity: Option<Velocity>,
    pub accuracy: Option<Accuracy>,
    pub satellites: Option<u8>,
    /// A group announced by the mask was cut short
    pub truncated: bool,
}

struct Cursor<'a> {
    bytes: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.bytes.len() < n {
            return None;
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Some(head)
    }

    fn u32s<const N: usize>(&mut self) -> Option<[u32; N]> {
        let raw = self.take(N * 4)?;
        let mut out = [0u32; N];
        for (slot, chunk) in out.iter_mut().zip(raw.chunks_exact(4)) {
            *slot = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Some(out)
    }

    fn i32s<const N: usize>(&mut self) -> Option<[i32; N]> {
        self.u32s::<N>().map(|v| v.map(|x| x as i32))
    }
}

/// Decode one measurement notification
///
/// Returns `None` only for an empty buffer. A buffer shorter than the mask
/// promises yields the groups decoded so far with `truncated` set.
///
/// ```rust
/// use gnss_link_protocol::telemetry::{decode_sample, field};
///
/// let mut bytes = vec![field::TIME_OF_WEEK | field::SATELLITES];
/// bytes.extend_from_slice(&345_600_000u32.to_le_bytes());
/// bytes.push(14);
///
/// let sample = decode_sample(&bytes).unwrap();
/// assert_eq!(sample.time_of_week_ms, Some(345_600_000));
/// assert_eq!(sample.satellites, Some(14));
/// assert!(sample.position.is_none());
/// ```
pub fn decode_sample(bytes: &[u8]) -> Option<LiveGnssSample> {
    let (&mask, rest) = bytes.split_first()?;
    let mut cursor = Cursor { bytes: rest };
    let mut sample = LiveGnssSample {
        mask,
        ..Default::default()
    };

    macro_rules! group {
        ($bit:expr, $decode:expr) => {
            if mask & $bit != 0 {
                match $decode(&mut cursor) {
                    Some(value) => Some(value),
                    None => {
                        trace!("GNSS sample truncated at group 0x{:02X}", $bit);
                        sample.truncated = true;
                        return Some(sample);
                    }
                }
            } else {
                None
            }
        };
    }

    sample.time_of_week_ms = group!(field::TIME_OF_WEEK, |c: &mut Cursor| c
        .u32s::<1>()
        .map(|[t]| t));

    sample.position = group!(field::POSITION, |c: &mut Cursor| c.i32s::<3>().map(
        |[lon, lat, h]| Position {
            longitude: f64::from(lon) * 1e-7,
            latitude: f64::from(lat) * 1e-7,
            height: f64::from(h) / 1000.0,
        }
    ));

    sample.velocity = group!(field::VELOCITY, |c: &mut Cursor| c.i32s::<3>().map(
        |[n, e, d]| Velocity {
            north: f64::from(n) / 1000.0,
            east: f64::from(e) / 1000.0,
            down: f64::from(d) / 1000.0,
        }
    ));

    sample.accuracy = group!(field::ACCURACY, |c: &mut Cursor| c.u32s::<3>().map(
        |[h, v, s]| Accuracy {
            horizontal: f64::from(h) / 1000.0,
            vertical: f64::from(v) / 1000.0,
            speed: f64::from(s) / 1000.0,
        }
    ));

    sample.satellites = group!(field::SATELLITES, |c: &mut Cursor| c.take(1).map(|b| b[0]));

    Some(sample)
}
