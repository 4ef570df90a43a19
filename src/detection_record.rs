//! Detection telemetry record
//!
//! Each frame carries a fixed 60-byte little-endian record right after the
//! marker. It describes what the on-board detector found: one primary
//! (yellow) target and up to two secondary (pink) targets.
//!
//! # Layout
//!
//! ```text
//! offset  size  field
//!      0     2  width (u16)
//!      2     2  height (u16)
//!      4     9  yellow target  (u8 present, i16 offset_x, i16 cx, i16 cy, u16 area)
//!     13     1  pink_count (u8)
//!     14     9  pink[0] target
//!     23     9  pink[1] target
//!     32     4  frame_number (u32)
//!     36     4  process_ms (u32)
//!     40    20  padding (ignored)
//! ```

use std::fmt;
use thiserror::Error;

/// Size of the encoded record in bytes
pub const RECORD_LEN: usize = 60;

/// Maximum number of secondary targets a record can describe
pub const MAX_PINK_TARGETS: usize = 2;

/// Encoded size of one target sub-record
const TARGET_LEN: usize = 9;

/// Offset of the trailing padding
const PADDING_OFFSET: usize = 40;

/// Errors produced while decoding a record
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// The caller supplied a slice that is not exactly [`RECORD_LEN`] bytes.
    #[error("detection record must be {expected} bytes, got {actual}")]
    WrongLength {
        /// Required length.
        expected: usize,
        /// Supplied length.
        actual: usize,
    },
}

/// One detected color target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TargetInfo {
    /// Whether the detector found this target
    pub present: bool,
    /// Signed horizontal offset of the centroid from the image center
    pub offset_x: i16,
    /// Centroid column
    pub centroid_x: i16,
    /// Centroid row
    pub centroid_y: i16,
    /// Blob area in pixels
    pub area: u16,
}

impl TargetInfo {
    /// Steering direction implied by the offset, if the target is present
    pub fn direction(&self) -> Option<Direction> {
        self.present.then(|| Direction::from_offset(self.offset_x))
    }

    fn mirrored(&self, width: i16, height: i16) -> Self {
        Self {
            present: self.present,
            offset_x: self.offset_x.wrapping_neg(),
            centroid_x: width.wrapping_sub(self.centroid_x),
            centroid_y: height.wrapping_sub(self.centroid_y),
            area: self.area,
        }
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            present: bytes[0] != 0,
            offset_x: read_i16(bytes, 1),
            centroid_x: read_i16(bytes, 3),
            centroid_y: read_i16(bytes, 5),
            area: read_u16(bytes, 7),
        }
    }

    fn encode_into(&self, out: &mut [u8]) {
        out[0] = u8::from(self.present);
        out[1..3].copy_from_slice(&self.offset_x.to_le_bytes());
        out[3..5].copy_from_slice(&self.centroid_x.to_le_bytes());
        out[5..7].copy_from_slice(&self.centroid_y.to_le_bytes());
        out[7..9].copy_from_slice(&self.area.to_le_bytes());
    }
}

/// Which way a target sits relative to the image center
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Negative offset
    Left,
    /// Zero offset
    Center,
    /// Positive offset
    Right,
}

impl Direction {
    /// Classify a signed offset
    pub fn from_offset(offset_x: i16) -> Self {
        match offset_x {
            0 => Self::Center,
            x if x < 0 => Self::Left,
            _ => Self::Right,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Left => "LEFT",
            Self::Center => "CENTER",
            Self::Right => "RIGHT",
        };
        f.write_str(s)
    }
}

/// Telemetry decoded from the 60-byte region following a marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DetectionRecord {
    /// Image width reported by the device
    pub width: u16,
    /// Image height reported by the device
    pub height: u16,
    /// Primary (yellow) target
    pub yellow: TargetInfo,
    /// Raw number of valid secondary targets; anything above 2 is malformed
    pub pink_count: u8,
    /// Secondary (pink) target slots, only the first `pink_count` are valid
    pub pink: [TargetInfo; MAX_PINK_TARGETS],
    /// Device-side frame sequence number
    pub frame_number: u32,
    /// Device-side processing time in milliseconds
    pub process_ms: u32,
}

impl DetectionRecord {
    /// Decode a record from exactly [`RECORD_LEN`] bytes
    ///
    /// The padding tail is ignored.
    ///
    /// # Errors
    ///
    /// Returns `RecordError::WrongLength` if `bytes` is not exactly
    /// [`RECORD_LEN`] bytes long. Short input is never zero-padded.
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        if bytes.len() != RECORD_LEN {
            return Err(RecordError::WrongLength {
                expected: RECORD_LEN,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            width: read_u16(bytes, 0),
            height: read_u16(bytes, 2),
            yellow: TargetInfo::decode(&bytes[4..4 + TARGET_LEN]),
            pink_count: bytes[13],
            pink: [
                TargetInfo::decode(&bytes[14..14 + TARGET_LEN]),
                TargetInfo::decode(&bytes[23..23 + TARGET_LEN]),
            ],
            frame_number: read_u32(bytes, 32),
            process_ms: read_u32(bytes, 36),
        })
    }

    /// Encode the record in wire layout, padding zero-filled
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[0..2].copy_from_slice(&self.width.to_le_bytes());
        out[2..4].copy_from_slice(&self.height.to_le_bytes());
        self.yellow.encode_into(&mut out[4..4 + TARGET_LEN]);
        out[13] = self.pink_count;
        self.pink[0].encode_into(&mut out[14..14 + TARGET_LEN]);
        self.pink[1].encode_into(&mut out[23..23 + TARGET_LEN]);
        out[32..36].copy_from_slice(&self.frame_number.to_le_bytes());
        out[36..PADDING_OFFSET].copy_from_slice(&self.process_ms.to_le_bytes());
        out
    }

    /// The primary target, if the detector found one
    pub fn yellow_target(&self) -> Option<&TargetInfo> {
        self.yellow.present.then_some(&self.yellow)
    }

    /// The valid secondary targets
    ///
    /// Only the first `pink_count` slots are returned (at most two). Slots
    /// past the count are ignored even if their raw bytes are non-zero.
    pub fn pink_targets(&self) -> &[TargetInfo] {
        let count = usize::from(self.pink_count).min(MAX_PINK_TARGETS);
        &self.pink[..count]
    }

    /// The same telemetry as seen in an image rotated by 180 degrees
    ///
    /// Centroids are mirrored against the frame geometry and offsets change
    /// sign. Presence flags, areas and counters are unchanged.
    pub fn rotated_180(&self, width: u32, height: u32) -> Self {
        let w = i16::try_from(width).unwrap_or(i16::MAX);
        let h = i16::try_from(height).unwrap_or(i16::MAX);
        Self {
            yellow: self.yellow.mirrored(w, h),
            pink: [self.pink[0].mirrored(w, h), self.pink[1].mirrored(w, h)],
            ..*self
        }
    }
}

#[inline]
fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

#[inline]
fn read_i16(bytes: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([bytes[at], bytes[at + 1]])
}

#[inline]
fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
