//! Synthetic serial stream generation for testing
//!
//! Builds wire-exact frames (marker, record, byte-swapped RGB565 payload)
//! with known pixel content, plus the log noise the device interleaves with
//! them.
//!
//! # Example
//!
//! ```rust,ignore
//! use viz_scope_lib::test_utils::{Rgb, StreamGenerator};
//!
//! let mut gen = StreamGenerator::new(160, 120);
//!
//! let mut stream = gen.garbage(37);
//! stream.extend(gen.solid_frame(Rgb::YELLOW));
//! for chunk in StreamGenerator::chunked(&stream, 64) {
//!     assembler.ingest(&chunk);
//! }
//! ```

use crate::detection_record::{DetectionRecord, TargetInfo, RECORD_LEN};
use crate::frame_sync::MARKER;
use crate::image_frame::pixel_count;
use crate::pixel_conversion::RGB565_BYTES_PER_PIXEL;

/// RGB color for test patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    /// Red component (0-255)
    pub r: u8,
    /// Green component (0-255)
    pub g: u8,
    /// Blue component (0-255)
    pub b: u8,
}

impl Rgb {
    /// Pure red color
    pub const RED: Rgb = Rgb { r: 255, g: 0, b: 0 };
    /// Pure green color
    pub const GREEN: Rgb = Rgb { r: 0, g: 255, b: 0 };
    /// Pure blue color
    pub const BLUE: Rgb = Rgb { r: 0, g: 0, b: 255 };
    /// Pure white color
    pub const WHITE: Rgb = Rgb {
        r: 255,
        g: 255,
        b: 255,
    };
    /// Pure black color
    pub const BLACK: Rgb = Rgb { r: 0, g: 0, b: 0 };
    /// Yellow color
    pub const YELLOW: Rgb = Rgb {
        r: 255,
        g: 255,
        b: 0,
    };
    /// Magenta color
    pub const MAGENTA: Rgb = Rgb {
        r: 255,
        g: 0,
        b: 255,
    };

    /// Pack into an RGB565 word (top bits of each channel)
    pub fn to_rgb565(self) -> u16 {
        (u16::from(self.r >> 3) << 11) | (u16::from(self.g >> 2) << 5) | u16::from(self.b >> 3)
    }

    /// The two bytes of the packed word in transmission order
    pub fn wire_bytes(self) -> [u8; 2] {
        self.to_rgb565().to_be_bytes()
    }

    /// As an `[r, g, b]` array
    pub fn to_array(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }
}

/// Device log lines interleaved with frames; contains no `V`
const LOG_NOISE: &[u8] = b"[cam] exposure ok\r\n[det] blobs=2 t=14ms\r\n";

/// Generates synthetic frames for a fixed geometry
pub struct StreamGenerator {
    width: u16,
    height: u16,
    next_frame_number: u32,
    noise_state: u32,
}

impl Default for StreamGenerator {
    fn default() -> Self {
        Self::new(160, 120)
    }
}

impl StreamGenerator {
    /// Create a generator for `width` x `height` frames
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            next_frame_number: 1,
            noise_state: 0x2545_F491,
        }
    }

    /// Payload size for one frame
    pub fn payload_len(&self) -> usize {
        pixel_count(u32::from(self.width), u32::from(self.height)) * RGB565_BYTES_PER_PIXEL
    }

    /// Full wire size of one frame (marker + record + payload)
    pub fn frame_len(&self) -> usize {
        MARKER.len() + RECORD_LEN + self.payload_len()
    }

    /// A record for the next frame: correct geometry, counters advanced,
    /// a centered yellow target and no pink targets
    pub fn next_record(&mut self) -> DetectionRecord {
        let frame_number = self.next_frame_number;
        self.next_frame_number = self.next_frame_number.wrapping_add(1);
        DetectionRecord {
            width: self.width,
            height: self.height,
            yellow: TargetInfo {
                present: true,
                offset_x: 0,
                centroid_x: (self.width / 2) as i16,
                centroid_y: (self.height / 2) as i16,
                area: 42,
            },
            frame_number,
            process_ms: 12,
            ..Default::default()
        }
    }

    /// One frame filled with a single color
    pub fn solid_frame(&mut self, color: Rgb) -> Vec<u8> {
        let record = self.next_record();
        self.frame_with_record(&record, color)
    }

    /// One solid-color frame carrying the given record
    pub fn frame_with_record(&self, record: &DetectionRecord, color: Rgb) -> Vec<u8> {
        let pixels = pixel_count(u32::from(self.width), u32::from(self.height));
        let mut payload = Vec::with_capacity(self.payload_len());
        for _ in 0..pixels {
            payload.extend_from_slice(&color.wire_bytes());
        }
        Self::encode_frame(record, &payload)
    }

    /// One frame whose left half is `left` and right half is `right`
    pub fn split_frame(&mut self, left: Rgb, right: Rgb) -> Vec<u8> {
        let record = self.next_record();
        let mut payload = Vec::with_capacity(self.payload_len());
        for _ in 0..self.height {
            for x in 0..self.width {
                let color = if x < self.width / 2 { left } else { right };
                payload.extend_from_slice(&color.wire_bytes());
            }
        }
        Self::encode_frame(&record, &payload)
    }

    /// Assemble marker, record and an arbitrary payload
    pub fn encode_frame(record: &DetectionRecord, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(MARKER.len() + RECORD_LEN + payload.len());
        frame.extend_from_slice(MARKER);
        frame.extend_from_slice(&record.encode());
        frame.extend_from_slice(payload);
        frame
    }

    /// Device log text of the given length
    pub fn log_noise(len: usize) -> Vec<u8> {
        LOG_NOISE.iter().copied().cycle().take(len).collect()
    }

    /// Pseudo-random bytes that never contain a `V`
    ///
    /// Deterministic per generator, so failures are reproducible.
    pub fn garbage(&mut self, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            // xorshift32
            let mut x = self.noise_state;
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            self.noise_state = x;
            let byte = (x >> 24) as u8;
            if byte != MARKER[0] {
                out.push(byte);
            }
        }
        out
    }

    /// Split a byte stream into fixed-size chunks, last one possibly shorter
    pub fn chunked(data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
        data.chunks(chunk_size.max(1)).map(<[u8]>::to_vec).collect()
    }
}
