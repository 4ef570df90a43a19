//! RGB565 to RGB24 conversion
//!
//! The camera transmits its frame buffer as packed 16-bit RGB565 samples in
//! the sensor's native byte order: the high byte of each word arrives first.
//! Reading the stream as little-endian words therefore needs a byte swap
//! before the channels can be unpacked.
//!
//! # Bit layout
//!
//! ```text
//! 15      11 10        5 4       0
//! [ R R R R R G G G G G G B B B B B ]
//! ```
//!
//! # Channel expansion
//!
//! 5- and 6-bit channels are widened to 8 bits with one of two policies,
//! see [`ChannelExpansion`]. The default replicates the top bits into the
//! vacated low bits so full-scale input maps to 255.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::image_frame::{pixel_count, RgbImage, RGB_CHANNELS};

/// Bytes per RGB565 sample
pub const RGB565_BYTES_PER_PIXEL: usize = 2;

/// Error type for conversion failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    /// Payload length does not match the frame geometry.
    #[error("RGB565 payload is {actual} bytes, expected exactly {expected} for {width}x{height}")]
    SizeMismatch {
        /// Supplied length.
        actual: usize,
        /// Required length.
        expected: usize,
        /// Frame width in pixels.
        width: u32,
        /// Frame height in pixels.
        height: u32,
    },
}

/// How 5/6-bit channels are widened to 8 bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelExpansion {
    /// Shift left and copy the top bits into the low bits (0x1F -> 0xFF)
    #[default]
    Replicate,
    /// Plain shift left, low bits zero (0x1F -> 0xF8)
    Shift,
}

impl ChannelExpansion {
    /// Widen a 5-bit channel value
    #[inline]
    pub fn expand5(self, v: u8) -> u8 {
        let v = v & 0x1F;
        match self {
            Self::Replicate => (v << 3) | (v >> 2),
            Self::Shift => v << 3,
        }
    }

    /// Widen a 6-bit channel value
    #[inline]
    pub fn expand6(self, v: u8) -> u8 {
        let v = v & 0x3F;
        match self {
            Self::Replicate => (v << 2) | (v >> 4),
            Self::Shift => v << 2,
        }
    }

    /// Unpack one RGB565 word
    #[inline]
    pub fn unpack(self, word: u16) -> [u8; 3] {
        let r5 = ((word >> 11) & 0x1F) as u8;
        let g6 = ((word >> 5) & 0x3F) as u8;
        let b5 = (word & 0x1F) as u8;
        [self.expand5(r5), self.expand6(g6), self.expand5(b5)]
    }
}

/// Assemble a sample from its two wire bytes (high byte first)
#[inline]
pub fn wire_word(first: u8, second: u8) -> u16 {
    u16::from_be_bytes([first, second])
}

/// Expected payload size for a `width` x `height` frame
#[inline]
pub fn payload_len(width: u32, height: u32) -> usize {
    pixel_count(width, height) * RGB565_BYTES_PER_PIXEL
}

/// Convert a byte-swapped RGB565 payload to an RGB image
///
/// # Arguments
///
/// * `data` - Exactly `width * height * 2` bytes, row-major
/// * `width` - Frame width in pixels
/// * `height` - Frame height in pixels
/// * `expansion` - Channel widening policy
///
/// # Errors
///
/// Returns `ConversionError::SizeMismatch` if `data` is not exactly the
/// payload size for the given geometry, larger inputs included.
pub fn convert_rgb565_to_rgb(
    data: &[u8],
    width: u32,
    height: u32,
    expansion: ChannelExpansion,
) -> Result<RgbImage, ConversionError> {
    let expected = payload_len(width, height);
    if data.len() != expected {
        return Err(ConversionError::SizeMismatch {
            actual: data.len(),
            expected,
            width,
            height,
        });
    }

    // Log once
    static LOGGED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
    if !LOGGED.swap(true, std::sync::atomic::Ordering::Relaxed) {
        log::info!(
            "RGB565 conversion: {}x{}, {} bytes, {:?} expansion",
            width,
            height,
            expected,
            expansion
        );
    }

    let mut rgb = Vec::with_capacity(pixel_count(width, height) * RGB_CHANNELS);
    for sample in data.chunks_exact(RGB565_BYTES_PER_PIXEL) {
        rgb.extend_from_slice(&expansion.unpack(wire_word(sample[0], sample[1])));
    }

    RgbImage::from_raw(width, height, rgb).ok_or(ConversionError::SizeMismatch {
        actual: data.len(),
        expected,
        width,
        height,
    })
}
