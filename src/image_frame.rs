//! Decoded image and frame value types
//!
//! Pixels are held in an [`image::RgbImage`]; rotation and file output go
//! through the `image` crate.

use std::path::Path;

use image::{imageops, ImageFormat, ImageResult};

pub use image::{Rgb, RgbImage};

use crate::detection_record::DetectionRecord;

/// Bytes per RGB pixel
pub const RGB_CHANNELS: usize = 3;

/// A fully decoded frame: the image plus the telemetry that came with it
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
    /// Telemetry record transmitted ahead of the image
    pub record: DetectionRecord,
    /// Decoded pixels
    pub image: RgbImage,
    /// Host-side count of frames emitted by the assembler, starting at 1
    pub sequence: u64,
}

impl ImageFrame {
    /// The frame as seen by a camera mounted upside down
    pub fn rotated_180(&self) -> Self {
        Self {
            record: self
                .record
                .rotated_180(self.image.width(), self.image.height()),
            image: imageops::rotate180(&self.image),
            sequence: self.sequence,
        }
    }
}

/// Write an image as a binary PPM
///
/// # Errors
///
/// Returns the encoder's error if the file cannot be created or written.
pub fn save_ppm(image: &RgbImage, path: &Path) -> ImageResult<()> {
    image.save_with_format(path, ImageFormat::Pnm)
}

/// Number of pixels in a `width` x `height` grid
#[inline]
pub fn pixel_count(width: u32, height: u32) -> usize {
    width as usize * height as usize
}
