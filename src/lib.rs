//! `viz-scope` - Host-side decoder for the VIZ serial camera stream
//!
//! The camera board pushes frames over a serial link, interleaved with its
//! own log output. Each frame is a `VIZ` marker, a 60-byte detection record
//! and a byte-swapped RGB565 image. This crate resynchronises on the marker,
//! decodes both parts, and recomputes the board's color masks for display.
//!
//! ```text
//! bytes -> FrameAssembler -> ImageFrame -> LatestFrame -> consumer
//!                                              |
//!                                              +-> ColorAnalyzer -> ColorMask
//! ```

pub mod capture;
pub mod color_analysis;
pub mod config;
pub mod control;
pub mod detection_record;
pub mod frame_assembler;
pub mod frame_sync;
pub mod image_frame;
pub mod ingest;
pub mod pixel_conversion;
pub mod record_validation;
pub mod replay;
pub mod test_utils;

use std::sync::{Arc, Mutex, MutexGuard};

use crate::image_frame::ImageFrame;

/// Contents of the latest-frame slot
#[derive(Debug, Default)]
struct Slot {
    frame: Option<Arc<ImageFrame>>,
    updated: bool,
}

/// Single-slot, overwrite-on-publish cell holding the newest frame
///
/// One ingest path publishes; any number of consumers read. Frames are
/// shared as `Arc`s so readers only hold the lock long enough to clone the
/// pointer, and a published frame is never mutated.
#[derive(Debug, Default)]
pub struct LatestFrame {
    slot: Mutex<Slot>,
}

impl LatestFrame {
    /// An empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored frame and raise the updated flag
    pub fn publish(&self, frame: ImageFrame) {
        let mut slot = self.lock();
        slot.frame = Some(Arc::new(frame));
        slot.updated = true;
    }

    /// The newest frame, without touching the updated flag
    pub fn latest(&self) -> Option<Arc<ImageFrame>> {
        self.lock().frame.clone()
    }

    /// The newest frame if it was published since the last call, clearing
    /// the updated flag
    pub fn take_updated(&self) -> Option<Arc<ImageFrame>> {
        let mut slot = self.lock();
        if !slot.updated {
            return None;
        }
        slot.updated = false;
        slot.frame.clone()
    }

    /// Whether a frame was published since the last [`take_updated`](Self::take_updated)
    pub fn has_update(&self) -> bool {
        self.lock().updated
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(e) => {
                log::warn!("Latest-frame lock poisoned, recovering");
                e.into_inner()
            }
        }
    }
}

/// Initialise `env_logger` with an `info` default filter
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection_record::DetectionRecord;
    use crate::image_frame::{Rgb, RgbImage};

    fn frame(sequence: u64) -> ImageFrame {
        ImageFrame {
            record: DetectionRecord::default(),
            image: RgbImage::from_pixel(1, 1, Rgb([0, 0, 0])),
            sequence,
        }
    }

    #[test]
    fn test_empty_slot() {
        let slot = LatestFrame::new();
        assert!(slot.latest().is_none());
        assert!(slot.take_updated().is_none());
        assert!(!slot.has_update());
    }

    #[test]
    fn test_publish_overwrites() {
        let slot = LatestFrame::new();
        slot.publish(frame(1));
        slot.publish(frame(2));
        assert_eq!(slot.latest().map(|f| f.sequence), Some(2));
    }

    #[test]
    fn test_take_updated_clears_flag() {
        let slot = LatestFrame::new();
        slot.publish(frame(5));
        assert!(slot.has_update());
        assert_eq!(slot.take_updated().map(|f| f.sequence), Some(5));
        assert!(slot.take_updated().is_none());
        // Still readable after consumption
        assert_eq!(slot.latest().map(|f| f.sequence), Some(5));
    }

    #[test]
    fn test_shared_across_threads() {
        let slot = Arc::new(LatestFrame::new());
        let writer = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || {
                for i in 1..=50 {
                    slot.publish(frame(i));
                }
            })
        };
        writer.join().unwrap();
        assert_eq!(slot.latest().map(|f| f.sequence), Some(50));
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
    }
}
