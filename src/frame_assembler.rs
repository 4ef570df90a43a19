//! Frame assembly from the raw serial byte stream
//!
//! Decouples frame reassembly from the transport so it can be tested without
//! the camera attached. Bytes are appended as they arrive; the assembler
//! then walks a three-state machine:
//!
//! ```text
//! SeekingMarker --marker--> AwaitingMetadata --60 bytes--> AwaitingImage
//!       ^                          |                            |
//!       +------ malformed ---------+                            |
//!       +------------------ payload complete (frame) ----------+
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use viz_scope_lib::frame_assembler::FrameAssembler;
//!
//! let mut assembler = FrameAssembler::new(160, 120);
//!
//! for chunk in serial_reads {
//!     for frame in assembler.ingest(&chunk) {
//!         show(frame);
//!     }
//! }
//! ```

use serde::Serialize;

use crate::detection_record::{DetectionRecord, RECORD_LEN};
use crate::frame_sync::{
    find_frame_start, find_marker, find_marker_start, retained_tail_len, NeedMoreData,
    MARKER_LEN,
};
use crate::image_frame::ImageFrame;
use crate::pixel_conversion::{convert_rgb565_to_rgb, payload_len, ChannelExpansion};
use crate::record_validation::{presence_flags_valid, validate_record, ValidationLevel};

/// Where the assembler is in the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssemblerState {
    /// Scanning for the next marker
    #[default]
    SeekingMarker,
    /// Marker consumed, waiting for the full record
    AwaitingMetadata,
    /// Record decoded, waiting for the full pixel payload
    AwaitingImage(DetectionRecord),
}

/// Result of a single state-machine step
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessResult {
    /// Not enough buffered bytes for the current state; feed more data
    Accumulating,
    /// Moved to the next state, call again
    Progressed,
    /// Bytes were dropped to resynchronise (malformed record or truncated frame)
    Skipped,
    /// Complete frame ready
    Frame(ImageFrame),
}

/// Running counters for a stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AssemblerStats {
    /// Bytes handed to [`FrameAssembler::push`]
    pub bytes_received: u64,
    /// Bytes dropped while seeking or resynchronising
    pub bytes_discarded: u64,
    /// Completed frames
    pub frames_emitted: u64,
    /// Records rejected by validation
    pub malformed_records: u64,
    /// Frames abandoned because a newer frame started inside their record or payload
    pub truncated_frames: u64,
}

/// Assembles complete frames from the serial byte stream
///
/// The frame geometry is fixed at construction; the width/height carried in
/// each record are validated against it but never used to size buffers.
#[derive(Debug)]
pub struct FrameAssembler {
    /// Bytes received but not yet consumed
    buffer: Vec<u8>,
    state: AssemblerState,
    width: u16,
    height: u16,
    expansion: ChannelExpansion,
    validation: ValidationLevel,
    stats: AssemblerStats,
}

impl FrameAssembler {
    /// Create a new frame assembler
    ///
    /// # Arguments
    /// * `width` - Frame width in pixels
    /// * `height` - Frame height in pixels
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            buffer: Vec::with_capacity(payload_len(u32::from(width), u32::from(height)) * 2),
            state: AssemblerState::SeekingMarker,
            width,
            height,
            expansion: ChannelExpansion::default(),
            validation: ValidationLevel::default(),
            stats: AssemblerStats::default(),
        }
    }

    /// Use the given channel expansion policy for pixel conversion
    pub fn with_expansion(mut self, expansion: ChannelExpansion) -> Self {
        self.expansion = expansion;
        self
    }

    /// Use the given record validation level
    pub fn with_validation(mut self, validation: ValidationLevel) -> Self {
        self.validation = validation;
        self
    }

    /// Reset the assembler state
    ///
    /// Buffered bytes are dropped; counters are kept.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = AssemblerState::SeekingMarker;
    }

    /// Current state
    pub fn state(&self) -> &AssemblerState {
        &self.state
    }

    /// Get current buffer size (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Counters since construction
    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    /// Configured frame geometry
    pub fn geometry(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    /// Pixel payload size for the configured geometry
    pub fn payload_len(&self) -> usize {
        payload_len(u32::from(self.width), u32::from(self.height))
    }

    /// Append newly received bytes without processing them
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.stats.bytes_received += data.len() as u64;
    }

    /// Append `data` and run the state machine as far as it will go
    ///
    /// Returns every frame completed by this call, oldest first. Zero, one or
    /// several frames may come out of a single call.
    pub fn ingest(&mut self, data: &[u8]) -> Vec<ImageFrame> {
        self.push(data);

        let mut frames = Vec::new();
        loop {
            match self.process_next() {
                ProcessResult::Accumulating => break,
                ProcessResult::Progressed | ProcessResult::Skipped => {}
                ProcessResult::Frame(frame) => frames.push(frame),
            }
        }
        frames
    }

    /// Run a single state transition on the buffered bytes
    pub fn process_next(&mut self) -> ProcessResult {
        match self.state {
            AssemblerState::SeekingMarker => self.seek_marker(),
            AssemblerState::AwaitingMetadata => self.read_record(),
            AssemblerState::AwaitingImage(record) => self.read_image(record),
        }
    }

    fn seek_marker(&mut self) -> ProcessResult {
        if let Some(end) = find_marker(&self.buffer) {
            let skipped = end - MARKER_LEN;
            if skipped > 0 {
                log::debug!("Skipped {} bytes before marker", skipped);
                self.discard(skipped);
            }
            self.buffer.drain(..MARKER_LEN);
            self.state = AssemblerState::AwaitingMetadata;
            return ProcessResult::Progressed;
        }

        // Everything except a possible marker prefix is noise
        let keep = retained_tail_len(&self.buffer);
        let drop = self.buffer.len() - keep;
        if drop > 0 {
            self.discard(drop);
        }
        ProcessResult::Accumulating
    }

    fn read_record(&mut self) -> ProcessResult {
        if self.buffer.len() < RECORD_LEN {
            return ProcessResult::Accumulating;
        }

        // A stale marker followed by the next frame: sync on the newer one
        match self.newer_frame_start(RECORD_LEN) {
            Err(NeedMoreData) => return ProcessResult::Accumulating,
            Ok(Some(start)) => {
                log::warn!(
                    "Partial record: new frame starts {} bytes in, resynchronising",
                    start
                );
                return self.restart_at(start);
            }
            Ok(None) => {}
        }

        let raw = &self.buffer[..RECORD_LEN];
        let failure = match DetectionRecord::decode(raw) {
            Err(e) => Some(e.to_string()),
            Ok(record) => {
                let result = validate_record(
                    &record,
                    u32::from(self.width),
                    u32::from(self.height),
                    self.validation,
                );
                if !result.valid {
                    result.failure_reason
                } else if !presence_flags_valid(raw, self.validation) {
                    Some("presence flag is not 0/1".to_string())
                } else {
                    self.buffer.drain(..RECORD_LEN);
                    self.state = AssemblerState::AwaitingImage(record);
                    return ProcessResult::Progressed;
                }
            }
        };

        self.stats.malformed_records += 1;
        log::warn!(
            "Malformed detection record ({}), resynchronising",
            failure.as_deref().unwrap_or("unknown")
        );

        // A marker inside the rejected window is most likely the next real
        // frame; keep it. Otherwise keep only a possible split marker.
        let drop = match find_marker_start(raw) {
            Some(start) => start,
            None => RECORD_LEN - (MARKER_LEN - 1),
        };
        self.discard(drop);
        self.state = AssemblerState::SeekingMarker;
        ProcessResult::Skipped
    }

    fn read_image(&mut self, record: DetectionRecord) -> ProcessResult {
        let need = self.payload_len();
        if self.buffer.len() < need {
            return ProcessResult::Accumulating;
        }

        match self.newer_frame_start(need) {
            Err(NeedMoreData) => return ProcessResult::Accumulating,
            Ok(Some(start)) => {
                log::warn!(
                    "Frame {} truncated: new frame header {} bytes into payload",
                    record.frame_number,
                    start
                );
                return self.restart_at(start);
            }
            Ok(None) => {}
        }

        let result = convert_rgb565_to_rgb(
            &self.buffer[..need],
            u32::from(self.width),
            u32::from(self.height),
            self.expansion,
        );
        self.buffer.drain(..need);
        self.state = AssemblerState::SeekingMarker;

        match result {
            Ok(image) => {
                self.stats.frames_emitted += 1;
                let sequence = self.stats.frames_emitted;
                if sequence == 1 {
                    log::info!(
                        "First frame: {}x{}, device frame #{}",
                        self.width,
                        self.height,
                        record.frame_number
                    );
                }
                log::debug!(
                    "Complete frame #{} (device #{}, {} ms): {} bytes buffered",
                    sequence,
                    record.frame_number,
                    record.process_ms,
                    self.buffer.len()
                );
                ProcessResult::Frame(ImageFrame {
                    record,
                    image,
                    sequence,
                })
            }
            Err(e) => {
                self.stats.bytes_discarded += need as u64;
                log::warn!("Dropping frame {}: {}", record.frame_number, e);
                ProcessResult::Skipped
            }
        }
    }

    /// Offset of a newer frame starting within the first `limit` bytes
    ///
    /// Strict validation only trusts a marker followed by the configured
    /// geometry; the other levels take any marker.
    fn newer_frame_start(&self, limit: usize) -> Result<Option<usize>, NeedMoreData> {
        let geometry = self
            .validation
            .checks_geometry()
            .then_some((self.width, self.height));
        find_frame_start(&self.buffer, limit, geometry)
    }

    /// Abandon the current frame and seek from `start`
    fn restart_at(&mut self, start: usize) -> ProcessResult {
        self.stats.truncated_frames += 1;
        self.discard(start);
        self.state = AssemblerState::SeekingMarker;
        ProcessResult::Skipped
    }

    fn discard(&mut self, count: usize) {
        self.buffer.drain(..count);
        self.stats.bytes_discarded += count as u64;
    }
}


#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::test_utils::{Rgb, StreamGenerator};

    fn collect(assembler: &mut FrameAssembler, chunks: &[Vec<u8>]) -> Vec<ImageFrame> {
        chunks.iter().flat_map(|c| assembler.ingest(c)).collect()
    }

    #[test]
    fn test_single_frame_after_garbage() {
        let mut gen = StreamGenerator::new(16, 8);
        let mut assembler = FrameAssembler::new(16, 8);

        let mut stream = gen.garbage(500);
        stream.extend(gen.solid_frame(Rgb::RED));

        let frames = assembler.ingest(&stream);
        assert_eq!(frames.len(), 1, "Expected exactly 1 frame");
        assert!(frames[0].image.pixels().all(|px| px.0 == [255, 0, 0]));
        assert_eq!(assembler.stats().bytes_discarded, 500);
    }

    #[test]
    fn test_multiple_frames_per_ingest() {
        let mut gen = StreamGenerator::new(8, 8);
        let mut assembler = FrameAssembler::new(8, 8);

        let colors = [Rgb::RED, Rgb::GREEN, Rgb::BLUE];
        let mut stream = Vec::new();
        for color in &colors {
            stream.extend(gen.solid_frame(*color));
            stream.extend(StreamGenerator::log_noise(23));
        }

        let frames = assembler.ingest(&stream);
        assert_eq!(frames.len(), 3, "Expected 3 frames");
        for (i, (frame, color)) in frames.iter().zip(colors.iter()).enumerate() {
            assert_eq!(
                frame.image.get_pixel(3, 3).0,
                color.to_array(),
                "Frame {} color mismatch",
                i
            );
            assert_eq!(frame.sequence, i as u64 + 1);
            assert_eq!(frame.record.frame_number, i as u32 + 1);
        }
    }

    #[test]
    fn test_marker_split_across_ingests() {
        let mut gen = StreamGenerator::new(4, 4);
        let mut assembler = FrameAssembler::new(4, 4);

        let mut stream = StreamGenerator::log_noise(11);
        let marker_at = stream.len();
        stream.extend(gen.solid_frame(Rgb::WHITE));

        // Split between "V" and "IZ"
        let first = assembler.ingest(&stream[..marker_at + 1]);
        assert!(first.is_empty());
        let second = assembler.ingest(&stream[marker_at + 1..]);
        assert_eq!(second.len(), 1);
        assert!(second[0].image.pixels().all(|px| px.0 == [255, 255, 255]));
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut gen = StreamGenerator::new(4, 2);
        let mut assembler = FrameAssembler::new(4, 2);

        let mut stream = gen.garbage(40);
        stream.extend(gen.split_frame(Rgb::YELLOW, Rgb::BLUE));
        stream.extend(gen.garbage(3));
        stream.extend(gen.solid_frame(Rgb::GREEN));

        let frames = collect(&mut assembler, &StreamGenerator::chunked(&stream, 1));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].image.get_pixel(0, 0).0, [255, 255, 0]);
        assert_eq!(frames[0].image.get_pixel(3, 1).0, [0, 0, 255]);
        assert_eq!(frames[1].image.get_pixel(0, 0).0, [0, 255, 0]);
    }

    #[test]
    fn test_partial_payload_retained() {
        let mut gen = StreamGenerator::new(8, 8);
        let mut assembler = FrameAssembler::new(8, 8);
        let frame = gen.solid_frame(Rgb::MAGENTA);

        let cut = frame.len() - 5;
        assert!(assembler.ingest(&frame[..cut]).is_empty());
        assert!(matches!(assembler.state(), AssemblerState::AwaitingImage(_)));
        assert_eq!(assembler.buffer_len(), cut - 63);

        let frames = assembler.ingest(&frame[cut..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(assembler.buffer_len(), 0);
    }

    #[test]
    fn test_two_markers_sync_on_second() {
        let levels = [
            ValidationLevel::Strict,
            ValidationLevel::Moderate,
            ValidationLevel::Off,
        ];
        for level in levels {
            for stale_len in 0..RECORD_LEN {
                let mut gen = StreamGenerator::new(4, 4);
                let mut assembler = FrameAssembler::new(4, 4).with_validation(level);

                // A stale marker with a partial record, then a full frame
                let stale = gen.next_record();
                let mut stream = b"VIZ".to_vec();
                stream.extend_from_slice(&stale.encode()[..stale_len]);
                stream.extend(gen.solid_frame(Rgb::BLUE));

                let frames = assembler.ingest(&stream);
                assert_eq!(frames.len(), 1, "{:?}, stale record of {}", level, stale_len);
                assert_eq!(frames[0].record.frame_number, 2, "{:?}, {}", level, stale_len);
                assert!(frames[0].image.pixels().all(|px| px.0 == [0, 0, 255]));
                assert_eq!(assembler.stats().frames_emitted, 1);
            }
        }
    }

    #[test]
    fn test_two_markers_byte_at_a_time() {
        for stale_len in [20, 24, 57, 58, 59] {
            for level in [ValidationLevel::Strict, ValidationLevel::Moderate] {
                let mut gen = StreamGenerator::new(4, 4);
                let mut assembler = FrameAssembler::new(4, 4).with_validation(level);

                let stale = gen.next_record();
                let mut stream = b"VIZ".to_vec();
                stream.extend_from_slice(&stale.encode()[..stale_len]);
                stream.extend(gen.solid_frame(Rgb::BLUE));

                let frames = collect(&mut assembler, &StreamGenerator::chunked(&stream, 1));
                assert_eq!(frames.len(), 1, "{:?}, stale record of {}", level, stale_len);
                assert_eq!(frames[0].record.frame_number, 2);
            }
        }
    }

    #[test]
    fn test_bare_marker_in_payload_truncates_below_strict() {
        let mut gen = StreamGenerator::new(4, 4);
        let mut assembler = FrameAssembler::new(4, 4).with_validation(ValidationLevel::Moderate);

        let first = gen.solid_frame(Rgb::RED);
        let mut stream = first[..first.len() - 20].to_vec();
        stream.extend(gen.solid_frame(Rgb::GREEN));

        let frames = assembler.ingest(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].record.frame_number, 2);
        assert_eq!(assembler.stats().truncated_frames, 1);
    }

    #[test]
    fn test_pink1_ignored_when_count_is_one() {
        let gen = StreamGenerator::new(2, 2);
        let mut assembler = FrameAssembler::new(2, 2);

        let mut record = DetectionRecord {
            width: 2,
            height: 2,
            pink_count: 1,
            ..Default::default()
        };
        record.pink[0].present = true;
        record.pink[0].offset_x = -5;
        record.pink[1].present = true;
        record.pink[1].offset_x = 99;

        let frames = assembler.ingest(&gen.frame_with_record(&record, Rgb::BLACK));
        let targets = frames[0].record.pink_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].offset_x, -5);
    }

    #[test]
    fn test_unused_pink_slot_garbage_accepted() {
        let gen = StreamGenerator::new(2, 2);
        let mut assembler = FrameAssembler::new(2, 2);

        let mut record = DetectionRecord {
            width: 2,
            height: 2,
            pink_count: 1,
            ..Default::default()
        };
        record.pink[0].present = true;
        let mut stream = gen.frame_with_record(&record, Rgb::WHITE);
        stream[3 + 23] = 0x02; // pink1 present flag, slot unused

        let frames = assembler.ingest(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].record.pink_targets().len(), 1);
        assert_eq!(assembler.stats().malformed_records, 0);
    }

    #[test]
    fn test_stats_account_for_every_byte() {
        let mut gen = StreamGenerator::new(4, 4);
        let mut assembler = FrameAssembler::new(4, 4);

        let mut stream = gen.garbage(100);
        stream.extend(gen.solid_frame(Rgb::RED));
        stream.extend(gen.garbage(7));

        assembler.ingest(&stream);
        let stats = assembler.stats();
        assert_eq!(stats.bytes_received, stream.len() as u64);
        assert_eq!(stats.frames_emitted, 1);
        assert_eq!(stats.bytes_discarded, 107);
    }
}
