//! Stream replay for testing without the camera attached.
//!
//! Loads a capture written by [`capture`](crate::capture) and feeds its
//! chunks back through a [`FrameAssembler`], optionally honouring the
//! original timing.
//!
//! # File Format
//!
//! ```text
//! [u64 LE: timestamp_us][u32 LE: length][data bytes]...
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::path::Path;
//! use viz_scope_lib::replay::StreamReplay;
//!
//! let mut replay = StreamReplay::load(Path::new("capture_12345.bin"))?;
//!
//! // Start replay and receive frames via channel
//! let receiver = replay.start()?;
//!
//! while let Ok(frame) = receiver.recv() {
//!     process_frame(&frame);
//! }
//! ```

use std::io::Read;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::capture::{metadata_path_for, read_metadata, CaptureMetadata, CapturedChunk};
use crate::frame_assembler::{FrameAssembler, ProcessResult};
use crate::image_frame::ImageFrame;
use crate::pixel_conversion::ChannelExpansion;
use crate::record_validation::ValidationLevel;

/// Largest chunk accepted from a capture file
///
/// Live reads are capped at this size too, so every capture stays replayable.
pub const MAX_CHUNK_LEN: usize = 1024 * 1024;

/// Geometry used when neither the config nor the metadata names one
const DEFAULT_GEOMETRY: (u16, u16) = (160, 120);

/// Errors that can occur during replay operations.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// File not found or cannot be opened.
    #[error("failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    /// Invalid or corrupted chunk data in the capture file.
    #[error("invalid chunk data at offset {offset}: {message}")]
    InvalidChunk {
        /// Byte offset in the capture file where the error occurred.
        offset: u64,
        /// Description of the error.
        message: String,
    },

    /// Replay is already running.
    #[error("replay is already running")]
    AlreadyRunning,

    /// Replay is not running.
    #[error("replay is not running")]
    NotRunning,
}

/// Result type alias for replay operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Configuration for stream replay.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Playback speed multiplier (1.0 = realtime, 2.0 = 2x speed, 0.0 = as fast as possible).
    pub speed: f64,
    /// Whether to loop the replay when reaching the end.
    pub loop_playback: bool,
    /// Frame geometry override (None = from metadata, else 160x120).
    pub geometry: Option<(u16, u16)>,
    /// Channel expansion policy.
    pub expansion: ChannelExpansion,
    /// Record validation level.
    pub validation: ValidationLevel,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            loop_playback: false,
            geometry: None,
            expansion: ChannelExpansion::default(),
            validation: ValidationLevel::default(),
        }
    }
}

/// Replays a captured stream for desktop testing.
pub struct StreamReplay {
    /// Loaded chunks ready for replay.
    chunks: Vec<CapturedChunk>,
    /// Optional metadata from the capture session.
    metadata: Option<CaptureMetadata>,
    /// Replay configuration.
    config: ReplayConfig,
    /// Handle to the replay thread (if running).
    thread_handle: Option<JoinHandle<()>>,
    /// Sender to stop the replay.
    stop_sender: Option<Sender<()>>,
}

impl StreamReplay {
    /// Load a capture from its `.bin` file.
    ///
    /// A companion `.json` metadata file is picked up if present.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::FileOpen` if the file cannot be opened.
    /// Returns `ReplayError::InvalidChunk` if the file contains corrupted data.
    pub fn load(path: &Path) -> Result<Self> {
        let chunks = read_chunks(path)?;
        let metadata = Self::try_load_metadata(path);

        log::info!("Loaded {} chunks from {}", chunks.len(), path.display());

        if let Some(ref meta) = metadata {
            log::info!(
                "Metadata: {}x{}, {} frames, {} ms",
                meta.width,
                meta.height,
                meta.total_frames,
                meta.duration_ms
            );
        }

        Ok(Self {
            chunks,
            metadata,
            config: ReplayConfig::default(),
            thread_handle: None,
            stop_sender: None,
        })
    }

    /// Load a capture with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or contains invalid chunk data.
    pub fn load_with_config(path: &Path, config: ReplayConfig) -> Result<Self> {
        let mut replay = Self::load(path)?;
        replay.config = config;
        Ok(replay)
    }

    fn try_load_metadata(path: &Path) -> Option<CaptureMetadata> {
        let json_path = metadata_path_for(path);
        if !json_path.exists() {
            return None;
        }
        match read_metadata(&json_path) {
            Ok(meta) => Some(meta),
            Err(e) => {
                log::warn!("Ignoring unreadable metadata {}: {}", json_path.display(), e);
                None
            }
        }
    }

    /// Get the loaded metadata, if available.
    #[must_use]
    pub fn metadata(&self) -> Option<&CaptureMetadata> {
        self.metadata.as_ref()
    }

    /// Get the number of loaded chunks.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Get the total duration of the capture in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        self.chunks
            .last()
            .map(|c| c.timestamp_us / 1000)
            .unwrap_or(0)
    }

    /// Check if replay is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }

    /// Start replaying chunks in a background thread.
    ///
    /// Returns a receiver that yields assembled frames. The channel closes
    /// when a non-looping replay reaches the end of the capture.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::AlreadyRunning` if replay is already in progress.
    pub fn start(&mut self) -> Result<Receiver<ImageFrame>> {
        if self.is_running() {
            return Err(ReplayError::AlreadyRunning);
        }

        let (frame_tx, frame_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel();

        let chunks = self.chunks.clone();
        let config = self.config.clone();
        let assembler = create_assembler(&self.config, self.metadata.as_ref());

        let handle = thread::spawn(move || {
            Self::replay_thread(chunks, config, assembler, frame_tx, stop_rx);
        });

        self.thread_handle = Some(handle);
        self.stop_sender = Some(stop_tx);

        log::info!("Stream replay started");
        Ok(frame_rx)
    }

    /// Stop the replay thread.
    ///
    /// Blocks until the thread has finished.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::NotRunning` if replay is not in progress.
    pub fn stop(&mut self) -> Result<()> {
        let stop_tx = self.stop_sender.take().ok_or(ReplayError::NotRunning)?;
        let handle = self.thread_handle.take().ok_or(ReplayError::NotRunning)?;

        let _ = stop_tx.send(());
        handle.join().map_err(|_| ReplayError::NotRunning)?;

        log::info!("Stream replay stopped");
        Ok(())
    }

    fn replay_thread(
        chunks: Vec<CapturedChunk>,
        config: ReplayConfig,
        mut assembler: FrameAssembler,
        frame_tx: Sender<ImageFrame>,
        stop_rx: Receiver<()>,
    ) {
        loop {
            let replay_start = Instant::now();

            for chunk in &chunks {
                if stop_rx.try_recv().is_ok() {
                    log::debug!("Replay thread received stop signal");
                    return;
                }

                if config.speed > 0.0 {
                    let expected_elapsed =
                        Duration::from_micros((chunk.timestamp_us as f64 / config.speed) as u64);
                    let actual_elapsed = replay_start.elapsed();

                    if expected_elapsed > actual_elapsed {
                        // Sleep in small steps so a stop request is noticed
                        let step = Duration::from_millis(10);
                        let mut remaining = expected_elapsed - actual_elapsed;
                        while remaining > Duration::ZERO {
                            if stop_rx.try_recv().is_ok() {
                                return;
                            }
                            let sleep = remaining.min(step);
                            thread::sleep(sleep);
                            remaining = remaining.saturating_sub(sleep);
                        }
                    }
                }

                for frame in assembler.ingest(&chunk.data) {
                    if frame_tx.send(frame).is_err() {
                        log::debug!("Frame receiver dropped, stopping replay");
                        return;
                    }
                }
            }

            if config.loop_playback {
                log::debug!("Replay loop completed, restarting");
                assembler.reset();
            } else {
                log::debug!("Replay completed: {:?}", assembler.stats());
                break;
            }
        }
    }
}

impl Drop for StreamReplay {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

/// Read timestamped chunks from a capture file.
///
/// # Errors
///
/// Returns `ReplayError::FileOpen` if the file cannot be opened.
/// Returns `ReplayError::InvalidChunk` if a chunk is truncated or oversized.
pub fn read_chunks(path: &Path) -> Result<Vec<CapturedChunk>> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    let mut chunks = Vec::new();
    let mut offset = 0u64;

    loop {
        let mut timestamp_bytes = [0u8; 8];
        match file.read_exact(&mut timestamp_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(ReplayError::FileOpen(e)),
        }
        let timestamp_us = u64::from_le_bytes(timestamp_bytes);

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)
            .map_err(|_| ReplayError::InvalidChunk {
                offset,
                message: "unexpected EOF reading chunk length".to_string(),
            })?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_CHUNK_LEN {
            return Err(ReplayError::InvalidChunk {
                offset,
                message: format!("chunk length {} exceeds 1MB limit", len),
            });
        }

        let mut data = vec![0u8; len];
        file.read_exact(&mut data)
            .map_err(|_| ReplayError::InvalidChunk {
                offset,
                message: format!("unexpected EOF reading {} bytes of data", len),
            })?;

        chunks.push(CapturedChunk { timestamp_us, data });
        offset += 8 + 4 + len as u64;
    }

    Ok(chunks)
}

/// Create a frame assembler from configuration and metadata.
fn create_assembler(config: &ReplayConfig, metadata: Option<&CaptureMetadata>) -> FrameAssembler {
    let (width, height) = config
        .geometry
        .or_else(|| {
            metadata
                .filter(|m| m.width > 0 && m.height > 0)
                .map(|m| (m.width, m.height))
        })
        .unwrap_or(DEFAULT_GEOMETRY);

    FrameAssembler::new(width, height)
        .with_expansion(config.expansion)
        .with_validation(config.validation)
}

/// Synchronous replay for simple use cases.
///
/// Replays all chunks without timing and returns all assembled frames.
///
/// # Errors
///
/// Returns `ReplayError` if the file cannot be loaded or contains invalid data.
pub fn replay_all_frames(path: &Path) -> Result<Vec<ImageFrame>> {
    Ok(FrameIterator::new(path)?.collect())
}

/// Replay chunks and return frames via an iterator.
///
/// This is a lazy iterator that processes chunks on demand.
pub struct FrameIterator {
    chunks: std::vec::IntoIter<CapturedChunk>,
    pending: std::collections::VecDeque<ImageFrame>,
    assembler: FrameAssembler,
}

impl FrameIterator {
    /// Create a new frame iterator from a capture file.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError` if the file cannot be loaded.
    pub fn new(path: &Path) -> Result<Self> {
        Self::with_config(path, ReplayConfig::default())
    }

    /// Create with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or contains invalid chunk data.
    pub fn with_config(path: &Path, config: ReplayConfig) -> Result<Self> {
        let chunks = read_chunks(path)?;
        let metadata = StreamReplay::try_load_metadata(path);
        let assembler = create_assembler(&config, metadata.as_ref());

        Ok(Self {
            chunks: chunks.into_iter(),
            pending: std::collections::VecDeque::new(),
            assembler,
        })
    }

    /// Assembler counters so far
    pub fn stats(&self) -> crate::frame_assembler::AssemblerStats {
        self.assembler.stats()
    }
}

impl Iterator for FrameIterator {
    type Item = ImageFrame;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(frame);
            }
            let chunk = self.chunks.next()?;
            self.assembler.push(&chunk.data);
            loop {
                match self.assembler.process_next() {
                    ProcessResult::Accumulating => break,
                    ProcessResult::Frame(frame) => self.pending.push_back(frame),
                    ProcessResult::Progressed | ProcessResult::Skipped => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::write_chunks;
    use crate::test_utils::{Rgb, StreamGenerator};
    use std::io::Write;
    use tempfile::{tempdir, TempDir};

    /// Create a test capture file from chunks.
    fn create_test_capture(chunks: &[CapturedChunk]) -> (TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test_capture.bin");
        write_chunks(&path, chunks).unwrap();
        (dir, path)
    }

    /// Split a stream into chunks 1 ms apart.
    fn timed_chunks(stream: &[u8], size: usize) -> Vec<CapturedChunk> {
        StreamGenerator::chunked(stream, size)
            .into_iter()
            .enumerate()
            .map(|(i, data)| CapturedChunk {
                timestamp_us: i as u64 * 1000,
                data,
            })
            .collect()
    }

    fn small_config() -> ReplayConfig {
        ReplayConfig {
            speed: 0.0,
            geometry: Some((8, 4)),
            ..Default::default()
        }
    }

    #[test]
    fn test_load_empty_capture() {
        let (_dir, path) = create_test_capture(&[]);
        let replay = StreamReplay::load(&path).unwrap();
        assert_eq!(replay.chunk_count(), 0);
        assert_eq!(replay.duration_ms(), 0);
        assert!(replay.metadata().is_none());
    }

    #[test]
    fn test_load_multiple_chunks() {
        let chunks = vec![
            CapturedChunk {
                timestamp_us: 0,
                data: vec![0x11, 0x22],
            },
            CapturedChunk {
                timestamp_us: 16667,
                data: vec![0x33],
            },
            CapturedChunk {
                timestamp_us: 33333,
                data: vec![0x55, 0x66, 0x77],
            },
        ];

        let (_dir, path) = create_test_capture(&chunks);
        let replay = StreamReplay::load(&path).unwrap();

        assert_eq!(replay.chunk_count(), 3);
        assert_eq!(replay.duration_ms(), 33);
        assert_eq!(replay.chunks, chunks);
    }

    #[test]
    fn test_replay_config_default() {
        let config = ReplayConfig::default();
        assert!((config.speed - 1.0).abs() < f64::EPSILON);
        assert!(!config.loop_playback);
        assert_eq!(config.geometry, None);
        assert_eq!(config.validation, ValidationLevel::Strict);
    }

    #[test]
    fn test_replay_all_frames_empty() {
        let (_dir, path) = create_test_capture(&[]);
        assert!(replay_all_frames(&path).unwrap().is_empty());
    }

    #[test]
    fn test_threaded_replay() {
        let mut gen = StreamGenerator::new(8, 4);
        let mut stream = gen.garbage(30);
        stream.extend(gen.solid_frame(Rgb::RED));
        stream.extend(gen.solid_frame(Rgb::GREEN));

        let (_dir, path) = create_test_capture(&timed_chunks(&stream, 17));
        let mut replay = StreamReplay::load_with_config(&path, small_config()).unwrap();
        let receiver = replay.start().unwrap();

        let mut frames = Vec::new();
        while let Ok(frame) = receiver.recv_timeout(Duration::from_millis(500)) {
            frames.push(frame);
        }
        replay.stop().unwrap();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].image.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(frames[1].image.get_pixel(0, 0).0, [0, 255, 0]);
    }

    #[test]
    fn test_frame_iterator_multiple_frames_in_one_chunk() {
        let mut gen = StreamGenerator::new(8, 4);
        let mut stream = Vec::new();
        for _ in 0..3 {
            stream.extend(gen.solid_frame(Rgb::BLUE));
        }

        let (_dir, path) = create_test_capture(&timed_chunks(&stream, stream.len()));
        let frames: Vec<_> = FrameIterator::with_config(&path, small_config())
            .unwrap()
            .collect();

        assert_eq!(frames.len(), 3);
        let numbers: Vec<u32> = frames.iter().map(|f| f.record.frame_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn test_geometry_from_metadata() {
        let mut gen = StreamGenerator::new(4, 2);
        let stream = gen.solid_frame(Rgb::WHITE);
        let (dir, path) = create_test_capture(&timed_chunks(&stream, 10));

        let metadata = CaptureMetadata {
            width: 4,
            height: 2,
            ..Default::default()
        };
        std::fs::write(
            dir.path().join("test_capture.json"),
            serde_json::to_string(&metadata).unwrap(),
        )
        .unwrap();

        let replay = StreamReplay::load(&path).unwrap();
        assert_eq!(replay.metadata().map(|m| m.width), Some(4));

        let frames = replay_all_frames(&path).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].image.width(), 4);
    }

    #[test]
    fn test_create_assembler_defaults() {
        let assembler = create_assembler(&ReplayConfig::default(), None);
        assert_eq!(assembler.geometry(), (160, 120));

        let meta = CaptureMetadata {
            width: 0,
            height: 0,
            ..Default::default()
        };
        let assembler = create_assembler(&ReplayConfig::default(), Some(&meta));
        assert_eq!(assembler.geometry(), (160, 120));
    }

    #[test]
    fn test_already_running_error() {
        let (_dir, path) = create_test_capture(&[]);
        let mut replay = StreamReplay::load(&path).unwrap();

        let _rx = replay.start().unwrap();
        let result = replay.start();
        assert!(matches!(result, Err(ReplayError::AlreadyRunning)));

        replay.stop().unwrap();
    }

    #[test]
    fn test_not_running_error() {
        let (_dir, path) = create_test_capture(&[]);
        let mut replay = StreamReplay::load(&path).unwrap();
        assert!(matches!(replay.stop(), Err(ReplayError::NotRunning)));
    }

    #[test]
    fn test_drop_stops_replay() {
        let chunks = vec![CapturedChunk {
            timestamp_us: 60_000_000,
            data: vec![0],
        }];
        let (_dir, path) = create_test_capture(&chunks);
        let mut replay = StreamReplay::load(&path).unwrap();

        let _rx = replay.start().unwrap();
        assert!(replay.is_running());

        // The thread is sleeping towards a chunk a minute away; drop must
        // interrupt it rather than hang
        drop(replay);
    }

    #[test]
    fn test_invalid_chunk_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad_capture.bin");

        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&0u64.to_le_bytes()).unwrap();
        file.write_all(&(2 * 1024 * 1024u32).to_le_bytes()).unwrap();

        let result = StreamReplay::load(&path);
        assert!(matches!(
            result,
            Err(ReplayError::InvalidChunk { message, .. }) if message.contains("exceeds")
        ));
    }

    #[test]
    fn test_truncated_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("truncated.bin");

        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&0u64.to_le_bytes()).unwrap();
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(&[0x81]).unwrap();

        let result = StreamReplay::load(&path);
        assert!(matches!(result, Err(ReplayError::InvalidChunk { offset: 0, .. })));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let result = StreamReplay::load(&dir.path().join("nope.bin"));
        assert!(matches!(result, Err(ReplayError::FileOpen(_))));
    }
}
