//! Raw stream capture for offline debugging.
//!
//! Records the serial byte stream exactly as it was read, chunk by chunk,
//! with arrival timestamps. A capture can be replayed through the
//! [`FrameAssembler`](crate::frame_assembler::FrameAssembler) later with
//! [`replay`](crate::replay), reproducing resynchronisation behaviour byte
//! for byte.
//!
//! # File Format
//!
//! Two files per capture, sharing a base name:
//! - `capture_<ms>.bin`: Sequence of `[u64 LE: timestamp_us][u32 LE: length][bytes: data]...`
//! - `capture_<ms>.json`: Geometry and capture totals
//!
//! `<ms>` is the Unix time in milliseconds. Existing files are never
//! overwritten: a capture whose name is taken gets a `_<n>` suffix.
//!
//! # Example
//!
//! ```ignore
//! let capture = CaptureState::new();
//! capture.start_capture(CaptureMetadata {
//!     width: 160,
//!     height: 120,
//!     ..Default::default()
//! })?;
//!
//! // In the read loop:
//! capture.record_chunk(&bytes);
//!
//! // When done:
//! let result = capture.stop_capture(Path::new("/output"))?;
//! ```

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors that can occur during capture operations.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Capture is not currently active when trying to stop.
    #[error("capture is not active")]
    NotActive,

    /// Capture is already active when trying to start.
    #[error("capture is already active")]
    AlreadyActive,

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Output directory does not exist.
    #[error("output directory does not exist: {0}")]
    DirectoryNotFound(String),
}

/// Result type alias for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Metadata about the capture session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// Frame width in pixels.
    pub width: u16,
    /// Frame height in pixels.
    pub height: u16,
    /// Total number of read chunks captured.
    #[serde(default)]
    pub total_chunks: u64,
    /// Total number of complete frames assembled while capturing.
    #[serde(default)]
    pub total_frames: u64,
    /// Capture duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Total bytes captured.
    #[serde(default)]
    pub total_bytes: u64,
    /// Optional description or notes about the capture.
    #[serde(default)]
    pub description: String,
}

/// One read from the stream source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedChunk {
    /// Timestamp relative to capture start (microseconds).
    pub timestamp_us: u64,
    /// Raw bytes as read.
    pub data: Vec<u8>,
}

/// Result returned when capture stops successfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResult {
    /// Path to the saved `.bin` file.
    pub chunks_path: PathBuf,
    /// Path to the saved `.json` file.
    pub metadata_path: PathBuf,
    /// Summary of the capture session.
    pub metadata: CaptureMetadata,
}

/// Thread-safe state for recording stream chunks.
///
/// The reader thread records while another thread may start or stop the
/// capture; the "not capturing" check is a single atomic load.
pub struct CaptureState {
    /// Whether capture is currently active.
    is_capturing: AtomicBool,
    /// Captured chunks.
    chunks: Mutex<Vec<CapturedChunk>>,
    /// When the capture started.
    start_time: Mutex<Option<Instant>>,
    /// Metadata about the capture session.
    metadata: Mutex<CaptureMetadata>,
    /// Chunk counter (lock-free).
    chunk_count: AtomicU64,
    /// Byte counter (lock-free).
    byte_count: AtomicU64,
}

impl CaptureState {
    /// Creates a new capture state with no active capture.
    #[must_use]
    pub fn new() -> Self {
        Self {
            is_capturing: AtomicBool::new(false),
            chunks: Mutex::new(Vec::new()),
            start_time: Mutex::new(None),
            metadata: Mutex::new(CaptureMetadata::default()),
            chunk_count: AtomicU64::new(0),
            byte_count: AtomicU64::new(0),
        }
    }

    /// Returns whether capture is currently active.
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.is_capturing.load(Ordering::Acquire)
    }

    /// Returns the current chunk count (thread-safe, lock-free).
    #[must_use]
    pub fn chunk_count(&self) -> u64 {
        self.chunk_count.load(Ordering::Relaxed)
    }

    /// Returns the current byte count (thread-safe, lock-free).
    #[must_use]
    pub fn byte_count(&self) -> u64 {
        self.byte_count.load(Ordering::Relaxed)
    }

    /// Starts a new capture session.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::AlreadyActive` if a capture is already in progress.
    pub fn start_capture(&self, metadata: CaptureMetadata) -> Result<()> {
        if self
            .is_capturing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::AlreadyActive);
        }

        lock(&self.chunks).clear();
        self.chunk_count.store(0, Ordering::Release);
        self.byte_count.store(0, Ordering::Release);
        *lock(&self.start_time) = Some(Instant::now());
        *lock(&self.metadata) = metadata;

        log::info!("Stream capture started");
        Ok(())
    }

    /// Records one read from the stream.
    ///
    /// If capture is not active, the chunk is silently ignored. Empty reads
    /// are not recorded.
    pub fn record_chunk(&self, data: &[u8]) {
        if data.is_empty() || !self.is_capturing.load(Ordering::Acquire) {
            return;
        }

        let timestamp_us = lock(&self.start_time)
            .map(|t| t.elapsed().as_micros() as u64)
            .unwrap_or(0);

        self.chunk_count.fetch_add(1, Ordering::Relaxed);
        self.byte_count
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        lock(&self.chunks).push(CapturedChunk {
            timestamp_us,
            data: data.to_vec(),
        });
    }

    /// Increments the frame counter in metadata.
    ///
    /// Call this when a complete frame has been assembled.
    pub fn record_frame(&self) {
        if !self.is_capturing.load(Ordering::Acquire) {
            return;
        }
        lock(&self.metadata).total_frames += 1;
    }

    /// Stops the capture and saves data to disk.
    ///
    /// # Arguments
    ///
    /// * `output_dir` - Directory where the `.bin` and `.json` files will be saved.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::NotActive` if no capture is in progress.
    /// Returns `CaptureError::DirectoryNotFound` if the output directory doesn't exist.
    /// Returns `CaptureError::Io` if file operations fail.
    /// Returns `CaptureError::Json` if metadata serialization fails.
    pub fn stop_capture(&self, output_dir: &Path) -> Result<CaptureResult> {
        if self
            .is_capturing
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::NotActive);
        }

        if !output_dir.is_dir() {
            return Err(CaptureError::DirectoryNotFound(
                output_dir.display().to_string(),
            ));
        }

        let duration_ms = lock(&self.start_time)
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        let metadata = {
            let mut meta = lock(&self.metadata);
            meta.duration_ms = duration_ms;
            meta.total_chunks = self.chunk_count.load(Ordering::Acquire);
            meta.total_bytes = self.byte_count.load(Ordering::Acquire);
            meta.clone()
        };

        let chunks = std::mem::take(&mut *lock(&self.chunks));
        let result = write_capture_files(output_dir, &chunks, metadata)?;

        log::info!(
            "Capture stopped: {} chunks, {} bytes, {} frames, {} ms",
            result.metadata.total_chunks,
            result.metadata.total_bytes,
            result.metadata.total_frames,
            duration_ms
        );
        Ok(result)
    }
}

impl Default for CaptureState {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| {
        log::warn!("Capture lock poisoned, recovering");
        e.into_inner()
    })
}

/// Write chunks and metadata as `capture_<ms>.{bin,json}` in `dir`.
///
/// # Errors
///
/// Returns `CaptureError::Io` or `CaptureError::Json` if writing fails.
pub fn write_capture_files(
    dir: &Path,
    chunks: &[CapturedChunk],
    metadata: CaptureMetadata,
) -> Result<CaptureResult> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);

    let (chunks_path, chunks_file, metadata_file) = create_capture_files(dir, millis)?;
    write_chunk_records(chunks_file, chunks)?;
    log::debug!("Saved {} chunks to {}", chunks.len(), chunks_path.display());

    let metadata_path = metadata_path_for(&chunks_path);
    let mut writer = BufWriter::new(metadata_file);
    serde_json::to_writer_pretty(&mut writer, &metadata)?;
    writer.flush()?;
    log::debug!("Saved metadata to {}", metadata_path.display());

    Ok(CaptureResult {
        chunks_path,
        metadata_path,
        metadata,
    })
}

/// Claim a fresh `.bin`/`.json` pair named after `millis`
///
/// Both files are created with `create_new`, so a pair left by an earlier
/// capture in the same millisecond pushes this one to the next suffix.
fn create_capture_files(dir: &Path, millis: u128) -> Result<(PathBuf, File, File)> {
    for attempt in 0u32.. {
        let stem = match attempt {
            0 => format!("capture_{}", millis),
            n => format!("capture_{}_{}", millis, n),
        };
        let chunks_path = dir.join(format!("{}.bin", stem));
        let chunks_file = match create_new(&chunks_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        };
        match create_new(&metadata_path_for(&chunks_path)) {
            Ok(metadata_file) => return Ok((chunks_path, chunks_file, metadata_file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // A stray .json still holds this name
                drop(chunks_file);
                std::fs::remove_file(&chunks_path)?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(CaptureError::Io(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "no free capture file name",
    )))
}

fn create_new(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// Writes chunks to a binary file.
///
/// Format: `[u64 LE: timestamp_us][u32 LE: length][bytes: data]...`
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be written.
pub fn write_chunks(path: &Path, chunks: &[CapturedChunk]) -> Result<()> {
    write_chunk_records(File::create(path)?, chunks)?;
    log::debug!("Saved {} chunks to {}", chunks.len(), path.display());
    Ok(())
}

fn write_chunk_records(file: File, chunks: &[CapturedChunk]) -> io::Result<()> {
    let mut file = BufWriter::new(file);
    for chunk in chunks {
        file.write_all(&chunk.timestamp_us.to_le_bytes())?;
        file.write_all(&(chunk.data.len() as u32).to_le_bytes())?;
        file.write_all(&chunk.data)?;
    }
    file.flush()
}

/// Companion metadata path for a `.bin` capture file.
pub fn metadata_path_for(chunks_path: &Path) -> PathBuf {
    chunks_path.with_extension("json")
}

/// Reads capture metadata from a JSON file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be read.
/// Returns `CaptureError::Json` if the JSON is invalid.
pub fn read_metadata(path: &Path) -> Result<CaptureMetadata> {
    let json = std::fs::read_to_string(path)?;
    let metadata: CaptureMetadata = serde_json::from_str(&json)?;
    Ok(metadata)
}
