//! Driving the assembler from a byte source
//!
//! Two scheduling models, same contract:
//!
//! - [`IngestWorker`]: a dedicated thread blocks on reads, assembles frames
//!   and publishes every completed frame to a [`LatestFrame`] slot.
//! - [`PollingIngest`]: a single-threaded loop drains whatever bytes are
//!   available each tick and surfaces at most the newest frame.
//!
//! In both, the only fatal condition is the source failing
//! ([`StreamError::Unavailable`]). Short reads, `WouldBlock` and timeouts
//! just mean "no data yet".
//!
//! A blocking read cannot be interrupted from outside. Stopping an
//! [`IngestWorker`] sets its flag and the thread exits after the current
//! read returns; closing the underlying source makes that immediate.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

use crate::capture::CaptureState;
use crate::frame_assembler::{AssemblerStats, FrameAssembler};
use crate::image_frame::ImageFrame;
use crate::replay::MAX_CHUNK_LEN;
use crate::LatestFrame;

/// Default read size
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Back-off after a read reports no data
const IDLE_BACKOFF: Duration = Duration::from_millis(2);

/// Errors surfaced by the ingest paths
#[derive(Error, Debug)]
pub enum StreamError {
    /// The byte source failed; the pipeline cannot continue.
    #[error("stream source unavailable: {0}")]
    Unavailable(#[from] io::Error),

    /// The ingest thread panicked.
    #[error("ingest thread panicked")]
    WorkerPanicked,
}

/// Knobs shared by both ingest models
#[derive(Clone, Default)]
pub struct IngestOptions {
    /// Bytes requested per read (0 = [`DEFAULT_CHUNK_SIZE`], capped at
    /// [`MAX_CHUNK_LEN`])
    pub chunk_size: usize,
    /// Publish frames rotated by 180 degrees
    pub rotate_180: bool,
    /// Record every read into this capture, if active
    pub capture: Option<Arc<CaptureState>>,
}

impl IngestOptions {
    fn chunk_size(&self) -> usize {
        if self.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            self.chunk_size.min(MAX_CHUNK_LEN)
        }
    }

    fn finish(&self, frame: ImageFrame) -> ImageFrame {
        if let Some(capture) = &self.capture {
            capture.record_frame();
        }
        if self.rotate_180 {
            frame.rotated_180()
        } else {
            frame
        }
    }
}

/// Outcome of one read
enum ReadOutcome {
    Data(usize),
    NoData,
    Eof,
}

fn read_some<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<ReadOutcome, StreamError> {
    match source.read(buf) {
        Ok(0) => Ok(ReadOutcome::Eof),
        Ok(n) => Ok(ReadOutcome::Data(n)),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ) =>
        {
            Ok(ReadOutcome::NoData)
        }
        Err(e) => Err(StreamError::Unavailable(e)),
    }
}

/// Dedicated ingest thread publishing into a [`LatestFrame`]
pub struct IngestWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<AssemblerStats, StreamError>>>,
}

impl IngestWorker {
    /// Spawn the ingest thread
    ///
    /// The thread runs until the source reaches EOF, fails, or
    /// [`stop`](Self::stop) is requested.
    pub fn spawn<R>(
        source: R,
        assembler: FrameAssembler,
        slot: Arc<LatestFrame>,
        options: IngestOptions,
    ) -> Self
    where
        R: Read + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            Self::ingest_thread(source, assembler, &slot, &options, &thread_stop)
        });

        log::info!("Ingest thread started");
        Self {
            stop,
            handle: Some(handle),
        }
    }

    fn ingest_thread<R: Read>(
        mut source: R,
        mut assembler: FrameAssembler,
        slot: &LatestFrame,
        options: &IngestOptions,
        stop: &AtomicBool,
    ) -> Result<AssemblerStats, StreamError> {
        let mut buf = vec![0u8; options.chunk_size()];

        while !stop.load(Ordering::Acquire) {
            let n = match read_some(&mut source, &mut buf) {
                Ok(ReadOutcome::Data(n)) => n,
                Ok(ReadOutcome::NoData) => {
                    thread::sleep(IDLE_BACKOFF);
                    continue;
                }
                Ok(ReadOutcome::Eof) => {
                    log::info!("Stream source reached EOF");
                    break;
                }
                Err(e) => {
                    log::error!("{}", e);
                    return Err(e);
                }
            };

            if let Some(capture) = &options.capture {
                capture.record_chunk(&buf[..n]);
            }
            for frame in assembler.ingest(&buf[..n]) {
                slot.publish(options.finish(frame));
            }
        }

        let stats = assembler.stats();
        log::info!(
            "Ingest finished: {} frames, {} bytes discarded, {} malformed, {} truncated",
            stats.frames_emitted,
            stats.bytes_discarded,
            stats.malformed_records,
            stats.truncated_frames
        );
        Ok(stats)
    }

    /// Whether the thread has exited
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Request a stop and wait for the thread
    ///
    /// # Errors
    ///
    /// Returns the source error if the stream failed, or
    /// `StreamError::WorkerPanicked`.
    pub fn stop(mut self) -> Result<AssemblerStats, StreamError> {
        self.stop.store(true, Ordering::Release);
        self.join_inner()
    }

    /// Wait for the thread to finish on its own (EOF or failure)
    ///
    /// # Errors
    ///
    /// Same as [`stop`](Self::stop).
    pub fn join(mut self) -> Result<AssemblerStats, StreamError> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<AssemblerStats, StreamError> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| StreamError::WorkerPanicked)?,
            None => Ok(AssemblerStats::default()),
        }
    }
}

impl Drop for IngestWorker {
    fn drop(&mut self) {
        // Don't join: the thread may be parked in a blocking read
        self.stop.store(true, Ordering::Release);
    }
}

/// Single-threaded, tick-driven ingest
pub struct PollingIngest<R> {
    source: R,
    assembler: FrameAssembler,
    options: IngestOptions,
    buf: Vec<u8>,
    eof: bool,
}

impl<R: Read> PollingIngest<R> {
    /// Wrap a source and an assembler
    pub fn new(source: R, assembler: FrameAssembler, options: IngestOptions) -> Self {
        let buf = vec![0u8; options.chunk_size()];
        Self {
            source,
            assembler,
            options,
            buf,
            eof: false,
        }
    }

    /// Whether the source has reported EOF
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Assembler counters so far
    pub fn stats(&self) -> AssemblerStats {
        self.assembler.stats()
    }

    /// Drain the bytes available now and return the newest completed frame
    ///
    /// Reads until the source reports no data, EOF, or a short read. Older
    /// frames completed in the same tick are dropped.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Unavailable` if the source fails.
    pub fn poll(&mut self) -> Result<Option<ImageFrame>, StreamError> {
        let mut newest = None;

        while !self.eof {
            let n = match read_some(&mut self.source, &mut self.buf)? {
                ReadOutcome::Data(n) => n,
                ReadOutcome::NoData => break,
                ReadOutcome::Eof => {
                    log::info!("Stream source reached EOF");
                    self.eof = true;
                    break;
                }
            };

            if let Some(capture) = &self.options.capture {
                capture.record_chunk(&self.buf[..n]);
            }
            if let Some(frame) = self.assembler.ingest(&self.buf[..n]).pop() {
                newest = Some(frame);
            }
            if n < self.buf.len() {
                break;
            }
        }

        Ok(newest.map(|frame| self.options.finish(frame)))
    }

    /// Poll every `interval` until EOF or `stop` is set, publishing into `slot`
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Unavailable` if the source fails.
    pub fn run(
        &mut self,
        slot: &LatestFrame,
        interval: Duration,
        stop: &AtomicBool,
    ) -> Result<AssemblerStats, StreamError> {
        while !stop.load(Ordering::Acquire) {
            if let Some(frame) = self.poll()? {
                slot.publish(frame);
            }
            if self.eof {
                break;
            }
            thread::sleep(interval);
        }
        Ok(self.assembler.stats())
    }
}
