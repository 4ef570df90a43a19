//! viz-scope - Decode frames and detection telemetry from a VIZ camera stream.
//!
//! Reads raw serial bytes (a device path, a dump file or stdin) or a
//! `capture_*.bin` recording, logs each frame's detection telemetry and can
//! write the last frame and one of its color masks as PPM images.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use viz_scope_lib::capture::{CaptureMetadata, CaptureState};
use viz_scope_lib::color_analysis::ColorAnalyzer;
use viz_scope_lib::config::PipelineConfig;
use viz_scope_lib::control::ControlCommand;
use viz_scope_lib::frame_assembler::AssemblerStats;
use viz_scope_lib::image_frame::{save_ppm, ImageFrame};
use viz_scope_lib::ingest::{IngestWorker, PollingIngest};
use viz_scope_lib::record_validation::ValidationLevel;
use viz_scope_lib::replay::{FrameIterator, ReplayConfig};
use viz_scope_lib::LatestFrame;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Decode VIZ camera frames and detection telemetry from a serial byte stream"
)]
struct Args {
    /// Raw stream to read (serial device or dump file). Reads stdin if omitted.
    #[arg(long, env = "VIZSCOPE_INPUT", conflicts_with = "replay")]
    input: Option<PathBuf>,

    /// Replay a capture_*.bin recording instead of a raw stream.
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Pipeline config file (JSON).
    #[arg(long, env = "VIZSCOPE_CONFIG")]
    config: Option<PathBuf>,

    /// Record validation level: strict, moderate or off.
    #[arg(long, env = "VIZSCOPE_RECORD_VALIDATION")]
    validation: Option<String>,

    /// Override the configured frame width.
    #[arg(long)]
    width: Option<u16>,

    /// Override the configured frame height.
    #[arg(long)]
    height: Option<u16>,

    /// Rotate frames by 180 degrees (camera mounted upside down).
    #[arg(long)]
    rotate_180: bool,

    /// Drive ingest from a polling loop instead of a dedicated reader thread.
    #[arg(long)]
    polling: bool,

    /// Write the last frame as a binary PPM.
    #[arg(long)]
    frame_out: Option<PathBuf>,

    /// Write the last frame's mask for --mask-band as a binary PPM.
    #[arg(long)]
    mask_out: Option<PathBuf>,

    /// Band written by --mask-out.
    #[arg(long, default_value = "yellow")]
    mask_band: String,

    /// Control command to send before reading: snap, auto or stop.
    #[arg(long, requires = "control")]
    command: Option<ControlCommand>,

    /// Writable path the control command is sent to (usually the serial device).
    #[arg(long, env = "VIZSCOPE_CONTROL")]
    control: Option<PathBuf>,

    /// Record the raw stream into this directory while reading.
    #[arg(long, conflicts_with = "replay")]
    capture_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    viz_scope_lib::init_logging();
    let args = Args::parse();

    let config = load_config(&args)?;
    let analyzer = config.analyzer();

    if let Some(command) = args.command {
        send_command(command, args.control.as_deref())?;
    }

    let last = if let Some(replay) = args.replay.as_deref() {
        run_replay(replay, &config, &analyzer)?
    } else {
        run_stream(&args, &config, &analyzer)?
    };

    let Some(frame) = last else {
        log::warn!("No frames decoded");
        return Ok(());
    };

    if let Some(path) = args.frame_out.as_deref() {
        save_ppm(&frame.image, path)
            .with_context(|| format!("failed to write frame to {}", path.display()))?;
        log::info!("Wrote frame #{} to {}", frame.sequence, path.display());
    }

    if let Some(path) = args.mask_out.as_deref() {
        let band = analyzer
            .bands()
            .iter()
            .find(|b| b.name == args.mask_band)
            .with_context(|| format!("no color band named '{}'", args.mask_band))?;
        let mask = analyzer.mask(&frame.image, &band.band);
        save_ppm(&mask.to_rgb_image(), path)
            .with_context(|| format!("failed to write mask to {}", path.display()))?;
        log::info!(
            "Wrote {} mask ({:.1}% coverage) to {}",
            band.name,
            mask.coverage() * 100.0,
            path.display()
        );
    }

    Ok(())
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let validation = args.validation.as_deref().map(ValidationLevel::from_env_str);
    let mut config = PipelineConfig::resolve(args.config.as_deref(), validation)
        .context("failed to load pipeline config")?;

    if let Some(width) = args.width {
        config.width = width;
    }
    if let Some(height) = args.height {
        config.height = height;
    }
    if config.width == 0 || config.height == 0 {
        bail!("frame geometry {}x{} must be non-zero", config.width, config.height);
    }
    config.rotate_180 |= args.rotate_180;

    log::info!(
        "Pipeline: {}x{}, {:?} expansion, {:?} validation, {} band(s)",
        config.width,
        config.height,
        config.expansion,
        config.validation,
        config.bands.len()
    );
    Ok(config)
}

fn send_command(command: ControlCommand, control: Option<&Path>) -> Result<()> {
    let Some(path) = control else {
        bail!("--command requires --control");
    };
    let mut sink = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open control path {}", path.display()))?;
    command
        .send(&mut sink)
        .with_context(|| format!("failed to send {} to {}", command, path.display()))?;
    log::info!("Sent {} to {}", command, path.display());
    Ok(())
}

fn run_replay(
    path: &Path,
    config: &PipelineConfig,
    analyzer: &ColorAnalyzer,
) -> Result<Option<Arc<ImageFrame>>> {
    let replay_config = ReplayConfig {
        speed: 0.0,
        geometry: Some((config.width, config.height)),
        expansion: config.expansion,
        validation: config.validation,
        ..Default::default()
    };
    let mut frames = FrameIterator::with_config(path, replay_config)
        .with_context(|| format!("failed to load capture {}", path.display()))?;

    let mut last = None;
    for frame in frames.by_ref() {
        let frame = if config.rotate_180 {
            frame.rotated_180()
        } else {
            frame
        };
        report_frame(&frame, analyzer);
        last = Some(Arc::new(frame));
    }
    log_stats(&frames.stats());
    Ok(last)
}

fn run_stream(
    args: &Args,
    config: &PipelineConfig,
    analyzer: &ColorAnalyzer,
) -> Result<Option<Arc<ImageFrame>>> {
    let (source, source_name): (Box<dyn Read + Send>, String) = match args.input.as_deref() {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open stream source {}", path.display()))?;
            (Box::new(file), path.display().to_string())
        }
        None => (Box::new(io::stdin()), "stdin".to_string()),
    };
    log::info!("Reading stream from {}", source_name);

    let capture = match args.capture_dir.as_deref() {
        Some(dir) => {
            let state = Arc::new(CaptureState::new());
            state
                .start_capture(CaptureMetadata {
                    width: config.width,
                    height: config.height,
                    description: format!("viz-scope capture from {}", source_name),
                    ..Default::default()
                })
                .context("failed to start capture")?;
            Some((state, dir))
        }
        None => None,
    };

    let mut options = config.ingest_options();
    options.capture = capture.as_ref().map(|(state, _)| Arc::clone(state));

    let slot = Arc::new(LatestFrame::new());
    let stats = if args.polling {
        let mut ingest = PollingIngest::new(source, config.build_assembler(), options);
        while !ingest.is_eof() {
            if let Some(frame) = ingest.poll().context("stream failed")? {
                report_frame(&frame, analyzer);
                slot.publish(frame);
            }
            if !ingest.is_eof() {
                thread::sleep(config.poll_interval());
            }
        }
        ingest.stats()
    } else {
        let worker = IngestWorker::spawn(
            source,
            config.build_assembler(),
            Arc::clone(&slot),
            options,
        );
        while !worker.is_finished() {
            if let Some(frame) = slot.take_updated() {
                report_frame(&frame, analyzer);
            }
            thread::sleep(config.poll_interval());
        }
        if let Some(frame) = slot.take_updated() {
            report_frame(&frame, analyzer);
        }
        worker.join().context("stream failed")?
    };
    log_stats(&stats);

    if let Some((state, dir)) = capture {
        let saved = state
            .stop_capture(dir)
            .with_context(|| format!("failed to save capture to {}", dir.display()))?;
        log::info!(
            "Saved {} chunks ({} frames) to {}",
            saved.metadata.total_chunks,
            saved.metadata.total_frames,
            saved.chunks_path.display()
        );
    }

    Ok(slot.latest())
}

fn report_frame(frame: &ImageFrame, analyzer: &ColorAnalyzer) {
    let record = &frame.record;
    let yellow = match record.yellow_target() {
        Some(target) => format!(
            "({}, {}) area {} {}",
            target.centroid_x,
            target.centroid_y,
            target.area,
            target
                .direction()
                .map_or_else(|| "-".to_string(), |d| d.to_string())
        ),
        None => "none".to_string(),
    };
    log::info!(
        "Frame #{} (device #{}, {} ms): yellow {}, pink {}",
        frame.sequence,
        record.frame_number,
        record.process_ms,
        yellow,
        record.pink_targets().len()
    );

    if log::log_enabled!(log::Level::Debug) {
        for (name, mask) in analyzer.analyze(&frame.image) {
            log::debug!("  {} mask: {:.1}% coverage", name, mask.coverage() * 100.0);
        }
    }
}

fn log_stats(stats: &AssemblerStats) {
    log::info!(
        "Decoded {} frames from {} bytes ({} discarded, {} malformed records, {} truncated frames)",
        stats.frames_emitted,
        stats.bytes_received,
        stats.bytes_discarded,
        stats.malformed_records,
        stats.truncated_frames
    );
}
