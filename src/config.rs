//! Pipeline configuration
//!
//! Everything is optional: a missing file, or a file that names only a few
//! fields, falls back to the defaults for the standard 160x120 stream.
//!
//! ```json
//! {
//!   "width": 160,
//!   "height": 120,
//!   "validation": "moderate",
//!   "bands": [{ "name": "yellow", "min_h": 15, "max_h": 40, "min_s": 80, "min_v": 80 }]
//! }
//! ```
//!
//! `VIZSCOPE_CONFIG` names the file; `VIZSCOPE_RECORD_VALIDATION` overrides
//! the validation level on top of it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::color_analysis::{default_bands, ColorAnalyzer, NamedBand};
use crate::frame_assembler::FrameAssembler;
use crate::ingest::{IngestOptions, DEFAULT_CHUNK_SIZE};
use crate::pixel_conversion::ChannelExpansion;
use crate::record_validation::ValidationLevel;
use crate::replay::MAX_CHUNK_LEN;

/// Environment variable naming the JSON config file
pub const CONFIG_ENV_VAR: &str = "VIZSCOPE_CONFIG";

/// Errors loading a configuration file
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Config file path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid config JSON
    #[error("failed to parse config {path}: {source}")]
    Json {
        /// Config file path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },

    /// Parsed, but unusable
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Decoder, analyzer and ingest settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frame width the decoder is initialised with
    pub width: u16,
    /// Frame height the decoder is initialised with
    pub height: u16,
    /// RGB565 channel widening
    pub expansion: ChannelExpansion,
    /// Record sanity checks
    pub validation: ValidationLevel,
    /// Bands masked for display
    pub bands: Vec<NamedBand>,
    /// Morphological close applied to every mask
    pub mask_close_kernel: Option<usize>,
    /// Camera mounted upside down
    pub rotate_180: bool,
    /// Tick interval for the polling ingest model
    pub poll_interval_ms: u64,
    /// Bytes requested per read
    pub read_chunk_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            width: 160,
            height: 120,
            expansion: ChannelExpansion::default(),
            validation: ValidationLevel::default(),
            bands: default_bands(),
            mask_close_kernel: None,
            rotate_180: false,
            poll_interval_ms: 30,
            read_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl PipelineConfig {
    /// Load a JSON config file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, names a
    /// zero frame geometry, or asks for reads larger than a capture chunk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        log::info!("Loaded pipeline config from {}", path.display());
        Ok(config)
    }

    /// Defaults or the given file, with an optional validation override
    ///
    /// # Errors
    ///
    /// Same as [`load`](Self::load).
    pub fn resolve(
        path: Option<&Path>,
        validation: Option<ValidationLevel>,
    ) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(level) = validation {
            log::debug!("Record validation overridden to {:?}", level);
            config.validation = level;
        }
        Ok(config)
    }

    /// Resolve from `VIZSCOPE_CONFIG` and `VIZSCOPE_RECORD_VALIDATION`
    ///
    /// # Errors
    ///
    /// Same as [`load`](Self::load).
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from);
        Self::resolve(path.as_deref(), ValidationLevel::from_env())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "frame geometry {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        if self.read_chunk_size > MAX_CHUNK_LEN {
            return Err(ConfigError::Invalid(format!(
                "read_chunk_size {} exceeds the {} byte capture chunk limit",
                self.read_chunk_size, MAX_CHUNK_LEN
            )));
        }
        if self.bands.is_empty() {
            log::warn!("Config defines no color bands; masks will be empty");
        }
        Ok(())
    }

    /// Assembler for the configured geometry, expansion and validation
    pub fn build_assembler(&self) -> FrameAssembler {
        FrameAssembler::new(self.width, self.height)
            .with_expansion(self.expansion)
            .with_validation(self.validation)
    }

    /// Analyzer over the configured bands
    pub fn analyzer(&self) -> ColorAnalyzer {
        ColorAnalyzer::new(self.bands.clone()).with_close_kernel(self.mask_close_kernel)
    }

    /// Ingest options without a capture hook
    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            chunk_size: self.read_chunk_size,
            rotate_180: self.rotate_180,
            capture: None,
        }
    }

    /// Polling tick as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color_analysis::HueBand;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(json: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!((config.width, config.height), (160, 120));
        assert_eq!(config.expansion, ChannelExpansion::Replicate);
        assert_eq!(config.validation, ValidationLevel::Strict);
        assert_eq!(config.bands, default_bands());
        assert_eq!(config.poll_interval(), Duration::from_millis(30));
        assert_eq!(config.read_chunk_size, 4096);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let file = write_config(r#"{ "validation": "moderate", "rotate_180": true }"#);
        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.validation, ValidationLevel::Moderate);
        assert!(config.rotate_180);
        assert_eq!(config.width, 160);
        assert_eq!(config.bands.len(), 2);
    }

    #[test]
    fn test_custom_bands() {
        let file = write_config(
            r#"{
                "width": 80, "height": 60, "expansion": "shift", "mask_close_kernel": 3,
                "bands": [{ "name": "red", "min_h": 170, "max_h": 10, "min_s": 100, "min_v": 60 }]
            }"#,
        );
        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.expansion, ChannelExpansion::Shift);
        assert_eq!(config.mask_close_kernel, Some(3));
        assert_eq!(config.bands.len(), 1);
        assert_eq!(config.bands[0].name, "red");
        assert!(config.bands[0].band.wraps_around());
        assert_eq!(config.bands[0].band, HueBand::new(170, 10, 100, 60));

        let assembler = config.build_assembler();
        assert_eq!(assembler.geometry(), (80, 60));
        assert_eq!(config.analyzer().bands().len(), 1);
    }

    #[test]
    fn test_missing_file() {
        let err = PipelineConfig::load(Path::new("/nonexistent/viz-scope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_bad_json() {
        let file = write_config(r#"{ "width": "wide" }"#);
        let err = PipelineConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Json { .. }));
    }

    #[test]
    fn test_zero_geometry_rejected() {
        let file = write_config(r#"{ "height": 0 }"#);
        let err = PipelineConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_oversized_read_chunk_rejected() {
        let file = write_config(&format!(r#"{{ "read_chunk_size": {} }}"#, MAX_CHUNK_LEN + 1));
        let err = PipelineConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("read_chunk_size")));

        let file = write_config(&format!(r#"{{ "read_chunk_size": {} }}"#, MAX_CHUNK_LEN));
        assert_eq!(PipelineConfig::load(file.path()).unwrap().read_chunk_size, MAX_CHUNK_LEN);
    }

    #[test]
    fn test_resolve_override() {
        let file = write_config(r#"{ "validation": "moderate" }"#);
        let config = PipelineConfig::resolve(Some(file.path()), Some(ValidationLevel::Off)).unwrap();
        assert_eq!(config.validation, ValidationLevel::Off);

        let config = PipelineConfig::resolve(None, None).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_ingest_options() {
        let config = PipelineConfig {
            read_chunk_size: 512,
            rotate_180: true,
            ..Default::default()
        };
        let options = config.ingest_options();
        assert_eq!(options.chunk_size, 512);
        assert!(options.rotate_180);
        assert!(options.capture.is_none());
    }
}
