//! Sanity checks for decoded detection records
//!
//! The record layout has no checksum, so a marker that turns up by accident
//! (inside log text or a truncated frame) decodes into garbage just as
//! happily as a real one. These checks catch the obvious cases:
//! - Secondary target count above two
//! - Presence flags other than 0/1
//! - Geometry that does not match the configured frame size
//!
//! Configurable via `VIZSCOPE_RECORD_VALIDATION` environment variable.

use serde::{Deserialize, Serialize};

use crate::detection_record::{DetectionRecord, MAX_PINK_TARGETS, RECORD_LEN};

/// Environment variable selecting the validation level
pub const VALIDATION_ENV_VAR: &str = "VIZSCOPE_RECORD_VALIDATION";

const YELLOW_FLAG_OFFSET: usize = 4;
const PINK_COUNT_OFFSET: usize = 13;
const PINK_FLAG_OFFSETS: [usize; MAX_PINK_TARGETS] = [14, 23];

/// Record validation strictness levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationLevel {
    /// Count + presence flags + geometry; resync trusts only markers with geometry
    #[default]
    Strict,
    /// Secondary target count only
    Moderate,
    /// No validation
    Off,
}

impl ValidationLevel {
    /// Parse from environment variable string
    pub fn from_env_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "strict" => Self::Strict,
            "moderate" => Self::Moderate,
            "off" | "none" | "disabled" => Self::Off,
            _ => {
                log::warn!("Unknown validation level '{}', defaulting to 'strict'", s);
                Self::Strict
            }
        }
    }

    /// Read [`VALIDATION_ENV_VAR`], if set
    pub fn from_env() -> Option<Self> {
        std::env::var(VALIDATION_ENV_VAR)
            .ok()
            .map(|value| Self::from_env_str(&value))
    }

    /// Whether a marker found while resynchronising must be followed by the
    /// configured geometry to count as a frame start
    pub fn checks_geometry(self) -> bool {
        self == Self::Strict
    }
}

/// Record validation result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    /// Whether the record passed validation
    pub valid: bool,
    /// Reason for validation failure (if any)
    pub failure_reason: Option<String>,
}

/// Validate a decoded record against the configured frame geometry
///
/// # Arguments
/// * `record` - Decoded record
/// * `width` - Configured frame width in pixels
/// * `height` - Configured frame height in pixels
/// * `level` - Validation strictness level
pub fn validate_record(
    record: &DetectionRecord,
    width: u32,
    height: u32,
    level: ValidationLevel,
) -> ValidationResult {
    if level == ValidationLevel::Off {
        return ValidationResult {
            valid: true,
            failure_reason: None,
        };
    }

    let mut failure_reasons = Vec::new();

    if usize::from(record.pink_count) > MAX_PINK_TARGETS {
        failure_reasons.push(format!(
            "pink_count {} exceeds {}",
            record.pink_count, MAX_PINK_TARGETS
        ));
    }

    let geometry_matches =
        u32::from(record.width) == width && u32::from(record.height) == height;
    if level == ValidationLevel::Strict && !geometry_matches {
        failure_reasons.push(format!(
            "geometry {}x{} does not match configured {}x{}",
            record.width, record.height, width, height
        ));
    }

    let valid = failure_reasons.is_empty();
    let failure_reason = if valid {
        None
    } else {
        Some(failure_reasons.join("; "))
    };

    ValidationResult {
        valid,
        failure_reason,
    }
}

/// Check raw presence flags, which decoding collapses to `bool`
///
/// The yellow flag is always checked; a pink slot's flag only when the
/// slot is within `pink_count`. Bytes of unused slots are left as the
/// device sent them. Only meaningful for [`ValidationLevel::Strict`];
/// returns `true` for other levels.
pub fn presence_flags_valid(raw: &[u8], level: ValidationLevel) -> bool {
    if level != ValidationLevel::Strict || raw.len() != RECORD_LEN {
        return true;
    }
    let used_pink = usize::from(raw[PINK_COUNT_OFFSET]).min(MAX_PINK_TARGETS);
    raw[YELLOW_FLAG_OFFSET] <= 1
        && PINK_FLAG_OFFSETS[..used_pink]
            .iter()
            .all(|&at| raw[at] <= 1)
}
