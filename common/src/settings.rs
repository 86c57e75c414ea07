//! User adjustable detection settings and their validation rules.
//!
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::models::{DetectorKind, UnknownDetector};

pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Lowest accepted minimum confidence. The upper bound 1.0 is exclusive.
pub const MIN_CONFIDENCE_LOWER: f32 = 0.1;
pub const MIN_CONFIDENCE_UPPER: f32 = 1.0;

pub const POLL_INTERVAL_RANGE_MS: RangeInclusive<i64> = 10..=2000;

/// Settings of one detection pipeline.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Settings {
    pub min_confidence: f32,
    pub poll_interval_ms: u64,
    pub detector_kind: DetectorKind,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            detector_kind: DetectorKind::default(),
        }
    }
}

impl Settings {
    /// Whether switching from `self` to `other` needs a full pipeline restart.
    pub fn requires_restart(&self, other: &Settings) -> bool {
        self.detector_kind != other.detector_kind || self.poll_interval_ms != other.poll_interval_ms
    }
}

/// Rejected settings input. The previous value stays in place.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Minimum confidence must be at least 0.1 and below 1.0 (got {0})")]
    MinConfidenceOutOfRange(f32),
    #[error("Frequency must be between 10 and 2000 milliseconds (got {0})")]
    PollIntervalOutOfRange(i64),
    #[error(transparent)]
    UnknownDetector(#[from] UnknownDetector),
}

/// Outcome of validating one raw text input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldUpdate<T> {
    Set(T),
    /// Input was empty or not a number; fall back to the documented default.
    ResetToDefault,
}

impl<T> FieldUpdate<T> {
    pub fn resolve(self, default: T) -> T {
        match self {
            FieldUpdate::Set(value) => value,
            FieldUpdate::ResetToDefault => default,
        }
    }
}

/// Validate a raw minimum confidence input.
///
/// Numbers too large for `f32` (and infinities) are out of range. Only text that is not a number
/// at all resets the field.
pub fn validate_min_confidence(raw: &str) -> Result<FieldUpdate<f32>, ValidationError> {
    match raw.trim().parse::<f32>() {
        Ok(value) if value.is_nan() => Ok(FieldUpdate::ResetToDefault),
        Ok(value) if (MIN_CONFIDENCE_LOWER..MIN_CONFIDENCE_UPPER).contains(&value) => {
            Ok(FieldUpdate::Set(value))
        }
        Ok(value) => Err(ValidationError::MinConfidenceOutOfRange(value)),
        Err(_) => Ok(FieldUpdate::ResetToDefault),
    }
}

/// Validate a raw poll interval input in milliseconds.
///
/// Fractional input is truncated toward zero before the range check, so `1500.5` means 1500 ms.
/// Values that do not fit an integer are out of range.
pub fn validate_poll_interval(raw: &str) -> Result<FieldUpdate<u64>, ValidationError> {
    let value = match raw.trim().parse::<f64>() {
        Ok(value) if value.is_nan() => return Ok(FieldUpdate::ResetToDefault),
        Ok(value) => value.trunc(),
        Err(_) => return Ok(FieldUpdate::ResetToDefault),
    };

    // Saturates for huge and infinite values
    let millis = value as i64;
    if value.is_finite() && POLL_INTERVAL_RANGE_MS.contains(&millis) {
        Ok(FieldUpdate::Set(millis as u64))
    } else {
        Err(ValidationError::PollIntervalOutOfRange(millis))
    }
}

/// Validate a raw detector selection.
pub fn validate_detector_kind(raw: &str) -> Result<DetectorKind, ValidationError> {
    Ok(raw.trim().parse()?)
}
