//! Tunables for the whole tracking pipeline.
//!
//! Every field has a default, so a TOML file only needs the keys it changes:
//!
//! ```toml
//! [tracking.matching]
//! strict_threshold = 0.65
//!
//! [tracking.capture]
//! recapture_face_ms = 1500
//! ```

use crate::decision::{AttendanceConfig, CaptureConfig};
use crate::matcher::MatchConfig;
use crate::pipeline::{PersonFilterConfig, ThrottleConfig};
use crate::quality::QualityConfig;
use crate::tracker::TrackerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub quality: QualityConfig,
    pub matching: MatchConfig,
    pub tracker: TrackerConfig,
    pub throttle: ThrottleConfig,
    pub capture: CaptureConfig,
    pub attendance: AttendanceConfig,
    pub person_filter: PersonFilterConfig,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    tracking: TrackingConfig,
}

impl TrackingConfig {
    /// Parse the `[tracking]` table of a TOML document. Other tables are ignored.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        file.tracking.validate()?;
        Ok(file.tracking)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.matching;
        if !(0.0..=1.0).contains(&m.lenient_threshold) || !(0.0..=1.0).contains(&m.strict_threshold)
        {
            return Err(ConfigError::Invalid(
                "similarity thresholds must be within [0, 1]".into(),
            ));
        }
        if m.lenient_threshold > m.strict_threshold {
            return Err(ConfigError::Invalid(format!(
                "lenient_threshold {} exceeds strict_threshold {}",
                m.lenient_threshold, m.strict_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.tracker.iou_threshold) {
            return Err(ConfigError::Invalid("iou_threshold must be within [0, 1]".into()));
        }
        let p = &self.person_filter;
        if p.min_area_fraction > p.max_area_fraction {
            return Err(ConfigError::Invalid(
                "person_filter.min_area_fraction exceeds max_area_fraction".into(),
            ));
        }
        if self.capture.jpeg_quality == 0 || self.capture.jpeg_quality > 100 {
            return Err(ConfigError::Invalid("jpeg_quality must be within 1..=100".into()));
        }
        Ok(())
    }
}
