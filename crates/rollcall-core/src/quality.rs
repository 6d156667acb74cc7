//! Frame quality gate — brightness and sharpness with two admission tiers.
//!
//! The strict tier decides whether a frame is good enough to confirm a staff
//! identity. The lenient tier still lets motion tracking and unknown-person
//! capture run in poor lighting. Both are evaluated on every sampled frame.

use crate::frame::Frame;
use serde::{Deserialize, Serialize};

/// Minimum brightness (mean luma, 0–255) and sharpness (Laplacian variance).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityThresholds {
    pub min_brightness: f32,
    pub min_sharpness: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "QualityTable")]
pub struct QualityConfig {
    pub strict: QualityThresholds,
    pub lenient: QualityThresholds,
}

/// `[quality]` as written in a config file. The tiers have different
/// defaults, so each unset key falls back to its own tier's value.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QualityTable {
    strict: TierTable,
    lenient: TierTable,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TierTable {
    min_brightness: Option<f32>,
    min_sharpness: Option<f32>,
}

impl TierTable {
    fn or(self, base: QualityThresholds) -> QualityThresholds {
        QualityThresholds {
            min_brightness: self.min_brightness.unwrap_or(base.min_brightness),
            min_sharpness: self.min_sharpness.unwrap_or(base.min_sharpness),
        }
    }
}

impl From<QualityTable> for QualityConfig {
    fn from(table: QualityTable) -> Self {
        let base = Self::default();
        Self {
            strict: table.strict.or(base.strict),
            lenient: table.lenient.or(base.lenient),
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            strict: QualityThresholds {
                min_brightness: 30.0,
                min_sharpness: 50.0,
            },
            lenient: QualityThresholds {
                min_brightness: 15.0,
                min_sharpness: 20.0,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMetrics {
    pub brightness: f32,
    pub sharpness: f32,
}

/// Highest tier a frame was admitted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Strict,
    Lenient,
    Rejected,
}

impl Admission {
    /// Only strict frames may move a track to confirmed staff.
    pub fn allows_confirmation(self) -> bool {
        matches!(self, Admission::Strict)
    }

    pub fn allows_processing(self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    config: QualityConfig,
}

impl QualityGate {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn evaluate(&self, frame: &Frame) -> FrameMetrics {
        let luma = frame.luma();
        FrameMetrics {
            brightness: mean_brightness(&luma),
            sharpness: laplacian_variance(&luma, frame.width as usize, frame.height as usize),
        }
    }

    pub fn admits(&self, metrics: &FrameMetrics, strict: bool) -> bool {
        let t = if strict {
            &self.config.strict
        } else {
            &self.config.lenient
        };
        metrics.brightness >= t.min_brightness && metrics.sharpness >= t.min_sharpness
    }

    pub fn admission(&self, metrics: &FrameMetrics) -> Admission {
        if self.admits(metrics, true) {
            Admission::Strict
        } else if self.admits(metrics, false) {
            Admission::Lenient
        } else {
            Admission::Rejected
        }
    }
}

/// Average luma (0.0–255.0).
pub fn mean_brightness(luma: &[u8]) -> f32 {
    if luma.is_empty() {
        return 0.0;
    }
    luma.iter().map(|&b| b as f32).sum::<f32>() / luma.len() as f32
}

/// Variance of the 4-neighbour Laplacian over interior pixels.
///
/// Frames smaller than 3x3 have no interior and score 0.0.
pub fn laplacian_variance(luma: &[u8], width: usize, height: usize) -> f32 {
    if width < 3 || height < 3 || luma.len() < width * height {
        return 0.0;
    }

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0usize;

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let c = luma[y * width + x] as f64;
            let lap = luma[(y - 1) * width + x] as f64
                + luma[(y + 1) * width + x] as f64
                + luma[y * width + x - 1] as f64
                + luma[y * width + x + 1] as f64
                - 4.0 * c;
            sum += lap;
            sum_sq += lap * lap;
            count += 1;
        }
    }

    let n = count as f64;
    let mean = sum / n;
    ((sum_sq / n) - mean * mean).max(0.0) as f32
}
