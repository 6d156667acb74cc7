use rollcall_core::{ConfigError, SystemMode, TrackingConfig};
use std::path::PathBuf;

/// Replay faster than this is clamped.
pub const MAX_REPLAY_FPS: f32 = 120.0;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory containing the SCRFD and ArcFace ONNX files.
    pub model_dir: PathBuf,
    /// Which event this station records for staff.
    pub mode: SystemMode,
    /// Directory of still images replayed as the frame stream.
    pub replay_dir: Option<PathBuf>,
    /// Replay rate in frames per second.
    pub replay_fps: f32,
    /// Restart the replay from the first image when it runs out.
    pub replay_loop: bool,
    /// Seconds between gallery reloads from the store (0 disables).
    pub gallery_reload_secs: u64,
    /// Thresholds and intervals for the tracking pipeline.
    pub tracking: TrackingConfig,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    ///
    /// `ROLLCALL_CONFIG` may name a TOML file with a `[tracking]` table. A
    /// missing file falls back to defaults; a malformed one is an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        let mode = match std::env::var("ROLLCALL_MODE") {
            Ok(v) => v.parse().map_err(ConfigError::Invalid)?,
            Err(_) => SystemMode::CheckIn,
        };

        let tracking = match std::env::var("ROLLCALL_CONFIG").map(PathBuf::from) {
            Ok(path) if path.exists() => TrackingConfig::from_file(&path)?,
            Ok(path) => {
                tracing::warn!(path = %path.display(), "config file not found; using defaults");
                TrackingConfig::default()
            }
            Err(_) => TrackingConfig::default(),
        };

        let replay_fps = replay_fps(env_f32("ROLLCALL_REPLAY_FPS", 15.0))?;

        Ok(Self {
            db_path,
            model_dir,
            mode,
            replay_dir: std::env::var("ROLLCALL_REPLAY_DIR").map(PathBuf::from).ok(),
            replay_fps,
            replay_loop: std::env::var("ROLLCALL_REPLAY_LOOP")
                .map(|v| v != "0")
                .unwrap_or(false),
            gallery_reload_secs: env_u64("ROLLCALL_GALLERY_RELOAD_SECS", 300),
            tracking,
        })
    }
}

impl Config {
    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }
}

fn replay_fps(fps: f32) -> Result<f32, ConfigError> {
    if !(fps.is_finite() && fps > 0.0) {
        return Err(ConfigError::Invalid(format!(
            "ROLLCALL_REPLAY_FPS must be positive, got {fps}"
        )));
    }
    if fps > MAX_REPLAY_FPS {
        tracing::warn!(requested = fps, max = MAX_REPLAY_FPS, "replay fps clamped");
        return Ok(MAX_REPLAY_FPS);
    }
    Ok(fps)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
