//! Directory replay: feeds still images to the engine at a fixed rate.

use crate::config::MAX_REPLAY_FPS;
use crate::engine::{EngineError, EngineHandle};
use chrono::{Local, NaiveDateTime};
use rollcall_core::{Frame, FrameError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no images found in {0}")]
    Empty(PathBuf),
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),
}

/// Image files of one directory, in file-name order.
pub struct DirectorySource {
    paths: Vec<PathBuf>,
}

impl DirectorySource {
    pub fn open(dir: &Path) -> Result<Self, SourceError> {
        let io_err = |source| SourceError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if path.is_file() && is_image {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            return Err(SourceError::Empty(dir.to_path_buf()));
        }
        paths.sort();

        tracing::info!(dir = %dir.display(), images = paths.len(), "replay source opened");
        Ok(Self { paths })
    }

    /// Decode one image into an RGB frame.
    pub fn load(path: &Path, captured_at: NaiveDateTime, sequence: u64) -> Result<Frame, SourceError> {
        let image = image::open(path)
            .map_err(|source| SourceError::Decode {
                path: path.to_path_buf(),
                source,
            })?
            .to_rgb8();
        let (width, height) = image.dimensions();
        Ok(Frame::from_rgb(image.into_raw(), width, height, captured_at, sequence)?)
    }
}

/// Submit every image at `fps`, stamping each with the current local time.
/// With `looping`, tracks are reset and the directory replays until the
/// engine goes away. Returns the number of frames submitted.
pub async fn replay(
    source: DirectorySource,
    engine: EngineHandle,
    fps: f32,
    looping: bool,
) -> Result<u64, EngineError> {
    let period = Duration::from_secs_f32(1.0 / fps.min(MAX_REPLAY_FPS));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sequence = 0u64;

    loop {
        for path in &source.paths {
            ticker.tick().await;
            let path = path.clone();
            let seq = sequence;
            let captured_at = Local::now().naive_local();
            let loaded =
                tokio::task::spawn_blocking(move || DirectorySource::load(&path, captured_at, seq))
                    .await;
            match loaded {
                Ok(Ok(frame)) => {
                    engine.submit(frame)?;
                    sequence += 1;
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "skipping unreadable image"),
                Err(e) => tracing::warn!(error = %e, "image decode task failed"),
            }
        }
        if !looping {
            break;
        }
        tracing::debug!(submitted = sequence, "replay restarting");
        engine.reset().await?;
    }

    Ok(sequence)
}
