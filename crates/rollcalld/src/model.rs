//! Shared plumbing for the ONNX face models.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ort::session::Session;
use rollcall_core::capability::CapabilityError;
use rollcall_core::Frame;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    NotFound(PathBuf),
    #[error("unexpected model output: {0}")]
    Output(String),
    #[error("invalid input frame: {0}")]
    Input(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<ModelError> for CapabilityError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Input(msg) => CapabilityError::InvalidInput(msg),
            ModelError::NotFound(path) => {
                CapabilityError::Unavailable(format!("model file not found: {}", path.display()))
            }
            other => CapabilityError::InferenceFailed(other.to_string()),
        }
    }
}

pub fn open_session(path: &Path) -> Result<Session, ModelError> {
    if !path.exists() {
        return Err(ModelError::NotFound(path.to_path_buf()));
    }
    let session = Session::builder()?
        .with_intra_threads(2)
        .map_err(ort::Error::from)?
        .commit_from_file(path)?;
    Ok(session)
}

/// Bilinear resize of an RGB frame.
pub fn resize_rgb(frame: &Frame, width: u32, height: u32) -> Result<RgbImage, ModelError> {
    if frame.width == 0 || frame.height == 0 {
        return Err(ModelError::Input("empty frame".into()));
    }
    let image = RgbImage::from_raw(frame.width, frame.height, frame.data.clone()).ok_or_else(|| {
        ModelError::Input(format!(
            "{}x{} frame with {} bytes",
            frame.width,
            frame.height,
            frame.data.len()
        ))
    })?;
    Ok(imageops::resize(&image, width, height, FilterType::Triangle))
}
