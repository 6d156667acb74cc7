//! Sensing capabilities consumed by the pipeline.
//!
//! Detection and embedding models live outside this crate; anything that can
//! produce boxes and vectors from a [`Frame`] plugs in here.

use crate::frame::Frame;
use crate::types::{Embedding, FaceDetection, MotionBlob};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("capability unavailable: {0}")]
    Unavailable(String),
}

pub trait FaceDetector: Send {
    /// Faces in frame pixel coordinates.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceDetection>, CapabilityError>;
}

pub trait Embedder: Send {
    /// Embedding of a face crop. Need not be normalized.
    fn embed(&mut self, face: &Frame) -> Result<Embedding, CapabilityError>;
}

pub trait MotionSegmenter: Send {
    /// Foreground blobs in frame pixel coordinates.
    fn segment(&mut self, frame: &Frame) -> Result<Vec<MotionBlob>, CapabilityError>;

    /// Forget any background model, e.g. after the stream restarted.
    fn reset(&mut self) {}
}
