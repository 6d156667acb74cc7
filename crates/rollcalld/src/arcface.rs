//! ArcFace embedder on ONNX Runtime.
//!
//! The pipeline hands over an unaligned face crop, which is stretched to the
//! 112x112 model input. Enrollment embeddings must come from the same crop
//! convention for scores to be comparable.

use crate::model::{open_session, resize_rgb, ModelError};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rollcall_core::capability::{CapabilityError, Embedder};
use rollcall_core::{Embedding, Frame};
use std::path::Path;

const INPUT_SIZE: u32 = 112;
const MEAN: f32 = 127.5;
const STD: f32 = 127.5;
const EMBEDDING_DIM: usize = 512;

pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let session = open_session(path)?;
        tracing::info!(path = %path.display(), "ArcFace embedder loaded");
        Ok(Self { session })
    }

    fn run(&mut self, face: &Frame) -> Result<Embedding, ModelError> {
        let input = preprocess(face)?;
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::Output(format!("embedding: {e}")))?;
        if raw.len() != EMBEDDING_DIM {
            return Err(ModelError::Output(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        Ok(Embedding::new(raw.to_vec()))
    }
}

impl Embedder for ArcFaceEmbedder {
    fn embed(&mut self, face: &Frame) -> Result<Embedding, CapabilityError> {
        Ok(self.run(face)?)
    }
}

fn preprocess(face: &Frame) -> Result<Array4<f32>, ModelError> {
    let resized = resize_rgb(face, INPUT_SIZE, INPUT_SIZE)?;
    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - MEAN) / STD;
        }
    }
    Ok(tensor)
}
