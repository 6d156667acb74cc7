//! SCRFD face detector on ONNX Runtime.
//!
//! The frame is letterboxed into a 640x640 RGB tensor; each of the three
//! stride levels yields per-anchor scores and box distances, which are mapped
//! back to frame coordinates and merged with NMS.

use crate::model::{open_session, resize_rgb, ModelError};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rollcall_core::capability::{CapabilityError, FaceDetector};
use rollcall_core::{BoundingBox, FaceDetection, Frame};
use std::path::Path;

const INPUT_SIZE: u32 = 640;
const MEAN: f32 = 127.5;
const STD: f32 = 128.0;
/// Below the pipeline's minimum face quality, so weak faces surface as
/// covered faces instead of disappearing.
const SCORE_THRESHOLD: f32 = 0.3;
const NMS_IOU: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Where the resized frame sits inside the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn for_frame(width: u32, height: u32) -> Self {
        let size = INPUT_SIZE as f32;
        let scale = (size / width as f32).min(size / height as f32);
        let new_w = (width as f32 * scale).round().clamp(1.0, size);
        let new_h = (height as f32 * scale).round().clamp(1.0, size);
        Self {
            scale,
            pad_x: ((size - new_w) / 2.0).floor(),
            pad_y: ((size - new_h) / 2.0).floor(),
        }
    }

    fn resized(&self, width: u32, height: u32) -> (u32, u32) {
        let w = (width as f32 * self.scale).round().clamp(1.0, INPUT_SIZE as f32);
        let h = (height as f32 * self.scale).round().clamp(1.0, INPUT_SIZE as f32);
        (w as u32, h as u32)
    }

    /// Model-input coordinates back to frame coordinates.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

pub struct ScrfdDetector {
    session: Session,
    /// (score, bbox) output index per stride.
    layout: [(usize, usize); 3],
}

impl ScrfdDetector {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let session = open_session(path)?;
        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        let layout = output_layout(&names)?;
        tracing::info!(path = %path.display(), outputs = ?names, ?layout, "SCRFD detector loaded");
        Ok(Self { session, layout })
    }

    fn run(&mut self, frame: &Frame) -> Result<Vec<FaceDetection>, ModelError> {
        let (input, letterbox) = preprocess(frame)?;
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut found = Vec::new();
        for (&stride, &(score_idx, bbox_idx)) in STRIDES.iter().zip(self.layout.iter()) {
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| ModelError::Output(format!("scores at stride {stride}: {e}")))?;
            let (_, distances) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| ModelError::Output(format!("boxes at stride {stride}: {e}")))?;
            found.extend(decode_stride(scores, distances, stride, &letterbox));
        }
        Ok(nms(found, NMS_IOU))
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceDetection>, CapabilityError> {
        Ok(self.run(frame)?)
    }
}

/// Map stride slots to output tensors. Exports either name them
/// `score_8`, `bbox_8`, ... or list scores, then boxes, then (optional)
/// keypoints positionally.
fn output_layout(names: &[String]) -> Result<[(usize, usize); 3], ModelError> {
    if names.len() < 6 {
        return Err(ModelError::Output(format!(
            "SCRFD needs score and bbox outputs for 3 strides, got {} outputs",
            names.len()
        )));
    }
    let find = |prefix: &str, stride: usize| {
        let want = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == want)
    };
    let named: Option<Vec<(usize, usize)>> = STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?)))
        .collect();
    Ok(match named {
        Some(slots) => [slots[0], slots[1], slots[2]],
        None => [(0, 3), (1, 4), (2, 5)],
    })
}

fn preprocess(frame: &Frame) -> Result<(Array4<f32>, Letterbox), ModelError> {
    if frame.width == 0 || frame.height == 0 {
        return Err(ModelError::Input("empty frame".into()));
    }
    let letterbox = Letterbox::for_frame(frame.width, frame.height);
    let (w, h) = letterbox.resized(frame.width, frame.height);
    let resized = resize_rgb(frame, w, h)?;

    let size = INPUT_SIZE as usize;
    let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    // Zero is the normalized mean, so the border needs no fill.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, oy + y as usize, ox + x as usize]] = (pixel[c] as f32 - MEAN) / STD;
        }
    }
    Ok((tensor, letterbox))
}

fn decode_stride(
    scores: &[f32],
    distances: &[f32],
    stride: usize,
    letterbox: &Letterbox,
) -> Vec<FaceDetection> {
    let grid = INPUT_SIZE as usize / stride;
    let step = stride as f32;
    let mut found = Vec::new();

    for anchor in 0..grid * grid * ANCHORS_PER_CELL {
        let score = scores.get(anchor).copied().unwrap_or(0.0);
        if score < SCORE_THRESHOLD {
            continue;
        }
        let Some(d) = distances.get(anchor * 4..anchor * 4 + 4) else {
            continue;
        };
        let cell = anchor / ANCHORS_PER_CELL;
        let cx = (cell % grid) as f32 * step;
        let cy = (cell / grid) as f32 * step;

        let (x1, y1) = letterbox.unmap(cx - d[0] * step, cy - d[1] * step);
        let (x2, y2) = letterbox.unmap(cx + d[2] * step, cy + d[3] * step);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }
        found.push(FaceDetection {
            bbox: BoundingBox::new(x1, y1, x2 - x1, y2 - y1),
            quality: score.clamp(0.0, 1.0),
        });
    }
    found
}

/// Greedy NMS; the result is ordered by descending score.
fn nms(mut found: Vec<FaceDetection>, iou: f32) -> Vec<FaceDetection> {
    found.sort_by(|a, b| b.quality.total_cmp(&a.quality));
    let mut kept: Vec<FaceDetection> = Vec::with_capacity(found.len());
    for det in found {
        if kept.iter().all(|k| k.bbox.iou(&det.bbox) <= iou) {
            kept.push(det);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn det(x: f32, y: f32, size: f32, quality: f32) -> FaceDetection {
        FaceDetection {
            bbox: BoundingBox::new(x, y, size, size),
            quality,
        }
    }

    #[test]
    fn test_layout_by_name() {
        let layout = output_layout(&names(&[
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]))
        .unwrap();
        assert_eq!(layout, [(2, 0), (5, 3), (8, 6)]);
    }

    #[test]
    fn test_layout_positional_with_and_without_keypoints() {
        let nine: Vec<String> = (0..9).map(|i| (440 + i).to_string()).collect();
        assert_eq!(output_layout(&nine).unwrap(), [(0, 3), (1, 4), (2, 5)]);
        let six: Vec<String> = (0..6).map(|i| i.to_string()).collect();
        assert_eq!(output_layout(&six).unwrap(), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_layout_rejects_too_few_outputs() {
        assert!(matches!(
            output_layout(&names(&["a", "b", "c"])),
            Err(ModelError::Output(_))
        ));
    }

    #[test]
    fn test_letterbox_for_landscape_frame() {
        let lb = Letterbox::for_frame(320, 240);
        assert_eq!(lb.scale, 2.0);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 80.0);
        assert_eq!(lb.resized(320, 240), (640, 480));
        assert_eq!(lb.unmap(200.0, 280.0), (100.0, 100.0));
    }

    #[test]
    fn test_preprocess_pads_with_zero() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let frame = Frame::from_rgb(vec![255; 320 * 240 * 3], 320, 240, at, 0).unwrap();
        let (tensor, lb) = preprocess(&frame).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(lb.pad_y, 80.0);
        assert_eq!(tensor[[0, 0, 10, 320]], 0.0);
        let inside = tensor[[0, 2, 320, 320]];
        assert!((inside - (255.0 - MEAN) / STD).abs() < 1e-6);
    }

    #[test]
    fn test_decode_maps_anchor_to_frame() {
        let stride = 32;
        let grid = 640 / stride;
        let mut scores = vec![0.0f32; grid * grid * ANCHORS_PER_CELL];
        let mut distances = vec![0.0f32; scores.len() * 4];
        // Cell at row 2, column 3, first anchor.
        let anchor = (2 * grid + 3) * ANCHORS_PER_CELL;
        scores[anchor] = 0.9;
        distances[anchor * 4..anchor * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let lb = Letterbox {
            scale: 2.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let found = decode_stride(&scores, &distances, stride, &lb);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].bbox, BoundingBox::new(32.0, 16.0, 32.0, 32.0));
        assert_eq!(found[0].quality, 0.9);
    }

    #[test]
    fn test_decode_skips_low_scores_and_short_outputs() {
        let lb = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        assert!(decode_stride(&[0.1; 8], &[1.0; 32], 32, &lb).is_empty());
        // Score present but no box data for it.
        assert!(decode_stride(&[0.9], &[], 32, &lb).is_empty());
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let kept = nms(
            vec![
                det(5.0, 5.0, 100.0, 0.8),
                det(0.0, 0.0, 100.0, 0.9),
                det(300.0, 300.0, 50.0, 0.7),
            ],
            NMS_IOU,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].quality, 0.9);
        assert_eq!(kept[1].quality, 0.7);
    }
}
