use serde::{Deserialize, Serialize};

/// Axis-aligned box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Area of the overlap between two boxes (0.0 when disjoint).
    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }

    /// Intersection-over-union in [0, 1].
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection(other);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Fraction of `self` that lies inside `outer`, in [0, 1].
    ///
    /// Used to associate a face box with the body box that contains it,
    /// where IoU is small simply because the face is much smaller.
    pub fn containment_in(&self, outer: &BoundingBox) -> f32 {
        let area = self.area();
        if area > 0.0 {
            self.intersection(outer) / area
        } else {
            0.0
        }
    }

    /// Grow the box by `ratio` of its size on every side, clamped to the frame.
    pub fn expanded(&self, ratio: f32, frame_width: u32, frame_height: u32) -> BoundingBox {
        let pad_x = self.width * ratio;
        let pad_y = self.height * ratio;
        let x1 = (self.x - pad_x).max(0.0);
        let y1 = (self.y - pad_y).max(0.0);
        let x2 = (self.x + self.width + pad_x).min(frame_width as f32);
        let y2 = (self.y + self.height + pad_y).min(frame_height as f32);
        BoundingBox {
            x: x1,
            y: y1,
            width: (x2 - x1).max(0.0),
            height: (y2 - y1).max(0.0),
        }
    }
}

/// Face embedding vector produced by an [`Embedder`](crate::capability::Embedder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// L2-normalized copy, or `None` for a zero, empty or non-finite vector.
    pub fn normalized(&self) -> Option<Embedding> {
        let norm = self.norm();
        if !norm.is_finite() || norm <= f32::EPSILON {
            return None;
        }
        Some(Embedding {
            values: self.values.iter().map(|v| v / norm).collect(),
        })
    }

    /// Dot product. Equal to cosine similarity when both sides are normalized.
    pub fn dot(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }

    /// Little-endian f32 byte encoding used for storage blobs.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`to_le_bytes`](Self::to_le_bytes). `None` if the length is not a multiple of 4.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Embedding> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Embedding { values })
    }
}

/// One face found by a [`FaceDetector`](crate::capability::FaceDetector).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    /// Detector confidence / quality score in [0, 1].
    pub quality: f32,
}

/// One foreground region found by a [`MotionSegmenter`](crate::capability::MotionSegmenter).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionBlob {
    pub bbox: BoundingBox,
    /// Fraction of the frame area covered by the blob, in [0, 1].
    pub area_fraction: f32,
}
