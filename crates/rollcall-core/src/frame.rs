//! Frame type and the few pixel operations the core needs: luma, crop, JPEG.

use crate::types::BoundingBox;
use chrono::NaiveDateTime;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

/// A decoded camera frame (packed RGB8, row-major).
#[derive(Clone)]
pub struct Frame {
    /// RGB pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Wall-clock capture time; all tracking intervals are measured on it.
    pub captured_at: NaiveDateTime,
    pub sequence: u64,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("captured_at", &self.captured_at)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl Frame {
    /// Wrap packed RGB8 data, validating its length.
    pub fn from_rgb(
        data: Vec<u8>,
        width: u32,
        height: u32,
        captured_at: NaiveDateTime,
        sequence: u64,
    ) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            captured_at,
            sequence,
        })
    }

    /// Build a frame from an 8-bit grayscale buffer (replicated into RGB).
    pub fn from_gray(
        gray: &[u8],
        width: u32,
        height: u32,
        captured_at: NaiveDateTime,
        sequence: u64,
    ) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize;
        if gray.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: gray.len(),
            });
        }
        let data = gray.iter().flat_map(|&g| [g, g, g]).collect();
        Self::from_rgb(data, width, height, captured_at, sequence)
    }

    /// Rec.601 luma plane (width * height bytes).
    pub fn luma(&self) -> Vec<u8> {
        self.data
            .chunks_exact(3)
            .map(|p| {
                let y = 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32;
                y.round().clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    /// Copy out the pixels under `bbox`, clamped to the frame.
    ///
    /// Returns `None` when the clamped region is empty.
    pub fn crop(&self, bbox: &BoundingBox) -> Option<Frame> {
        let x0 = bbox.x.max(0.0).floor() as u32;
        let y0 = bbox.y.max(0.0).floor() as u32;
        let x1 = ((bbox.x + bbox.width).ceil().max(0.0) as u32).min(self.width);
        let y1 = ((bbox.y + bbox.height).ceil().max(0.0) as u32).min(self.height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        let w = (x1 - x0) as usize;
        let h = (y1 - y0) as usize;
        let stride = self.width as usize * 3;
        let mut data = Vec::with_capacity(w * h * 3);
        for y in y0 as usize..y1 as usize {
            let start = y * stride + x0 as usize * 3;
            data.extend_from_slice(&self.data[start..start + w * 3]);
        }

        Some(Frame {
            data,
            width: w as u32,
            height: h as u32,
            captured_at: self.captured_at,
            sequence: self.sequence,
        })
    }

    /// Encode the frame as a baseline JPEG.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        let img = RgbImage::from_raw(self.width, self.height, self.data.clone()).ok_or(
            FrameError::InvalidLength {
                expected: self.width as usize * self.height as usize * 3,
                actual: self.data.len(),
            },
        )?;

        let mut out = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        img.write_with_encoder(encoder)
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(out)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("image encoding failed: {0}")]
    Encode(String),
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::NaiveDate;

    pub fn at_ms(ms: i64) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 4)
            .and_then(|d| d.and_hms_opt(8, 55, 0))
            .map(|t| t + chrono::Duration::milliseconds(ms))
            .expect("valid test timestamp")
    }

    pub fn gray_frame(width: u32, height: u32, value: u8, ms: i64) -> Frame {
        let gray = vec![value; (width * height) as usize];
        Frame::from_gray(&gray, width, height, at_ms(ms), 0).expect("valid test frame")
    }

    /// Checkerboard alternating `lo`/`hi`: mean is (lo+hi)/2, Laplacian variance is large.
    pub fn checker_frame(width: u32, height: u32, lo: u8, hi: u8, ms: i64) -> Frame {
        let gray: Vec<u8> = (0..height)
            .flat_map(|y| (0..width).map(move |x| if (x + y) % 2 == 0 { lo } else { hi }))
            .collect();
        Frame::from_gray(&gray, width, height, at_ms(ms), 0).expect("valid test frame")
    }
}
