//! Frame-differencing motion segmenter.
//!
//! Keeps a running-average luma background, marks grid cells where enough
//! pixels differ from it, and merges 4-connected active cells into blobs.

use rollcall_core::capability::{CapabilityError, MotionSegmenter};
use rollcall_core::types::{BoundingBox, MotionBlob};
use rollcall_core::Frame;

pub struct FrameDiffSegmenter {
    /// Cell edge in pixels.
    cell: usize,
    /// Per-pixel luma difference that counts as change.
    diff_threshold: f32,
    /// Fraction of changed pixels that activates a cell.
    cell_fraction: f32,
    /// Background adaptation rate per processed frame, in (0, 1].
    learning_rate: f32,
    background: Option<Background>,
}

struct Background {
    width: usize,
    height: usize,
    luma: Vec<f32>,
}

impl Default for FrameDiffSegmenter {
    fn default() -> Self {
        Self::new(16, 25.0, 0.2, 0.05)
    }
}

impl FrameDiffSegmenter {
    pub fn new(cell: usize, diff_threshold: f32, cell_fraction: f32, learning_rate: f32) -> Self {
        Self {
            cell: cell.max(1),
            diff_threshold,
            cell_fraction,
            learning_rate: learning_rate.clamp(f32::EPSILON, 1.0),
            background: None,
        }
    }

    /// Mark changed cells and fold the frame into the background.
    fn active_cells(&mut self, luma: &[u8], w: usize, h: usize) -> Option<(Vec<bool>, usize, usize)> {
        let seeded = matches!(&self.background, Some(bg) if bg.width == w && bg.height == h);
        if !seeded {
            self.background = Some(Background {
                width: w,
                height: h,
                luma: luma.iter().map(|&p| p as f32).collect(),
            });
            return None;
        }
        let bg = self.background.as_mut()?;

        let cols = w.div_ceil(self.cell);
        let rows = h.div_ceil(self.cell);
        let mut changed = vec![0u32; cols * rows];
        let mut totals = vec![0u32; cols * rows];

        for y in 0..h {
            let row = y / self.cell;
            for x in 0..w {
                let i = y * w + x;
                let idx = row * cols + x / self.cell;
                let current = luma[i] as f32;
                if (current - bg.luma[i]).abs() > self.diff_threshold {
                    changed[idx] += 1;
                }
                totals[idx] += 1;
                bg.luma[i] += (current - bg.luma[i]) * self.learning_rate;
            }
        }

        let active = changed
            .iter()
            .zip(&totals)
            .map(|(&c, &t)| t > 0 && c as f32 >= self.cell_fraction * t as f32)
            .collect();
        Some((active, cols, rows))
    }
}

impl MotionSegmenter for FrameDiffSegmenter {
    fn segment(&mut self, frame: &Frame) -> Result<Vec<MotionBlob>, CapabilityError> {
        let w = frame.width as usize;
        let h = frame.height as usize;
        if w == 0 || h == 0 {
            return Err(CapabilityError::InvalidInput("empty frame".into()));
        }
        let luma = frame.luma();
        let Some((mut active, cols, rows)) = self.active_cells(&luma, w, h) else {
            return Ok(Vec::new());
        };

        let frame_area = (w * h) as f32;
        let mut blobs = Vec::new();
        let mut stack = Vec::new();

        for start in 0..active.len() {
            if !active[start] {
                continue;
            }
            active[start] = false;
            stack.push(start);

            let (mut min_c, mut min_r) = (cols, rows);
            let (mut max_c, mut max_r) = (0, 0);
            let mut pixels = 0usize;

            while let Some(idx) = stack.pop() {
                let (c, r) = (idx % cols, idx / cols);
                min_c = min_c.min(c);
                max_c = max_c.max(c);
                min_r = min_r.min(r);
                max_r = max_r.max(r);
                let cell_w = self.cell.min(w - c * self.cell);
                let cell_h = self.cell.min(h - r * self.cell);
                pixels += cell_w * cell_h;

                let mut visit = |n: usize| {
                    if active[n] {
                        active[n] = false;
                        stack.push(n);
                    }
                };
                if c > 0 {
                    visit(idx - 1);
                }
                if c + 1 < cols {
                    visit(idx + 1);
                }
                if r > 0 {
                    visit(idx - cols);
                }
                if r + 1 < rows {
                    visit(idx + cols);
                }
            }

            let x0 = min_c * self.cell;
            let y0 = min_r * self.cell;
            let x1 = ((max_c + 1) * self.cell).min(w);
            let y1 = ((max_r + 1) * self.cell).min(h);
            blobs.push(MotionBlob {
                bbox: BoundingBox::new(x0 as f32, y0 as f32, (x1 - x0) as f32, (y1 - y0) as f32),
                area_fraction: pixels as f32 / frame_area,
            });
        }

        Ok(blobs)
    }

    fn reset(&mut self) {
        self.background = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn frame_with_rect(value: u8, rect: Option<(usize, usize, usize, usize)>) -> Frame {
        let (w, h) = (128usize, 96usize);
        let mut gray = vec![value; w * h];
        if let Some((x0, y0, rw, rh)) = rect {
            for y in y0..y0 + rh {
                for x in x0..x0 + rw {
                    gray[y * w + x] = 220;
                }
            }
        }
        let at = NaiveDate::from_ymd_opt(2024, 3, 4)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        Frame::from_gray(&gray, w as u32, h as u32, at, 0).unwrap()
    }

    #[test]
    fn test_first_frame_only_seeds_background() {
        let mut seg = FrameDiffSegmenter::default();
        assert!(seg.segment(&frame_with_rect(40, None)).unwrap().is_empty());
    }

    #[test]
    fn test_static_scene_has_no_blobs() {
        let mut seg = FrameDiffSegmenter::default();
        seg.segment(&frame_with_rect(40, None)).unwrap();
        assert!(seg.segment(&frame_with_rect(40, None)).unwrap().is_empty());
    }

    #[test]
    fn test_new_object_becomes_one_blob() {
        let mut seg = FrameDiffSegmenter::default();
        seg.segment(&frame_with_rect(40, None)).unwrap();
        let blobs = seg.segment(&frame_with_rect(40, Some((32, 16, 32, 64)))).unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].bbox, BoundingBox::new(32.0, 16.0, 32.0, 64.0));
        let expected = (32.0 * 64.0) / (128.0 * 96.0);
        assert!((blobs[0].area_fraction - expected).abs() < 1e-6);
    }

    #[test]
    fn test_separate_objects_are_separate_blobs() {
        let mut seg = FrameDiffSegmenter::default();
        seg.segment(&frame_with_rect(40, None)).unwrap();
        let mut f = frame_with_rect(40, Some((0, 0, 16, 32)));
        // Second rectangle far from the first.
        for y in 48..80 {
            for x in 96..112 {
                let i = (y * 128 + x) * 3;
                f.data[i..i + 3].copy_from_slice(&[220, 220, 220]);
            }
        }
        assert_eq!(seg.segment(&f).unwrap().len(), 2);
    }

    #[test]
    fn test_reset_and_resolution_change_reseed() {
        let mut seg = FrameDiffSegmenter::default();
        seg.segment(&frame_with_rect(40, None)).unwrap();
        seg.reset();
        assert!(seg
            .segment(&frame_with_rect(40, Some((32, 16, 32, 64))))
            .unwrap()
            .is_empty());
    }
}
