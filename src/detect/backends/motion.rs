use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{class_color, BoundingBox, Detection, DetectorFamily};
use crate::frame::Frame;

const DEFAULT_CELL: u32 = 16;
const DEFAULT_THRESHOLD: f32 = 18.0;
const DEFAULT_MIN_CELLS: usize = 2;

/// Frame-difference backend.
///
/// Compares mean luma on a coarse grid against the previous frame and reports
/// a single `motion` detection around the changed cells.
pub struct MotionBackend {
    cell: u32,
    threshold: f32,
    min_cells: usize,
    previous: Option<LumaGrid>,
}

struct LumaGrid {
    width: u32,
    height: u32,
    cols: u32,
    rows: u32,
    cells: Vec<f32>,
}

impl MotionBackend {
    pub fn new() -> Self {
        Self {
            cell: DEFAULT_CELL,
            threshold: DEFAULT_THRESHOLD,
            min_cells: DEFAULT_MIN_CELLS,
            previous: None,
        }
    }

    fn grid(&self, frame: &Frame) -> LumaGrid {
        let cols = frame.width.div_ceil(self.cell);
        let rows = frame.height.div_ceil(self.cell);
        let mut sums = vec![0f32; (cols * rows) as usize];
        let mut counts = vec![0u32; (cols * rows) as usize];
        let pixels = frame.pixels();
        for y in 0..frame.height {
            let row = (y / self.cell) * cols;
            for x in 0..frame.width {
                let i = ((y * frame.width + x) * 3) as usize;
                let luma = 0.299 * pixels[i] as f32
                    + 0.587 * pixels[i + 1] as f32
                    + 0.114 * pixels[i + 2] as f32;
                let c = (row + x / self.cell) as usize;
                sums[c] += luma;
                counts[c] += 1;
            }
        }
        let cells = sums
            .iter()
            .zip(&counts)
            .map(|(s, &n)| if n == 0 { 0.0 } else { s / n as f32 })
            .collect();
        LumaGrid {
            width: frame.width,
            height: frame.height,
            cols,
            rows,
            cells,
        }
    }
}

impl Default for MotionBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for MotionBackend {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn family(&self) -> DetectorFamily {
        DetectorFamily::Objects
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let current = self.grid(frame);
        let Some(prev) = self.previous.replace(current) else {
            return Ok(Vec::new());
        };
        let Some(current) = self.previous.as_ref() else {
            return Ok(Vec::new());
        };
        if prev.width != current.width || prev.height != current.height {
            return Ok(Vec::new());
        }

        let mut changed = 0usize;
        let (mut min_c, mut min_r, mut max_c, mut max_r) = (u32::MAX, u32::MAX, 0u32, 0u32);
        for r in 0..current.rows {
            for c in 0..current.cols {
                let i = (r * current.cols + c) as usize;
                if (current.cells[i] - prev.cells[i]).abs() > self.threshold {
                    changed += 1;
                    min_c = min_c.min(c);
                    min_r = min_r.min(r);
                    max_c = max_c.max(c);
                    max_r = max_r.max(r);
                }
            }
        }
        if changed < self.min_cells {
            return Ok(Vec::new());
        }

        let span = ((max_c - min_c + 1) * (max_r - min_r + 1)) as f32;
        let bbox = BoundingBox::new(
            (min_c * self.cell) as i32,
            (min_r * self.cell) as i32,
            ((max_c + 1) * self.cell) as i32 - 1,
            ((max_r + 1) * self.cell) as i32 - 1,
        );
        Ok(vec![Detection::new(
            "motion",
            (changed as f32 / span).min(0.99),
            bbox,
            class_color(6),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_block(x0: u32, y0: u32, seq: u64) -> Frame {
        let (w, h) = (64u32, 48u32);
        let mut data = vec![20u8; (w * h * 3) as usize];
        for y in y0..(y0 + 16).min(h) {
            for x in x0..(x0 + 16).min(w) {
                let i = ((y * w + x) * 3) as usize;
                data[i..i + 3].copy_from_slice(&[240, 240, 240]);
            }
        }
        Frame::from_rgb(data, w, h, seq).unwrap()
    }

    #[test]
    fn first_frame_reports_nothing() {
        let mut backend = MotionBackend::new();
        assert!(backend.detect(&frame_with_block(0, 0, 1)).unwrap().is_empty());
    }

    #[test]
    fn static_scene_reports_nothing() {
        let mut backend = MotionBackend::new();
        backend.detect(&frame_with_block(0, 0, 1)).unwrap();
        assert!(backend.detect(&frame_with_block(0, 0, 2)).unwrap().is_empty());
    }

    #[test]
    fn moving_block_is_boxed() {
        let mut backend = MotionBackend::new();
        backend.detect(&frame_with_block(0, 0, 1)).unwrap();
        let dets = backend.detect(&frame_with_block(32, 16, 2)).unwrap();
        assert_eq!(dets.len(), 1);
        let det = &dets[0];
        assert_eq!(det.label, "motion");
        assert!(det.confidence > 0.0 && det.confidence < 1.0);
        assert_eq!(det.bbox, BoundingBox::new(0, 0, 47, 31));
    }
}
