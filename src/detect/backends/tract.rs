#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{class_color, BoundingBox, Detection, DetectorFamily, FACE_COLOR};
use crate::frame::Frame;

/// Tract-based backend for YOLO-style ONNX detectors.
///
/// The model is expected to take a `1x3xHxW` float input in `[0, 1]` and emit
/// rows of `cx, cy, w, h, objectness, class scores...`. Box coordinates may be
/// either normalised or in model-input pixels.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    family: DetectorFamily,
    labels: Vec<String>,
    input_width: u32,
    input_height: u32,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        family: DetectorFamily,
        input_width: u32,
        input_height: u32,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_height as usize, input_width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            family,
            labels: Vec::new(),
            input_width,
            input_height,
            confidence_threshold: 0.45,
            nms_threshold: 0.4,
        })
    }

    /// Load class labels, one per line.
    pub fn with_labels_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read labels from {}", path.display()))?;
        self.labels = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Ok(self)
    }

    pub fn with_thresholds(mut self, confidence: f32, nms: f32) -> Self {
        self.confidence_threshold = confidence;
        self.nms_threshold = nms;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let image = frame.to_image()?;
        let resized = image::imageops::resize(
            &image,
            self.input_width,
            self.input_height,
            FilterType::Triangle,
        );
        let width = self.input_width as usize;
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.input_height as usize, width),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );
        Ok(input.into_tensor())
    }

    fn label_for(&self, class_id: usize) -> (String, crate::detect::Rgb) {
        match self.family {
            DetectorFamily::Faces => ("Face".to_string(), FACE_COLOR),
            DetectorFamily::Objects => {
                let label = self
                    .labels
                    .get(class_id)
                    .cloned()
                    .unwrap_or_else(|| format!("id:{}", class_id));
                (label, class_color(class_id))
            }
        }
    }

    fn decode(&self, rows: &[f32], stride: usize, frame: &Frame) -> Vec<Detection> {
        let sx = frame.width as f32;
        let sy = frame.height as f32;
        let mut candidates: Vec<(BoundingBox, f32, usize)> = Vec::new();
        for row in rows.chunks_exact(stride) {
            let objectness = row[4];
            let (class_id, class_score) = row[5..]
                .iter()
                .copied()
                .enumerate()
                .fold((0usize, f32::NEG_INFINITY), |best, (i, s)| {
                    if s > best.1 {
                        (i, s)
                    } else {
                        best
                    }
                });
            let score = if stride > 5 {
                objectness * class_score
            } else {
                objectness
            };
            if !score.is_finite() || score < self.confidence_threshold {
                continue;
            }
            let (mut cx, mut cy, mut w, mut h) = (row[0], row[1], row[2], row[3]);
            if w > 1.0 || h > 1.0 {
                cx /= self.input_width as f32;
                w /= self.input_width as f32;
                cy /= self.input_height as f32;
                h /= self.input_height as f32;
            }
            let bbox = BoundingBox::from_xywh(
                ((cx - w / 2.0) * sx) as i32,
                ((cy - h / 2.0) * sy) as i32,
                (w * sx) as i32,
                (h * sy) as i32,
            );
            candidates.push((bbox, score, class_id));
        }

        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
        let mut kept: Vec<(BoundingBox, f32, usize)> = Vec::new();
        for candidate in candidates {
            if kept
                .iter()
                .all(|k| k.0.iou(&candidate.0) <= self.nms_threshold)
            {
                kept.push(candidate);
            }
        }

        kept.into_iter()
            .map(|(bbox, score, class_id)| {
                let (label, color) = self.label_for(class_id);
                Detection::new(label, score, bbox, color)
            })
            .collect()
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn family(&self) -> DetectorFamily {
        self.family
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let stride = *view
            .shape()
            .last()
            .ok_or_else(|| anyhow!("model output has no dimensions"))?;
        if stride < 5 {
            return Err(anyhow!("model output rows too short: {}", stride));
        }
        let rows: Vec<f32> = view.iter().copied().collect();
        Ok(self.decode(&rows, stride, frame))
    }
}
