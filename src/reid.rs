// src/reid.rs

use crate::detector::resize_bilinear;
use crate::types::Frame;
use anyhow::{Context, Result};
use ort::session::{builder::GraphOptimizationLevel, Session};
use tracing::info;

// ImageNet normalization, matching the exported re-id model's training.
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Appearance-embedding contract: one vector per requested box.
pub trait FeatureExtractor: Send {
    fn extract(&mut self, frame: &Frame, boxes: &[[f32; 4]]) -> Result<Vec<Vec<f32>>>;
}

/// ONNX re-identification model wrapper.
pub struct OnnxExtractor {
    session: Session,
    input_width: usize,
    input_height: usize,
}

impl OnnxExtractor {
    pub fn new(model_path: &str, input_width: usize, input_height: usize) -> Result<Self> {
        info!("Loading re-id model: {}", model_path);

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(2)?
            .commit_from_file(model_path)
            .context("failed to load re-id model")?;

        info!("✓ Re-id extractor initialized");
        Ok(Self {
            session,
            input_width,
            input_height,
        })
    }

    fn preprocess(&self, frame: &Frame, bbox: &[f32; 4]) -> Vec<f32> {
        let crop = crop_rgb(frame, bbox);
        let resized = resize_bilinear(
            &crop.data,
            crop.width,
            crop.height,
            self.input_width,
            self.input_height,
        );

        let (w, h) = (self.input_width, self.input_height);
        let mut input = vec![0.0f32; 3 * w * h];
        for c in 0..3 {
            for y in 0..h {
                for x in 0..w {
                    let v = resized[(y * w + x) * 3 + c] as f32 / 255.0;
                    input[c * w * h + y * w + x] = (v - MEAN[c]) / STD[c];
                }
            }
        }
        input
    }

    fn embed(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let shape = [1usize, 3, self.input_height, self.input_width];
        let value =
            ort::value::Value::from_array((shape.as_slice(), input.to_vec().into_boxed_slice()))?;
        let outputs = self.session.run(ort::inputs!["input" => value])?;
        let (_, data) = outputs[0].try_extract_tensor::<f32>()?;

        let mut embedding = data.to_vec();
        let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 1e-12 {
            for v in &mut embedding {
                *v /= norm;
            }
        }
        Ok(embedding)
    }
}

impl FeatureExtractor for OnnxExtractor {
    fn extract(&mut self, frame: &Frame, boxes: &[[f32; 4]]) -> Result<Vec<Vec<f32>>> {
        let mut features = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let input = self.preprocess(frame, bbox);
            features.push(self.embed(&input)?);
        }
        Ok(features)
    }
}

/// Clamp a TLWH box to the frame and copy the pixels out. Degenerate boxes
/// collapse to a single pixel so downstream resizing stays well-defined.
fn crop_rgb(frame: &Frame, bbox: &[f32; 4]) -> Frame {
    let x0 = (bbox[0].max(0.0) as usize).min(frame.width.saturating_sub(1));
    let y0 = (bbox[1].max(0.0) as usize).min(frame.height.saturating_sub(1));
    let x1 = ((bbox[0] + bbox[2]).max(0.0) as usize).clamp(x0 + 1, frame.width.max(x0 + 1));
    let y1 = ((bbox[1] + bbox[3]).max(0.0) as usize).clamp(y0 + 1, frame.height.max(y0 + 1));
    let (w, h) = (x1 - x0, y1 - y0);

    let mut data = Vec::with_capacity(w * h * 3);
    for y in y0..y1 {
        let row = (y * frame.width + x0) * 3;
        data.extend_from_slice(&frame.data[row..row + w * 3]);
    }
    Frame {
        data,
        width: w,
        height: h,
    }
}
