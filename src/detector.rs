// src/detector.rs

use crate::types::Frame;
use anyhow::{bail, Context, Result};
use ort::session::{builder::GraphOptimizationLevel, Session};
use tracing::{debug, info};

const YOLO_INPUT_SIZE: usize = 640;
const YOLO_CLASSES: usize = 80;
const YOLO_PREDICTIONS: usize = 8400;
const NMS_IOU_THRESHOLD: f32 = 0.45;

/// One detection in source image coordinates, TLWH.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub class_id: usize,
    /// Appearance embedding, attached by the camera worker after re-id.
    pub feature: Option<Vec<f32>>,
}

/// Object detector contract: RGB frame in, raw detections out. The camera
/// worker applies the confidence threshold and class allow-list.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;
}

/// YOLOv8-style ONNX detector.
pub struct YoloDetector {
    session: Session,
    conf_floor: f32,
}

impl YoloDetector {
    pub fn new(model_path: &str, conf_floor: f32) -> Result<Self> {
        info!("Loading detection model: {}", model_path);

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(model_path)
            .context("failed to load detection model")?;

        info!("✓ Detector initialized");
        Ok(Self {
            session,
            conf_floor,
        })
    }

    fn preprocess(&self, frame: &Frame) -> (Vec<f32>, f32, f32, f32) {
        let target = YOLO_INPUT_SIZE;

        // Letterbox: fit inside target x target keeping aspect ratio.
        let scale =
            (target as f32 / frame.width as f32).min(target as f32 / frame.height as f32);
        let scaled_w = (frame.width as f32 * scale) as usize;
        let scaled_h = (frame.height as f32 * scale) as usize;
        let pad_x = (target - scaled_w) as f32 / 2.0;
        let pad_y = (target - scaled_h) as f32 / 2.0;

        let resized = resize_bilinear(&frame.data, frame.width, frame.height, scaled_w, scaled_h);

        let mut canvas = vec![114u8; target * target * 3];
        for y in 0..scaled_h {
            for x in 0..scaled_w {
                let src_idx = (y * scaled_w + x) * 3;
                let dst_idx = ((y + pad_y as usize) * target + x + pad_x as usize) * 3;
                canvas[dst_idx..dst_idx + 3].copy_from_slice(&resized[src_idx..src_idx + 3]);
            }
        }

        // [0, 255] -> [0, 1], HWC -> CHW
        let mut input = vec![0.0f32; 3 * target * target];
        for c in 0..3 {
            for h in 0..target {
                for w in 0..target {
                    input[c * target * target + h * target + w] =
                        canvas[(h * target + w) * 3 + c] as f32 / 255.0;
                }
            }
        }

        (input, scale, pad_x, pad_y)
    }

    fn infer(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let shape = [1, 3, YOLO_INPUT_SIZE, YOLO_INPUT_SIZE];
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), input.to_vec().into_boxed_slice()))?;

        let outputs = self.session.run(ort::inputs!["images" => input_value])?;
        let (_, data) = outputs[0].try_extract_tensor::<f32>()?;
        Ok(data.to_vec())
    }
}

impl Detector for YoloDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let (input, scale, pad_x, pad_y) = self.preprocess(frame);
        let output = self.infer(&input)?;
        let detections = decode_output(&output, self.conf_floor, scale, pad_x, pad_y)?;
        debug!("detected {} objects", detections.len());
        Ok(detections)
    }
}

/// Decode a YOLOv8 `[1, 4 + classes, predictions]` output buffer into
/// boxes above the confidence floor. A model exporting any other layout
/// is rejected up front instead of being misread.
fn decode_output(
    output: &[f32],
    conf_floor: f32,
    scale: f32,
    pad_x: f32,
    pad_y: f32,
) -> Result<Vec<Detection>> {
    let expected = (4 + YOLO_CLASSES) * YOLO_PREDICTIONS;
    if output.len() != expected {
        bail!(
            "detector output has {} values, expected {} for [1, {}, {}]",
            output.len(),
            expected,
            4 + YOLO_CLASSES,
            YOLO_PREDICTIONS
        );
    }

    let mut detections = Vec::new();
    for i in 0..YOLO_PREDICTIONS {
        let cx = output[i];
        let cy = output[YOLO_PREDICTIONS + i];
        let w = output[YOLO_PREDICTIONS * 2 + i];
        let h = output[YOLO_PREDICTIONS * 3 + i];

        let mut max_conf = 0.0f32;
        let mut best_class = 0;
        for c in 0..YOLO_CLASSES {
            let conf = output[YOLO_PREDICTIONS * (4 + c) + i];
            if conf > max_conf {
                max_conf = conf;
                best_class = c;
            }
        }

        if max_conf < conf_floor {
            continue;
        }

        // Undo the letterbox transform, convert to TLWH.
        let x = (cx - w / 2.0 - pad_x) / scale;
        let y = (cy - h / 2.0 - pad_y) / scale;

        detections.push(Detection {
            bbox: [x, y, w / scale, h / scale],
            confidence: max_conf,
            class_id: best_class,
            feature: None,
        });
    }

    Ok(nms(detections, NMS_IOU_THRESHOLD))
}

pub(crate) fn resize_bilinear(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_h * dst_w * 3];
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        return dst;
    }
    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;

    for dy in 0..dst_h {
        for dx in 0..dst_w {
            let sx = dx as f32 * x_ratio;
            let sy = dy as f32 * y_ratio;
            let sx0 = sx.floor() as usize;
            let sy0 = sy.floor() as usize;
            let sx1 = (sx0 + 1).min(src_w - 1);
            let sy1 = (sy0 + 1).min(src_h - 1);
            let fx = sx - sx0 as f32;
            let fy = sy - sy0 as f32;

            for c in 0..3 {
                let p00 = src[(sy0 * src_w + sx0) * 3 + c] as f32;
                let p10 = src[(sy0 * src_w + sx1) * 3 + c] as f32;
                let p01 = src[(sy1 * src_w + sx0) * 3 + c] as f32;
                let p11 = src[(sy1 * src_w + sx1) * 3 + c] as f32;

                let val = p00 * (1.0 - fx) * (1.0 - fy)
                    + p10 * fx * (1.0 - fy)
                    + p01 * (1.0 - fx) * fy
                    + p11 * fx * fy;

                dst[(dy * dst_w + dx) * 3 + c] = val.round() as u8;
            }
        }
    }
    dst
}

fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    while !detections.is_empty() {
        let current = detections.remove(0);
        detections.retain(|det| crate::track::iou_tlwh(&current.bbox, &det.bbox) < iou_threshold);
        keep.push(current);
    }
    keep
}
