// src/detector.rs

use crate::types::{DetectionBox, DetectionConfig};
use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::sync::Mutex;
use tracing::{debug, info};

const YOLO_INPUT_SIZE: usize = 640;

/// Opaque object-detection capability. Returns boxes in the coordinate frame
/// of the raster it was handed, filtered to `class_filter`.
pub trait DetectionModel: Send + Sync {
    fn invoke(&self, raster: &RgbImage, class_filter: &[usize]) -> Result<Vec<DetectionBox>>;
}

/// YOLO-family detector backed by an ONNX Runtime session. Serves both the
/// general vehicle model and the custom plate model; the class filter is the
/// caller's concern.
pub struct YoloDetector {
    session: Mutex<Session>,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl YoloDetector {
    pub fn new(model_path: &str, num_threads: usize, detection: &DetectionConfig) -> Result<Self> {
        info!("Loading detection model: {}", model_path);

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(num_threads)?
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load model {}", model_path))?;

        info!("✓ Detection model ready: {}", model_path);

        Ok(Self {
            session: Mutex::new(session),
            confidence_threshold: detection.confidence_threshold,
            iou_threshold: detection.iou_threshold,
        })
    }

    fn infer(&self, input: Vec<f32>) -> Result<(Vec<f32>, Vec<i64>)> {
        let shape = [1usize, 3, YOLO_INPUT_SIZE, YOLO_INPUT_SIZE];
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), input.into_boxed_slice()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("detection session lock poisoned"))?;
        let outputs = session.run(ort::inputs!["images" => input_value])?;
        let output = &outputs[0];
        let (out_shape, data) = output.try_extract_tensor::<f32>()?;

        Ok((data.to_vec(), out_shape.to_vec()))
    }
}

impl DetectionModel for YoloDetector {
    fn invoke(&self, raster: &RgbImage, class_filter: &[usize]) -> Result<Vec<DetectionBox>> {
        let (input, letterbox) = letterbox_input(raster, YOLO_INPUT_SIZE as u32);
        let (output, shape) = self.infer(input)?;

        let detections = parse_detections(
            &output,
            &shape,
            &letterbox,
            self.confidence_threshold,
            class_filter,
        );
        let detections = nms(detections, self.iou_threshold);

        let boxes = finalize_boxes(detections, raster.width(), raster.height());
        debug!("Detected {} regions", boxes.len());
        Ok(boxes)
    }
}

/// Letterbox geometry: scale applied to the source and the padding that
/// centers it on the square model canvas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

pub fn letterbox_geometry(src_w: u32, src_h: u32, target: u32) -> Letterbox {
    let scale = (target as f32 / src_w as f32).min(target as f32 / src_h as f32);
    let scaled_w = (src_w as f32 * scale) as u32;
    let scaled_h = (src_h as f32 * scale) as u32;
    Letterbox {
        scale,
        pad_x: (target - scaled_w) as f32 / 2.0,
        pad_y: (target - scaled_h) as f32 / 2.0,
    }
}

/// Resize into a gray-padded square canvas, normalize to [0, 1], HWC -> CHW.
fn letterbox_input(raster: &RgbImage, target: u32) -> (Vec<f32>, Letterbox) {
    let lb = letterbox_geometry(raster.width(), raster.height(), target);
    let scaled_w = ((raster.width() as f32 * lb.scale) as u32).max(1);
    let scaled_h = ((raster.height() as f32 * lb.scale) as u32).max(1);

    let resized = image::imageops::resize(
        raster,
        scaled_w,
        scaled_h,
        image::imageops::FilterType::Triangle,
    );

    let target = target as usize;
    let mut canvas = vec![114u8; target * target * 3];
    for (x, y, pixel) in resized.enumerate_pixels() {
        let dst_x = x as usize + lb.pad_x as usize;
        let dst_y = y as usize + lb.pad_y as usize;
        let idx = (dst_y * target + dst_x) * 3;
        canvas[idx] = pixel[0];
        canvas[idx + 1] = pixel[1];
        canvas[idx + 2] = pixel[2];
    }

    let mut input = vec![0.0f32; 3 * target * target];
    for c in 0..3 {
        for h in 0..target {
            for w in 0..target {
                let hwc_idx = (h * target + w) * 3 + c;
                let chw_idx = c * target * target + h * target + w;
                input[chw_idx] = canvas[hwc_idx] as f32 / 255.0;
            }
        }
    }

    (input, lb)
}

#[derive(Debug, Clone)]
struct RawDetection {
    bbox: [f32; 4],
    confidence: f32,
    class_id: usize,
}

/// Parse a YOLO output tensor of shape [1, 4 + num_classes, num_preds]
/// (center-format boxes) into corner-format detections in source coordinates.
fn parse_detections(
    output: &[f32],
    shape: &[i64],
    lb: &Letterbox,
    conf_thresh: f32,
    class_filter: &[usize],
) -> Vec<RawDetection> {
    if shape.len() != 3 || shape[1] < 5 {
        return Vec::new();
    }
    let attrs = shape[1] as usize;
    let preds = shape[2] as usize;
    let num_classes = attrs - 4;

    let mut detections = Vec::new();

    for i in 0..preds {
        let cx = output[i];
        let cy = output[preds + i];
        let w = output[preds * 2 + i];
        let h = output[preds * 3 + i];

        let mut max_conf = 0.0f32;
        let mut best_class = 0;
        for c in 0..num_classes {
            let conf = output[preds * (4 + c) + i];
            if conf > max_conf {
                max_conf = conf;
                best_class = c;
            }
        }

        if max_conf < conf_thresh || !class_filter.contains(&best_class) {
            continue;
        }

        // Center format to corners, then reverse the letterbox transform.
        let x1 = (cx - w / 2.0 - lb.pad_x) / lb.scale;
        let y1 = (cy - h / 2.0 - lb.pad_y) / lb.scale;
        let x2 = (cx + w / 2.0 - lb.pad_x) / lb.scale;
        let y2 = (cy + h / 2.0 - lb.pad_y) / lb.scale;

        detections.push(RawDetection {
            bbox: [x1, y1, x2, y2],
            confidence: max_conf,
            class_id: best_class,
        });
    }

    detections
}

fn nms(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    if detections.is_empty() {
        return detections;
    }

    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    while !detections.is_empty() {
        let current = detections.remove(0);
        detections.retain(|det| calculate_iou(&current.bbox, &det.bbox) < iou_threshold);
        keep.push(current);
    }

    keep
}

fn calculate_iou(box1: &[f32; 4], box2: &[f32; 4]) -> f32 {
    let x1 = box1[0].max(box2[0]);
    let y1 = box1[1].max(box2[1]);
    let x2 = box1[2].min(box2[2]);
    let y2 = box1[3].min(box2[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area1 = (box1[2] - box1[0]) * (box1[3] - box1[1]);
    let area2 = (box2[2] - box2[0]) * (box2[3] - box2[1]);
    let union = area1 + area2 - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Round to integers, clamp to the raster, drop degenerate boxes.
fn finalize_boxes(detections: Vec<RawDetection>, width: u32, height: u32) -> Vec<DetectionBox> {
    detections
        .into_iter()
        .map(|det| {
            DetectionBox {
                x1: det.bbox[0] as i32,
                y1: det.bbox[1] as i32,
                x2: det.bbox[2] as i32,
                y2: det.bbox[3] as i32,
                class_id: det.class_id,
                confidence: det.confidence,
            }
            .clamp_to(width, height)
        })
        .filter(|b| !b.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letterbox_geometry_wide_image() {
        let lb = letterbox_geometry(1280, 720, 640);
        assert!((lb.scale - 0.5).abs() < 1e-6);
        assert!((lb.pad_x - 0.0).abs() < 1e-6);
        assert!((lb.pad_y - 140.0).abs() < 1e-6);
    }

    #[test]
    fn test_letterbox_geometry_square_image() {
        let lb = letterbox_geometry(640, 640, 640);
        assert!((lb.scale - 1.0).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 0.0);
    }

    /// Build a [1, 4+classes, preds] tensor with one confident prediction.
    fn synthetic_output(
        preds: usize,
        classes: usize,
        slot: usize,
        bbox_cxcywh: [f32; 4],
        class_id: usize,
        conf: f32,
    ) -> Vec<f32> {
        let mut out = vec![0.0f32; (4 + classes) * preds];
        out[slot] = bbox_cxcywh[0];
        out[preds + slot] = bbox_cxcywh[1];
        out[preds * 2 + slot] = bbox_cxcywh[2];
        out[preds * 3 + slot] = bbox_cxcywh[3];
        out[preds * (4 + class_id) + slot] = conf;
        out
    }

    #[test]
    fn test_parse_detections_filters_by_class() {
        let lb = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let output = synthetic_output(100, 80, 7, [100.0, 100.0, 40.0, 20.0], 2, 0.9);
        let shape = [1i64, 84, 100];

        // class 2 (car) passes the vehicle filter
        let dets = parse_detections(&output, &shape, &lb, 0.4, &[2, 3, 5, 7]);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_id, 2);
        assert!((dets[0].bbox[0] - 80.0).abs() < 1e-4);
        assert!((dets[0].bbox[3] - 110.0).abs() < 1e-4);

        // but not a plate-only filter
        let dets = parse_detections(&output, &shape, &lb, 0.4, &[0]);
        assert!(dets.is_empty());
    }

    #[test]
    fn test_parse_detections_reverses_letterbox() {
        let lb = Letterbox {
            scale: 0.5,
            pad_x: 0.0,
            pad_y: 140.0,
        };
        let output = synthetic_output(10, 1, 0, [320.0, 300.0, 64.0, 32.0], 0, 0.8);
        let shape = [1i64, 5, 10];

        let dets = parse_detections(&output, &shape, &lb, 0.4, &[0]);
        assert_eq!(dets.len(), 1);
        // (320 - 32 - 0) / 0.5 = 576, (300 - 16 - 140) / 0.5 = 288
        assert!((dets[0].bbox[0] - 576.0).abs() < 1e-3);
        assert!((dets[0].bbox[1] - 288.0).abs() < 1e-3);
    }

    #[test]
    fn test_nms_suppresses_overlapping_boxes() {
        let dets = vec![
            RawDetection {
                bbox: [0.0, 0.0, 100.0, 100.0],
                confidence: 0.9,
                class_id: 2,
            },
            RawDetection {
                bbox: [5.0, 5.0, 105.0, 105.0],
                confidence: 0.8,
                class_id: 2,
            },
            RawDetection {
                bbox: [300.0, 300.0, 400.0, 400.0],
                confidence: 0.7,
                class_id: 2,
            },
        ];
        let kept = nms(dets, 0.45);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_finalize_drops_degenerate_boxes() {
        let dets = vec![RawDetection {
            bbox: [10.0, 10.0, 10.4, 50.0],
            confidence: 0.9,
            class_id: 2,
        }];
        assert!(finalize_boxes(dets, 640, 480).is_empty());
    }

    #[test]
    fn test_iou_disjoint_is_zero() {
        let a = [0.0, 0.0, 10.0, 10.0];
        let b = [20.0, 20.0, 30.0, 30.0];
        assert_eq!(calculate_iou(&a, &b), 0.0);
    }
}
