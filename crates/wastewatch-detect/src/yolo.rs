// wastewatch-detect/src/yolo.rs
// ONNX Runtime YOLO backend: letter-simple resize, one forward pass,
// argmax class decode, NMS.

use std::path::Path;

use log::debug;
use ndarray::Array4;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;

use opencv::core::{Mat, Size};
use opencv::imgproc;
use opencv::prelude::*;

use wastewatch_camera::Frame;

use crate::{DetectError, Detector, RawDetection, Result, CLASS_NAMES};

/// Network input edge (square).
const INPUT_SIZE: i32 = 640;

/// Permissive floor applied during decode; the session applies the
/// caller's real threshold afterwards.
const CONF_FLOOR: f32 = 0.05;

const IOU_THRESHOLD: f32 = 0.45;
const MAX_DETECTIONS: usize = 300;

/// ONNX-Runtime-backed YOLO detector over BGR frames.
pub struct OrtYolo {
    session: Session,
}

impl OrtYolo {
    /// Load and optimize the model.  A missing file and a failed load
    /// are distinct, construction-fatal errors.
    pub fn load(model_path: impl AsRef<Path>) -> Result<Self> {
        let model_path = model_path.as_ref();
        if !model_path.exists() {
            return Err(DetectError::ModelNotFound(model_path.to_path_buf()));
        }
        let session = Session::builder()
            .map_err(DetectError::ModelLoad)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(DetectError::ModelLoad)?
            .commit_from_file(model_path)
            .map_err(DetectError::ModelLoad)?;
        debug!("loaded detection model from {}", model_path.display());
        Ok(Self { session })
    }

    /// BGR frame → RGB f32 CHW tensor, resized to the network input.
    fn input_tensor(frame: &Frame) -> Result<Array4<f32>> {
        let mat = frame.to_mat().map_err(DetectError::Camera)?;
        let mut rgb = Mat::default();
        imgproc::cvt_color(&mat, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
        let mut resized = Mat::default();
        imgproc::resize(
            &rgb,
            &mut resized,
            Size::new(INPUT_SIZE, INPUT_SIZE),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        let size = INPUT_SIZE as usize;
        let bytes = resized.data_bytes()?;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for y in 0..size {
            for x in 0..size {
                let base = (y * size + x) * 3;
                for c in 0..3 {
                    tensor[(0, c, y, x)] = bytes[base + c] as f32 / 255.0;
                }
            }
        }
        Ok(tensor)
    }
}

impl Detector for OrtYolo {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<RawDetection>> {
        let tensor = Self::input_tensor(frame)?;
        let input = ort::value::Value::from_array(tensor)?;
        let outputs = self.session.run(ort::inputs![input])?;

        let output = outputs
            .get("output0")
            .or_else(|| outputs.get("output"))
            .ok_or_else(|| DetectError::InvalidOutput("no output0/output tensor".into()))?;
        let (shape, data) = output.try_extract_tensor::<f32>()?;

        // Expect [1, 4 + classes, anchors].
        let rows = 4 + CLASS_NAMES.len();
        if shape.len() != 3 || shape[0] != 1 || shape[1] != rows as i64 {
            return Err(DetectError::InvalidOutput(format!(
                "expected [1, {rows}, N], got {shape:?}"
            )));
        }
        let anchors = shape[2] as usize;
        let at = |row: usize, col: usize| data[row * anchors + col];

        let scale_x = frame.width as f32 / INPUT_SIZE as f32;
        let scale_y = frame.height as f32 / INPUT_SIZE as f32;

        let mut candidates = Vec::new();
        for j in 0..anchors {
            let (class_id, confidence) = (0..CLASS_NAMES.len())
                .map(|c| (c, at(4 + c, j)))
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .unwrap_or((0, 0.0));
            if confidence < CONF_FLOOR {
                continue;
            }
            let xc = at(0, j);
            let yc = at(1, j);
            let w = at(2, j);
            let h = at(3, j);
            candidates.push(RawDetection {
                class_id,
                confidence,
                bbox: [
                    (xc - w / 2.0) * scale_x,
                    (yc - h / 2.0) * scale_y,
                    (xc + w / 2.0) * scale_x,
                    (yc + h / 2.0) * scale_y,
                ],
            });
        }

        Ok(non_max_suppression(candidates, IOU_THRESHOLD))
    }
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);
    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    inter / (area_a + area_b - inter + 1e-6)
}

fn non_max_suppression(mut dets: Vec<RawDetection>, iou_thr: f32) -> Vec<RawDetection> {
    dets.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<RawDetection> = Vec::with_capacity(dets.len());
    'outer: for d in dets {
        for k in &keep {
            if iou(&d.bbox, &k.bbox) > iou_thr {
                continue 'outer;
            }
        }
        keep.push(d);
        if keep.len() >= MAX_DETECTIONS {
            break;
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(confidence: f32, bbox: [f32; 4]) -> RawDetection {
        RawDetection {
            class_id: 0,
            confidence,
            bbox,
        }
    }

    #[test]
    fn nms_drops_overlapping_lower_confidence_boxes() {
        let kept = non_max_suppression(
            vec![
                det(0.9, [10.0, 10.0, 50.0, 50.0]),
                det(0.6, [12.0, 12.0, 52.0, 52.0]),
                det(0.8, [200.0, 200.0, 240.0, 240.0]),
            ],
            0.45,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.8);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        assert_eq!(
            iou(&[0.0, 0.0, 10.0, 10.0], &[20.0, 20.0, 30.0, 30.0]),
            0.0
        );
    }

    #[test]
    fn missing_model_is_a_typed_error() {
        match OrtYolo::load("/definitely/not/here.onnx") {
            Err(DetectError::ModelNotFound(path)) => {
                assert!(path.ends_with("here.onnx"));
            }
            other => panic!("expected ModelNotFound, got {other:?}"),
        }
    }
}
