// wastewatch-detect/src/lib.rs
// ============================================================
// Detection stage for WasteWatch
// Runs a YOLO-family ONNX network over processed camera frames,
// classifies hits into {organic, inorganic}, and keeps a bounded
// ring of recent detections plus running counters.
// ------------------------------------------------------------
// Public API
//   * OrtYolo::load(path)          – load the ONNX model
//   * DetectorSession::start(cam)  – bind to a camera and detect
//   * DetectorSession::stats()     – coherent counters + ring
//   * DetectorSession::render(f)   – annotated copy of a frame
// ============================================================

//! WasteWatch – detection layer
//!
//! A backend-agnostic [`Detector`] trait plus the concrete [`OrtYolo`]
//! implementation.  [`DetectorSession`] owns the throttled detection
//! loop: it reads the camera's processed frame slot, filters and
//! classifies raw model output, and records accepted detections under
//! a single lock so readers never observe a half-applied update.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use wastewatch_camera::{CameraError, CameraId, Frame};

mod overlay;
mod ring;
mod session;
mod yolo;

pub use overlay::render_detections;
pub use ring::{DetectionRing, Stats, StatsSnapshot, RING_CAPACITY};
pub use session::{DetectorSession, SessionPhase};
pub use yolo::OrtYolo;

/// Model taxonomy, index-aligned with the network's class ids.
pub const CLASS_NAMES: [&str; 6] = ["cardboard", "glass", "metal", "paper", "plastic", "trash"];

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("model not found at {0}")]
    ModelNotFound(PathBuf),
    #[error("failed to load model: {0}")]
    ModelLoad(#[source] ort::Error),
    #[error("model smoke test failed: {0}")]
    SmokeTest(String),
    #[error("camera {0} is not producing frames")]
    CameraNotReady(CameraId),
    #[error("confidence threshold {0} outside (0, 1]")]
    InvalidThreshold(f32),
    #[error("detection loop did not respond within the join budget")]
    LoopTimeout,
    #[error("inference error: {0}")]
    Inference(#[from] ort::Error),
    #[error("unexpected model output: {0}")]
    InvalidOutput(String),
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error("drawing error: {0}")]
    Draw(#[from] opencv::Error),
}

pub type Result<T> = std::result::Result<T, DetectError>;

/// Waste category every accepted detection is mapped into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WasteCategory {
    Organic,
    Inorganic,
}

impl WasteCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            WasteCategory::Organic => "organic",
            WasteCategory::Inorganic => "inorganic",
        }
    }
}

impl fmt::Display for WasteCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed label → category map.  `trash` is the catch-all the model was
/// trained with for organic refuse; everything else is recyclable
/// (inorganic) material.
pub fn classify(label: &str) -> Option<WasteCategory> {
    match label {
        "cardboard" | "glass" | "metal" | "paper" | "plastic" => Some(WasteCategory::Inorganic),
        "trash" => Some(WasteCategory::Organic),
        _ => None,
    }
}

/// Unfiltered model output: one candidate box in processed-frame pixel
/// coordinates.
#[derive(Debug, Clone, Copy)]
pub struct RawDetection {
    pub class_id: usize,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]`, may be out of bounds or degenerate.
    pub bbox: [f32; 4],
}

/// One accepted, classified detection.
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(rename = "class")]
    pub category: WasteCategory,
    #[serde(rename = "original_class")]
    pub original_label: &'static str,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]` pixel coordinates, x2 > x1, y2 > y1, inside
    /// the frame the detection was made on.
    pub bbox: [i32; 4],
}

/// Seam between the model backend and the session loop, so sessions are
/// testable without an ONNX runtime.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<RawDetection>>;
}

/// Confidence threshold validated at the boundary: (0, 1], inclusive
/// upper bound, and detections at exactly the threshold are accepted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Confidence(f32);

impl Confidence {
    pub fn new(value: f32) -> Result<Self> {
        if value > 0.0 && value <= 1.0 {
            Ok(Self(value))
        } else {
            Err(DetectError::InvalidThreshold(value))
        }
    }

    pub fn value(&self) -> f32 {
        self.0
    }
}

/// Filter and classify one raw detection against the session threshold
/// and the bounds of the frame it came from.  Returns `None` (with a
/// warning for unknown labels) for anything malformed; malformed model
/// output is never fatal.
pub fn validate(
    raw: &RawDetection,
    threshold: Confidence,
    frame_width: u32,
    frame_height: u32,
    timestamp: u64,
) -> Option<Detection> {
    if raw.confidence < threshold.value() {
        return None;
    }
    let label = match CLASS_NAMES.get(raw.class_id) {
        Some(label) => *label,
        None => {
            log::warn!("dropping detection with unknown class id {}", raw.class_id);
            return None;
        }
    };
    let category = match classify(label) {
        Some(category) => category,
        None => {
            log::warn!("dropping detection with unmapped label {label}");
            return None;
        }
    };
    let [x1, y1, x2, y2] = raw.bbox.map(|v| v.round() as i32);
    if x1 < 0 || y1 < 0 || x2 >= frame_width as i32 || y2 >= frame_height as i32 {
        log::warn!("dropping detection with out-of-bounds box [{x1},{y1},{x2},{y2}]");
        return None;
    }
    if x2 <= x1 || y2 <= y1 {
        log::warn!("dropping detection with degenerate box [{x1},{y1},{x2},{y2}]");
        return None;
    }
    Some(Detection {
        timestamp,
        category,
        original_label: label,
        confidence: raw.confidence,
        bbox: [x1, y1, x2, y2],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(class_id: usize, confidence: f32, bbox: [f32; 4]) -> RawDetection {
        RawDetection {
            class_id,
            confidence,
            bbox,
        }
    }

    fn accept(raw: &RawDetection) -> Option<Detection> {
        validate(raw, Confidence::new(0.5).unwrap(), 640, 480, 0)
    }

    #[test]
    fn label_map_covers_the_taxonomy() {
        assert_eq!(classify("cardboard"), Some(WasteCategory::Inorganic));
        assert_eq!(classify("glass"), Some(WasteCategory::Inorganic));
        assert_eq!(classify("metal"), Some(WasteCategory::Inorganic));
        assert_eq!(classify("paper"), Some(WasteCategory::Inorganic));
        assert_eq!(classify("plastic"), Some(WasteCategory::Inorganic));
        assert_eq!(classify("trash"), Some(WasteCategory::Organic));
        assert_eq!(classify("banana"), None);
    }

    #[test]
    fn threshold_is_an_inclusive_lower_bound() {
        assert!(accept(&raw(4, 0.5, [10.0, 10.0, 20.0, 20.0])).is_some());
        assert!(accept(&raw(4, 0.499, [10.0, 10.0, 20.0, 20.0])).is_none());
    }

    #[test]
    fn boxes_touching_the_edge_are_accepted() {
        // x2 == width - 1 is in bounds; x2 == width is not.
        assert!(accept(&raw(0, 0.9, [0.0, 0.0, 639.0, 479.0])).is_some());
        assert!(accept(&raw(0, 0.9, [0.0, 0.0, 640.0, 479.0])).is_none());
        assert!(accept(&raw(0, 0.9, [0.0, 0.0, 639.0, 480.0])).is_none());
    }

    #[test]
    fn degenerate_and_negative_boxes_are_dropped() {
        assert!(accept(&raw(0, 0.9, [20.0, 10.0, 20.0, 30.0])).is_none());
        assert!(accept(&raw(0, 0.9, [20.0, 30.0, 40.0, 30.0])).is_none());
        assert!(accept(&raw(0, 0.9, [-1.0, 0.0, 20.0, 20.0])).is_none());
    }

    #[test]
    fn unknown_class_ids_are_dropped() {
        assert!(accept(&raw(17, 0.9, [10.0, 10.0, 20.0, 20.0])).is_none());
    }

    #[test]
    fn accepted_detections_carry_label_and_category() {
        let det = accept(&raw(4, 0.8, [10.0, 10.0, 20.0, 20.0])).unwrap();
        assert_eq!(det.original_label, "plastic");
        assert_eq!(det.category, WasteCategory::Inorganic);
        assert_eq!(det.bbox, [10, 10, 20, 20]);
    }

    #[test]
    fn confidence_bounds() {
        assert!(Confidence::new(0.0).is_err());
        assert!(Confidence::new(-0.1).is_err());
        assert!(Confidence::new(1.01).is_err());
        assert!(Confidence::new(1.0).is_ok());
        assert!(Confidence::new(0.3).is_ok());
    }
}
