//! Face detection backends running ONNX models with tract.
//!
//! Every [`DetectorKind`] maps to one implementation of [`FaceDetector`]. The poller only talks to
//! that trait, so adding a detector never touches the pipeline.
use std::path::Path;

use common::{
    detection::{BoundingBox, Detection, DetectionResult},
    models::DetectorKind,
};
use image::RgbImage;
use tract_onnx::prelude::*;

pub mod blazeface;
pub mod combined;
pub mod ultraface;

pub use blazeface::{BlazeFaceModel, BlazeVariant};
pub use combined::CombinedDetector;
pub use ultraface::{UltrafaceModel, UltrafaceVariant};

pub(crate) type NnModel =
    SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// A backend failed while running on one frame. Never fatal for the polling loop.
#[derive(Debug, thiserror::Error)]
pub enum DetectionRuntimeError {
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("unexpected model output: {0}")]
    UnexpectedOutput(String),
    #[error("failed to decode frame: {0}")]
    Decode(String),
}

impl From<TractError> for DetectionRuntimeError {
    fn from(err: TractError) -> Self {
        DetectionRuntimeError::Inference(format!("{err:#}"))
    }
}

/// Capability interface of a loaded face detector.
pub trait FaceDetector: Send + Sync {
    fn kind(&self) -> DetectorKind;

    /// Whether `min_confidence` passed to [`FaceDetector::detect`] has any effect.
    fn supports_threshold(&self) -> bool;

    /// Whether bounding boxes of this detector are drawn onto the overlay.
    fn draws_overlay(&self) -> bool;

    /// Detect faces on a frame. Boxes are in pixel coordinates of `frame`.
    fn detect(
        &self,
        frame: &RgbImage,
        min_confidence: f32,
    ) -> Result<DetectionResult, DetectionRuntimeError>;
}

/// Load an ONNX model with a fixed NCHW float input shape.
pub(crate) fn load_onnx_model(path: &Path, width: u32, height: u32) -> TractResult<NnModel> {
    let input_fact = InferenceFact::dt_shape(
        f32::datum_type(),
        tvec!(1, 3, height as usize, width as usize),
    );
    tract_onnx::onnx()
        .model_for_path(path)?
        .with_input_fact(0, input_fact)?
        .into_optimized()?
        .into_runnable()
}

/// Run non-maximum-suppression on candidate detections.
///
/// Start with the most confident detection and iterate over all others in the order of sinking
/// confidence. A candidate is kept only if its IoU with every already selected detection is at
/// most `max_iou`. Candidates are expected to be filtered by confidence already.
pub(crate) fn non_maximum_suppression(
    mut candidates: Vec<Detection>,
    max_iou: f32,
) -> Vec<Detection> {
    // Ascending, so that `pop` yields the most confident candidate
    candidates.sort_by(|a, b| a.score.total_cmp(&b.score));

    let mut selected: Vec<Detection> = Vec::new();
    'candidates: while let Some(candidate) = candidates.pop() {
        for chosen in selected.iter() {
            if iou(&candidate.bbox, &chosen.bbox) > max_iou {
                continue 'candidates;
            }
        }
        selected.push(candidate);
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
pub(crate) fn iou(bbox_a: &BoundingBox, bbox_b: &BoundingBox) -> f32 {
    // If the boxes do not overlap, the overlap box has an inverted corner and zero area
    let overlap = BoundingBox::from_corners(
        f32::max(bbox_a.x, bbox_b.x),
        f32::max(bbox_a.y, bbox_b.y),
        f32::min(bbox_a.x + bbox_a.width, bbox_b.x + bbox_b.width),
        f32::min(bbox_a.y + bbox_a.height, bbox_b.y + bbox_b.height),
    );

    let overlap_area = overlap.area();

    overlap_area / (bbox_a.area() + bbox_b.area() - overlap_area + EPS)
}

#[cfg(test)]
mod test {

    use super::*;

    fn detection(x: f32, y: f32, size: f32, score: f32) -> Detection {
        Detection {
            bbox: BoundingBox {
                x,
                y,
                width: size,
                height: size,
            },
            score,
            label: None,
        }
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = detection(0.0, 0.0, 10.0, 1.0).bbox;
        let b = detection(20.0, 20.0, 10.0, 1.0).bbox;
        assert!((iou(&a, &a) - 1.0).abs() < 1e-5);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = detection(0.0, 0.0, 10.0, 1.0).bbox;
        let b = BoundingBox {
            x: 5.0,
            y: 0.0,
            width: 10.0,
            height: 10.0,
        };
        // 50 overlap / 150 union
        assert!((iou(&a, &b) - 1.0 / 3.0).abs() < 1e-4);
    }

    #[test]
    fn nms_keeps_most_confident_of_overlapping() {
        let candidates = vec![
            detection(0.0, 0.0, 10.0, 0.6),
            detection(1.0, 1.0, 10.0, 0.9),
            detection(50.0, 50.0, 10.0, 0.7),
        ];

        let selected = non_maximum_suppression(candidates, 0.5);

        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].score, 0.9);
        assert_eq!(selected[1].score, 0.7);
    }

    #[test]
    fn nms_of_nothing_is_nothing() {
        assert!(non_maximum_suppression(vec![], 0.5).is_empty());
    }
}
