//! Ultraface detectors, used for the `tiny` and `ssd-mobilenet` selections.
//!
//! The network outputs two tensors:
//! - confidences `[1, N, 2]` with background/face probabilities per prior box
//! - boxes `[1, N, 4]` as normalized `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`
use std::path::Path;

use common::{
    detection::{BoundingBox, Detection, DetectionResult},
    models::DetectorKind,
};
use image::RgbImage;
use ndarray::s;
use tract_onnx::prelude::*;

use super::{load_onnx_model, non_maximum_suppression, DetectionRuntimeError, FaceDetector, NnModel};

/// Maximum overlap between two faces before the less confident one is dropped.
const MAX_IOU: f32 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UltrafaceVariant {
    W320H240,
    W640H480,
}

impl UltrafaceVariant {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            UltrafaceVariant::W320H240 => (320, 240),
            UltrafaceVariant::W640H480 => (640, 480),
        }
    }

    pub fn asset_name(&self) -> &'static str {
        match self {
            UltrafaceVariant::W320H240 => "ultraface-RFB-320.onnx",
            UltrafaceVariant::W640H480 => "ultraface-RFB-640.onnx",
        }
    }
}

pub struct UltrafaceModel {
    model: NnModel,
    kind: DetectorKind,
    width: u32,
    height: u32,
}

impl UltrafaceModel {
    pub fn new(kind: DetectorKind, variant: UltrafaceVariant, model_path: &Path) -> TractResult<Self> {
        let (width, height) = variant.dimensions();
        let model = load_onnx_model(model_path, width, height)?;
        log::info!(
            "Loaded {} from {} ({}x{})",
            kind,
            model_path.display(),
            width,
            height
        );

        Ok(Self {
            model,
            kind,
            width,
            height,
        })
    }

    fn preproc(&self, input: &RgbImage) -> Tensor {
        let resized: RgbImage = image::imageops::resize(
            input,
            self.width,
            self.height,
            image::imageops::FilterType::Triangle,
        );

        tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, c, y, x)| {
                // Note: Mean/std are from MobileNet, not from Ultraface, but work well
                let mean = [0.485, 0.456, 0.406][c];
                let std = [0.229, 0.224, 0.225][c];
                (resized[(x as _, y as _)][c] as f32 / 255.0 - mean) / std
            },
        )
        .into()
    }

    fn postproc(
        &self,
        confidences: &Tensor,
        bboxes: &Tensor,
        min_confidence: f32,
        frame_dimensions: (u32, u32),
    ) -> Result<Vec<Detection>, DetectionRuntimeError> {
        let confidences = confidences.to_array_view::<f32>()?;
        if confidences.ndim() != 3 || confidences.shape()[2] != 2 {
            return Err(DetectionRuntimeError::UnexpectedOutput(format!(
                "confidences with shape {:?}",
                confidences.shape()
            )));
        }
        let confidences = confidences.slice(s![0, .., 1]).to_vec();

        let bboxes: Vec<f32> = bboxes.to_array_view::<f32>()?.iter().cloned().collect();
        let bboxes: Vec<[f32; 4]> = bboxes
            .chunks_exact(4)
            .map(|c| [c[0], c[1], c[2], c[3]])
            .collect();

        if bboxes.len() != confidences.len() {
            return Err(DetectionRuntimeError::UnexpectedOutput(format!(
                "{} boxes for {} confidences",
                bboxes.len(),
                confidences.len()
            )));
        }

        Ok(decode_ultraface(
            &confidences,
            &bboxes,
            min_confidence,
            frame_dimensions,
        ))
    }
}

impl FaceDetector for UltrafaceModel {
    fn kind(&self) -> DetectorKind {
        self.kind
    }

    fn supports_threshold(&self) -> bool {
        true
    }

    fn draws_overlay(&self) -> bool {
        true
    }

    fn detect(
        &self,
        frame: &RgbImage,
        min_confidence: f32,
    ) -> Result<DetectionResult, DetectionRuntimeError> {
        let input = self.preproc(frame);
        let raw_nn_out = self.model.run(tvec!(input.into()))?;
        if raw_nn_out.len() < 2 {
            return Err(DetectionRuntimeError::UnexpectedOutput(format!(
                "expected 2 outputs, got {}",
                raw_nn_out.len()
            )));
        }

        let detections = self.postproc(
            &raw_nn_out[0],
            &raw_nn_out[1],
            min_confidence,
            frame.dimensions(),
        )?;

        Ok(DetectionResult::new(detections))
    }
}

/// Turn raw prior boxes into faces in frame pixel coordinates.
pub(crate) fn decode_ultraface(
    confidences: &[f32],
    bboxes: &[[f32; 4]],
    min_confidence: f32,
    (width, height): (u32, u32),
) -> Vec<Detection> {
    let (width, height) = (width as f32, height as f32);

    let candidates: Vec<Detection> = confidences
        .iter()
        .zip(bboxes.iter())
        .filter(|(confidence, _)| **confidence > min_confidence)
        .map(|(confidence, bbox)| Detection {
            bbox: BoundingBox::from_corners(
                bbox[0].clamp(0.0, 1.0) * width,
                bbox[1].clamp(0.0, 1.0) * height,
                bbox[2].clamp(0.0, 1.0) * width,
                bbox[3].clamp(0.0, 1.0) * height,
            ),
            score: *confidence,
            label: None,
        })
        .collect();

    non_maximum_suppression(candidates, MAX_IOU)
}
