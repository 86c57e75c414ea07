//! BlazeFace detectors, as used by MediaPipe's face detection.
//!
//! Both variants output regressors `[1, A, 16]` (box center offset and size followed by six
//! keypoints) and logits `[1, A, 1]` for `A` fixed anchors. Frames are letterboxed into the
//! square network input so faces keep their aspect ratio.
use std::path::Path;

use common::{
    detection::{BoundingBox, Detection, DetectionResult},
    models::DetectorKind,
};
use image::{Rgb, RgbImage};
use tract_onnx::prelude::*;

use super::{load_onnx_model, non_maximum_suppression, DetectionRuntimeError, FaceDetector, NnModel};

/// Confidence used when the detector is not configured to follow the user threshold.
pub const DEFAULT_CONFIDENCE: f32 = 0.5;

/// Minimum IoU for two detections to be considered the same face.
const MAX_IOU: f32 = 0.3;

/// Logits are clipped to this range before the sigmoid.
const LOGIT_CLIP: f32 = 100.0;

const REGRESSOR_LEN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlazeVariant {
    ShortRange,
    FullRangeSparse,
}

impl BlazeVariant {
    pub fn input_size(&self) -> u32 {
        match self {
            BlazeVariant::ShortRange => 128,
            BlazeVariant::FullRangeSparse => 192,
        }
    }

    pub fn asset_name(&self) -> &'static str {
        match self {
            BlazeVariant::ShortRange => "blaze_face_short_range.onnx",
            BlazeVariant::FullRangeSparse => "face_detection_full_range_sparse.onnx",
        }
    }

    /// `(stride, anchors per cell)` of the feature maps.
    fn layers(&self) -> &'static [(u32, usize)] {
        match self {
            BlazeVariant::ShortRange => &[(8, 2), (16, 6)],
            BlazeVariant::FullRangeSparse => &[(4, 1)],
        }
    }

    /// Anchor centers in normalized input coordinates.
    pub fn anchors(&self) -> Vec<[f32; 2]> {
        let input_size = self.input_size();
        let mut anchors = Vec::new();

        for &(stride, per_cell) in self.layers() {
            let grid_size = input_size / stride;
            for y in 0..grid_size {
                for x in 0..grid_size {
                    let cx = (x as f32 + 0.5) / grid_size as f32;
                    let cy = (y as f32 + 0.5) / grid_size as f32;
                    anchors.extend(std::iter::repeat([cx, cy]).take(per_cell));
                }
            }
        }

        anchors
    }
}

/// Placement of a frame inside the square network input.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    pub(crate) fn new((width, height): (u32, u32), input_size: u32) -> Self {
        let scale = input_size as f32 / width.max(height).max(1) as f32;
        Self {
            scale,
            pad_x: (input_size as f32 - width as f32 * scale) / 2.0,
            pad_y: (input_size as f32 - height as f32 * scale) / 2.0,
        }
    }

    /// Map a point in network input pixels back to frame pixels.
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

pub struct BlazeFaceModel {
    model: NnModel,
    kind: DetectorKind,
    variant: BlazeVariant,
    anchors: Vec<[f32; 2]>,
    follow_threshold: bool,
}

impl BlazeFaceModel {
    /// Load a BlazeFace model.
    ///
    /// With `follow_threshold` unset the detector ignores the user threshold and keeps
    /// [`DEFAULT_CONFIDENCE`].
    pub fn new(
        kind: DetectorKind,
        variant: BlazeVariant,
        model_path: &Path,
        follow_threshold: bool,
    ) -> TractResult<Self> {
        let size = variant.input_size();
        let model = load_onnx_model(model_path, size, size)?;
        log::info!(
            "Loaded {} from {} ({}x{})",
            kind,
            model_path.display(),
            size,
            size
        );

        Ok(Self {
            model,
            kind,
            variant,
            anchors: variant.anchors(),
            follow_threshold,
        })
    }

    /// Letterbox the frame into the square input, normalized to [-1, 1] in NCHW.
    fn preproc(&self, input: &RgbImage) -> (Tensor, Letterbox) {
        let size = self.variant.input_size();
        let letterbox = Letterbox::new(input.dimensions(), size);

        let scaled_width = ((input.width() as f32 * letterbox.scale).round() as u32).clamp(1, size);
        let scaled_height =
            ((input.height() as f32 * letterbox.scale).round() as u32).clamp(1, size);
        let resized = image::imageops::resize(
            input,
            scaled_width,
            scaled_height,
            image::imageops::FilterType::Triangle,
        );

        let mut canvas = RgbImage::from_pixel(size, size, Rgb([0, 0, 0]));
        image::imageops::overlay(
            &mut canvas,
            &resized,
            letterbox.pad_x.round() as i64,
            letterbox.pad_y.round() as i64,
        );

        let tensor = tract_ndarray::Array4::from_shape_fn(
            (1, 3, size as usize, size as usize),
            |(_, c, y, x)| canvas[(x as _, y as _)][c] as f32 / 127.5 - 1.0,
        )
        .into();

        (tensor, letterbox)
    }

    fn threshold(&self, min_confidence: f32) -> f32 {
        match self.follow_threshold {
            true => min_confidence,
            false => DEFAULT_CONFIDENCE,
        }
    }
}

impl FaceDetector for BlazeFaceModel {
    fn kind(&self) -> DetectorKind {
        self.kind
    }

    fn supports_threshold(&self) -> bool {
        self.follow_threshold
    }

    fn draws_overlay(&self) -> bool {
        false
    }

    fn detect(
        &self,
        frame: &RgbImage,
        min_confidence: f32,
    ) -> Result<DetectionResult, DetectionRuntimeError> {
        let (input, letterbox) = self.preproc(frame);
        let raw_nn_out = self.model.run(tvec!(input.into()))?;

        // Output order differs between conversions, so tell them apart by their last dimension
        let mut regressors = None;
        let mut logits = None;
        for output in raw_nn_out.iter() {
            match output.shape().last() {
                Some(&REGRESSOR_LEN) => regressors = Some(output),
                Some(&1) => logits = Some(output),
                _ => (),
            }
        }
        let (regressors, logits) = match (regressors, logits) {
            (Some(regressors), Some(logits)) => (regressors, logits),
            _ => {
                return Err(DetectionRuntimeError::UnexpectedOutput(format!(
                    "output shapes {:?}",
                    raw_nn_out.iter().map(|o| o.shape().to_vec()).collect::<Vec<_>>()
                )))
            }
        };

        let regressors: Vec<f32> = regressors.to_array_view::<f32>()?.iter().cloned().collect();
        let logits: Vec<f32> = logits.to_array_view::<f32>()?.iter().cloned().collect();
        if logits.len() != self.anchors.len() || regressors.len() != logits.len() * REGRESSOR_LEN {
            return Err(DetectionRuntimeError::UnexpectedOutput(format!(
                "{} logits and {} regressor values for {} anchors",
                logits.len(),
                regressors.len(),
                self.anchors.len()
            )));
        }

        let detections = decode_blazeface(
            &regressors,
            &logits,
            &self.anchors,
            self.variant.input_size(),
            self.threshold(min_confidence),
            &letterbox,
            frame.dimensions(),
        );

        Ok(DetectionResult::new(detections))
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Decode anchor relative regressors into faces in frame pixel coordinates.
pub(crate) fn decode_blazeface(
    regressors: &[f32],
    logits: &[f32],
    anchors: &[[f32; 2]],
    input_size: u32,
    threshold: f32,
    letterbox: &Letterbox,
    (frame_width, frame_height): (u32, u32),
) -> Vec<Detection> {
    let size = input_size as f32;
    let (frame_width, frame_height) = (frame_width as f32, frame_height as f32);

    let candidates = logits
        .iter()
        .zip(anchors.iter())
        .zip(regressors.chunks_exact(REGRESSOR_LEN))
        .filter_map(|((&logit, anchor), reg)| {
            let score = sigmoid(logit.clamp(-LOGIT_CLIP, LOGIT_CLIP));
            if score < threshold {
                return None;
            }

            // Center and size in input pixels
            let cx = anchor[0] * size + reg[0];
            let cy = anchor[1] * size + reg[1];
            let (w, h) = (reg[2], reg[3]);

            let (x_tl, y_tl) = letterbox.to_frame(cx - w / 2.0, cy - h / 2.0);
            let (x_br, y_br) = letterbox.to_frame(cx + w / 2.0, cy + h / 2.0);

            Some(Detection {
                bbox: BoundingBox::from_corners(
                    x_tl.clamp(0.0, frame_width),
                    y_tl.clamp(0.0, frame_height),
                    x_br.clamp(0.0, frame_width),
                    y_br.clamp(0.0, frame_height),
                ),
                score,
                label: None,
            })
        })
        .collect();

    non_maximum_suppression(candidates, MAX_IOU)
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn anchor_counts_match_models() {
        assert_eq!(BlazeVariant::ShortRange.anchors().len(), 896);
        assert_eq!(BlazeVariant::FullRangeSparse.anchors().len(), 2304);
    }

    #[test]
    fn anchors_in_unit_range() {
        for anchor in BlazeVariant::ShortRange.anchors() {
            assert!(anchor[0] > 0.0 && anchor[0] < 1.0);
            assert!(anchor[1] > 0.0 && anchor[1] < 1.0);
        }
    }

    #[test]
    fn sigmoid_is_centered() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(10.0) > 0.999);
        assert!(sigmoid(-10.0) < 0.001);
    }

    #[test]
    fn letterbox_pads_the_short_side() {
        let letterbox = Letterbox::new((640, 360), 128);
        assert!((letterbox.scale - 0.2).abs() < 1e-6);
        assert_eq!(letterbox.pad_x, 0.0);
        assert!((letterbox.pad_y - 28.0).abs() < 1e-4);

        let (x, y) = letterbox.to_frame(64.0, 64.0);
        assert!((x - 320.0).abs() < 1e-3);
        assert!((y - 180.0).abs() < 1e-3);
    }

    #[test]
    fn decodes_single_confident_anchor() {
        let anchors = vec![[0.5, 0.5], [0.25, 0.25]];
        let mut regressors = vec![0.0; 2 * REGRESSOR_LEN];
        // Face of 32x32 input pixels centered on the first anchor
        regressors[2] = 32.0;
        regressors[3] = 32.0;
        let logits = [4.0, -4.0];
        let letterbox = Letterbox::new((640, 360), 128);

        let faces = decode_blazeface(
            &regressors,
            &logits,
            &anchors,
            128,
            DEFAULT_CONFIDENCE,
            &letterbox,
            (640, 360),
        );

        assert_eq!(faces.len(), 1);
        let bbox = faces[0].bbox;
        assert!((bbox.x - 240.0).abs() < 1e-3);
        assert!((bbox.y - 100.0).abs() < 1e-3);
        assert!((bbox.width - 160.0).abs() < 1e-3);
        assert!((bbox.height - 160.0).abs() < 1e-3);
    }
}
