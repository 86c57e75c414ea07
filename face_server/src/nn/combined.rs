//! Tiny detector backed up by BlazeFace short range (`tiny-blaze`).
use common::{detection::DetectionResult, models::DetectorKind};
use image::RgbImage;

use super::{DetectionRuntimeError, FaceDetector};

pub struct CombinedDetector {
    tiny: Box<dyn FaceDetector>,
    blaze: Box<dyn FaceDetector>,
}

impl CombinedDetector {
    pub fn new(tiny: Box<dyn FaceDetector>, blaze: Box<dyn FaceDetector>) -> Self {
        Self { tiny, blaze }
    }
}

/// Number of faces reported when both detectors disagree.
///
/// BlazeFace can only raise the count to one, anything above comes from the tiny detector.
pub fn combined_count(tiny_count: usize, blaze_count: usize) -> usize {
    usize::max(usize::min(blaze_count, 1), tiny_count)
}

impl FaceDetector for CombinedDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::TinyBlaze
    }

    fn supports_threshold(&self) -> bool {
        self.tiny.supports_threshold() || self.blaze.supports_threshold()
    }

    fn draws_overlay(&self) -> bool {
        true
    }

    fn detect(
        &self,
        frame: &RgbImage,
        min_confidence: f32,
    ) -> Result<DetectionResult, DetectionRuntimeError> {
        let tiny = self.tiny.detect(frame, min_confidence)?;
        let blaze = self.blaze.detect(frame, min_confidence)?;
        log::debug!("Tiny faces: {}, blaze faces: {}", tiny.count, blaze.count);

        let count = combined_count(tiny.count, blaze.count);
        let detections = tiny
            .detections
            .into_iter()
            .map(|d| (d, "tiny"))
            .chain(blaze.detections.into_iter().map(|d| (d, "blaze")))
            .map(|(mut d, label)| {
                d.label = Some(label.to_owned());
                d
            })
            .collect();

        Ok(DetectionResult::with_count(detections, count))
    }
}

#[cfg(test)]
mod test {

    use common::detection::{BoundingBox, Detection};

    use super::*;

    struct FixedDetector {
        kind: DetectorKind,
        faces: usize,
    }

    impl FaceDetector for FixedDetector {
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
            _frame: &RgbImage,
            _min_confidence: f32,
        ) -> Result<DetectionResult, DetectionRuntimeError> {
            let face = Detection {
                bbox: BoundingBox::default(),
                score: 0.9,
                label: None,
            };
            Ok(DetectionResult::new(vec![face; self.faces]))
        }
    }

    fn combined(tiny: usize, blaze: usize) -> CombinedDetector {
        CombinedDetector::new(
            Box::new(FixedDetector {
                kind: DetectorKind::Tiny,
                faces: tiny,
            }),
            Box::new(FixedDetector {
                kind: DetectorKind::BlazeShort,
                faces: blaze,
            }),
        )
    }

    #[test]
    fn blaze_raises_count_to_at_most_one() {
        assert_eq!(combined_count(0, 0), 0);
        assert_eq!(combined_count(0, 1), 1);
        assert_eq!(combined_count(0, 3), 1);
        assert_eq!(combined_count(2, 3), 2);
        assert_eq!(combined_count(4, 0), 4);
    }

    #[test]
    fn detections_of_both_are_labelled() -> Result<(), DetectionRuntimeError> {
        let frame = RgbImage::new(8, 8);
        let result = combined(1, 2).detect(&frame, 0.5)?;

        assert_eq!(result.count, 1);
        assert_eq!(result.detections.len(), 3);
        assert_eq!(result.detections[0].label.as_deref(), Some("tiny"));
        assert_eq!(result.detections[2].label.as_deref(), Some("blaze"));

        Ok(())
    }
}
