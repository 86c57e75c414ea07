//! Detection results published by the poller.
//!
use serde::{Deserialize, Serialize};

/// Axis aligned box in pixel coordinates, origin at the top left corner.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Build a box from top-left and bottom-right corners.
    ///
    /// Corners in the wrong order produce an empty box.
    pub fn from_corners(x_tl: f32, y_tl: f32, x_br: f32, y_br: f32) -> Self {
        Self {
            x: x_tl,
            y: y_tl,
            width: (x_br - x_tl).max(0.0),
            height: (y_br - y_tl).max(0.0),
        }
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Scale both axes, e.g. from native video to displayed size.
    pub fn scaled(&self, scale_x: f32, scale_y: f32) -> Self {
        Self {
            x: self.x * scale_x,
            y: self.y * scale_y,
            width: self.width * scale_x,
            height: self.height * scale_y,
        }
    }
}

/// One face reported by a detector.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub score: f32,
    /// Which detector produced the face, set by combined backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Detections of one tick. Replaces the result of the previous tick.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
    pub count: usize,
}

impl DetectionResult {
    pub fn new(detections: Vec<Detection>) -> Self {
        let count = detections.len();
        Self { detections, count }
    }

    /// Result with a count that differs from the number of boxes.
    pub fn with_count(detections: Vec<Detection>, count: usize) -> Self {
        Self { detections, count }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn label(&self) -> String {
        face_count_label(self.count)
    }
}

/// Readout shown to the user for a given face count.
pub fn face_count_label(count: usize) -> String {
    match count {
        0 => "No face is visible".to_owned(),
        1 => "1 face is visible".to_owned(),
        n => format!("{n} faces are visible"),
    }
}

#[cfg(test)]
mod test {

    use super::*;

    fn detection(score: f32) -> Detection {
        Detection {
            bbox: BoundingBox::from_corners(0.0, 0.0, 10.0, 10.0),
            score,
            label: None,
        }
    }

    #[test]
    fn labels_follow_count() {
        assert_eq!(DetectionResult::empty().label(), "No face is visible");
        assert_eq!(
            DetectionResult::new(vec![detection(0.9)]).label(),
            "1 face is visible"
        );
        assert_eq!(
            DetectionResult::new(vec![detection(0.9), detection(0.8), detection(0.7)]).label(),
            "3 faces are visible"
        );
    }

    #[test]
    fn inverted_corners_give_empty_box() {
        let bbox = BoundingBox::from_corners(10.0, 10.0, 5.0, 20.0);
        assert_eq!(bbox.width, 0.0);
        assert_eq!(bbox.area(), 0.0);
    }

    #[test]
    fn scaling_maps_native_to_display() {
        let bbox = BoundingBox {
            x: 64.0,
            y: 36.0,
            width: 128.0,
            height: 72.0,
        };
        let scaled = bbox.scaled(0.5, 2.0);
        assert_eq!(
            scaled,
            BoundingBox {
                x: 32.0,
                y: 72.0,
                width: 64.0,
                height: 144.0
            }
        );
    }
}
