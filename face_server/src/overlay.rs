//! Overlay with detection boxes, aligned to the video as displayed by the client.
//!
use std::io::Cursor;

use common::detection::{BoundingBox, DetectionResult};
use image::{ImageOutputFormat, Rgba, RgbaImage};
use imageproc::{
    drawing::{draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};
use rusttype::{Font, Scale};
use serde::{Deserialize, Serialize};

const BOX_COLOR: Rgba<u8> = Rgba([0, 255, 0, 255]);
const LABEL_SCALE: Scale = Scale { x: 16.0, y: 16.0 };

/// Size and position of the displayed video element in client pixels.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct DisplayGeometry {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub offset_x: i32,
    #[serde(default)]
    pub offset_y: i32,
}

impl DisplayGeometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            offset_x: 0,
            offset_y: 0,
        }
    }
}

/// Transparent raster drawn over the video.
#[derive(Clone, Debug)]
pub struct OverlaySurface {
    pub image: RgbaImage,
    pub offset: (i32, i32),
}

impl OverlaySurface {
    fn new(geometry: &DisplayGeometry) -> Self {
        Self {
            image: RgbaImage::new(geometry.width.max(1), geometry.height.max(1)),
            offset: (geometry.offset_x, geometry.offset_y),
        }
    }

    fn clear(&mut self) {
        self.image.pixels_mut().for_each(|p| *p = Rgba([0, 0, 0, 0]));
    }

    pub fn encode_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut buf = Cursor::new(Vec::new());
        self.image.write_to(&mut buf, ImageOutputFormat::Png)?;
        Ok(buf.into_inner())
    }
}

/// Owner of the single overlay surface.
pub struct OverlayRenderer {
    font: Option<Font<'static>>,
    geometry: DisplayGeometry,
    native: (u32, u32),
    draws_boxes: bool,
    surface: Option<OverlaySurface>,
    last: DetectionResult,
}

impl OverlayRenderer {
    pub fn new(font: Option<Font<'static>>, geometry: DisplayGeometry) -> Self {
        Self {
            font,
            geometry,
            native: (geometry.width, geometry.height),
            draws_boxes: false,
            surface: None,
            last: DetectionResult::empty(),
        }
    }

    /// Create a fresh surface for video of `native` size, disposing any previous one.
    pub fn attach(&mut self, native: (u32, u32), draws_boxes: bool) {
        if self.surface.is_some() {
            log::debug!("Replacing overlay surface");
        }
        self.native = native;
        self.draws_boxes = draws_boxes;
        self.last = DetectionResult::empty();
        self.surface = Some(OverlaySurface::new(&self.geometry));
    }

    pub fn detach(&mut self) {
        self.surface = None;
        self.last = DetectionResult::empty();
    }

    /// Follow a change of the displayed video size and redraw.
    pub fn resize(&mut self, geometry: DisplayGeometry) {
        let last = std::mem::take(&mut self.last);
        self.render(&last, geometry);
    }

    /// Draw `result` onto the surface, replacing whatever was drawn before.
    pub fn render(&mut self, result: &DetectionResult, geometry: DisplayGeometry) {
        if geometry != self.geometry {
            log::debug!(
                "Overlay geometry {}x{} at ({}, {})",
                geometry.width,
                geometry.height,
                geometry.offset_x,
                geometry.offset_y
            );
            self.geometry = geometry;
            if let Some(surface) = self.surface.as_mut() {
                *surface = OverlaySurface::new(&geometry);
            }
        }
        self.last = result.clone();

        let surface = match self.surface.as_mut() {
            Some(surface) => surface,
            None => return,
        };
        surface.clear();
        if !self.draws_boxes {
            return;
        }

        let scale_x = surface.image.width() as f32 / self.native.0.max(1) as f32;
        let scale_y = surface.image.height() as f32 / self.native.1.max(1) as f32;
        for detection in result.detections.iter() {
            let bbox = detection.bbox.scaled(scale_x, scale_y);
            draw_box(&mut surface.image, &bbox);
            if let Some(font) = &self.font {
                draw_text_mut(
                    &mut surface.image,
                    BOX_COLOR,
                    bbox.x as i32,
                    bbox.y as i32,
                    LABEL_SCALE,
                    font,
                    &format!("{:.2}%", detection.score * 100.0),
                );
            }
        }
    }

    pub fn geometry(&self) -> DisplayGeometry {
        self.geometry
    }

    pub fn surface(&self) -> Option<&OverlaySurface> {
        self.surface.as_ref()
    }

    /// The surface as PNG, or an empty one while detached.
    pub fn encode_png(&self) -> Result<Vec<u8>, image::ImageError> {
        match &self.surface {
            Some(surface) => surface.encode_png(),
            None => OverlaySurface::new(&self.geometry).encode_png(),
        }
    }
}

fn draw_box(image: &mut RgbaImage, bbox: &BoundingBox) {
    // Rect panics on zero sizes
    let width = bbox.width.round() as u32;
    let height = bbox.height.round() as u32;
    if width == 0 || height == 0 {
        return;
    }
    let rect = Rect::at(bbox.x as i32, bbox.y as i32).of_size(width, height);
    draw_hollow_rect_mut(image, rect, BOX_COLOR);
}

/// Load a TrueType font for score labels.
pub fn load_font(data: Vec<u8>) -> Option<Font<'static>> {
    Font::try_from_vec(data)
}
