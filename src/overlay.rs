//! Detection overlay rendering and JPEG encoding.

use ab_glyph::{FontVec, PxScale};
use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, Rgb as Pixel, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;

use crate::detect::{BoundingBox, Detection};
use crate::frame::Frame;

const LABEL_SCALE: f32 = 16.0;
const TEXT_COLOR: Pixel<u8> = Pixel([0, 0, 0]);
const MAX_CORNER: i32 = 18;

/// Renders detection boxes, corner accents and label banners onto frames.
///
/// Label text needs a font; without one only the banner is drawn.
pub struct Overlay {
    font: Option<FontVec>,
    scale: PxScale,
}

impl Overlay {
    pub fn new() -> Self {
        Self {
            font: None,
            scale: PxScale::from(LABEL_SCALE),
        }
    }

    /// Load a TTF/OTF font for label text.
    pub fn with_font_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read font {}", path.display()))?;
        let font = FontVec::try_from_vec(bytes)
            .map_err(|e| anyhow!("invalid font {}: {}", path.display(), e))?;
        Ok(Self {
            font: Some(font),
            scale: PxScale::from(LABEL_SCALE),
        })
    }

    /// Working copy of `frame` with `detections` drawn on it.
    pub fn annotate(&self, frame: &Frame, detections: &[Detection]) -> Result<RgbImage> {
        let mut image = frame.to_image()?;
        self.render(&mut image, detections);
        Ok(image)
    }

    /// Draw detections in place. Boxes are clamped to the image; boxes that
    /// fall entirely outside are skipped.
    pub fn render(&self, image: &mut RgbImage, detections: &[Detection]) {
        let (width, height) = image.dimensions();
        for det in detections {
            let Some(b) = det.bbox.clamp_to(width, height) else {
                continue;
            };
            let color = Pixel([det.color.0, det.color.1, det.color.2]);
            draw_outline(image, b, color);
            draw_corners(image, b, color);
            self.draw_label(image, b, &det.caption(), color);
        }
    }

    fn text_extent(&self, text: &str) -> (i32, i32) {
        match &self.font {
            Some(font) => {
                let (w, h) = text_size(self.scale, font, text);
                (w as i32, h as i32)
            }
            None => (text.chars().count() as i32 * 7, 11),
        }
    }

    fn draw_label(&self, image: &mut RgbImage, b: BoundingBox, text: &str, color: Pixel<u8>) {
        let (tw, th) = self.text_extent(text);
        // Keep the banner inside the frame when the box touches the top edge.
        let ly = b.y1.max(th + 10);
        let banner = Rect::at(b.x1, ly - th - 8).of_size((tw + 10) as u32, (th + 8) as u32);
        draw_filled_rect_mut(image, banner, color);
        if let Some(font) = &self.font {
            draw_text_mut(image, TEXT_COLOR, b.x1 + 5, ly - th - 4, self.scale, font, text);
        }
    }
}

impl Default for Overlay {
    fn default() -> Self {
        Self::new()
    }
}

fn draw_outline(image: &mut RgbImage, b: BoundingBox, color: Pixel<u8>) {
    draw_hollow_rect_mut(image, rect(b.x1, b.y1, b.x2, b.y2), color);
    if b.width() > 2 && b.height() > 2 {
        draw_hollow_rect_mut(image, rect(b.x1 + 1, b.y1 + 1, b.x2 - 1, b.y2 - 1), color);
    }
}

fn draw_corners(image: &mut RgbImage, b: BoundingBox, color: Pixel<u8>) {
    let cl = MAX_CORNER.min(b.width() / 4).min(b.height() / 4);
    if cl <= 4 {
        return;
    }
    for (cx, cy, dx, dy) in [
        (b.x1, b.y1, 1, 1),
        (b.x2, b.y1, -1, 1),
        (b.x1, b.y2, 1, -1),
        (b.x2, b.y2, -1, -1),
    ] {
        let hx = cx + dx * cl;
        let vy = cy + dy * cl;
        draw_filled_rect_mut(image, rect(cx.min(hx), cy - 1, cx.max(hx), cy + 1), color);
        draw_filled_rect_mut(image, rect(cx - 1, cy.min(vy), cx + 1, cy.max(vy)), color);
    }
}

/// Inclusive corner-to-corner rectangle.
fn rect(x1: i32, y1: i32, x2: i32, y2: i32) -> Rect {
    Rect::at(x1, y1).of_size((x2 - x1 + 1).max(1) as u32, (y2 - y1 + 1).max(1) as u32)
}

/// Encode an RGB image as JPEG.
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let (width, height) = image.dimensions();
    encode_rgb(image.as_raw(), width, height, quality)
}

/// Encode a raw RGB24 buffer as JPEG.
pub fn encode_rgb(pixels: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode(pixels, width, height, ExtendedColorType::Rgb8)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{class_color, BoundingBox, FACE_COLOR};

    fn blank_frame(w: u32, h: u32) -> Frame {
        Frame::from_rgb(vec![255u8; (w * h * 3) as usize], w, h, 1).unwrap()
    }

    #[test]
    fn outline_is_drawn_in_detection_color() {
        let frame = blank_frame(100, 80);
        let det = Detection::new("Face", 1.0, BoundingBox::new(20, 30, 60, 70), FACE_COLOR);
        let image = Overlay::new().annotate(&frame, &[det]).unwrap();
        assert_eq!(image.get_pixel(40, 70), &Pixel([74, 224, 255]));
        assert_eq!(image.get_pixel(20, 50), &Pixel([74, 224, 255]));
        // Interior untouched.
        assert_eq!(image.get_pixel(40, 50), &Pixel([255, 255, 255]));
    }

    #[test]
    fn annotate_leaves_source_frame_untouched() {
        let frame = blank_frame(50, 50);
        let det = Detection::new("cat", 0.5, BoundingBox::new(5, 5, 40, 40), class_color(15));
        let _ = Overlay::new().annotate(&frame, &[det]).unwrap();
        assert!(frame.pixels().iter().all(|&p| p == 255));
    }

    #[test]
    fn out_of_bounds_boxes_do_not_panic() {
        let frame = blank_frame(32, 24);
        let dets = vec![
            Detection::new("a", 0.9, BoundingBox::new(-100, -100, 500, 500), class_color(0)),
            Detection::new("b", 0.9, BoundingBox::new(400, 400, 500, 500), class_color(1)),
            Detection::new("c", 0.9, BoundingBox::new(31, 23, 31, 23), class_color(2)),
        ];
        let image = Overlay::new().annotate(&frame, &dets).unwrap();
        assert_eq!(image.dimensions(), (32, 24));
    }

    #[test]
    fn encodes_jpeg_with_soi_marker() {
        let frame = blank_frame(16, 16);
        let jpeg = encode_rgb(frame.pixels(), 16, 16, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
