use serde::Serialize;

/// Detector family a backend belongs to. Each family can be toggled independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorFamily {
    Faces,
    Objects,
}

impl DetectorFamily {
    pub const ALL: [DetectorFamily; 2] = [DetectorFamily::Faces, DetectorFamily::Objects];

    pub fn as_str(self) -> &'static str {
        match self {
            DetectorFamily::Faces => "faces",
            DetectorFamily::Objects => "objects",
        }
    }
}

/// RGB colour used when rendering a detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

/// Pixel-space bounding box. Detectors may emit coordinates outside the frame;
/// clamping happens at render time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Box from a top-left corner and a size.
    pub fn from_xywh(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self::new(x, y, x.saturating_add(w), y.saturating_add(h))
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    /// Clamp to `[0, width-1] x [0, height-1]`.
    ///
    /// Returns `None` when nothing of the box lies inside the frame, so the
    /// result always satisfies `x1 <= x2` and `y1 <= y2`.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        if width == 0 || height == 0 {
            return None;
        }
        let max_x = width as i32 - 1;
        let max_y = height as i32 - 1;
        let (lo_x, hi_x) = (self.x1.min(self.x2), self.x1.max(self.x2));
        let (lo_y, hi_y) = (self.y1.min(self.y2), self.y1.max(self.y2));
        if hi_x < 0 || hi_y < 0 || lo_x > max_x || lo_y > max_y {
            return None;
        }
        Some(BoundingBox {
            x1: lo_x.max(0),
            y1: lo_y.max(0),
            x2: hi_x.min(max_x),
            y2: hi_y.min(max_y),
        })
    }

    /// Intersection over union, used for non-maximum suppression.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = ((ix2 - ix1).max(0) as f32) * ((iy2 - iy1).max(0) as f32);
        let area_a = (self.width().max(0) as f32) * (self.height().max(0) as f32);
        let area_b = (other.width().max(0) as f32) * (other.height().max(0) as f32);
        let union = area_a + area_b - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Normalised output of any detector. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub label: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub color: Rgb,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox, color: Rgb) -> Self {
        Self {
            label: label.into(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
            color,
        }
    }

    /// Overlay text: the label, plus a percentage when confidence is below 1.
    pub fn caption(&self) -> String {
        if self.confidence < 1.0 {
            format!("{} {:.0}%", self.label, self.confidence * 100.0)
        } else {
            self.label.clone()
        }
    }
}

/// Colour for face detections.
pub const FACE_COLOR: Rgb = Rgb(74, 224, 255);

const PALETTE: [Rgb; 10] = [
    Rgb(74, 222, 128),
    Rgb(251, 191, 36),
    Rgb(167, 139, 250),
    Rgb(248, 113, 113),
    Rgb(96, 165, 250),
    Rgb(52, 211, 153),
    Rgb(251, 146, 60),
    Rgb(232, 121, 249),
    Rgb(163, 230, 53),
    Rgb(130, 200, 250),
];

/// Stable colour for an object class id.
pub fn class_color(class_id: usize) -> Rgb {
    PALETTE[class_id % PALETTE.len()]
}
