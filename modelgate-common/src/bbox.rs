//! Bounding boxes in normalized image coordinates.

use serde::{Deserialize, Serialize};

/// One detection: center, extent, and optional label and probability. All
/// coordinates are fractions of the image width or height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probability: Option<f32>,
}

impl BoundingBox {
    pub fn new(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            cx,
            cy,
            w,
            h,
            label: None,
            probability: None,
        }
    }

    /// Build from corner coordinates `(x1, y1, x2, y2)`.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new((x1 + x2) / 2.0, (y1 + y2) / 2.0, x2 - x1, y2 - y1)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_probability(mut self, probability: f32) -> Self {
        self.probability = Some(probability);
        self
    }

    pub fn x1(&self) -> f32 {
        self.cx - self.w / 2.0
    }

    pub fn y1(&self) -> f32 {
        self.cy - self.h / 2.0
    }

    pub fn x2(&self) -> f32 {
        self.cx + self.w / 2.0
    }

    pub fn y2(&self) -> f32 {
        self.cy + self.h / 2.0
    }

    pub fn area(&self) -> f32 {
        self.w * self.h
    }

    /// Intersection over union with another box. Zero when either box is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix = (self.x2().min(other.x2()) - self.x1().max(other.x1())).max(0.0);
        let iy = (self.y2().min(other.y2()) - self.y1().max(other.y1())).max(0.0);
        let intersection = ix * iy;
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}
