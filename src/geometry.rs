//! Rectangles in the two coordinate spaces the pipeline deals with.
//!
//! [`Rect`] is document space: origin at the bottom-left corner of the page,
//! y grows upwards. This is the only convention stored in the intermediate
//! document. [`RasterRect`] is raster space: origin top-left, y grows
//! downwards, which is what page content is laid out against when reading
//! top-to-bottom. [`flip_y`] is the single conversion between them.

use serde::{Deserialize, Serialize};

/// Maps a y coordinate between document space and raster space.
///
/// The mapping is its own inverse.
pub fn flip_y(page_height: f32, y: f32) -> f32 {
    page_height - y
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct Rect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Rect {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
        }
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    pub fn to_raster(&self, page_height: f32) -> RasterRect {
        RasterRect::new(
            self.x0,
            flip_y(page_height, self.y1),
            self.x1,
            flip_y(page_height, self.y0),
        )
    }

    /// Shrinks the rectangle by `dx` on the left and right and `dy` on the
    /// top and bottom. Never produces a negative extent.
    pub fn inset(&self, dx: f32, dy: f32) -> Self {
        let dx = dx.min(self.width() / 2.0).max(0.0);
        let dy = dy.min(self.height() / 2.0).max(0.0);
        Self {
            x0: self.x0 + dx,
            y0: self.y0 + dy,
            x1: self.x1 - dx,
            y1: self.y1 - dy,
        }
    }
}

impl From<[f32; 4]> for Rect {
    fn from(value: [f32; 4]) -> Self {
        Rect::new(value[0], value[1], value[2], value[3])
    }
}

impl From<Rect> for [f32; 4] {
    fn from(value: Rect) -> Self {
        [value.x0, value.y0, value.x1, value.y1]
    }
}

/// A rectangle with `y0` as the top edge and `y1` as the bottom edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterRect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl RasterRect {
    pub fn new(x0: f32, top: f32, x1: f32, bottom: f32) -> Self {
        Self {
            x0: x0.min(x1),
            y0: top.min(bottom),
            x1: x0.max(x1),
            y1: top.max(bottom),
        }
    }

    pub fn top(&self) -> f32 {
        self.y0
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    pub fn to_document(&self, page_height: f32) -> Rect {
        Rect::new(
            self.x0,
            flip_y(page_height, self.y1),
            self.x1,
            flip_y(page_height, self.y0),
        )
    }

    pub fn union(&self, other: &RasterRect) -> RasterRect {
        RasterRect {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    pub fn intersection_area(&self, other: &RasterRect) -> f32 {
        let ix0 = self.x0.max(other.x0);
        let iy0 = self.y0.max(other.y0);
        let ix1 = self.x1.min(other.x1);
        let iy1 = self.y1.min(other.y1);
        if ix1 <= ix0 || iy1 <= iy0 {
            return 0.0;
        }
        (ix1 - ix0) * (iy1 - iy0)
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Share of this rectangle's area that lies inside `other`.
    pub fn covered_ratio(&self, other: &RasterRect) -> f32 {
        let area = self.area();
        if area <= f32::EPSILON {
            let cx = (self.x0 + self.x1) / 2.0;
            let cy = (self.y0 + self.y1) / 2.0;
            return if other.contains_point(cx, cy) { 1.0 } else { 0.0 };
        }
        self.intersection_area(other) / area
    }

    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        x >= self.x0 && x <= self.x1 && y >= self.y0 && y <= self.y1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raster_round_trip_keeps_rect() {
        let rect = Rect::new(72.0, 600.0, 540.0, 700.0);
        let raster = rect.to_raster(792.0);
        assert_eq!(raster.top(), 92.0);
        assert_eq!(raster.y1, 192.0);
        assert_eq!(raster.to_document(792.0), rect);
    }

    #[test]
    fn inset_never_inverts() {
        let rect = Rect::new(0.0, 0.0, 3.0, 1.0);
        let inset = rect.inset(2.0, 1.0);
        assert!(inset.width() >= 0.0);
        assert!(inset.height() >= 0.0);
    }

    #[test]
    fn serializes_as_array() {
        let rect = Rect::new(1.0, 2.0, 3.0, 4.0);
        let json = serde_json::to_string(&rect).unwrap();
        assert_eq!(json, "[1.0,2.0,3.0,4.0]");
        let back: Rect = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rect);
    }

    #[test]
    fn covered_ratio_of_contained_rect_is_one() {
        let inner = RasterRect::new(10.0, 10.0, 20.0, 20.0);
        let outer = RasterRect::new(0.0, 0.0, 100.0, 100.0);
        assert_eq!(inner.covered_ratio(&outer), 1.0);
        assert_eq!(outer.covered_ratio(&inner), 0.01);
    }
}
