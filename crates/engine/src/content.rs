//! Vector content of a single sheet.
//!
//! The engine treats geometry as data: curve fitting, lasso splitting and text
//! layout happen elsewhere and arrive here as finished elements.

use serde::{Deserialize, Serialize};

/// Sheet-local coordinate. Sheets span `0.0..SHEET_SIZE` on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Logical edge length of a sheet in sheet units.
pub const SHEET_SIZE: f32 = 1024.0;

/// Packed 0xRRGGBBAA color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Color(pub u32);

impl Color {
    pub const WHITE: Color = Color(0xFFFF_FFFF);
    pub const BLACK: Color = Color(0x0000_00FF);

    pub fn rgba(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::WHITE
    }
}

/// A fitted curve, stored as its sampled polyline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub points: Vec<Point>,
    pub width: f32,
    pub color: Color,
}

impl Line {
    pub fn new(points: Vec<Point>, width: f32, color: Color) -> Self {
        Self { points, width, color }
    }

    pub fn translate(&mut self, dx: f32, dy: f32) {
        for p in &mut self.points {
            p.x += dx;
            p.y += dy;
        }
    }
}

/// A filled region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plane {
    pub outline: Vec<Point>,
    pub color: Color,
}

impl Plane {
    /// Axis-aligned bounds of the outline, `None` when empty.
    pub fn bounds(&self) -> Option<(Point, Point)> {
        let first = self.outline.first()?;
        let mut min = *first;
        let mut max = *first;
        for p in &self.outline[1..] {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
        }
        Some((min, max))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub origin: Point,
    pub width: f32,
    pub text: String,
}

impl TextBlock {
    pub fn new(origin: Point, width: f32, text: impl Into<String>) -> Self {
        Self { origin, width, text: text.into() }
    }
}

/// Horizontal rule across the sheet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Divider {
    pub y: f32,
}

/// Everything drawn on one sheet.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SheetContent {
    pub lines: Vec<Line>,
    pub planes: Vec<Plane>,
    pub texts: Vec<TextBlock>,
    pub dividers: Vec<Divider>,
    /// Draft layer: strokes not yet committed to `lines`.
    pub draft: Vec<Line>,
    pub background: Color,
}

impl SheetContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
            && self.planes.is_empty()
            && self.texts.is_empty()
            && self.dividers.is_empty()
            && self.draft.is_empty()
    }

    /// Plain-text index used for search: every text block, in order.
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        for block in &self.texts {
            if block.text.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&block.text);
        }
        out
    }

    /// Stand-in content for a record that could not be decoded.
    pub fn diagnostic(label: &str, reason: &str) -> Self {
        Self {
            texts: vec![TextBlock::new(
                Point::new(32.0, 32.0),
                SHEET_SIZE - 64.0,
                format!("Unreadable sheet {label}: {reason}"),
            )],
            background: Color(0xFFE0_E0FF),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_joins_blocks() {
        let mut content = SheetContent::new();
        content.texts.push(TextBlock::new(Point::default(), 100.0, "alpha"));
        content.texts.push(TextBlock::new(Point::default(), 100.0, ""));
        content.texts.push(TextBlock::new(Point::default(), 100.0, "beta"));
        assert_eq!(content.plain_text(), "alpha\nbeta");
    }

    #[test]
    fn test_plane_bounds() {
        let plane = Plane {
            outline: vec![Point::new(3.0, 1.0), Point::new(-1.0, 4.0), Point::new(2.0, 2.0)],
            color: Color::BLACK,
        };
        assert_eq!(plane.bounds(), Some((Point::new(-1.0, 1.0), Point::new(3.0, 4.0))));
        assert_eq!(Plane { outline: vec![], color: Color::BLACK }.bounds(), None);
    }

    #[test]
    fn test_diagnostic_is_not_empty() {
        let content = SheetContent::diagnostic("abc", "checksum mismatch");
        assert!(!content.is_empty());
        assert!(content.plain_text().contains("checksum mismatch"));
    }
}
