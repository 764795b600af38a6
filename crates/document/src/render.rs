//! Rendering collaborator used to produce preview images.

use image::{Rgba, RgbaImage};

use sheetfield_engine::content::{Color, Point, SheetContent, SHEET_SIZE};

/// Rasterizes sheet content. Hosts with a real renderer plug it in here;
/// the document only needs square images at tier resolutions. Shared with
/// the worker pool, which renders previews for flushed sheets.
pub trait SheetRenderer: Send + Sync {
    fn render(&self, content: &SheetContent, px: u32) -> RgbaImage;
}

/// Minimal renderer: background, plane bounding boxes, dividers, strokes,
/// and a bar per text block.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatRenderer;

const TEXT_BAR: Color = Color(0x9090_90FF);
const TEXT_BAR_HEIGHT: f32 = 12.0;

impl SheetRenderer for FlatRenderer {
    fn render(&self, content: &SheetContent, px: u32) -> RgbaImage {
        let mut image = RgbaImage::from_pixel(px, px, Rgba(content.background.rgba()));
        let s = px as f32 / SHEET_SIZE;

        for plane in &content.planes {
            if let Some((lo, hi)) = plane.bounds() {
                fill_rect(&mut image, lo.x * s, lo.y * s, hi.x * s, hi.y * s, plane.color);
            }
        }
        for divider in &content.dividers {
            let y = divider.y * s;
            fill_rect(&mut image, 0.0, y - 0.5, px as f32, y + 0.5, Color::BLACK);
        }
        for text in &content.texts {
            let (x, y) = (text.origin.x * s, text.origin.y * s);
            fill_rect(&mut image, x, y, x + text.width * s, y + TEXT_BAR_HEIGHT * s, TEXT_BAR);
        }
        for line in content.lines.iter().chain(&content.draft) {
            let radius = (line.width * s / 2.0).max(0.5);
            match line.points.as_slice() {
                [] => {}
                [only] => stamp(&mut image, scaled(*only, s), radius, line.color),
                points => {
                    for pair in points.windows(2) {
                        stroke(&mut image, scaled(pair[0], s), scaled(pair[1], s), radius, line.color);
                    }
                }
            }
        }
        image
    }
}

fn scaled(p: Point, s: f32) -> Point {
    Point::new(p.x * s, p.y * s)
}

fn fill_rect(image: &mut RgbaImage, x0: f32, y0: f32, x1: f32, y1: f32, color: Color) {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let left = x0.min(x1).floor().clamp(0.0, w) as u32;
    let top = y0.min(y1).floor().clamp(0.0, h) as u32;
    // At least one pixel so thin features survive downscaling.
    let right = (x0.max(x1).ceil().clamp(0.0, w) as u32).max((left + 1).min(image.width()));
    let bottom = (y0.max(y1).ceil().clamp(0.0, h) as u32).max((top + 1).min(image.height()));
    let pixel = Rgba(color.rgba());
    for y in top..bottom {
        for x in left..right {
            image.put_pixel(x, y, pixel);
        }
    }
}

fn stamp(image: &mut RgbaImage, at: Point, radius: f32, color: Color) {
    fill_rect(image, at.x - radius, at.y - radius, at.x + radius, at.y + radius, color);
}

fn stroke(image: &mut RgbaImage, a: Point, b: Point, radius: f32, color: Color) {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let steps = ((dx.abs().max(dy.abs()) * 2.0).ceil() as u32).max(1);
    for i in 0..=steps {
        let t = i as f32 / steps as f32;
        stamp(image, Point::new(a.x + dx * t, a.y + dy * t), radius, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetfield_engine::content::{Divider, Line, Plane};

    #[test]
    fn test_background_fills_image() {
        let content = SheetContent { background: Color(0x1122_33FF), ..Default::default() };
        let image = FlatRenderer.render(&content, 16);
        assert_eq!(image.dimensions(), (16, 16));
        assert!(image.pixels().all(|p| p.0 == [0x11, 0x22, 0x33, 0xFF]));
    }

    #[test]
    fn test_plane_and_line_are_drawn() {
        let red = Color(0xFF00_00FF);
        let blue = Color(0x0000_FFFF);
        let content = SheetContent {
            planes: vec![Plane {
                outline: vec![Point::new(0.0, 0.0), Point::new(512.0, 0.0), Point::new(512.0, 512.0)],
                color: red,
            }],
            lines: vec![Line::new(vec![Point::new(600.0, 900.0), Point::new(1000.0, 900.0)], 16.0, blue)],
            dividers: vec![Divider { y: 700.0 }],
            ..Default::default()
        };
        let image = FlatRenderer.render(&content, 64);
        assert_eq!(image.get_pixel(10, 10).0, red.rgba());
        assert_eq!(image.get_pixel(50, 56).0, blue.rgba());
        assert_eq!(image.get_pixel(5, 43).0, Color::BLACK.rgba());
        assert_eq!(image.get_pixel(60, 10).0, Color::WHITE.rgba());
    }

    #[test]
    fn test_out_of_bounds_geometry_is_clipped() {
        let content = SheetContent {
            lines: vec![Line::new(vec![Point::new(-500.0, -500.0), Point::new(5000.0, 5000.0)], 4.0, Color::BLACK)],
            ..Default::default()
        };
        let image = FlatRenderer.render(&content, 4);
        assert_eq!(image.get_pixel(0, 0).0, Color::BLACK.rgba());
    }
}
