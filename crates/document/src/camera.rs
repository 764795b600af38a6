//! Viewport geometry and the desired materialization set.

use rustc_hash::FxHashSet;

use sheetfield_config::DocumentSettings;
use sheetfield_engine::position::{GridRect, Position};
use sheetfield_engine::world::WorldIndex;
use sheetfield_io::{CameraRecord, Tier};

/// World-space viewport. `x`/`y` are the sheet coordinates of the
/// top-left screen corner; `scale` is screen pixels per sheet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub x: f64,
    pub y: f64,
    pub scale: f64,
    pub width: f64,
    pub height: f64,
}

impl Default for Camera {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0, scale: 256.0, width: 1024.0, height: 768.0 }
    }
}

impl Camera {
    pub fn new(x: f64, y: f64, scale: f64, width: f64, height: f64) -> Self {
        Self { x, y, scale, width, height }
    }

    fn scale(&self) -> f64 {
        if self.scale.is_finite() && self.scale > 0.0 {
            self.scale
        } else {
            Camera::default().scale
        }
    }

    /// Positions at least partly on screen.
    pub fn visible(&self) -> GridRect {
        let scale = self.scale();
        let to_cell = |v: f64| v.clamp(i32::MIN as f64, i32::MAX as f64) as i32;
        let min = Position::new(to_cell(self.x.floor()), to_cell(self.y.floor()));
        let right = self.x + (self.width / scale).max(0.0);
        let bottom = self.y + (self.height / scale).max(0.0);
        let max = Position::new(
            to_cell(right.ceil() - 1.0).max(min.x),
            to_cell(bottom.ceil() - 1.0).max(min.y),
        );
        GridRect::new(min, max)
    }

    pub fn center(&self) -> Position {
        let scale = self.scale();
        let cx = self.x + self.width / scale / 2.0;
        let cy = self.y + self.height / scale / 2.0;
        Position::new(cx.floor() as i32, cy.floor() as i32)
    }

    /// Zoom-dependent margin: `marginPx` worth of screen space in sheets,
    /// capped at `maxMargin`.
    pub fn margin(&self, settings: &DocumentSettings) -> i32 {
        let sheets = (settings.margin_px / self.scale()).ceil();
        (sheets.min(settings.max_margin as f64) as i32).max(0)
    }

    /// Screen pixels per sheet on the physical display.
    pub fn screen_px(&self, settings: &DocumentSettings) -> f64 {
        self.scale() * settings.device_pixel_ratio
    }

    pub fn tier(&self, settings: &DocumentSettings) -> Tier {
        Tier::for_scale(self.screen_px(settings))
    }

    pub fn to_record(&self) -> CameraRecord {
        CameraRecord { x: self.x, y: self.y, scale: self.scale }
    }

    /// Restore position and zoom; the viewport size belongs to the host.
    pub fn restore(&mut self, record: &CameraRecord) {
        self.x = record.x;
        self.y = record.y;
        self.scale = record.scale;
    }
}

/// Positions that should be materialized: the expanded viewport (when zoomed
/// in far enough), the cursor and its eight neighbours, and `pinned` (the
/// last edited position, explicit materialize requests). Only placed
/// positions are returned.
pub fn desired_set(
    camera: &Camera,
    index: &WorldIndex,
    cursor: Option<Position>,
    pinned: &[Position],
    settings: &DocumentSettings,
) -> FxHashSet<Position> {
    let mut desired = FxHashSet::default();

    if camera.scale() >= settings.materialize_min_scale {
        let rect = camera.visible().expand(camera.margin(settings));
        let center = camera.center();
        let mut hits: Vec<Position> = index.entries_in(&rect).into_iter().map(|(p, _)| p).collect();
        hits.sort_by_key(|p| (p.distance(center), p.y, p.x));
        hits.truncate(settings.max_resident);
        desired.extend(hits);
    }

    if let Some(cursor) = cursor {
        desired.extend(
            std::iter::once(cursor)
                .chain(cursor.neighbors())
                .filter(|p| index.identity_at(*p).is_some()),
        );
    }
    desired.extend(pinned.iter().copied().filter(|p| index.identity_at(*p).is_some()));
    desired
}
