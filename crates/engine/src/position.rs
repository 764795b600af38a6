//! Grid addressing for the canvas.
//!
//! A `Position` names one cell of the infinite grid; an `Identity` names the
//! content that currently lives there. The two are deliberately separate so a
//! sheet can be moved, parked or duplicated without touching its content.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coordinates are clamped to `[-WORLD_LIMIT, WORLD_LIMIT]` on both axes.
///
/// The grid is conceptually infinite, but world-to-screen transforms lose
/// precision far from the origin, so placement is confined to this square.
pub const WORLD_LIMIT: i32 = 1_000_000;

/// Integer grid coordinate of one sheet cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    /// Create a position, clamping both axes into the world square.
    #[inline]
    pub fn new(x: i32, y: i32) -> Self {
        Self {
            x: x.clamp(-WORLD_LIMIT, WORLD_LIMIT),
            y: y.clamp(-WORLD_LIMIT, WORLD_LIMIT),
        }
    }

    pub const ORIGIN: Position = Position { x: 0, y: 0 };

    /// Offset by a delta, clamped.
    pub fn offset(self, dx: i32, dy: i32) -> Self {
        Self::new(self.x.saturating_add(dx), self.y.saturating_add(dy))
    }

    /// The 8 surrounding positions (clamped, so may contain duplicates of
    /// `self` at the world edge; callers collect into sets).
    pub fn neighbors(self) -> [Position; 8] {
        [
            self.offset(-1, -1),
            self.offset(0, -1),
            self.offset(1, -1),
            self.offset(-1, 0),
            self.offset(1, 0),
            self.offset(-1, 1),
            self.offset(0, 1),
            self.offset(1, 1),
        ]
    }

    /// Chebyshev distance, used to rank positions by proximity to the cursor.
    pub fn distance(self, other: Position) -> u32 {
        let dx = (self.x as i64 - other.x as i64).unsigned_abs();
        let dy = (self.y as i64 - other.y as i64).unsigned_abs();
        dx.max(dy) as u32
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Stable, never-reused name for a sheet's content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(Uuid);

impl Identity {
    /// Mint a fresh identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse the hyphenated form produced by `Display`.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Inclusive rectangle of grid positions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridRect {
    pub min: Position,
    pub max: Position,
}

impl GridRect {
    pub fn new(a: Position, b: Position) -> Self {
        Self {
            min: Position::new(a.x.min(b.x), a.y.min(b.y)),
            max: Position::new(a.x.max(b.x), a.y.max(b.y)),
        }
    }

    pub fn contains(&self, p: Position) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    /// Grow by `margin` cells on every side.
    pub fn expand(&self, margin: i32) -> Self {
        Self {
            min: self.min.offset(-margin, -margin),
            max: self.max.offset(margin, margin),
        }
    }

    /// Number of positions covered.
    pub fn area(&self) -> u64 {
        let w = (self.max.x as i64 - self.min.x as i64 + 1) as u64;
        let h = (self.max.y as i64 - self.min.y as i64 + 1) as u64;
        w * h
    }

    /// Iterate row-major.
    pub fn positions(&self) -> impl Iterator<Item = Position> + '_ {
        (self.min.y..=self.max.y)
            .flat_map(move |y| (self.min.x..=self.max.x).map(move |x| Position { x, y }))
    }
}
