//! Position <-> identity index for the whole canvas.
//!
//! Two maps kept as exact inverses of each other. Every mutation updates both
//! before returning, so callers on the coordinating thread can never observe
//! a half-applied binding.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::position::{GridRect, Identity, Position};

/// What a `place` call had to undo to keep the maps a bijection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Placement {
    /// Identity that used to sit at the target position and is now parked.
    pub displaced: Option<Identity>,
    /// Where the placed identity was bound before (it moved).
    pub moved_from: Option<Position>,
}

#[derive(Debug, Clone, Default)]
pub struct WorldIndex {
    by_position: FxHashMap<Position, Identity>,
    by_identity: FxHashMap<Identity, Position>,
}

/// Persisted form: sorted binding list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldRecord {
    pub entries: Vec<(Position, Identity)>,
}

impl WorldIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `identity` at `position`.
    ///
    /// An identity already at `position` is parked (reachable only by
    /// identity). If `identity` was bound elsewhere, that binding is severed.
    pub fn place(&mut self, position: Position, identity: Identity) -> Placement {
        let mut placement = Placement::default();

        if let Some(old) = self.by_position.get(&position).copied() {
            if old == identity {
                return placement;
            }
            self.by_identity.remove(&old);
            placement.displaced = Some(old);
        }
        if let Some(prev) = self.by_identity.get(&identity).copied() {
            self.by_position.remove(&prev);
            placement.moved_from = Some(prev);
        }

        self.by_position.insert(position, identity);
        self.by_identity.insert(identity, position);
        self.debug_check();
        placement
    }

    /// Unbind whatever sits at `position`, returning it.
    pub fn remove(&mut self, position: Position) -> Option<Identity> {
        let identity = self.by_position.remove(&position)?;
        self.by_identity.remove(&identity);
        self.debug_check();
        Some(identity)
    }

    pub fn identity_at(&self, position: Position) -> Option<Identity> {
        self.by_position.get(&position).copied()
    }

    pub fn position_of(&self, identity: Identity) -> Option<Position> {
        self.by_identity.get(&identity).copied()
    }

    pub fn is_placed(&self, identity: Identity) -> bool {
        self.by_identity.contains_key(&identity)
    }

    pub fn len(&self) -> usize {
        self.by_position.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_position.is_empty()
    }

    /// All bindings, sorted by position (row-major).
    pub fn entries(&self) -> Vec<(Position, Identity)> {
        let mut entries: Vec<_> = self.by_position.iter().map(|(p, i)| (*p, *i)).collect();
        entries.sort_by_key(|(p, _)| (p.y, p.x));
        entries
    }

    /// Bindings whose position lies inside `rect`.
    ///
    /// Iterates whichever side is smaller: the rectangle or the index.
    pub fn entries_in(&self, rect: &GridRect) -> Vec<(Position, Identity)> {
        if rect.area() <= self.by_position.len() as u64 {
            rect.positions()
                .filter_map(|p| self.identity_at(p).map(|i| (p, i)))
                .collect()
        } else {
            let mut hits: Vec<_> = self
                .by_position
                .iter()
                .filter(|(p, _)| rect.contains(**p))
                .map(|(p, i)| (*p, *i))
                .collect();
            hits.sort_by_key(|(p, _)| (p.y, p.x));
            hits
        }
    }

    pub fn to_record(&self) -> WorldRecord {
        WorldRecord { entries: self.entries() }
    }

    /// Rebuild from a persisted record. Conflicting bindings resolve in
    /// record order (later entries win), the same as replaying `place`.
    pub fn from_record(record: &WorldRecord) -> Self {
        let mut index = Self::new();
        for (position, identity) in &record.entries {
            let placement = index.place(*position, *identity);
            if placement.displaced.is_some() || placement.moved_from.is_some() {
                log::warn!(
                    target: "sheetfield::repair",
                    "world record has conflicting binding for {} at {}",
                    identity,
                    position
                );
            }
        }
        index
    }

    /// True when both maps are exact inverses.
    pub fn is_consistent(&self) -> bool {
        self.by_position.len() == self.by_identity.len()
            && self
                .by_position
                .iter()
                .all(|(p, i)| self.by_identity.get(i) == Some(p))
    }

    #[inline]
    fn debug_check(&self) {
        debug_assert!(self.is_consistent(), "world index maps diverged");
    }
}
