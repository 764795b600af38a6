//! World-level undo items: placing, removing and moving sheets.

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::history::{
    Applied, History, HistoryError, HistoryItem, HistoryRecord, Observation, Replayer, Reversibility, WalkReport,
};
use crate::position::{Identity, Position};
use crate::world::{WorldIndex, WorldRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorldOp {
    InsertSheets { entries: Vec<(Position, Identity)> },
    RemoveSheets { entries: Vec<(Position, Identity)> },
    MoveSheet { from: Position, to: Position },
}

impl HistoryItem for WorldOp {
    fn reversibility(&self) -> Reversibility {
        match self {
            WorldOp::MoveSheet { .. } => Reversibility::Lazy,
            _ => Reversibility::Reversible,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            WorldOp::InsertSheets { .. } => "insert-sheets",
            WorldOp::RemoveSheets { .. } => "remove-sheets",
            WorldOp::MoveSheet { .. } => "move-sheet",
        }
    }
}

impl WorldOp {
    pub fn inverse(&self) -> Option<WorldOp> {
        match self {
            WorldOp::InsertSheets { entries } => Some(WorldOp::RemoveSheets { entries: entries.clone() }),
            WorldOp::RemoveSheets { entries } => Some(WorldOp::InsertSheets { entries: entries.clone() }),
            WorldOp::MoveSheet { .. } => None,
        }
    }

    /// Identities mentioned by this item.
    pub fn identities(&self) -> Vec<Identity> {
        match self {
            WorldOp::InsertSheets { entries } | WorldOp::RemoveSheets { entries } => {
                entries.iter().map(|(_, id)| *id).collect()
            }
            WorldOp::MoveSheet { .. } => Vec::new(),
        }
    }
}

/// Interpreter over the index that remembers every position it touched, so
/// the caller can page those positions in or out afterwards.
pub struct WorldReplay<'a> {
    pub index: &'a mut WorldIndex,
    pub touched: Vec<Position>,
}

impl<'a> WorldReplay<'a> {
    pub fn new(index: &'a mut WorldIndex) -> Self {
        Self { index, touched: Vec::new() }
    }
}

impl Replayer<WorldOp> for WorldReplay<'_> {
    fn set(&mut self, item: &WorldOp) -> Applied<WorldOp> {
        match item {
            WorldOp::InsertSheets { entries } => {
                let mut positions = FxHashSet::default();
                let mut identities = FxHashSet::default();
                for (position, identity) in entries {
                    if !positions.insert(*position) {
                        return Applied::Failed(format!("{position} appears twice in one insert"));
                    }
                    if !identities.insert(*identity) {
                        return Applied::Failed(format!("{identity} appears twice in one insert"));
                    }
                }
                for (position, identity) in entries {
                    match self.index.identity_at(*position) {
                        Some(existing) if existing != *identity => {
                            return Applied::Failed(format!("{position} is occupied by {existing}"));
                        }
                        _ => {}
                    }
                    if let Some(at) = self.index.position_of(*identity) {
                        if at != *position {
                            return Applied::Failed(format!("{identity} is already placed at {at}"));
                        }
                    }
                }
                for (position, identity) in entries {
                    self.index.place(*position, *identity);
                    self.touched.push(*position);
                }
                Applied::Exact
            }
            WorldOp::RemoveSheets { entries } => {
                let mut actual = Vec::with_capacity(entries.len());
                for (_, identity) in entries {
                    if let Some(at) = self.index.position_of(*identity) {
                        self.index.remove(at);
                        self.touched.push(at);
                        actual.push((at, *identity));
                    }
                }
                if actual == *entries {
                    Applied::Exact
                } else if actual.is_empty() {
                    Applied::Failed("none of the sheets are placed".into())
                } else {
                    Applied::Clamped(WorldOp::RemoveSheets { entries: actual })
                }
            }
            WorldOp::MoveSheet { from, to } => {
                let Some(identity) = self.index.identity_at(*from) else {
                    return Applied::Failed(format!("nothing to move at {from}"));
                };
                if from != to && self.index.identity_at(*to).is_some() {
                    return Applied::Failed(format!("{to} is occupied"));
                }
                self.index.place(*to, identity);
                self.touched.push(*from);
                self.touched.push(*to);
                Applied::Exact
            }
        }
    }

    fn invert(&self, item: &WorldOp) -> Option<WorldOp> {
        match item {
            WorldOp::MoveSheet { from, to } => Some(WorldOp::MoveSheet { from: *to, to: *from }),
            other => other.inverse(),
        }
    }

    fn observe(&self, pending: &WorldOp) -> Observation<WorldOp> {
        match pending {
            WorldOp::InsertSheets { entries } => {
                let blocked = entries.iter().any(|(p, id)| {
                    self.index.identity_at(*p).is_some_and(|e| e != *id)
                        || self.index.position_of(*id).is_some_and(|at| at != *p)
                });
                if blocked {
                    Observation::Unrecoverable("insert target no longer free".into())
                } else {
                    Observation::Matches
                }
            }
            WorldOp::RemoveSheets { entries } => {
                let actual: Vec<_> = entries
                    .iter()
                    .filter_map(|(_, id)| self.index.position_of(*id).map(|p| (p, *id)))
                    .collect();
                if actual == *entries {
                    Observation::Matches
                } else if actual.is_empty() {
                    Observation::Unrecoverable("none of the sheets are placed".into())
                } else {
                    Observation::Drifted(WorldOp::RemoveSheets { entries: actual })
                }
            }
            WorldOp::MoveSheet { from, to } => {
                if self.index.identity_at(*from).is_some() && (from == to || self.index.identity_at(*to).is_none()) {
                    Observation::Matches
                } else {
                    Observation::Unrecoverable("move endpoints changed".into())
                }
            }
        }
    }
}

/// The placement layer: index plus its history.
#[derive(Debug, Clone, Default)]
pub struct World {
    index: WorldIndex,
    history: History<WorldOp>,
    dirty: bool,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(index: WorldIndex, history: History<WorldOp>) -> Self {
        Self { index, history, dirty: false }
    }

    pub fn from_records(index: &WorldRecord, history: Option<HistoryRecord>) -> Result<Self, HistoryError> {
        let history = match history {
            Some(record) => History::from_record(record)?,
            None => History::new(),
        };
        Ok(Self::from_parts(WorldIndex::from_record(index), history))
    }

    pub fn index(&self) -> &WorldIndex {
        &self.index
    }

    pub fn history(&self) -> &History<WorldOp> {
        &self.history
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Apply a world edit and record it. Returns the touched positions.
    pub fn apply(&mut self, op: WorldOp) -> Result<Vec<Position>, String> {
        let mut replay = WorldReplay::new(&mut self.index);
        let applied = match replay.set(&op) {
            Applied::Exact => op,
            Applied::Clamped(actual) => actual,
            Applied::Failed(reason) => return Err(reason),
        };
        let touched = replay.touched;
        let undo = applied.inverse();
        self.history.append(undo, applied).map_err(|e| e.to_string())?;
        self.dirty = true;
        Ok(touched)
    }

    pub fn new_group(&mut self) {
        self.history.new_group();
    }

    pub fn walk_to(&mut self, target: usize) -> Result<(WalkReport, Vec<Position>), HistoryError> {
        let mut replay = WorldReplay::new(&mut self.index);
        let report = self.history.walk_to(target, &mut replay)?;
        let touched = replay.touched;
        self.dirty = true;
        Ok((report, touched))
    }

    pub fn undo_target(&self) -> Option<usize> {
        self.history.undo_target()
    }

    pub fn redo_target(&self) -> Option<usize> {
        self.history.redo_target()
    }

    /// Place without recording history. Used by orphan repair, which must
    /// not be undoable.
    pub fn place_untracked(&mut self, position: Position, identity: Identity) {
        self.index.place(position, identity);
        self.dirty = true;
    }

    /// Release history slots far from the cursor once they are saved.
    pub fn unload_distant(&mut self, keep: usize) -> usize {
        self.history.unload_distant(keep)
    }

    /// Every identity mentioned anywhere in the history, decoding unloaded
    /// slots without materializing them.
    pub fn referenced_identities(&self) -> Vec<Identity> {
        let mut out = Vec::new();
        for item in self.history.collect_items() {
            out.extend(item.identities());
        }
        out.sort();
        out.dedup();
        out
    }
}
