//! The seam between the generic history tree and the engines that interpret
//! its items (world placement, sheet content).

use serde::de::DeserializeOwned;
use serde::Serialize;

/// How an item's inverse is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reversibility {
    /// Inverse is computed by the caller and recorded at apply time.
    Reversible,
    /// Inverse is computed from live state the first time the item is undone.
    Lazy,
    /// Inverse cannot be reconstructed; the recorded undo side must be a
    /// captured snapshot of the prior state.
    Unreversible,
}

/// One operation kind that a history can record.
pub trait HistoryItem: Clone + std::fmt::Debug + Serialize + DeserializeOwned {
    fn reversibility(&self) -> Reversibility;

    /// Opcode name, for logs.
    fn name(&self) -> &'static str;
}

/// Result of the generic `set` entry point.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied<I> {
    /// Applied exactly as recorded.
    Exact,
    /// Applied after clamping indexes to current bounds. Carries the item as
    /// actually applied so the slot can be rewritten.
    Clamped(I),
    /// Not applicable to current state. State is unchanged.
    Failed(String),
}

/// What the replayer sees when it checks the side that was *not* just applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation<I> {
    Matches,
    /// Live state disagrees; carries the item rewritten to observed state.
    Drifted(I),
    Unrecoverable(String),
}

/// Opcode interpreter for one engine.
pub trait Replayer<I: HistoryItem> {
    /// Apply `item` to live state.
    fn set(&mut self, item: &I) -> Applied<I>;

    /// Inverse of a lazily-reversible `item`, evaluated against current state
    /// (the state right after `item` was applied). `None` when it cannot be
    /// derived.
    fn invert(&self, item: &I) -> Option<I>;

    /// Check whether `pending` still applies cleanly to current state.
    fn observe(&self, pending: &I) -> Observation<I>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Undo,
    Redo,
}

impl Direction {
    pub fn other(self) -> Self {
        match self {
            Direction::Undo => Direction::Redo,
            Direction::Redo => Direction::Undo,
        }
    }
}

/// One replay in a plan: apply the `direction` side of slot `slot` of group
/// `group` (linear index).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStep {
    pub group: usize,
    pub slot: usize,
    pub direction: Direction,
}

/// Tally of a `walk_to`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkReport {
    pub applied: usize,
    /// Slots rewritten because an index ran past current bounds.
    pub clamped: usize,
    /// Lazily-reloaded slots whose other side disagreed with live state.
    pub repaired: usize,
    /// Slots that failed during this walk and are now errored.
    pub errored: usize,
    /// Slots skipped because they were already errored.
    pub skipped: usize,
}

impl WalkReport {
    pub fn is_clean(&self) -> bool {
        self.clamped == 0 && self.repaired == 0 && self.errored == 0 && self.skipped == 0
    }
}
