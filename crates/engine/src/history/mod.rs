//! Branching undo/redo history over an arbitrary reversible-operation type.
//!
//! The history is a tree of groups. Group `n` (1-based, creation order) holds
//! the value slots appended while it was open; group 0 is the implicit root,
//! the empty document. The cursor (`top`) names the last applied group.
//!
//! Appending at the tail of a branch extends it; appending anywhere else forks
//! a new branch at the cursor. Nothing is ever truncated, so every state the
//! document has been in stays reachable through `walk_to`.
//!
//! Slots may be serialized out of memory (`Slot::Unloaded`). They are decoded
//! on demand during a walk and, after replay, checked against live state via
//! `Replayer::observe`; stale halves are rewritten rather than replayed wrong.

pub mod replay;
pub mod slot;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

pub use replay::{Applied, Direction, HistoryItem, Observation, ReplayStep, Replayer, Reversibility, WalkReport};
pub use slot::{reconcile, Repair, Slot, SlotPair, StoredSlot};

/// Linear index of the root (empty) state.
pub const ROOT: usize = 0;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum HistoryError {
    #[error("history index {target} out of range (0..={len})")]
    InvalidTarget { target: usize, len: usize },
    #[error("{op} requires a recorded inverse")]
    MissingInverse { op: &'static str },
    #[error("corrupt history record: {0}")]
    Corrupt(String),
    #[error("history encode failed: {0}")]
    Encode(String),
}

#[derive(Debug, Clone)]
struct Group<I> {
    parent: usize,
    depth: usize,
    branch: usize,
    slots: Vec<Slot<I>>,
}

/// A chain of groups forked from `fork` (0 for the root).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub fork: usize,
    pub groups: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub parent: usize,
    pub branch: usize,
    pub slots: Vec<StoredSlot>,
}

/// Persisted form of a history tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub top: usize,
    pub groups: Vec<GroupRecord>,
    pub branches: Vec<Branch>,
    /// Most recently active child per node, indexed by linear index.
    pub last_child: Vec<Option<usize>>,
}

#[derive(Debug, Clone)]
pub struct History<I> {
    groups: Vec<Group<I>>,
    branches: Vec<Branch>,
    last_child: Vec<Option<usize>>,
    top: usize,
    /// Group currently accepting `append`s. Only valid while equal to `top`.
    open: Option<usize>,
    changed: bool,
}

impl<I: HistoryItem> Default for History<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: HistoryItem> History<I> {
    pub fn new() -> Self {
        Self {
            groups: Vec::new(),
            branches: Vec::new(),
            last_child: vec![None],
            top: ROOT,
            open: None,
            changed: false,
        }
    }

    /// Linear index of the last applied group.
    pub fn top(&self) -> usize {
        self.top
    }

    /// Number of recorded groups (the largest valid index).
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    /// True when the tree or cursor changed since the last `take_changed`.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    fn group(&self, index: usize) -> Option<&Group<I>> {
        index.checked_sub(1).and_then(|i| self.groups.get(i))
    }

    fn group_mut(&mut self, index: usize) -> Option<&mut Group<I>> {
        index.checked_sub(1).and_then(move |i| self.groups.get_mut(i))
    }

    pub fn parent(&self, index: usize) -> Option<usize> {
        self.group(index).map(|g| g.parent)
    }

    pub fn branch_of(&self, index: usize) -> Option<usize> {
        self.group(index).map(|g| g.branch)
    }

    pub fn group_len(&self, index: usize) -> Option<usize> {
        self.group(index).map(|g| g.slots.len())
    }

    pub fn slot(&self, group: usize, slot: usize) -> Option<&Slot<I>> {
        self.group(group).and_then(|g| g.slots.get(slot))
    }

    pub fn resident_slots(&self) -> usize {
        self.groups
            .iter()
            .flat_map(|g| g.slots.iter())
            .filter(|s| s.is_resident())
            .count()
    }

    pub fn errored_slots(&self) -> usize {
        self.groups
            .iter()
            .flat_map(|g| g.slots.iter())
            .filter(|s| s.is_errored())
            .count()
    }

    /// Every item recorded on either side of every readable slot. Unloaded
    /// slots are decoded into the result, not materialized in place.
    pub fn collect_items(&self) -> Vec<I> {
        let mut out = Vec::new();
        for slot in self.groups.iter().flat_map(|g| g.slots.iter()) {
            let decoded;
            let pair = match slot {
                Slot::Resident(pair) => pair,
                Slot::Unloaded(bytes) => {
                    decoded = Slot::<I>::decode(bytes);
                    match &decoded {
                        Slot::Resident(pair) => pair,
                        _ => continue,
                    }
                }
                Slot::Errored(_) => continue,
            };
            out.extend(pair.undo.iter().cloned());
            out.push(pair.redo.clone());
        }
        out
    }

    pub fn can_undo(&self) -> bool {
        self.top != ROOT
    }

    pub fn can_redo(&self) -> bool {
        self.redo_target().is_some()
    }

    /// Where a single `undo` would move the cursor.
    pub fn undo_target(&self) -> Option<usize> {
        self.parent(self.top)
    }

    /// Where a single `redo` would move the cursor: the most recently active
    /// child of the cursor.
    pub fn redo_target(&self) -> Option<usize> {
        self.last_child.get(self.top).copied().flatten()
    }

    /// End the open group. The next `append` starts a new one at the cursor.
    pub fn new_group(&mut self) {
        self.open = None;
    }

    /// Record one already-applied edit.
    ///
    /// `undo` may be `None` only for lazily-reversible items; unreversible
    /// items must carry a captured snapshot of the prior state.
    pub fn append(&mut self, undo: Option<I>, redo: I) -> Result<usize, HistoryError> {
        if undo.is_none() && redo.reversibility() != Reversibility::Lazy {
            return Err(HistoryError::MissingInverse { op: redo.name() });
        }
        let group = self.ensure_open();
        if let Some(g) = self.group_mut(group) {
            g.slots.push(Slot::resident(undo, redo));
        }
        self.changed = true;
        Ok(group)
    }

    fn ensure_open(&mut self) -> usize {
        if let Some(open) = self.open {
            if open == self.top {
                return open;
            }
        }

        let parent = self.top;
        let index = self.groups.len() + 1;
        // Extend the parent's branch only from its tail; anything else forks.
        let continued = self
            .group(parent)
            .map(|g| g.branch)
            .filter(|b| self.branches[*b].groups.last() == Some(&parent));
        let branch = match continued {
            Some(branch) => branch,
            None => {
                self.branches.push(Branch { fork: parent, groups: Vec::new() });
                self.branches.len() - 1
            }
        };

        let depth = self.group(parent).map(|g| g.depth + 1).unwrap_or(1);
        self.branches[branch].groups.push(index);
        self.groups.push(Group { parent, depth, branch, slots: Vec::new() });
        self.last_child.push(None);
        self.last_child[parent] = Some(index);
        self.top = index;
        self.open = Some(index);
        index
    }

    fn depth(&self, index: usize) -> usize {
        self.group(index).map(|g| g.depth).unwrap_or(0)
    }

    fn parent_or_root(&self, index: usize) -> usize {
        self.parent(index).unwrap_or(ROOT)
    }

    /// Replay plan from the cursor to `target`, without side effects.
    ///
    /// Undo steps climb from the cursor to the lowest common ancestor (slots
    /// of each group in reverse), then redo steps descend to `target`.
    pub fn plan_to(&self, target: usize) -> Result<Vec<ReplayStep>, HistoryError> {
        let (up, down) = self.path_to(target)?;
        let mut steps = Vec::new();
        for group in up {
            let n = self.group_len(group).unwrap_or(0);
            for slot in (0..n).rev() {
                steps.push(ReplayStep { group, slot, direction: Direction::Undo });
            }
        }
        for group in down {
            let n = self.group_len(group).unwrap_or(0);
            for slot in 0..n {
                steps.push(ReplayStep { group, slot, direction: Direction::Redo });
            }
        }
        Ok(steps)
    }

    /// Groups to undo (cursor first) and groups to redo (root-most first).
    fn path_to(&self, target: usize) -> Result<(Vec<usize>, Vec<usize>), HistoryError> {
        if target > self.groups.len() {
            return Err(HistoryError::InvalidTarget { target, len: self.groups.len() });
        }
        let mut up = Vec::new();
        let mut down = Vec::new();
        let (mut a, mut b) = (self.top, target);
        while self.depth(a) > self.depth(b) {
            up.push(a);
            a = self.parent_or_root(a);
        }
        while self.depth(b) > self.depth(a) {
            down.push(b);
            b = self.parent_or_root(b);
        }
        while a != b {
            up.push(a);
            a = self.parent_or_root(a);
            down.push(b);
            b = self.parent_or_root(b);
        }
        down.reverse();
        Ok((up, down))
    }

    /// Move the cursor to `target`, replaying through `replayer`.
    ///
    /// Failing slots are marked errored and skipped; the walk always reaches
    /// `target`.
    pub fn walk_to<R: Replayer<I>>(&mut self, target: usize, replayer: &mut R) -> Result<WalkReport, HistoryError> {
        let steps = self.plan_to(target)?;
        let (_, down) = self.path_to(target)?;
        let mut report = WalkReport::default();

        for step in steps {
            let Some(group) = self.group_mut(step.group) else {
                continue;
            };
            let Some(slot) = group.slots.get_mut(step.slot) else {
                continue;
            };
            let taken = std::mem::replace(slot, Slot::Errored(String::new()));
            *slot = replay_slot(taken, step, replayer, &mut report);
        }

        for group in down {
            let parent = self.parent_or_root(group);
            self.last_child[parent] = Some(group);
        }
        self.top = target;
        self.open = None;
        self.changed = true;
        Ok(report)
    }

    /// Step back one group. `None` at the root.
    pub fn undo<R: Replayer<I>>(&mut self, replayer: &mut R) -> Option<WalkReport> {
        let target = self.undo_target()?;
        self.walk_to(target, replayer).ok()
    }

    /// Step forward along the most recently active child.
    pub fn redo<R: Replayer<I>>(&mut self, replayer: &mut R) -> Option<WalkReport> {
        let target = self.redo_target()?;
        self.walk_to(target, replayer).ok()
    }

    /// Serialize every slot outside the hot window around the cursor.
    ///
    /// The hot window is the `keep` nearest ancestors of the cursor (itself
    /// included) and the next `keep` groups along the redo path. Returns the
    /// number of slots unloaded.
    pub fn unload_distant(&mut self, keep: usize) -> usize {
        let mut hot = FxHashSet::default();
        let mut g = self.top;
        let mut n = 0;
        while g != ROOT && n < keep {
            hot.insert(g);
            g = self.parent_or_root(g);
            n += 1;
        }
        let mut g = self.top;
        n = 0;
        while n < keep {
            match self.last_child.get(g).copied().flatten() {
                Some(child) => {
                    hot.insert(child);
                    g = child;
                    n += 1;
                }
                None => break,
            }
        }

        let mut count = 0;
        for (i, group) in self.groups.iter_mut().enumerate() {
            if hot.contains(&(i + 1)) {
                continue;
            }
            for slot in &mut group.slots {
                if slot.is_resident() {
                    slot.unload();
                    if !slot.is_resident() {
                        count += 1;
                    }
                }
            }
        }
        count
    }

    pub fn to_record(&self) -> Result<HistoryRecord, HistoryError> {
        let mut groups = Vec::with_capacity(self.groups.len());
        for g in &self.groups {
            let slots = g
                .slots
                .iter()
                .map(|s| s.to_stored())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| HistoryError::Encode(e.to_string()))?;
            groups.push(GroupRecord { parent: g.parent, branch: g.branch, slots });
        }
        Ok(HistoryRecord {
            top: self.top,
            groups,
            branches: self.branches.clone(),
            last_child: self.last_child.clone(),
        })
    }

    /// Rebuild from a record. Slots come back unloaded and are decoded on
    /// first replay.
    pub fn from_record(record: HistoryRecord) -> Result<Self, HistoryError> {
        let len = record.groups.len();
        if record.top > len {
            return Err(HistoryError::Corrupt(format!("cursor {} past {} groups", record.top, len)));
        }
        if record.last_child.len() != len + 1 {
            return Err(HistoryError::Corrupt("child table size mismatch".into()));
        }
        if record.last_child.iter().flatten().any(|c| *c == ROOT || *c > len) {
            return Err(HistoryError::Corrupt("child table points outside tree".into()));
        }

        let mut groups: Vec<Group<I>> = Vec::with_capacity(len);
        for (i, g) in record.groups.into_iter().enumerate() {
            let index = i + 1;
            if g.parent >= index {
                return Err(HistoryError::Corrupt(format!("group {index} has forward parent {}", g.parent)));
            }
            if g.branch >= record.branches.len() {
                return Err(HistoryError::Corrupt(format!("group {index} on unknown branch {}", g.branch)));
            }
            let depth = match g.parent {
                ROOT => 1,
                p => groups[p - 1].depth + 1,
            };
            groups.push(Group {
                parent: g.parent,
                depth,
                branch: g.branch,
                slots: g.slots.into_iter().map(Slot::from_stored).collect(),
            });
        }

        Ok(Self {
            groups,
            branches: record.branches,
            last_child: record.last_child,
            top: record.top,
            open: None,
            changed: false,
        })
    }
}

fn replay_slot<I: HistoryItem, R: Replayer<I>>(
    mut slot: Slot<I>,
    step: ReplayStep,
    replayer: &mut R,
    report: &mut WalkReport,
) -> Slot<I> {
    slot.load();
    let mut pair = match slot {
        Slot::Resident(pair) => pair,
        Slot::Errored(reason) => {
            report.skipped += 1;
            log::debug!(target: "sheetfield::history", "skipping errored slot {}:{}", step.group, step.slot);
            return Slot::Errored(reason);
        }
        unloaded @ Slot::Unloaded(_) => return unloaded,
    };

    if step.direction == Direction::Undo && pair.undo.is_none() {
        let inverse = match pair.redo.reversibility() {
            Reversibility::Lazy => replayer.invert(&pair.redo),
            _ => None,
        };
        match inverse {
            Some(inverse) => pair.undo = Some(inverse),
            None => {
                report.errored += 1;
                log::warn!(
                    target: "sheetfield::history",
                    "no inverse for {} in slot {}:{}",
                    pair.redo.name(),
                    step.group,
                    step.slot
                );
                return Slot::Errored(format!("no inverse for {}", pair.redo.name()));
            }
        }
    }

    let Some(item) = pair.side(step.direction).cloned() else {
        report.errored += 1;
        return Slot::Errored("missing side".into());
    };

    let mut check = pair.reloaded;
    match replayer.set(&item) {
        Applied::Exact => {}
        Applied::Clamped(actual) => {
            log::warn!(
                target: "sheetfield::history",
                "history.clamp: {} in slot {}:{} clamped to current bounds",
                item.name(),
                step.group,
                step.slot
            );
            slot::record_clamp(&mut pair, step.direction, actual);
            report.clamped += 1;
            check = true;
        }
        Applied::Failed(reason) => {
            log::warn!(
                target: "sheetfield::history",
                "replay of {} in slot {}:{} failed: {}",
                item.name(),
                step.group,
                step.slot,
                reason
            );
            report.errored += 1;
            return Slot::Errored(reason);
        }
    }
    report.applied += 1;

    if !check {
        return Slot::Resident(pair);
    }

    let other = step.direction.other();
    let observation = match pair.side(other) {
        Some(pending) => replayer.observe(pending),
        None => Observation::Matches,
    };
    let (slot, repair) = reconcile(Slot::Resident(pair), other, observation);
    match repair {
        Repair::Rewritten => {
            report.repaired += 1;
            log::warn!(
                target: "sheetfield::history",
                "history.drift: slot {}:{} rewritten to observed state",
                step.group,
                step.slot
            );
        }
        Repair::Errored => report.errored += 1,
        Repair::None => {}
    }
    slot
}
