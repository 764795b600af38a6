//! Demand-paged materialized sheets, keyed by position.
//!
//! A slot is either `Loading` (a background decode is outstanding) or
//! `Resident`. Loads carry a generation number and a cancellation token; a
//! result is installed only if the slot is still loading the same identity
//! under the same generation, so a load superseded by an unload (or by a
//! later load) can never resurrect.

use rustc_hash::{FxHashMap, FxHashSet};

use sheetfield_engine::position::{Identity, Position};
use sheetfield_engine::sheet::Sheet;
use sheetfield_io::SheetWrite;

use crate::worker::{CancelToken, Job, WorkerPool};

#[derive(Debug)]
enum CacheSlot {
    Loading { identity: Identity, generation: u64, token: CancelToken },
    Resident(Box<Sheet>),
}

impl CacheSlot {
    fn identity(&self) -> Identity {
        match self {
            CacheSlot::Loading { identity, .. } => *identity,
            CacheSlot::Resident(sheet) => sheet.identity(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Resident,
    Pending,
    /// Nothing is placed at the position.
    Unplaced,
}

/// Result of comparing the desired set with the cache.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Eviction {
    pub load: Vec<Position>,
    pub unload: Vec<Position>,
}

#[derive(Debug, Default)]
pub struct SheetCache {
    slots: FxHashMap<Position, CacheSlot>,
    next_generation: u64,
    loads_issued: u64,
}

impl SheetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, position: Position) -> Option<&Sheet> {
        match self.slots.get(&position) {
            Some(CacheSlot::Resident(sheet)) => Some(sheet),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, position: Position) -> Option<&mut Sheet> {
        match self.slots.get_mut(&position) {
            Some(CacheSlot::Resident(sheet)) => Some(sheet),
            _ => None,
        }
    }

    pub fn is_resident(&self, position: Position) -> bool {
        matches!(self.slots.get(&position), Some(CacheSlot::Resident(_)))
    }

    pub fn is_loading(&self, position: Position) -> bool {
        matches!(self.slots.get(&position), Some(CacheSlot::Loading { .. }))
    }

    /// Identity held or being loaded at `position`.
    pub fn identity_at(&self, position: Position) -> Option<Identity> {
        self.slots.get(&position).map(CacheSlot::identity)
    }

    pub fn resident_count(&self) -> usize {
        self.slots.values().filter(|s| matches!(s, CacheSlot::Resident(_))).count()
    }

    pub fn loading_count(&self) -> usize {
        self.slots.len() - self.resident_count()
    }

    /// Total background loads ever issued.
    pub fn loads_issued(&self) -> u64 {
        self.loads_issued
    }

    pub fn positions(&self) -> Vec<Position> {
        let mut positions: Vec<_> = self.slots.keys().copied().collect();
        positions.sort_by_key(|p| (p.y, p.x));
        positions
    }

    pub fn resident_positions(&self) -> Vec<Position> {
        let mut positions: Vec<_> = self
            .slots
            .iter()
            .filter(|(_, s)| matches!(s, CacheSlot::Resident(_)))
            .map(|(p, _)| *p)
            .collect();
        positions.sort_by_key(|p| (p.y, p.x));
        positions
    }

    /// Resident sheets with unsaved changes.
    pub fn dirty_mut(&mut self) -> impl Iterator<Item = &mut Sheet> + '_ {
        self.slots.values_mut().filter_map(|slot| match slot {
            CacheSlot::Resident(sheet) if sheet.is_dirty() => Some(sheet.as_mut()),
            _ => None,
        })
    }

    pub fn resident(&self) -> impl Iterator<Item = (Position, &Sheet)> + '_ {
        self.slots.iter().filter_map(|(p, slot)| match slot {
            CacheSlot::Resident(sheet) => Some((*p, sheet.as_ref())),
            _ => None,
        })
    }

    /// Install a sheet created in memory (new, duplicated, pasted). Any load
    /// in progress for the position is cancelled.
    pub fn insert_resident(&mut self, position: Position, sheet: Sheet) {
        if let Some(CacheSlot::Loading { token, .. }) = self.slots.remove(&position) {
            token.cancel();
        }
        self.slots.insert(position, CacheSlot::Resident(Box::new(sheet)));
    }

    /// Start materializing `identity` at `position`.
    ///
    /// Returns immediately. A second call while the first is outstanding is
    /// coalesced. `staged` is a snapshot awaiting write; the worker reads it
    /// instead of the store.
    pub fn load(
        &mut self,
        position: Position,
        identity: Option<Identity>,
        pool: &mut WorkerPool,
        staged: Option<SheetWrite>,
    ) -> LoadState {
        let Some(identity) = identity else {
            return LoadState::Unplaced;
        };
        match self.slots.get(&position) {
            Some(CacheSlot::Resident(sheet)) if sheet.identity() == identity => return LoadState::Resident,
            Some(CacheSlot::Loading { identity: loading, .. }) if *loading == identity => return LoadState::Pending,
            _ => {}
        }
        if let Some(CacheSlot::Loading { token, .. }) = self.slots.remove(&position) {
            token.cancel();
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let token = CancelToken::new();
        let job = Job::LoadSheet { position, identity, generation, token: token.clone(), staged };
        if !pool.submit(job) {
            log::warn!(target: "sheetfield::paging", "worker pool closed; cannot load {position}");
            return LoadState::Pending;
        }
        self.loads_issued += 1;
        log::debug!(target: "sheetfield::paging", "load {identity} at {position} (generation {generation})");
        self.slots.insert(position, CacheSlot::Loading { identity, generation, token });
        LoadState::Pending
    }

    /// Release `position`. An in-flight load is cancelled; a resident sheet
    /// is handed back so the caller can save it and back-fill its preview.
    pub fn unload(&mut self, position: Position) -> Option<Box<Sheet>> {
        match self.slots.remove(&position)? {
            CacheSlot::Loading { token, generation, .. } => {
                token.cancel();
                log::debug!(target: "sheetfield::paging", "cancelled load at {position} (generation {generation})");
                None
            }
            CacheSlot::Resident(sheet) => Some(sheet),
        }
    }

    /// Install a finished load. Returns false (dropping `sheet`) when the
    /// slot was unloaded, reloaded, or rebound since the load was issued.
    pub fn install(&mut self, position: Position, identity: Identity, generation: u64, sheet: Box<Sheet>) -> bool {
        match self.slots.get(&position) {
            Some(CacheSlot::Loading { identity: want, generation: current, token })
                if *want == identity && *current == generation && !token.is_cancelled() =>
            {
                self.slots.insert(position, CacheSlot::Resident(sheet));
                true
            }
            _ => false,
        }
    }

    /// Positions to load (desired, not in the cache) and to unload (cached,
    /// no longer desired), computed in that order. A position desired by
    /// both calls is left alone.
    pub fn evict_out_of_range(&self, desired: &FxHashSet<Position>) -> Eviction {
        let mut load: Vec<Position> = desired.iter().filter(|p| !self.slots.contains_key(p)).copied().collect();
        let mut unload: Vec<Position> = self.slots.keys().filter(|p| !desired.contains(p)).copied().collect();
        load.sort_by_key(|p| (p.y, p.x));
        unload.sort_by_key(|p| (p.y, p.x));
        Eviction { load, unload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use sheetfield_io::{Encoding, MemoryByteStore, PersistentStore};

    use crate::render::FlatRenderer;
    use crate::worker::{LoadOutcome, Message};

    fn pool() -> WorkerPool {
        let store = Arc::new(PersistentStore::new(Arc::new(MemoryByteStore::new()), Encoding::Json));
        WorkerPool::spawn(store, Arc::new(FlatRenderer), 1, 8).unwrap()
    }

    fn next_loaded(pool: &mut WorkerPool) -> (Position, Identity, u64, Box<Sheet>) {
        match pool.recv() {
            Some(Message::SheetLoaded { position, identity, generation, outcome: LoadOutcome::Loaded { sheet, .. } }) => {
                (position, identity, generation, sheet)
            }
            Some(Message::SheetLoaded { outcome: LoadOutcome::Cancelled, .. }) => panic!("cancelled"),
            _ => panic!("expected a load result"),
        }
    }

    #[test]
    fn test_concurrent_loads_coalesce() {
        let mut pool = pool();
        let mut cache = SheetCache::new();
        let id = Identity::new();
        assert_eq!(cache.load(Position::ORIGIN, Some(id), &mut pool, None), LoadState::Pending);
        assert_eq!(cache.load(Position::ORIGIN, Some(id), &mut pool, None), LoadState::Pending);
        assert_eq!(cache.loads_issued(), 1);
        assert_eq!(cache.load(Position::new(1, 0), None, &mut pool, None), LoadState::Unplaced);

        let (p, i, g, sheet) = next_loaded(&mut pool);
        assert!(cache.install(p, i, g, sheet));
        assert_eq!(cache.load(Position::ORIGIN, Some(id), &mut pool, None), LoadState::Resident);
    }

    #[test]
    fn test_unload_before_install_drops_result() {
        let mut pool = pool();
        let mut cache = SheetCache::new();
        let id = Identity::new();
        cache.load(Position::ORIGIN, Some(id), &mut pool, None);
        assert!(cache.unload(Position::ORIGIN).is_none());

        match pool.recv() {
            Some(Message::SheetLoaded { position, identity, generation, outcome }) => {
                if let LoadOutcome::Loaded { sheet, .. } = outcome {
                    assert!(!cache.install(position, identity, generation, sheet));
                }
            }
            _ => panic!("expected a load result"),
        }
        assert!(!cache.is_resident(Position::ORIGIN));
    }

    #[test]
    fn test_reload_ignores_older_generation() {
        let mut pool = pool();
        let mut cache = SheetCache::new();
        let id = Identity::new();
        cache.load(Position::ORIGIN, Some(id), &mut pool, None);
        cache.unload(Position::ORIGIN);
        cache.load(Position::ORIGIN, Some(id), &mut pool, None);

        let mut installed = 0;
        while let Some(message) = pool.recv() {
            if let Message::SheetLoaded { position, identity, generation, outcome: LoadOutcome::Loaded { sheet, .. } } =
                message
            {
                if cache.install(position, identity, generation, sheet) {
                    installed += 1;
                    assert_eq!(generation, 2);
                }
            }
        }
        assert_eq!(installed, 1);
        assert!(cache.is_resident(Position::ORIGIN));
    }

    #[test]
    fn test_eviction_plan() {
        let mut cache = SheetCache::new();
        cache.insert_resident(Position::new(0, 0), Sheet::new(Identity::new()));
        cache.insert_resident(Position::new(5, 5), Sheet::new(Identity::new()));
        let desired: FxHashSet<_> = [Position::new(0, 0), Position::new(1, 0)].into_iter().collect();

        let plan = cache.evict_out_of_range(&desired);
        assert_eq!(plan.load, vec![Position::new(1, 0)]);
        assert_eq!(plan.unload, vec![Position::new(5, 5)]);
    }

    #[test]
    fn test_dirty_iteration() {
        let mut cache = SheetCache::new();
        let mut dirty = Sheet::new(Identity::new());
        dirty.mark_dirty();
        cache.insert_resident(Position::new(0, 0), dirty);
        cache.insert_resident(Position::new(1, 0), Sheet::new(Identity::new()));
        assert_eq!(cache.dirty_mut().count(), 1);
    }
}
