//! Coalesced background persistence.
//!
//! Dirty sheets are snapshotted into a staging area keyed by identity. A
//! flush drains the staging area into one `WriteBatch`; while that batch is
//! in flight, further flush requests are deferred and rerun once it
//! completes, so there is never more than one writer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use sheetfield_engine::history::HistoryRecord;
use sheetfield_engine::position::Identity;
use sheetfield_engine::sheet::Sheet;
use sheetfield_engine::world::WorldRecord;
use sheetfield_io::{CameraRecord, SelectionRecord, SheetWrite, StoreError, WriteBatch};

/// Snapshot a dirty sheet for writing and mark it clean. History groups far
/// from the cursor are released from memory once they are in the snapshot.
pub fn snapshot_sheet(sheet: &mut Sheet, keep_groups: usize) -> SheetWrite {
    let history = match sheet.history().to_record() {
        Ok(record) => Some(Arc::new(record)),
        Err(e) => {
            log::warn!(target: "sheetfield::persist", "history of {} not saved: {e}", sheet.identity());
            None
        }
    };
    let write = SheetWrite {
        identity: sheet.identity(),
        content: Arc::new(sheet.content().clone()),
        history,
        previews: None,
    };
    sheet.mark_clean();
    if write.history.is_some() {
        let released = sheet.history_mut().unload_distant(keep_groups);
        if released > 0 {
            log::trace!(target: "sheetfield::history", "released {released} slots of {}", sheet.identity());
        }
    }
    write
}

struct InFlight {
    id: u64,
    sheets: FxHashMap<Identity, SheetWrite>,
    deletes: Vec<Identity>,
    world: bool,
    aux: bool,
}

/// Outcome of a finished batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Saved { batch: u64, identities: Vec<Identity>, world: bool },
    /// The batch's sheets are staged again; `world`/`aux` tell the owner
    /// which of its own records need to be marked dirty again.
    Failed { identities: Vec<Identity>, message: String, world: bool, aux: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub outcome: Completion,
    /// A flush was requested while the batch was running.
    pub rerun: bool,
}

pub struct PersistencePipeline {
    quiet: Duration,
    deadline: Option<Instant>,
    staged: FxHashMap<Identity, SheetWrite>,
    deletes: Vec<Identity>,
    in_flight: Option<InFlight>,
    deferred: bool,
    next_batch: u64,
    batches_started: u64,
}

impl PersistencePipeline {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            deadline: None,
            staged: FxHashMap::default(),
            deletes: Vec::new(),
            in_flight: None,
            deferred: false,
            next_batch: 0,
            batches_started: 0,
        }
    }

    /// Record a mutation: (re)arm the autosave timer.
    pub fn mark_dirty(&mut self, now: Instant) {
        self.deadline = Some(now + self.quiet);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    pub fn cancel_autosave(&mut self) {
        self.deadline = None;
    }

    /// Stage a snapshot for the next batch, replacing an older one.
    pub fn stage(&mut self, write: SheetWrite, now: Instant) {
        self.deletes.retain(|id| *id != write.identity);
        self.staged.insert(write.identity, write);
        self.mark_dirty(now);
    }

    /// Latest unwritten snapshot of `identity`: staged first, then in flight.
    pub fn snapshot(&self, identity: Identity) -> Option<SheetWrite> {
        self.staged
            .get(&identity)
            .or_else(|| self.in_flight.as_ref().and_then(|f| f.sheets.get(&identity)))
            .cloned()
    }

    pub fn is_staged(&self, identity: Identity) -> bool {
        self.staged.contains_key(&identity)
    }

    /// Queue permanent deletion of a record.
    pub fn delete(&mut self, identity: Identity, now: Instant) {
        self.staged.remove(&identity);
        if !self.deletes.contains(&identity) {
            self.deletes.push(identity);
        }
        self.mark_dirty(now);
    }

    pub fn is_pending_delete(&self, identity: Identity) -> bool {
        self.deletes.contains(&identity)
            || self.in_flight.as_ref().is_some_and(|f| f.deletes.contains(&identity))
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn in_flight_id(&self) -> Option<u64> {
        self.in_flight.as_ref().map(|f| f.id)
    }

    pub fn batches_started(&self) -> u64 {
        self.batches_started
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Something is waiting to be written or is being written.
    pub fn has_pending(&self) -> bool {
        !self.staged.is_empty() || !self.deletes.is_empty() || self.in_flight.is_some()
    }

    /// Merge a flush request into the running batch.
    pub fn defer(&mut self) {
        self.deferred = true;
    }

    /// Drain everything staged into a new batch. Returns `None` while a batch
    /// is in flight or when there is nothing to write.
    pub fn take_batch(
        &mut self,
        world: Option<(WorldRecord, Option<HistoryRecord>)>,
        aux: Option<(SelectionRecord, CameraRecord)>,
    ) -> Option<(u64, WriteBatch)> {
        if self.in_flight.is_some() {
            self.deferred = true;
            return None;
        }

        let mut sheets: Vec<SheetWrite> = self.staged.values().cloned().collect();
        sheets.sort_by_key(|s| s.identity);
        let has_world = world.is_some();
        let has_aux = aux.is_some();
        let (world, world_history) = match world {
            Some((index, history)) => (Some(index), history),
            None => (None, None),
        };
        let (selection, camera) = match aux {
            Some((selection, camera)) => (Some(selection), Some(camera)),
            None => (None, None),
        };
        let batch = WriteBatch { sheets, deletes: self.deletes.clone(), world, world_history, selection, camera };

        self.deadline = None;
        self.deferred = false;
        if batch.is_empty() {
            return None;
        }

        self.next_batch += 1;
        self.batches_started += 1;
        let id = self.next_batch;
        self.in_flight = Some(InFlight {
            id,
            sheets: self.staged.drain().collect(),
            deletes: std::mem::take(&mut self.deletes),
            world: has_world,
            aux: has_aux,
        });
        log::debug!(
            target: "sheetfield::persist",
            "batch {id}: {} sheets, {} deletes, world={has_world}",
            batch.sheets.len(),
            batch.deletes.len()
        );
        Some((id, batch))
    }

    /// Settle the in-flight batch. A failure re-stages its sheets (newer
    /// snapshots win) and re-arms the autosave timer; nothing in memory is
    /// rolled back.
    pub fn complete(&mut self, id: u64, result: Result<(), StoreError>, now: Instant) -> Option<Completed> {
        if self.in_flight_id() != Some(id) {
            log::warn!(target: "sheetfield::persist", "completion for unknown batch {id}");
            return None;
        }
        let flight = self.in_flight.take()?;
        let mut identities: Vec<Identity> = flight.sheets.keys().copied().collect();
        identities.sort();
        let rerun = std::mem::take(&mut self.deferred);

        let outcome = match result {
            Ok(()) => {
                log::info!(target: "sheetfield::persist", "batch {id} saved ({} sheets)", identities.len());
                Completion::Saved { batch: id, identities, world: flight.world }
            }
            Err(e) => {
                log::error!(target: "sheetfield::persist", "batch {id} failed: {e}");
                for (identity, write) in flight.sheets {
                    self.staged.entry(identity).or_insert(write);
                }
                for identity in flight.deletes {
                    if !self.staged.contains_key(&identity) && !self.deletes.contains(&identity) {
                        self.deletes.push(identity);
                    }
                }
                self.mark_dirty(now);
                Completion::Failed { identities, message: e.to_string(), world: flight.world, aux: flight.aux }
            }
        };
        Some(Completed { outcome, rerun })
    }
}
