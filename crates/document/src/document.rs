//! The document: world, resident sheets, previews and persistence, driven
//! from one coordinating thread.
//!
//! Every method here runs on the owning thread. Background results are
//! applied only in `pump`/`wait_idle`, after the caches re-check their
//! generation and cancellation tokens.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use image::RgbaImage;
use rustc_hash::FxHashSet;

use sheetfield_config::{DocumentSettings, StorageEncoding};
use sheetfield_engine::content::SheetContent;
use sheetfield_engine::events::{DocumentEvent, EventCollector, SavedEvent, SheetLoadedEvent};
use sheetfield_engine::history::{History, WalkReport};
use sheetfield_engine::ops::SheetOp;
use sheetfield_engine::position::{Identity, Position};
use sheetfield_engine::sheet::Sheet;
use sheetfield_engine::world::WorldRecord;
use sheetfield_engine::world_ops::{World, WorldOp};
use sheetfield_io::{
    Encoding, PersistentStore, SelectionRecord, SheetWrite, SqliteByteStore, StoreError, Tier, WriteBatch,
};

use crate::camera::{desired_set, Camera};
use crate::error::{DocumentError, Result};
use crate::persistence::{snapshot_sheet, Completion, PersistencePipeline};
use crate::preview_cache::{PreviewCache, PreviewSource, PreviewState};
use crate::render::{FlatRenderer, SheetRenderer};
use crate::repair::{find_orphans, repair_orphans};
use crate::sheet_cache::{LoadState, SheetCache};
use crate::worker::{render_previews, Job, LoadOutcome, Message, WorkerPool};

/// Answer to `materialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialize {
    /// The sheet is resident; use `sheet`/`apply_edit`.
    Resident,
    /// A load is running; a `SheetLoaded` event follows.
    Pending,
    /// Nothing is placed at the position.
    Unplaced,
}

/// Counters for hosts and the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentStats {
    pub placed: usize,
    pub resident: usize,
    pub loading: usize,
    pub previews: usize,
    pub staged: usize,
    pub batches_started: u64,
    pub world_history_groups: usize,
    pub world_history_branches: usize,
}

pub struct Document {
    settings: DocumentSettings,
    store: Arc<PersistentStore>,
    renderer: Arc<dyn SheetRenderer>,
    world: World,
    cache: SheetCache,
    previews: PreviewCache,
    pipeline: PersistencePipeline,
    pool: WorkerPool,
    camera: Camera,
    selection: SelectionRecord,
    last_edited: Option<Position>,
    /// Position pinned by the last explicit `materialize`.
    focus: Option<Position>,
    events: EventCollector,
    aux_dirty: bool,
}

impl Document {
    /// Open a document over `store`: world index and history, camera and
    /// selection, orphan repair, then the first paging pass.
    pub fn open(
        store: Arc<PersistentStore>,
        settings: DocumentSettings,
        renderer: Arc<dyn SheetRenderer>,
    ) -> Result<Self> {
        let settings = settings.sanitized();
        // A lost index drops the world history with it; orphan repair below
        // puts every stored sheet back on the grid.
        let (index, index_lost) = match store.read_world() {
            Ok(index) => (index, false),
            Err(e) if e.is_corrupt_record() => {
                log::warn!(target: "sheetfield::repair", "world index unreadable, rebuilding from stored sheets: {e}");
                (WorldRecord::default(), true)
            }
            Err(e) => return Err(e.into()),
        };
        let history = if index_lost {
            None
        } else {
            store.read_world_history().unwrap_or_else(|e| {
                log::warn!(target: "sheetfield::history", "world history unreadable, starting fresh: {e}");
                None
            })
        };
        let mut world = match World::from_records(&index, history) {
            Ok(world) => world,
            Err(e) => {
                log::warn!(target: "sheetfield::history", "world history rejected, starting fresh: {e}");
                World::from_records(&index, None)?
            }
        };
        if index_lost {
            world.mark_dirty();
        }

        let mut camera = Camera::default();
        match store.read_camera() {
            Ok(Some(record)) => camera.restore(&record),
            Ok(None) => {}
            Err(e) => log::warn!("camera record unreadable: {e}"),
        }
        let selection = store.read_selection().unwrap_or_else(|e| {
            log::warn!("selection record unreadable: {e}");
            None
        });

        let pool = WorkerPool::spawn(
            Arc::clone(&store),
            Arc::clone(&renderer),
            settings.worker_count,
            settings.result_capacity,
        )?;
        log::info!(
            "opened document: {} sheets, {} world history groups",
            world.index().len(),
            world.history().len()
        );

        let mut doc = Self {
            pipeline: PersistencePipeline::new(settings.autosave_quiet()),
            settings,
            store,
            renderer,
            world,
            cache: SheetCache::new(),
            previews: PreviewCache::new(),
            pool,
            camera,
            selection: selection.unwrap_or_default(),
            last_edited: None,
            focus: None,
            events: EventCollector::new(),
            aux_dirty: false,
        };
        doc.repair()?;
        doc.update_paging();
        Ok(doc)
    }

    /// Open (or create) a SQLite-backed document file with the built-in
    /// renderer.
    pub fn open_path(path: &Path, settings: DocumentSettings) -> Result<Self> {
        let encoding = match settings.encoding {
            StorageEncoding::Json => Encoding::Json,
            StorageEncoding::Compact => Encoding::Compact,
        };
        let bytes = SqliteByteStore::open(path)?;
        let store = Arc::new(PersistentStore::new(Arc::new(bytes), encoding));
        Self::open(store, settings, Arc::new(FlatRenderer))
    }

    pub fn settings(&self) -> &DocumentSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        &self.store
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn selection(&self) -> &SelectionRecord {
        &self.selection
    }

    pub fn stats(&self) -> DocumentStats {
        DocumentStats {
            placed: self.world.index().len(),
            resident: self.cache.resident_count(),
            loading: self.cache.loading_count(),
            previews: self.previews.len(),
            staged: self.pipeline.staged_len(),
            batches_started: self.pipeline.batches_started(),
            world_history_groups: self.world.history().len(),
            world_history_branches: self.world.history().branch_count(),
        }
    }

    /// Unsaved work exists anywhere: resident sheets, staged snapshots,
    /// a running batch, the world or the auxiliary records.
    pub fn has_unsaved(&self) -> bool {
        self.world.is_dirty()
            || self.aux_dirty
            || self.pipeline.has_pending()
            || self.cache.resident().any(|(_, sheet)| sheet.is_dirty())
    }

    // ------------------------------------------------------------------
    // Sheets
    // ------------------------------------------------------------------

    /// Request the editable sheet at `position`. Never blocks. The position
    /// stays pinned in the resident set until another one is requested.
    pub fn materialize(&mut self, position: Position) -> Materialize {
        let identity = self.world.index().identity_at(position);
        if identity.is_some() {
            self.focus = Some(position);
        }
        let staged = identity.and_then(|id| self.pipeline.snapshot(id));
        match self.cache.load(position, identity, &mut self.pool, staged) {
            LoadState::Resident => Materialize::Resident,
            LoadState::Pending => Materialize::Pending,
            LoadState::Unplaced => Materialize::Unplaced,
        }
    }

    /// `materialize`, then service worker results until the sheet is
    /// resident.
    pub fn materialize_blocking(&mut self, position: Position) -> Result<&Sheet> {
        loop {
            match self.materialize(position) {
                Materialize::Resident => break,
                Materialize::Unplaced => return Err(DocumentError::NotPlaced(position)),
                Materialize::Pending => match self.pool.recv() {
                    Some(message) => self.handle(message),
                    None => return Err(DocumentError::NotMaterialized(position)),
                },
            }
        }
        self.cache.get(position).ok_or(DocumentError::NotMaterialized(position))
    }

    pub fn sheet(&self, position: Position) -> Option<&Sheet> {
        self.cache.get(position)
    }

    pub fn is_resident(&self, position: Position) -> bool {
        self.cache.is_resident(position)
    }

    /// Release `position` now: cancels a running load, or stages a dirty
    /// sheet for writing and back-fills its preview.
    pub fn unload(&mut self, position: Position) {
        if self.focus == Some(position) {
            self.focus = None;
        }
        if self.unload_inner(position) {
            self.start_flush();
        }
    }

    /// Apply a live edit to a resident sheet. The edit joins the open undo
    /// group; call `new_group` to start another.
    pub fn apply_edit(&mut self, position: Position, op: SheetOp) -> Result<SheetOp> {
        let sheet = self.cache.get_mut(position).ok_or(DocumentError::NotMaterialized(position))?;
        let applied = sheet.apply(op)?;
        self.sheet_changed(position);
        Ok(applied)
    }

    pub fn new_group(&mut self, position: Position) -> Result<()> {
        let sheet = self.cache.get_mut(position).ok_or(DocumentError::NotMaterialized(position))?;
        sheet.new_group();
        Ok(())
    }

    /// Walk the sheet's history to group `index`. The walk goes through the
    /// common ancestor, so any index is reachable from any cursor and
    /// `redo_to` is the same call under the name a redo menu expects.
    pub fn undo_to(&mut self, position: Position, index: usize) -> Result<WalkReport> {
        self.walk_sheet(position, index)
    }

    pub fn redo_to(&mut self, position: Position, index: usize) -> Result<WalkReport> {
        self.undo_to(position, index)
    }

    pub fn sheet_undo(&mut self, position: Position) -> Result<Option<WalkReport>> {
        let sheet = self.cache.get(position).ok_or(DocumentError::NotMaterialized(position))?;
        match sheet.history().undo_target() {
            Some(target) => self.walk_sheet(position, target).map(Some),
            None => Ok(None),
        }
    }

    pub fn sheet_redo(&mut self, position: Position) -> Result<Option<WalkReport>> {
        let sheet = self.cache.get(position).ok_or(DocumentError::NotMaterialized(position))?;
        match sheet.history().redo_target() {
            Some(target) => self.walk_sheet(position, target).map(Some),
            None => Ok(None),
        }
    }

    fn walk_sheet(&mut self, position: Position, index: usize) -> Result<WalkReport> {
        let sheet = self.cache.get_mut(position).ok_or(DocumentError::NotMaterialized(position))?;
        let report = sheet.walk_to(index)?;
        if !report.is_clean() {
            self.events.push(DocumentEvent::HistoryRepaired { position: Some(position), report: report.clone() });
        }
        self.sheet_changed(position);
        Ok(report)
    }

    fn sheet_changed(&mut self, position: Position) {
        self.last_edited = Some(position);
        self.pipeline.mark_dirty(Instant::now());
        self.previews.remove(position);
    }

    // ------------------------------------------------------------------
    // World edits
    // ------------------------------------------------------------------

    /// Place a new empty sheet. Returns its identity.
    pub fn new_sheet(&mut self, position: Position) -> Result<Identity> {
        self.place_new(position, SheetContent::new())
    }

    /// Copy the content at `from` into a new sheet at `to`. History is not
    /// copied.
    pub fn duplicate_sheet(&mut self, from: Position, to: Position) -> Result<Identity> {
        let content = self.content_of(from)?;
        self.place_new(to, content)
    }

    /// Place a new sheet from compact interchange bytes.
    pub fn paste_sheet(&mut self, position: Position, bytes: &[u8]) -> Result<Identity> {
        let content = PersistentStore::import_sheet(bytes)?;
        self.place_new(position, content)
    }

    /// Compact interchange bytes of the content at `position`.
    pub fn export_sheet(&self, position: Position) -> Result<Vec<u8>> {
        Ok(PersistentStore::export_sheet(&self.content_of(position)?)?)
    }

    /// Unplace the sheet at `position`. Its record is kept (world undo can
    /// bring it back); unsaved edits are staged for writing first.
    pub fn remove_sheet(&mut self, position: Position) -> Result<Identity> {
        let identity = self.world.index().identity_at(position).ok_or(DocumentError::NotPlaced(position))?;
        let touched = self.apply_world(WorldOp::RemoveSheets { entries: vec![(position, identity)] })?;
        self.resync(&touched);
        Ok(identity)
    }

    pub fn move_sheet(&mut self, from: Position, to: Position) -> Result<()> {
        if self.world.index().identity_at(from).is_none() {
            return Err(DocumentError::NotPlaced(from));
        }
        if from == to {
            return Ok(());
        }
        if self.world.index().identity_at(to).is_some() {
            return Err(DocumentError::Occupied(to));
        }
        let touched = self.apply_world(WorldOp::MoveSheet { from, to })?;
        if let Some(sheet) = self.cache.unload(from) {
            self.cache.insert_resident(to, *sheet);
        }
        self.previews.remove(from);
        self.previews.remove(to);
        for pinned in [&mut self.last_edited, &mut self.focus] {
            if *pinned == Some(from) {
                *pinned = Some(to);
            }
        }
        self.resync(&touched);
        Ok(())
    }

    pub fn world_new_group(&mut self) {
        self.world.new_group();
    }

    /// Walk the world history to `index`, unloading sheets whose placement
    /// changed. Like `undo_to`, any index is reachable; `world_redo_to` is an
    /// alias.
    pub fn world_undo_to(&mut self, index: usize) -> Result<WalkReport> {
        let (report, touched) = self.world.walk_to(index)?;
        if !report.is_clean() {
            self.events.push(DocumentEvent::HistoryRepaired { position: None, report: report.clone() });
        }
        self.pipeline.mark_dirty(Instant::now());
        self.resync(&touched);
        Ok(report)
    }

    pub fn world_redo_to(&mut self, index: usize) -> Result<WalkReport> {
        self.world_undo_to(index)
    }

    pub fn world_undo(&mut self) -> Result<Option<WalkReport>> {
        match self.world.undo_target() {
            Some(target) => self.world_undo_to(target).map(Some),
            None => Ok(None),
        }
    }

    pub fn world_redo(&mut self) -> Result<Option<WalkReport>> {
        match self.world.redo_target() {
            Some(target) => self.world_undo_to(target).map(Some),
            None => Ok(None),
        }
    }

    fn place_new(&mut self, position: Position, content: SheetContent) -> Result<Identity> {
        if self.world.index().identity_at(position).is_some() {
            return Err(DocumentError::Occupied(position));
        }
        let identity = Identity::new();
        let touched = self.apply_world(WorldOp::InsertSheets { entries: vec![(position, identity)] })?;
        let mut sheet = Sheet::from_parts(identity, content, History::new());
        sheet.mark_dirty();
        self.cache.insert_resident(position, sheet);
        self.previews.remove(position);
        self.last_edited = Some(position);
        self.resync(&touched);
        log::debug!("placed {identity} at {position}");
        Ok(identity)
    }

    fn apply_world(&mut self, op: WorldOp) -> Result<Vec<Position>> {
        let touched = self.world.apply(op).map_err(DocumentError::WorldRejected)?;
        self.pipeline.mark_dirty(Instant::now());
        Ok(touched)
    }

    /// Content at `position`: resident sheet, staged snapshot, then store.
    fn content_of(&self, position: Position) -> Result<SheetContent> {
        let identity = self.world.index().identity_at(position).ok_or(DocumentError::NotPlaced(position))?;
        if let Some(sheet) = self.cache.get(position) {
            return Ok(sheet.content().clone());
        }
        if let Some(write) = self.pipeline.snapshot(identity) {
            return Ok(write.content.as_ref().clone());
        }
        Ok(self.store.read_sheet(identity)?.map(|record| record.content).unwrap_or_default())
    }

    /// Bring caches in line with the index after a world change.
    fn resync(&mut self, touched: &[Position]) {
        let mut staged = false;
        for &position in touched {
            let placed = self.world.index().identity_at(position);
            if let Some(held) = self.cache.identity_at(position) {
                if Some(held) != placed {
                    staged |= self.unload_inner(position);
                }
            }
        }
        let index = self.world.index();
        self.previews.retain(|p, id| !touched.contains(&p) || index.identity_at(p) == Some(id));
        if staged {
            self.start_flush();
        }
        self.update_paging();
    }

    // ------------------------------------------------------------------
    // Paging and previews
    // ------------------------------------------------------------------

    pub fn set_camera(&mut self, camera: Camera) {
        self.camera = camera;
        self.aux_dirty = true;
        self.update_paging();
    }

    pub fn set_cursor(&mut self, cursor: Option<Position>) {
        self.selection.cursor = cursor;
        self.aux_dirty = true;
        self.update_paging();
    }

    pub fn set_selection(&mut self, positions: Vec<Position>) {
        self.selection.positions = positions;
        self.aux_dirty = true;
    }

    /// Recompute the desired set: unload (staging dirty sheets, one flush),
    /// then load, then fill previews for visible non-resident sheets.
    pub fn update_paging(&mut self) {
        let pinned: Vec<Position> = self.last_edited.into_iter().chain(self.focus).collect();
        let desired = desired_set(&self.camera, self.world.index(), self.selection.cursor, &pinned, &self.settings);
        let plan = self.cache.evict_out_of_range(&desired);

        let mut staged = false;
        for &position in &plan.unload {
            staged |= self.unload_inner(position);
        }
        if staged {
            self.start_flush();
        }
        for &position in &plan.load {
            let identity = self.world.index().identity_at(position);
            let snapshot = identity.and_then(|id| self.pipeline.snapshot(id));
            self.cache.load(position, identity, &mut self.pool, snapshot);
        }
        if !plan.load.is_empty() || !plan.unload.is_empty() {
            log::debug!(
                target: "sheetfield::paging",
                "paging: {} loads, {} unloads, {} resident",
                plan.load.len(),
                plan.unload.len(),
                self.cache.resident_count()
            );
        }
        self.refresh_previews();
    }

    fn refresh_previews(&mut self) {
        let tier = self.camera.tier(&self.settings);
        let visible = self.camera.visible();
        for (position, identity) in self.world.index().entries_in(&visible) {
            if self.cache.is_resident(position) {
                continue;
            }
            self.ensure_preview(position, identity, tier);
        }
    }

    fn ensure_preview(&mut self, position: Position, identity: Identity, tier: Tier) -> PreviewState {
        if let Some(sheet) = self.cache.get(position) {
            let source = PreviewSource::Render(sheet.content(), self.renderer.as_ref());
            return self.previews.ensure(position, identity, tier, source, &mut self.pool);
        }
        let staged = self.pipeline.snapshot(identity);
        let source = match &staged {
            Some(write) => PreviewSource::Render(&write.content, self.renderer.as_ref()),
            None => PreviewSource::Stored,
        };
        self.previews.ensure(position, identity, tier, source, &mut self.pool)
    }

    /// Ask for the preview of `position` at `tier`.
    pub fn request_preview(&mut self, position: Position, tier: Tier) -> Result<PreviewState> {
        let identity = self.world.index().identity_at(position).ok_or(DocumentError::NotPlaced(position))?;
        Ok(self.ensure_preview(position, identity, tier))
    }

    pub fn preview(&self, position: Position) -> Option<(Tier, Arc<RgbaImage>)> {
        self.previews.get(position)
    }

    /// Drop `position` from the cache. Returns true if a dirty sheet was
    /// staged for writing.
    fn unload_inner(&mut self, position: Position) -> bool {
        let Some(mut sheet) = self.cache.unload(position) else {
            return false;
        };
        let identity = sheet.identity();
        if self.world.index().identity_at(position) == Some(identity) {
            let tier = self.camera.tier(&self.settings);
            let image = self.renderer.render(sheet.content(), tier.pixels());
            self.previews.install(position, identity, tier, image);
        }
        if !sheet.is_dirty() {
            return false;
        }
        let write = snapshot_sheet(&mut sheet, self.settings.resident_groups);
        self.pipeline.stage(write, Instant::now());
        true
    }

    // ------------------------------------------------------------------
    // Worker results
    // ------------------------------------------------------------------

    /// Apply every finished background result. Returns how many were
    /// handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while let Some(message) = self.pool.try_recv() {
            self.handle(message);
            handled += 1;
        }
        handled
    }

    /// Block until no background work is outstanding.
    pub fn wait_idle(&mut self) {
        while let Some(message) = self.pool.recv() {
            self.handle(message);
        }
    }

    pub fn drain_events(&mut self) -> Vec<DocumentEvent> {
        self.events.take()
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::SheetLoaded { position, identity, generation, outcome } => match outcome {
                LoadOutcome::Cancelled => {
                    log::trace!(target: "sheetfield::paging", "load of {identity} at {position} cancelled");
                }
                LoadOutcome::Loaded { sheet, placeholder, history_error } => {
                    if let Some(e) = history_error {
                        log::warn!(target: "sheetfield::history", "history of {identity} dropped: {e}");
                    }
                    if self.cache.install(position, identity, generation, sheet) {
                        self.previews.remove(position);
                        self.events.push(DocumentEvent::SheetLoaded(SheetLoadedEvent {
                            position,
                            identity,
                            placeholder,
                        }));
                    } else {
                        log::debug!(target: "sheetfield::paging", "discarded stale load of {identity} at {position}");
                    }
                }
            },
            Message::PreviewDecoded { position, identity, tier, generation, image } => {
                if self.previews.install_decoded(position, identity, tier, generation, image) {
                    self.events.push(DocumentEvent::PreviewReady { position, tier: tier.pixels() });
                }
            }
            Message::BatchWritten { id, result } => {
                self.settle(id, result);
            }
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Drive the autosave timer. Returns true if a flush was started or
    /// merged into the running one.
    pub fn tick(&mut self, now: Instant) -> bool {
        if !self.pipeline.due(now) {
            return false;
        }
        self.pipeline.cancel_autosave();
        self.start_flush();
        true
    }

    /// Start a background flush, or merge into the one in flight.
    pub fn flush(&mut self) {
        self.start_flush();
    }

    /// Wait for any running batch, then write everything inline.
    pub fn flush_sync(&mut self) -> Result<()> {
        self.pipeline.cancel_autosave();
        while self.pipeline.is_in_flight() {
            match self.pool.recv() {
                Some(message) => self.handle(message),
                None => return Err(DocumentError::SaveFailed("worker pool stopped mid-flush".into())),
            }
        }

        let Some((id, mut batch)) = self.take_batch() else {
            return Ok(());
        };
        render_previews(&mut batch, self.renderer.as_ref());
        let result = self.store.write_batch(&batch);
        match self.settle(id, result) {
            Some(Completion::Failed { message, .. }) => Err(DocumentError::SaveFailed(message)),
            _ => Ok(()),
        }
    }

    fn start_flush(&mut self) -> Option<u64> {
        if self.pipeline.is_in_flight() {
            self.pipeline.defer();
            return None;
        }
        let (id, batch) = self.take_batch()?;
        if !self.pool.submit(Job::WriteBatch { id, batch }) {
            self.settle(id, Err(StoreError::Unavailable("worker pool stopped".into())));
            return None;
        }
        Some(id)
    }

    /// Snapshot every dirty resident sheet, the world and the auxiliary
    /// records into one batch.
    fn take_batch(&mut self) -> Option<(u64, WriteBatch)> {
        let now = Instant::now();
        let keep = self.settings.resident_groups;
        let writes: Vec<SheetWrite> = self.cache.dirty_mut().map(|sheet| snapshot_sheet(sheet, keep)).collect();
        for write in writes {
            self.pipeline.stage(write, now);
        }

        let world = self.world.is_dirty().then(|| {
            let history = match self.world.history().to_record() {
                Ok(record) => Some(record),
                Err(e) => {
                    log::warn!(target: "sheetfield::persist", "world history not saved: {e}");
                    None
                }
            };
            (self.world.index().to_record(), history)
        });
        let world_history_saved = world.as_ref().is_some_and(|(_, h)| h.is_some());
        let aux = self.aux_dirty.then(|| (self.selection.clone(), self.camera.to_record()));

        let has_world = world.is_some();
        let has_aux = aux.is_some();
        let taken = self.pipeline.take_batch(world, aux)?;
        if has_world {
            self.world.mark_clean();
            if world_history_saved {
                self.world.unload_distant(keep);
            }
        }
        if has_aux {
            self.aux_dirty = false;
        }
        Some(taken)
    }

    fn settle(&mut self, id: u64, result: std::result::Result<(), StoreError>) -> Option<Completion> {
        let done = self.pipeline.complete(id, result, Instant::now())?;
        match &done.outcome {
            Completion::Saved { batch, identities, world } => {
                self.events.push(DocumentEvent::Saved(SavedEvent {
                    batch: *batch,
                    identities: identities.clone(),
                    world: *world,
                }));
            }
            Completion::Failed { identities, message, world, aux } => {
                if *world {
                    self.world.mark_dirty();
                }
                if *aux {
                    self.aux_dirty = true;
                }
                self.events.push(DocumentEvent::SaveFailed { identities: identities.clone(), message: message.clone() });
            }
        }
        if done.rerun {
            self.start_flush();
        }
        Some(done.outcome)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Place stored identities that nothing references in the scratch
    /// region. Runs on open; the CLI exposes it too.
    pub fn repair(&mut self) -> Result<Vec<(Position, Identity)>> {
        let stored = self.store.stored_identities()?;
        let mut orphans = find_orphans(&stored, &self.world);
        orphans.retain(|id| !self.pipeline.is_pending_delete(*id));
        if orphans.is_empty() {
            return Ok(Vec::new());
        }
        let (x, y) = self.settings.scratch_origin;
        let placed = repair_orphans(&mut self.world, &orphans, Position::new(x, y));
        self.pipeline.mark_dirty(Instant::now());
        self.events.push(DocumentEvent::OrphansRepaired { placed: placed.clone() });
        Ok(placed)
    }

    /// Positions of placed sheets whose text contains `query`
    /// (case-insensitive). Resident and staged content wins over the store.
    pub fn search(&self, query: &str) -> Result<Vec<Position>> {
        let needle = query.to_lowercase();
        let index = self.world.index();
        let mut hits: FxHashSet<Position> = self
            .store
            .search(query)?
            .into_iter()
            .filter_map(|id| index.position_of(id))
            .collect();

        for (position, identity) in index.entries() {
            let text = if let Some(sheet) = self.cache.get(position) {
                sheet.content().plain_text()
            } else if let Some(write) = self.pipeline.snapshot(identity) {
                write.content.plain_text()
            } else {
                continue;
            };
            if text.to_lowercase().contains(&needle) {
                hits.insert(position);
            } else {
                hits.remove(&position);
            }
        }

        let mut hits: Vec<Position> = hits.into_iter().collect();
        hits.sort_by_key(|p| (p.y, p.x));
        Ok(hits)
    }

    /// Permanently delete an unplaced identity's record on the next flush.
    pub fn purge(&mut self, identity: Identity) -> Result<()> {
        if self.world.index().is_placed(identity) {
            return Err(DocumentError::StillPlaced(identity));
        }
        self.pipeline.delete(identity, Instant::now());
        Ok(())
    }

    /// Cancel autosave, write everything, stop the workers.
    pub fn close(mut self) -> Result<()> {
        self.pipeline.cancel_autosave();
        let result = self.flush_sync();
        self.pool.shutdown();
        log::info!("closed document");
        result
    }
}
