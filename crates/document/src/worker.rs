//! Background worker pool.
//!
//! Jobs go out on an unbounded queue; results come back on a bounded channel
//! drained by the coordinating thread. A job never touches coordinator state:
//! it gets owned inputs plus a cancellation token, and its result is only
//! installed after the coordinator re-checks the token and the slot's
//! generation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use image::RgbaImage;

use sheetfield_engine::content::SheetContent;
use sheetfield_engine::history::{History, HistoryError};
use sheetfield_engine::position::{Identity, Position};
use sheetfield_engine::sheet::Sheet;
use sheetfield_io::{PersistentStore, PreviewSet, SheetWrite, StoreError, Tier, WriteBatch};

use crate::render::SheetRenderer;

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub enum Job {
    LoadSheet {
        position: Position,
        identity: Identity,
        generation: u64,
        token: CancelToken,
        /// Snapshot pending write, read instead of the store.
        staged: Option<SheetWrite>,
    },
    DecodePreview {
        position: Position,
        identity: Identity,
        tier: Tier,
        generation: u64,
        token: CancelToken,
    },
    WriteBatch {
        id: u64,
        batch: WriteBatch,
    },
}

pub enum LoadOutcome {
    Cancelled,
    Loaded {
        sheet: Box<Sheet>,
        /// The stored content was unreadable; `sheet` holds a diagnostic.
        placeholder: bool,
        history_error: Option<HistoryError>,
    },
}

pub enum Message {
    SheetLoaded {
        position: Position,
        identity: Identity,
        generation: u64,
        outcome: LoadOutcome,
    },
    PreviewDecoded {
        position: Position,
        identity: Identity,
        tier: Tier,
        generation: u64,
        image: Option<RgbaImage>,
    },
    BatchWritten {
        id: u64,
        result: Result<(), StoreError>,
    },
}

pub struct WorkerPool {
    jobs: Option<Sender<Job>>,
    results: Receiver<Message>,
    handles: Vec<JoinHandle<()>>,
    outstanding: usize,
}

impl WorkerPool {
    pub fn spawn(
        store: Arc<PersistentStore>,
        renderer: Arc<dyn SheetRenderer>,
        count: usize,
        capacity: usize,
    ) -> std::io::Result<Self> {
        let (job_tx, job_rx) = unbounded::<Job>();
        let (result_tx, result_rx) = bounded::<Message>(capacity.max(1));

        let mut handles = Vec::with_capacity(count);
        for i in 0..count.max(1) {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let store = Arc::clone(&store);
            let renderer = Arc::clone(&renderer);
            let handle = std::thread::Builder::new()
                .name(format!("sheetfield-worker-{i}"))
                .spawn(move || worker_main(store, renderer, jobs, results))?;
            handles.push(handle);
        }

        Ok(Self { jobs: Some(job_tx), results: result_rx, handles, outstanding: 0 })
    }

    /// Queue a job. Returns false once the pool is shut down.
    pub fn submit(&mut self, job: Job) -> bool {
        let Some(jobs) = &self.jobs else {
            return false;
        };
        if jobs.send(job).is_err() {
            return false;
        }
        self.outstanding += 1;
        true
    }

    /// Jobs submitted whose result has not been received yet.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        let message = self.results.try_recv().ok()?;
        self.outstanding = self.outstanding.saturating_sub(1);
        Some(message)
    }

    /// Block for the next result. `None` when nothing is outstanding.
    pub fn recv(&mut self) -> Option<Message> {
        if self.outstanding == 0 {
            return None;
        }
        let message = self.results.recv().ok()?;
        self.outstanding -= 1;
        Some(message)
    }

    /// Close the job queue and join every worker. Results still in the
    /// channel are dropped.
    pub fn shutdown(&mut self) {
        self.jobs = None;
        for handle in self.handles.drain(..) {
            // Keep draining so no worker stays blocked on a full result channel.
            while !handle.is_finished() {
                let _ = self.results.recv_timeout(std::time::Duration::from_millis(5));
            }
            if handle.join().is_err() {
                log::error!("worker thread panicked");
            }
        }
        self.outstanding = 0;
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_main(
    store: Arc<PersistentStore>,
    renderer: Arc<dyn SheetRenderer>,
    jobs: Receiver<Job>,
    results: Sender<Message>,
) {
    while let Ok(job) = jobs.recv() {
        let message = run_job(&store, renderer.as_ref(), job);
        if results.send(message).is_err() {
            break;
        }
    }
}

fn run_job(store: &PersistentStore, renderer: &dyn SheetRenderer, job: Job) -> Message {
    match job {
        Job::LoadSheet { position, identity, generation, token, staged } => {
            let outcome = if token.is_cancelled() {
                LoadOutcome::Cancelled
            } else {
                let outcome = load_sheet(store, identity, staged);
                // Checked again so a load superseded mid-decode reports as such.
                if token.is_cancelled() {
                    LoadOutcome::Cancelled
                } else {
                    outcome
                }
            };
            Message::SheetLoaded { position, identity, generation, outcome }
        }
        Job::DecodePreview { position, identity, tier, generation, token } => {
            let image = if token.is_cancelled() {
                None
            } else {
                match store.read_preview(identity, tier) {
                    Ok(image) => image,
                    Err(e) => {
                        log::debug!(target: "sheetfield::preview", "preview {identity}@{} unreadable: {e}", tier.pixels());
                        None
                    }
                }
            };
            let image = if token.is_cancelled() { None } else { image };
            Message::PreviewDecoded { position, identity, tier, generation, image }
        }
        Job::WriteBatch { id, mut batch } => {
            render_previews(&mut batch, renderer);
            let result = store.write_batch(&batch);
            Message::BatchWritten { id, result }
        }
    }
}

/// Fill in the five-tier preview set of every sheet in `batch` that lacks
/// one. Previews are only ever generated on flush.
pub(crate) fn render_previews(batch: &mut WriteBatch, renderer: &dyn SheetRenderer) {
    for sheet in &mut batch.sheets {
        if sheet.previews.is_none() {
            let full = renderer.render(&sheet.content, Tier::T1024.pixels());
            sheet.previews = Some(Arc::new(PreviewSet::from_full(full)));
        }
    }
}

fn load_sheet(store: &PersistentStore, identity: Identity, staged: Option<SheetWrite>) -> LoadOutcome {
    if let Some(staged) = staged {
        let history = staged.history.as_deref().cloned();
        let (sheet, history_error) = Sheet::from_record(identity, staged.content.as_ref().clone(), history);
        return LoadOutcome::Loaded { sheet: Box::new(sheet), placeholder: false, history_error };
    }

    match store.read_sheet(identity) {
        Ok(Some(record)) => {
            let (sheet, history_error) = Sheet::from_record(identity, record.content, record.history);
            LoadOutcome::Loaded { sheet: Box::new(sheet), placeholder: false, history_error }
        }
        Ok(None) => {
            log::debug!(target: "sheetfield::paging", "no stored record for {identity}; starting empty");
            LoadOutcome::Loaded { sheet: Box::new(Sheet::new(identity)), placeholder: false, history_error: None }
        }
        Err(e) => {
            log::warn!(target: "sheetfield::paging", "sheet {identity} unreadable, substituting placeholder: {e}");
            let content = SheetContent::diagnostic(&identity.to_string(), &e.to_string());
            let sheet = Sheet::from_parts(identity, content, History::new());
            LoadOutcome::Loaded { sheet: Box::new(sheet), placeholder: true, history_error: None }
        }
    }
}
