//! Event types for document change notifications.
//!
//! The document runtime queues these on the coordinating thread; hosts drain
//! them after each `pump` instead of polling cache state. Tests use the
//! collector to check ordering around loads, previews and saves.

use crate::history::WalkReport;
use crate::position::{Identity, Position};

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentEvent {
    /// A background load finished and the sheet is now resident.
    SheetLoaded(SheetLoadedEvent),

    /// A preview image was installed for a position.
    PreviewReady { position: Position, tier: u32 },

    /// A flush batch committed.
    Saved(SavedEvent),

    /// A flush batch failed. In-memory state is untouched and the affected
    /// records stay pending for the next autosave.
    SaveFailed { identities: Vec<Identity>, message: String },

    /// Identities found in storage but absent from the index were parked in
    /// the scratch region.
    OrphansRepaired { placed: Vec<(Position, Identity)> },

    /// An undo/redo walk had to clamp, rewrite or skip slots.
    HistoryRepaired { position: Option<Position>, report: WalkReport },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SheetLoadedEvent {
    pub position: Position,
    pub identity: Identity,
    /// The stored record was unreadable and a diagnostic placeholder was
    /// installed instead.
    pub placeholder: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SavedEvent {
    /// Flush batch sequence number, starting at 1.
    pub batch: u64,
    pub identities: Vec<Identity>,
    /// The world index or its history was part of the batch.
    pub world: bool,
}

/// Simple event collector.
#[derive(Debug, Default)]
pub struct EventCollector {
    events: Vec<DocumentEvent>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn push(&mut self, event: DocumentEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[DocumentEvent] {
        &self.events
    }

    pub fn take(&mut self) -> Vec<DocumentEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn saved(&self) -> Vec<&SavedEvent> {
        self.events
            .iter()
            .filter_map(|e| match e {
                DocumentEvent::Saved(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn loaded(&self) -> Vec<&SheetLoadedEvent> {
        self.events
            .iter()
            .filter_map(|e| match e {
                DocumentEvent::SheetLoaded(l) => Some(l),
                _ => None,
            })
            .collect()
    }
}
