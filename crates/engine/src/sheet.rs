//! A materialized sheet: content plus its own undo history.

use crate::content::SheetContent;
use crate::history::{Applied, History, HistoryError, HistoryRecord, Replayer, WalkReport};
use crate::ops::SheetOp;
use crate::position::Identity;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EditError {
    #[error("edit rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    History(#[from] HistoryError),
}

#[derive(Debug, Clone)]
pub struct Sheet {
    identity: Identity,
    content: SheetContent,
    history: History<SheetOp>,
    /// Bumped on every content change so observers can detect staleness.
    revision: u64,
    dirty: bool,
}

impl Sheet {
    pub fn new(identity: Identity) -> Self {
        Self::from_parts(identity, SheetContent::new(), History::new())
    }

    pub fn from_parts(identity: Identity, content: SheetContent, history: History<SheetOp>) -> Self {
        Self { identity, content, history, revision: 0, dirty: false }
    }

    /// Rebuild from stored parts. A history record that fails validation is
    /// dropped (content wins) and reported to the caller.
    pub fn from_record(
        identity: Identity,
        content: SheetContent,
        history: Option<HistoryRecord>,
    ) -> (Self, Option<HistoryError>) {
        match history.map(History::from_record) {
            Some(Ok(history)) => (Self::from_parts(identity, content, history), None),
            Some(Err(e)) => (Self::from_parts(identity, content, History::new()), Some(e)),
            None => (Self::from_parts(identity, content, History::new()), None),
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn content(&self) -> &SheetContent {
        &self.content
    }

    pub fn history(&self) -> &History<SheetOp> {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut History<SheetOp> {
        &mut self.history
    }

    pub fn revision(&self) -> u64 {
        self.revision
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

    /// Apply a live edit and record it in the open undo group.
    ///
    /// Returns the item as actually applied (indexes may have been clamped).
    pub fn apply(&mut self, op: SheetOp) -> Result<SheetOp, EditError> {
        let before = matches!(op, SheetOp::ReplaceContent { .. }).then(|| self.content.clone());
        let applied = match self.content.set(&op) {
            Applied::Exact => op,
            Applied::Clamped(actual) => actual,
            Applied::Failed(reason) => return Err(EditError::Rejected(reason)),
        };
        let undo = match &before {
            Some(before) => applied.undo_for(before),
            None => applied.undo_for(&self.content),
        };
        self.history.append(undo, applied.clone())?;
        self.touch();
        Ok(applied)
    }

    pub fn new_group(&mut self) {
        self.history.new_group();
    }

    /// Move the content to history index `target`.
    pub fn walk_to(&mut self, target: usize) -> Result<WalkReport, HistoryError> {
        let report = self.history.walk_to(target, &mut self.content)?;
        self.touch();
        Ok(report)
    }

    pub fn undo(&mut self) -> Option<WalkReport> {
        let report = self.history.undo(&mut self.content)?;
        self.touch();
        Some(report)
    }

    pub fn redo(&mut self) -> Option<WalkReport> {
        let report = self.history.redo(&mut self.content)?;
        self.touch();
        Some(report)
    }

    /// Content replaced wholesale from outside the history (e.g. decode
    /// fallback). Does not record an undo item.
    pub fn replace_content_untracked(&mut self, content: SheetContent) {
        self.content = content;
        self.revision += 1;
    }

    fn touch(&mut self) {
        self.revision += 1;
        self.dirty = true;
    }
}
