//! Coordinating-thread runtime for a sheetfield document.
//!
//! One thread owns the world, every materialized sheet, and both caches.
//! Decoding, preview decoding and disk writes run on a small worker pool and
//! report back over a bounded channel; nothing is installed until `pump`
//! drains the result on the owning thread.

pub mod camera;
pub mod document;
pub mod error;
pub mod persistence;
pub mod preview_cache;
pub mod render;
pub mod repair;
pub mod sheet_cache;
pub mod worker;

pub use camera::Camera;
pub use document::{Document, DocumentStats, Materialize};
pub use error::{DocumentError, Result};
pub use preview_cache::{PreviewSource, PreviewState};
pub use render::{FlatRenderer, SheetRenderer};
pub use sheetfield_engine::events::DocumentEvent;
