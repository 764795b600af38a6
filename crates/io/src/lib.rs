// Persistent storage for sheetfield documents

pub mod byte_store;
pub mod codec;
pub mod error;
pub mod native;
pub mod preview;
pub mod store;

pub use byte_store::{BatchOp, ByteStore, MemoryByteStore};
pub use codec::Encoding;
pub use error::{Result, StoreError};
pub use native::SqliteByteStore;
pub use preview::{PreviewSet, Tier};
pub use store::{CameraRecord, PersistentStore, SelectionRecord, SheetRecord, SheetWrite, WriteBatch};

/// Record format version
/// Increment when blob layout changes in a way that old versions can't read
pub const RECORD_FORMAT_VERSION: u32 = 1;
