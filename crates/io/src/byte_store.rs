// Byte-storage collaborator: a flat key space of blobs with an optional
// searchable text column.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Put { key: String, bytes: Vec<u8>, text: Option<String> },
    DeletePrefix(String),
}

/// Backend for `PersistentStore`.
///
/// Implementations must be safe to read from worker threads while a single
/// writer commits a batch. `put_batch` is all-or-nothing.
pub trait ByteStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put_batch(&self, ops: &[BatchOp]) -> Result<()>;

    fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.put_batch(&[BatchOp::DeletePrefix(prefix.to_string())])
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Keys whose text column contains `query`, case-insensitively.
    fn search_text(&self, query: &str) -> Result<Vec<String>>;
}

/// In-memory store. Used by tests and for scratch documents.
#[derive(Debug, Default)]
pub struct MemoryByteStore {
    records: RwLock<BTreeMap<String, (Vec<u8>, Option<String>)>>,
    fail_writes: AtomicBool,
}

impl MemoryByteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put_batch` fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Overwrite a stored blob in place, bypassing batching.
    pub fn corrupt(&self, key: &str, bytes: Vec<u8>) {
        if let Some(entry) = self.records.write().get_mut(key) {
            entry.0 = bytes;
        }
    }
}

impl ByteStore for MemoryByteStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.records.read().get(key).map(|(bytes, _)| bytes.clone()))
    }

    fn put_batch(&self, ops: &[BatchOp]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        let mut records = self.records.write();
        for op in ops {
            match op {
                BatchOp::Put { key, bytes, text } => {
                    records.insert(key.clone(), (bytes.clone(), text.clone()));
                }
                BatchOp::DeletePrefix(prefix) => records.retain(|k, _| !k.starts_with(prefix.as_str())),
            }
        }
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .records
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn search_text(&self, query: &str) -> Result<Vec<String>> {
        let needle = query.to_lowercase();
        Ok(self
            .records
            .read()
            .iter()
            .filter(|(_, (_, text))| text.as_ref().is_some_and(|t| t.to_lowercase().contains(&needle)))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
