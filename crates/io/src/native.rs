// Native .sheetfield document format using SQLite

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::byte_store::{BatchOp, ByteStore};
use crate::error::{Result, StoreError};
use crate::RECORD_FORMAT_VERSION;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    key TEXT PRIMARY KEY,
    bytes BLOB NOT NULL,
    text TEXT               -- plain-text index, NULL for non-text records
);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// One SQLite file per document. A single connection guarded by a mutex;
/// workers reading concurrently serialize on it, which is fine for the
/// small per-record reads paging does.
pub struct SqliteByteStore {
    conn: Mutex<Connection>,
}

impl SqliteByteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;

        let version: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'format_version'", [], |row| row.get(0))
            .optional()?;
        match version.and_then(|v| v.parse::<u32>().ok()) {
            Some(found) if found > RECORD_FORMAT_VERSION => {
                return Err(StoreError::Version { found, supported: RECORD_FORMAT_VERSION });
            }
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT OR REPLACE INTO meta (key, value) VALUES ('format_version', ?1)",
                    params![RECORD_FORMAT_VERSION.to_string()],
                )?;
            }
        }

        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?)
    }
}

/// `LIKE` pattern matching everything that starts with `prefix`.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

impl ByteStore for SqliteByteStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row("SELECT bytes FROM records WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?)
    }

    fn put_batch(&self, ops: &[BatchOp]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut put = tx.prepare_cached("INSERT OR REPLACE INTO records (key, bytes, text) VALUES (?1, ?2, ?3)")?;
            let mut delete = tx.prepare_cached("DELETE FROM records WHERE key LIKE ?1 ESCAPE '\\'")?;
            for op in ops {
                match op {
                    BatchOp::Put { key, bytes, text } => {
                        put.execute(params![key, bytes, text])?;
                    }
                    BatchOp::DeletePrefix(prefix) => {
                        delete.execute(params![like_prefix(prefix)])?;
                    }
                }
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('saved_at', ?1)",
            params![chrono::Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key FROM records WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key")?;
        let keys = stmt
            .query_map(params![like_prefix(prefix)], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    fn search_text(&self, query: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key FROM records WHERE text IS NOT NULL AND instr(lower(text), lower(?1)) > 0 ORDER BY key",
        )?;
        let keys = stmt
            .query_map(params![query], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn put(key: &str, bytes: &[u8], text: Option<&str>) -> BatchOp {
        BatchOp::Put { key: key.into(), bytes: bytes.to_vec(), text: text.map(String::from) }
    }

    #[test]
    fn test_records_survive_reopen() {
        let temp_file = NamedTempFile::with_suffix(".sheetfield").unwrap();
        let path = temp_file.path();

        {
            let store = SqliteByteStore::open(path).unwrap();
            store.put_batch(&[put("world/index", b"abc", None)]).unwrap();
        }

        let store = SqliteByteStore::open(path).unwrap();
        assert_eq!(store.get("world/index").unwrap(), Some(b"abc".to_vec()));
        assert_eq!(store.get("missing").unwrap(), None);
        assert!(store.meta("saved_at").unwrap().is_some());
    }

    #[test]
    fn test_prefix_delete_does_not_treat_underscore_as_wildcard() {
        let store = SqliteByteStore::open_in_memory().unwrap();
        store
            .put_batch(&[put("sheet/a_1/content", b"1", None), put("sheet/ab1/content", b"2", None)])
            .unwrap();
        store.delete_prefix("sheet/a_1/").unwrap();
        assert_eq!(store.keys_with_prefix("sheet/").unwrap(), vec!["sheet/ab1/content".to_string()]);
    }

    #[test]
    fn test_search_text_column() {
        let store = SqliteByteStore::open_in_memory().unwrap();
        store
            .put_batch(&[put("sheet/a/text", b"", Some("Meeting NOTES")), put("sheet/b/text", b"", Some("groceries"))])
            .unwrap();
        assert_eq!(store.search_text("notes").unwrap(), vec!["sheet/a/text".to_string()]);
    }

    #[test]
    fn test_newer_format_version_rejected() {
        let temp_file = NamedTempFile::with_suffix(".sheetfield").unwrap();
        let path = temp_file.path();
        {
            let conn = Connection::open(path).unwrap();
            conn.execute_batch(SCHEMA).unwrap();
            conn.execute("INSERT INTO meta (key, value) VALUES ('format_version', '99')", [])
                .unwrap();
        }
        assert!(matches!(
            SqliteByteStore::open(path),
            Err(StoreError::Version { found: 99, .. })
        ));
    }
}
