//! Typed records over a `ByteStore`.
//!
//! Layout (one key per blob):
//!
//! ```text
//! sheet/<uuid>/content        SheetContent
//! sheet/<uuid>/history        HistoryRecord
//! sheet/<uuid>/preview/<px>   PNG, one per tier
//! sheet/<uuid>/text           plain-text index (also in the text column)
//! world/index                 WorldRecord
//! world/history               HistoryRecord
//! aux/selection, aux/camera   small UI state
//! ```

use std::sync::Arc;

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use sheetfield_engine::content::SheetContent;
use sheetfield_engine::history::HistoryRecord;
use sheetfield_engine::position::{Identity, Position};
use sheetfield_engine::world::WorldRecord;

use crate::byte_store::{BatchOp, ByteStore};
use crate::codec::{self, Encoding};
use crate::error::Result;
use crate::preview::{self, PreviewSet, Tier};

const WORLD_INDEX: &str = "world/index";
const WORLD_HISTORY: &str = "world/history";
const AUX_SELECTION: &str = "aux/selection";
const AUX_CAMERA: &str = "aux/camera";
const META_SAVED_AT: &str = "meta/saved_at";

fn sheet_prefix(identity: Identity) -> String {
    format!("sheet/{identity}/")
}

fn content_key(identity: Identity) -> String {
    format!("sheet/{identity}/content")
}

fn history_key(identity: Identity) -> String {
    format!("sheet/{identity}/history")
}

fn text_key(identity: Identity) -> String {
    format!("sheet/{identity}/text")
}

fn preview_key(identity: Identity, tier: Tier) -> String {
    format!("sheet/{identity}/preview/{}", tier.key_suffix())
}

/// Identity named by a `sheet/<uuid>/...` key.
fn identity_in_key(key: &str) -> Option<Identity> {
    key.strip_prefix("sheet/")?.split('/').next().and_then(Identity::parse)
}

/// Decoded sheet record.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetRecord {
    pub content: SheetContent,
    /// `None` when absent or unreadable; content always wins.
    pub history: Option<HistoryRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionRecord {
    pub cursor: Option<Position>,
    pub positions: Vec<Position>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraRecord {
    pub x: f64,
    pub y: f64,
    pub scale: f64,
}

/// One sheet's share of a flush batch. Fields are shared with the staging
/// area so a concurrent load can read the same snapshot.
#[derive(Debug, Clone)]
pub struct SheetWrite {
    pub identity: Identity,
    pub content: Arc<SheetContent>,
    pub history: Option<Arc<HistoryRecord>>,
    pub previews: Option<Arc<PreviewSet>>,
}

/// Everything one flush commits, atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub sheets: Vec<SheetWrite>,
    pub deletes: Vec<Identity>,
    pub world: Option<WorldRecord>,
    pub world_history: Option<HistoryRecord>,
    pub selection: Option<SelectionRecord>,
    pub camera: Option<CameraRecord>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.sheets.is_empty()
            && self.deletes.is_empty()
            && self.world.is_none()
            && self.world_history.is_none()
            && self.selection.is_none()
            && self.camera.is_none()
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.sheets.iter().map(|s| s.identity).collect()
    }
}

pub struct PersistentStore {
    bytes: Arc<dyn ByteStore>,
    encoding: Encoding,
}

impl PersistentStore {
    pub fn new(bytes: Arc<dyn ByteStore>, encoding: Encoding) -> Self {
        Self { bytes, encoding }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn byte_store(&self) -> &Arc<dyn ByteStore> {
        &self.bytes
    }

    fn read<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.bytes.get(key)? {
            Some(bytes) => Ok(Some(codec::decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(&self, ops: &mut Vec<BatchOp>, key: String, value: &T, text: Option<String>) -> Result<()> {
        let bytes = codec::encode(&key, value, self.encoding)?;
        ops.push(BatchOp::Put { key, bytes, text });
        Ok(())
    }

    /// `Ok(None)` when no record exists for `identity`. A content blob that
    /// fails to decode is an error; a bad history blob is dropped with a
    /// warning.
    pub fn read_sheet(&self, identity: Identity) -> Result<Option<SheetRecord>> {
        let Some(content) = self.read::<SheetContent>(&content_key(identity))? else {
            return Ok(None);
        };
        let history = match self.read::<HistoryRecord>(&history_key(identity)) {
            Ok(history) => history,
            Err(e) => {
                log::warn!(target: "sheetfield::persist", "dropping unreadable history for {identity}: {e}");
                None
            }
        };
        Ok(Some(SheetRecord { content, history }))
    }

    pub fn has_sheet(&self, identity: Identity) -> Result<bool> {
        Ok(self.bytes.get(&content_key(identity))?.is_some())
    }

    /// Encode and commit a batch in one transaction.
    pub fn write_batch(&self, batch: &WriteBatch) -> Result<()> {
        let mut ops = Vec::new();

        for identity in &batch.deletes {
            ops.push(BatchOp::DeletePrefix(sheet_prefix(*identity)));
        }

        for sheet in &batch.sheets {
            let id = sheet.identity;
            self.put(&mut ops, content_key(id), sheet.content.as_ref(), None)?;
            if let Some(history) = &sheet.history {
                self.put(&mut ops, history_key(id), history.as_ref(), None)?;
            }
            let text = sheet.content.plain_text();
            self.put(&mut ops, text_key(id), &text, Some(text.clone()))?;
            if let Some(previews) = &sheet.previews {
                for (tier, png) in previews.encode()? {
                    ops.push(BatchOp::Put { key: preview_key(id, tier), bytes: codec::seal_raw(&png), text: None });
                }
            }
        }

        if let Some(world) = &batch.world {
            self.put(&mut ops, WORLD_INDEX.to_string(), world, None)?;
        }
        if let Some(history) = &batch.world_history {
            self.put(&mut ops, WORLD_HISTORY.to_string(), history, None)?;
        }
        if let Some(selection) = &batch.selection {
            self.put(&mut ops, AUX_SELECTION.to_string(), selection, None)?;
        }
        if let Some(camera) = &batch.camera {
            self.put(&mut ops, AUX_CAMERA.to_string(), camera, None)?;
        }
        self.put(&mut ops, META_SAVED_AT.to_string(), &chrono::Utc::now(), None)?;

        self.bytes.put_batch(&ops)?;
        log::debug!(
            target: "sheetfield::persist",
            "committed {} blobs ({} sheets, {} deletes)",
            ops.len(),
            batch.sheets.len(),
            batch.deletes.len()
        );
        Ok(())
    }

    pub fn delete_sheet(&self, identity: Identity) -> Result<()> {
        self.bytes.delete_prefix(&sheet_prefix(identity))
    }

    pub fn read_world(&self) -> Result<WorldRecord> {
        Ok(self.read(WORLD_INDEX)?.unwrap_or_default())
    }

    pub fn read_world_history(&self) -> Result<Option<HistoryRecord>> {
        self.read(WORLD_HISTORY)
    }

    pub fn read_selection(&self) -> Result<Option<SelectionRecord>> {
        self.read(AUX_SELECTION)
    }

    pub fn read_camera(&self) -> Result<Option<CameraRecord>> {
        self.read(AUX_CAMERA)
    }

    pub fn last_saved(&self) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        self.read(META_SAVED_AT)
    }

    /// Every identity with a stored content blob.
    pub fn stored_identities(&self) -> Result<Vec<Identity>> {
        let mut ids: Vec<Identity> = self
            .bytes
            .keys_with_prefix("sheet/")?
            .iter()
            .filter(|k| k.ends_with("/content"))
            .filter_map(|k| identity_in_key(k))
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub fn read_preview(&self, identity: Identity, tier: Tier) -> Result<Option<RgbaImage>> {
        let key = preview_key(identity, tier);
        match self.bytes.get(&key)? {
            Some(bytes) => Ok(Some(preview::decode_png(codec::open_raw(&key, &bytes)?)?)),
            None => Ok(None),
        }
    }

    /// Identities whose plain-text index contains `query`.
    pub fn search(&self, query: &str) -> Result<Vec<Identity>> {
        Ok(self
            .bytes
            .search_text(query)?
            .iter()
            .filter(|k| k.ends_with("/text"))
            .filter_map(|k| identity_in_key(k))
            .collect())
    }

    /// Interchange form used for copy/paste and file export. Always compact.
    pub fn export_sheet(content: &SheetContent) -> Result<Vec<u8>> {
        codec::encode("export", content, Encoding::Compact)
    }

    /// Accepts either encoding.
    pub fn import_sheet(bytes: &[u8]) -> Result<SheetContent> {
        codec::decode("import", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_store::MemoryByteStore;
    use crate::StoreError;
    use image::Rgba;
    use sheetfield_engine::content::{Point, TextBlock};
    use sheetfield_engine::history::History;
    use sheetfield_engine::ops::SheetOp;

    fn store(encoding: Encoding) -> (Arc<MemoryByteStore>, PersistentStore) {
        let bytes = Arc::new(MemoryByteStore::new());
        let store = PersistentStore::new(bytes.clone(), encoding);
        (bytes, store)
    }

    fn text_content(text: &str) -> SheetContent {
        let mut content = SheetContent::new();
        content.texts.push(TextBlock::new(Point::new(0.0, 0.0), 100.0, text));
        content
    }

    fn sheet_write(identity: Identity, content: SheetContent) -> SheetWrite {
        SheetWrite { identity, content: Arc::new(content), history: None, previews: None }
    }

    #[test]
    fn test_sheet_roundtrip_in_both_encodings() {
        for encoding in [Encoding::Json, Encoding::Compact] {
            let (_, store) = store(encoding);
            let id = Identity::new();
            let history: History<SheetOp> = History::new();
            let batch = WriteBatch {
                sheets: vec![SheetWrite {
                    history: Some(Arc::new(history.to_record().unwrap())),
                    ..sheet_write(id, text_content("alpha"))
                }],
                ..Default::default()
            };
            store.write_batch(&batch).unwrap();

            let record = store.read_sheet(id).unwrap().unwrap();
            assert_eq!(record.content, text_content("alpha"));
            assert!(record.history.is_some());
            assert_eq!(store.stored_identities().unwrap(), vec![id]);
            assert!(store.last_saved().unwrap().is_some());
        }
    }

    #[test]
    fn test_missing_sheet_is_none() {
        let (_, store) = store(Encoding::Json);
        assert_eq!(store.read_sheet(Identity::new()).unwrap(), None);
        assert_eq!(store.read_world().unwrap(), WorldRecord::default());
    }

    #[test]
    fn test_corrupt_content_is_error_corrupt_history_is_dropped() {
        let (bytes, store) = store(Encoding::Json);
        let id = Identity::new();
        let batch = WriteBatch {
            sheets: vec![SheetWrite {
                history: Some(Arc::new(HistoryRecord::default())),
                ..sheet_write(id, text_content("x"))
            }],
            ..Default::default()
        };
        store.write_batch(&batch).unwrap();

        bytes.corrupt(&history_key(id), vec![0; 40]);
        let record = store.read_sheet(id).unwrap().unwrap();
        assert_eq!(record.history, None);

        bytes.corrupt(&content_key(id), vec![0; 40]);
        assert!(matches!(store.read_sheet(id), Err(StoreError::Checksum { .. })));
    }

    #[test]
    fn test_search_and_delete() {
        let (_, store) = store(Encoding::Compact);
        let a = Identity::new();
        let b = Identity::new();
        let batch = WriteBatch {
            sheets: vec![sheet_write(a, text_content("Budget review")), sheet_write(b, text_content("sketch"))],
            ..Default::default()
        };
        store.write_batch(&batch).unwrap();
        assert_eq!(store.search("budget").unwrap(), vec![a]);

        store.delete_sheet(a).unwrap();
        assert_eq!(store.read_sheet(a).unwrap(), None);
        assert!(store.search("budget").unwrap().is_empty());
        assert_eq!(store.stored_identities().unwrap(), vec![b]);
    }

    #[test]
    fn test_previews_written_for_every_tier() {
        let (_, store) = store(Encoding::Json);
        let id = Identity::new();
        let previews = PreviewSet::from_full(RgbaImage::from_pixel(1024, 1024, Rgba([200, 0, 0, 255])));
        let batch = WriteBatch {
            sheets: vec![SheetWrite { previews: Some(Arc::new(previews)), ..sheet_write(id, SheetContent::new()) }],
            ..Default::default()
        };
        store.write_batch(&batch).unwrap();
        for tier in Tier::ALL {
            let image = store.read_preview(id, tier).unwrap().unwrap();
            assert_eq!(image.width(), tier.pixels());
        }
    }

    #[test]
    fn test_aux_records() {
        let (_, store) = store(Encoding::Json);
        let batch = WriteBatch {
            selection: Some(SelectionRecord { cursor: Some(Position::new(1, 2)), positions: vec![] }),
            camera: Some(CameraRecord { x: 1.5, y: -2.0, scale: 128.0 }),
            ..Default::default()
        };
        store.write_batch(&batch).unwrap();
        assert_eq!(store.read_selection().unwrap().unwrap().cursor, Some(Position::new(1, 2)));
        assert_eq!(store.read_camera().unwrap().unwrap().scale, 128.0);
    }

    #[test]
    fn test_export_import_accepts_both_encodings() {
        let content = text_content("carry me");
        let exported = PersistentStore::export_sheet(&content).unwrap();
        assert_eq!(PersistentStore::import_sheet(&exported).unwrap(), content);

        let json = codec::encode("x", &content, Encoding::Json).unwrap();
        assert_eq!(PersistentStore::import_sheet(&json).unwrap(), content);
    }
}
