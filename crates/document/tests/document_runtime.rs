// End-to-end tests for the document runtime: paging, previews, persistence.
// Run with: cargo test -p sheetfield-document --test document_runtime

use std::sync::Arc;
use std::time::{Duration, Instant};

use sheetfield_config::{DocumentSettings, StorageEncoding};
use sheetfield_document::{
    Camera, Document, DocumentError, DocumentEvent, FlatRenderer, Materialize, PreviewState, SheetRenderer,
};
use sheetfield_engine::content::{Color, Line, Plane, Point, SheetContent, TextBlock};
use sheetfield_engine::history::ROOT;
use sheetfield_engine::ops::SheetOp;
use sheetfield_engine::position::{Identity, Position};
use sheetfield_io::{Encoding, MemoryByteStore, PersistentStore, SheetWrite, Tier, WriteBatch};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open_with(bytes: &Arc<MemoryByteStore>, settings: DocumentSettings) -> Document {
    let store = Arc::new(PersistentStore::new(bytes.clone(), Encoding::Json));
    Document::open(store, settings, Arc::new(FlatRenderer)).expect("open document")
}

/// Settings under which only explicitly requested sheets materialize.
fn manual_paging() -> DocumentSettings {
    DocumentSettings { materialize_min_scale: 1e9, ..Default::default() }
}

fn line(y: f32) -> Line {
    Line::new(vec![Point::new(100.0, y), Point::new(900.0, y)], 4.0, Color::BLACK)
}

fn plane() -> Plane {
    Plane {
        outline: vec![Point::new(0.0, 0.0), Point::new(200.0, 0.0), Point::new(200.0, 200.0)],
        color: Color(0x3366_99FF),
    }
}

fn insert_line(doc: &mut Document, p: Position, y: f32) {
    let at = doc.sheet(p).expect("resident").content().lines.len();
    doc.apply_edit(p, SheetOp::InsertLines { at, lines: vec![line(y)] }).expect("edit");
}

fn saved_batches(events: &[DocumentEvent]) -> Vec<(u64, Vec<Identity>)> {
    events
        .iter()
        .filter_map(|e| match e {
            DocumentEvent::Saved(s) => Some((s.batch, s.identities.clone())),
            _ => None,
        })
        .collect()
}

/// Store a sheet record with previews but no world entry.
fn store_unplaced(bytes: &Arc<MemoryByteStore>, content: SheetContent) -> Identity {
    let store = PersistentStore::new(bytes.clone(), Encoding::Json);
    let identity = Identity::new();
    let previews = sheetfield_io::PreviewSet::from_full(FlatRenderer.render(&content, 1024));
    let batch = WriteBatch {
        sheets: vec![SheetWrite {
            identity,
            content: Arc::new(content),
            history: None,
            previews: Some(Arc::new(previews)),
        }],
        ..Default::default()
    };
    store.write_batch(&batch).expect("write");
    identity
}

// ---------------------------------------------------------------------------
// Undo
// ---------------------------------------------------------------------------

#[test]
fn test_line_then_plane_undo_and_redo() {
    let bytes = Arc::new(MemoryByteStore::new());
    let mut doc = open_with(&bytes, DocumentSettings::default());
    let p = Position::ORIGIN;
    doc.new_sheet(p).unwrap();

    doc.apply_edit(p, SheetOp::InsertLines { at: 0, lines: vec![line(10.0)] }).unwrap();
    doc.new_group(p).unwrap();
    doc.apply_edit(p, SheetOp::InsertPlanes { at: 0, planes: vec![plane()] }).unwrap();
    let end = doc.sheet(p).unwrap().history().top();

    doc.undo_to(p, ROOT).unwrap();
    let content = doc.sheet(p).unwrap().content();
    assert!(content.lines.is_empty());
    assert!(content.planes.is_empty());

    doc.redo_to(p, end).unwrap();
    let content = doc.sheet(p).unwrap().content();
    assert_eq!(content.lines, vec![line(10.0)]);
    assert_eq!(content.planes, vec![plane()]);
}

#[test]
fn test_walks_reach_any_index_under_either_name() {
    let bytes = Arc::new(MemoryByteStore::new());
    let mut doc = open_with(&bytes, DocumentSettings::default());
    let p = Position::ORIGIN;
    doc.new_sheet(p).unwrap();
    insert_line(&mut doc, p, 10.0);
    doc.new_group(p).unwrap();
    insert_line(&mut doc, p, 20.0);
    let end = doc.sheet(p).unwrap().history().top();

    doc.redo_to(p, ROOT).unwrap();
    assert!(doc.sheet(p).unwrap().content().lines.is_empty());
    doc.undo_to(p, end).unwrap();
    assert_eq!(doc.sheet(p).unwrap().content().lines.len(), 2);

    doc.world_redo_to(ROOT).unwrap();
    assert!(doc.world().index().is_empty());
    doc.world_undo_to(doc.world().history().len()).unwrap();
    assert!(doc.world().index().identity_at(p).is_some());
}

#[test]
fn test_sheet_history_survives_reopen() {
    let bytes = Arc::new(MemoryByteStore::new());
    let p = Position::ORIGIN;
    {
        let mut doc = open_with(&bytes, DocumentSettings::default());
        doc.new_sheet(p).unwrap();
        insert_line(&mut doc, p, 10.0);
        doc.new_group(p).unwrap();
        insert_line(&mut doc, p, 20.0);
        doc.close().unwrap();
    }

    let mut doc = open_with(&bytes, DocumentSettings::default());
    doc.materialize_blocking(p).unwrap();
    assert_eq!(doc.sheet(p).unwrap().content().lines.len(), 2);
    doc.sheet_undo(p).unwrap().expect("undo available");
    assert_eq!(doc.sheet(p).unwrap().content().lines, vec![line(10.0)]);
    doc.sheet_redo(p).unwrap().expect("redo available");
    assert_eq!(doc.sheet(p).unwrap().content().lines.len(), 2);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn test_sqlite_file_reopens_under_other_encoding() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("canvas.sheetfield");
    let p = Position::new(-3, 8);
    {
        let settings = DocumentSettings { encoding: StorageEncoding::Compact, ..Default::default() };
        let mut doc = Document::open_path(&path, settings).unwrap();
        doc.new_sheet(p).unwrap();
        doc.apply_edit(
            p,
            SheetOp::InsertTexts { at: 0, texts: vec![TextBlock::new(Point::new(5.0, 5.0), 200.0, "Field Notes")] },
        )
        .unwrap();
        doc.close().unwrap();
    }

    let mut doc = Document::open_path(&path, DocumentSettings::default()).unwrap();
    assert_eq!(doc.search("field notes").unwrap(), vec![p]);
    let sheet = doc.materialize_blocking(p).unwrap();
    assert_eq!(sheet.content().texts[0].text, "Field Notes");
    assert!(!sheet.is_dirty());
}

#[test]
fn test_flush_coalesces_into_one_batch() {
    let bytes = Arc::new(MemoryByteStore::new());
    let mut doc = open_with(&bytes, DocumentSettings::default());
    let (a, b) = (Position::new(0, 0), Position::new(1, 0));
    let id_a = doc.new_sheet(a).unwrap();
    let id_b = doc.new_sheet(b).unwrap();
    insert_line(&mut doc, a, 10.0);
    insert_line(&mut doc, b, 10.0);

    doc.flush();
    assert_eq!(doc.stats().batches_started, 1);

    // Mutation while the batch is running: merged, not a second writer.
    insert_line(&mut doc, b, 20.0);
    doc.flush();
    doc.flush();
    assert_eq!(doc.stats().batches_started, 1);

    doc.wait_idle();
    let batches = saved_batches(&doc.drain_events());
    assert_eq!(batches.len(), 2);
    let mut first = batches[0].1.clone();
    first.sort();
    let mut both = vec![id_a, id_b];
    both.sort();
    assert_eq!(first, both);
    assert_eq!(batches[1].1, vec![id_b]);

    let stored = doc.store().read_sheet(id_b).unwrap().unwrap();
    assert_eq!(stored.content.lines.len(), 2);
}

#[test]
fn test_remove_dirty_resident_keeps_record() {
    let bytes = Arc::new(MemoryByteStore::new());
    let mut doc = open_with(&bytes, DocumentSettings::default());
    let p = Position::new(2, 2);
    let id = doc.new_sheet(p).unwrap();
    insert_line(&mut doc, p, 10.0);
    doc.flush_sync().unwrap();

    insert_line(&mut doc, p, 20.0);
    doc.world_new_group();
    assert_eq!(doc.remove_sheet(p).unwrap(), id);
    assert!(doc.world().index().identity_at(p).is_none());
    assert!(!doc.is_resident(p));

    doc.wait_idle();
    let record = doc.store().read_sheet(id).unwrap().expect("record kept");
    assert_eq!(record.content.lines.len(), 2);

    doc.world_undo().unwrap().expect("world undo");
    assert_eq!(doc.world().index().identity_at(p), Some(id));
    let sheet = doc.materialize_blocking(p).unwrap();
    assert_eq!(sheet.content().lines.len(), 2);
}

#[test]
fn test_save_failure_is_reported_and_retried() {
    let bytes = Arc::new(MemoryByteStore::new());
    let mut doc = open_with(&bytes, DocumentSettings::default());
    let p = Position::ORIGIN;
    let id = doc.new_sheet(p).unwrap();
    insert_line(&mut doc, p, 10.0);

    bytes.set_fail_writes(true);
    assert!(matches!(doc.flush_sync(), Err(DocumentError::SaveFailed(_))));
    let failed = doc
        .drain_events()
        .into_iter()
        .any(|e| matches!(e, DocumentEvent::SaveFailed { identities, .. } if identities == vec![id]));
    assert!(failed);
    assert!(doc.has_unsaved());
    // In-memory state is untouched.
    assert_eq!(doc.sheet(p).unwrap().content().lines.len(), 1);

    bytes.set_fail_writes(false);
    doc.flush_sync().unwrap();
    assert!(!doc.has_unsaved());
    assert_eq!(doc.store().read_sheet(id).unwrap().unwrap().content.lines.len(), 1);
    assert_eq!(doc.store().read_world().unwrap().entries.len(), 1);
}

#[test]
fn test_autosave_after_quiet_period() {
    let bytes = Arc::new(MemoryByteStore::new());
    let settings = DocumentSettings { autosave_quiet_ms: 500, ..Default::default() };
    let mut doc = open_with(&bytes, settings);
    let p = Position::ORIGIN;
    doc.new_sheet(p).unwrap();
    insert_line(&mut doc, p, 10.0);

    assert!(!doc.tick(Instant::now()));
    assert!(doc.tick(Instant::now() + Duration::from_secs(2)));
    doc.wait_idle();
    assert_eq!(saved_batches(&doc.drain_events()).len(), 1);
    assert!(!doc.tick(Instant::now() + Duration::from_secs(10)));
}

#[test]
fn test_camera_and_selection_persist() {
    let bytes = Arc::new(MemoryByteStore::new());
    {
        let mut doc = open_with(&bytes, DocumentSettings::default());
        doc.set_camera(Camera::new(10.0, -4.0, 128.0, 800.0, 600.0));
        doc.set_cursor(Some(Position::new(11, -3)));
        doc.set_selection(vec![Position::new(11, -3), Position::new(12, -3)]);
        doc.close().unwrap();
    }
    let doc = open_with(&bytes, DocumentSettings::default());
    assert_eq!(doc.camera().x, 10.0);
    assert_eq!(doc.camera().scale, 128.0);
    assert_eq!(doc.selection().cursor, Some(Position::new(11, -3)));
    assert_eq!(doc.selection().positions.len(), 2);
}

// ---------------------------------------------------------------------------
// Paging
// ---------------------------------------------------------------------------

#[test]
fn test_load_then_unload_never_installs() {
    let bytes = Arc::new(MemoryByteStore::new());
    let p = Position::ORIGIN;
    {
        let mut doc = open_with(&bytes, DocumentSettings::default());
        doc.new_sheet(p).unwrap();
        insert_line(&mut doc, p, 10.0);
        doc.close().unwrap();
    }

    let mut doc = open_with(&bytes, manual_paging());
    doc.wait_idle();
    doc.drain_events();
    assert_eq!(doc.materialize(p), Materialize::Pending);
    assert_eq!(doc.materialize(p), Materialize::Pending);
    doc.unload(p);
    doc.wait_idle();

    assert!(!doc.is_resident(p));
    assert!(doc.drain_events().iter().all(|e| !matches!(e, DocumentEvent::SheetLoaded(_))));
}

#[test]
fn test_unload_then_load_is_idempotent() {
    let bytes = Arc::new(MemoryByteStore::new());
    let mut doc = open_with(&bytes, manual_paging());
    let p = Position::new(4, 4);
    doc.new_sheet(p).unwrap();
    insert_line(&mut doc, p, 10.0);
    doc.new_group(p).unwrap();
    insert_line(&mut doc, p, 30.0);
    let before = doc.sheet(p).unwrap().content().clone();

    // Dirty unload: served from the staged snapshot or the store.
    doc.unload(p);
    assert!(!doc.is_resident(p));
    assert_eq!(doc.materialize_blocking(p).unwrap().content(), &before);

    // Clean unload.
    doc.wait_idle();
    doc.unload(p);
    assert_eq!(doc.materialize_blocking(p).unwrap().content(), &before);
}

#[test]
fn test_camera_drives_residency() {
    let bytes = Arc::new(MemoryByteStore::new());
    let mut doc = open_with(&bytes, DocumentSettings::default());
    let near = Position::new(1, 1);
    let far = Position::new(40, 40);
    doc.new_sheet(near).unwrap();
    doc.new_sheet(far).unwrap();
    // Last edited stays pinned; move it out of the way.
    doc.new_sheet(Position::new(-20, -20)).unwrap();
    doc.flush_sync().unwrap();

    doc.set_camera(Camera::new(38.0, 38.0, 256.0, 1024.0, 768.0));
    doc.wait_idle();
    assert!(doc.is_resident(far));
    assert!(!doc.is_resident(near));
    // Evicted sheets leave a preview behind.
    assert!(doc.preview(near).is_some());

    doc.set_camera(Camera::new(0.0, 0.0, 256.0, 1024.0, 768.0));
    doc.wait_idle();
    assert!(doc.is_resident(near));
    assert!(!doc.is_resident(far));
    assert!(doc.preview(far).is_some());
}

#[test]
fn test_corrupt_record_loads_placeholder() {
    let bytes = Arc::new(MemoryByteStore::new());
    let p = Position::ORIGIN;
    let id = {
        let mut doc = open_with(&bytes, DocumentSettings::default());
        let id = doc.new_sheet(p).unwrap();
        insert_line(&mut doc, p, 10.0);
        doc.close().unwrap();
        id
    };
    bytes.corrupt(&format!("sheet/{id}/content"), b"garbage".to_vec());

    let mut doc = open_with(&bytes, manual_paging());
    let sheet = doc.materialize_blocking(p).unwrap();
    assert!(!sheet.is_dirty());
    assert!(sheet.content().plain_text().contains("Unreadable"));
    let placeholder = doc
        .drain_events()
        .into_iter()
        .any(|e| matches!(e, DocumentEvent::SheetLoaded(l) if l.placeholder && l.identity == id));
    assert!(placeholder);
}

// ---------------------------------------------------------------------------
// Previews
// ---------------------------------------------------------------------------

#[test]
fn test_preview_tiers_never_regress() {
    let bytes = Arc::new(MemoryByteStore::new());
    let content = SheetContent { background: Color(0x2266_AAFF), ..Default::default() };
    let id = store_unplaced(&bytes, content);

    let mut doc = open_with(&bytes, manual_paging());
    let p = doc.world().index().position_of(id).expect("orphan placed");
    doc.wait_idle();
    doc.drain_events();

    assert!(matches!(doc.request_preview(p, Tier::T16).unwrap(), PreviewState::Pending { .. }));
    doc.wait_idle();
    assert!(doc
        .drain_events()
        .iter()
        .any(|e| matches!(e, DocumentEvent::PreviewReady { position, tier: 16 } if *position == p)));

    // Coarser: immediate.
    assert_eq!(doc.request_preview(p, Tier::T4).unwrap(), PreviewState::Ready(Tier::T4));
    let (tier, image) = doc.preview(p).unwrap();
    assert_eq!(tier, Tier::T4);
    assert_eq!(image.get_pixel(1, 1).0, [0x22, 0x66, 0xAA, 0xFF]);

    // Finer: the coarse image stays until the decode lands.
    assert_eq!(
        doc.request_preview(p, Tier::T256).unwrap(),
        PreviewState::Pending { showing: Some(Tier::T4) }
    );
    assert_eq!(doc.preview(p).unwrap().0, Tier::T4);
    doc.wait_idle();
    assert_eq!(doc.preview(p).unwrap().0, Tier::T256);
}

// ---------------------------------------------------------------------------
// Repair and search
// ---------------------------------------------------------------------------

#[test]
fn test_orphans_are_placed_in_scratch_region() {
    let bytes = Arc::new(MemoryByteStore::new());
    let orphan = store_unplaced(&bytes, SheetContent::new());

    let settings = DocumentSettings { scratch_origin: (-50, -50), ..Default::default() };
    let mut doc = open_with(&bytes, settings);
    assert_eq!(doc.world().index().identity_at(Position::new(-50, -50)), Some(orphan));
    let repaired = doc
        .drain_events()
        .into_iter()
        .any(|e| matches!(e, DocumentEvent::OrphansRepaired { placed } if placed == vec![(Position::new(-50, -50), orphan)]));
    assert!(repaired);
    // Repair is not an undoable edit.
    assert!(doc.world().history().is_empty());

    doc.flush_sync().unwrap();
    assert_eq!(doc.store().read_world().unwrap().entries.len(), 1);
    assert!(doc.repair().unwrap().is_empty());
}

#[test]
fn test_corrupt_world_index_is_rebuilt_from_stored_sheets() {
    let bytes = Arc::new(MemoryByteStore::new());
    let mut ids = {
        let mut doc = open_with(&bytes, DocumentSettings::default());
        let a = doc.new_sheet(Position::new(3, 3)).unwrap();
        doc.world_new_group();
        let b = doc.new_sheet(Position::new(4, 3)).unwrap();
        doc.close().unwrap();
        vec![a, b]
    };
    ids.sort();
    bytes.corrupt("world/index", b"garbage".to_vec());

    let settings = DocumentSettings { scratch_origin: (-50, -50), ..Default::default() };
    let mut doc = open_with(&bytes, settings.clone());
    assert_eq!(doc.world().index().identity_at(Position::new(-50, -50)), Some(ids[0]));
    assert_eq!(doc.world().index().identity_at(Position::new(-49, -50)), Some(ids[1]));
    assert!(doc.world().history().is_empty());
    assert!(doc.world().index().is_consistent());
    doc.close().unwrap();

    // The rewritten index and history load cleanly.
    let doc = open_with(&bytes, settings);
    assert_eq!(doc.world().index().len(), 2);
    assert!(doc.world().history().is_empty());
    assert!(doc.store().read_world().is_ok());
}

#[test]
fn test_search_prefers_resident_text() {
    let bytes = Arc::new(MemoryByteStore::new());
    let mut doc = open_with(&bytes, DocumentSettings::default());
    let (a, b) = (Position::new(0, 0), Position::new(1, 0));
    doc.new_sheet(a).unwrap();
    doc.new_sheet(b).unwrap();
    let block = TextBlock::new(Point::new(0.0, 0.0), 500.0, "Quarterly Plan");
    doc.apply_edit(a, SheetOp::InsertTexts { at: 0, texts: vec![block.clone()] }).unwrap();
    doc.flush_sync().unwrap();
    assert_eq!(doc.search("quarterly").unwrap(), vec![a]);

    // Unsaved edits are visible to search immediately.
    doc.apply_edit(b, SheetOp::InsertTexts { at: 0, texts: vec![block] }).unwrap();
    doc.apply_edit(a, SheetOp::RemoveTexts { at: 0, texts: vec![TextBlock::new(Point::new(0.0, 0.0), 500.0, "Quarterly Plan")] })
        .unwrap();
    assert_eq!(doc.search("QUARTERLY").unwrap(), vec![b]);
}
