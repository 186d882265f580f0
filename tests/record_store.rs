use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

use dreamlog::clock::{Clock, ManualClock};
use dreamlog::error::StoreError;
use dreamlog::store::{
    CURRENT_SCHEMA_VERSION, EntryDraft, FileArea, MemoryArea, RecordStore, Settings, StorageArea,
};

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 15, 9, 30, 0).unwrap(),
    ))
}

fn memory_store() -> (Arc<MemoryArea>, Arc<ManualClock>, RecordStore) {
    let area = Arc::new(MemoryArea::new());
    let clock = clock();
    let store = RecordStore::new(area.clone(), clock.clone());
    (area, clock, store)
}

fn day(y: i32, m: u32, d: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
}

// ---------------------------------------------------------------------------
// Initialization and migration
// ---------------------------------------------------------------------------

#[test]
fn initialize_seeds_defaults_and_version() {
    let (area, _clock, store) = memory_store();
    assert!(store.is_available());
    assert_eq!(area.get("entries").unwrap().as_deref(), Some("[]"));
    assert_eq!(
        area.get("schemaVersion").unwrap().as_deref(),
        Some(CURRENT_SCHEMA_VERSION)
    );
    let settings = store.get_settings();
    assert_eq!(settings.get("theme"), Some(&json!("dark")));
    assert_eq!(settings.get("autoSave"), Some(&json!(true)));
}

#[test]
fn legacy_records_are_backfilled_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let legacy = json!([
        {"id": 1, "date": "2023-05-01T07:00:00Z", "text": "old dream",
         "createdAt": "2023-05-01T07:00:00Z", "updatedAt": "2023-05-01T07:00:00Z"}
    ]);
    std::fs::write(dir.path().join("entries.json"), legacy.to_string()).unwrap();

    let store = RecordStore::new(Arc::new(FileArea::new(dir.path())), clock());
    let entries = store.list_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].schema_version, CURRENT_SCHEMA_VERSION);
    assert!(entries[0].tags.is_empty());
    assert!(entries[0].analyses.is_empty());

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("entries.json")).unwrap())
            .unwrap();
    assert_eq!(raw[0]["schemaVersion"], CURRENT_SCHEMA_VERSION);
    assert_eq!(raw[0]["tags"], json!([]));
}

#[test]
fn migration_is_idempotent() {
    let (_area, _clock, store) = memory_store();
    store.save_entry(EntryDraft::new("a dream")).unwrap();
    assert!(!store.migrate(Some("0.9.0"), CURRENT_SCHEMA_VERSION).unwrap());
    assert!(!store.migrate(Some("0.9.0"), CURRENT_SCHEMA_VERSION).unwrap());
    // reopening over migrated data changes nothing
    assert!(store.initialize());
    assert_eq!(store.list_entries().len(), 1);
}

#[test]
fn corrupt_entries_read_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("entries.json"), "{not json").unwrap();
    std::fs::write(dir.path().join("schemaVersion.json"), CURRENT_SCHEMA_VERSION).unwrap();
    let store = RecordStore::new(Arc::new(FileArea::new(dir.path())), clock());
    assert!(store.list_entries().is_empty());
    assert_eq!(store.compute_statistics().total_entries, 0);
}

#[test]
fn invalid_records_are_skipped_not_fatal() {
    let (area, _clock, store) = memory_store();
    store.save_entry(EntryDraft::new("good one")).unwrap();
    let mut raw: Vec<serde_json::Value> =
        serde_json::from_str(&area.get("entries").unwrap().unwrap()).unwrap();
    raw.push(json!({"id": 99, "text": 42}));
    area.set("entries", &serde_json::to_string(&raw).unwrap()).unwrap();

    let entries = store.list_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].text, "good one");
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[test]
fn list_is_sorted_by_date_descending() {
    let (_area, _clock, store) = memory_store();
    for date in [day(2024, 1, 1), day(2024, 3, 1), day(2024, 2, 1)] {
        store
            .save_entry(EntryDraft::new("dream text").with_date(date))
            .unwrap();
    }
    let dates: Vec<_> = store.list_entries().iter().map(|e| e.date).collect();
    assert_eq!(dates, vec![day(2024, 3, 1), day(2024, 2, 1), day(2024, 1, 1)]);
}

#[test]
fn equal_dates_break_ties_by_id_descending() {
    let (_area, _clock, store) = memory_store();
    let date = day(2024, 1, 1);
    for id in [5, 9, 7] {
        let mut draft = EntryDraft::new("same night").with_date(date);
        draft.id = Some(id);
        store.save_entry(draft).unwrap();
    }
    let ids: Vec<_> = store.list_entries().iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![9, 7, 5]);
}

#[test]
fn save_assigns_fresh_id_and_timestamps() {
    let (_area, clock, store) = memory_store();
    let entry = store.save_entry(EntryDraft::new("  flying  ")).unwrap();
    assert_eq!(entry.text, "flying");
    assert_eq!(entry.created_at, clock.now());
    assert_eq!(entry.updated_at, entry.created_at);
    assert_eq!(store.get_entry(entry.id), Some(entry));
}

#[test]
fn saves_in_the_same_millisecond_get_distinct_ids() {
    let (_area, _clock, store) = memory_store();
    let a = store.save_entry(EntryDraft::new("first")).unwrap();
    let b = store.save_entry(EntryDraft::new("second")).unwrap();
    assert_ne!(a.id, b.id);
    assert_eq!(store.list_entries().len(), 2);
}

#[test]
fn update_merges_shallowly() {
    let (_area, clock, store) = memory_store();
    let original = store
        .save_entry(
            EntryDraft::new("first version")
                .with_context("anxious")
                .with_tags(["flying", "sea"]),
        )
        .unwrap();
    store
        .upsert_analysis(original.id, "poem", "a poem")
        .unwrap();

    clock.advance(Duration::minutes(5));
    let mut draft = EntryDraft::new("second version");
    draft.id = Some(original.id);
    let updated = store.save_entry(draft).unwrap();

    assert_eq!(updated.text, "second version");
    assert_eq!(updated.context.as_deref(), Some("anxious"));
    assert_eq!(
        updated.tags,
        BTreeSet::from(["flying".to_string(), "sea".to_string()])
    );
    assert!(updated.analyses.contains_key("poem"));
    assert_eq!(updated.created_at, original.created_at);
    assert!(updated.updated_at > original.updated_at);
}

#[test]
fn explicit_empty_values_overwrite() {
    let (_area, _clock, store) = memory_store();
    let original = store
        .save_entry(
            EntryDraft::new("dream")
                .with_context("calm")
                .with_tags(["a"]),
        )
        .unwrap();
    let mut draft = EntryDraft::new("dream").with_context("   ");
    draft.id = Some(original.id);
    draft.tags = Some(BTreeSet::new());
    let updated = store.save_entry(draft).unwrap();
    assert!(updated.tags.is_empty());
    assert_eq!(updated.context, None);
}

#[test]
fn empty_text_is_rejected() {
    let (_area, _clock, store) = memory_store();
    let err = store.save_entry(EntryDraft::new("   ")).unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    assert!(store.list_entries().is_empty());
}

#[test]
fn delete_missing_entry_is_not_found() {
    let (_area, _clock, store) = memory_store();
    assert!(matches!(
        store.delete_entry(12345),
        Err(StoreError::NotFound(12345))
    ));
}

// ---------------------------------------------------------------------------
// Analyses
// ---------------------------------------------------------------------------

#[test]
fn upsert_analysis_keeps_one_result_per_method() {
    let (_area, clock, store) = memory_store();
    let entry = store.save_entry(EntryDraft::new("dream")).unwrap();
    store.upsert_analysis(entry.id, "jungian", "first").unwrap();
    clock.advance(Duration::seconds(30));
    let updated = store.upsert_analysis(entry.id, "jungian", "second").unwrap();
    assert_eq!(updated.analyses.len(), 1);
    assert_eq!(updated.analyses["jungian"].result, "second");
    assert_eq!(updated.analyses["jungian"].timestamp, clock.now());
}

#[test]
fn remove_analysis_reports_missing_method() {
    let (_area, _clock, store) = memory_store();
    let entry = store.save_entry(EntryDraft::new("dream")).unwrap();
    store.upsert_analysis(entry.id, "poem", "verse").unwrap();

    let err = store.remove_analysis(entry.id, "freudian").unwrap_err();
    assert!(matches!(err, StoreError::AnalysisNotFound { ref method, .. } if method == "freudian"));

    let updated = store.remove_analysis(entry.id, "poem").unwrap();
    assert!(updated.analyses.is_empty());
}

#[test]
fn remove_all_analyses_clears_map() {
    let (_area, _clock, store) = memory_store();
    let entry = store.save_entry(EntryDraft::new("dream")).unwrap();
    store.upsert_analysis(entry.id, "poem", "verse").unwrap();
    store.upsert_analysis(entry.id, "sentiment", "joy").unwrap();
    assert!(store.remove_all_analyses(entry.id).unwrap().analyses.is_empty());
    assert!(matches!(
        store.upsert_analysis(777, "poem", "x"),
        Err(StoreError::NotFound(777))
    ));
}

// ---------------------------------------------------------------------------
// Settings, export/import, clear
// ---------------------------------------------------------------------------

#[test]
fn settings_merge_last_write_wins_per_key() {
    let (_area, _clock, store) = memory_store();
    let mut update = Settings::empty();
    update.0.insert("theme".into(), json!("light"));
    update.0.insert("fontSize".into(), json!(14));
    let merged = store.save_settings(update).unwrap();
    assert_eq!(merged.get("theme"), Some(&json!("light")));
    assert_eq!(merged.get("language"), Some(&json!("de")));
    assert_eq!(store.get_settings(), merged);
}

#[test]
fn import_of_export_leaves_state_unchanged() {
    let (_area, _clock, store) = memory_store();
    store
        .save_entry(EntryDraft::new("one").with_date(day(2024, 1, 1)))
        .unwrap();
    let two = store
        .save_entry(EntryDraft::new("two").with_date(day(2024, 2, 1)))
        .unwrap();
    store.upsert_analysis(two.id, "poem", "verse").unwrap();
    let mut update = Settings::empty();
    update.0.insert("theme".into(), json!("light"));
    update.0.insert("fontSize".into(), json!(16));
    store.save_settings(update).unwrap();

    let entries_before = store.list_entries();
    let settings_before = store.get_settings();
    let document = store.export_all().unwrap();

    assert_eq!(store.import_all(&document).unwrap(), 2);
    assert_eq!(store.list_entries(), entries_before);
    assert_eq!(store.get_settings(), settings_before);
}

#[test]
fn export_can_be_restored_after_clear() {
    let (_area, _clock, store) = memory_store();
    store.save_entry(EntryDraft::new("one")).unwrap();
    let before = store.list_entries();
    let document = store.export_all().unwrap();

    store.clear_all().unwrap();
    assert!(store.list_entries().is_empty());

    assert_eq!(store.import_all(&document).unwrap(), 1);
    assert_eq!(store.list_entries(), before);
}

#[test]
fn import_rejects_malformed_documents_without_writing() {
    let (_area, _clock, store) = memory_store();
    store.save_entry(EntryDraft::new("keep me")).unwrap();

    for doc in [
        "not json",
        r#"{"entries": {}}"#,
        r#"{"entries": [{"id": 1, "date": "2024-01-01T00:00:00Z", "text": ""}]}"#,
        r#"{"entries": [], "settings": [1, 2]}"#,
    ] {
        let err = store.import_all(doc).unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocument(_)), "{doc}");
    }
    assert_eq!(store.list_entries().len(), 1);
}

#[test]
fn import_backfills_legacy_entries() {
    let (_area, _clock, store) = memory_store();
    let doc = json!({
        "entries": [{"id": 3, "date": "2022-01-01T00:00:00Z", "text": "legacy",
                     "createdAt": "2022-01-01T00:00:00Z", "updatedAt": "2022-01-01T00:00:00Z"}]
    });
    assert_eq!(store.import_all(&doc.to_string()).unwrap(), 1);
    let entry = store.get_entry(3).unwrap();
    assert_eq!(entry.schema_version, CURRENT_SCHEMA_VERSION);
}

/// Export without the volatile `exportedAt` stamp.
fn exported_state(store: &RecordStore) -> serde_json::Value {
    let mut doc: serde_json::Value = serde_json::from_str(&store.export_all().unwrap()).unwrap();
    doc.as_object_mut().unwrap().remove("exportedAt");
    doc
}

#[test]
fn failed_import_restores_previous_state() {
    let (area, _clock, store) = memory_store();
    store.save_entry(EntryDraft::new("original")).unwrap();
    let mut update = Settings::empty();
    update.0.insert("fontSize".into(), json!(12));
    store.save_settings(update).unwrap();
    let before = exported_state(&store);

    let doc = json!({
        "entries": [{"id": 1, "date": "2024-01-01T00:00:00Z", "text": "incoming",
                     "createdAt": "2024-01-01T00:00:00Z", "updatedAt": "2024-01-01T00:00:00Z"}],
        "settings": {"theme": "light"}
    });
    area.fail_writes_to("settings");
    assert!(store.import_all(&doc.to_string()).is_err());
    area.heal();

    assert_eq!(exported_state(&store), before);
}

/// Area that parks the first armed write to `settings` until released, then
/// fails it.
#[derive(Default)]
struct GatedArea {
    inner: MemoryArea,
    armed: AtomicBool,
    entered: Mutex<Option<mpsc::Sender<()>>>,
    release: Mutex<Option<mpsc::Receiver<()>>>,
}

impl GatedArea {
    fn arm(&self) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *self.entered.lock().unwrap() = Some(entered_tx);
        *self.release.lock().unwrap() = Some(release_rx);
        self.armed.store(true, Ordering::SeqCst);
        (entered_rx, release_tx)
    }
}

impl StorageArea for GatedArea {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if key == "settings" && self.armed.swap(false, Ordering::SeqCst) {
            if let Some(tx) = self.entered.lock().unwrap().take() {
                tx.send(()).unwrap();
            }
            if let Some(rx) = self.release.lock().unwrap().take() {
                rx.recv().unwrap();
            }
            return Err(StoreError::Io(std::io::Error::other("settings write rejected")));
        }
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(key)
    }
}

#[test]
fn readers_never_observe_an_import_that_is_rolled_back() {
    let area = Arc::new(GatedArea::default());
    let store = Arc::new(RecordStore::new(area.clone(), clock()));
    store.save_entry(EntryDraft::new("original")).unwrap();

    let (entered, release) = area.arm();
    let importer = {
        let store = store.clone();
        let doc = json!({
            "entries": [{"id": 1, "date": "2024-01-01T00:00:00Z", "text": "incoming",
                         "createdAt": "2024-01-01T00:00:00Z", "updatedAt": "2024-01-01T00:00:00Z"}],
            "settings": {"theme": "light"}
        });
        std::thread::spawn(move || store.import_all(&doc.to_string()))
    };
    entered.recv().unwrap();

    // The import has written `entries` and is parked on `settings`.
    let reader = {
        let store = store.clone();
        std::thread::spawn(move || {
            store
                .list_entries()
                .into_iter()
                .map(|e| e.text)
                .collect::<Vec<_>>()
        })
    };
    std::thread::sleep(std::time::Duration::from_millis(100));
    assert!(!reader.is_finished(), "reader ran during the import");

    release.send(()).unwrap();
    assert!(importer.join().unwrap().is_err());
    assert_eq!(reader.join().unwrap(), vec!["original".to_string()]);
    assert_eq!(store.get_settings().get("theme"), Some(&json!("dark")));
}

#[test]
fn clear_all_resets_to_defaults() {
    let (_area, _clock, store) = memory_store();
    store.save_entry(EntryDraft::new("dream")).unwrap();
    let mut update = Settings::empty();
    update.0.insert("theme".into(), json!("light"));
    store.save_settings(update).unwrap();

    store.clear_all().unwrap();
    assert!(store.list_entries().is_empty());
    assert_eq!(store.get_settings(), Settings::default());
}

// ---------------------------------------------------------------------------
// Statistics and degraded mode
// ---------------------------------------------------------------------------

#[test]
fn statistics_summarize_entries() {
    let (_area, _clock, store) = memory_store();
    let a = store
        .save_entry(EntryDraft::new("abcd").with_date(day(2024, 3, 2)))
        .unwrap();
    store
        .save_entry(EntryDraft::new("abcdefgh").with_date(day(2023, 12, 24)))
        .unwrap();
    store.upsert_analysis(a.id, "poem", "verse").unwrap();
    store.upsert_analysis(a.id, "sentiment", "calm").unwrap();

    let stats = store.compute_statistics();
    assert_eq!(stats.total_entries, 2);
    assert_eq!(stats.total_analyses, 2);
    assert_eq!(stats.average_entry_length, 6);
    assert_eq!(stats.oldest_entry, Some(day(2023, 12, 24)));
    assert_eq!(stats.newest_entry, Some(day(2024, 3, 2)));
    assert_eq!(stats.entries_this_month, 1);
}

#[test]
fn unavailable_area_degrades_to_no_op() {
    let store = RecordStore::new(Arc::new(MemoryArea::unavailable()), clock());
    assert!(!store.is_available());
    assert!(store.list_entries().is_empty());
    assert_eq!(store.get_entry(1), None);
    assert_eq!(store.get_settings(), Settings::empty());
    assert!(matches!(
        store.save_entry(EntryDraft::new("lost")),
        Err(StoreError::Unavailable)
    ));
    assert!(matches!(store.clear_all(), Err(StoreError::Unavailable)));
}

#[test]
fn concurrent_saves_are_serialized() {
    let (_area, _clock, store) = memory_store();
    let store = Arc::new(store);
    let handles: Vec<_> = (0..16)
        .map(|i| {
            let store = store.clone();
            std::thread::spawn(move || store.save_entry(EntryDraft::new(format!("dream {i}"))))
        })
        .collect();
    for h in handles {
        h.join().unwrap().unwrap();
    }
    let entries = store.list_entries();
    assert_eq!(entries.len(), 16);
    let ids: BTreeSet<_> = entries.iter().map(|e| e.id).collect();
    assert_eq!(ids.len(), 16);
}
