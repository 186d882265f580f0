//! Local record store: durable CRUD over journal entries and settings with
//! forward-only schema migration.
//!
//! Every read-modify-write holds the write side of one lock, so a caller never
//! observes the product of two interleaved writes. Reads hold the read side and
//! return owned copies, so an import is seen whole or not at all.

mod area;
mod schema;

pub use area::{FileArea, MemoryArea, StorageArea};
pub(crate) use area::atomic_write;
pub use schema::{
    AnalysisResult, CURRENT_SCHEMA_VERSION, Entry, EntryDraft, ExportDocument, Settings,
    Statistics, migrate_records,
};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Datelike;
use serde_json::Value;

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

pub const ENTRIES_KEY: &str = "entries";
pub const SETTINGS_KEY: &str = "settings";
pub const VERSION_KEY: &str = "schemaVersion";

/// Raw values of every key, taken before an import.
struct Snapshot {
    entries: Option<String>,
    settings: Option<String>,
}

pub struct RecordStore {
    area: Arc<dyn StorageArea>,
    clock: Arc<dyn Clock>,
    lock: RwLock<()>,
    available: AtomicBool,
}

impl RecordStore {
    /// Create a store over `area` and run `initialize()`.
    pub fn new(area: Arc<dyn StorageArea>, clock: Arc<dyn Clock>) -> Self {
        let store = Self {
            area,
            clock,
            lock: RwLock::new(()),
            available: AtomicBool::new(false),
        };
        store.initialize();
        store
    }

    /// File-backed store in `dir` using the system clock.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileArea::new(dir)), Arc::new(SystemClock))
    }

    /// Probe the area, migrate if the stored schema tag differs, and seed
    /// defaults. Idempotent. Returns false (and degrades to no-op mode)
    /// when the area is unusable.
    pub fn initialize(&self) -> bool {
        if !self.area.probe() {
            tracing::warn!("store: persistence area unavailable, running without persistence");
            self.available.store(false, Ordering::SeqCst);
            return false;
        }

        let _lock = self.write();
        match self.initialize_locked() {
            Ok(()) => {
                self.available.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                tracing::warn!("store: initialization failed: {e}");
                self.available.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn initialize_locked(&self) -> Result<(), StoreError> {
        let stored = self.area.get(VERSION_KEY)?;
        if stored.as_deref() != Some(CURRENT_SCHEMA_VERSION) {
            self.migrate_locked(stored.as_deref(), CURRENT_SCHEMA_VERSION)?;
            self.area.set(VERSION_KEY, CURRENT_SCHEMA_VERSION)?;
        }
        if self.area.get(ENTRIES_KEY)?.is_none() {
            self.area.set(ENTRIES_KEY, "[]")?;
        }
        if self.area.get(SETTINGS_KEY)?.is_none() {
            self.area
                .set(SETTINGS_KEY, &serde_json::to_string(&Settings::default())?)?;
        }
        Ok(())
    }

    /// Backfill fields missing from stored records. Persists once, only if
    /// something changed. Returns whether anything changed.
    pub fn migrate(&self, from: Option<&str>, to: &str) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let _lock = self.write();
        self.migrate_locked(from, to)
    }

    fn migrate_locked(&self, from: Option<&str>, to: &str) -> Result<bool, StoreError> {
        tracing::info!(
            "store: migrating data from {} to {to}",
            from.unwrap_or("unknown")
        );
        let mut raw = self.read_raw_entries()?;
        let changed = migrate_records(&mut raw, to);
        if changed {
            self.write_entries(&raw)?;
            tracing::info!("store: migration complete");
        }
        Ok(changed)
    }

    // -----------------------------------------------------------------------
    // Entries
    // -----------------------------------------------------------------------

    /// All entries, most recent `date` first, ties broken by `id` descending.
    pub fn list_entries(&self) -> Vec<Entry> {
        if !self.is_available() {
            return Vec::new();
        }
        let _lock = self.read();
        self.list_entries_locked()
    }

    fn list_entries_locked(&self) -> Vec<Entry> {
        let raw = match self.read_raw_entries() {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("store: failed to load entries: {e}");
                return Vec::new();
            }
        };
        let mut entries: Vec<Entry> = raw.iter().filter_map(decode_entry).collect();
        entries.sort_by(|a, b| b.date.cmp(&a.date).then(b.id.cmp(&a.id)));
        entries
    }

    pub fn get_entry(&self, id: i64) -> Option<Entry> {
        self.list_entries().into_iter().find(|e| e.id == id)
    }

    /// Insert a new entry or shallow-merge into the entry with the same id.
    pub fn save_entry(&self, draft: EntryDraft) -> Result<Entry, StoreError> {
        self.ensure_available()?;
        if draft.text.trim().is_empty() {
            return Err(StoreError::Validation("entry text is required".to_string()));
        }

        let _lock = self.write();
        let mut raw = self.read_raw_entries()?;
        let entry = self.merge_into(&mut raw, draft)?;
        self.write_entries(&raw)?;
        tracing::info!("store: saved entry {}", entry.id);
        Ok(entry)
    }

    pub fn delete_entry(&self, id: i64) -> Result<(), StoreError> {
        self.ensure_available()?;
        let _lock = self.write();
        let mut raw = self.read_raw_entries()?;
        let index = raw
            .iter()
            .position(|v| raw_id(v) == Some(id))
            .ok_or(StoreError::NotFound(id))?;
        raw.remove(index);
        self.write_entries(&raw)?;
        tracing::info!("store: deleted entry {id}");
        Ok(())
    }

    /// Set `analyses[method]`; one result per method, last write wins.
    pub fn upsert_analysis(
        &self,
        id: i64,
        method: &str,
        result: impl Into<String>,
    ) -> Result<Entry, StoreError> {
        let result = result.into();
        let now = self.clock.now();
        self.modify_entry(id, |entry| {
            entry.analyses.insert(
                method.to_string(),
                AnalysisResult {
                    result,
                    timestamp: now,
                },
            );
            Ok(())
        })
    }

    pub fn remove_analysis(&self, id: i64, method: &str) -> Result<Entry, StoreError> {
        self.modify_entry(id, |entry| {
            entry
                .analyses
                .remove(method)
                .map(|_| ())
                .ok_or_else(|| StoreError::AnalysisNotFound {
                    id,
                    method: method.to_string(),
                })
        })
    }

    pub fn remove_all_analyses(&self, id: i64) -> Result<Entry, StoreError> {
        self.modify_entry(id, |entry| {
            entry.analyses.clear();
            Ok(())
        })
    }

    /// Load entry `id`, apply `f`, and re-save it with `save_entry` semantics,
    /// all under one lock.
    fn modify_entry(
        &self,
        id: i64,
        f: impl FnOnce(&mut Entry) -> Result<(), StoreError>,
    ) -> Result<Entry, StoreError> {
        self.ensure_available()?;
        let _lock = self.write();
        let mut raw = self.read_raw_entries()?;
        let mut entry = raw
            .iter()
            .find(|v| raw_id(v) == Some(id))
            .and_then(decode_entry)
            .ok_or(StoreError::NotFound(id))?;
        f(&mut entry)?;
        let saved = self.merge_into(&mut raw, EntryDraft::from(entry))?;
        self.write_entries(&raw)?;
        Ok(saved)
    }

    fn merge_into(&self, raw: &mut Vec<Value>, draft: EntryDraft) -> Result<Entry, StoreError> {
        let now = self.clock.now();
        let text = draft.text.trim().to_string();
        let context = draft.context.map(normalize_context);

        let index = draft
            .id
            .and_then(|id| raw.iter().position(|v| raw_id(v) == Some(id)));
        let existing = index.and_then(|i| decode_entry(&raw[i]));

        let entry = match existing {
            Some(prev) => Entry {
                id: prev.id,
                date: draft.date.unwrap_or(prev.date),
                text,
                context: context.unwrap_or(prev.context),
                tags: draft.tags.unwrap_or(prev.tags),
                analyses: draft.analyses.unwrap_or(prev.analyses),
                schema_version: CURRENT_SCHEMA_VERSION.to_string(),
                created_at: prev.created_at,
                updated_at: now,
            },
            None => Entry {
                id: draft.id.unwrap_or_else(|| next_id(raw, now.timestamp_millis())),
                date: draft.date.unwrap_or(now),
                text,
                context: context.flatten(),
                tags: draft.tags.unwrap_or_default(),
                analyses: draft.analyses.unwrap_or_default(),
                schema_version: CURRENT_SCHEMA_VERSION.to_string(),
                created_at: now,
                updated_at: now,
            },
        };

        let value = serde_json::to_value(&entry)?;
        match index {
            Some(i) => raw[i] = value,
            None => raw.insert(0, value),
        }
        Ok(entry)
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub fn get_settings(&self) -> Settings {
        if !self.is_available() {
            return Settings::empty();
        }
        let _lock = self.read();
        self.settings_locked()
    }

    fn settings_locked(&self) -> Settings {
        let json = match self.area.get(SETTINGS_KEY) {
            Ok(Some(json)) => json,
            Ok(None) => return Settings::empty(),
            Err(e) => {
                tracing::warn!("store: failed to load settings: {e}");
                return Settings::empty();
            }
        };
        match serde_json::from_str::<Value>(&json) {
            Ok(Value::Object(map)) => Settings(map),
            Ok(_) => {
                tracing::warn!("store: settings are not a map, ignoring");
                Settings::empty()
            }
            Err(e) => {
                tracing::warn!("store: corrupt settings: {e}");
                Settings::empty()
            }
        }
    }

    /// Merge `update` into the stored settings and return the result.
    pub fn save_settings(&self, update: Settings) -> Result<Settings, StoreError> {
        self.ensure_available()?;
        let _lock = self.write();
        let merged = self.merge_settings_locked(update)?;
        Ok(merged)
    }

    fn merge_settings_locked(&self, update: Settings) -> Result<Settings, StoreError> {
        let mut current = self.settings_locked();
        current.merge(update);
        self.area
            .set(SETTINGS_KEY, &serde_json::to_string(&current)?)?;
        Ok(current)
    }

    // -----------------------------------------------------------------------
    // Export / import / clear
    // -----------------------------------------------------------------------

    pub fn export_all(&self) -> Result<String, StoreError> {
        let (entries, settings) = if self.is_available() {
            let _lock = self.read();
            (self.list_entries_locked(), self.settings_locked())
        } else {
            (Vec::new(), Settings::empty())
        };
        let doc = ExportDocument {
            entries,
            settings,
            schema_version: CURRENT_SCHEMA_VERSION.to_string(),
            exported_at: self.clock.now(),
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    /// Replace all entries (and merge settings, if present) from an export
    /// document. Either the whole import lands or the prior state is restored.
    /// Returns the number of imported entries.
    pub fn import_all(&self, document: &str) -> Result<usize, StoreError> {
        self.ensure_available()?;

        let doc: Value = serde_json::from_str(document)
            .map_err(|e| StoreError::InvalidDocument(format!("not valid JSON: {e}")))?;
        let Some(raw_entries) = doc.get("entries").and_then(Value::as_array) else {
            return Err(StoreError::InvalidDocument(
                "`entries` must be a sequence".to_string(),
            ));
        };

        let mut entries = Vec::with_capacity(raw_entries.len());
        for (i, value) in raw_entries.iter().enumerate() {
            let mut value = value.clone();
            migrate_records(std::slice::from_mut(&mut value), CURRENT_SCHEMA_VERSION);
            let entry: Entry = serde_json::from_value(value)
                .map_err(|e| StoreError::InvalidDocument(format!("entry {i}: {e}")))?;
            entry.validate().map_err(StoreError::InvalidDocument)?;
            entries.push(entry);
        }

        let settings = match doc.get("settings") {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(Settings(map.clone())),
            Some(_) => {
                return Err(StoreError::InvalidDocument(
                    "`settings` must be a map".to_string(),
                ));
            }
        };

        let _lock = self.write();
        let snapshot = self.snapshot()?;
        let mut written: Vec<&'static str> = Vec::new();
        if let Err(e) = self.apply_import(&entries, settings, &mut written) {
            tracing::warn!("store: import failed, restoring previous state: {e}");
            self.restore(&snapshot, &written);
            return Err(e);
        }

        tracing::info!("store: imported {} entries", entries.len());
        Ok(entries.len())
    }

    fn apply_import(
        &self,
        entries: &[Entry],
        settings: Option<Settings>,
        written: &mut Vec<&'static str>,
    ) -> Result<(), StoreError> {
        self.area
            .set(ENTRIES_KEY, &serde_json::to_string(entries)?)?;
        written.push(ENTRIES_KEY);
        if let Some(settings) = settings {
            self.merge_settings_locked(settings)?;
            written.push(SETTINGS_KEY);
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        Ok(Snapshot {
            entries: self.area.get(ENTRIES_KEY)?,
            settings: self.area.get(SETTINGS_KEY)?,
        })
    }

    /// Best-effort restore of the keys an aborted import wrote.
    fn restore(&self, snapshot: &Snapshot, written: &[&'static str]) {
        for key in written {
            let previous = match *key {
                ENTRIES_KEY => &snapshot.entries,
                _ => &snapshot.settings,
            };
            let result = match previous {
                Some(value) => self.area.set(key, value),
                None => self.area.remove(key),
            };
            if let Err(e) = result {
                tracing::error!("store: failed to restore '{key}' after aborted import: {e}");
            }
        }
    }

    /// Remove every persisted key and re-initialize.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        self.ensure_available()?;
        {
            let _lock = self.write();
            self.area.remove(ENTRIES_KEY)?;
            self.area.remove(SETTINGS_KEY)?;
            self.area.remove(VERSION_KEY)?;
        }
        self.initialize();
        tracing::info!("store: all data cleared");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Statistics
    // -----------------------------------------------------------------------

    pub fn compute_statistics(&self) -> Statistics {
        let entries = self.list_entries();
        let now = self.clock.now();

        let total_chars: usize = entries.iter().map(|e| e.text.chars().count()).sum();
        let average_entry_length = if entries.is_empty() {
            0
        } else {
            (total_chars as f64 / entries.len() as f64).round() as usize
        };

        Statistics {
            total_entries: entries.len(),
            total_analyses: entries.iter().map(|e| e.analyses.len()).sum(),
            average_entry_length,
            oldest_entry: entries.iter().map(|e| e.date).min(),
            newest_entry: entries.iter().map(|e| e.date).max(),
            entries_this_month: entries
                .iter()
                .filter(|e| e.date.year() == now.year() && e.date.month() == now.month())
                .count(),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.lock
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }

    /// Stored entries as raw JSON. Missing or corrupt data reads as empty.
    fn read_raw_entries(&self) -> Result<Vec<Value>, StoreError> {
        let Some(json) = self.area.get(ENTRIES_KEY)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str::<Value>(&json) {
            Ok(Value::Array(items)) => Ok(items),
            Ok(_) => {
                tracing::warn!("store: entries are not a sequence, treating as empty");
                Ok(Vec::new())
            }
            Err(e) => {
                tracing::warn!("store: corrupt entries: {e}, treating as empty");
                Ok(Vec::new())
            }
        }
    }

    fn write_entries(&self, raw: &[Value]) -> Result<(), StoreError> {
        self.area.set(ENTRIES_KEY, &serde_json::to_string(raw)?)
    }
}

fn raw_id(value: &Value) -> Option<i64> {
    value.get("id").and_then(Value::as_i64)
}

/// Decode and validate one stored record; drifted records are skipped.
fn decode_entry(value: &Value) -> Option<Entry> {
    let entry: Entry = match serde_json::from_value(value.clone()) {
        Ok(entry) => entry,
        Err(e) => {
            tracing::warn!("store: skipping unreadable entry {:?}: {e}", raw_id(value));
            return None;
        }
    };
    match entry.validate() {
        Ok(()) => Some(entry),
        Err(e) => {
            tracing::warn!("store: skipping invalid entry: {e}");
            None
        }
    }
}

/// Trimmed context; an explicitly empty context clears the field.
fn normalize_context(context: String) -> Option<String> {
    let trimmed = context.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Creation-time id, bumped past the largest stored id on collision.
fn next_id(raw: &[Value], now_ms: i64) -> i64 {
    match raw.iter().filter_map(raw_id).max() {
        Some(max) if max >= now_ms => max + 1,
        _ => now_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn next_id_uses_timestamp_when_free() {
        assert_eq!(next_id(&[json!({"id": 5})], 1000), 1000);
    }

    #[test]
    fn next_id_bumps_on_collision() {
        assert_eq!(next_id(&[json!({"id": 1000}), json!({"id": 999})], 1000), 1001);
    }

    #[test]
    fn blank_context_is_cleared() {
        assert_eq!(normalize_context("   ".into()), None);
        assert_eq!(normalize_context(" calm ".into()), Some("calm".into()));
    }
}
