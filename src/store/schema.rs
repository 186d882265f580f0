//! Typed records persisted by the record store, plus the forward-only
//! migration that backfills fields older records lack.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Schema tag written into every record and into the `schemaVersion` key.
pub const CURRENT_SCHEMA_VERSION: &str = "1.0.0";

/// One generated analysis attached to an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub result: String,
    pub timestamp: DateTime<Utc>,
}

/// A journal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub analyses: BTreeMap<String, AnalysisResult>,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_schema_version() -> String {
    CURRENT_SCHEMA_VERSION.to_string()
}

impl Entry {
    /// Checks a decoded record for drift the type system can't express.
    pub fn validate(&self) -> Result<(), String> {
        if self.text.trim().is_empty() {
            return Err(format!("entry {} has empty text", self.id));
        }
        Ok(())
    }
}

/// Caller input for `save_entry`.
///
/// `None` means "not present": on update the stored value survives.
/// `Some` (even an empty collection) overwrites.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryDraft {
    pub id: Option<i64>,
    pub date: Option<DateTime<Utc>>,
    pub text: String,
    pub context: Option<String>,
    pub tags: Option<BTreeSet<String>>,
    pub analyses: Option<BTreeMap<String, AnalysisResult>>,
}

impl EntryDraft {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }
}

impl From<Entry> for EntryDraft {
    /// Full re-save of an existing entry.
    fn from(entry: Entry) -> Self {
        Self {
            id: Some(entry.id),
            date: Some(entry.date),
            text: entry.text,
            context: entry.context,
            tags: Some(entry.tags),
            analyses: Some(entry.analyses),
        }
    }
}

/// Flat user preferences. Last write wins per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings(pub Map<String, Value>);

impl Default for Settings {
    fn default() -> Self {
        let mut map = Map::new();
        map.insert("theme".into(), Value::from("dark"));
        map.insert("language".into(), Value::from("de"));
        map.insert("notifications".into(), Value::from(true));
        map.insert("voiceRecognition".into(), Value::from(true));
        map.insert("autoSave".into(), Value::from(true));
        Settings(map)
    }
}

impl Settings {
    pub fn empty() -> Self {
        Settings(Map::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Merge `other` into `self`; keys in `other` win.
    pub fn merge(&mut self, other: Settings) {
        for (k, v) in other.0 {
            self.0.insert(k, v);
        }
    }
}

/// Transportable backup of the whole store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub entries: Vec<Entry>,
    pub settings: Settings,
    pub schema_version: String,
    pub exported_at: DateTime<Utc>,
}

/// Derived journal statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub total_entries: usize,
    pub total_analyses: usize,
    pub average_entry_length: usize,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
    pub entries_this_month: usize,
}

/// Backfill missing `tags`, `analyses` and `schemaVersion` on raw records.
///
/// Returns true if any record changed. Non-object values are left alone (they
/// are rejected later when decoded). Running it twice is a no-op.
pub fn migrate_records(records: &mut [Value], to_version: &str) -> bool {
    let mut changed = false;
    for record in records.iter_mut() {
        let Some(obj) = record.as_object_mut() else {
            continue;
        };
        if !obj.get("schemaVersion").is_some_and(Value::is_string) {
            obj.insert("schemaVersion".into(), Value::from(to_version));
            changed = true;
        }
        if !obj.get("tags").is_some_and(Value::is_array) {
            obj.insert("tags".into(), Value::Array(Vec::new()));
            changed = true;
        }
        if !obj.get("analyses").is_some_and(Value::is_object) {
            obj.insert("analyses".into(), Value::Object(Map::new()));
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn legacy_records() -> Vec<Value> {
        vec![
            json!({"id": 1, "date": "2024-01-01T08:00:00Z", "text": "flying",
                   "createdAt": "2024-01-01T08:00:00Z", "updatedAt": "2024-01-01T08:00:00Z"}),
            json!({"id": 2, "date": "2024-01-02T08:00:00Z", "text": "falling",
                   "tags": ["night"], "analyses": {}, "schemaVersion": "0.9.0",
                   "createdAt": "2024-01-02T08:00:00Z", "updatedAt": "2024-01-02T08:00:00Z"}),
        ]
    }

    #[test]
    fn migrate_backfills_missing_fields() {
        let mut records = legacy_records();
        assert!(migrate_records(&mut records, CURRENT_SCHEMA_VERSION));
        assert_eq!(records[0]["tags"], json!([]));
        assert_eq!(records[0]["analyses"], json!({}));
        assert_eq!(records[0]["schemaVersion"], json!(CURRENT_SCHEMA_VERSION));
        // existing values survive
        assert_eq!(records[1]["tags"], json!(["night"]));
        assert_eq!(records[1]["schemaVersion"], json!("0.9.0"));
    }

    #[test]
    fn migrate_twice_equals_once() {
        let mut once = legacy_records();
        migrate_records(&mut once, CURRENT_SCHEMA_VERSION);
        let mut twice = once.clone();
        assert!(!migrate_records(&mut twice, CURRENT_SCHEMA_VERSION));
        assert_eq!(once, twice);
    }

    #[test]
    fn migrate_skips_non_objects() {
        let mut records = vec![json!("garbage"), json!(42)];
        assert!(!migrate_records(&mut records, CURRENT_SCHEMA_VERSION));
    }

    #[test]
    fn entry_decodes_with_defaults() {
        let entry: Entry = serde_json::from_value(json!({
            "id": 7, "date": "2024-03-01T00:00:00Z", "text": "sea",
            "createdAt": "2024-03-01T00:00:00Z", "updatedAt": "2024-03-01T00:00:00Z"
        }))
        .unwrap();
        assert!(entry.tags.is_empty());
        assert!(entry.analyses.is_empty());
        assert_eq!(entry.schema_version, CURRENT_SCHEMA_VERSION);
        assert!(entry.context.is_none());
    }

    #[test]
    fn settings_merge_last_write_wins() {
        let mut settings = Settings::default();
        let mut update = Settings::empty();
        update.0.insert("theme".into(), json!("light"));
        settings.merge(update);
        assert_eq!(settings.get("theme"), Some(&json!("light")));
        assert_eq!(settings.get("language"), Some(&json!("de")));
    }
}
