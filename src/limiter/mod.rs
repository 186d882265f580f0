//! Per-client, per-hour request ledger guarding one proxied endpoint.
//!
//! The ledger is a flat map keyed by `{client}-{YYYY-MM-DD-HH}`. A client can
//! burst up to twice the threshold across a bucket boundary; in exchange the
//! bookkeeping is O(1) and old buckets are pruned inline on write.

mod client_id;

pub use client_id::{client_identity, is_public_ip};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};

use crate::clock::Clock;
use crate::store::atomic_write;

/// `YYYY-MM-DD-HH`, always 13 chars.
const BUCKET_FORMAT: &str = "%Y-%m-%d-%H";
const BUCKET_LEN: usize = 13;

/// Buckets older than this are dropped on the next `record`.
const RETENTION_HOURS: i64 = 24;

pub struct RateLimiter {
    name: String,
    threshold: u32,
    clock: Arc<dyn Clock>,
    ledger: Mutex<HashMap<String, u32>>,
    ledger_path: Option<PathBuf>,
    /// Bumped under the ledger lock on every `record`.
    generation: AtomicU64,
    /// Generation of the last snapshot written to `ledger_path`.
    persisted: Mutex<u64>,
}

/// Encoded ledger taken under the lock, written after it is released.
struct Snapshot {
    generation: u64,
    json: String,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("threshold", &self.threshold)
            .field("ledger_path", &self.ledger_path)
            .finish()
    }
}

impl RateLimiter {
    /// In-memory limiter allowing `threshold` requests per client per hour.
    pub fn new(name: impl Into<String>, threshold: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            threshold,
            clock,
            ledger: Mutex::new(HashMap::new()),
            ledger_path: None,
            generation: AtomicU64::new(0),
            persisted: Mutex::new(0),
        }
    }

    /// Persist the ledger as flat JSON at `path`, loading whatever is there.
    /// A missing or corrupt file starts an empty ledger.
    pub fn with_ledger_path(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let loaded = load_ledger(&path);
        if !loaded.is_empty() {
            tracing::info!(
                "rate limiter {}: loaded {} ledger entries from {}",
                self.name,
                loaded.len(),
                path.display()
            );
        }
        self.ledger = Mutex::new(loaded);
        self.ledger_path = Some(path);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// True while the client's count in the current hour is below threshold.
    pub fn is_allowed(&self, client_id: &str) -> bool {
        self.count(client_id) < self.threshold
    }

    /// Requests recorded for the client in the current hour bucket.
    pub fn count(&self, client_id: &str) -> u32 {
        let key = ledger_key(client_id, &hour_bucket(self.clock.now()));
        self.lock().get(&key).copied().unwrap_or(0)
    }

    /// Count one request against the client's current bucket and prune
    /// buckets older than the retention window. Call only once the request
    /// has passed `is_allowed` and reached the upstream service.
    ///
    /// The ledger file, if any, is written on the calling thread. From async
    /// code use [`RateLimiter::record_async`].
    pub fn record(&self, client_id: &str) {
        if let Some(snapshot) = self.bump(client_id) {
            self.write_snapshot(snapshot);
        }
    }

    /// Like `record`, but the ledger file is written on the blocking pool.
    /// The in-memory count is updated before the write is scheduled.
    pub async fn record_async(self: &Arc<Self>, client_id: &str) {
        let Some(snapshot) = self.bump(client_id) else {
            return;
        };
        let limiter = Arc::clone(self);
        if let Err(e) = tokio::task::spawn_blocking(move || limiter.write_snapshot(snapshot)).await
        {
            tracing::warn!("rate limiter {}: ledger write task failed: {e}", self.name);
        }
    }

    /// Increment and prune under the ledger lock. Returns the encoded ledger
    /// when it is persisted.
    fn bump(&self, client_id: &str) -> Option<Snapshot> {
        let now = self.clock.now();
        let key = ledger_key(client_id, &hour_bucket(now));

        let mut ledger = self.lock();
        prune(&mut ledger, now);
        *ledger.entry(key).or_insert(0) += 1;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        self.ledger_path.as_ref()?;
        match serde_json::to_string(&*ledger) {
            Ok(json) => Some(Snapshot { generation, json }),
            Err(e) => {
                tracing::warn!("rate limiter {}: failed to encode ledger: {e}", self.name);
                None
            }
        }
    }

    /// Write `snapshot` unless a newer one already landed.
    fn write_snapshot(&self, snapshot: Snapshot) {
        let Some(path) = &self.ledger_path else {
            return;
        };
        let mut persisted = self
            .persisted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if snapshot.generation <= *persisted {
            return;
        }
        match persist(path, &snapshot.json) {
            Ok(()) => *persisted = snapshot.generation,
            Err(e) => {
                tracing::warn!("rate limiter {}: failed to persist ledger: {e}", self.name);
            }
        }
    }

    /// Number of keys currently held (all clients, all buckets).
    pub fn ledger_len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Hour bucket for a timestamp, e.g. `2024-03-01-14`.
pub fn hour_bucket(ts: DateTime<Utc>) -> String {
    ts.format(BUCKET_FORMAT).to_string()
}

fn ledger_key(client_id: &str, bucket: &str) -> String {
    format!("{client_id}-{bucket}")
}

/// Parse the bucket suffix of a ledger key back into a timestamp.
fn bucket_of(key: &str) -> Option<DateTime<Utc>> {
    let start = key.len().checked_sub(BUCKET_LEN)?;
    let bucket = key.get(start..)?;
    NaiveDateTime::parse_from_str(&format!("{bucket}:00:00"), "%Y-%m-%d-%H:%M:%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Drop entries whose bucket is older than the retention window, along with
/// keys that don't carry a parseable bucket.
fn prune(ledger: &mut HashMap<String, u32>, now: DateTime<Utc>) {
    let cutoff = now - Duration::hours(RETENTION_HOURS);
    ledger.retain(|key, _| bucket_of(key).is_some_and(|bucket| bucket + Duration::hours(1) > cutoff));
}

fn load_ledger(path: &std::path::Path) -> HashMap<String, u32> {
    match std::fs::read_to_string(path) {
        Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
            tracing::warn!("rate limiter: corrupt ledger at {}: {e}", path.display());
            HashMap::new()
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
        Err(e) => {
            tracing::warn!("rate limiter: failed to read {}: {e}", path.display());
            HashMap::new()
        }
    }
}

fn persist(path: &std::path::Path, json: &str) -> Result<(), std::io::Error> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    atomic_write(path, json)
}
