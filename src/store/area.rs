use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::StoreError;

const PROBE_KEY: &str = "__storage_probe__";

/// Client-local key/value persistence, the shape of a browser's local storage.
pub trait StorageArea: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// True if a write/remove round trip succeeds.
    fn probe(&self) -> bool {
        self.set(PROBE_KEY, PROBE_KEY).is_ok() && self.remove(PROBE_KEY).is_ok()
    }
}

/// One `<key>.json` file per key inside a directory.
pub struct FileArea {
    dir: PathBuf,
}

impl FileArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl StorageArea for FileArea {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir)?;
        atomic_write(&self.path_for(key), value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Atomic write: write to temp file, then rename.
/// Temp filename includes PID to avoid cross-process collisions.
pub(crate) fn atomic_write(path: &Path, content: &str) -> Result<(), std::io::Error> {
    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    std::fs::write(&tmp_path, content.as_bytes())?;
    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }
    Ok(())
}

/// In-process area. Can simulate an unusable area or a failing key.
#[derive(Default)]
pub struct MemoryArea {
    values: Mutex<HashMap<String, String>>,
    unavailable: bool,
    failing_keys: Mutex<HashSet<String>>,
}

impl MemoryArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// An area that rejects every operation.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Make subsequent writes to `key` fail.
    pub fn fail_writes_to(&self, key: &str) {
        if let Ok(mut keys) = self.failing_keys.lock() {
            keys.insert(key.to_string());
        }
    }

    pub fn heal(&self) {
        if let Ok(mut keys) = self.failing_keys.lock() {
            keys.clear();
        }
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }
}

impl StorageArea for MemoryArea {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        let values = self.values.lock().map_err(|_| StoreError::Unavailable)?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        let failing = self
            .failing_keys
            .lock()
            .map(|k| k.contains(key))
            .unwrap_or(false);
        if failing {
            return Err(StoreError::Io(std::io::Error::other(format!(
                "write to '{key}' rejected"
            ))));
        }
        let mut values = self.values.lock().map_err(|_| StoreError::Unavailable)?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        let mut values = self.values.lock().map_err(|_| StoreError::Unavailable)?;
        values.remove(key);
        Ok(())
    }
}
