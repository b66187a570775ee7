use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("snapshot must be a JSON object")]
    InvalidSnapshot,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Small string key-value store used for settings and accumulated analytics.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    fn remove(&self, key: &str) -> StoreResult<()>;
    fn clear(&self) -> StoreResult<()>;
    fn keys(&self) -> StoreResult<Vec<String>>;
}

pub fn get_json<T>(store: &dyn KeyValueStore, key: &str) -> StoreResult<Option<T>>
where
    T: DeserializeOwned,
{
    match store.get(key)? {
        Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
        None => Ok(None),
    }
}

pub fn set_json<T>(store: &dyn KeyValueStore, key: &str, value: &T) -> StoreResult<()>
where
    T: Serialize,
{
    let payload = serde_json::to_string(value)?;
    store.set(key, &payload)
}

/// Serializes every entry as one JSON object. Values that are themselves JSON
/// are embedded as-is, anything else as a string.
pub fn export_snapshot(store: &dyn KeyValueStore) -> StoreResult<String> {
    let mut snapshot = serde_json::Map::new();
    for key in store.keys()? {
        if let Some(raw) = store.get(&key)? {
            let value = serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw));
            snapshot.insert(key, value);
        }
    }
    Ok(serde_json::to_string_pretty(&serde_json::Value::Object(snapshot))?)
}

pub fn import_snapshot(store: &dyn KeyValueStore, snapshot: &str) -> StoreResult<usize> {
    let serde_json::Value::Object(entries) = serde_json::from_str(snapshot)? else {
        return Err(StoreError::InvalidSnapshot);
    };

    let count = entries.len();
    for (key, value) in entries {
        match value {
            serde_json::Value::String(s) => store.set(&key, &s)?,
            other => store.set(&key, &other.to_string())?,
        }
    }
    Ok(count)
}

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn clear(&self) -> StoreResult<()> {
        self.entries.write().clear();
        Ok(())
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

/// Store backed by a single JSON document, rewritten on every mutation.
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let payload = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, payload)?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            warn!(error = %e, path = %self.path.display(), "atomic rename failed, writing in place");
            std::fs::write(&self.path, serde_json::to_string_pretty(entries)?)?;
        }
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut entries = self.entries.write();
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        let mut entries = self.entries.write();
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }

    fn clear(&self) -> StoreResult<()> {
        let mut entries = self.entries.write();
        entries.clear();
        self.flush(&entries)
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Settings {
        enabled: bool,
        threshold: f64,
    }

    #[test]
    fn test_memory_store_json_helpers() {
        let store = MemoryStore::new();
        let settings = Settings {
            enabled: true,
            threshold: 0.6,
        };
        set_json(&store, "settings", &settings).unwrap();
        let loaded: Option<Settings> = get_json(&store, "settings").unwrap();
        assert_eq!(loaded, Some(settings));

        store.remove("settings").unwrap();
        assert!(get_json::<Settings>(&store, "settings").unwrap().is_none());
    }

    #[test]
    fn test_snapshot_export_and_import() {
        let store = MemoryStore::new();
        store.set("name", "learner").unwrap();
        set_json(&store, "count", &3).unwrap();

        let snapshot = export_snapshot(&store).unwrap();
        let value: serde_json::Value = serde_json::from_str(&snapshot).unwrap();
        assert_eq!(value["count"], 3);
        assert_eq!(value["name"], "learner");

        let other = MemoryStore::new();
        assert_eq!(import_snapshot(&other, &snapshot).unwrap(), 2);
        assert_eq!(other.get("name").unwrap().as_deref(), Some("learner"));
        assert_eq!(get_json::<i32>(&other, "count").unwrap(), Some(3));
    }

    #[test]
    fn test_import_rejects_non_object() {
        let store = MemoryStore::new();
        assert!(matches!(import_snapshot(&store, "[1,2]"), Err(StoreError::InvalidSnapshot)));
    }

    #[test]
    fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("affect").join("store.json");
        {
            let store = FileStore::open(&path).unwrap();
            store.set("a", "1").unwrap();
            store.set("b", "2").unwrap();
            store.remove("a").unwrap();
        }
        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.keys().unwrap(), vec!["b".to_string()]);
        reopened.clear().unwrap();
        assert!(FileStore::open(&path).unwrap().keys().unwrap().is_empty());
    }
}
