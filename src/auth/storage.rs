//! Namespaced key-value persistence for the client registry.
//!
//! Everything lives in one JSON document shaped like
//! `{"clients": {"<id>": {...}}, "codes": {"<code>": {...}}}` and is rewritten
//! wholesale on each mutation. Swapping this for an embedded database only
//! means providing another [`KeyValueStore`].

use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialise store contents: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StorageError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Option<Value>;

    fn put(&self, namespace: &str, key: &str, value: Value) -> Result<(), StorageError>;

    /// Replaces the value under `key` with `new` only if it currently equals
    /// `expected`. Returns whether the swap happened.
    fn compare_and_swap(
        &self,
        namespace: &str,
        key: &str,
        expected: &Value,
        new: Value,
    ) -> Result<bool, StorageError>;

    fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError>;

    /// Keeps only the entries for which `keep` returns true, returning how many
    /// were dropped.
    fn retain(
        &self,
        namespace: &str,
        keep: &dyn Fn(&Value) -> bool,
    ) -> Result<usize, StorageError>;
}

type Collections = BTreeMap<String, BTreeMap<String, Value>>;

/// JSON-file backed store. With no path it's purely in-memory.
pub struct JsonFileStore {
    path: Option<PathBuf>,
    data: Mutex<Collections>,
}

impl JsonFileStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(Collections::new()),
        }
    }

    /// Opens (or lazily creates) the store at `path`. A missing file is an
    /// empty store; an unreadable or corrupt one is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let data = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<Collections>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Collections::new(),
            Err(e) => return Err(StorageError::io(&path, e)),
        };

        tracing::info!(
            "Loaded {} stored entries from {}",
            data.values().map(BTreeMap::len).sum::<usize>(),
            path.display()
        );

        Ok(Self {
            path: Some(path),
            data: Mutex::new(data),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Collections> {
        // a panic mid-mutation can't leave a half-applied map behind: mutations
        // are built on a copy and only swapped in after persisting
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `mutate` to a copy of the current state, persists the copy, and
    /// only then makes it visible. Caller must hold the lock.
    fn commit<R>(
        &self,
        guard: &mut MutexGuard<'_, Collections>,
        mutate: impl FnOnce(&mut Collections) -> (R, bool),
    ) -> Result<R, StorageError> {
        let mut next = (**guard).clone();
        let (result, changed) = mutate(&mut next);
        if changed {
            self.persist(&next)?;
            **guard = next;
        }
        Ok(result)
    }

    fn persist(&self, data: &Collections) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }

        let content = serde_json::to_vec_pretty(data)?;
        let tmp = path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&tmp).map_err(|e| StorageError::io(&tmp, e))?;
        file.write_all(&content)
            .and_then(|()| file.sync_all())
            .map_err(|e| StorageError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, namespace: &str, key: &str) -> Option<Value> {
        self.lock().get(namespace)?.get(key).cloned()
    }

    fn put(&self, namespace: &str, key: &str, value: Value) -> Result<(), StorageError> {
        let mut guard = self.lock();
        self.commit(&mut guard, |data| {
            data.entry(namespace.to_string())
                .or_default()
                .insert(key.to_string(), value);
            ((), true)
        })
    }

    fn compare_and_swap(
        &self,
        namespace: &str,
        key: &str,
        expected: &Value,
        new: Value,
    ) -> Result<bool, StorageError> {
        let mut guard = self.lock();
        self.commit(&mut guard, |data| {
            match data.get_mut(namespace).and_then(|ns| ns.get_mut(key)) {
                Some(current) if current == expected => {
                    *current = new;
                    (true, true)
                }
                _ => (false, false),
            }
        })
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        let mut guard = self.lock();
        self.commit(&mut guard, |data| {
            let removed = data
                .get_mut(namespace)
                .is_some_and(|ns| ns.remove(key).is_some());
            (removed, removed)
        })
    }

    fn retain(
        &self,
        namespace: &str,
        keep: &dyn Fn(&Value) -> bool,
    ) -> Result<usize, StorageError> {
        let mut guard = self.lock();
        self.commit(&mut guard, |data| {
            let Some(ns) = data.get_mut(namespace) else {
                return (0, false);
            };
            let before = ns.len();
            ns.retain(|_, v| keep(v));
            let dropped = before - ns.len();
            (dropped, dropped > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_put_and_get() {
        let store = JsonFileStore::in_memory();
        store.put("clients", "a", json!({"name": "one"})).unwrap();

        assert_eq!(store.get("clients", "a"), Some(json!({"name": "one"})));
        assert_eq!(store.get("clients", "b"), None);
        assert_eq!(store.get("codes", "a"), None);
    }

    #[test]
    fn test_compare_and_swap_only_swaps_on_match() {
        let store = JsonFileStore::in_memory();
        store.put("codes", "c", json!({"used": false})).unwrap();

        let swapped = store
            .compare_and_swap("codes", "c", &json!({"used": false}), json!({"used": true}))
            .unwrap();
        assert!(swapped);

        let swapped_again = store
            .compare_and_swap("codes", "c", &json!({"used": false}), json!({"used": true}))
            .unwrap();
        assert!(!swapped_again);

        let missing = store
            .compare_and_swap("codes", "nope", &json!({}), json!({}))
            .unwrap();
        assert!(!missing);
    }

    #[test]
    fn test_delete_and_retain() {
        let store = JsonFileStore::in_memory();
        for i in 0..4 {
            store.put("codes", &i.to_string(), json!({"n": i})).unwrap();
        }

        assert!(store.delete("codes", "0").unwrap());
        assert!(!store.delete("codes", "0").unwrap());

        let dropped = store
            .retain("codes", &|v| v["n"].as_i64().unwrap_or(0) % 2 == 0)
            .unwrap();
        assert_eq!(dropped, 2);
        assert!(store.get("codes", "2").is_some());
        assert!(store.get("codes", "3").is_none());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/oauth_clients.json");

        {
            let store = JsonFileStore::open(&path).unwrap();
            store.put("clients", "a", json!({"name": "one"})).unwrap();
        }

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get("clients", "a"), Some(json!({"name": "one"})));
    }

    #[test]
    fn test_failed_write_leaves_memory_untouched() {
        let dir = TempDir::new().unwrap();
        // a directory where the file should be makes the rename fail
        let path = dir.path().join("store.json");
        std::fs::create_dir(&path).unwrap();
        let store = JsonFileStore {
            path: Some(path),
            data: Mutex::new(Collections::new()),
        };

        assert!(store.put("clients", "a", json!(1)).is_err());
        assert_eq!(store.get("clients", "a"), None);
    }

    #[test]
    fn test_open_rejects_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            JsonFileStore::open(&path),
            Err(StorageError::Serde(_))
        ));
    }
}
