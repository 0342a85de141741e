//! Durable key-value stores backing the action queue.
//!
//! # Design Decisions
//! - One record per key; a write is all-or-nothing
//! - `FileStore` writes a temp file, syncs it, then renames it over the target,
//!   so a crash leaves either the old record or the new one

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{ResilienceError, ResilienceResult};

/// Key-value persistence surviving process restarts.
pub trait DurableStore: Send + Sync + 'static {
    fn put(&self, key: &str, value: &[u8]) -> ResilienceResult<()>;
    fn get(&self, key: &str) -> ResilienceResult<Option<Vec<u8>>>;
    fn get_all(&self) -> ResilienceResult<Vec<(String, Vec<u8>)>>;
    fn delete(&self, key: &str) -> ResilienceResult<()>;
}

/// Volatile store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableStore for MemoryStore {
    fn put(&self, key: &str, value: &[u8]) -> ResilienceResult<()> {
        self.records
            .lock()
            .expect("memory store mutex poisoned")
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> ResilienceResult<Option<Vec<u8>>> {
        Ok(self.records.lock().expect("memory store mutex poisoned").get(key).cloned())
    }

    fn get_all(&self) -> ResilienceResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .records
            .lock()
            .expect("memory store mutex poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn delete(&self, key: &str) -> ResilienceResult<()> {
        self.records.lock().expect("memory store mutex poisoned").remove(key);
        Ok(())
    }
}

const RECORD_EXT: &str = "json";
const TEMP_EXT: &str = "tmp";

/// Directory-backed store: one file per key.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) the store directory. Leftover temp files
    /// from an interrupted write are removed.
    pub fn open(dir: impl AsRef<Path>) -> ResilienceResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            ResilienceError::Store(format!("cannot create store directory {}: {}", dir.display(), e))
        })?;

        let store = Self { dir };
        for entry in store.read_dir()? {
            if entry.extension().is_some_and(|ext| ext == TEMP_EXT) {
                let _ = fs::remove_file(&entry);
            }
        }
        tracing::debug!(dir = %store.dir.display(), "File store opened");
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> ResilienceResult<PathBuf> {
        if key.is_empty()
            || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ResilienceError::Store(format!("invalid store key '{}'", key)));
        }
        Ok(self.dir.join(format!("{}.{}", key, RECORD_EXT)))
    }

    fn read_dir(&self) -> ResilienceResult<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| ResilienceError::Store(format!("cannot list {}: {}", self.dir.display(), e)))?;
        Ok(entries.filter_map(|e| e.ok().map(|e| e.path())).collect())
    }
}

impl DurableStore for FileStore {
    fn put(&self, key: &str, value: &[u8]) -> ResilienceResult<()> {
        let target = self.path_for(key)?;
        let temp = target.with_extension(TEMP_EXT);
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&temp)?;
            file.write_all(value)?;
            file.sync_all()?;
            fs::rename(&temp, &target)
        };
        write().map_err(|e| {
            let _ = fs::remove_file(&temp);
            ResilienceError::QueuePersist(format!("write {}: {}", target.display(), e))
        })
    }

    fn get(&self, key: &str) -> ResilienceResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ResilienceError::Store(format!("read {}: {}", path.display(), e))),
        }
    }

    fn get_all(&self) -> ResilienceResult<Vec<(String, Vec<u8>)>> {
        let mut records = Vec::new();
        for path in self.read_dir()? {
            if !path.extension().is_some_and(|ext| ext == RECORD_EXT) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            match fs::read(&path) {
                Ok(bytes) => records.push((key, bytes)),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }

    fn delete(&self, key: &str) -> ResilienceResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ResilienceError::Store(format!("delete {}: {}", path.display(), e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn DurableStore) {
        store.put("a-1", b"one").unwrap();
        store.put("b_2", b"two").unwrap();
        store.put("a-1", b"uno").unwrap();

        assert_eq!(store.get("a-1").unwrap(), Some(b"uno".to_vec()));
        assert_eq!(store.get("missing").unwrap(), None);
        assert_eq!(
            store.get_all().unwrap(),
            vec![("a-1".to_string(), b"uno".to_vec()), ("b_2".to_string(), b"two".to_vec())]
        );

        store.delete("a-1").unwrap();
        store.delete("a-1").unwrap();
        assert_eq!(store.get_all().unwrap().len(), 1);
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileStore::open(dir.path()).unwrap());
    }

    #[test]
    fn test_file_store_survives_reopen_and_ignores_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.put("kept", b"data").unwrap();
        }
        std::fs::write(dir.path().join("torn.tmp"), b"partial").unwrap();

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get_all().unwrap(), vec![("kept".to_string(), b"data".to_vec())]);
        assert!(!dir.path().join("torn.tmp").exists());
    }

    #[test]
    fn test_file_store_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(matches!(store.put("../escape", b"x"), Err(ResilienceError::Store(_))));
    }
}
