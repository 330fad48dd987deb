//! File-based state store
//!
//! Each value lives in its own JSON file inside the storage directory. Writes go to a
//! temporary file first and are renamed into place. Logs that only grow are kept as
//! JSON lines and appended to one record at a time.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::PeerError;

/// Group table file name
pub const GROUPS_FILE: &str = "groups.json";

/// Direct message log file name, one JSON record per line
pub const MESSAGES_FILE: &str = "messages.jsonl";

pub struct StateStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    /// Open (and create if needed) a storage directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PeerError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| PeerError::Storage(format!("cannot create {}: {}", dir.display(), e)))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load `name`, returning the default value when the file does not exist yet.
    pub fn load<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T, PeerError> {
        let path = self.dir.join(name);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                PeerError::Storage(format!("cannot parse {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(PeerError::Storage(format!(
                "cannot read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Like [`load`](Self::load), but a corrupt file is logged and replaced by the default.
    pub fn load_or_default<T: DeserializeOwned + Default>(&self, name: &str) -> T {
        self.load(name).unwrap_or_else(|e| {
            warn!("Ignoring stored {}: {}", name, e);
            T::default()
        })
    }

    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<(), PeerError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.replace_file(name, &bytes)
    }

    fn replace_file(&self, name: &str, bytes: &[u8]) -> Result<(), PeerError> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{}.tmp", name));

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Append one record to the line log `name`.
    pub fn append_line<T: Serialize>(&self, name: &str, record: &T) -> Result<(), PeerError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(name))?;
        file.write_all(&line)?;
        Ok(())
    }

    /// Replace the whole line log `name` with `records`.
    pub fn save_lines<T: Serialize>(&self, name: &str, records: &[T]) -> Result<(), PeerError> {
        let mut bytes = Vec::new();
        for record in records {
            bytes.extend(serde_json::to_vec(record)?);
            bytes.push(b'\n');
        }
        self.replace_file(name, &bytes)
    }

    /// Read the line log `name`. A missing file is empty; unreadable lines are skipped.
    pub fn load_lines<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>, PeerError> {
        let path = self.dir.join(name);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(PeerError::Storage(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let mut records = Vec::new();
        for (number, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping line {} of {}: {}", number + 1, name, e),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_loads_default() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let value: BTreeMap<String, u32> = store.load("absent.json").unwrap();
        assert!(value.is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path().join("nested")).unwrap();

        let mut value = BTreeMap::new();
        value.insert("team".to_string(), 3u32);
        store.save("groups.json", &value).unwrap();

        let loaded: BTreeMap<String, u32> = store.load("groups.json").unwrap();
        assert_eq!(loaded, value);
        assert!(!store.dir().join("groups.json.tmp").exists());
    }

    #[test]
    fn test_line_log_append_and_replace() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        assert!(store.load_lines::<u32>("log.jsonl").unwrap().is_empty());

        store.append_line("log.jsonl", &1u32).unwrap();
        store.append_line("log.jsonl", &2u32).unwrap();
        assert_eq!(store.load_lines::<u32>("log.jsonl").unwrap(), vec![1, 2]);

        store.save_lines("log.jsonl", &[7u32]).unwrap();
        assert_eq!(store.load_lines::<u32>("log.jsonl").unwrap(), vec![7]);

        store.save_lines::<u32>("log.jsonl", &[]).unwrap();
        assert!(store.load_lines::<u32>("log.jsonl").unwrap().is_empty());
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("log.jsonl"), b"1\n2\n{\"trunc").unwrap();
        assert_eq!(store.load_lines::<u32>("log.jsonl").unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_corrupt_file_falls_back() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{ not json").unwrap();

        assert!(store.load::<Vec<u8>>("broken.json").is_err());
        assert!(store.load_or_default::<Vec<u8>>("broken.json").is_empty());
    }
}
