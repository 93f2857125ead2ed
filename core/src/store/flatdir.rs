//! `FlatDir`: one file per message, keyed by a random identifier.
//!
//! Near-direct port of `examples/original_source/ssm/message_directory.py`'s
//! `MessageDirectory`: UUID-named files, a no-op `lock`/`purge` (the
//! backend assumes a single writer), and mtime-sorted enumeration so the
//! oldest-modified entry is drained first.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::warn;

use super::record::StoreRecord;
use super::{MessageStore, StoreError};

pub struct FlatDir {
    dir: PathBuf,
}

impl FlatDir {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(|e| StoreError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;
        Ok(FlatDir {
            dir: dir.to_path_buf(),
        })
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    fn entries_with_mtime(&self) -> Result<Vec<(String, SystemTime)>, StoreError> {
        let mut out = Vec::new();
        let read_dir = fs::read_dir(&self.dir).map_err(|e| StoreError::Io {
            path: self.dir.display().to_string(),
            source: e,
        })?;
        for entry in read_dir {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("error reading {}: {}", self.dir.display(), e);
                    continue;
                }
            };
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("error statting {:?}: {}", entry.path(), e);
                    continue;
                }
            };
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            out.push((entry.file_name().to_string_lossy().to_string(), mtime));
        }
        Ok(out)
    }
}

impl MessageStore for FlatDir {
    fn add_record(&self, record: StoreRecord) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let encoded = bincode::serialize(&record)?;
        let path = self.entry_path(&id);
        if let Err(e) = fs::write(&path, &encoded) {
            warn!("could not create file {}: {}", path.display(), e);
        }
        Ok(id)
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.entries_with_mtime()?.len())
    }

    fn enumerate(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = self.entries_with_mtime()?;
        entries.sort_by_key(|(_, mtime)| *mtime);
        Ok(entries.into_iter().map(|(name, _)| name).collect())
    }

    fn lock(&self, _id: &str) -> Result<bool, StoreError> {
        // Single-writer assumed when this backend is chosen.
        Ok(true)
    }

    fn get_record(&self, id: &str) -> Result<StoreRecord, StoreError> {
        let path = self.entry_path(id);
        let bytes = fs::read(&path).map_err(|e| StoreError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(bincode::deserialize(&bytes)?)
    }

    fn remove(&self, id: &str) -> Result<(), StoreError> {
        let path = self.entry_path(id);
        if let Err(e) = fs::remove_file(&path) {
            warn!("could not remove {}, it may get resent: {}", id, e);
        }
        Ok(())
    }

    fn purge(&self) -> Result<(), StoreError> {
        // No intermediate directories or stale locks to clean up.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlatDir::open(dir.path()).unwrap();
        let id = store.add(b"hello").unwrap();
        assert_eq!(store.get(&id).unwrap(), b"hello");
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn lock_always_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlatDir::open(dir.path()).unwrap();
        let id = store.add(b"x").unwrap();
        assert!(store.lock(&id).unwrap());
        assert!(store.lock(&id).unwrap());
    }

    #[test]
    fn enumerate_is_mtime_ascending() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlatDir::open(dir.path()).unwrap();
        let first = store.add(b"first").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let second = store.add(b"second").unwrap();
        let order = store.enumerate().unwrap();
        assert_eq!(order, vec![first, second]);
    }

    #[test]
    fn remove_then_get_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = FlatDir::open(dir.path()).unwrap();
        let id = store.add(b"gone").unwrap();
        store.remove(&id).unwrap();
        assert!(store.get(&id).is_err());
    }
}
