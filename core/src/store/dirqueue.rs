//! `DirQueue`: atomic multi-writer directory queue with per-entry locking.
//!
//! Entries live under time-bucket subdirectories (an hour-granularity hex
//! bucket name); `add` stages the encoded record in a shared `temp/`
//! directory and renames it into place, which is atomic on any POSIX
//! filesystem the bucket and temp directory share. `lock` creates a
//! sibling `<name>.lock` marker; since `std::fs::rename` overwrites an
//! existing destination on every platform libstd supports (unlike a bare
//! `rename(2)` with `RENAME_NOREPLACE`), the no-clobber guarantee the
//! lock needs is realized with `OpenOptions::create_new` instead — logged
//! as a deliberate substitution for spec.md §4.2's "lock creates a sibling
//! lock marker by rename" in DESIGN.md.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use super::record::StoreRecord;
use super::{MessageStore, StoreError};

/// Stale lock markers (and empty bucket directories) older than this are
/// reclaimed by `purge()`.
pub const LOCK_GRACE: Duration = Duration::from_secs(5 * 60);

const LOCK_SUFFIX: &str = ".lock";
const TEMP_DIR: &str = "temp";
const BUCKET_GRANULARITY_SECS: u64 = 3600;

pub struct DirQueue {
    root: PathBuf,
    counter: AtomicU64,
}

fn now_unix() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

fn bucket_name(now: Duration) -> String {
    format!("{:08x}", now.as_secs() / BUCKET_GRANULARITY_SECS)
}

impl DirQueue {
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(root).map_err(|e| StoreError::Io {
            path: root.display().to_string(),
            source: e,
        })?;
        fs::create_dir_all(root.join(TEMP_DIR)).map_err(|e| StoreError::Io {
            path: root.display().to_string(),
            source: e,
        })?;
        Ok(DirQueue {
            root: root.to_path_buf(),
            counter: AtomicU64::new(0),
        })
    }

    fn entry_name(&self) -> String {
        let now = now_unix();
        let counter = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{:011x}{:05x}{:06x}", now.as_secs(), now.subsec_micros(), counter & 0xffffff)
    }

    fn split_id(id: &str) -> Result<(&str, &str), StoreError> {
        id.split_once('/')
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn main_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        let (bucket, name) = Self::split_id(id)?;
        Ok(self.root.join(bucket).join(name))
    }

    fn lock_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        let (bucket, name) = Self::split_id(id)?;
        Ok(self.root.join(bucket).join(format!("{name}{LOCK_SUFFIX}")))
    }

    fn bucket_dirs(&self) -> Result<Vec<String>, StoreError> {
        let mut buckets = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| StoreError::Io {
            path: self.root.display().to_string(),
            source: e,
        })? {
            let entry = entry.map_err(|e| StoreError::Io {
                path: self.root.display().to_string(),
                source: e,
            })?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name == TEMP_DIR || name == "combined_queue" {
                continue;
            }
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                buckets.push(name);
            }
        }
        buckets.sort();
        Ok(buckets)
    }
}

impl MessageStore for DirQueue {
    fn add_record(&self, record: StoreRecord) -> Result<String, StoreError> {
        let encoded = bincode::serialize(&record)?;
        let name = self.entry_name();
        let bucket = bucket_name(now_unix());
        let bucket_dir = self.root.join(&bucket);
        fs::create_dir_all(&bucket_dir).map_err(|e| StoreError::Io {
            path: bucket_dir.display().to_string(),
            source: e,
        })?;

        let temp_path = self.root.join(TEMP_DIR).join(&name);
        {
            let mut f = fs::File::create(&temp_path).map_err(|e| StoreError::Io {
                path: temp_path.display().to_string(),
                source: e,
            })?;
            f.write_all(&encoded).map_err(|e| StoreError::Io {
                path: temp_path.display().to_string(),
                source: e,
            })?;
            f.sync_all().ok();
        }
        let final_path = bucket_dir.join(&name);
        fs::rename(&temp_path, &final_path).map_err(|e| StoreError::Io {
            path: final_path.display().to_string(),
            source: e,
        })?;

        Ok(format!("{bucket}/{name}"))
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.enumerate()?.len())
    }

    fn enumerate(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for bucket in self.bucket_dirs()? {
            let bucket_dir = self.root.join(&bucket);
            let mut names: Vec<String> = fs::read_dir(&bucket_dir)
                .map_err(|e| StoreError::Io {
                    path: bucket_dir.display().to_string(),
                    source: e,
                })?
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .filter(|n| !n.ends_with(LOCK_SUFFIX))
                .collect();
            names.sort();
            for name in names {
                ids.push(format!("{bucket}/{name}"));
            }
        }
        Ok(ids)
    }

    fn lock(&self, id: &str) -> Result<bool, StoreError> {
        let path = self.lock_path(id)?;
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StoreError::Io {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }

    fn get_record(&self, id: &str) -> Result<StoreRecord, StoreError> {
        let path = self.main_path(id)?;
        let bytes = fs::read(&path).map_err(|e| StoreError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(bincode::deserialize(&bytes)?)
    }

    fn remove(&self, id: &str) -> Result<(), StoreError> {
        let main = self.main_path(id)?;
        if let Err(e) = fs::remove_file(&main) {
            warn!("could not remove {}, it may get resent: {}", id, e);
        }
        let lock = self.lock_path(id)?;
        let _ = fs::remove_file(&lock);
        Ok(())
    }

    fn purge(&self) -> Result<(), StoreError> {
        let grace_cutoff = SystemTime::now()
            .checked_sub(LOCK_GRACE)
            .unwrap_or(UNIX_EPOCH);

        for bucket in self.bucket_dirs()? {
            let bucket_dir = self.root.join(&bucket);
            let entries: Vec<_> = match fs::read_dir(&bucket_dir) {
                Ok(r) => r.filter_map(|e| e.ok()).collect(),
                Err(e) => {
                    warn!("purge: could not read {}: {}", bucket_dir.display(), e);
                    continue;
                }
            };

            for entry in &entries {
                let name = entry.file_name().to_string_lossy().to_string();
                if !name.ends_with(LOCK_SUFFIX) {
                    continue;
                }
                let mtime = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::now());
                if mtime < grace_cutoff {
                    if let Err(e) = fs::remove_file(entry.path()) {
                        warn!("purge: could not release lock {:?}: {}", entry.path(), e);
                    }
                }
            }

            if fs::read_dir(&bucket_dir)
                .map(|mut r| r.next().is_none())
                .unwrap_or(false)
            {
                let _ = fs::remove_dir(&bucket_dir);
            }
        }
        debug!("purge() complete for {}", self.root.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirQueue::open(dir.path()).unwrap();
        let id = store.add(b"hello").unwrap();
        assert_eq!(store.get(&id).unwrap(), b"hello");
    }

    #[test]
    fn enumerate_is_fifo_by_insertion() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirQueue::open(dir.path()).unwrap();
        let a = store.add(b"a").unwrap();
        let b = store.add(b"b").unwrap();
        let c = store.add(b"c").unwrap();
        assert_eq!(store.enumerate().unwrap(), vec![a, b, c]);
    }

    #[test]
    fn second_lock_attempt_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirQueue::open(dir.path()).unwrap();
        let id = store.add(b"x").unwrap();
        assert!(store.lock(&id).unwrap());
        assert!(!store.lock(&id).unwrap());
    }

    #[test]
    fn remove_clears_main_file_and_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirQueue::open(dir.path()).unwrap();
        let id = store.add(b"x").unwrap();
        store.lock(&id).unwrap();
        store.remove(&id).unwrap();
        assert!(store.get(&id).is_err());
    }

    #[test]
    fn purge_removes_empty_bucket_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirQueue::open(dir.path()).unwrap();
        let id = store.add(b"x").unwrap();
        store.remove(&id).unwrap();
        store.purge().unwrap();
        let remaining: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n != TEMP_DIR)
            .collect();
        assert!(remaining.is_empty());
    }

    #[test]
    fn opening_twice_does_not_lose_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DirQueue::open(dir.path()).unwrap();
            store.add(b"first").unwrap();
        }
        let store = DirQueue::open(dir.path()).unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }
}
