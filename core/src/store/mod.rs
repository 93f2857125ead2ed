//! Pluggable on-disk message queue: `DirQueue` (atomic multi-writer,
//! per-entry locking) or `FlatDir` (one file per message, single-writer).

pub mod dirqueue;
pub mod flatdir;
pub mod record;

use std::path::Path;

pub use dirqueue::DirQueue;
pub use flatdir::FlatDir;
pub use record::StoreRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error on store path {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no such entry: {0}")]
    NotFound(String),
    #[error("record encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("{path} is not a valid {expected} store: {reason}")]
    WrongBackend {
        path: String,
        expected: &'static str,
        reason: String,
    },
}

/// Backend selection per `messaging.path_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    DirQ,
    Directory,
}

impl PathType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "dirq" => Some(PathType::DirQ),
            "directory" => Some(PathType::Directory),
            _ => None,
        }
    }
}

/// `add(bytes) -> id`, `count() -> int`, `enumerate() -> ordered ids`,
/// `lock(id) -> bool`, `get(id) -> bytes`, `remove(id)`, `purge()` per
/// spec.md §4.2, generalized to carry the declared schema
/// (`{body, signer?, empa_id?, error?}`) so one interface serves the
/// outbound, incoming and reject queues alike.
pub trait MessageStore: Send + Sync {
    fn add_record(&self, record: StoreRecord) -> Result<String, StoreError>;
    fn count(&self) -> Result<usize, StoreError>;
    fn enumerate(&self) -> Result<Vec<String>, StoreError>;
    fn lock(&self, id: &str) -> Result<bool, StoreError>;
    fn get_record(&self, id: &str) -> Result<StoreRecord, StoreError>;
    fn remove(&self, id: &str) -> Result<(), StoreError>;
    fn purge(&self) -> Result<(), StoreError>;

    fn add(&self, body: &[u8]) -> Result<String, StoreError> {
        self.add_record(StoreRecord::body_only(body.to_vec()))
    }

    fn get(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        self.get_record(id).map(|r| r.body)
    }
}

/// Open the backend named by `path_type`, validating that `path` actually
/// looks like that backend's layout (spec.md §4.2: "Attempting to open a
/// dirq on a directory that contains non-bucket files, or a directory
/// backend on a path that already has bucket subdirectories, fails with a
/// configuration error to prevent silent data loss").
pub fn open_store(path: &Path, path_type: PathType) -> Result<Box<dyn MessageStore>, StoreError> {
    std::fs::create_dir_all(path).map_err(|e| StoreError::Io {
        path: path.display().to_string(),
        source: e,
    })?;

    let mut subdirs = Vec::new();
    let mut files = Vec::new();
    for entry in std::fs::read_dir(path).map_err(|e| StoreError::Io {
        path: path.display().to_string(),
        source: e,
    })? {
        let entry = entry.map_err(|e| StoreError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let file_type = entry.file_type().map_err(|e| StoreError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name == "combined_queue" || name == "temp" {
            continue;
        }
        if file_type.is_dir() {
            subdirs.push(name);
        } else {
            files.push(name);
        }
    }

    match path_type {
        PathType::DirQ => {
            if !files.is_empty() {
                return Err(StoreError::WrongBackend {
                    path: path.display().to_string(),
                    expected: "dirq",
                    reason: "directory contains plain files; should path_type be 'directory'?"
                        .to_string(),
                });
            }
            Ok(Box::new(DirQueue::open(path)?))
        }
        PathType::Directory => {
            if !subdirs.is_empty() {
                return Err(StoreError::WrongBackend {
                    path: path.display().to_string(),
                    expected: "directory",
                    reason: "directory contains subdirectories; should path_type be 'dirq'?"
                        .to_string(),
                });
            }
            Ok(Box::new(FlatDir::open(path)?))
        }
    }
}
