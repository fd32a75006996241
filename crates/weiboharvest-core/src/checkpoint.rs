//! Durable cursor snapshots, one JSON file per target key.
//!
//! Saves are atomic (temp file + fsync + rename) and guarded by a
//! non-blocking OS advisory lock on a `.lock` sidecar, so two runs pointed
//! at the same state directory fail fast instead of interleaving writes.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::Error;
use crate::fsutil::atomic_write;
use crate::model::CursorState;

/// On-disk schema version; bump to invalidate all stored checkpoints.
pub const SCHEMA_VERSION: &str = "1";

#[derive(serde::Serialize, serde::Deserialize)]
struct CheckpointFile {
    version: String,
    page: u32,
    cursor: Option<String>,
    seen_mids: Vec<String>,
    options_hash: String,
    timestamp: Option<String>,
}

/// Scoped exclusive lock on a checkpoint key. Released on drop, which
/// also covers unwinding.
#[derive(Debug)]
pub struct CheckpointLock {
    file: File,
}

impl Drop for CheckpointLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Persists one [`CursorState`] per target key under a state directory.
pub struct CheckpointManager {
    dir: PathBuf,
    options_hash: String,
}

impl CheckpointManager {
    /// Create the manager, ensuring the state directory exists.
    pub fn new(dir: impl Into<PathBuf>, options_hash: impl Into<String>) -> Result<Self, Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::Io {
            path: dir.clone(),
            source: e,
        })?;
        Ok(Self {
            dir,
            options_hash: options_hash.into(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn json_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.lock"))
    }

    /// Acquire the exclusive lock for `key`, failing immediately with a
    /// checkpoint error on contention. Never blocks.
    pub fn acquire_lock(&self, key: &str) -> Result<CheckpointLock, Error> {
        let path = self.lock_path(key);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| Error::Io {
                path: path.clone(),
                source: e,
            })?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(CheckpointLock { file }),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(Error::Checkpoint {
                message: format!("lock contention: {key}"),
            }),
            Err(e) => Err(Error::Io { path, source: e }),
        }
    }

    /// Load the stored state for `key`.
    ///
    /// Returns `None` (never an error) when the file is absent, malformed,
    /// from a different schema version, or from a run with different
    /// layout-affecting options. Corrupt files are logged at warn level.
    pub fn load(&self, key: &str) -> Option<CursorState> {
        let bytes = fs::read(self.json_path(key)).ok()?;
        let parsed: CheckpointFile = match serde_json::from_slice(&bytes) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(key, error = %e, "corrupt checkpoint, ignoring");
                return None;
            }
        };
        if parsed.version != SCHEMA_VERSION || parsed.options_hash != self.options_hash {
            return None;
        }
        Some(CursorState {
            page: parsed.page,
            cursor: parsed.cursor,
            seen_mids: parsed.seen_mids,
            options_hash: parsed.options_hash,
            timestamp: parsed.timestamp,
        })
    }

    /// Atomically persist `state` under `key`. On failure the previous
    /// file, if any, is left unchanged.
    pub fn save(&self, key: &str, state: &CursorState) -> Result<(), Error> {
        let record = CheckpointFile {
            version: SCHEMA_VERSION.to_string(),
            page: state.page,
            cursor: state.cursor.clone(),
            seen_mids: state.seen_mids.clone(),
            options_hash: state.options_hash.clone(),
            timestamp: state.timestamp.clone(),
        };
        let path = self.json_path(key);
        let payload = serde_json::to_vec(&record).map_err(|e| Error::Io {
            path: path.clone(),
            source: std::io::Error::other(e),
        })?;
        atomic_write(&path, &payload)
    }

    /// Remove the stored state for `key`, tolerating its absence.
    pub fn clear(&self, key: &str) -> Result<(), Error> {
        let path = self.json_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io { path, source: e }),
        }
    }
}
