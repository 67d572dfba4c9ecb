//! Snapshot storage backends.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::SessionRecord;

/// Current snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

/// Errors that can occur while reading or writing a snapshot.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Filesystem failure.
    #[error("snapshot I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The records could not be encoded.
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    /// The snapshot was written by a newer format.
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    /// The blocking store task did not complete.
    #[error("snapshot task failed: {0}")]
    Task(String),
}

impl PersistenceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Durable home of the session snapshot.
pub trait SnapshotStore: Send + Sync {
    /// Reads every persisted record. A missing snapshot is empty.
    fn load(&self) -> Result<Vec<SessionRecord>, PersistenceError>;

    /// Replaces the snapshot with `records`.
    fn save(&self, records: &[SessionRecord]) -> Result<(), PersistenceError>;
}

/// On-disk layout of the snapshot document.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotData {
    version: u32,
    #[serde(default)]
    sessions: Vec<SessionRecord>,
}

/// Snapshot store backed by a single JSON file.
///
/// Writes go to a sibling temp file which is then renamed over the snapshot,
/// so readers never observe a partial document.
#[derive(Debug, Clone)]
pub struct JsonSnapshotStore {
    path: PathBuf,
}

impl JsonSnapshotStore {
    /// Creates a store for the given file. Nothing is read until `load`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Path of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt_path(&self) -> PathBuf {
        self.path.with_extension("json.corrupt")
    }

    /// Moves an unreadable snapshot out of the way so the next save starts
    /// clean.
    fn quarantine(&self, reason: &str) {
        let target = self.corrupt_path();
        match fs::rename(&self.path, &target) {
            Ok(()) => tracing::error!(
                path = %self.path.display(),
                moved_to = %target.display(),
                reason = %reason,
                "Session snapshot is corrupt; starting empty"
            ),
            Err(e) => tracing::error!(
                path = %self.path.display(),
                reason = %reason,
                error = %e,
                "Session snapshot is corrupt and could not be moved aside; starting empty"
            ),
        }
    }
}

impl SnapshotStore for JsonSnapshotStore {
    fn load(&self) -> Result<Vec<SessionRecord>, PersistenceError> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "No session snapshot, starting empty");
            return Ok(Vec::new());
        }

        let contents =
            fs::read_to_string(&self.path).map_err(|e| PersistenceError::io(&self.path, e))?;

        let data: SnapshotData = match serde_json::from_str(&contents) {
            Ok(data) => data,
            Err(e) => {
                self.quarantine(&e.to_string());
                return Ok(Vec::new());
            }
        };

        if data.version > SNAPSHOT_VERSION {
            return Err(PersistenceError::UnsupportedVersion(data.version));
        }

        tracing::info!(
            path = %self.path.display(),
            count = data.sessions.len(),
            "Loaded session snapshot"
        );
        Ok(data.sessions)
    }

    fn save(&self, records: &[SessionRecord]) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
        }

        let data = SnapshotData {
            version: SNAPSHOT_VERSION,
            sessions: records.to_vec(),
        };
        let contents = serde_json::to_string_pretty(&data)?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, contents).map_err(|e| PersistenceError::io(&temp_path, e))?;
        fs::rename(&temp_path, &self.path).map_err(|e| PersistenceError::io(&self.path, e))?;

        tracing::debug!(path = %self.path.display(), count = records.len(), "Saved session snapshot");
        Ok(())
    }
}
