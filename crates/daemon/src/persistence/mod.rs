//! Durable session metadata.
//!
//! Only the session's identity survives a restart: id, name, working
//! directory and timestamps. Output buffers, connections and agent processes
//! are volatile, so every restored session comes back idle.

pub mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::session::{ProcessBridge, SessionId, SessionRegistry};

pub use store::{JsonSnapshotStore, PersistenceError, SnapshotStore};

/// Durable subset of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: SessionId,
    pub name: String,
    pub working_dir: PathBuf,
    pub created_at: u64,
    pub last_activity: u64,
}

/// Keeps the snapshot in step with the registry.
pub struct Persister<B: ProcessBridge> {
    registry: Arc<SessionRegistry<B>>,
    store: Arc<dyn SnapshotStore>,
    interval: Duration,
}

impl<B: ProcessBridge> Persister<B> {
    /// Creates a persister that flushes at least every `interval`.
    pub fn new(
        registry: Arc<SessionRegistry<B>>,
        store: Arc<dyn SnapshotStore>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            interval,
        }
    }

    /// Loads the snapshot into the registry. Returns how many sessions were
    /// restored.
    pub async fn restore(&self) -> Result<usize, PersistenceError> {
        let store = Arc::clone(&self.store);
        let records = tokio::task::spawn_blocking(move || store.load())
            .await
            .map_err(|e| PersistenceError::Task(e.to_string()))??;

        let restored = self.registry.restore(records);
        if restored > 0 {
            tracing::info!(count = restored, "Restored sessions");
        }
        Ok(restored)
    }

    /// Writes the current registry state. Returns how many records were
    /// written.
    pub async fn flush(&self) -> Result<usize, PersistenceError> {
        let records = self.registry.records().await;
        let count = records.len();
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.save(&records))
            .await
            .map_err(|e| PersistenceError::Task(e.to_string()))??;
        Ok(count)
    }

    /// Runs the flush loop until `token` is cancelled, then flushes once more.
    ///
    /// Flushes on every interval tick and whenever the registry reports a
    /// change. Failures are logged and retried on the next wake-up.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let dirty = self.registry.dirty_signal();
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = dirty.notified() => {}
                    _ = ticker.tick() => {}
                }

                if let Err(e) = self.flush().await {
                    tracing::warn!(error = %e, "Failed to save session snapshot");
                }
            }

            match self.flush().await {
                Ok(count) => tracing::debug!(count = count, "Final session snapshot written"),
                Err(e) => tracing::warn!(error = %e, "Failed to write final session snapshot"),
            }
        })
    }
}
