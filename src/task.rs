//! Per-digest blob task state.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use crate::engine::TorrentHandle;
use crate::signal::Signal;

/// Delivery status of a blob task.
///
/// Transitions are monotonic along the state machine; the only sinks are
/// `Seeding` and `Error`. `Downloading` marks a fallback ingest in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobStatus {
    Initializing,
    DownloadingBt,
    Downloading,
    Seeding,
    Error,
}

impl fmt::Display for BlobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlobStatus::Initializing => "Initializing",
            BlobStatus::DownloadingBt => "DownloadingBt",
            BlobStatus::Downloading => "Downloading",
            BlobStatus::Seeding => "Seeding",
            BlobStatus::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Mutable task fields, serialized by the task mutex.
pub struct TaskState {
    /// Repository the blob belongs to; needed only to authenticate fallback
    /// pulls. May be filled in by a later request.
    pub repo_name: String,
    /// Torrent infohash; empty until hinted or resolved from the index.
    pub infohash: String,
    pub status: BlobStatus,
    /// Engine handle, set by the driver once the torrent has been added.
    pub torrent: Option<Arc<dyn TorrentHandle>>,
    /// A fallback consumer currently holds the ingest claim.
    pub ingesting: bool,
}

/// State and readiness signals for one digest.
///
/// The two signals are the task's delivery decision: for the lifetime of a
/// task at most one of them ever fires. `torrent_ready` commits every
/// consumer to the P2P path, `fallback` to the direct registry pull.
pub struct BlobTask {
    digest: String,
    state: Mutex<TaskState>,
    torrent_ready: Signal,
    fallback: Signal,
}

impl BlobTask {
    pub fn new(digest: &str, infohash: &str, repo_name: &str) -> Arc<Self> {
        Arc::new(Self {
            digest: digest.to_string(),
            state: Mutex::new(TaskState {
                repo_name: repo_name.to_string(),
                infohash: infohash.to_string(),
                status: BlobStatus::Initializing,
                torrent: None,
                ingesting: false,
            }),
            torrent_ready: Signal::new(),
            fallback: Signal::new(),
        })
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Fires when torrent metainfo is available and the task has committed
    /// to serving over P2P.
    pub fn torrent_ready(&self) -> &Signal {
        &self.torrent_ready
    }

    /// Fires when the task has decided P2P is not available and consumers
    /// must pull directly from the registry.
    pub fn fallback(&self) -> &Signal {
        &self.fallback
    }

    /// Locks the task state. Readers need the lock too: `{status, torrent,
    /// infohash, repo_name}` are only consistent under it.
    pub async fn lock(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().await
    }

    pub async fn status(&self) -> BlobStatus {
        self.lock().await.status
    }

    /// Merges hints into fields that are still empty.
    pub async fn fill_hints(&self, infohash: &str, repo_name: &str) {
        let mut state = self.lock().await;
        if state.repo_name.is_empty() && !repo_name.is_empty() {
            state.repo_name = repo_name.to_string();
        }
        if state.infohash.is_empty() && !infohash.is_empty() {
            state.infohash = infohash.to_string();
        }
    }
}
