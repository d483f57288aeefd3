//! The blob task manager is the top-level coordinator of the agent. It keeps
//! exactly one [`BlobTask`] per digest and runs one background driver per
//! task. The driver's single job is to resolve, as early as possible, which
//! delivery channel will serve the digest, and to announce that decision
//! through the task's one-shot signals; request handlers wait on the
//! decision without caring about the mechanics in between.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use reqwest::Client;

use crate::engine::TorrentEngine;
use crate::index::IndexClient;
use crate::metainfo;
use crate::task::{BlobStatus, BlobTask};

pub struct BlobTaskManager {
    /// One task per digest, created on first reference, never evicted.
    tasks: Mutex<HashMap<String, Arc<BlobTask>>>,
    engine: Arc<dyn TorrentEngine>,
    index: IndexClient,
    /// Shared upstream HTTP client (fallback pulls, token dance, proxy).
    http: Client,
    data_dir: PathBuf,
    registry_base: String,
    tracker_url: String,
}

impl BlobTaskManager {
    pub fn new(
        engine: Arc<dyn TorrentEngine>,
        index: IndexClient,
        data_dir: impl Into<PathBuf>,
        registry_base: impl Into<String>,
        tracker_url: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(HashMap::new()),
            engine,
            index,
            http: Client::new(),
            data_dir: data_dir.into(),
            registry_base: registry_base.into(),
            tracker_url: tracker_url.into(),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Final on-disk location of an ingested blob.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        self.data_dir.join(digest)
    }

    pub fn registry_base(&self) -> &str {
        &self.registry_base
    }

    pub fn tracker_url(&self) -> &str {
        &self.tracker_url
    }

    pub fn engine(&self) -> &Arc<dyn TorrentEngine> {
        &self.engine
    }

    pub fn index(&self) -> &IndexClient {
        &self.index
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    /// Returns the task for `digest` if one exists.
    pub fn task(&self, digest: &str) -> Option<Arc<BlobTask>> {
        self.tasks.lock().unwrap().get(digest).cloned()
    }

    /// Returns the task for `digest`, creating it and launching its
    /// background driver on first reference.
    ///
    /// Idempotent: a second caller gets the same task, with the hints merged
    /// into fields that are still empty. No network I/O happens on this
    /// path, and the manager mutex is held only for the map access.
    pub async fn ensure_task(
        self: &Arc<Self>,
        digest: &str,
        infohash: &str,
        repo_name: &str,
    ) -> Arc<BlobTask> {
        let (task, created) = {
            let mut tasks = self.tasks.lock().unwrap();
            match tasks.get(digest) {
                Some(task) => (task.clone(), false),
                None => {
                    let task = BlobTask::new(digest, infohash, repo_name);
                    tasks.insert(digest.to_string(), task.clone());
                    (task, true)
                }
            }
        };

        if created {
            log::info!("created task for digest {digest}");
            let manager = self.clone();
            let driven = task.clone();
            tokio::spawn(async move { manager.run_task(driven).await });
        } else {
            log::debug!("task for digest {digest} already exists, merging hints");
            task.fill_hints(infohash, repo_name).await;
        }
        task
    }

    /// Background driver for one task. Runs to completion exactly once; the
    /// task then stays dormant but observable.
    ///
    /// The task mutex is never held across the index lookup, the engine add,
    /// or the metainfo/completion waits.
    async fn run_task(self: Arc<Self>, task: Arc<BlobTask>) {
        let digest = task.digest().to_string();

        // infohash acquisition: use the hint when present, else ask the index
        let hinted = { task.lock().await.infohash.clone() };
        let infohash = if hinted.is_empty() {
            match self.index.get_infohash(&digest).await {
                Err(e) => {
                    log::error!("error getting infohash for digest {digest}: {e}");
                    let mut state = task.lock().await;
                    state.status = BlobStatus::Error;
                    task.fallback().fire();
                    return;
                }
                Ok(None) => {
                    log::info!("no infohash found for digest {digest}, using direct download");
                    task.fallback().fire();
                    return;
                }
                Ok(Some(found)) => {
                    task.lock().await.infohash = found.clone();
                    found
                }
            }
        } else {
            hinted
        };

        let magnet = metainfo::magnet_link(&infohash, &digest, &self.tracker_url);
        let torrent = match self.engine.add_magnet(&magnet).await {
            Ok(torrent) => torrent,
            Err(e) => {
                log::error!("error adding magnet for digest {digest}: {e}");
                let mut state = task.lock().await;
                state.status = BlobStatus::Error;
                task.fallback().fire();
                return;
            }
        };
        {
            task.lock().await.torrent = Some(torrent.clone());
        }

        // metainfo wait, racing engine shutdown
        let closed = self.engine.closed();
        tokio::select! {
            res = torrent.ready() => {
                if let Err(e) = res {
                    log::error!("torrent for digest {digest} failed to initialize: {e}");
                    let mut state = task.lock().await;
                    state.status = BlobStatus::Error;
                    task.fallback().fire();
                    return;
                }
                log::info!("torrent for digest {digest} is ready");
            }
            _ = closed.cancelled() => {
                log::warn!("torrent client closed while waiting for digest {digest}");
                task.fallback().fire();
                return;
            }
        }

        // commit to the P2P path; fallback must never fire past this point
        {
            let mut state = task.lock().await;
            state.status = BlobStatus::DownloadingBt;
            task.torrent_ready().fire();
        }

        if torrent.is_complete() {
            log::info!("torrent for digest {digest} is already complete, seeding");
            task.lock().await.status = BlobStatus::Seeding;
            return;
        }

        tokio::select! {
            res = torrent.wait_complete() => {
                match res {
                    Ok(()) => {
                        log::info!("torrent for digest {digest} has completed downloading");
                        task.lock().await.status = BlobStatus::Seeding;
                    }
                    Err(e) => {
                        log::error!("torrent for digest {digest} failed while downloading: {e}");
                        task.lock().await.status = BlobStatus::Error;
                    }
                }
            }
            _ = closed.cancelled() => {
                log::warn!("torrent client closed while downloading digest {digest}");
                task.lock().await.status = BlobStatus::Error;
            }
        }
    }
}
