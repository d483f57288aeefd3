//! Startup ingestion of pre-existing local blobs into the swarm.
//!
//! The bootstrapper makes every blob the node already holds a first-class
//! seeder: link it into the torrent data dir, make sure the index knows its
//! infohash (computing and registering it when the digest was never announced
//! cluster-wide), then register a task so the driver brings the torrent up in
//! seeding mode.

use std::path::Path;
use std::sync::Arc;

use crate::error::seed::Result;
use crate::error::SeedError;
use crate::manager::BlobTaskManager;
use crate::metainfo::{self, PIECE_LENGTH};

/// Suffix of in-flight fallback downloads inside the data dir.
pub(crate) const TMP_SUFFIX: &str = ".tmp_download";

/// Links every blob in `blob_dir` into the torrent data dir and registers a
/// task for each regular file found there.
pub async fn init_seed(manager: &Arc<BlobTaskManager>, blob_dir: &Path, algo: &str) {
    link_blobs(manager, blob_dir, algo);

    let entries = match std::fs::read_dir(manager.data_dir()) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!(
                "unable to read bt work dir {}: {e}",
                manager.data_dir().display()
            );
            return;
        }
    };
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let digest = entry.file_name().to_string_lossy().into_owned();
        if digest.ends_with(TMP_SUFFIX) {
            // leftover of an interrupted fallback ingest, not a blob
            continue;
        }
        if let Err(e) = seed_existing(manager, &digest, &entry.path()).await {
            log::warn!("unable to seed file {digest}: {e}");
        }
    }
}

/// Hard-links `blob_dir/<name>` to `<data_dir>/<algo>:<name>` for every
/// regular file. Links that already exist are left alone.
fn link_blobs(manager: &Arc<BlobTaskManager>, blob_dir: &Path, algo: &str) {
    let entries = match std::fs::read_dir(blob_dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("unable to read init seeding dir {}: {e}", blob_dir.display());
            return;
        }
    };
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let digest = format!("{algo}:{name}");
        match std::fs::hard_link(entry.path(), manager.blob_path(&digest)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => log::warn!("unable to create hard link for {digest}: {e}"),
        }
    }
}

/// Makes sure `digest` has a registered infohash, then spins up its task so
/// the driver starts the torrent from the already-present file.
async fn seed_existing(manager: &Arc<BlobTaskManager>, digest: &str, path: &Path) -> Result<()> {
    let infohash = registered_infohash(manager, digest, path).await?;
    manager.ensure_task(digest, &infohash, "").await;
    Ok(())
}

/// Looks up the digest's infohash, computing and registering it when the
/// index has no mapping yet.
async fn registered_infohash(
    manager: &Arc<BlobTaskManager>,
    digest: &str,
    path: &Path,
) -> Result<String> {
    if let Some(infohash) = manager.index().get_infohash(digest).await? {
        return Ok(infohash);
    }

    log::info!("no infohash found for digest {digest}, calculating it now");
    let file = path.to_path_buf();
    let name = digest.to_string();
    let infohash = tokio::task::spawn_blocking(move || {
        metainfo::infohash_from_file(&file, &name, PIECE_LENGTH)
    })
    .await
    .map_err(|e| SeedError::Io(std::io::Error::other(e)))??;

    manager.index().modify(digest, &infohash).await?;
    log::info!("registered infohash {infohash} for digest {digest}");
    Ok(infohash)
}

/// Promotes a freshly ingested blob file to a seeder: ensures the index
/// mapping, hands the magnet to the engine and waits for the metainfo so
/// seeding starts from the on-disk payload.
///
/// Called from the fallback promote path while the task mutex is held; this
/// is the single sanctioned place where network I/O happens under it.
pub(crate) async fn seed_from_file(
    manager: &Arc<BlobTaskManager>,
    digest: &str,
    path: &Path,
) -> Result<()> {
    let infohash = registered_infohash(manager, digest, path).await?;
    let magnet = metainfo::magnet_link(&infohash, digest, manager.tracker_url());
    let torrent = manager.engine().add_magnet(&magnet).await?;
    torrent.ready().await?;
    log::info!("seeding digest {digest} with infohash {infohash}");
    Ok(())
}
