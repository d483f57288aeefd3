//! The torrent engine seam.
//!
//! The agent does not speak the BitTorrent wire protocol itself. It drives an
//! external engine through the [`TorrentEngine`] trait: hand over a magnet,
//! observe readiness and completion, read the file back sequentially. The
//! production implementation wraps a [`librqbit`] session; tests substitute a
//! scriptable fake.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use librqbit::{AddTorrent, AddTorrentOptions, ManagedTorrent, Session};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::error::engine::Result;
use crate::error::EngineError;

/// Sequential reader over a torrent's single file. Reads suspend while the
/// engine is still fetching the underlying pieces.
pub type TorrentReader = Box<dyn AsyncRead + Send + Unpin>;

/// The long-lived torrent engine handle, shared by the manager, the
/// bootstrapper and the promote path.
#[async_trait]
pub trait TorrentEngine: Send + Sync + 'static {
    /// Hands a magnet link to the engine. Adding is idempotent per infohash.
    /// The engine begins downloading all pieces as soon as the torrent's
    /// metainfo resolves; with the payload already on disk it verifies and
    /// seeds instead.
    async fn add_magnet(&self, magnet: &str) -> Result<Arc<dyn TorrentHandle>>;

    /// A latch that fires when the engine shuts down. Drivers race their
    /// waits against it.
    fn closed(&self) -> CancellationToken;

    /// Stops the engine and fires [`TorrentEngine::closed`].
    async fn shutdown(&self);
}

/// One torrent managed by the engine.
#[async_trait]
pub trait TorrentHandle: Send + Sync + 'static {
    /// Resolves once the torrent's metainfo is known and piece transfer can
    /// begin.
    async fn ready(&self) -> Result<()>;

    /// Whether the engine holds a complete, verified copy.
    fn is_complete(&self) -> bool;

    /// Resolves once the engine holds a complete, verified copy.
    async fn wait_complete(&self) -> Result<()>;

    /// Total content length in bytes. Zero until metainfo is known.
    fn content_length(&self) -> u64;

    /// Display name of the torrent (the blob digest, for torrents announced
    /// by this fleet).
    fn display_name(&self) -> String;

    /// Opens a sequential reader over the torrent's single file.
    async fn reader(&self) -> Result<TorrentReader>;
}

/// [`TorrentEngine`] backed by a librqbit session.
pub struct RqbitEngine {
    session: Arc<Session>,
    closed: CancellationToken,
}

impl RqbitEngine {
    /// Starts a session over `data_dir`. Failure here is fatal to the agent.
    pub async fn new(data_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let session = Session::new(data_dir.into()).await?;
        Ok(Self {
            session,
            closed: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl TorrentEngine for RqbitEngine {
    async fn add_magnet(&self, magnet: &str) -> Result<Arc<dyn TorrentHandle>> {
        let opts = AddTorrentOptions {
            overwrite: true,
            ..Default::default()
        };
        let response = self
            .session
            .add_torrent(AddTorrent::from_url(magnet), Some(opts))
            .await
            .map_err(EngineError::AddMagnet)?;
        let handle = response.into_handle().ok_or_else(|| {
            EngineError::AddMagnet(anyhow::anyhow!("torrent added without a handle"))
        })?;
        Ok(Arc::new(RqbitTorrent { handle }))
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn shutdown(&self) {
        self.session.stop().await;
        self.closed.cancel();
    }
}

struct RqbitTorrent {
    handle: Arc<ManagedTorrent>,
}

#[async_trait]
impl TorrentHandle for RqbitTorrent {
    async fn ready(&self) -> Result<()> {
        self.handle
            .wait_until_initialized()
            .await
            .map_err(EngineError::Metainfo)
    }

    fn is_complete(&self) -> bool {
        self.handle.stats().finished
    }

    async fn wait_complete(&self) -> Result<()> {
        self.handle
            .wait_until_completed()
            .await
            .map_err(EngineError::Download)
    }

    fn content_length(&self) -> u64 {
        self.handle.stats().total_bytes
    }

    fn display_name(&self) -> String {
        self.handle
            .name()
            .unwrap_or_else(|| self.handle.info_hash().as_string())
    }

    async fn reader(&self) -> Result<TorrentReader> {
        let stream = self.handle.clone().stream(0).map_err(EngineError::Stream)?;
        Ok(Box::new(stream))
    }
}
