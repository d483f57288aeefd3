pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Errors surfaced through the torrent engine seam.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to add magnet: {0}")]
    /// The engine rejected the magnet link.
    AddMagnet(anyhow::Error),

    #[error("torrent metainfo unavailable: {0}")]
    /// The torrent failed before its metainfo became available.
    Metainfo(anyhow::Error),

    #[error("torrent download failed: {0}")]
    /// The torrent failed while downloading pieces.
    Download(anyhow::Error),

    #[error("torrent stream unavailable: {0}")]
    /// A sequential reader over the torrent file could not be opened.
    Stream(anyhow::Error),
}
