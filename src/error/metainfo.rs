use tokio::io::Error as IoError;

pub type Result<T, E = MetainfoError> = std::result::Result<T, E>;

/// Errors while building torrent metainfo from a local file.
#[derive(Debug, thiserror::Error)]
pub enum MetainfoError {
    #[error("{0}")]
    Io(IoError),

    #[error("{0}")]
    Bencode(serde_bencode::Error),
}

impl From<IoError> for MetainfoError {
    fn from(value: IoError) -> Self {
        Self::Io(value)
    }
}

impl From<serde_bencode::Error> for MetainfoError {
    fn from(value: serde_bencode::Error) -> Self {
        Self::Bencode(value)
    }
}
