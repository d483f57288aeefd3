use tokio::io::Error as IoError;

use super::{EngineError, IndexError, MetainfoError};

pub type Result<T, E = SeedError> = std::result::Result<T, E>;

/// Errors while promoting a local blob file to a seeder.
#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("{0}")]
    Index(IndexError),

    #[error("{0}")]
    Metainfo(MetainfoError),

    #[error("{0}")]
    Engine(EngineError),

    #[error("{0}")]
    Io(IoError),
}

impl From<IndexError> for SeedError {
    fn from(value: IndexError) -> Self {
        Self::Index(value)
    }
}

impl From<MetainfoError> for SeedError {
    fn from(value: MetainfoError) -> Self {
        Self::Metainfo(value)
    }
}

impl From<EngineError> for SeedError {
    fn from(value: EngineError) -> Self {
        Self::Engine(value)
    }
}

impl From<IoError> for SeedError {
    fn from(value: IoError) -> Self {
        Self::Io(value)
    }
}
