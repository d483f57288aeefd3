use reqwest::Error as HttpError;
use reqwest::StatusCode;

pub type Result<T, E = IndexError> = std::result::Result<T, E>;

/// Errors from the digest -> infohash index service.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("{0}")]
    Http(HttpError),

    #[error("index returned status {0}")]
    Status(StatusCode),
}

impl From<HttpError> for IndexError {
    fn from(value: HttpError) -> Self {
        Self::Http(value)
    }
}
