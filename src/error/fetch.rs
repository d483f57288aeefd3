use reqwest::Error as HttpError;
use reqwest::StatusCode;
use tokio::io::Error as IoError;

pub type Result<T, E = FetchError> = std::result::Result<T, E>;

/// Errors on the fallback pull path.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("repository name unknown, cannot authenticate")]
    /// The task has no repository name to build a pull scope from.
    MissingRepo,

    #[error("registry probe returned status {0}")]
    /// The `/v2/` probe or the token endpoint answered with an unusable status.
    Probe(StatusCode),

    #[error("registry did not offer a bearer challenge")]
    /// A 401 probe response carried no parseable `WWW-Authenticate` header.
    MissingChallenge,

    #[error("blob fetch returned status {0}")]
    /// The upstream blob endpoint answered with a non-200 status.
    BlobStatus(StatusCode),

    #[error("upstream announced {expected} bytes but the body carried {actual}")]
    /// The teed byte count disagrees with the upstream `Content-Length`.
    LengthMismatch { expected: u64, actual: u64 },

    #[error("{0}")]
    Http(HttpError),

    #[error("{0}")]
    Io(IoError),
}

impl From<HttpError> for FetchError {
    fn from(value: HttpError) -> Self {
        Self::Http(value)
    }
}

impl From<IoError> for FetchError {
    fn from(value: IoError) -> Self {
        Self::Io(value)
    }
}
