use bulksync::errors::SyncError;
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogFetchError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("catalog returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),
}

impl CatalogFetchError {
    /// Timeouts, dropped connections, throttling and server errors.
    pub fn is_transient(&self) -> bool {
        match self {
            CatalogFetchError::Request(err) => err.is_timeout() || err.is_connect(),
            CatalogFetchError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

impl From<CatalogFetchError> for SyncError {
    fn from(err: CatalogFetchError) -> Self {
        match err {
            CatalogFetchError::Io(io) => SyncError::Io(io),
            CatalogFetchError::Json(json) => SyncError::Json(json),
            CatalogFetchError::InvalidParam(msg) => SyncError::InvalidArg(msg),
            other if other.is_transient() => SyncError::Transient(other.to_string()),
            other => SyncError::Remote(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CatalogFetchError>;
