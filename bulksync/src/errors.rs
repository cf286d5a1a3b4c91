use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("SQLite operation failed: {0}")]
    SQLite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid file schema, missing required column(s): {}", missing.join(", "))]
    Schema { missing: Vec<String> },

    #[error("Unsupported field '{field}' for type '{type_name}'")]
    UnsupportedField { type_name: String, field: String },

    #[error("Invalid value for field '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Unable to resolve {kind} with identity '{identity}'")]
    IdentityNotFound { kind: String, identity: String },

    #[error("Ancestor missing while deriving identity of {type_name} (partial path '{partial_path}')")]
    AncestorMissing {
        type_name: String,
        partial_path: String,
    },

    #[error("Catalog request failed: {0}")]
    Remote(String),

    #[error("Transient catalog failure: {0}")]
    Transient(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// Whether a failed lookup is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_) | SyncError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
