use thiserror::Error;

/// Failure of a backing-store request.
///
/// The cache never propagates these to consumers: a failed request is logged
/// and treated as finished without data.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to (de)serialize contact: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store worker has shut down")]
    Closed,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
