//! Error type for the sync runtime.

use crate::remote::RemoteError;

/// Errors raised while queueing, persisting or replaying operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] tally_engine::Error),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether the caller sent input that can never succeed.
    pub fn is_validation(&self) -> bool {
        matches!(self, SyncError::Engine(e) if e.is_validation())
    }

    /// Whether retrying later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_retryable(),
            SyncError::Storage(_) => true,
            SyncError::Engine(_) | SyncError::Serialization(_) => false,
        }
    }
}

/// Result type alias for the sync runtime.
pub type Result<T> = std::result::Result<T, SyncError>;
