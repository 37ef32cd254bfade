//! Error types for the Tally engine.

use thiserror::Error;

/// All possible errors from the Tally engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("missing required field: {0}")]
    MissingRequiredField(&'static str),

    #[error("payment amount must be positive, got {0}")]
    NonPositiveAmount(String),

    #[error("invalid email address: {0}")]
    InvalidEmail(String),

    #[error("unknown month: {0}")]
    UnknownMonth(String),

    // Identifier errors
    #[error("invalid record id: {0:?}")]
    InvalidRecordId(String),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    // State errors
    #[error("invalid queue state: {0}")]
    InvalidQueue(String),
}

impl Error {
    /// Whether this error was caused by malformed caller input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::MissingRequiredField(_)
                | Error::NonPositiveAmount(_)
                | Error::InvalidEmail(_)
                | Error::UnknownMonth(_)
                | Error::InvalidRecordId(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
