//! Error types for strata.

use thiserror::Error;

/// Result type alias using strata's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for strata operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    /// Import not found
    #[error("Import not found: {0}")]
    ImportNotFound(uuid::Uuid),

    /// Malformed input; the offending work is never queued
    #[error("Validation error: {0}")]
    Validation(String),

    /// Another invocation already owns the job. Expected under
    /// concurrent triggers; callers skip the job silently.
    #[error("Claim conflict: {0}")]
    ClaimConflict(String),

    /// A pipeline step failed; the job stays resumable at its last
    /// completed step.
    #[error("Step processing error: {0}")]
    StepProcessing(String),

    /// Embedding/tagging provider failure. Handled like a step error,
    /// distinguished only by message.
    #[error("External service error: {0}")]
    ExternalService(String),

    /// A job's lock lease expired and was reclaimed by the sweep.
    #[error("Stale lock: {0}")]
    StaleLock(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication/authorization failed
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for the error classes a manual retry is expected to clear:
    /// step failures, provider outages, and reclaimed stale locks.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StepProcessing(_) | Error::ExternalService(_) | Error::StaleLock(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::ExternalService(e.to_string())
    }
}
