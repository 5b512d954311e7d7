//! Error types for the dispatch engine.

use thiserror::Error;

use crate::account::AccountId;
use crate::envelope::EnvelopeId;

/// Result type alias using the broadside error type.
pub type Result<T> = std::result::Result<T, BroadsideError>;

/// Main error type for the dispatch engine.
#[derive(Error, Debug)]
pub enum BroadsideError {
    /// Planning-time configuration problem (empty account selection, bad
    /// emails-per-account). Fails fast; nothing is partially enqueued.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Envelope not found
    #[error("Envelope not found: {0}")]
    EnvelopeNotFound(EnvelopeId),

    /// Sending account not found
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
