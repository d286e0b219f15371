//! Error types for the core crate.

use thiserror::Error;

use crate::cache::CacheError;
use crate::crypto::CryptoError;

/// Errors surfaced by core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// IMAP operation failed (after any retries).
    #[error("IMAP error: {0}")]
    Imap(#[from] mailbox_imap::Error),

    /// SMTP send failed.
    #[error("SMTP error: {0}")]
    Smtp(#[from] mailbox_smtp::Error),

    /// Message parsing or serialization failed.
    #[error("Message error: {0}")]
    Mime(#[from] mailbox_mime::Error),

    /// Cache storage failed.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Filesystem I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be read or written.
    #[error("Configuration error: {0}")]
    Config(#[from] serde_yaml::Error),

    /// Master-key derivation or blob decryption failed.
    #[error("Encryption error: {0}")]
    Crypto(#[from] CryptoError),

    /// A deterministic input validation failure.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The account id is not loaded.
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// The frontend declined a required password prompt.
    #[error("Password prompt rejected")]
    PasswordPromptRejected,
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
