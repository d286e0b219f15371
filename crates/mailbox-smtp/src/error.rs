//! Error types for the SMTP library.

use thiserror::Error;

/// Errors that can occur during SMTP operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS handshake or encryption error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// Server replied with an error code.
    #[error("Server returned {code}: {message}")]
    Server {
        /// The three-digit reply code.
        code: u16,
        /// The reply text.
        message: String,
    },

    /// Reply line could not be parsed.
    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    /// The server lacks a required extension.
    #[error("Not supported by server: {0}")]
    NotSupported(String),

    /// No usable authentication mechanism.
    #[error("Authentication not possible: {0}")]
    Auth(String),

    /// The connect deadline elapsed.
    #[error("Connection timed out")]
    Timeout,

    /// Message serialization failed.
    #[error("Message error: {0}")]
    Mime(#[from] mailbox_mime::Error),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
