//! Error types for the MIME library.

use thiserror::Error;

/// Errors that can occur while parsing or serializing messages.
#[derive(Debug, Error)]
pub enum Error {
    /// Message is structurally malformed (no header/body split, bad
    /// multipart framing, truncated input).
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// A header line could not be parsed.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// A transfer encoding could not be decoded.
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Self::InvalidEncoding(e.to_string())
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
