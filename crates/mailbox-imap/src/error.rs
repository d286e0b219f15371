//! Error types for the IMAP library.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during IMAP operations.
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

    /// Response parsing error.
    #[error("Parse error at position {position}: {message}")]
    Parse {
        /// Byte position where the error occurred.
        position: usize,
        /// Description of what went wrong.
        message: String,
    },

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Server returned NO for a command.
    #[error("Server returned NO: {0}")]
    No(String),

    /// Server returned BAD for a command.
    #[error("Server returned BAD: {0}")]
    Bad(String),

    /// Server sent BYE and is closing the connection.
    #[error("Server sent BYE: {0}")]
    Bye(String),

    /// The connection is gone.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// An I/O operation exceeded its deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Protocol violation or unsupported server behavior.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The session is in the wrong state for the operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A fetched part or header could not be decoded.
    #[error("Message decoding failed: {0}")]
    Mime(#[from] mailbox_mime::Error),
}

impl Error {
    /// Returns true if this error means the transport is dead and the
    /// command may be retried after a reconnect.
    ///
    /// The predicate is deliberately conservative: protocol-level
    /// refusals (`No`, `Bad`, parse errors) never qualify.
    #[must_use]
    pub const fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionLost(_) | Self::Bye(_) | Self::Timeout(_)
        )
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_lost_predicate() {
        assert!(Error::ConnectionLost("eof".into()).is_connection_lost());
        assert!(Error::Bye("bye".into()).is_connection_lost());
        assert!(
            Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "x"))
                .is_connection_lost()
        );
        assert!(Error::Timeout(Duration::from_secs(30)).is_connection_lost());

        assert!(!Error::No("denied".into()).is_connection_lost());
        assert!(!Error::Bad("syntax".into()).is_connection_lost());
        assert!(
            !Error::Parse {
                position: 0,
                message: "x".into()
            }
            .is_connection_lost()
        );
    }
}
