//! IMAP connection management: configuration, the TLS transport and
//! framed I/O with a suspendable per-I/O deadline.

mod config;
mod framed;

pub use config::{Security, ServerConfig};
pub use framed::{FramedStream, ImapStream, tls_handshake};
