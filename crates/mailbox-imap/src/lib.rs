//! # mailbox-imap
//!
//! A single-connection IMAP4rev1 (RFC 3501) client for the mailbox
//! core, with the extensions the core consumes when advertised:
//! IDLE (RFC 2177), MOVE (RFC 6851) and UIDPLUS (RFC 4315).
//!
//! The crate is layered the same way its protocol sibling crates are:
//!
//! - [`connection`]: TLS / STARTTLS stream setup and framed I/O with a
//!   suspendable per-I/O timeout
//! - [`parser`]: sans-I/O response parsing (envelope, body structure,
//!   fetch items, response codes)
//! - [`ImapConnection`]: the raw protocol client — one command at a
//!   time over one framed stream
//! - [`Session`]: the serialized wrapper the account controller talks
//!   to — exclusive locking, a background IDLE loop on INBOX, an
//!   update dispatcher translating untagged traffic into
//!   [`SessionEvent`]s, and transparent reconnection
//!
//! ## Update flow
//!
//! Untagged `EXISTS` / `EXPUNGE` / `FETCH` responses observed on the
//! connection are fed through an [`updates::UpdateTracker`] that keeps
//! the last known size per mailbox and fires one `NewMessage` per new
//! sequence number. Consumers receive plain data events over a
//! channel; no callback ever closes over the caller.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod client;
pub mod connection;
mod error;
pub mod parser;
mod session;
pub mod types;
pub mod updates;

pub use client::{ImapConnection, SelectedState};
pub use connection::{FramedStream, ImapStream, Security, ServerConfig};
pub use error::{Error, Result};
pub use parser::{Address as EnvelopeAddress, BodyStructure, Envelope, FetchItem, Response};
pub use session::{EventStream, Session};
pub use types::{
    DirStatus, MessageInfo, SearchQuery, any_of, html_only, plain_text_only, text_only,
};
pub use updates::{RawEvent, SessionEvent, UpdateTracker};
