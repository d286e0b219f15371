//! # mailbox-mime
//!
//! RFC 822 / MIME message handling for the mailbox client core.
//!
//! This crate owns the message model shared by the IMAP session, the
//! cache store and the SMTP sender:
//!
//! - [`Msg`] / [`Part`]: a parsed message with well-known headers split
//!   into fields and everything else kept as an ordered [`Header`] blob
//! - [`read_msg`]: parse a raw RFC 822 message, splitting multipart
//!   bodies and decoding transfer encodings
//! - [`Msg::write`]: serialize a message for APPEND or SMTP DATA,
//!   choosing a transfer encoding per part
//! - [`Address`] marshalling to and from `Name <addr>` form
//! - [`Header`] blobs: the byte format the cache uses for the
//!   open-ended header set

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod address;
pub mod encoding;
mod error;
mod header;
mod message;
mod read;
mod write;

pub use address::{
    Address, format_address, format_address_list, parse_address, parse_address_list,
};
pub use error::{Error, Result};
pub use header::Header;
pub use message::{Msg, ParamHeader, Part};
pub use read::read_msg;
pub use write::pick_encoding;
