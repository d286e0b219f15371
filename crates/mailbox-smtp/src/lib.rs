//! # mailbox-smtp
//!
//! The outgoing half of the mailbox core: a minimal SMTP submission
//! client (RFC 5321) with implicit TLS or STARTTLS, SASL PLAIN or
//! ANONYMOUS authentication, and dot-stuffed DATA transmission of
//! [`mailbox_mime::Msg`] messages.
//!
//! The flow mirrors how the account controller uses it: `connect` →
//! `auth` → `send` → `quit`, one message per connection.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod client;
mod error;
mod reply;

pub use client::{SmtpClient, SmtpConfig, SmtpSecurity};
pub use error::{Error, Result};
pub use reply::Reply;
