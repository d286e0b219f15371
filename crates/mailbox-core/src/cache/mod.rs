//! The per-account transactional message cache.
//!
//! SQLite-backed, one database file per account. The schema is keyed
//! by `(dir, uid)`:
//!
//! - `dirinfo` — per-directory validity markers: UIDVALIDITY, unread
//!   count, and the `msglistvalid` completeness flag
//! - `meta` — one row per message: envelope fields plus the
//!   remaining-headers blob
//! - `tags` — one row per `(dir, uid, tag)`
//! - `parts` — one row per `(dir, uid, indx)` MIME part, body
//!   nullable (attachment bodies are never cached; text-part bodies
//!   are cached on demand)
//!
//! All multi-row mutations run in one transaction; a reader never
//! observes a message whose tag or part rows are partially written.

mod dir;
mod store;

pub use dir::DirHandle;
pub use store::CacheStore;

use thiserror::Error;

/// Errors from cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Semantic miss: the row is absent or the directory's message
    /// list is not marked complete. Never surfaced to the frontend;
    /// always answered with a server fetch.
    #[error("not cached")]
    NotCached,

    /// The storage engine failed.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A header blob in the database is malformed.
    #[error("encoding error: {0}")]
    Encoding(#[from] mailbox_mime::Error),
}

/// Result type alias for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;
