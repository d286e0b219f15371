//! Store-level operations: opening, schema, the directory set, and
//! the row conversion helpers shared with [`super::DirHandle`].

use std::path::Path;

use chrono::DateTime;
use mailbox_imap::MessageInfo;
use mailbox_mime as mime;
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};

use super::{CacheError, CacheResult, DirHandle};

/// A per-account cache database.
pub struct CacheStore {
    pub(super) pool: SqlitePool,
}

impl CacheStore {
    /// Opens (creating if needed) the cache database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be created.
    pub async fn open(path: &Path) -> CacheResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Opens an in-memory cache for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema creation fails.
    pub async fn in_memory() -> CacheResult<Self> {
        // One connection only: each SQLite :memory: connection is its
        // own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Closes the pool, flushing WAL state.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init_schema(&self) -> CacheResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS dirinfo (
                dir TEXT PRIMARY KEY NOT NULL,
                uidvalidity INT DEFAULT NULL,
                unreadcount INT DEFAULT NULL,
                msglistvalid INT NOT NULL DEFAULT 0
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS meta (
                dir TEXT NOT NULL,
                uid INT NOT NULL,
                timestamp INT DEFAULT NULL,
                sender TEXT NOT NULL DEFAULT '',
                recipients TEXT NOT NULL DEFAULT '',
                cc TEXT NOT NULL DEFAULT '',
                bcc TEXT NOT NULL DEFAULT '',
                messageid TEXT NOT NULL DEFAULT '',
                replyto TEXT NOT NULL DEFAULT '',
                subject TEXT NOT NULL DEFAULT '',
                hdrs BLOB DEFAULT NULL,
                PRIMARY KEY (dir, uid),
                FOREIGN KEY (dir) REFERENCES dirinfo(dir)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS tags (
                dir TEXT NOT NULL,
                uid INT NOT NULL,
                tag TEXT NOT NULL,
                PRIMARY KEY (dir, uid, tag),
                FOREIGN KEY (dir, uid) REFERENCES meta(dir, uid)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS parts (
                dir TEXT NOT NULL,
                uid INT NOT NULL,
                indx INT NOT NULL,
                attachment INT NOT NULL DEFAULT 0,
                content_type TEXT NOT NULL DEFAULT 'text',
                content_subtype TEXT NOT NULL DEFAULT 'plain',
                content_type_params TEXT NOT NULL DEFAULT '',
                size INT NOT NULL,
                filename TEXT NOT NULL DEFAULT '',
                hdrs BLOB NOT NULL,
                body BLOB DEFAULT NULL,
                PRIMARY KEY (dir, uid, indx),
                FOREIGN KEY (dir, uid) REFERENCES meta(dir, uid)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Lists every directory known to the cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn dir_list(&self) -> CacheResult<Vec<String>> {
        let dirs = sqlx::query_scalar("SELECT dir FROM dirinfo ORDER BY dir")
            .fetch_all(&self.pool)
            .await?;
        Ok(dirs)
    }

    /// Adds a directory to the set. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn add_dir(&self, name: &str) -> CacheResult<()> {
        sqlx::query("INSERT OR IGNORE INTO dirinfo(dir) VALUES (?)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Removes a directory and every message, part and tag it held, in
    /// one transaction. Child directories are not touched.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails.
    pub async fn remove_dir(&self, name: &str) -> CacheResult<()> {
        let mut tx = self.pool.begin().await?;
        for sql in [
            "DELETE FROM parts WHERE dir = ?",
            "DELETE FROM tags WHERE dir = ?",
            "DELETE FROM meta WHERE dir = ?",
            "DELETE FROM dirinfo WHERE dir = ?",
        ] {
            sqlx::query(sql).bind(name).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Renames a directory across all four tables in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails.
    pub async fn rename_dir(&self, old: &str, new: &str) -> CacheResult<()> {
        let mut tx = self.pool.begin().await?;
        for sql in [
            "UPDATE dirinfo SET dir = ? WHERE dir = ?",
            "UPDATE meta SET dir = ? WHERE dir = ?",
            "UPDATE tags SET dir = ? WHERE dir = ?",
            "UPDATE parts SET dir = ? WHERE dir = ?",
        ] {
            sqlx::query(sql).bind(new).bind(old).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Returns the handle for per-directory operations.
    #[must_use]
    pub fn dir(&self, name: &str) -> DirHandle<'_> {
        DirHandle::new(self, name)
    }
}

// === Row conversion helpers ===

/// Builds the envelope half of a [`MessageInfo`] from a `meta` row.
/// Tags and part metadata are filled in by the caller.
pub(super) fn info_from_meta_row(row: &SqliteRow) -> CacheResult<MessageInfo> {
    let timestamp: Option<i64> = row.get("timestamp");
    let sender: String = row.get("sender");
    let recipients: String = row.get("recipients");
    let cc: String = row.get("cc");
    let bcc: String = row.get("bcc");
    let replyto: String = row.get("replyto");
    let hdrs: Option<Vec<u8>> = row.get("hdrs");

    let msg = mime::Msg {
        date: timestamp.and_then(|t| DateTime::from_timestamp(t, 0)),
        subject: row.get("subject"),
        from: mime::parse_address(&sender).unwrap_or_default(),
        reply_to: mime::parse_address(&replyto).unwrap_or_default(),
        to: mime::parse_address_list(&recipients),
        cc: mime::parse_address_list(&cc),
        bcc: mime::parse_address_list(&bcc),
        message_id: row.get("messageid"),
        misc: match hdrs {
            Some(blob) => mime::Header::from_blob(&blob)?,
            None => mime::Header::new(),
        },
        parts: Vec::new(),
    };

    Ok(MessageInfo {
        uid: row.get::<u32, _>("uid"),
        msg,
        ..MessageInfo::default()
    })
}

/// Builds a metadata-only [`mime::Part`] from a `parts` row (the
/// `body` column is not read here).
pub(super) fn part_from_row(row: &SqliteRow) -> CacheResult<mime::Part> {
    let content_type: String = row.get("content_type");
    let content_subtype: String = row.get("content_subtype");
    let params: String = row.get("content_type_params");
    let hdrs: Vec<u8> = row.get("hdrs");

    let value = if content_subtype.is_empty() {
        content_type
    } else {
        format!("{content_type}/{content_subtype}")
    };
    let ptype = mime::ParamHeader::with_params(value, params_from_string(&params));

    let mut misc = mime::Header::from_blob(&hdrs)?;
    let disposition = misc
        .get("Content-Disposition")
        .map(mime::ParamHeader::parse)
        .unwrap_or_default();
    misc.del("Content-Disposition");

    Ok(mime::Part {
        ptype,
        disposition,
        size: row.get::<u32, _>("size"),
        misc,
        body: None,
    })
}

/// Serializes a part's open-ended headers, carrying the disposition
/// inside the blob so it round-trips exactly.
pub(super) fn part_hdrs_blob(part: &mime::Part) -> Vec<u8> {
    let mut hdrs = part.misc.clone();
    if !part.disposition.is_empty() {
        hdrs.set("Content-Disposition", &part.disposition.to_string());
    }
    hdrs.to_blob()
}

pub(super) fn params_to_string(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("; ")
}

pub(super) fn params_from_string(s: &str) -> Vec<(String, String)> {
    s.split(';')
        .filter_map(|p| {
            let (k, v) = p.split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Maps a storage error, translating row-not-found to the semantic
/// miss.
pub(super) fn not_cached(e: sqlx::Error) -> CacheError {
    match e {
        sqlx::Error::RowNotFound => CacheError::NotCached,
        other => CacheError::Storage(other),
    }
}
