//! Per-directory cache operations.

use std::collections::HashSet;

use mailbox_imap::MessageInfo;
use mailbox_mime as mime;
use sqlx::Row;

use super::store::{
    info_from_meta_row, not_cached, params_to_string, part_from_row, part_hdrs_blob,
};
use super::{CacheError, CacheResult, CacheStore};

/// Handle for one directory's rows. Cheap to create; holds no state
/// beyond the name.
pub struct DirHandle<'a> {
    store: &'a CacheStore,
    dir: String,
}

impl<'a> DirHandle<'a> {
    pub(super) fn new(store: &'a CacheStore, dir: &str) -> Self {
        Self {
            store,
            dir: dir.to_string(),
        }
    }

    /// The cached UIDVALIDITY, `None` when unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn uid_validity(&self) -> CacheResult<Option<u32>> {
        let row = sqlx::query("SELECT uidvalidity FROM dirinfo WHERE dir = ?")
            .bind(&self.dir)
            .fetch_optional(&self.store.pool)
            .await?;
        Ok(row
            .and_then(|r| r.get::<Option<i64>, _>("uidvalidity"))
            .and_then(|v| u32::try_from(v).ok()))
    }

    /// Records the server's UIDVALIDITY.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_uid_validity(&self, value: u32) -> CacheResult<()> {
        self.ensure_row().await?;
        sqlx::query("UPDATE dirinfo SET uidvalidity = ? WHERE dir = ?")
            .bind(value)
            .bind(&self.dir)
            .execute(&self.store.pool)
            .await?;
        Ok(())
    }

    /// The cached unread count, `None` when unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn unread_count(&self) -> CacheResult<Option<u32>> {
        let row = sqlx::query("SELECT unreadcount FROM dirinfo WHERE dir = ?")
            .bind(&self.dir)
            .fetch_optional(&self.store.pool)
            .await?;
        Ok(row
            .and_then(|r| r.get::<Option<i64>, _>("unreadcount"))
            .and_then(|v| u32::try_from(v).ok()))
    }

    /// Records the unread count.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn set_unread_count(&self, value: u32) -> CacheResult<()> {
        self.ensure_row().await?;
        sqlx::query("UPDATE dirinfo SET unreadcount = ? WHERE dir = ?")
            .bind(value)
            .bind(&self.dir)
            .execute(&self.store.pool)
            .await?;
        Ok(())
    }

    /// Number of cached messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn msgs_count(&self) -> CacheResult<u32> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM meta WHERE dir = ?")
            .bind(&self.dir)
            .fetch_one(&self.store.pool)
            .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Marks the message list as a complete, current snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn mark_as_valid(&self) -> CacheResult<()> {
        self.ensure_row().await?;
        sqlx::query("UPDATE dirinfo SET msglistvalid = 1 WHERE dir = ?")
            .bind(&self.dir)
            .execute(&self.store.pool)
            .await?;
        Ok(())
    }

    /// Drops the completeness flag, the validity markers and every
    /// message row of this directory, in one transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails.
    pub async fn invalidate_msglist(&self) -> CacheResult<()> {
        let mut tx = self.store.pool.begin().await?;
        sqlx::query(
            "UPDATE dirinfo SET msglistvalid = 0, uidvalidity = NULL, unreadcount = NULL \
             WHERE dir = ?",
        )
        .bind(&self.dir)
        .execute(&mut *tx)
        .await?;
        for sql in [
            "DELETE FROM parts WHERE dir = ?",
            "DELETE FROM tags WHERE dir = ?",
            "DELETE FROM meta WHERE dir = ?",
        ] {
            sqlx::query(sql).bind(&self.dir).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Returns every cached message with tags and part metadata.
    ///
    /// # Errors
    ///
    /// Fails with [`CacheError::NotCached`] unless the message list is
    /// marked complete.
    pub async fn list_msgs(&self) -> CacheResult<Vec<MessageInfo>> {
        let mut tx = self.store.pool.begin().await?;

        let valid: Option<i64> =
            sqlx::query_scalar("SELECT msglistvalid FROM dirinfo WHERE dir = ?")
                .bind(&self.dir)
                .fetch_optional(&mut *tx)
                .await?;
        if valid != Some(1) {
            return Err(CacheError::NotCached);
        }

        let rows = sqlx::query(
            "SELECT uid, timestamp, sender, recipients, cc, bcc, messageid, replyto, \
             subject, hdrs FROM meta WHERE dir = ? ORDER BY uid",
        )
        .bind(&self.dir)
        .fetch_all(&mut *tx)
        .await?;

        let mut result = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut info = info_from_meta_row(row)?;
            self.load_extras(&mut tx, &mut info).await?;
            result.push(info);
        }
        tx.commit().await?;
        Ok(result)
    }

    /// Returns one cached message by UID.
    ///
    /// # Errors
    ///
    /// Fails with [`CacheError::NotCached`] when the row is absent.
    pub async fn get_msg(&self, uid: u32) -> CacheResult<MessageInfo> {
        let mut tx = self.store.pool.begin().await?;
        let row = sqlx::query(
            "SELECT uid, timestamp, sender, recipients, cc, bcc, messageid, replyto, \
             subject, hdrs FROM meta WHERE dir = ? AND uid = ?",
        )
        .bind(&self.dir)
        .bind(uid)
        .fetch_one(&mut *tx)
        .await
        .map_err(not_cached)?;

        let mut info = info_from_meta_row(&row)?;
        self.load_extras(&mut tx, &mut info).await?;
        tx.commit().await?;
        Ok(info)
    }

    /// Returns one cached message by 1-based position (UID order).
    ///
    /// # Errors
    ///
    /// Fails with [`CacheError::NotCached`] when the position is out
    /// of range.
    pub async fn get_msg_by_seq(&self, seq: u32) -> CacheResult<MessageInfo> {
        let mut tx = self.store.pool.begin().await?;
        let row = sqlx::query(
            "SELECT uid, timestamp, sender, recipients, cc, bcc, messageid, replyto, \
             subject, hdrs FROM meta WHERE dir = ? ORDER BY uid LIMIT 1 OFFSET ?",
        )
        .bind(&self.dir)
        .bind(i64::from(seq).saturating_sub(1))
        .fetch_one(&mut *tx)
        .await
        .map_err(not_cached)?;

        let mut info = info_from_meta_row(&row)?;
        self.load_extras(&mut tx, &mut info).await?;
        tx.commit().await?;
        Ok(info)
    }

    /// Resolves a 1-based position (UID order) to a UID.
    ///
    /// # Errors
    ///
    /// Fails with [`CacheError::NotCached`] when the position is out
    /// of range.
    pub async fn resolve_uid(&self, seq: u32) -> CacheResult<u32> {
        sqlx::query_scalar(
            "SELECT uid FROM meta WHERE dir = ? ORDER BY uid LIMIT 1 OFFSET ?",
        )
        .bind(&self.dir)
        .bind(i64::from(seq).saturating_sub(1))
        .fetch_one(&self.store.pool)
        .await
        .map_err(not_cached)
    }

    /// Upserts a message with its tag set and part list, atomically.
    /// An existing row for the same UID is fully replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails.
    pub async fn add_msg(&self, info: &MessageInfo) -> CacheResult<()> {
        let mut tx = self.store.pool.begin().await?;
        self.insert_msg(&mut tx, info).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Merges a freshly fetched list into the cache: new UIDs are
    /// inserted, existing UIDs keep all their cached data (including
    /// part bodies and previously fetched text parts), and nothing is
    /// auto-deleted.
    ///
    /// Assumes the list was fetched under the same UIDVALIDITY as the
    /// cached rows.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails.
    pub async fn update_msglist(&self, list: &[MessageInfo]) -> CacheResult<()> {
        let mut tx = self.store.pool.begin().await?;
        let existing: Vec<u32> = sqlx::query_scalar("SELECT uid FROM meta WHERE dir = ?")
            .bind(&self.dir)
            .fetch_all(&mut *tx)
            .await?;
        let existing: HashSet<u32> = existing.into_iter().collect();

        for info in list {
            if !existing.contains(&info.uid) {
                self.insert_msg(&mut tx, info).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Deletes a message with its tags and parts, atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails.
    pub async fn del_msg(&self, uid: u32) -> CacheResult<()> {
        let mut tx = self.store.pool.begin().await?;
        for sql in [
            "DELETE FROM parts WHERE dir = ? AND uid = ?",
            "DELETE FROM tags WHERE dir = ? AND uid = ?",
            "DELETE FROM meta WHERE dir = ? AND uid = ?",
        ] {
            sqlx::query(sql)
                .bind(&self.dir)
                .bind(uid)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Adds one tag row. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn add_tag(&self, uid: u32, tag: &str) -> CacheResult<()> {
        sqlx::query("INSERT OR REPLACE INTO tags(dir, uid, tag) VALUES (?, ?, ?)")
            .bind(&self.dir)
            .bind(uid)
            .bind(tag)
            .execute(&self.store.pool)
            .await?;
        Ok(())
    }

    /// Removes one tag row.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn rem_tag(&self, uid: u32, tag: &str) -> CacheResult<()> {
        sqlx::query("DELETE FROM tags WHERE dir = ? AND uid = ? AND tag = ?")
            .bind(&self.dir)
            .bind(uid)
            .bind(tag)
            .execute(&self.store.pool)
            .await?;
        Ok(())
    }

    /// Replaces a message's whole tag set, atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails.
    pub async fn replace_tag_list(&self, uid: u32, tags: &[String]) -> CacheResult<()> {
        let mut tx = self.store.pool.begin().await?;
        sqlx::query("DELETE FROM tags WHERE dir = ? AND uid = ?")
            .bind(&self.dir)
            .bind(uid)
            .execute(&mut *tx)
            .await?;
        for tag in tags {
            sqlx::query("INSERT OR REPLACE INTO tags(dir, uid, tag) VALUES (?, ?, ?)")
                .bind(&self.dir)
                .bind(uid)
                .bind(tag)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Replaces a message's whole part list, atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails.
    pub async fn replace_part_list(&self, uid: u32, parts: &[mime::Part]) -> CacheResult<()> {
        let mut tx = self.store.pool.begin().await?;
        sqlx::query("DELETE FROM parts WHERE dir = ? AND uid = ?")
            .bind(&self.dir)
            .bind(uid)
            .execute(&mut *tx)
            .await?;
        for (indx, part) in parts.iter().enumerate() {
            self.insert_part(&mut tx, uid, indx as u32, part).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Returns a cached part body, `None` when not cached.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_part_body(&self, uid: u32, indx: u32) -> CacheResult<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT body FROM parts WHERE dir = ? AND uid = ? AND indx = ?")
            .bind(&self.dir)
            .bind(uid)
            .bind(indx)
            .fetch_optional(&self.store.pool)
            .await?;
        Ok(row.and_then(|r| r.get::<Option<Vec<u8>>, _>("body")))
    }

    /// Inserts or replaces one part row.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn add_part(&self, uid: u32, indx: u32, part: &mime::Part) -> CacheResult<()> {
        let mut tx = self.store.pool.begin().await?;
        self.insert_part(&mut tx, uid, indx, part).await?;
        tx.commit().await?;
        Ok(())
    }

    // === Internals ===

    async fn ensure_row(&self) -> CacheResult<()> {
        sqlx::query("INSERT OR IGNORE INTO dirinfo(dir) VALUES (?)")
            .bind(&self.dir)
            .execute(&self.store.pool)
            .await?;
        Ok(())
    }

    async fn load_extras(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        info: &mut MessageInfo,
    ) -> CacheResult<()> {
        let tags: Vec<String> =
            sqlx::query_scalar("SELECT tag FROM tags WHERE dir = ? AND uid = ? ORDER BY tag")
                .bind(&self.dir)
                .bind(info.uid)
                .fetch_all(&mut **tx)
                .await?;
        info.apply_flags(&tags);

        let rows = sqlx::query(
            "SELECT content_type, content_subtype, content_type_params, size, hdrs \
             FROM parts WHERE dir = ? AND uid = ? ORDER BY indx",
        )
        .bind(&self.dir)
        .bind(info.uid)
        .fetch_all(&mut **tx)
        .await?;
        info.msg.parts = rows
            .iter()
            .map(part_from_row)
            .collect::<CacheResult<Vec<_>>>()?;
        Ok(())
    }

    async fn insert_msg(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        info: &MessageInfo,
    ) -> CacheResult<()> {
        sqlx::query("INSERT OR IGNORE INTO dirinfo(dir) VALUES (?)")
            .bind(&self.dir)
            .execute(&mut **tx)
            .await?;

        let msg = &info.msg;
        sqlx::query(
            "INSERT OR REPLACE INTO meta \
             (dir, uid, timestamp, sender, recipients, cc, bcc, messageid, replyto, subject, hdrs) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.dir)
        .bind(info.uid)
        .bind(msg.date.map(|d| d.timestamp()))
        .bind(marshal_opt(&msg.from))
        .bind(mime::format_address_list(&msg.to))
        .bind(mime::format_address_list(&msg.cc))
        .bind(mime::format_address_list(&msg.bcc))
        .bind(&msg.message_id)
        .bind(marshal_opt(&msg.reply_to))
        .bind(&msg.subject)
        .bind(msg.misc.to_blob())
        .execute(&mut **tx)
        .await?;

        sqlx::query("DELETE FROM tags WHERE dir = ? AND uid = ?")
            .bind(&self.dir)
            .bind(info.uid)
            .execute(&mut **tx)
            .await?;
        for tag in info.to_flags() {
            sqlx::query("INSERT OR REPLACE INTO tags(dir, uid, tag) VALUES (?, ?, ?)")
                .bind(&self.dir)
                .bind(info.uid)
                .bind(tag)
                .execute(&mut **tx)
                .await?;
        }

        sqlx::query("DELETE FROM parts WHERE dir = ? AND uid = ?")
            .bind(&self.dir)
            .bind(info.uid)
            .execute(&mut **tx)
            .await?;
        for (indx, part) in msg.parts.iter().enumerate() {
            self.insert_part(tx, info.uid, indx as u32, part).await?;
        }
        Ok(())
    }

    async fn insert_part(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        uid: u32,
        indx: u32,
        part: &mime::Part,
    ) -> CacheResult<()> {
        let (ptype, subtype) = part.ptype.split_type();
        let size = part
            .body
            .as_ref()
            .map_or(part.size, |b| u32::try_from(b.len()).unwrap_or(u32::MAX));
        // Attachment bodies are never cached.
        let body = if part.is_attachment() {
            None
        } else {
            part.body.as_deref()
        };

        sqlx::query(
            "INSERT OR REPLACE INTO parts \
             (dir, uid, indx, attachment, content_type, content_subtype, content_type_params, \
              size, filename, hdrs, body) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.dir)
        .bind(uid)
        .bind(indx)
        .bind(i32::from(part.is_attachment()))
        .bind(ptype)
        .bind(subtype)
        .bind(params_to_string(&part.ptype.params))
        .bind(size)
        .bind(part.filename().unwrap_or_default())
        .bind(part_hdrs_blob(part))
        .bind(body)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

fn marshal_opt(addr: &mime::Address) -> String {
    if addr.is_empty() {
        String::new()
    } else {
        mime::format_address(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mailbox_mime::{Address, ParamHeader, Part};

    fn sample_msg(uid: u32) -> MessageInfo {
        let mut misc = mime::Header::new();
        misc.set("X-Mailer", "mailbox");
        MessageInfo {
            uid,
            seen: uid % 2 == 0,
            answered: false,
            recent: false,
            draft: false,
            custom_tags: vec!["work".to_string()],
            msg: mime::Msg {
                date: chrono::Utc.timestamp_opt(1_750_000_000, 0).single(),
                subject: format!("Message {uid}"),
                from: Address::with_name("John Doe", "john@example.com"),
                reply_to: Address::default(),
                to: vec![Address::new("jane@example.org")],
                cc: vec![],
                bcc: vec![],
                message_id: format!("<{uid}@example.com>"),
                misc,
                parts: vec![
                    Part::text("text/plain", format!("body {uid}").into_bytes()),
                    Part {
                        ptype: ParamHeader::new("application/pdf"),
                        disposition: ParamHeader::with_params(
                            "attachment",
                            vec![("filename".to_string(), "doc.pdf".to_string())],
                        ),
                        size: 2048,
                        misc: mime::Header::new(),
                        body: None,
                    },
                ],
            },
        }
    }

    async fn store_with_dir(dir: &str) -> CacheStore {
        let store = CacheStore::in_memory().await.unwrap();
        store.add_dir(dir).await.unwrap();
        store
    }

    #[tokio::test]
    async fn dirinfo_markers() {
        let store = store_with_dir("INBOX").await;
        let dir = store.dir("INBOX");

        assert_eq!(dir.uid_validity().await.unwrap(), None);
        assert_eq!(dir.unread_count().await.unwrap(), None);

        dir.set_uid_validity(100).await.unwrap();
        dir.set_unread_count(7).await.unwrap();
        assert_eq!(dir.uid_validity().await.unwrap(), Some(100));
        assert_eq!(dir.unread_count().await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn add_and_get_roundtrip() {
        let store = store_with_dir("INBOX").await;
        let dir = store.dir("INBOX");
        let msg = sample_msg(42);
        dir.add_msg(&msg).await.unwrap();

        let got = dir.get_msg(42).await.unwrap();
        assert_eq!(got.uid, 42);
        assert!(got.seen);
        assert_eq!(got.custom_tags, vec!["work"]);
        assert_eq!(got.msg.subject, "Message 42");
        assert_eq!(got.msg.from, msg.msg.from);
        assert_eq!(got.msg.to, msg.msg.to);
        assert_eq!(got.msg.misc.get("X-Mailer"), Some("mailbox"));
        // Part metadata is loaded, bodies are not.
        assert_eq!(got.msg.parts.len(), 2);
        assert_eq!(got.msg.parts[0].ptype.value, "text/plain");
        assert!(got.msg.parts[0].body.is_none());
        assert!(got.msg.parts[1].is_attachment());
        assert_eq!(got.msg.parts[1].filename(), Some("doc.pdf"));
    }

    #[tokio::test]
    async fn get_msg_miss_is_not_cached() {
        let store = store_with_dir("INBOX").await;
        assert!(matches!(
            store.dir("INBOX").get_msg(9).await.unwrap_err(),
            CacheError::NotCached
        ));
    }

    #[tokio::test]
    async fn list_requires_validity_flag() {
        let store = store_with_dir("INBOX").await;
        let dir = store.dir("INBOX");
        dir.add_msg(&sample_msg(1)).await.unwrap();

        assert!(matches!(
            dir.list_msgs().await.unwrap_err(),
            CacheError::NotCached
        ));

        dir.mark_as_valid().await.unwrap();
        let list = dir.list_msgs().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].uid, 1);
    }

    #[tokio::test]
    async fn part_bodies_cached_and_preserved_across_updates() {
        let store = store_with_dir("INBOX").await;
        let dir = store.dir("INBOX");
        dir.add_msg(&sample_msg(5)).await.unwrap();

        // The text part body was cached by add_msg, the attachment was
        // not.
        assert_eq!(
            dir.get_part_body(5, 0).await.unwrap().as_deref(),
            Some(&b"body 5"[..])
        );
        assert_eq!(dir.get_part_body(5, 1).await.unwrap(), None);

        // A refreshed list carrying no part data for uid 5 must not
        // clobber the cached body.
        let mut refreshed = sample_msg(5);
        refreshed.msg.parts.clear();
        dir.update_msglist(&[refreshed, sample_msg(6)])
            .await
            .unwrap();

        assert_eq!(
            dir.get_part_body(5, 0).await.unwrap().as_deref(),
            Some(&b"body 5"[..])
        );
        // The new message was inserted.
        assert!(dir.get_msg(6).await.is_ok());
    }

    #[tokio::test]
    async fn del_msg_leaves_no_orphans() {
        let store = store_with_dir("INBOX").await;
        let dir = store.dir("INBOX");
        dir.add_msg(&sample_msg(3)).await.unwrap();
        dir.del_msg(3).await.unwrap();

        assert!(matches!(
            dir.get_msg(3).await.unwrap_err(),
            CacheError::NotCached
        ));
        let tags: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tags")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let parts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM parts")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(tags, 0);
        assert_eq!(parts, 0);
    }

    #[tokio::test]
    async fn remove_dir_cascades() {
        let store = store_with_dir("Archive").await;
        store.dir("Archive").add_msg(&sample_msg(1)).await.unwrap();
        store.remove_dir("Archive").await.unwrap();

        assert!(store.dir_list().await.unwrap().is_empty());
        for table in ["meta", "tags", "parts"] {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&store.pool)
                .await
                .unwrap();
            assert_eq!(count, 0, "{table} should be empty");
        }
    }

    #[tokio::test]
    async fn rename_dir_moves_rows() {
        let store = store_with_dir("Old").await;
        store.dir("Old").add_msg(&sample_msg(1)).await.unwrap();
        store.rename_dir("Old", "New").await.unwrap();

        assert_eq!(store.dir_list().await.unwrap(), vec!["New"]);
        assert!(store.dir("New").get_msg(1).await.is_ok());
        assert!(matches!(
            store.dir("Old").get_msg(1).await.unwrap_err(),
            CacheError::NotCached
        ));
    }

    #[tokio::test]
    async fn invalidate_clears_everything() {
        let store = store_with_dir("INBOX").await;
        let dir = store.dir("INBOX");
        dir.set_uid_validity(100).await.unwrap();
        dir.set_unread_count(3).await.unwrap();
        dir.add_msg(&sample_msg(1)).await.unwrap();
        dir.mark_as_valid().await.unwrap();

        dir.invalidate_msglist().await.unwrap();

        assert_eq!(dir.uid_validity().await.unwrap(), None);
        assert_eq!(dir.unread_count().await.unwrap(), None);
        assert_eq!(dir.msgs_count().await.unwrap(), 0);
        assert!(matches!(
            dir.list_msgs().await.unwrap_err(),
            CacheError::NotCached
        ));
        // The directory itself stays in the set.
        assert_eq!(store.dir_list().await.unwrap(), vec!["INBOX"]);
    }

    #[tokio::test]
    async fn seq_resolution_follows_uid_order() {
        let store = store_with_dir("INBOX").await;
        let dir = store.dir("INBOX");
        for uid in [20, 5, 11] {
            dir.add_msg(&sample_msg(uid)).await.unwrap();
        }

        assert_eq!(dir.resolve_uid(1).await.unwrap(), 5);
        assert_eq!(dir.resolve_uid(2).await.unwrap(), 11);
        assert_eq!(dir.resolve_uid(3).await.unwrap(), 20);
        assert!(matches!(
            dir.resolve_uid(4).await.unwrap_err(),
            CacheError::NotCached
        ));

        assert_eq!(dir.get_msg_by_seq(2).await.unwrap().uid, 11);
    }

    #[tokio::test]
    async fn tag_operations() {
        let store = store_with_dir("INBOX").await;
        let dir = store.dir("INBOX");
        dir.add_msg(&sample_msg(7)).await.unwrap();

        dir.add_tag(7, "\\Answered").await.unwrap();
        dir.add_tag(7, "urgent").await.unwrap();
        let got = dir.get_msg(7).await.unwrap();
        assert!(got.answered);
        assert!(got.custom_tags.contains(&"urgent".to_string()));

        dir.rem_tag(7, "urgent").await.unwrap();
        assert!(
            !dir.get_msg(7)
                .await
                .unwrap()
                .custom_tags
                .contains(&"urgent".to_string())
        );

        dir.replace_tag_list(7, &["\\Seen".to_string(), "later".to_string()])
            .await
            .unwrap();
        let got = dir.get_msg(7).await.unwrap();
        assert!(got.seen);
        assert!(!got.answered);
        assert_eq!(got.custom_tags, vec!["later"]);
    }

    #[tokio::test]
    async fn replace_part_list_swaps_parts() {
        let store = store_with_dir("INBOX").await;
        let dir = store.dir("INBOX");
        dir.add_msg(&sample_msg(9)).await.unwrap();

        let new_parts = vec![Part::text("text/html", b"<p>hi</p>".to_vec())];
        dir.replace_part_list(9, &new_parts).await.unwrap();

        let got = dir.get_msg(9).await.unwrap();
        assert_eq!(got.msg.parts.len(), 1);
        assert_eq!(got.msg.parts[0].ptype.value, "text/html");
        assert_eq!(
            dir.get_part_body(9, 0).await.unwrap().as_deref(),
            Some(&b"<p>hi</p>"[..])
        );
    }

    #[tokio::test]
    async fn add_part_caches_body_on_demand() {
        let store = store_with_dir("INBOX").await;
        let dir = store.dir("INBOX");
        dir.add_msg(&sample_msg(4)).await.unwrap();

        // Download of a text part arrives later and is cached over the
        // metadata-only row.
        let downloaded = Part::text("text/plain", b"downloaded".to_vec());
        dir.add_part(4, 0, &downloaded).await.unwrap();
        assert_eq!(
            dir.get_part_body(4, 0).await.unwrap().as_deref(),
            Some(&b"downloaded"[..])
        );
    }

    #[tokio::test]
    async fn disposition_roundtrips_through_blob() {
        let store = store_with_dir("INBOX").await;
        let dir = store.dir("INBOX");
        dir.add_msg(&sample_msg(2)).await.unwrap();

        let got = dir.get_msg(2).await.unwrap();
        let attach = &got.msg.parts[1];
        assert_eq!(attach.disposition.value, "attachment");
        assert_eq!(attach.disposition.param("filename"), Some("doc.pdf"));
        // The blob carrier header is not visible as a misc header.
        assert!(attach.misc.get("Content-Disposition").is_none());
    }
}
