//! The per-account controller.
//!
//! Owns that account's cache handle, its IMAP session, the directory
//! name normalization state and the push-update loop. All reads are
//! cache-first (a semantic miss triggers a server fetch that refills
//! the cache); all mutations go to the server first and then patch or
//! reload the cache. Every network call runs inside the
//! retry-with-reconnect loop.

mod events;

use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use mailbox_imap::{MessageInfo, Session, text_only};
use mailbox_imap::connection::{Security, ServerConfig};
use mailbox_mime as mime;
use mailbox_smtp::{SmtpClient, SmtpConfig, SmtpSecurity};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, CacheStore};
use crate::config::{self, AccountConfig};
use crate::hooks::FrontendHooks;
use crate::search::{SearchCriteria, SearchResult};
use crate::{DIR_SEPARATOR, Error, Result};

struct EventTask {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// One loaded account: session + cache + orchestration.
pub struct AccountController {
    id: String,
    config: AccountConfig,
    max_tries: u32,
    cache: CacheStore,
    session: Session,
    smtp_config: SmtpConfig,
    /// The server's hierarchy delimiter, learned on the first LIST.
    delimiter: StdMutex<Option<char>>,
    /// Directories whose message lists are downloaded at load time.
    prefetch_dirs: Vec<String>,
    hooks: Arc<dyn FrontendHooks>,
    event_task: StdMutex<Option<EventTask>>,
}

impl AccountController {
    /// Connects, authenticates, opens the cache and starts the
    /// update-event loop. Prefetching is the caller's (asynchronous)
    /// follow-up step.
    pub(crate) async fn load(
        id: String,
        config: AccountConfig,
        password: String,
        max_tries: u32,
        hooks: Arc<dyn FrontendHooks>,
    ) -> Result<Arc<Self>> {
        info!(account = %id, host = %config.server.imap.host, "connecting to IMAP server");
        let imap_config = ServerConfig::new(
            config.server.imap.host.clone(),
            config.server.imap.port,
            imap_security(&config.server.imap.encryption),
        )
        .credentials(config.credentials.user.clone(), password.clone());

        let smtp_config = SmtpConfig {
            host: config.server.smtp.host.clone(),
            port: config.server.smtp.port,
            security: smtp_security(&config.server.smtp.encryption),
            user: config.credentials.user.clone(),
            pass: password,
        };

        let (session, events) = Session::connect(imap_config).await?;
        session.authenticate().await?;

        let cache = CacheStore::open(&config::cache_db_path(&id)).await?;

        let controller = Arc::new(Self {
            id,
            config,
            max_tries,
            cache,
            session,
            smtp_config,
            delimiter: StdMutex::new(None),
            prefetch_dirs: vec!["INBOX".to_string()],
            hooks,
            event_task: StdMutex::new(None),
        });

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(events::run_event_loop(controller.clone(), events, stop_rx));
        *controller.event_task.lock().expect("lock poisoned") = Some(EventTask { stop_tx, handle });

        Ok(controller)
    }

    /// The account id this controller serves.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stops the event loop and the session (interrupt + ack each) and
    /// closes the cache.
    pub(crate) async fn unload(&self) {
        self.session.close().await;
        let task = self.event_task.lock().expect("lock poisoned").take();
        if let Some(task) = task {
            let _ = task.stop_tx.send(());
            let _ = task.handle.await;
        }
        self.cache.close().await;
    }

    /// Early data population after load: directory list, then for each
    /// prefetch directory a UIDVALIDITY check and a forced message
    /// list download.
    pub(crate) async fn prefetch(&self) -> Result<()> {
        self.get_dirs_forced().await?;

        for dir in self.prefetch_dirs.clone() {
            let raw = self.raw_dir(&dir);
            let status = self
                .with_retry(|| self.session.status(&raw))
                .await?;

            let handle = self.cache.dir(&dir);
            let cached = handle.uid_validity().await?;
            if let Some(server) = status.uidvalidity {
                if cached != Some(server) {
                    if cached.is_some() {
                        debug!(account = %self.id, dir = %dir, "UIDVALIDITY changed, discarding cache");
                    }
                    handle.invalidate_msglist().await?;
                    handle.set_uid_validity(server).await?;
                }
            }
            if let Some(unseen) = status.unseen {
                handle.set_unread_count(unseen).await?;
            }

            self.msgs_list(&dir, true).await?;

            // Seed the push tracker so the idle loop's selection only
            // reports genuinely new messages.
            let count = self.cache.dir(&dir).msgs_count().await?;
            self.session.seed_mailbox_size(&raw, count);
        }
        Ok(())
    }

    // === Cache-first reads ===

    /// All directories of the account, normalized, cache-first.
    ///
    /// Nested directories use `|` as separator: an `Archive` directory
    /// with a `2026` child lists as `Archive` and `Archive|2026`.
    ///
    /// # Errors
    ///
    /// Returns an error if both the cache and the server fail.
    pub async fn get_dirs(&self) -> Result<Vec<String>> {
        let cached = self.cache.dir_list().await?;
        if !cached.is_empty() {
            return Ok(cached);
        }
        self.get_dirs_forced().await
    }

    async fn get_dirs_forced(&self) -> Result<Vec<String>> {
        debug!(account = %self.id, "downloading directory list");
        let (delimiter, names) = self.with_retry(|| self.session.dir_list()).await?;
        if delimiter.is_some() {
            *self.delimiter.lock().expect("lock poisoned") = delimiter;
        }

        let mut dirs = Vec::with_capacity(names.len());
        for name in names {
            let normalized = self.normalize_dir(&name);
            self.cache.add_dir(&normalized).await?;
            dirs.push(normalized);
        }
        dirs.sort();
        dirs.dedup();
        Ok(dirs)
    }

    /// Unread count for a directory, cache-first.
    ///
    /// # Errors
    ///
    /// Returns an error if both the cache and the server fail.
    pub async fn get_unread_count(&self, dir: &str) -> Result<u32> {
        if let Some(count) = self.cache.dir(dir).unread_count().await? {
            return Ok(count);
        }

        let raw = self.raw_dir(dir);
        let status = self.with_retry(|| self.session.status(&raw)).await?;
        let unseen = status.unseen.unwrap_or(0);
        self.cache.dir(dir).set_unread_count(unseen).await?;
        Ok(unseen)
    }

    /// The full message list of a directory, cache-first.
    ///
    /// # Errors
    ///
    /// Returns an error if both the cache and the server fail.
    pub async fn get_msgs_list(&self, dir: &str) -> Result<Vec<MessageInfo>> {
        self.msgs_list(dir, false).await
    }

    pub(crate) async fn msgs_list(&self, dir: &str, force: bool) -> Result<Vec<MessageInfo>> {
        if !force {
            match self.cache.dir(dir).list_msgs().await {
                Ok(list) => return Ok(list),
                Err(CacheError::NotCached) => {}
                Err(e) => return Err(e.into()),
            }
        }

        debug!(account = %self.id, dir = %dir, "downloading message list");
        let raw = self.raw_dir(dir);
        let list = self.with_retry(|| self.session.fetch_maillist(&raw)).await?;

        let handle = self.cache.dir(dir);
        handle.update_msglist(&list).await?;
        handle.mark_as_valid().await?;
        Ok(list)
    }

    /// All headers plus the text parts of one message. Non-text parts
    /// are present as metadata with no body.
    ///
    /// With `allow_outdated` the cached copy is good enough; without
    /// it the message is always re-fetched.
    ///
    /// # Errors
    ///
    /// Returns an error if both the cache and the server fail.
    pub async fn get_msg_text(
        &self,
        dir: &str,
        uid: u32,
        allow_outdated: bool,
    ) -> Result<mime::Msg> {
        if allow_outdated {
            match self.cache.dir(dir).get_msg(uid).await {
                Ok(info) if !info.msg.parts.is_empty() => return Ok(info.msg),
                Ok(_) | Err(CacheError::NotCached) => {}
                Err(e) => return Err(e.into()),
            }
        }

        debug!(account = %self.id, dir = %dir, uid, "downloading message text");
        let raw = self.raw_dir(dir);
        let info = self
            .with_retry(|| self.session.fetch_partial_mail(&raw, uid, text_only))
            .await?;
        self.cache.dir(dir).add_msg(&info).await?;
        Ok(info.msg)
    }

    /// Downloads one message part. The result is not cached; callers
    /// should not request it more often than needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the download fails.
    pub async fn get_msg_part(&self, dir: &str, uid: u32, part_index: usize) -> Result<mime::Part> {
        let raw = self.raw_dir(dir);
        Ok(self
            .with_retry(|| self.session.download_part(&raw, uid, part_index))
            .await?)
    }

    /// Resolves a sequence number to a UID on the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn resolve_uid(&self, dir: &str, seqnum: u32) -> Result<u32> {
        let raw = self.raw_dir(dir);
        Ok(self
            .with_retry(|| self.session.resolve_uid(&raw, seqnum))
            .await?)
    }

    /// Downloads the text of every message in the account's
    /// offline-use directories into the cache. Failures are logged,
    /// not surfaced.
    pub async fn download_offline_dirs(&self) {
        info!(account = %self.id, "downloading messages for offline use");
        for dir in self.config.dirs.download_for_offline.clone() {
            let list = match self.get_msgs_list(&dir).await {
                Ok(list) => list,
                Err(e) => {
                    warn!(account = %self.id, dir = %dir, error = %e, "offline list download failed");
                    return;
                }
            };
            for msg in list {
                if let Err(e) = self.get_msg_text(&dir, msg.uid, true).await {
                    warn!(account = %self.id, dir = %dir, uid = msg.uid, error = %e,
                          "offline text download failed");
                }
            }
        }
    }

    // === Mutations ===

    /// Creates a directory under `parent` (pass `""` for the root).
    /// The cache learns the new directory and every ancestor, so a
    /// deep create is one logical operation.
    ///
    /// # Errors
    ///
    /// Rejects a segment containing `|`; surfaces server refusals.
    pub async fn create_dir(&self, parent: &str, name: &str) -> Result<()> {
        reject_separator(name)?;
        let joined = join_dir(parent, name);
        let raw = self.raw_dir(&joined);
        self.with_retry(|| self.session.create_dir(&raw)).await?;

        let mut path = String::new();
        for segment in joined.split(DIR_SEPARATOR) {
            if !path.is_empty() {
                path.push(DIR_SEPARATOR);
            }
            path.push_str(segment);
            self.cache.add_dir(&path).await?;
        }
        Ok(())
    }

    /// Removes a directory.
    ///
    /// # Errors
    ///
    /// Refuses to delete INBOX; rejects a segment containing `|`;
    /// surfaces server refusals.
    pub async fn remove_dir(&self, parent: &str, name: &str) -> Result<()> {
        reject_separator(name)?;
        let joined = join_dir(parent, name);
        if joined == "INBOX" {
            return Err(Error::Validation("cannot remove INBOX".to_string()));
        }
        let raw = self.raw_dir(&joined);
        self.with_retry(|| self.session.remove_dir(&raw)).await?;
        self.cache.remove_dir(&joined).await?;
        Ok(())
    }

    /// Renames a directory in place.
    ///
    /// # Errors
    ///
    /// Surfaces server refusals and cache failures.
    pub async fn rename_dir(&self, old: &str, new: &str) -> Result<()> {
        let raw_old = self.raw_dir(old);
        let raw_new = self.raw_dir(new);
        self.with_retry(|| self.session.rename_dir(&raw_old, &raw_new))
            .await?;
        self.cache.rename_dir(old, new).await?;
        Ok(())
    }

    /// Moves a directory from one parent to another (rename on the
    /// wire).
    ///
    /// # Errors
    ///
    /// Surfaces server refusals and cache failures.
    pub async fn move_dir(&self, dir: &str, old_parent: &str, new_parent: &str) -> Result<()> {
        self.rename_dir(&join_dir(old_parent, dir), &join_dir(new_parent, dir))
            .await
    }

    /// Moves messages between directories. Unknown UIDs are ignored.
    /// The destination's cached list is reloaded rather than patched.
    ///
    /// # Errors
    ///
    /// Surfaces server refusals and cache failures.
    pub async fn move_msgs(&self, from: &str, to: &str, uids: &[u32]) -> Result<()> {
        let raw_from = self.raw_dir(from);
        let raw_to = self.raw_dir(to);
        self.with_retry(|| self.session.move_to(&raw_from, &raw_to, uids))
            .await?;

        let handle = self.cache.dir(from);
        for &uid in uids {
            handle.del_msg(uid).await?;
        }
        self.reload_maillist(to).await;
        Ok(())
    }

    /// Copies messages between directories. Unknown UIDs are ignored.
    /// The destination's cached list is reloaded rather than patched.
    ///
    /// # Errors
    ///
    /// Surfaces server refusals.
    pub async fn copy_msgs(&self, from: &str, to: &str, uids: &[u32]) -> Result<()> {
        let raw_from = self.raw_dir(from);
        let raw_to = self.raw_dir(to);
        self.with_retry(|| self.session.copy_to(&raw_from, &raw_to, uids))
            .await?;
        self.reload_maillist(to).await;
        Ok(())
    }

    /// Deletes messages, or moves them to the Trash directory unless
    /// `skip_trash` is set or they already are in Trash.
    ///
    /// # Errors
    ///
    /// Surfaces server refusals and cache failures.
    pub async fn del_msg(&self, dir: &str, skip_trash: bool, uids: &[u32]) -> Result<()> {
        if skip_trash || dir == self.config.dirs.trash {
            let raw = self.raw_dir(dir);
            self.with_retry(|| self.session.delete(&raw, uids)).await?;
            let handle = self.cache.dir(dir);
            for &uid in uids {
                handle.del_msg(uid).await?;
            }
            Ok(())
        } else {
            let trash = self.config.dirs.trash.clone();
            self.move_msgs(dir, &trash, uids).await
        }
    }

    /// Adds a tag to messages. Unknown UIDs are ignored.
    ///
    /// # Errors
    ///
    /// Surfaces server refusals and cache failures.
    pub async fn tag(&self, dir: &str, tag: &str, uids: &[u32]) -> Result<()> {
        let raw = self.raw_dir(dir);
        self.with_retry(|| self.session.tag(&raw, tag, uids))
            .await?;
        let handle = self.cache.dir(dir);
        for &uid in uids {
            handle.add_tag(uid, tag).await?;
        }
        Ok(())
    }

    /// Removes a tag from messages. Unknown UIDs are ignored.
    ///
    /// # Errors
    ///
    /// Surfaces server refusals and cache failures.
    pub async fn untag(&self, dir: &str, tag: &str, uids: &[u32]) -> Result<()> {
        let raw = self.raw_dir(dir);
        self.with_retry(|| self.session.untag(&raw, tag, uids))
            .await?;
        let handle = self.cache.dir(dir);
        for &uid in uids {
            handle.rem_tag(uid, tag).await?;
        }
        Ok(())
    }

    /// Saves a draft into the account's Drafts directory and returns
    /// its UID. The directory's cached list is reloaded afterwards:
    /// the server may rewrite the stored message, and Drafts stays
    /// small enough for that to be cheap.
    ///
    /// # Errors
    ///
    /// Surfaces append refusals.
    pub async fn save_draft(&self, draft: &mime::Msg) -> Result<u32> {
        let drafts = self.config.dirs.drafts.clone();
        let raw = self.raw_dir(&drafts);
        let tags = ["\\Draft".to_string()];
        let uid = self
            .with_retry(|| self.session.create(&raw, &tags, Utc::now(), draft))
            .await?;
        self.reload_maillist(&drafts).await;
        Ok(uid)
    }

    /// Replaces an existing draft with new content and returns the new
    /// UID. The old version survives any failure before the new append
    /// succeeds.
    ///
    /// # Errors
    ///
    /// Surfaces append refusals.
    pub async fn update_draft(&self, old_uid: u32, draft: &mime::Msg) -> Result<u32> {
        let drafts = self.config.dirs.drafts.clone();
        let raw = self.raw_dir(&drafts);
        let tags = ["\\Draft".to_string()];
        let uid = self
            .with_retry(|| self.session.replace(&raw, old_uid, &tags, Utc::now(), draft))
            .await?;
        self.reload_maillist(&drafts).await;
        Ok(uid)
    }

    /// Submits a message over SMTP; when the account copies sent mail,
    /// also appends it to the Sent directory and returns that copy's
    /// UID (zero when copying is disabled). An append failure is an
    /// error even though the message already left.
    ///
    /// # Errors
    ///
    /// Surfaces SMTP failures and the Sent-copy append failure.
    pub async fn send_message(&self, msg: &mime::Msg) -> Result<u32> {
        info!(account = %self.id, host = %self.smtp_config.host, "connecting to SMTP server");
        let mut client = SmtpClient::connect(&self.smtp_config).await?;
        client.auth(&self.smtp_config).await?;
        client.send(msg).await?;
        client.quit().await?;

        if !self.config.copy_to_sent {
            return Ok(0);
        }

        let sent = self.config.dirs.sent.clone();
        let raw = self.raw_dir(&sent);
        let tags = ["\\Seen".to_string()];
        let uid = self
            .with_retry(|| self.session.create(&raw, &tags, Utc::now(), msg))
            .await?;
        self.reload_maillist(&sent).await;
        Ok(uid)
    }

    /// Searches the account. IMAP search is per-directory; multi-dir
    /// search is emulated by querying each directory and joining the
    /// results.
    ///
    /// # Errors
    ///
    /// Surfaces server refusals.
    pub async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<SearchResult>> {
        let dirs = match &criteria.dirs {
            Some(dirs) => dirs.clone(),
            None => self.get_dirs().await?,
        };
        let query = criteria.to_query();

        let mut results = Vec::new();
        for dir in dirs {
            let raw = self.raw_dir(&dir);
            let uids = self
                .with_retry(|| self.session.search(&raw, &query))
                .await?;
            results.extend(uids.into_iter().map(|uid| SearchResult {
                dir: dir.clone(),
                uid,
            }));
        }
        Ok(results)
    }

    // === Internals ===

    /// Forces a message list reload and tells the frontend the
    /// directory view is stale.
    pub(crate) async fn reload_maillist(&self, dir: &str) {
        if let Err(e) = self.msgs_list(dir, true).await {
            warn!(account = %self.id, dir = %dir, error = %e, "message list reload failed");
        }
        self.hooks.reset_dir(&self.id, dir);
    }

    /// Runs a session operation, reconnecting and retrying on
    /// transport loss, up to `max_tries` attempts. Protocol errors
    /// propagate immediately.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = mailbox_imap::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_connection_lost() && attempt < self.max_tries => {
                    warn!(account = %self.id, error = %e, attempt, "connection lost, reconnecting");
                    self.session.reconnect().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Normalized name: server delimiters replaced by `|`.
    fn normalize_dir(&self, raw: &str) -> String {
        normalize_name(raw, *self.delimiter.lock().expect("lock poisoned"))
    }

    /// Raw server name: `|` replaced by the server delimiter.
    fn raw_dir(&self, normalized: &str) -> String {
        raw_name(normalized, *self.delimiter.lock().expect("lock poisoned"))
    }
}

fn normalize_name(raw: &str, delimiter: Option<char>) -> String {
    match delimiter {
        Some(d) => raw.replace(d, &DIR_SEPARATOR.to_string()),
        None => raw.to_string(),
    }
}

fn raw_name(normalized: &str, delimiter: Option<char>) -> String {
    match delimiter {
        Some(d) => normalized.replace(DIR_SEPARATOR, &d.to_string()),
        None => normalized.to_string(),
    }
}

fn join_dir(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{parent}{DIR_SEPARATOR}{child}")
    }
}

fn reject_separator(segment: &str) -> Result<()> {
    if segment.contains(DIR_SEPARATOR) {
        return Err(Error::Validation(format!(
            "directory name must not contain '{DIR_SEPARATOR}': {segment}"
        )));
    }
    Ok(())
}

fn imap_security(encryption: &str) -> Security {
    if encryption == "starttls" {
        Security::StartTls
    } else {
        Security::Tls
    }
}

fn smtp_security(encryption: &str) -> SmtpSecurity {
    if encryption == "starttls" {
        SmtpSecurity::StartTls
    } else {
        SmtpSecurity::Tls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_dir_forms() {
        assert_eq!(join_dir("", "INBOX"), "INBOX");
        assert_eq!(join_dir("Archive", "2026"), "Archive|2026");
        assert_eq!(join_dir("Archive|2026", "Work"), "Archive|2026|Work");
    }

    #[test]
    fn separator_rejection() {
        assert!(reject_separator("clean").is_ok());
        assert!(reject_separator("bad|name").is_err());
    }

    #[test]
    fn name_normalization_roundtrip() {
        for raw in ["INBOX", "Archive/2026/Work", "Sent"] {
            let normalized = normalize_name(raw, Some('/'));
            assert_eq!(raw_name(&normalized, Some('/')), raw);
        }
        assert_eq!(normalize_name("Archive.2026", Some('.')), "Archive|2026");
        assert_eq!(raw_name("Archive|2026", Some('.')), "Archive.2026");
        // Unknown delimiter passes names through.
        assert_eq!(normalize_name("Plain", None), "Plain");
        assert_eq!(raw_name("Plain", None), "Plain");
    }

    #[test]
    fn security_mapping() {
        assert_eq!(imap_security("starttls"), Security::StartTls);
        assert_eq!(imap_security("tls"), Security::Tls);
        assert_eq!(smtp_security("starttls"), SmtpSecurity::StartTls);
        assert_eq!(smtp_security("tls"), SmtpSecurity::Tls);
    }
}
