//! The serialized session the account controller talks to.
//!
//! One [`Session`] owns one connection, one background IDLE task and
//! one update-dispatcher task. Every protocol operation takes the
//! exclusive connection lock; the IDLE loop parks holding that same
//! lock and is cooperatively paused around each operation: the caller
//! sends an interrupt and awaits the task (the ack), runs its command,
//! then spawns a fresh IDLE task which waits out a five-second
//! quiescent window before re-entering IDLE so bursts of operations do
//! not thrash it.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mailbox_mime as mime;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::client::{IdleWait, ImapConnection};
use crate::connection::{ImapStream, ServerConfig};
use crate::parser::{BodyStructure, FetchItem};
use crate::types::{DirStatus, MessageInfo, SearchQuery};
use crate::updates::{RawEvent, SessionEvent, UpdateTracker};
use crate::{Error, Result};

/// Quiescent window before a resumed IDLE task touches the connection.
const IDLE_RESUME_DELAY: Duration = Duration::from_secs(5);

/// Forced IDLE refresh so NAT and server dropouts surface quickly.
const IDLE_HEARTBEAT: Duration = Duration::from_secs(60);

/// NOOP cadence when the server lacks IDLE.
const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Receiving side of the session's update channel.
pub type EventStream = mpsc::UnboundedReceiver<SessionEvent>;

struct IdleHandle {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct SessionInner {
    config: ServerConfig,
    conn: AsyncMutex<Option<ImapConnection<ImapStream>>>,
    idle: StdMutex<Option<IdleHandle>>,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
    tracker: Arc<StdMutex<UpdateTracker>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

/// A single serialized IMAP session with IDLE push and reconnection.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Connects (without authenticating) and returns the session plus
    /// the stream of push updates.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(config: ServerConfig) -> Result<(Self, EventStream)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SessionInner {
            config,
            conn: AsyncMutex::new(None),
            idle: StdMutex::new(None),
            dispatcher: StdMutex::new(None),
            tracker: Arc::new(StdMutex::new(UpdateTracker::new())),
            events_tx,
        });

        let conn = ImapConnection::connect(&inner.config).await?;
        install_connection(&inner, conn).await;

        Ok((Self { inner }, events_rx))
    }

    /// Authenticates with the stored credentials and starts the
    /// background IDLE loop on INBOX.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] on refused credentials.
    pub async fn authenticate(&self) -> Result<()> {
        {
            let mut guard = self.inner.conn.lock().await;
            let conn = guard
                .as_mut()
                .ok_or_else(|| Error::InvalidState("not connected".to_string()))?;
            conn.authenticate_plain(&self.inner.config.user, &self.inner.config.pass)
                .await?;
        }
        self.resume_idle();
        Ok(())
    }

    /// Tears down and re-establishes the connection: stops IDLE,
    /// drains the dispatcher, reconnects, re-authenticates and
    /// restarts IDLE. No mid-operation state survives.
    ///
    /// # Errors
    ///
    /// Returns an error if the new connection cannot be established;
    /// the session is then left unconnected.
    pub async fn reconnect(&self) -> Result<()> {
        self.stop_idle().await;
        reestablish(&self.inner).await?;
        self.resume_idle();
        Ok(())
    }

    /// Stops IDLE and the dispatcher (interrupt + ack each), logs out
    /// and drops the connection.
    pub async fn close(&self) {
        self.stop_idle().await;
        let old = self.inner.conn.lock().await.take();
        if let Some(mut conn) = old {
            if let Err(e) = conn.logout().await {
                debug!(error = %e, "logout failed during close");
            }
        }
        // The connection drop closed the raw-event channel; awaiting
        // the dispatcher is the ack that it drained and exited.
        let handle = self.inner.dispatcher.lock().expect("lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Seeds the tracker with the cached message count so a replayed
    /// selection reports only genuinely new messages.
    pub fn seed_mailbox_size(&self, dir: &str, size: u32) {
        self.inner
            .tracker
            .lock()
            .expect("lock poisoned")
            .set_known_size(dir, size);
    }

    // === Mailbox operations ===
    //
    // Every operation pauses IDLE, takes the connection lock, runs,
    // then resumes IDLE — the same discipline for all of them.

    /// Lists all mailboxes; returns the server's hierarchy delimiter
    /// alongside the raw names.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn dir_list(&self) -> Result<(Option<char>, Vec<String>)> {
        self.stop_idle().await;
        let result = async {
            let mut guard = self.inner.conn.lock().await;
            locked(&mut guard)?.list().await
        }
        .await;
        self.resume_idle();
        result
    }

    /// STATUS counters for a mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn status(&self, dir: &str) -> Result<DirStatus> {
        self.stop_idle().await;
        let result = async {
            let mut guard = self.inner.conn.lock().await;
            locked(&mut guard)?.status(dir).await
        }
        .await;
        self.resume_idle();
        result
    }

    /// UIDVALIDITY of a mailbox (convenience over [`Session::status`]).
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn uid_validity(&self, dir: &str) -> Result<Option<u32>> {
        Ok(self.status(dir).await?.uidvalidity)
    }

    /// Downloads UID + flags + envelope for every message in a
    /// mailbox. An empty mailbox yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn fetch_maillist(&self, dir: &str) -> Result<Vec<MessageInfo>> {
        self.stop_idle().await;
        let result = self.fetch_maillist_locked(dir, None).await;
        self.resume_idle();
        result
    }

    /// Windowed variant of [`Session::fetch_maillist`]: at most
    /// `count` messages starting at `offset` (0-based, oldest first).
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn fetch_partial_maillist(
        &self,
        dir: &str,
        count: u32,
        offset: u32,
    ) -> Result<Vec<MessageInfo>> {
        self.stop_idle().await;
        let result = self.fetch_maillist_locked(dir, Some((count, offset))).await;
        self.resume_idle();
        result
    }

    async fn fetch_maillist_locked(
        &self,
        dir: &str,
        window: Option<(u32, u32)>,
    ) -> Result<Vec<MessageInfo>> {
        let mut guard = self.inner.conn.lock().await;
        let conn = locked(&mut guard)?;
        let status = conn.ensure_selected(dir, true).await?;
        if status.messages == 0 {
            return Ok(Vec::new());
        }
        let (first, last) = match window {
            None => (1, status.messages),
            Some((count, offset)) => {
                let first = offset + 1;
                if first > status.messages {
                    return Ok(Vec::new());
                }
                (first, (offset + count).min(status.messages))
            }
        };
        let rows = conn.fetch_range(first, last, "(UID FLAGS ENVELOPE)").await?;
        let list = rows
            .into_iter()
            .filter_map(|(_, items)| message_from_items(&items))
            .collect();
        conn.close_mailbox().await?;
        Ok(list)
    }

    /// Downloads a message's envelope plus the bodies of parts passing
    /// `filter`; other parts come back as metadata-only placeholders.
    /// All accepted `(header, body)` section pairs are requested in a
    /// single pipelined fetch.
    ///
    /// # Errors
    ///
    /// Returns an error if the UID does not exist or a command fails.
    pub async fn fetch_partial_mail(
        &self,
        dir: &str,
        uid: u32,
        filter: impl Fn(&str, &str) -> bool + Send,
    ) -> Result<MessageInfo> {
        self.stop_idle().await;
        let result = self.fetch_partial_mail_locked(dir, uid, filter).await;
        self.resume_idle();
        result
    }

    async fn fetch_partial_mail_locked(
        &self,
        dir: &str,
        uid: u32,
        filter: impl Fn(&str, &str) -> bool + Send,
    ) -> Result<MessageInfo> {
        let mut guard = self.inner.conn.lock().await;
        let conn = locked(&mut guard)?;
        conn.ensure_selected(dir, true).await?;

        let rows = conn
            .uid_fetch(&[uid], "(UID FLAGS ENVELOPE BODYSTRUCTURE)")
            .await?;
        let items = rows
            .iter()
            .find(|(_, items)| has_uid(items, uid))
            .map(|(_, items)| items)
            .ok_or_else(|| Error::Protocol(format!("fetch: no message with uid {uid}")))?;

        let mut info =
            message_from_items(items).ok_or_else(|| Error::Protocol("fetch: no envelope".to_string()))?;
        let structure = items
            .iter()
            .find_map(|i| match i {
                FetchItem::BodyStructure(bs) => Some(bs.clone()),
                _ => None,
            })
            .ok_or_else(|| Error::Protocol("fetch: no body structure".to_string()))?;

        if structure.is_multipart() {
            let wanted: Vec<usize> = structure
                .parts
                .iter()
                .enumerate()
                .filter(|(_, p)| filter(&p.mime_type, &p.mime_subtype))
                .map(|(i, _)| i)
                .collect();

            let mut sections = Vec::new();
            if !wanted.is_empty() {
                let spec = wanted
                    .iter()
                    .map(|i| format!("BODY.PEEK[{0}.MIME] BODY.PEEK[{0}]", i + 1))
                    .collect::<Vec<_>>()
                    .join(" ");
                let rows = conn.uid_fetch(&[uid], &format!("({spec})")).await?;
                for (_, items) in rows {
                    for item in items {
                        if let FetchItem::BodySection { section, data } = item {
                            sections.push((section, data));
                        }
                    }
                }
            }

            for (i, child) in structure.parts.iter().enumerate() {
                if wanted.contains(&i) {
                    let header = section_data(&sections, &format!("{}.MIME", i + 1));
                    let body = section_data(&sections, &(i + 1).to_string());
                    info.msg
                        .parts
                        .push(build_part(header.as_deref(), body, child)?);
                } else {
                    info.msg.parts.push(child.to_part());
                }
            }
        } else if filter(&structure.mime_type, &structure.mime_subtype) {
            let rows = conn.uid_fetch(&[uid], "(BODY.PEEK[TEXT])").await?;
            let mut body = None;
            for (_, items) in rows {
                for item in items {
                    if let FetchItem::BodySection { data, .. } = item {
                        body = data;
                    }
                }
            }
            let mut part = structure.to_part();
            if let Some(raw) = body {
                let decoded = mime::encoding::decode_body(&structure.encoding, &raw)?;
                part.size = u32::try_from(decoded.len()).unwrap_or(u32::MAX);
                part.body = Some(decoded);
            }
            info.msg.parts.push(part);
        } else {
            info.msg.parts.push(structure.to_part());
        }

        conn.close_mailbox().await?;
        Ok(info)
    }

    /// Downloads one part (MIME header + body) of a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the UID does not exist or a command fails.
    pub async fn download_part(&self, dir: &str, uid: u32, part_index: usize) -> Result<mime::Part> {
        self.stop_idle().await;
        let result = async {
            let mut guard = self.inner.conn.lock().await;
            let conn = locked(&mut guard)?;
            conn.ensure_selected(dir, true).await?;

            let n = part_index + 1;
            let rows = conn
                .uid_fetch(&[uid], &format!("(BODY.PEEK[{n}.MIME] BODY.PEEK[{n}])"))
                .await?;
            let mut header = None;
            let mut body = None;
            for (_, items) in rows {
                for item in items {
                    if let FetchItem::BodySection { section, data } = item {
                        if section == format!("{n}.MIME") {
                            header = data;
                        } else if section == n.to_string() {
                            body = data;
                        }
                    }
                }
            }
            build_part(header.as_deref(), body, &BodyStructure::default())
        }
        .await;
        self.resume_idle();
        result
    }

    /// Resolves a sequence number to a UID by asking the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the sequence number is out of range or a
    /// command fails.
    pub async fn resolve_uid(&self, dir: &str, seqnum: u32) -> Result<u32> {
        self.stop_idle().await;
        let result = async {
            let mut guard = self.inner.conn.lock().await;
            let conn = locked(&mut guard)?;
            conn.ensure_selected(dir, true).await?;
            let rows = conn.fetch_range(seqnum, seqnum, "(UID)").await?;
            let uid = rows
                .iter()
                .flat_map(|(_, items)| items)
                .find_map(|i| match i {
                    FetchItem::Uid(u) => Some(*u),
                    _ => None,
                })
                .ok_or_else(|| {
                    Error::Protocol(format!("resolve: no message with seqnum {seqnum}"))
                });
            conn.close_mailbox().await?;
            uid
        }
        .await;
        self.resume_idle();
        result
    }

    /// APPENDs a new message. The UID comes from APPENDUID when the
    /// server implements UIDPLUS; otherwise it is predicted from the
    /// mailbox's pre-append UIDNEXT, which is best-effort and racy.
    ///
    /// # Errors
    ///
    /// Returns an error if the append fails.
    pub async fn create(
        &self,
        dir: &str,
        flags: &[String],
        date: DateTime<Utc>,
        msg: &mime::Msg,
    ) -> Result<u32> {
        self.stop_idle().await;
        let result = async {
            let mut guard = self.inner.conn.lock().await;
            let conn = locked(&mut guard)?;
            append_message(conn, dir, flags, date, msg).await
        }
        .await;
        self.resume_idle();
        result
    }

    /// Replaces a message with new content: APPEND the new version,
    /// then flag the old one `\Deleted` and expunge. The old message
    /// is never touched before the append succeeds, so a failed append
    /// leaves the mailbox unchanged; a failure after it can leave a
    /// duplicate but never a hole.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails.
    pub async fn replace(
        &self,
        dir: &str,
        old_uid: u32,
        flags: &[String],
        date: DateTime<Utc>,
        msg: &mime::Msg,
    ) -> Result<u32> {
        self.stop_idle().await;
        let result = async {
            let mut guard = self.inner.conn.lock().await;
            let conn = locked(&mut guard)?;
            let new_uid = append_message(conn, dir, flags, date, msg).await?;
            conn.ensure_selected(dir, false).await?;
            conn.uid_store(&[old_uid], true, &["\\Deleted".to_string()])
                .await?;
            conn.expunge().await?;
            Ok(new_uid)
        }
        .await;
        self.resume_idle();
        result
    }

    /// Copies messages to another mailbox. Unknown UIDs are ignored by
    /// the server.
    ///
    /// # Errors
    ///
    /// Returns an error if a command fails.
    pub async fn copy_to(&self, from: &str, to: &str, uids: &[u32]) -> Result<()> {
        self.stop_idle().await;
        let result = async {
            let mut guard = self.inner.conn.lock().await;
            let conn = locked(&mut guard)?;
            conn.ensure_selected(from, false).await?;
            conn.uid_copy(uids, to).await
        }
        .await;
        self.resume_idle();
        result
    }

    /// Moves messages to another mailbox, preferring the MOVE
    /// extension and falling back to COPY + `\Deleted` + EXPUNGE.
    ///
    /// # Errors
    ///
    /// Returns an error if a command fails.
    pub async fn move_to(&self, from: &str, to: &str, uids: &[u32]) -> Result<()> {
        self.stop_idle().await;
        let result = async {
            let mut guard = self.inner.conn.lock().await;
            let conn = locked(&mut guard)?;
            conn.ensure_selected(from, false).await?;
            if conn.has_capability("MOVE") {
                conn.uid_move(uids, to).await
            } else {
                conn.uid_copy(uids, to).await?;
                conn.uid_store(uids, true, &["\\Deleted".to_string()])
                    .await?;
                conn.expunge().await
            }
        }
        .await;
        self.resume_idle();
        result
    }

    /// Flags messages `\Deleted`. The expunge happens when the
    /// directory is eventually closed.
    ///
    /// # Errors
    ///
    /// Returns an error if a command fails.
    pub async fn delete(&self, dir: &str, uids: &[u32]) -> Result<()> {
        self.store_flag(dir, "\\Deleted", uids, true).await
    }

    /// Adds a tag (IMAP flag) to messages.
    ///
    /// # Errors
    ///
    /// Returns an error if a command fails.
    pub async fn tag(&self, dir: &str, tag: &str, uids: &[u32]) -> Result<()> {
        self.store_flag(dir, tag, uids, true).await
    }

    /// Removes a tag (IMAP flag) from messages.
    ///
    /// # Errors
    ///
    /// Returns an error if a command fails.
    pub async fn untag(&self, dir: &str, tag: &str, uids: &[u32]) -> Result<()> {
        self.store_flag(dir, tag, uids, false).await
    }

    async fn store_flag(&self, dir: &str, flag: &str, uids: &[u32], add: bool) -> Result<()> {
        self.stop_idle().await;
        let result = async {
            let mut guard = self.inner.conn.lock().await;
            let conn = locked(&mut guard)?;
            conn.ensure_selected(dir, false).await?;
            conn.uid_store(uids, add, &[flag.to_string()]).await
        }
        .await;
        self.resume_idle();
        result
    }

    /// UID SEARCH in one mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if a command fails.
    pub async fn search(&self, dir: &str, query: &SearchQuery) -> Result<Vec<u32>> {
        self.stop_idle().await;
        let result = async {
            let mut guard = self.inner.conn.lock().await;
            let conn = locked(&mut guard)?;
            conn.ensure_selected(dir, true).await?;
            conn.uid_search(&query.to_wire()).await
        }
        .await;
        self.resume_idle();
        result
    }

    /// Creates a mailbox on the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn create_dir(&self, dir: &str) -> Result<()> {
        self.stop_idle().await;
        let result = async {
            let mut guard = self.inner.conn.lock().await;
            locked(&mut guard)?.create(dir).await
        }
        .await;
        self.resume_idle();
        result
    }

    /// Renames a mailbox and carries its size bookkeeping over.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rename_dir(&self, from: &str, to: &str) -> Result<()> {
        self.stop_idle().await;
        let result = async {
            let mut guard = self.inner.conn.lock().await;
            locked(&mut guard)?.rename(from, to).await
        }
        .await;
        if result.is_ok() {
            self.inner
                .tracker
                .lock()
                .expect("lock poisoned")
                .rename(from, to);
        }
        self.resume_idle();
        result
    }

    /// Deletes a mailbox and forgets its size bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn remove_dir(&self, dir: &str) -> Result<()> {
        self.stop_idle().await;
        let result = async {
            let mut guard = self.inner.conn.lock().await;
            locked(&mut guard)?.delete(dir).await
        }
        .await;
        if result.is_ok() {
            self.inner
                .tracker
                .lock()
                .expect("lock poisoned")
                .forget(dir);
        }
        self.resume_idle();
        result
    }

    /// Selects and closes a mailbox so its current counters flow
    /// through the update dispatcher (used after a cache resync).
    ///
    /// # Errors
    ///
    /// Returns an error if the selection fails.
    pub async fn replay_updates(&self, dir: &str) -> Result<()> {
        self.stop_idle().await;
        let result = async {
            let mut guard = self.inner.conn.lock().await;
            let conn = locked(&mut guard)?;
            conn.select(dir, true).await?;
            conn.close_mailbox().await
        }
        .await;
        self.resume_idle();
        result
    }

    // === IDLE control ===

    /// Interrupts the IDLE task and waits for it to acknowledge by
    /// finishing. No-op when IDLE is not running.
    async fn stop_idle(&self) {
        let taken = self.inner.idle.lock().expect("lock poisoned").take();
        if let Some(handle) = taken {
            let _ = handle.stop_tx.send(());
            let _ = handle.task.await;
        }
    }

    /// Spawns a fresh IDLE task unless one is already installed.
    fn resume_idle(&self) {
        spawn_idle(&self.inner);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.inner.config.host)
            .finish_non_exhaustive()
    }
}

fn locked<'a>(
    guard: &'a mut Option<ImapConnection<ImapStream>>,
) -> Result<&'a mut ImapConnection<ImapStream>> {
    guard
        .as_mut()
        .ok_or_else(|| Error::ConnectionLost("session is not connected".to_string()))
}

/// Wires a fresh connection into the shared state: event sink plus a
/// new dispatcher task.
async fn install_connection(inner: &Arc<SessionInner>, mut conn: ImapConnection<ImapStream>) {
    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    conn.set_event_sink(raw_tx);
    let handle = tokio::spawn(dispatch(
        raw_rx,
        inner.tracker.clone(),
        inner.events_tx.clone(),
    ));
    *inner.dispatcher.lock().expect("lock poisoned") = Some(handle);
    *inner.conn.lock().await = Some(conn);
}

/// Drops the current connection (draining the dispatcher) and builds
/// an authenticated replacement.
async fn reestablish(inner: &Arc<SessionInner>) -> Result<()> {
    inner.conn.lock().await.take();
    let handle = inner.dispatcher.lock().expect("lock poisoned").take();
    if let Some(handle) = handle {
        let _ = handle.await;
    }

    let mut conn = ImapConnection::connect(&inner.config).await?;
    conn.authenticate_plain(&inner.config.user, &inner.config.pass)
        .await?;
    install_connection(inner, conn).await;
    Ok(())
}

fn spawn_idle(inner: &Arc<SessionInner>) {
    let mut slot = inner.idle.lock().expect("lock poisoned");
    if slot.is_some() {
        return;
    }
    let (stop_tx, stop_rx) = oneshot::channel();
    let task = tokio::spawn(idle_on_inbox(inner.clone(), stop_rx));
    *slot = Some(IdleHandle { stop_tx, task });
}

/// The update dispatcher: one task per connection, draining raw
/// observations through the tracker and fanning interpreted events
/// out to the session's consumer. Exits when the connection (the
/// sending side) is dropped.
async fn dispatch(
    mut raw_rx: mpsc::UnboundedReceiver<RawEvent>,
    tracker: Arc<StdMutex<UpdateTracker>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
) {
    while let Some(raw) = raw_rx.recv().await {
        let events = tracker.lock().expect("lock poisoned").process(raw);
        for event in events {
            if events_tx.send(event).is_err() {
                return;
            }
        }
    }
}

/// The background IDLE task. Waits out the quiescent window, selects
/// INBOX read-only and parks in IDLE (or NOOP polling without the
/// capability) with the per-I/O timeout disabled. Exits on interrupt
/// (acknowledged by task completion) or, after a server drop, attempts
/// a single recovery: reconnect, re-auth, re-select, fresh dispatcher.
async fn idle_on_inbox(inner: Arc<SessionInner>, mut stop_rx: oneshot::Receiver<()>) {
    tokio::select! {
        () = sleep(IDLE_RESUME_DELAY) => {}
        _ = &mut stop_rx => return,
    }

    let mut guard = inner.conn.lock().await;
    let Some(conn) = guard.as_mut() else {
        return;
    };

    if let Err(e) = conn.ensure_selected("INBOX", true).await {
        warn!(error = %e, "INBOX selection failed, not entering IDLE");
        if e.is_connection_lost() {
            drop(guard);
            recover_idle(&inner).await;
        }
        return;
    }

    conn.set_io_timeout(false);

    if !conn.has_capability("IDLE") {
        debug!("no IDLE capability, falling back to NOOP polling");
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    conn.set_io_timeout(true);
                    return;
                }
                () = sleep(POLL_INTERVAL) => {
                    if let Err(e) = conn.noop().await {
                        conn.set_io_timeout(true);
                        if e.is_connection_lost() {
                            drop(guard);
                            recover_idle(&inner).await;
                        }
                        return;
                    }
                }
            }
        }
    }

    if let Err(e) = conn.idle_start().await {
        warn!(error = %e, "IDLE entry failed");
        conn.set_io_timeout(true);
        if e.is_connection_lost() {
            drop(guard);
            recover_idle(&inner).await;
        }
        return;
    }
    debug!("entered IDLE on INBOX");

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                // Deadline back on first: the DONE drain must not hang
                // on a dead server while the caller awaits the ack.
                conn.set_io_timeout(true);
                if let Err(e) = conn.idle_done().await {
                    debug!(error = %e, "IDLE exit failed");
                }
                return;
            }
            outcome = conn.idle_wait(IDLE_HEARTBEAT) => match outcome {
                Ok(IdleWait::Event) => {}
                Ok(IdleWait::Heartbeat | IdleWait::Ended) => {
                    // Refresh the IDLE command.
                    let refresh = async {
                        conn.idle_done().await?;
                        conn.idle_start().await
                    }
                    .await;
                    if let Err(e) = refresh {
                        conn.set_io_timeout(true);
                        if e.is_connection_lost() {
                            drop(guard);
                            recover_idle(&inner).await;
                        }
                        return;
                    }
                }
                Err(e) if e.is_connection_lost() => {
                    warn!(error = %e, "connection dropped during IDLE, recovering");
                    drop(guard);
                    recover_idle(&inner).await;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "IDLE failed");
                    conn.set_io_timeout(true);
                    let _ = conn.idle_done().await;
                    return;
                }
            }
        }
    }
}

/// Single recovery attempt after the server dropped an idling
/// connection: rebuild the authenticated session, re-select INBOX and
/// park a fresh IDLE task.
async fn recover_idle(inner: &Arc<SessionInner>) {
    if let Err(e) = reestablish(inner).await {
        warn!(error = %e, "connection recovery during IDLE failed, bailing out");
        return;
    }
    {
        let mut guard = inner.conn.lock().await;
        if let Some(conn) = guard.as_mut() {
            if let Err(e) = conn.ensure_selected("INBOX", true).await {
                warn!(error = %e, "re-selecting INBOX after recovery failed");
            }
        }
    }
    // Replace our own (finished) handle with a fresh task.
    inner.idle.lock().expect("lock poisoned").take();
    spawn_idle(inner);
}

fn has_uid(items: &[FetchItem], uid: u32) -> bool {
    items
        .iter()
        .any(|i| matches!(i, FetchItem::Uid(u) if *u == uid))
}

/// Builds a [`MessageInfo`] from a fetched row (UID + FLAGS +
/// ENVELOPE). Rows without a UID or envelope yield `None`.
fn message_from_items(items: &[FetchItem]) -> Option<MessageInfo> {
    let uid = items.iter().find_map(|i| match i {
        FetchItem::Uid(u) => Some(*u),
        _ => None,
    })?;
    let envelope = items.iter().find_map(|i| match i {
        FetchItem::Envelope(e) => Some(e),
        _ => None,
    })?;
    let flags = items
        .iter()
        .find_map(|i| match i {
            FetchItem::Flags(f) => Some(f.clone()),
            _ => None,
        })
        .unwrap_or_default();
    Some(MessageInfo::from_envelope(uid, &flags, envelope))
}

fn section_data(sections: &[(String, Option<Vec<u8>>)], key: &str) -> Option<Vec<u8>> {
    sections
        .iter()
        .find(|(section, _)| section == key)
        .and_then(|(_, data)| data.clone())
}

/// Assembles a part from its fetched `n.MIME` header blob and raw
/// body, decoding the transfer encoding. Falls back to the body
/// structure's metadata for anything the header blob lacks.
fn build_part(
    mime_header: Option<&[u8]>,
    raw_body: Option<Vec<u8>>,
    fallback: &BodyStructure,
) -> Result<mime::Part> {
    let mut part = fallback.to_part();
    let mut encoding = fallback.encoding.clone();

    if let Some(blob) = mime_header {
        let mut header = mime::Header::from_blob(blob)?;
        if let Some(ct) = header.get("Content-Type") {
            part.ptype = mime::ParamHeader::parse(ct);
        }
        if let Some(cd) = header.get("Content-Disposition") {
            part.disposition = mime::ParamHeader::parse(cd);
        }
        if let Some(cte) = header.get("Content-Transfer-Encoding") {
            encoding = cte.to_string();
        }
        header.del("Content-Type");
        header.del("Content-Disposition");
        header.del("Content-Transfer-Encoding");
        part.misc = header;
    }

    if let Some(raw) = raw_body {
        let decoded = mime::encoding::decode_body(&encoding, &raw)?;
        part.size = u32::try_from(decoded.len()).unwrap_or(u32::MAX);
        part.body = Some(decoded);
    }
    Ok(part)
}

/// APPEND helper shared by create and replace: UIDPLUS when available,
/// otherwise the UIDNEXT prediction.
async fn append_message(
    conn: &mut ImapConnection<ImapStream>,
    dir: &str,
    flags: &[String],
    date: DateTime<Utc>,
    msg: &mime::Msg,
) -> Result<u32> {
    let mut body = Vec::new();
    msg.write(&mut body)?;

    if conn.has_capability("UIDPLUS") {
        let uid = conn.append(dir, flags, date, &body).await?;
        uid.ok_or_else(|| Error::Protocol("UIDPLUS server sent no APPENDUID".to_string()))
    } else {
        // Best-effort prediction from the pre-append UIDNEXT; racy by
        // nature (RFC 3501 §2.3.1.1).
        let status = conn.ensure_selected(dir, false).await?;
        let predicted = status.uidnext.unwrap_or(0);
        conn.append(dir, flags, date, &body).await?;
        Ok(predicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_part_prefers_mime_header_over_fallback() {
        let fallback = BodyStructure {
            mime_type: "text".to_string(),
            mime_subtype: "plain".to_string(),
            encoding: "base64".to_string(),
            size: 99,
            ..BodyStructure::default()
        };
        let header = b"Content-Type: text/html; charset=utf-8\r\n\
            Content-Transfer-Encoding: 7bit\r\n\
            X-Extra: kept\r\n";
        let part = build_part(Some(header), Some(b"<p>hi</p>".to_vec()), &fallback).unwrap();
        assert_eq!(part.ptype.value, "text/html");
        assert_eq!(part.body.as_deref(), Some(&b"<p>hi</p>"[..]));
        assert_eq!(part.size, 9);
        assert_eq!(part.misc.get("X-Extra"), Some("kept"));
        assert!(part.misc.get("Content-Type").is_none());
    }

    #[test]
    fn build_part_decodes_fallback_encoding() {
        let fallback = BodyStructure {
            mime_type: "text".to_string(),
            mime_subtype: "plain".to_string(),
            encoding: "base64".to_string(),
            ..BodyStructure::default()
        };
        let part = build_part(None, Some(b"aGVsbG8=".to_vec()), &fallback).unwrap();
        assert_eq!(part.body.as_deref(), Some(&b"hello"[..]));
        assert_eq!(part.size, 5);
    }

    #[test]
    fn build_part_without_body_keeps_metadata_only() {
        let fallback = BodyStructure {
            mime_type: "application".to_string(),
            mime_subtype: "pdf".to_string(),
            size: 1234,
            ..BodyStructure::default()
        };
        let part = build_part(None, None, &fallback).unwrap();
        assert!(part.body.is_none());
        assert_eq!(part.size, 1234);
        assert_eq!(part.ptype.value, "application/pdf");
    }

    #[test]
    fn message_from_items_requires_uid_and_envelope() {
        assert!(message_from_items(&[FetchItem::Uid(1)]).is_none());
        let items = vec![
            FetchItem::Uid(7),
            FetchItem::Flags(vec!["\\Seen".to_string()]),
            FetchItem::Envelope(crate::parser::Envelope {
                subject: "s".to_string(),
                ..crate::parser::Envelope::default()
            }),
        ];
        let info = message_from_items(&items).unwrap();
        assert_eq!(info.uid, 7);
        assert!(info.seen);
        assert_eq!(info.msg.subject, "s");
    }
}
