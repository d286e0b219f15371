//! The raw protocol client: one command at a time over one framed
//! stream.
//!
//! [`ImapConnection`] owns tag generation, command serialization and
//! the read-until-tagged loop. Untagged responses observed along the
//! way update the selected-mailbox bookkeeping and are surfaced as
//! [`RawEvent`]s on the connection's event sink; the higher-level
//! [`crate::Session`] turns those into controller-facing updates.

use std::collections::HashSet;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::connection::{FramedStream, ImapStream, Security, ServerConfig, tls_handshake};
use crate::parser::{
    FetchItem, ImapStatus, Response, ResponseCode, Untagged, parse_response,
};
use crate::types::DirStatus;
use crate::updates::RawEvent;
use crate::{Error, Result};

/// State of the currently selected mailbox.
#[derive(Debug, Clone)]
pub struct SelectedState {
    /// Raw mailbox name.
    pub name: String,
    /// Whether EXAMINE (or a read-only SELECT) was used.
    pub read_only: bool,
    /// Message count from EXISTS.
    pub exists: u32,
    /// RECENT count.
    pub recent: u32,
    /// UIDVALIDITY from the selection response code.
    pub uidvalidity: Option<u32>,
    /// UIDNEXT from the selection response code.
    pub uidnext: Option<u32>,
    /// First unseen sequence number.
    pub unseen: Option<u32>,
}

impl SelectedState {
    fn new(name: &str, read_only: bool) -> Self {
        Self {
            name: name.to_string(),
            read_only,
            exists: 0,
            recent: 0,
            uidvalidity: None,
            uidnext: None,
            unseen: None,
        }
    }

    /// Converts to the status form used by events and callers.
    #[must_use]
    pub fn to_status(&self) -> DirStatus {
        DirStatus {
            name: self.name.clone(),
            messages: self.exists,
            unseen: self.unseen,
            uidvalidity: self.uidvalidity,
            uidnext: self.uidnext,
        }
    }
}

/// Result of one command: collected untagged data plus the tagged
/// completion code and text.
#[derive(Debug, Default)]
pub(crate) struct CommandResult {
    pub untagged: Vec<Untagged>,
    pub fetches: Vec<(u32, Vec<FetchItem>)>,
    pub code: Option<ResponseCode>,
    #[allow(dead_code)]
    pub text: String,
}

/// Outcome of one IDLE wait.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum IdleWait {
    /// An untagged update arrived (already dispatched as an event).
    Event,
    /// The heartbeat interval elapsed with no traffic.
    Heartbeat,
    /// The server terminated IDLE on its own.
    Ended,
}

/// A single authenticated-capable IMAP connection.
#[derive(Debug)]
pub struct ImapConnection<S> {
    stream: FramedStream<S>,
    tag_counter: u32,
    capabilities: HashSet<String>,
    selected: Option<SelectedState>,
    events: Option<mpsc::UnboundedSender<RawEvent>>,
    io_timeout: Duration,
    /// Suppress per-response size events during SELECT; one combined
    /// event is emitted after completion instead.
    selecting: bool,
    idle_tag: Option<String>,
}

impl ImapConnection<ImapStream> {
    /// Dials, performs the TLS or STARTTLS handshake, reads the
    /// greeting and discovers capabilities. The whole sequence runs
    /// under the config's connect deadline.
    ///
    /// # Errors
    ///
    /// Returns an error on dial/handshake failure, a BYE greeting, or
    /// a STARTTLS server lacking the capability.
    pub async fn connect(config: &ServerConfig) -> Result<Self> {
        let deadline = config.connect_timeout;
        timeout(deadline, Self::connect_inner(config))
            .await
            .map_err(|_| Error::Timeout(deadline))?
    }

    async fn connect_inner(config: &ServerConfig) -> Result<Self> {
        let tcp = TcpStream::connect((config.host.as_str(), config.port)).await?;
        match config.security {
            Security::Tls => {
                let tls = tls_handshake(tcp, &config.host).await?;
                Self::from_stream(tls, config.io_timeout).await
            }
            Security::StartTls => {
                // The plaintext phase is the same generic client run
                // over the bare TCP stream; nothing but the greeting,
                // capabilities and the upgrade command crosses it.
                let mut plain = ImapConnection::from_stream(tcp, config.io_timeout).await?;
                if !plain.has_capability("STARTTLS") {
                    return Err(Error::Protocol(
                        "server does not advertise STARTTLS".to_string(),
                    ));
                }
                plain.run("STARTTLS".to_string(), false).await?;
                let tag_counter = plain.tag_counter;
                let tls = tls_handshake(plain.stream.into_inner(), &config.host).await?;
                // Capabilities may change across the TLS boundary.
                let mut conn = Self {
                    stream: FramedStream::new(tls, Some(config.io_timeout)),
                    tag_counter,
                    capabilities: HashSet::new(),
                    selected: None,
                    events: None,
                    io_timeout: config.io_timeout,
                    selecting: false,
                    idle_tag: None,
                };
                conn.capability().await?;
                Ok(conn)
            }
        }
    }
}

impl<S> ImapConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an established stream: reads the greeting and queries
    /// capabilities.
    ///
    /// # Errors
    ///
    /// Returns an error on a BYE greeting or malformed traffic.
    pub async fn from_stream(stream: S, io_timeout: Duration) -> Result<Self> {
        let mut conn = Self {
            stream: FramedStream::new(stream, Some(io_timeout)),
            tag_counter: 0,
            capabilities: HashSet::new(),
            selected: None,
            events: None,
            io_timeout,
            selecting: false,
            idle_tag: None,
        };

        let greeting = conn.read_parsed().await?;
        match greeting {
            Response::Untagged(Untagged::Ok { code, .. }) => {
                if let Some(ResponseCode::Capability(caps)) = code {
                    conn.store_capabilities(caps);
                }
            }
            Response::Untagged(Untagged::PreAuth { .. }) => {}
            Response::Untagged(Untagged::Bye { text }) => return Err(Error::Bye(text)),
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected greeting: {other:?}"
                )));
            }
        }

        if conn.capabilities.is_empty() {
            conn.capability().await?;
        }
        Ok(conn)
    }

    /// Attaches the sink that receives raw update events.
    pub fn set_event_sink(&mut self, sink: mpsc::UnboundedSender<RawEvent>) {
        self.events = Some(sink);
    }

    /// Enables or disables the per-I/O deadline (IDLE suspends it).
    pub fn set_io_timeout(&mut self, enabled: bool) {
        self.stream
            .set_io_timeout(enabled.then_some(self.io_timeout));
    }

    /// Returns the selected-mailbox state, if any.
    #[must_use]
    pub fn selected(&self) -> Option<&SelectedState> {
        self.selected.as_ref()
    }

    /// Returns true if the server advertised a capability.
    #[must_use]
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains(&name.to_ascii_uppercase())
    }

    fn store_capabilities(&mut self, caps: Vec<String>) {
        self.capabilities = caps.into_iter().map(|c| c.to_ascii_uppercase()).collect();
    }

    fn next_tag(&mut self) -> String {
        self.tag_counter += 1;
        format!("A{:03}", self.tag_counter)
    }

    fn emit(&self, event: RawEvent) {
        if let Some(sink) = &self.events {
            let _ = sink.send(event);
        }
    }

    async fn read_parsed(&mut self) -> Result<Response> {
        let raw = self.stream.read_response().await?;
        parse_response(&raw)
    }

    /// Digests one untagged response: updates selection bookkeeping,
    /// emits raw events, and stores the response for the caller.
    fn handle_untagged(&mut self, untagged: Untagged, result: &mut CommandResult, collect_fetch: bool) {
        match &untagged {
            Untagged::Exists(n) => {
                if let Some(sel) = &mut self.selected {
                    sel.exists = *n;
                    if !self.selecting {
                        let status = sel.to_status();
                        self.emit(RawEvent::MailboxSize { status });
                    }
                }
            }
            Untagged::Recent(n) => {
                if let Some(sel) = &mut self.selected {
                    sel.recent = *n;
                }
            }
            Untagged::Expunge(seqnum) => {
                if let Some(sel) = &mut self.selected {
                    sel.exists = sel.exists.saturating_sub(1);
                    let dir = sel.name.clone();
                    self.emit(RawEvent::Expunge {
                        dir,
                        seqnum: *seqnum,
                    });
                }
            }
            Untagged::Fetch { seq, items } => {
                if collect_fetch {
                    result.fetches.push((*seq, items.clone()));
                } else if let Some(sel) = &self.selected {
                    let uid = items.iter().find_map(|i| match i {
                        FetchItem::Uid(u) => Some(*u),
                        _ => None,
                    });
                    let flags = items.iter().find_map(|i| match i {
                        FetchItem::Flags(f) => Some(f.clone()),
                        _ => None,
                    });
                    self.emit(RawEvent::Fetch {
                        dir: sel.name.clone(),
                        seqnum: *seq,
                        uid,
                        flags,
                    });
                }
                return;
            }
            Untagged::Ok { code: Some(code), .. } => {
                if let Some(sel) = &mut self.selected {
                    match code {
                        ResponseCode::UidValidity(v) => sel.uidvalidity = Some(*v),
                        ResponseCode::UidNext(v) => sel.uidnext = Some(*v),
                        ResponseCode::Unseen(v) => sel.unseen = Some(*v),
                        _ => {}
                    }
                }
            }
            Untagged::Capability(caps) => {
                self.store_capabilities(caps.clone());
            }
            _ => {}
        }
        result.untagged.push(untagged);
    }

    /// Sends one command and reads to its tagged completion.
    pub(crate) async fn run(&mut self, command: String, collect_fetch: bool) -> Result<CommandResult> {
        let tag = self.next_tag();
        self.stream
            .write_command(format!("{tag} {command}\r\n").as_bytes())
            .await?;
        self.read_until_tagged(&tag, collect_fetch).await
    }

    /// Sends a command whose final argument is a literal: waits for
    /// the continuation, ships the payload, then reads completion.
    pub(crate) async fn run_with_literal(
        &mut self,
        command: String,
        literal: &[u8],
        collect_fetch: bool,
    ) -> Result<CommandResult> {
        let tag = self.next_tag();
        self.stream
            .write_command(format!("{tag} {command}\r\n").as_bytes())
            .await?;

        let mut result = CommandResult::default();
        loop {
            match self.read_parsed().await? {
                Response::Continuation { .. } => break,
                Response::Untagged(Untagged::Bye { text }) => return Err(Error::Bye(text)),
                Response::Untagged(untagged) => {
                    self.handle_untagged(untagged, &mut result, collect_fetch);
                }
                Response::Tagged { status, text, .. } if status == ImapStatus::No => {
                    return Err(Error::No(text));
                }
                Response::Tagged { text, .. } => return Err(Error::Bad(text)),
            }
        }

        self.stream.write_raw(literal).await?;
        self.stream.write_raw(b"\r\n").await?;
        let mut rest = self.read_until_tagged(&tag, collect_fetch).await?;
        rest.untagged.append(&mut result.untagged);
        rest.fetches.append(&mut result.fetches);
        Ok(rest)
    }

    async fn read_until_tagged(&mut self, tag: &str, collect_fetch: bool) -> Result<CommandResult> {
        let mut result = CommandResult::default();
        loop {
            match self.read_parsed().await? {
                Response::Untagged(Untagged::Bye { text }) => {
                    // LOGOUT legitimately answers with BYE then OK.
                    result.untagged.push(Untagged::Bye { text });
                }
                Response::Untagged(untagged) => {
                    self.handle_untagged(untagged, &mut result, collect_fetch);
                }
                Response::Continuation { .. } => {
                    return Err(Error::Protocol("unexpected continuation".to_string()));
                }
                Response::Tagged {
                    tag: got,
                    status,
                    code,
                    text,
                } => {
                    if got != tag {
                        return Err(Error::Protocol(format!(
                            "tag mismatch: expected {tag}, got {got}"
                        )));
                    }
                    return match status {
                        ImapStatus::Ok => {
                            result.code = code;
                            result.text = text;
                            Ok(result)
                        }
                        ImapStatus::No => Err(Error::No(text)),
                        ImapStatus::Bad => Err(Error::Bad(text)),
                        ImapStatus::Bye | ImapStatus::PreAuth => {
                            Err(Error::Protocol(format!("unexpected tagged {status:?}")))
                        }
                    };
                }
            }
        }
    }

    // === Commands ===

    /// Queries and stores the capability list.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn capability(&mut self) -> Result<()> {
        let result = self.run("CAPABILITY".to_string(), false).await?;
        for untagged in result.untagged {
            if let Untagged::Capability(caps) = untagged {
                self.store_capabilities(caps);
            }
        }
        Ok(())
    }

    /// Authenticates with SASL PLAIN.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] when the server refuses the credentials.
    pub async fn authenticate_plain(&mut self, user: &str, pass: &str) -> Result<()> {
        let payload = BASE64.encode(format!("\0{user}\0{pass}"));
        match self
            .run_with_literal_line("AUTHENTICATE PLAIN".to_string(), payload)
            .await
        {
            Ok(()) => Ok(()),
            Err(Error::No(text)) => Err(Error::Auth(text)),
            Err(e) => Err(e),
        }
    }

    /// Like [`Self::run_with_literal`] but the payload is a bare
    /// base64 line (SASL continuation), not a counted literal.
    async fn run_with_literal_line(&mut self, command: String, line: String) -> Result<()> {
        let tag = self.next_tag();
        self.stream
            .write_command(format!("{tag} {command}\r\n").as_bytes())
            .await?;
        loop {
            match self.read_parsed().await? {
                Response::Continuation { .. } => break,
                Response::Untagged(Untagged::Bye { text }) => return Err(Error::Bye(text)),
                Response::Untagged(_) => {}
                Response::Tagged { status, text, .. } => {
                    return Err(match status {
                        ImapStatus::No => Error::No(text),
                        _ => Error::Bad(text),
                    });
                }
            }
        }
        self.stream.write_raw(format!("{line}\r\n").as_bytes()).await?;
        self.read_until_tagged(&tag, false).await?;
        Ok(())
    }

    /// Selects a mailbox, read-only (EXAMINE) or read-write (SELECT).
    /// One combined size event is emitted after completion so the
    /// dispatcher sees the final counters.
    ///
    /// # Errors
    ///
    /// Returns an error if selection fails; no mailbox stays selected.
    pub async fn select(&mut self, dir: &str, read_only: bool) -> Result<DirStatus> {
        let verb = if read_only { "EXAMINE" } else { "SELECT" };
        self.selected = Some(SelectedState::new(dir, read_only));
        self.selecting = true;
        let outcome = self
            .run(format!("{verb} {}", quote_string(dir)), false)
            .await;
        self.selecting = false;

        match outcome {
            Ok(result) => {
                if let Some(sel) = &mut self.selected {
                    match result.code {
                        Some(ResponseCode::ReadOnly) => sel.read_only = true,
                        Some(ResponseCode::ReadWrite) => sel.read_only = false,
                        _ => {}
                    }
                }
                let status = self
                    .selected
                    .as_ref()
                    .map(SelectedState::to_status)
                    .unwrap_or_default();
                self.emit(RawEvent::MailboxSize {
                    status: status.clone(),
                });
                Ok(status)
            }
            Err(e) => {
                self.selected = None;
                Err(e)
            }
        }
    }

    /// Selects only when the current selection does not already
    /// satisfy the request: same mailbox, and read-write is acceptable
    /// for a read-only request.
    ///
    /// # Errors
    ///
    /// Returns an error if a needed selection fails.
    pub async fn ensure_selected(&mut self, dir: &str, read_only: bool) -> Result<DirStatus> {
        if let Some(sel) = &self.selected {
            if sel.name == dir && (!sel.read_only || read_only) {
                return Ok(sel.to_status());
            }
        }
        self.select(dir, read_only).await
    }

    /// Closes the selected mailbox (expunging `\Deleted` messages for
    /// a read-write selection).
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn close_mailbox(&mut self) -> Result<()> {
        if self.selected.is_none() {
            return Ok(());
        }
        self.run("CLOSE".to_string(), false).await?;
        self.selected = None;
        Ok(())
    }

    /// Lists all mailboxes. Returns the hierarchy delimiter (from the
    /// first row that carries one) and the raw names.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn list(&mut self) -> Result<(Option<char>, Vec<String>)> {
        let result = self.run("LIST \"\" \"*\"".to_string(), false).await?;
        let mut delimiter = None;
        let mut names = Vec::new();
        for untagged in result.untagged {
            if let Untagged::List {
                delimiter: d, name, ..
            } = untagged
            {
                if delimiter.is_none() {
                    delimiter = d;
                }
                names.push(name);
            }
        }
        Ok((delimiter, names))
    }

    /// Queries STATUS counters without selecting the mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn status(&mut self, dir: &str) -> Result<DirStatus> {
        let result = self
            .run(
                format!(
                    "STATUS {} (MESSAGES RECENT UNSEEN UIDVALIDITY UIDNEXT)",
                    quote_string(dir)
                ),
                false,
            )
            .await?;
        for untagged in result.untagged {
            if let Untagged::Status {
                mailbox,
                messages,
                unseen,
                uidvalidity,
                uidnext,
                ..
            } = untagged
            {
                return Ok(DirStatus {
                    name: mailbox,
                    messages: messages.unwrap_or(0),
                    unseen,
                    uidvalidity,
                    uidnext,
                });
            }
        }
        Err(Error::Protocol("STATUS returned no data".to_string()))
    }

    /// Fetches `items` for a sequence-number range.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn fetch_range(
        &mut self,
        first: u32,
        last: u32,
        items: &str,
    ) -> Result<Vec<(u32, Vec<FetchItem>)>> {
        let result = self
            .run(format!("FETCH {first}:{last} {items}"), true)
            .await?;
        Ok(result.fetches)
    }

    /// Fetches `items` for a UID set.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn uid_fetch(
        &mut self,
        uids: &[u32],
        items: &str,
    ) -> Result<Vec<(u32, Vec<FetchItem>)>> {
        let result = self
            .run(format!("UID FETCH {} {items}", uid_set(uids)), true)
            .await?;
        Ok(result.fetches)
    }

    /// Adds or removes flags on a UID set (silent store).
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn uid_store(&mut self, uids: &[u32], add: bool, flags: &[String]) -> Result<()> {
        let op = if add { "+FLAGS.SILENT" } else { "-FLAGS.SILENT" };
        self.run(
            format!("UID STORE {} {op} ({})", uid_set(uids), flags.join(" ")),
            false,
        )
        .await?;
        Ok(())
    }

    /// Copies a UID set into another mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn uid_copy(&mut self, uids: &[u32], target: &str) -> Result<()> {
        self.run(
            format!("UID COPY {} {}", uid_set(uids), quote_string(target)),
            false,
        )
        .await?;
        Ok(())
    }

    /// Moves a UID set with the MOVE extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn uid_move(&mut self, uids: &[u32], target: &str) -> Result<()> {
        self.run(
            format!("UID MOVE {} {}", uid_set(uids), quote_string(target)),
            false,
        )
        .await?;
        Ok(())
    }

    /// Expunges messages flagged `\Deleted` in the selected mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn expunge(&mut self) -> Result<()> {
        self.run("EXPUNGE".to_string(), false).await?;
        Ok(())
    }

    /// UID SEARCH with a raw criteria string.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn uid_search(&mut self, criteria: &str) -> Result<Vec<u32>> {
        let result = self.run(format!("UID SEARCH {criteria}"), false).await?;
        let mut uids = Vec::new();
        for untagged in result.untagged {
            if let Untagged::Search(mut hits) = untagged {
                uids.append(&mut hits);
            }
        }
        Ok(uids)
    }

    /// APPENDs a message. Returns the new UID from APPENDUID when the
    /// server implements UIDPLUS.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn append(
        &mut self,
        dir: &str,
        flags: &[String],
        date: DateTime<Utc>,
        body: &[u8],
    ) -> Result<Option<u32>> {
        let command = format!(
            "APPEND {} ({}) {} {{{}}}",
            quote_string(dir),
            flags.join(" "),
            quote_string(&date.format("%d-%b-%Y %H:%M:%S +0000").to_string()),
            body.len()
        );
        let result = self.run_with_literal(command, body, false).await?;
        match result.code {
            Some(ResponseCode::AppendUid(_, uid)) => Ok(Some(uid)),
            _ => Ok(None),
        }
    }

    /// NOOP keep-alive; any pending untagged updates ride along.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn noop(&mut self) -> Result<()> {
        self.run("NOOP".to_string(), false).await?;
        Ok(())
    }

    /// Creates a mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn create(&mut self, dir: &str) -> Result<()> {
        self.run(format!("CREATE {}", quote_string(dir)), false)
            .await?;
        Ok(())
    }

    /// Renames a mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.run(
            format!("RENAME {} {}", quote_string(from), quote_string(to)),
            false,
        )
        .await?;
        Ok(())
    }

    /// Deletes a mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn delete(&mut self, dir: &str) -> Result<()> {
        self.run(format!("DELETE {}", quote_string(dir)), false)
            .await?;
        Ok(())
    }

    /// Logs out. The server answers BYE followed by the tagged OK.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn logout(&mut self) -> Result<()> {
        self.run("LOGOUT".to_string(), false).await?;
        Ok(())
    }

    // === IDLE ===

    /// Enters IDLE. The server holds the connection open and streams
    /// untagged updates until DONE.
    ///
    /// # Errors
    ///
    /// Returns an error if the server rejects IDLE.
    pub async fn idle_start(&mut self) -> Result<()> {
        let tag = self.next_tag();
        self.stream
            .write_command(format!("{tag} IDLE\r\n").as_bytes())
            .await?;
        loop {
            match self.read_parsed().await? {
                Response::Continuation { .. } => {
                    self.idle_tag = Some(tag);
                    return Ok(());
                }
                Response::Untagged(untagged) => {
                    let mut scratch = CommandResult::default();
                    self.handle_untagged(untagged, &mut scratch, false);
                }
                Response::Tagged { status, text, .. } => {
                    return Err(match status {
                        ImapStatus::No => Error::No(text),
                        _ => Error::Bad(text),
                    });
                }
            }
        }
    }

    /// Waits for one IDLE update, a heartbeat timeout, or server-side
    /// termination. Updates are dispatched to the event sink.
    pub(crate) async fn idle_wait(&mut self, heartbeat: Duration) -> Result<IdleWait> {
        let raw = match timeout(heartbeat, self.stream.read_response()).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(IdleWait::Heartbeat),
        };
        match parse_response(&raw)? {
            Response::Untagged(Untagged::Bye { text }) => Err(Error::Bye(text)),
            Response::Untagged(untagged) => {
                let mut scratch = CommandResult::default();
                self.handle_untagged(untagged, &mut scratch, false);
                Ok(IdleWait::Event)
            }
            Response::Tagged { tag, .. } if Some(&tag) == self.idle_tag.as_ref() => {
                self.idle_tag = None;
                Ok(IdleWait::Ended)
            }
            other => Err(Error::Protocol(format!(
                "unexpected response during IDLE: {other:?}"
            ))),
        }
    }

    /// Leaves IDLE: sends DONE and drains to the tagged completion.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails mid-drain.
    pub async fn idle_done(&mut self) -> Result<()> {
        let Some(tag) = self.idle_tag.take() else {
            return Ok(());
        };
        self.stream.write_raw(b"DONE\r\n").await?;
        loop {
            let raw = self.stream.read_response().await?;
            // The interrupt can race a partially-delivered update;
            // skip anything unparseable while draining.
            match parse_response(&raw) {
                Ok(Response::Tagged { tag: got, .. }) if got == tag => return Ok(()),
                Ok(Response::Untagged(untagged)) => {
                    let mut scratch = CommandResult::default();
                    self.handle_untagged(untagged, &mut scratch, false);
                }
                Ok(_) | Err(_) => {}
            }
        }
    }
}

/// Formats a quoted IMAP string.
fn quote_string(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Formats a UID set as a comma-separated list.
fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    const GREETING: &[u8] = b"* OK [CAPABILITY IMAP4rev1 IDLE UIDPLUS MOVE] ready\r\n";

    async fn connected(mock: tokio_test::io::Mock) -> ImapConnection<tokio_test::io::Mock> {
        ImapConnection::from_stream(mock, Duration::from_secs(30))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn greeting_capabilities_are_stored() {
        let mock = tokio_test::io::Builder::new().read(GREETING).build();
        let conn = connected(mock).await;
        assert!(conn.has_capability("IDLE"));
        assert!(conn.has_capability("uidplus"));
        assert!(!conn.has_capability("XLIST"));
    }

    #[tokio::test]
    async fn greeting_without_caps_triggers_capability_command() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"A001 CAPABILITY\r\n")
            .read(b"* CAPABILITY IMAP4rev1 IDLE\r\nA001 OK done\r\n")
            .build();
        let conn = connected(mock).await;
        assert!(conn.has_capability("IDLE"));
    }

    #[tokio::test]
    async fn bye_greeting_is_error() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* BYE overloaded\r\n")
            .build();
        let err = ImapConnection::from_stream(mock, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Bye(_)));
    }

    #[tokio::test]
    async fn authenticate_plain_flow() {
        let mock = tokio_test::io::Builder::new()
            .read(GREETING)
            .write(b"A001 AUTHENTICATE PLAIN\r\n")
            .read(b"+ \r\n")
            .write(b"AHVzZXIAcGFzcw==\r\n")
            .read(b"A001 OK authenticated\r\n")
            .build();
        let mut conn = connected(mock).await;
        conn.authenticate_plain("user", "pass").await.unwrap();
    }

    #[tokio::test]
    async fn authenticate_refusal_maps_to_auth_error() {
        let mock = tokio_test::io::Builder::new()
            .read(GREETING)
            .write(b"A001 AUTHENTICATE PLAIN\r\n")
            .read(b"+ \r\n")
            .write(b"AHVzZXIAYmFk\r\n")
            .read(b"A001 NO [AUTHENTICATIONFAILED] bad credentials\r\n")
            .build();
        let mut conn = connected(mock).await;
        let err = conn.authenticate_plain("user", "bad").await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn select_parses_counters() {
        let mock = tokio_test::io::Builder::new()
            .read(GREETING)
            .write(b"A001 SELECT \"INBOX\"\r\n")
            .read(
                b"* 3 EXISTS\r\n* 0 RECENT\r\n* OK [UIDVALIDITY 100] ok\r\n\
                  * OK [UIDNEXT 44] ok\r\n* OK [UNSEEN 2] ok\r\n\
                  A001 OK [READ-WRITE] SELECT completed\r\n",
            )
            .build();
        let mut conn = connected(mock).await;
        let status = conn.select("INBOX", false).await.unwrap();
        assert_eq!(status.messages, 3);
        assert_eq!(status.uidvalidity, Some(100));
        assert_eq!(status.uidnext, Some(44));
        assert_eq!(status.unseen, Some(2));
        assert!(!conn.selected().unwrap().read_only);
    }

    #[tokio::test]
    async fn ensure_selected_is_idempotent() {
        let mock = tokio_test::io::Builder::new()
            .read(GREETING)
            .write(b"A001 SELECT \"INBOX\"\r\n")
            .read(b"* 1 EXISTS\r\nA001 OK [READ-WRITE] done\r\n")
            .build();
        let mut conn = connected(mock).await;
        conn.select("INBOX", false).await.unwrap();
        // Read-write selection satisfies a read-only request with no
        // further traffic (the mock would fail on any extra write).
        let status = conn.ensure_selected("INBOX", true).await.unwrap();
        assert_eq!(status.messages, 1);
    }

    #[tokio::test]
    async fn select_failure_clears_selection() {
        let mock = tokio_test::io::Builder::new()
            .read(GREETING)
            .write(b"A001 SELECT \"nope\"\r\n")
            .read(b"A001 NO no such mailbox\r\n")
            .build();
        let mut conn = connected(mock).await;
        assert!(matches!(
            conn.select("nope", false).await.unwrap_err(),
            Error::No(_)
        ));
        assert!(conn.selected().is_none());
    }

    #[tokio::test]
    async fn list_returns_delimiter_and_names() {
        let mock = tokio_test::io::Builder::new()
            .read(GREETING)
            .write(b"A001 LIST \"\" \"*\"\r\n")
            .read(
                b"* LIST (\\HasNoChildren) \"/\" \"INBOX\"\r\n\
                  * LIST (\\HasChildren) \"/\" \"Archive/2026\"\r\n\
                  A001 OK done\r\n",
            )
            .build();
        let mut conn = connected(mock).await;
        let (delim, names) = conn.list().await.unwrap();
        assert_eq!(delim, Some('/'));
        assert_eq!(names, vec!["INBOX", "Archive/2026"]);
    }

    #[tokio::test]
    async fn status_parses_counts() {
        let mock = tokio_test::io::Builder::new()
            .read(GREETING)
            .write(b"A001 STATUS \"INBOX\" (MESSAGES RECENT UNSEEN UIDVALIDITY UIDNEXT)\r\n")
            .read(b"* STATUS INBOX (MESSAGES 3 UNSEEN 1 UIDVALIDITY 100)\r\nA001 OK done\r\n")
            .build();
        let mut conn = connected(mock).await;
        let status = conn.status("INBOX").await.unwrap();
        assert_eq!(status.messages, 3);
        assert_eq!(status.unseen, Some(1));
        assert_eq!(status.uidvalidity, Some(100));
    }

    #[tokio::test]
    async fn fetch_collects_items_without_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mock = tokio_test::io::Builder::new()
            .read(GREETING)
            .write(b"A001 SELECT \"INBOX\"\r\n")
            .read(b"* 2 EXISTS\r\nA001 OK [READ-WRITE] done\r\n")
            .write(b"A002 FETCH 1:2 (UID FLAGS ENVELOPE)\r\n")
            .read(
                b"* 1 FETCH (UID 7 FLAGS (\\Seen) ENVELOPE (NIL \"a\" NIL NIL NIL NIL NIL NIL NIL NIL))\r\n\
                  * 2 FETCH (UID 9 FLAGS () ENVELOPE (NIL \"b\" NIL NIL NIL NIL NIL NIL NIL NIL))\r\n\
                  A002 OK done\r\n",
            )
            .build();
        let mut conn = connected(mock).await;
        conn.set_event_sink(tx);
        conn.select("INBOX", false).await.unwrap();
        // Drain the selection event.
        assert!(rx.try_recv().is_ok());

        let fetched = conn.fetch_range(1, 2, "(UID FLAGS ENVELOPE)").await.unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].0, 1);
        assert!(fetched[0].1.contains(&FetchItem::Uid(7)));
        // Command-data FETCH rows do not become events.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsolicited_exists_becomes_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mock = tokio_test::io::Builder::new()
            .read(GREETING)
            .write(b"A001 SELECT \"INBOX\"\r\n")
            .read(b"* 3 EXISTS\r\nA001 OK [READ-WRITE] done\r\n")
            .write(b"A002 NOOP\r\n")
            .read(b"* 4 EXISTS\r\nA002 OK done\r\n")
            .build();
        let mut conn = connected(mock).await;
        conn.set_event_sink(tx);
        conn.select("INBOX", false).await.unwrap();
        let RawEvent::MailboxSize { status } = rx.try_recv().unwrap() else {
            panic!("expected size event");
        };
        assert_eq!(status.messages, 3);

        conn.noop().await.unwrap();
        let RawEvent::MailboxSize { status } = rx.try_recv().unwrap() else {
            panic!("expected size event");
        };
        assert_eq!(status.messages, 4);
    }

    #[tokio::test]
    async fn append_returns_appenduid() {
        let mock = tokio_test::io::Builder::new()
            .read(GREETING)
            .write(b"A001 APPEND \"Drafts\" (\\Draft) \"01-Feb-2026 00:00:00 +0000\" {5}\r\n")
            .read(b"+ go ahead\r\n")
            .write(b"hello")
            .write(b"\r\n")
            .read(b"A001 OK [APPENDUID 100 42] done\r\n")
            .build();
        let mut conn = connected(mock).await;
        let date = chrono::NaiveDate::from_ymd_opt(2026, 2, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        let uid = conn
            .append("Drafts", &["\\Draft".to_string()], date, b"hello")
            .await
            .unwrap();
        assert_eq!(uid, Some(42));
    }

    #[tokio::test]
    async fn append_failure_surfaces_no() {
        let mock = tokio_test::io::Builder::new()
            .read(GREETING)
            .write(b"A001 APPEND \"Drafts\" (\\Draft) \"01-Feb-2026 00:00:00 +0000\" {5}\r\n")
            .read(b"A001 NO quota exceeded\r\n")
            .build();
        let mut conn = connected(mock).await;
        let date = chrono::NaiveDate::from_ymd_opt(2026, 2, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        let err = conn
            .append("Drafts", &["\\Draft".to_string()], date, b"hello")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::No(_)));
    }

    #[tokio::test]
    async fn uid_search_collects_hits() {
        let mock = tokio_test::io::Builder::new()
            .read(GREETING)
            .write(b"A001 UID SEARCH ALL\r\n")
            .read(b"* SEARCH 4 9 44\r\nA001 OK done\r\n")
            .build();
        let mut conn = connected(mock).await;
        assert_eq!(conn.uid_search("ALL").await.unwrap(), vec![4, 9, 44]);
    }

    #[tokio::test]
    async fn idle_flow_with_event_and_done() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mock = tokio_test::io::Builder::new()
            .read(GREETING)
            .write(b"A001 SELECT \"INBOX\"\r\n")
            .read(b"* 3 EXISTS\r\nA001 OK [READ-WRITE] done\r\n")
            .write(b"A002 IDLE\r\n")
            .read(b"+ idling\r\n")
            .read(b"* 4 EXISTS\r\n")
            .write(b"DONE\r\n")
            .read(b"A002 OK IDLE terminated\r\n")
            .build();
        let mut conn = connected(mock).await;
        conn.set_event_sink(tx);
        conn.select("INBOX", false).await.unwrap();
        let _ = rx.try_recv();

        conn.idle_start().await.unwrap();
        let outcome = conn.idle_wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, IdleWait::Event);
        let RawEvent::MailboxSize { status } = rx.try_recv().unwrap() else {
            panic!("expected size event");
        };
        assert_eq!(status.messages, 4);

        conn.idle_done().await.unwrap();
    }

    #[test]
    fn uid_set_formatting() {
        assert_eq!(uid_set(&[1]), "1");
        assert_eq!(uid_set(&[1, 5, 9]), "1,5,9");
    }

    #[test]
    fn quoting() {
        assert_eq!(quote_string("INBOX"), "\"INBOX\"");
        assert_eq!(quote_string("a\"b"), "\"a\\\"b\"");
    }
}
