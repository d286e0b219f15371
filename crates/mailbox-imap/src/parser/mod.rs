//! Sans-I/O IMAP response parser.
//!
//! Operates on one complete response (a line plus any literals it
//! carries, as framed by the connection layer) and produces a
//! [`Response`]. Network I/O never happens here.

mod fetch;

pub use fetch::{Address, BodyStructure, Envelope, FetchItem};

use crate::{Error, Result};

/// Command completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImapStatus {
    /// Success.
    Ok,
    /// Operational refusal.
    No,
    /// Protocol-level rejection.
    Bad,
    /// Greeting for a pre-authenticated connection.
    PreAuth,
    /// Server is closing the connection.
    Bye,
}

/// A bracketed response code such as `[UIDVALIDITY 123]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCode {
    /// UIDVALIDITY epoch of the selected mailbox.
    UidValidity(u32),
    /// Predicted next UID.
    UidNext(u32),
    /// First unseen sequence number.
    Unseen(u32),
    /// UIDPLUS result of APPEND: `(uidvalidity, uid)`.
    AppendUid(u32, u32),
    /// Mailbox selected read-only.
    ReadOnly,
    /// Mailbox selected read-write.
    ReadWrite,
    /// Capability list embedded in a status response.
    Capability(Vec<String>),
    /// Flags that can be changed permanently.
    PermanentFlags(Vec<String>),
    /// Any code this client does not interpret.
    Other(String),
}

/// One untagged server response.
#[derive(Debug, Clone, PartialEq)]
pub enum Untagged {
    /// `* OK [code] text` — condition, often carrying a code.
    Ok {
        /// Optional response code.
        code: Option<ResponseCode>,
        /// Human-readable text.
        text: String,
    },
    /// `* NO text`.
    No {
        /// Optional response code.
        code: Option<ResponseCode>,
        /// Human-readable text.
        text: String,
    },
    /// `* BAD text`.
    Bad {
        /// Optional response code.
        code: Option<ResponseCode>,
        /// Human-readable text.
        text: String,
    },
    /// `* BYE text`.
    Bye {
        /// Human-readable text.
        text: String,
    },
    /// `* PREAUTH text`.
    PreAuth {
        /// Human-readable text.
        text: String,
    },
    /// `* CAPABILITY ...`.
    Capability(Vec<String>),
    /// `* FLAGS (...)` for the selected mailbox.
    Flags(Vec<String>),
    /// One `* LIST (attrs) delim name` row.
    List {
        /// Mailbox attributes such as `\Noselect`.
        attributes: Vec<String>,
        /// Hierarchy delimiter, `None` for a flat namespace.
        delimiter: Option<char>,
        /// Raw mailbox name.
        name: String,
    },
    /// `* STATUS name (...)`.
    Status {
        /// Raw mailbox name.
        mailbox: String,
        /// MESSAGES count.
        messages: Option<u32>,
        /// UNSEEN count.
        unseen: Option<u32>,
        /// RECENT count.
        recent: Option<u32>,
        /// UIDVALIDITY epoch.
        uidvalidity: Option<u32>,
        /// UIDNEXT prediction.
        uidnext: Option<u32>,
    },
    /// `* SEARCH n n n ...`.
    Search(Vec<u32>),
    /// `* n EXISTS`.
    Exists(u32),
    /// `* n RECENT`.
    Recent(u32),
    /// `* n EXPUNGE`.
    Expunge(u32),
    /// `* n FETCH (...)`.
    Fetch {
        /// Message sequence number.
        seq: u32,
        /// Fetched data items.
        items: Vec<FetchItem>,
    },
}

/// A parsed IMAP response.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Command completion.
    Tagged {
        /// The command tag.
        tag: String,
        /// Completion status.
        status: ImapStatus,
        /// Optional response code.
        code: Option<ResponseCode>,
        /// Human-readable text.
        text: String,
    },
    /// Server data or status.
    Untagged(Untagged),
    /// Continuation request (`+ ...`).
    Continuation {
        /// Text after the `+`.
        text: String,
    },
}

/// Parses one complete response.
///
/// # Errors
///
/// Returns [`Error::Parse`] on malformed input.
pub fn parse_response(input: &[u8]) -> Result<Response> {
    let mut cur = Cursor::new(input);

    match cur.peek() {
        Some(b'+') => {
            cur.advance();
            if cur.peek() == Some(b' ') {
                cur.advance();
            }
            Ok(Response::Continuation {
                text: cur.rest_of_line(),
            })
        }
        Some(b'*') => {
            cur.advance();
            cur.expect_space()?;
            parse_untagged(&mut cur).map(Response::Untagged)
        }
        Some(_) => {
            let tag = cur.read_atom()?.to_string();
            cur.expect_space()?;
            let status = parse_status(&mut cur)?;
            let (code, text) = parse_resp_text(&mut cur)?;
            Ok(Response::Tagged {
                tag,
                status,
                code,
                text,
            })
        }
        None => Err(cur.error("empty response")),
    }
}

fn parse_untagged(cur: &mut Cursor<'_>) -> Result<Untagged> {
    if cur.peek().is_some_and(|b| b.is_ascii_digit()) {
        let n = cur.read_number()?;
        cur.expect_space()?;
        let keyword = cur.read_atom()?.to_ascii_uppercase();
        return match keyword.as_str() {
            "EXISTS" => Ok(Untagged::Exists(n)),
            "RECENT" => Ok(Untagged::Recent(n)),
            "EXPUNGE" => Ok(Untagged::Expunge(n)),
            "FETCH" => {
                cur.expect_space()?;
                let items = fetch::parse_fetch_items(cur)?;
                Ok(Untagged::Fetch { seq: n, items })
            }
            other => Err(cur.error(&format!("unknown message data: {other}"))),
        };
    }

    let keyword = cur.read_atom()?.to_ascii_uppercase();
    match keyword.as_str() {
        "OK" => {
            let (code, text) = parse_resp_text(cur)?;
            Ok(Untagged::Ok { code, text })
        }
        "NO" => {
            let (code, text) = parse_resp_text(cur)?;
            Ok(Untagged::No { code, text })
        }
        "BAD" => {
            let (code, text) = parse_resp_text(cur)?;
            Ok(Untagged::Bad { code, text })
        }
        "BYE" => {
            let (_, text) = parse_resp_text(cur)?;
            Ok(Untagged::Bye { text })
        }
        "PREAUTH" => {
            let (_, text) = parse_resp_text(cur)?;
            Ok(Untagged::PreAuth { text })
        }
        "CAPABILITY" => {
            let mut caps = Vec::new();
            while cur.skip_space() {
                caps.push(cur.read_atom()?.to_string());
            }
            Ok(Untagged::Capability(caps))
        }
        "FLAGS" => {
            cur.expect_space()?;
            Ok(Untagged::Flags(parse_atom_list(cur)?))
        }
        "LIST" | "LSUB" => {
            cur.expect_space()?;
            parse_list_row(cur)
        }
        "STATUS" => {
            cur.expect_space()?;
            parse_status_row(cur)
        }
        "SEARCH" => {
            let mut hits = Vec::new();
            while cur.skip_space() {
                hits.push(cur.read_number()?);
            }
            Ok(Untagged::Search(hits))
        }
        other => Err(cur.error(&format!("unknown untagged response: {other}"))),
    }
}

fn parse_status(cur: &mut Cursor<'_>) -> Result<ImapStatus> {
    let s = cur.read_atom()?.to_ascii_uppercase();
    match s.as_str() {
        "OK" => Ok(ImapStatus::Ok),
        "NO" => Ok(ImapStatus::No),
        "BAD" => Ok(ImapStatus::Bad),
        "PREAUTH" => Ok(ImapStatus::PreAuth),
        "BYE" => Ok(ImapStatus::Bye),
        other => Err(cur.error(&format!("invalid status: {other}"))),
    }
}

/// Parses `[code] text` after a status keyword. The leading space is
/// consumed here so empty text is tolerated.
fn parse_resp_text(cur: &mut Cursor<'_>) -> Result<(Option<ResponseCode>, String)> {
    cur.skip_space();
    let code = if cur.peek() == Some(b'[') {
        Some(parse_response_code(cur)?)
    } else {
        None
    };
    cur.skip_space();
    Ok((code, cur.rest_of_line()))
}

fn parse_response_code(cur: &mut Cursor<'_>) -> Result<ResponseCode> {
    cur.advance(); // '['
    let name = cur.read_atom()?.to_ascii_uppercase();
    let code = match name.as_str() {
        "UIDVALIDITY" => {
            cur.expect_space()?;
            ResponseCode::UidValidity(cur.read_number()?)
        }
        "UIDNEXT" => {
            cur.expect_space()?;
            ResponseCode::UidNext(cur.read_number()?)
        }
        "UNSEEN" => {
            cur.expect_space()?;
            ResponseCode::Unseen(cur.read_number()?)
        }
        "APPENDUID" => {
            cur.expect_space()?;
            let validity = cur.read_number()?;
            cur.expect_space()?;
            ResponseCode::AppendUid(validity, cur.read_number()?)
        }
        "READ-ONLY" => ResponseCode::ReadOnly,
        "READ-WRITE" => ResponseCode::ReadWrite,
        "CAPABILITY" => {
            let mut caps = Vec::new();
            while cur.skip_space() {
                if cur.peek() == Some(b']') {
                    break;
                }
                caps.push(cur.read_atom()?.to_string());
            }
            ResponseCode::Capability(caps)
        }
        "PERMANENTFLAGS" => {
            cur.expect_space()?;
            ResponseCode::PermanentFlags(parse_atom_list(cur)?)
        }
        _ => {
            // Consume any arguments of an uninterpreted code.
            let mut rest = name.clone();
            while cur.peek().is_some_and(|b| b != b']') {
                rest.push(cur.advance().unwrap_or(b']') as char);
            }
            ResponseCode::Other(rest)
        }
    };
    if cur.peek() == Some(b']') {
        cur.advance();
    } else {
        return Err(cur.error("unterminated response code"));
    }
    Ok(code)
}

/// Parses `(atom atom ...)`.
fn parse_atom_list(cur: &mut Cursor<'_>) -> Result<Vec<String>> {
    cur.expect(b'(')?;
    let mut items = Vec::new();
    loop {
        cur.skip_space();
        if cur.peek() == Some(b')') {
            cur.advance();
            return Ok(items);
        }
        items.push(cur.read_atom()?.to_string());
    }
}

fn parse_list_row(cur: &mut Cursor<'_>) -> Result<Untagged> {
    let attributes = parse_atom_list(cur)?;
    cur.expect_space()?;
    let delimiter = match cur.read_nstring()? {
        Some(bytes) => String::from_utf8_lossy(&bytes).chars().next(),
        None => None,
    };
    cur.expect_space()?;
    let name = cur.read_astring()?;
    Ok(Untagged::List {
        attributes,
        delimiter,
        name,
    })
}

fn parse_status_row(cur: &mut Cursor<'_>) -> Result<Untagged> {
    let mailbox = cur.read_astring()?;
    cur.expect_space()?;
    cur.expect(b'(')?;

    let mut messages = None;
    let mut unseen = None;
    let mut recent = None;
    let mut uidvalidity = None;
    let mut uidnext = None;

    loop {
        cur.skip_space();
        if cur.peek() == Some(b')') {
            cur.advance();
            break;
        }
        let item = cur.read_atom()?.to_ascii_uppercase();
        cur.expect_space()?;
        let value = cur.read_number()?;
        match item.as_str() {
            "MESSAGES" => messages = Some(value),
            "UNSEEN" => unseen = Some(value),
            "RECENT" => recent = Some(value),
            "UIDVALIDITY" => uidvalidity = Some(value),
            "UIDNEXT" => uidnext = Some(value),
            _ => {}
        }
    }

    Ok(Untagged::Status {
        mailbox,
        messages,
        unseen,
        recent,
        uidvalidity,
        uidnext,
    })
}

/// Byte cursor over one response, shared with the fetch-item parser.
pub(crate) struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) const fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    pub(crate) fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    pub(crate) fn advance(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    pub(crate) fn error(&self, message: &str) -> Error {
        Error::Parse {
            position: self.pos,
            message: message.to_string(),
        }
    }

    pub(crate) fn expect(&mut self, byte: u8) -> Result<()> {
        if self.peek() == Some(byte) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(&format!("expected {:?}", byte as char)))
        }
    }

    pub(crate) fn expect_space(&mut self) -> Result<()> {
        self.expect(b' ')
    }

    /// Consumes one space if present; returns whether it did.
    pub(crate) fn skip_space(&mut self) -> bool {
        if self.peek() == Some(b' ') {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Everything up to the trailing CRLF (or end of input).
    pub(crate) fn rest_of_line(&mut self) -> String {
        let start = self.pos;
        while self.peek().is_some_and(|b| b != b'\r' && b != b'\n') {
            self.advance();
        }
        String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()
    }

    /// Reads an atom: bytes up to a delimiter. Backslash-prefixed
    /// flags and dotted names are atoms too.
    pub(crate) fn read_atom(&mut self) -> Result<&'a str> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| !matches!(b, b' ' | b'(' | b')' | b'"' | b'{' | b']' | b'\r' | b'\n'))
        {
            self.advance();
        }
        if self.pos == start {
            return Err(self.error("expected atom"));
        }
        std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| self.error("atom is not valid UTF-8"))
    }

    pub(crate) fn read_number(&mut self) -> Result<u32> {
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.advance();
        }
        if self.pos == start {
            return Err(self.error("expected number"));
        }
        std::str::from_utf8(&self.input[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.error("number out of range"))
    }

    /// Reads a quoted string, unescaping `\"` and `\\`.
    pub(crate) fn read_quoted(&mut self) -> Result<Vec<u8>> {
        self.expect(b'"')?;
        let mut out = Vec::new();
        loop {
            match self.advance() {
                Some(b'"') => return Ok(out),
                Some(b'\\') => match self.advance() {
                    Some(b @ (b'"' | b'\\')) => out.push(b),
                    _ => return Err(self.error("invalid escape in quoted string")),
                },
                Some(b) => out.push(b),
                None => return Err(self.error("unterminated quoted string")),
            }
        }
    }

    /// Reads a literal: `{n}` CRLF followed by `n` bytes.
    pub(crate) fn read_literal(&mut self) -> Result<&'a [u8]> {
        self.expect(b'{')?;
        let len = self.read_number()? as usize;
        // Tolerate non-synchronizing literals.
        if self.peek() == Some(b'+') {
            self.advance();
        }
        self.expect(b'}')?;
        self.expect(b'\r')?;
        self.expect(b'\n')?;
        if self.pos + len > self.input.len() {
            return Err(self.error("literal runs past end of response"));
        }
        let data = &self.input[self.pos..self.pos + len];
        self.pos += len;
        Ok(data)
    }

    /// Reads a string (quoted or literal).
    pub(crate) fn read_string(&mut self) -> Result<Vec<u8>> {
        match self.peek() {
            Some(b'"') => self.read_quoted(),
            Some(b'{') => self.read_literal().map(<[u8]>::to_vec),
            _ => Err(self.error("expected string")),
        }
    }

    /// Reads an nstring: NIL or a string.
    pub(crate) fn read_nstring(&mut self) -> Result<Option<Vec<u8>>> {
        match self.peek() {
            Some(b'"' | b'{') => self.read_string().map(Some),
            _ => {
                let atom = self.read_atom()?;
                if atom.eq_ignore_ascii_case("NIL") {
                    Ok(None)
                } else {
                    Err(self.error("expected NIL or string"))
                }
            }
        }
    }

    /// Reads an astring: an atom or a string. Used for mailbox names.
    pub(crate) fn read_astring(&mut self) -> Result<String> {
        match self.peek() {
            Some(b'"' | b'{') => Ok(String::from_utf8_lossy(&self.read_string()?).into_owned()),
            _ => Ok(self.read_atom()?.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_greeting() {
        let r = parse_response(b"* OK IMAP4rev1 server ready\r\n").unwrap();
        assert_eq!(
            r,
            Response::Untagged(Untagged::Ok {
                code: None,
                text: "IMAP4rev1 server ready".to_string()
            })
        );
    }

    #[test]
    fn parse_tagged_ok() {
        let r = parse_response(b"A001 OK LOGIN completed\r\n").unwrap();
        match r {
            Response::Tagged {
                tag, status, text, ..
            } => {
                assert_eq!(tag, "A001");
                assert_eq!(status, ImapStatus::Ok);
                assert_eq!(text, "LOGIN completed");
            }
            other => panic!("expected tagged, got {other:?}"),
        }
    }

    #[test]
    fn parse_tagged_no_with_code() {
        let r = parse_response(b"A2 NO [TRYCREATE] no such mailbox\r\n").unwrap();
        match r {
            Response::Tagged { status, code, .. } => {
                assert_eq!(status, ImapStatus::No);
                assert_eq!(code, Some(ResponseCode::Other("TRYCREATE".to_string())));
            }
            other => panic!("expected tagged, got {other:?}"),
        }
    }

    #[test]
    fn parse_capability() {
        let r = parse_response(b"* CAPABILITY IMAP4rev1 IDLE UIDPLUS MOVE\r\n").unwrap();
        let Response::Untagged(Untagged::Capability(caps)) = r else {
            panic!("expected capability");
        };
        assert_eq!(caps, vec!["IMAP4rev1", "IDLE", "UIDPLUS", "MOVE"]);
    }

    #[test]
    fn parse_exists_and_expunge() {
        assert_eq!(
            parse_response(b"* 23 EXISTS\r\n").unwrap(),
            Response::Untagged(Untagged::Exists(23))
        );
        assert_eq!(
            parse_response(b"* 4 EXPUNGE\r\n").unwrap(),
            Response::Untagged(Untagged::Expunge(4))
        );
    }

    #[test]
    fn parse_list_with_quoted_delimiter() {
        let r = parse_response(b"* LIST (\\HasChildren) \"/\" \"Archive/2026\"\r\n").unwrap();
        let Response::Untagged(Untagged::List {
            attributes,
            delimiter,
            name,
        }) = r
        else {
            panic!("expected list");
        };
        assert_eq!(attributes, vec!["\\HasChildren"]);
        assert_eq!(delimiter, Some('/'));
        assert_eq!(name, "Archive/2026");
    }

    #[test]
    fn parse_list_nil_delimiter() {
        let r = parse_response(b"* LIST () NIL INBOX\r\n").unwrap();
        let Response::Untagged(Untagged::List {
            delimiter, name, ..
        }) = r
        else {
            panic!("expected list");
        };
        assert_eq!(delimiter, None);
        assert_eq!(name, "INBOX");
    }

    #[test]
    fn parse_status_row_items() {
        let r = parse_response(
            b"* STATUS INBOX (MESSAGES 3 UNSEEN 1 UIDVALIDITY 100 UIDNEXT 44)\r\n",
        )
        .unwrap();
        let Response::Untagged(Untagged::Status {
            mailbox,
            messages,
            unseen,
            uidvalidity,
            uidnext,
            ..
        }) = r
        else {
            panic!("expected status");
        };
        assert_eq!(mailbox, "INBOX");
        assert_eq!(messages, Some(3));
        assert_eq!(unseen, Some(1));
        assert_eq!(uidvalidity, Some(100));
        assert_eq!(uidnext, Some(44));
    }

    #[test]
    fn parse_search_hits() {
        let r = parse_response(b"* SEARCH 2 5 44\r\n").unwrap();
        assert_eq!(
            r,
            Response::Untagged(Untagged::Search(vec![2, 5, 44]))
        );
        let r = parse_response(b"* SEARCH\r\n").unwrap();
        assert_eq!(r, Response::Untagged(Untagged::Search(vec![])));
    }

    #[test]
    fn parse_select_codes() {
        let r = parse_response(b"* OK [UIDVALIDITY 1234567890] UIDs valid\r\n").unwrap();
        let Response::Untagged(Untagged::Ok { code, .. }) = r else {
            panic!("expected ok");
        };
        assert_eq!(code, Some(ResponseCode::UidValidity(1_234_567_890)));

        let r = parse_response(b"A5 OK [READ-WRITE] SELECT completed\r\n").unwrap();
        let Response::Tagged { code, .. } = r else {
            panic!("expected tagged");
        };
        assert_eq!(code, Some(ResponseCode::ReadWrite));
    }

    #[test]
    fn parse_appenduid() {
        let r = parse_response(b"A7 OK [APPENDUID 38505 3955] APPEND completed\r\n").unwrap();
        let Response::Tagged { code, .. } = r else {
            panic!("expected tagged");
        };
        assert_eq!(code, Some(ResponseCode::AppendUid(38505, 3955)));
    }

    #[test]
    fn parse_continuation() {
        let r = parse_response(b"+ Ready for literal data\r\n").unwrap();
        assert_eq!(
            r,
            Response::Continuation {
                text: "Ready for literal data".to_string()
            }
        );
    }

    #[test]
    fn parse_flags_row() {
        let r = parse_response(b"* FLAGS (\\Answered \\Seen custom)\r\n").unwrap();
        assert_eq!(
            r,
            Response::Untagged(Untagged::Flags(vec![
                "\\Answered".to_string(),
                "\\Seen".to_string(),
                "custom".to_string()
            ]))
        );
    }

    #[test]
    fn parse_permanentflags_code() {
        let r =
            parse_response(b"* OK [PERMANENTFLAGS (\\Deleted \\Seen \\*)] Limited\r\n").unwrap();
        let Response::Untagged(Untagged::Ok { code, .. }) = r else {
            panic!("expected ok");
        };
        assert_eq!(
            code,
            Some(ResponseCode::PermanentFlags(vec![
                "\\Deleted".to_string(),
                "\\Seen".to_string(),
                "\\*".to_string()
            ]))
        );
    }

    #[test]
    fn reject_garbage() {
        assert!(parse_response(b"").is_err());
        assert!(parse_response(b"* WAT 1 2 3\r\n").is_err());
        assert!(parse_response(b"* 5 NONSENSE\r\n").is_err());
    }

    #[test]
    fn literal_mailbox_name() {
        let r = parse_response(b"* LIST () \"/\" {9}\r\nwork/done\r\n").unwrap();
        let Response::Untagged(Untagged::List { name, .. }) = r else {
            panic!("expected list");
        };
        assert_eq!(name, "work/done");
    }
}
