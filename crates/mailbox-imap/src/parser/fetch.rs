//! FETCH data items: envelope, body structure, flags and body
//! sections.
//!
//! Envelope and body structure arrive as deeply nested parenthesized
//! lists. They are first read into a generic [`Value`] tree and then
//! interpreted, which keeps the grammar handling tolerant of the
//! optional extension fields servers may or may not send.

use chrono::{DateTime, Utc};
use mailbox_mime as mime;

use super::Cursor;
use crate::Result;

/// One address from an envelope: `(name adl mailbox host)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    /// Display name, empty if NIL.
    pub name: String,
    /// Local part.
    pub mailbox: String,
    /// Domain part.
    pub host: String,
}

impl Address {
    /// Converts to the shared mime address form.
    #[must_use]
    pub fn to_mime(&self) -> mime::Address {
        mime::Address::with_name(self.name.clone(), format!("{}@{}", self.mailbox, self.host))
    }
}

/// A parsed ENVELOPE item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Date header.
    pub date: Option<DateTime<Utc>>,
    /// Subject header.
    pub subject: String,
    /// From addresses.
    pub from: Vec<Address>,
    /// Sender addresses.
    pub sender: Vec<Address>,
    /// Reply-To addresses.
    pub reply_to: Vec<Address>,
    /// To addresses.
    pub to: Vec<Address>,
    /// Cc addresses.
    pub cc: Vec<Address>,
    /// Bcc addresses.
    pub bcc: Vec<Address>,
    /// In-Reply-To header.
    pub in_reply_to: String,
    /// Message-Id header.
    pub message_id: String,
}

impl Envelope {
    /// Converts to the shared message model. Only the first From and
    /// Reply-To addresses are kept, matching the cache schema.
    #[must_use]
    pub fn to_msg(&self) -> mime::Msg {
        mime::Msg {
            date: self.date,
            subject: self.subject.clone(),
            from: self.from.first().map(Address::to_mime).unwrap_or_default(),
            reply_to: self
                .reply_to
                .first()
                .map(Address::to_mime)
                .unwrap_or_default(),
            to: self.to.iter().map(Address::to_mime).collect(),
            cc: self.cc.iter().map(Address::to_mime).collect(),
            bcc: self.bcc.iter().map(Address::to_mime).collect(),
            message_id: self.message_id.clone(),
            ..mime::Msg::default()
        }
    }
}

/// A parsed BODYSTRUCTURE item (recursive for multipart).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BodyStructure {
    /// MIME type, lowercased (`multipart` for a multipart node).
    pub mime_type: String,
    /// MIME subtype, lowercased.
    pub mime_subtype: String,
    /// Content-Type parameters.
    pub params: Vec<(String, String)>,
    /// Content-Transfer-Encoding (single-part only).
    pub encoding: String,
    /// Body size in bytes (single-part only).
    pub size: u32,
    /// Content-Disposition value and parameters, when the server sent
    /// the extension data.
    pub disposition: Option<(String, Vec<(String, String)>)>,
    /// Content-Language, when sent.
    pub language: Option<String>,
    /// Content-Location, when sent.
    pub location: Option<String>,
    /// Child parts; non-empty exactly for multipart.
    pub parts: Vec<BodyStructure>,
}

impl BodyStructure {
    /// Returns true for a multipart node.
    #[must_use]
    pub fn is_multipart(&self) -> bool {
        !self.parts.is_empty() || self.mime_type == "multipart"
    }

    /// Converts one part's metadata to the shared model. The body is
    /// left absent; callers download it separately when wanted.
    #[must_use]
    pub fn to_part(&self) -> mime::Part {
        let mut misc = mime::Header::new();
        if let Some(lang) = &self.language {
            misc.add("Content-Language", lang);
        }
        if let Some(loc) = &self.location {
            misc.add("Content-Location", loc);
        }
        let disposition = self.disposition.as_ref().map_or_else(
            mime::ParamHeader::default,
            |(value, params)| mime::ParamHeader::with_params(value.clone(), params.clone()),
        );
        mime::Part {
            ptype: mime::ParamHeader::with_params(
                format!("{}/{}", self.mime_type, self.mime_subtype),
                self.params.clone(),
            ),
            disposition,
            size: self.size,
            misc,
            body: None,
        }
    }
}

/// One item inside an untagged FETCH response.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchItem {
    /// UID item.
    Uid(u32),
    /// FLAGS item.
    Flags(Vec<String>),
    /// ENVELOPE item.
    Envelope(Envelope),
    /// BODY or BODYSTRUCTURE item.
    BodyStructure(BodyStructure),
    /// INTERNALDATE item.
    InternalDate(String),
    /// RFC822.SIZE item.
    Rfc822Size(u32),
    /// `BODY[section]` item with its literal payload.
    BodySection {
        /// The section specifier, e.g. `1`, `1.MIME`, `TEXT`.
        section: String,
        /// The payload; `None` when the server sent NIL.
        data: Option<Vec<u8>>,
    },
}

/// Parses the parenthesized item list of a FETCH response.
pub(crate) fn parse_fetch_items(cur: &mut Cursor<'_>) -> Result<Vec<FetchItem>> {
    cur.expect(b'(')?;
    let mut items = Vec::new();

    loop {
        cur.skip_space();
        if cur.peek() == Some(b')') {
            cur.advance();
            return Ok(items);
        }

        let name = read_item_name(cur)?;
        let upper = name.to_ascii_uppercase();
        cur.skip_space();

        if let Some(section) = upper
            .strip_prefix("BODY[")
            .and_then(|s| s.strip_suffix(']'))
        {
            // Partial-range suffix (<origin>) may follow the brackets;
            // read_item_name consumed it already, so drop it here.
            let section = section.to_string();
            let data = cur.read_nstring()?;
            items.push(FetchItem::BodySection { section, data });
            continue;
        }

        match upper.as_str() {
            "UID" => items.push(FetchItem::Uid(cur.read_number()?)),
            "FLAGS" => items.push(FetchItem::Flags(super::parse_atom_list(cur)?)),
            "ENVELOPE" => {
                let value = parse_value(cur)?;
                items.push(FetchItem::Envelope(envelope_from_value(&value)));
            }
            "BODY" | "BODYSTRUCTURE" => {
                let value = parse_value(cur)?;
                items.push(FetchItem::BodyStructure(body_from_value(&value)));
            }
            "INTERNALDATE" => {
                let raw = cur.read_string()?;
                items.push(FetchItem::InternalDate(
                    String::from_utf8_lossy(&raw).into_owned(),
                ));
            }
            "RFC822.SIZE" => items.push(FetchItem::Rfc822Size(cur.read_number()?)),
            _ => {
                // Skip any item this client does not consume.
                let _ = parse_value(cur)?;
            }
        }
    }
}

/// Reads a fetch item name, including any `[section]<partial>` suffix.
fn read_item_name(cur: &mut Cursor<'_>) -> Result<String> {
    let mut name = String::new();
    let mut depth = 0_u32;
    while let Some(b) = cur.peek() {
        match b {
            b'[' => depth += 1,
            b']' => depth = depth.saturating_sub(1),
            b' ' | b'(' | b')' if depth == 0 => break,
            b'\r' | b'\n' => break,
            _ => {}
        }
        name.push(cur.advance().unwrap_or(b' ') as char);
    }
    // Strip a partial-range suffix such as <0>.
    if let Some(pos) = name.find('<') {
        name.truncate(pos);
    }
    if name.is_empty() {
        return Err(cur.error("expected fetch item name"));
    }
    Ok(name)
}

/// A generic parenthesized-list value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value {
    /// Unquoted atom.
    Atom(String),
    /// Quoted string or literal payload.
    Text(Vec<u8>),
    /// Unsigned number.
    Number(u32),
    /// Parenthesized list.
    List(Vec<Value>),
    /// NIL.
    Nil,
}

impl Value {
    fn as_text(&self) -> Option<String> {
        match self {
            Self::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            Self::Atom(s) => Some(s.clone()),
            Self::Number(n) => Some(n.to_string()),
            Self::List(_) | Self::Nil => None,
        }
    }

    fn as_number(&self) -> Option<u32> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(bytes) => std::str::from_utf8(bytes).ok()?.parse().ok(),
            _ => None,
        }
    }

    fn as_list(&self) -> &[Value] {
        match self {
            Self::List(items) => items,
            _ => &[],
        }
    }
}

/// Parses one value: list, string, literal, number, NIL or atom.
pub(crate) fn parse_value(cur: &mut Cursor<'_>) -> Result<Value> {
    match cur.peek() {
        Some(b'(') => {
            cur.advance();
            let mut items = Vec::new();
            loop {
                cur.skip_space();
                if cur.peek() == Some(b')') {
                    cur.advance();
                    return Ok(Value::List(items));
                }
                items.push(parse_value(cur)?);
            }
        }
        Some(b'"') => Ok(Value::Text(cur.read_quoted()?)),
        Some(b'{') => Ok(Value::Text(cur.read_literal()?.to_vec())),
        Some(b) if b.is_ascii_digit() => {
            // Could still be an atom like 8BITMIME; re-read as atom if
            // digits are followed by atom characters.
            let start_atom = cur.read_atom()?;
            start_atom.parse::<u32>().map_or_else(
                |_| Ok(Value::Atom(start_atom.to_string())),
                |n| Ok(Value::Number(n)),
            )
        }
        Some(_) => {
            let atom = cur.read_atom()?;
            if atom.eq_ignore_ascii_case("NIL") {
                Ok(Value::Nil)
            } else {
                Ok(Value::Atom(atom.to_string()))
            }
        }
        None => Err(cur.error("expected value")),
    }
}

fn address_from_value(value: &Value) -> Option<Address> {
    let fields = value.as_list();
    let mailbox = fields.get(2)?.as_text()?;
    let host = fields.get(3)?.as_text()?;
    Some(Address {
        name: fields.first().and_then(Value::as_text).unwrap_or_default(),
        mailbox,
        host,
    })
}

fn address_list_from_value(value: &Value) -> Vec<Address> {
    value
        .as_list()
        .iter()
        .filter_map(address_from_value)
        .collect()
}

/// Interprets an ENVELOPE value:
/// `(date subject (from) (sender) (reply-to) (to) (cc) (bcc)
///   in-reply-to message-id)`.
pub(crate) fn envelope_from_value(value: &Value) -> Envelope {
    let fields = value.as_list();
    let text_at = |i: usize| fields.get(i).and_then(Value::as_text).unwrap_or_default();
    Envelope {
        date: fields
            .first()
            .and_then(Value::as_text)
            .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
            .map(|d| d.with_timezone(&Utc)),
        subject: text_at(1),
        from: fields.get(2).map(address_list_from_value).unwrap_or_default(),
        sender: fields.get(3).map(address_list_from_value).unwrap_or_default(),
        reply_to: fields.get(4).map(address_list_from_value).unwrap_or_default(),
        to: fields.get(5).map(address_list_from_value).unwrap_or_default(),
        cc: fields.get(6).map(address_list_from_value).unwrap_or_default(),
        bcc: fields.get(7).map(address_list_from_value).unwrap_or_default(),
        in_reply_to: text_at(8),
        message_id: text_at(9),
    }
}

fn params_from_value(value: &Value) -> Vec<(String, String)> {
    let items = value.as_list();
    items
        .chunks(2)
        .filter_map(|pair| {
            let name = pair.first()?.as_text()?.to_ascii_lowercase();
            let val = pair.get(1)?.as_text()?;
            Some((name, val))
        })
        .collect()
}

fn disposition_from_value(value: &Value) -> Option<(String, Vec<(String, String)>)> {
    let fields = value.as_list();
    let dsp = fields.first()?.as_text()?.to_ascii_lowercase();
    let params = fields.get(1).map(params_from_value).unwrap_or_default();
    Some((dsp, params))
}

/// Interprets a BODY / BODYSTRUCTURE value, single-part or multipart,
/// with or without extension fields.
pub(crate) fn body_from_value(value: &Value) -> BodyStructure {
    let fields = value.as_list();

    if fields.first().is_some_and(|f| matches!(f, Value::List(_))) {
        // Multipart: 1*body subtype [params disposition language location]
        let mut body = BodyStructure {
            mime_type: "multipart".to_string(),
            ..BodyStructure::default()
        };
        let mut i = 0;
        while let Some(part @ Value::List(_)) = fields.get(i) {
            body.parts.push(body_from_value(part));
            i += 1;
        }
        body.mime_subtype = fields
            .get(i)
            .and_then(Value::as_text)
            .unwrap_or_default()
            .to_ascii_lowercase();
        if let Some(params) = fields.get(i + 1) {
            body.params = params_from_value(params);
        }
        if let Some(dsp) = fields.get(i + 2) {
            body.disposition = disposition_from_value(dsp);
        }
        if let Some(lang) = fields.get(i + 3) {
            body.language = lang.as_text();
        }
        if let Some(loc) = fields.get(i + 4) {
            body.location = loc.as_text();
        }
        return body;
    }

    // Single part: type subtype params id description encoding size
    //              [lines | (envelope body lines)] [md5 dsp lang loc]
    let text_at = |i: usize| fields.get(i).and_then(Value::as_text).unwrap_or_default();
    let mut body = BodyStructure {
        mime_type: text_at(0).to_ascii_lowercase(),
        mime_subtype: text_at(1).to_ascii_lowercase(),
        params: fields.get(2).map(params_from_value).unwrap_or_default(),
        encoding: text_at(5).to_ascii_lowercase(),
        size: fields.get(6).and_then(Value::as_number).unwrap_or(0),
        ..BodyStructure::default()
    };

    let mut i = 7;
    if body.mime_type == "text" {
        // body-fld-lines
        i += 1;
    } else if body.mime_type == "message" && body.mime_subtype == "rfc822" {
        // envelope, body, body-fld-lines
        i += 3;
    }
    // body-fld-md5
    i += 1;
    if let Some(dsp) = fields.get(i) {
        body.disposition = disposition_from_value(dsp);
    }
    if let Some(lang) = fields.get(i + 1) {
        body.language = lang.as_text();
    }
    if let Some(loc) = fields.get(i + 2) {
        body.location = loc.as_text();
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{Response, Untagged, parse_response};

    fn fetch_items(input: &[u8]) -> Vec<FetchItem> {
        match parse_response(input).unwrap() {
            Response::Untagged(Untagged::Fetch { items, .. }) => items,
            other => panic!("expected fetch, got {other:?}"),
        }
    }

    #[test]
    fn uid_and_flags() {
        let items = fetch_items(b"* 1 FETCH (UID 42 FLAGS (\\Seen work))\r\n");
        assert!(items.contains(&FetchItem::Uid(42)));
        assert!(matches!(
            items.iter().find(|i| matches!(i, FetchItem::Flags(_))),
            Some(FetchItem::Flags(f)) if f == &["\\Seen".to_string(), "work".to_string()]
        ));
    }

    #[test]
    fn envelope_basic() {
        let raw = b"* 2 FETCH (ENVELOPE (\"Sat, 24 Jan 2026 10:00:00 +0000\" \"Hello\" \
            ((\"John\" NIL \"john\" \"example.com\")) NIL NIL \
            ((NIL NIL \"jane\" \"example.org\")) NIL NIL NIL \"<id@x>\"))\r\n";
        let items = fetch_items(raw);
        let Some(FetchItem::Envelope(env)) =
            items.iter().find(|i| matches!(i, FetchItem::Envelope(_)))
        else {
            panic!("no envelope");
        };
        assert_eq!(env.subject, "Hello");
        assert!(env.date.is_some());
        assert_eq!(env.from[0].name, "John");
        assert_eq!(env.from[0].mailbox, "john");
        assert_eq!(env.to[0].host, "example.org");
        assert_eq!(env.message_id, "<id@x>");

        let msg = env.to_msg();
        assert_eq!(msg.from.address, "john@example.com");
        assert_eq!(msg.to[0].address, "jane@example.org");
    }

    #[test]
    fn envelope_subject_literal() {
        let raw = b"* 1 FETCH (ENVELOPE (NIL {5}\r\nhi... NIL NIL NIL NIL NIL NIL NIL NIL))\r\n";
        let items = fetch_items(raw);
        let Some(FetchItem::Envelope(env)) =
            items.iter().find(|i| matches!(i, FetchItem::Envelope(_)))
        else {
            panic!("no envelope");
        };
        assert_eq!(env.subject, "hi...");
        assert!(env.date.is_none());
    }

    #[test]
    fn bodystructure_single_text() {
        let raw = b"* 3 FETCH (BODYSTRUCTURE (\"TEXT\" \"PLAIN\" (\"CHARSET\" \"utf-8\") \
            NIL NIL \"QUOTED-PRINTABLE\" 1315 42 NIL NIL NIL NIL))\r\n";
        let items = fetch_items(raw);
        let Some(FetchItem::BodyStructure(bs)) = items
            .iter()
            .find(|i| matches!(i, FetchItem::BodyStructure(_)))
        else {
            panic!("no bodystructure");
        };
        assert!(!bs.is_multipart());
        assert_eq!(bs.mime_type, "text");
        assert_eq!(bs.mime_subtype, "plain");
        assert_eq!(bs.encoding, "quoted-printable");
        assert_eq!(bs.size, 1315);
        assert_eq!(bs.params, vec![("charset".to_string(), "utf-8".to_string())]);
    }

    #[test]
    fn bodystructure_multipart_with_attachment() {
        let raw = b"* 4 FETCH (BODYSTRUCTURE ((\"TEXT\" \"PLAIN\" (\"CHARSET\" \"utf-8\") NIL NIL \"7BIT\" 10 1 NIL NIL NIL NIL)\
            (\"APPLICATION\" \"PDF\" (\"NAME\" \"doc.pdf\") NIL NIL \"BASE64\" 20000 NIL (\"attachment\" (\"filename\" \"doc.pdf\")) NIL NIL)\
            \"MIXED\" (\"BOUNDARY\" \"xyz\") NIL NIL NIL))\r\n";
        let items = fetch_items(raw);
        let Some(FetchItem::BodyStructure(bs)) = items
            .iter()
            .find(|i| matches!(i, FetchItem::BodyStructure(_)))
        else {
            panic!("no bodystructure");
        };
        assert!(bs.is_multipart());
        assert_eq!(bs.mime_subtype, "mixed");
        assert_eq!(bs.parts.len(), 2);
        assert_eq!(bs.parts[0].mime_type, "text");
        let attach = &bs.parts[1];
        assert_eq!(attach.mime_type, "application");
        let (dsp, params) = attach.disposition.as_ref().unwrap();
        assert_eq!(dsp, "attachment");
        assert_eq!(params[0].1, "doc.pdf");

        let part = attach.to_part();
        assert!(part.is_attachment());
        assert_eq!(part.filename(), Some("doc.pdf"));
        assert_eq!(part.size, 20000);
        assert!(part.body.is_none());
    }

    #[test]
    fn body_section_literal() {
        let raw = b"* 5 FETCH (UID 9 BODY[1] {5}\r\nhello)\r\n";
        let items = fetch_items(raw);
        let Some(FetchItem::BodySection { section, data }) = items
            .iter()
            .find(|i| matches!(i, FetchItem::BodySection { .. }))
        else {
            panic!("no body section");
        };
        assert_eq!(section, "1");
        assert_eq!(data.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn body_section_mime_and_partial() {
        let raw = b"* 6 FETCH (BODY[1.MIME]<0> {10}\r\n0123456789)\r\n";
        let items = fetch_items(raw);
        let Some(FetchItem::BodySection { section, data }) = items.first() else {
            panic!("no body section");
        };
        assert_eq!(section, "1.MIME");
        assert_eq!(data.as_deref().map(<[u8]>::len), Some(10));
    }

    #[test]
    fn body_section_nil() {
        let raw = b"* 7 FETCH (BODY[TEXT] NIL)\r\n";
        let items = fetch_items(raw);
        assert_eq!(
            items.first(),
            Some(&FetchItem::BodySection {
                section: "TEXT".to_string(),
                data: None
            })
        );
    }

    #[test]
    fn unknown_items_are_skipped() {
        let raw = b"* 8 FETCH (X-GM-MSGID 1278455344230334865 UID 4)\r\n";
        let items = fetch_items(raw);
        assert_eq!(items, vec![FetchItem::Uid(4)]);
    }

    #[test]
    fn internaldate_and_size() {
        let raw = b"* 9 FETCH (INTERNALDATE \"17-Jul-2026 02:44:25 -0700\" RFC822.SIZE 4286)\r\n";
        let items = fetch_items(raw);
        assert!(items.contains(&FetchItem::Rfc822Size(4286)));
        assert!(matches!(
            items.first(),
            Some(FetchItem::InternalDate(d)) if d.starts_with("17-Jul-2026")
        ));
    }
}
