//! The message and body-part model.

use chrono::{DateTime, Utc};

use crate::{Address, Header};

/// A header value of the form `value; param=x; param2=y`, such as
/// Content-Type or Content-Disposition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamHeader {
    /// The main value, e.g. `text/plain` or `attachment`.
    pub value: String,
    /// Parameters in order of appearance.
    pub params: Vec<(String, String)>,
}

impl ParamHeader {
    /// Creates a header with no parameters.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            params: Vec::new(),
        }
    }

    /// Creates a header with parameters.
    #[must_use]
    pub fn with_params(value: impl Into<String>, params: Vec<(String, String)>) -> Self {
        Self {
            value: value.into(),
            params,
        }
    }

    /// Returns the parameter value for `name`, case-insensitive.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Parses `value; k=v; k2="v 2"` form. Unparseable parameters are
    /// dropped rather than failing the whole header.
    #[must_use]
    pub fn parse(input: &str) -> Self {
        let mut pieces = input.split(';');
        let value = pieces.next().unwrap_or("").trim().to_string();
        let params = pieces
            .filter_map(|p| {
                let (k, v) = p.split_once('=')?;
                let v = v.trim();
                let v = v.strip_prefix('"').and_then(|s| s.strip_suffix('"')).unwrap_or(v);
                Some((k.trim().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        Self { value, params }
    }

    /// Returns true if the value is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Splits a MIME type value into `(type, subtype)`. A value with no
    /// slash yields an empty subtype.
    #[must_use]
    pub fn split_type(&self) -> (&str, &str) {
        self.value
            .split_once('/')
            .unwrap_or((self.value.as_str(), ""))
    }
}

impl std::fmt::Display for ParamHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)?;
        for (name, value) in &self.params {
            if value.chars().all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c)) {
                write!(f, "; {name}={value}")?;
            } else {
                write!(f, "; {name}=\"{value}\"")?;
            }
        }
        Ok(())
    }
}

/// One MIME body part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Part {
    /// Content-Type with parameters.
    pub ptype: ParamHeader,
    /// Content-Disposition with parameters.
    pub disposition: ParamHeader,
    /// Body size in bytes. When `body` is present this equals its
    /// length; otherwise it is the size the server reported.
    pub size: u32,
    /// All remaining MIME headers of the part.
    pub misc: Header,
    /// Decoded body. `None` for parts whose body was not downloaded
    /// (the cache may still hold one, keyed separately).
    pub body: Option<Vec<u8>>,
}

impl Part {
    /// Creates a text part with an inline body.
    #[must_use]
    pub fn text(mime: &str, body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        Self {
            ptype: ParamHeader::new(mime),
            size: u32::try_from(body.len()).unwrap_or(u32::MAX),
            body: Some(body),
            ..Self::default()
        }
    }

    /// Returns true if the part is declared an attachment.
    #[must_use]
    pub fn is_attachment(&self) -> bool {
        self.disposition.value.eq_ignore_ascii_case("attachment")
    }

    /// Returns the attachment filename, if declared.
    #[must_use]
    pub fn filename(&self) -> Option<&str> {
        self.disposition.param("filename")
    }
}

/// A parsed e-mail message.
///
/// Well-known RFC 822 headers are split into fields; the remaining
/// open-ended set lives in `misc`. Multipart bodies are split into
/// [`Part`]s; a non-multipart body is represented as a single part.
/// Fields are left empty when the corresponding header is missing or
/// malformed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Msg {
    /// Date header.
    pub date: Option<DateTime<Utc>>,
    /// Subject header.
    pub subject: String,
    /// From header.
    pub from: Address,
    /// Reply-To header.
    pub reply_to: Address,
    /// To recipients.
    pub to: Vec<Address>,
    /// Cc recipients.
    pub cc: Vec<Address>,
    /// Bcc recipients.
    pub bcc: Vec<Address>,
    /// Message-Id header.
    pub message_id: String,
    /// All remaining headers.
    pub misc: Header,
    /// Body parts.
    pub parts: Vec<Part>,
}

impl Msg {
    /// Every recipient across To, Cc and Bcc, in that order.
    pub fn recipients(&self) -> impl Iterator<Item = &Address> {
        self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_header_parse() {
        let h = ParamHeader::parse("text/plain; charset=utf-8; name=\"a b\"");
        assert_eq!(h.value, "text/plain");
        assert_eq!(h.param("charset"), Some("utf-8"));
        assert_eq!(h.param("NAME"), Some("a b"));
    }

    #[test]
    fn param_header_display_roundtrip() {
        let h = ParamHeader::with_params(
            "multipart/mixed",
            vec![("boundary".to_string(), "xyz 1".to_string())],
        );
        let s = h.to_string();
        assert_eq!(s, "multipart/mixed; boundary=\"xyz 1\"");
        assert_eq!(ParamHeader::parse(&s), h);
    }

    #[test]
    fn split_type() {
        assert_eq!(ParamHeader::new("text/html").split_type(), ("text", "html"));
        assert_eq!(ParamHeader::new("weird").split_type(), ("weird", ""));
    }

    #[test]
    fn attachment_detection() {
        let mut p = Part::default();
        assert!(!p.is_attachment());
        p.disposition = ParamHeader::with_params(
            "attachment",
            vec![("filename".to_string(), "a.pdf".to_string())],
        );
        assert!(p.is_attachment());
        assert_eq!(p.filename(), Some("a.pdf"));
    }

    #[test]
    fn recipients_order() {
        let msg = Msg {
            to: vec![Address::new("to@x.com")],
            cc: vec![Address::new("cc@x.com")],
            bcc: vec![Address::new("bcc@x.com")],
            ..Msg::default()
        };
        let all: Vec<_> = msg.recipients().map(|a| a.address.as_str()).collect();
        assert_eq!(all, vec!["to@x.com", "cc@x.com", "bcc@x.com"]);
    }
}
