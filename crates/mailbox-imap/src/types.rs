//! Core data types shared with the cache and the account controller.

use chrono::NaiveDate;
use mailbox_mime::Msg;

use crate::parser::Envelope;

/// Summary of a mailbox as reported by SELECT or STATUS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirStatus {
    /// Raw (server-side) mailbox name.
    pub name: String,
    /// Total message count.
    pub messages: u32,
    /// Unseen message count, when reported.
    pub unseen: Option<u32>,
    /// UIDVALIDITY epoch, when reported.
    pub uidvalidity: Option<u32>,
    /// Predicted next UID, when reported.
    pub uidnext: Option<u32>,
}

/// One message as the controller and cache see it: UID, flag booleans,
/// custom tags and the parsed envelope data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageInfo {
    /// Message UID within its mailbox.
    pub uid: u32,
    /// `\Seen` flag.
    pub seen: bool,
    /// `\Answered` flag.
    pub answered: bool,
    /// `\Recent` flag.
    pub recent: bool,
    /// `\Draft` flag.
    pub draft: bool,
    /// Non-system tags (flags without the backslash prefix).
    pub custom_tags: Vec<String>,
    /// Envelope headers and any downloaded parts.
    pub msg: Msg,
}

impl MessageInfo {
    /// Builds a `MessageInfo` from fetched envelope data and flags.
    #[must_use]
    pub fn from_envelope(uid: u32, flags: &[String], envelope: &Envelope) -> Self {
        let mut info = Self {
            uid,
            msg: envelope.to_msg(),
            ..Self::default()
        };
        info.apply_flags(flags);
        info
    }

    /// Replaces the flag booleans and custom tags from a raw flag list.
    pub fn apply_flags(&mut self, flags: &[String]) {
        self.seen = false;
        self.answered = false;
        self.recent = false;
        self.draft = false;
        self.custom_tags.clear();
        for flag in flags {
            match flag.as_str() {
                "\\Seen" => self.seen = true,
                "\\Answered" => self.answered = true,
                "\\Recent" => self.recent = true,
                "\\Draft" => self.draft = true,
                // Remaining system flags (backslash prefix) are not
                // kept as tags.
                f if f.starts_with('\\') => {}
                f => self.custom_tags.push(f.to_string()),
            }
        }
    }

    /// Serializes flag booleans and custom tags back to IMAP flags.
    #[must_use]
    pub fn to_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if self.seen {
            flags.push("\\Seen".to_string());
        }
        if self.answered {
            flags.push("\\Answered".to_string());
        }
        if self.recent {
            flags.push("\\Recent".to_string());
        }
        if self.draft {
            flags.push("\\Draft".to_string());
        }
        flags.extend(self.custom_tags.iter().cloned());
        flags
    }
}

/// Part filter: accepts `(type, subtype)` of a MIME part.
///
/// Used by `fetch_partial_mail` to decide which bodies to download.
pub type PartFilter = fn(&str, &str) -> bool;

/// Accepts every `text/*` part.
#[must_use]
pub fn text_only(mime_type: &str, _subtype: &str) -> bool {
    mime_type.eq_ignore_ascii_case("text")
}

/// Accepts only `text/plain`.
#[must_use]
pub fn plain_text_only(mime_type: &str, subtype: &str) -> bool {
    mime_type.eq_ignore_ascii_case("text") && subtype.eq_ignore_ascii_case("plain")
}

/// Accepts only `text/html`.
#[must_use]
pub fn html_only(mime_type: &str, subtype: &str) -> bool {
    mime_type.eq_ignore_ascii_case("text") && subtype.eq_ignore_ascii_case("html")
}

/// Combines filters disjunctively: the result accepts a part any of
/// the inputs accept.
pub fn any_of(
    filters: Vec<Box<dyn Fn(&str, &str) -> bool + Send + Sync>>,
) -> impl Fn(&str, &str) -> bool + Send + Sync {
    move |t, s| filters.iter().any(|f| f(t, s))
}

/// Search criteria serialized to an IMAP SEARCH command.
///
/// All present fields must match (they are ANDed on the wire); `text`
/// matches subject or body.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    /// Sent strictly before this date.
    pub sent_before: Option<NaiveDate>,
    /// Sent strictly after this date.
    pub sent_since: Option<NaiveDate>,
    /// Sent on this date. Should not be combined with before/since.
    pub sent_on: Option<NaiveDate>,
    /// From header contains this substring.
    pub from: Option<String>,
    /// Subject or body contains this substring.
    pub text: Option<String>,
}

impl SearchQuery {
    /// Serializes to the SEARCH argument list. An empty query becomes
    /// `ALL`.
    #[must_use]
    pub fn to_wire(&self) -> String {
        let mut terms = Vec::new();
        if let Some(d) = self.sent_before {
            terms.push(format!("SENTBEFORE {}", imap_date(d)));
        }
        if let Some(d) = self.sent_since {
            terms.push(format!("SENTSINCE {}", imap_date(d)));
        }
        if let Some(d) = self.sent_on {
            terms.push(format!("SENTON {}", imap_date(d)));
        }
        if let Some(from) = &self.from {
            terms.push(format!("FROM {}", quote(from)));
        }
        if let Some(text) = &self.text {
            terms.push(format!(
                "OR SUBJECT {} BODY {}",
                quote(text),
                quote(text)
            ));
        }
        if terms.is_empty() {
            "ALL".to_string()
        } else {
            terms.join(" ")
        }
    }
}

/// Formats a date in IMAP `dd-Mon-yyyy` form.
fn imap_date(d: NaiveDate) -> String {
    d.format("%-d-%b-%Y").to_string()
}

/// Quotes a SEARCH string argument.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters() {
        assert!(text_only("text", "plain"));
        assert!(text_only("TEXT", "html"));
        assert!(!text_only("image", "png"));
        assert!(plain_text_only("text", "plain"));
        assert!(!plain_text_only("text", "html"));
        assert!(html_only("text", "html"));
        assert!(!html_only("text", "plain"));
    }

    #[test]
    fn any_of_combines() {
        let f = any_of(vec![
            Box::new(plain_text_only),
            Box::new(html_only),
        ]);
        assert!(f("text", "plain"));
        assert!(f("text", "html"));
        assert!(!f("text", "calendar"));
    }

    #[test]
    fn flags_roundtrip() {
        let mut info = MessageInfo {
            uid: 7,
            ..MessageInfo::default()
        };
        info.apply_flags(&[
            "\\Seen".to_string(),
            "\\Draft".to_string(),
            "work".to_string(),
            "\\Flagged".to_string(),
        ]);
        assert!(info.seen && info.draft);
        assert!(!info.answered && !info.recent);
        assert_eq!(info.custom_tags, vec!["work"]);

        let flags = info.to_flags();
        assert!(flags.contains(&"\\Seen".to_string()));
        assert!(flags.contains(&"work".to_string()));
        // System flags we do not model are dropped.
        assert!(!flags.contains(&"\\Flagged".to_string()));
    }

    #[test]
    fn search_query_empty_is_all() {
        assert_eq!(SearchQuery::default().to_wire(), "ALL");
    }

    #[test]
    fn search_query_wire_form() {
        let q = SearchQuery {
            sent_since: NaiveDate::from_ymd_opt(2026, 1, 2),
            from: Some("alice".to_string()),
            text: Some("report".to_string()),
            ..SearchQuery::default()
        };
        assert_eq!(
            q.to_wire(),
            "SENTSINCE 2-Jan-2026 FROM \"alice\" OR SUBJECT \"report\" BODY \"report\""
        );
    }
}
