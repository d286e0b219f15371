//! Cross-directory search.

use chrono::NaiveDate;
use mailbox_imap::SearchQuery;

/// What to search for. All present fields must match; `text` matches
/// subject or body.
#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    /// Sent strictly before this date (time of day ignored).
    pub before: Option<NaiveDate>,
    /// Sent strictly after this date (time of day ignored).
    pub after: Option<NaiveDate>,
    /// Sent on this date. Should not be combined with before/after.
    pub on: Option<NaiveDate>,
    /// From header contains this substring.
    pub from: Option<String>,
    /// Subject or body contains this substring.
    pub text: Option<String>,
    /// Directories to search (normalized names). `None` searches every
    /// directory of the account.
    pub dirs: Option<Vec<String>>,
}

impl SearchCriteria {
    pub(crate) fn to_query(&self) -> SearchQuery {
        SearchQuery {
            sent_before: self.before,
            sent_since: self.after,
            sent_on: self.on,
            from: self.from.clone(),
            text: self.text.clone(),
        }
    }
}

/// One search hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    /// Normalized directory name.
    pub dir: String,
    /// Message UID within that directory.
    pub uid: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn criteria_map_to_wire_query() {
        let criteria = SearchCriteria {
            after: NaiveDate::from_ymd_opt(2026, 3, 1),
            text: Some("invoice".to_string()),
            ..SearchCriteria::default()
        };
        let wire = criteria.to_query().to_wire();
        assert!(wire.contains("SENTSINCE 1-Mar-2026"));
        assert!(wire.contains("OR SUBJECT \"invoice\" BODY \"invoice\""));
    }

    #[test]
    fn empty_criteria_become_all() {
        assert_eq!(SearchCriteria::default().to_query().to_wire(), "ALL");
    }
}
