//! SMTP reply parsing (RFC 5321 §4.2).

use crate::{Error, Result};

/// One complete (possibly multiline) server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Three-digit reply code.
    pub code: u16,
    /// One entry per reply line, code stripped.
    pub lines: Vec<String>,
}

impl Reply {
    /// Returns true for 2xx and 3xx codes.
    #[must_use]
    pub const fn is_positive(&self) -> bool {
        self.code < 400
    }

    /// The reply text joined for error reporting.
    #[must_use]
    pub fn text(&self) -> String {
        self.lines.join(" / ")
    }

    /// Converts a negative reply into an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Server`] for 4xx/5xx codes.
    pub fn into_result(self) -> Result<Self> {
        if self.is_positive() {
            Ok(self)
        } else {
            Err(Error::Server {
                code: self.code,
                message: self.text(),
            })
        }
    }
}

/// Parses one reply line into `(code, is_last, text)`.
///
/// `250-text` continues a multiline reply; `250 text` (or a bare
/// `250`) finishes it.
pub(crate) fn parse_reply_line(line: &str) -> Result<(u16, bool, String)> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.len() < 3 {
        return Err(Error::MalformedReply(line.to_string()));
    }
    let code: u16 = line[..3]
        .parse()
        .map_err(|_| Error::MalformedReply(line.to_string()))?;
    match line.as_bytes().get(3) {
        None => Ok((code, true, String::new())),
        Some(b' ') => Ok((code, true, line[4..].to_string())),
        Some(b'-') => Ok((code, false, line[4..].to_string())),
        Some(_) => Err(Error::MalformedReply(line.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line() {
        assert_eq!(
            parse_reply_line("250 OK\r\n").unwrap(),
            (250, true, "OK".to_string())
        );
    }

    #[test]
    fn continuation_line() {
        assert_eq!(
            parse_reply_line("250-SIZE 35882577\r\n").unwrap(),
            (250, false, "SIZE 35882577".to_string())
        );
    }

    #[test]
    fn bare_code() {
        assert_eq!(parse_reply_line("354\r\n").unwrap(), (354, true, String::new()));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_reply_line("xx\r\n").is_err());
        assert!(parse_reply_line("25x OK\r\n").is_err());
        assert!(parse_reply_line("250?odd\r\n").is_err());
    }

    #[test]
    fn positive_check() {
        let ok = Reply {
            code: 250,
            lines: vec!["OK".to_string()],
        };
        assert!(ok.is_positive());
        assert!(ok.into_result().is_ok());

        let bad = Reply {
            code: 550,
            lines: vec!["no such user".to_string()],
        };
        assert!(!bad.is_positive());
        assert!(bad.into_result().is_err());
    }
}
