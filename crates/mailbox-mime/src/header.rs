//! Ordered header collection and the cache blob format.

use crate::{Error, Result};

/// An ordered collection of RFC 822 header fields.
///
/// Field order is preserved and duplicate names are allowed. Name
/// lookups are case-insensitive. This is also the type stored in the
/// cache's `hdrs` blobs: [`Header::to_blob`] and [`Header::from_blob`]
/// round-trip the wire format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    fields: Vec<(String, String)>,
}

impl Header {
    /// Creates an empty header collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the first value for `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value for `name` in order of appearance.
    #[must_use]
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Replaces all values of `name` with a single value.
    pub fn set(&mut self, name: &str, value: &str) {
        self.del(name);
        self.fields.push((name.to_string(), value.to_string()));
    }

    /// Appends a value without touching existing ones.
    pub fn add(&mut self, name: &str, value: &str) {
        self.fields.push((name.to_string(), value.to_string()));
    }

    /// Removes every value of `name`.
    pub fn del(&mut self, name: &str) {
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Returns true if no fields are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Iterates over `(name, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Serializes to the RFC 822 byte form used by cache blobs.
    ///
    /// One `Name: value\r\n` line per field, no trailing empty line.
    #[must_use]
    pub fn to_blob(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in &self.fields {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    /// Parses a header blob produced by [`Header::to_blob`] or cut from
    /// a raw message.
    ///
    /// Folded continuation lines (leading whitespace) are unfolded with
    /// a single space. An empty blob yields an empty collection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHeader`] on a line with no colon or a
    /// continuation line with no preceding field.
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(blob);
        let mut fields: Vec<(String, String)> = Vec::new();

        for line in text.split("\r\n").flat_map(|l| l.split('\n')) {
            if line.is_empty() {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                let Some(last) = fields.last_mut() else {
                    return Err(Error::InvalidHeader(
                        "continuation line before any field".to_string(),
                    ));
                };
                last.1.push(' ');
                last.1.push_str(line.trim_start());
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(Error::InvalidHeader(format!("no colon in line: {line}")));
            };
            fields.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self { fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_all_values() {
        let mut h = Header::new();
        h.add("X-Test", "one");
        h.add("X-Test", "two");
        h.set("X-Test", "three");
        assert_eq!(h.get_all("X-Test"), vec!["three"]);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut h = Header::new();
        h.set("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        h.del("CONTENT-TYPE");
        assert!(h.is_empty());
    }

    #[test]
    fn blob_roundtrip() {
        let mut h = Header::new();
        h.set("X-Mailer", "mailbox");
        h.add("Received", "from a.example by b.example");
        h.add("Received", "from b.example by c.example");

        let parsed = Header::from_blob(&h.to_blob()).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn from_blob_unfolds_continuations() {
        let blob = b"Subject: a very\r\n long subject\r\n";
        let h = Header::from_blob(blob).unwrap();
        assert_eq!(h.get("Subject"), Some("a very long subject"));
    }

    #[test]
    fn from_blob_empty() {
        let h = Header::from_blob(b"").unwrap();
        assert!(h.is_empty());
    }

    #[test]
    fn from_blob_rejects_garbage() {
        assert!(Header::from_blob(b"no colon here\r\n").is_err());
        assert!(Header::from_blob(b" leading continuation\r\n").is_err());
    }
}
