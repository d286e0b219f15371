//! Parsing raw RFC 822 messages into [`Msg`].

use chrono::{DateTime, Utc};

use crate::encoding::decode_body;
use crate::{Error, Header, Msg, ParamHeader, Part, Result, parse_address, parse_address_list};

/// Parses a complete RFC 822 message.
///
/// Well-known headers are split into [`Msg`] fields and removed from
/// the `misc` set. A multipart body is split on its boundary into
/// parts; any other body becomes a single part. Transfer encodings are
/// decoded.
///
/// # Errors
///
/// Returns an error if the header block is malformed or a declared
/// transfer encoding cannot be decoded. Missing or malformed individual
/// headers leave the corresponding field empty instead of failing.
pub fn read_msg(input: &[u8]) -> Result<Msg> {
    let (header_bytes, body) = split_message(input);
    let mut header = Header::from_blob(header_bytes)?;

    let mut msg = Msg {
        date: header.get("Date").and_then(parse_date),
        subject: header.get("Subject").unwrap_or_default().to_string(),
        from: header.get("From").and_then(parse_address).unwrap_or_default(),
        reply_to: header
            .get("Reply-To")
            .and_then(parse_address)
            .unwrap_or_default(),
        to: header.get("To").map(parse_address_list).unwrap_or_default(),
        cc: header.get("Cc").map(parse_address_list).unwrap_or_default(),
        bcc: header.get("Bcc").map(parse_address_list).unwrap_or_default(),
        message_id: header.get("Message-Id").unwrap_or_default().to_string(),
        ..Msg::default()
    };

    for name in [
        "Date",
        "Subject",
        "From",
        "Reply-To",
        "To",
        "Cc",
        "Bcc",
        "Message-Id",
        "MIME-Version",
    ] {
        header.del(name);
    }

    let content_type = header
        .get("Content-Type")
        .map(ParamHeader::parse)
        .unwrap_or_default();

    if content_type.split_type().0.eq_ignore_ascii_case("multipart") {
        let boundary = content_type
            .param("boundary")
            .ok_or_else(|| Error::Malformed("multipart without boundary".to_string()))?
            .to_string();
        header.del("Content-Type");
        msg.misc = header;
        for raw_part in split_multipart(body, &boundary)? {
            msg.parts.push(read_part(raw_part)?);
        }
    } else {
        let encoding = header
            .get("Content-Transfer-Encoding")
            .unwrap_or_default()
            .to_string();
        header.del("Content-Type");
        header.del("Content-Transfer-Encoding");
        msg.misc = header;

        let decoded = decode_body(&encoding, body)?;
        msg.parts.push(Part {
            ptype: content_type,
            size: u32::try_from(decoded.len()).unwrap_or(u32::MAX),
            body: Some(decoded),
            ..Part::default()
        });
    }

    Ok(msg)
}

/// Parses one MIME part (headers + encoded body).
fn read_part(input: &[u8]) -> Result<Part> {
    let (header_bytes, body) = split_message(input);
    let mut header = Header::from_blob(header_bytes)?;

    let ptype = header
        .get("Content-Type")
        .map(ParamHeader::parse)
        .unwrap_or_default();
    let disposition = header
        .get("Content-Disposition")
        .map(ParamHeader::parse)
        .unwrap_or_default();
    let encoding = header
        .get("Content-Transfer-Encoding")
        .unwrap_or_default()
        .to_string();
    header.del("Content-Type");
    header.del("Content-Disposition");
    header.del("Content-Transfer-Encoding");

    let decoded = decode_body(&encoding, body)?;
    Ok(Part {
        ptype,
        disposition,
        size: u32::try_from(decoded.len()).unwrap_or(u32::MAX),
        misc: header,
        body: Some(decoded),
    })
}

/// Splits raw input at the first empty line into (headers, body).
fn split_message(input: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find(input, b"\r\n\r\n") {
        (&input[..pos + 2], &input[pos + 4..])
    } else if let Some(pos) = find(input, b"\n\n") {
        (&input[..pos + 1], &input[pos + 2..])
    } else {
        (input, &[])
    }
}

/// Splits a multipart body on `--boundary` delimiter lines.
fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Result<Vec<&'a [u8]>> {
    let delim = format!("--{boundary}");
    let mut parts = Vec::new();
    let mut current_start: Option<usize> = None;
    let mut pos = 0;

    for line_end in LineOffsets::new(body) {
        let line = trim_crlf(&body[pos..line_end]);
        if line == delim.as_bytes() || line == format!("{delim}--").as_bytes() {
            if let Some(start) = current_start {
                // The CRLF before the delimiter belongs to the delimiter.
                let end = pos.saturating_sub(2).max(start);
                parts.push(&body[start..end]);
            }
            if line.ends_with(b"--") {
                return Ok(parts);
            }
            current_start = Some(line_end);
        }
        pos = line_end;
    }

    if parts.is_empty() && current_start.is_none() {
        return Err(Error::Malformed("boundary not found in body".to_string()));
    }
    // Tolerate a missing closing delimiter.
    if let Some(start) = current_start {
        parts.push(&body[start..]);
    }
    Ok(parts)
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Iterator over byte offsets just past each line ending (or EOF).
struct LineOffsets<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> LineOffsets<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl Iterator for LineOffsets<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.pos >= self.data.len() {
            return None;
        }
        let next = self.data[self.pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(self.data.len(), |i| self.pos + i + 1);
        self.pos = next;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &[u8] = b"From: John Doe <john@example.com>\r\n\
        To: jane@example.com\r\n\
        Subject: Hello\r\n\
        Date: Sat, 24 Jan 2026 10:00:00 +0000\r\n\
        X-Custom: kept\r\n\
        \r\n\
        Body text here.";

    #[test]
    fn parses_simple_message() {
        let msg = read_msg(SIMPLE).unwrap();
        assert_eq!(msg.from.name, "John Doe");
        assert_eq!(msg.from.address, "john@example.com");
        assert_eq!(msg.to[0].address, "jane@example.com");
        assert_eq!(msg.subject, "Hello");
        assert!(msg.date.is_some());
        assert_eq!(msg.misc.get("X-Custom"), Some("kept"));
        assert!(msg.misc.get("Subject").is_none());
        assert_eq!(msg.parts.len(), 1);
        assert_eq!(msg.parts[0].body.as_deref(), Some(&b"Body text here."[..]));
    }

    #[test]
    fn parses_multipart() {
        let raw = b"From: a@x.com\r\n\
            Content-Type: multipart/mixed; boundary=BOUND\r\n\
            \r\n\
            preamble ignored\r\n\
            --BOUND\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            first part\r\n\
            --BOUND\r\n\
            Content-Type: application/pdf\r\n\
            Content-Disposition: attachment; filename=\"doc.pdf\"\r\n\
            Content-Transfer-Encoding: base64\r\n\
            \r\n\
            aGVsbG8=\r\n\
            --BOUND--\r\n";
        let msg = read_msg(raw).unwrap();
        assert_eq!(msg.parts.len(), 2);
        assert_eq!(msg.parts[0].ptype.value, "text/plain");
        assert_eq!(msg.parts[0].body.as_deref(), Some(&b"first part"[..]));
        assert!(msg.parts[1].is_attachment());
        assert_eq!(msg.parts[1].filename(), Some("doc.pdf"));
        assert_eq!(msg.parts[1].body.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn decodes_quoted_printable_body() {
        let raw = b"From: a@x.com\r\n\
            Content-Type: text/plain; charset=utf-8\r\n\
            Content-Transfer-Encoding: quoted-printable\r\n\
            \r\n\
            caf=C3=A9";
        let msg = read_msg(raw).unwrap();
        assert_eq!(
            msg.parts[0].body.as_deref(),
            Some("caf\u{e9}".as_bytes())
        );
    }

    #[test]
    fn multipart_without_boundary_is_error() {
        let raw = b"Content-Type: multipart/mixed\r\n\r\nbody";
        assert!(read_msg(raw).is_err());
    }

    #[test]
    fn missing_headers_leave_fields_empty() {
        let msg = read_msg(b"X-Only: yes\r\n\r\nbody").unwrap();
        assert!(msg.from.is_empty());
        assert!(msg.subject.is_empty());
        assert!(msg.date.is_none());
        assert_eq!(msg.parts.len(), 1);
    }
}
