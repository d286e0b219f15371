//! Transfer encoding and decoding: Base64 and Quoted-Printable.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt::Write as _;

use crate::{Error, Result};

/// Maximum encoded line length (RFC 2045).
const MAX_LINE_LENGTH: usize = 76;

/// Encodes data as Base64 with lines folded at 76 characters.
#[must_use]
pub fn encode_base64(data: &[u8]) -> String {
    let raw = STANDARD.encode(data);
    let mut out = String::with_capacity(raw.len() + raw.len() / MAX_LINE_LENGTH * 2);
    for chunk in raw.as_bytes().chunks(MAX_LINE_LENGTH) {
        if !out.is_empty() {
            out.push_str("\r\n");
        }
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
    }
    out
}

/// Decodes Base64 data, ignoring embedded line breaks.
///
/// # Errors
///
/// Returns an error if the input is not valid Base64.
pub fn decode_base64(data: &str) -> Result<Vec<u8>> {
    let stripped: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD.decode(stripped).map_err(Into::into)
}

/// Encodes bytes using Quoted-Printable (RFC 2045).
///
/// CRLF sequences in the input pass through as hard line breaks; soft
/// breaks keep encoded lines under 76 characters.
#[must_use]
pub fn encode_quoted_printable(data: &[u8]) -> String {
    let mut result = String::new();
    let mut line_length = 0;
    let mut i = 0;

    while i < data.len() {
        let byte = data[i];

        if byte == b'\r' && data.get(i + 1) == Some(&b'\n') {
            result.push_str("\r\n");
            line_length = 0;
            i += 2;
            continue;
        }

        if line_length >= MAX_LINE_LENGTH - 3 {
            result.push_str("=\r\n");
            line_length = 0;
        }

        match byte {
            // Printable ASCII except '='.
            b'!'..=b'<' | b'>'..=b'~' => {
                result.push(byte as char);
                line_length += 1;
            }
            b' ' | b'\t' => {
                // Trailing whitespace before a break must be encoded;
                // encode conservatively near the line limit.
                if line_length >= MAX_LINE_LENGTH - 4 {
                    let _ = write!(result, "={byte:02X}");
                    line_length += 3;
                } else {
                    result.push(byte as char);
                    line_length += 1;
                }
            }
            _ => {
                let _ = write!(result, "={byte:02X}");
                line_length += 3;
            }
        }
        i += 1;
    }

    result
}

/// Decodes Quoted-Printable bytes (RFC 2045).
///
/// # Errors
///
/// Returns an error on an incomplete or non-hex escape sequence.
pub fn decode_quoted_printable(data: &[u8]) -> Result<Vec<u8>> {
    let mut result = Vec::with_capacity(data.len());
    let mut i = 0;

    while i < data.len() {
        let byte = data[i];
        if byte != b'=' {
            result.push(byte);
            i += 1;
            continue;
        }

        // Soft line break: =\r\n or =\n.
        if data.get(i + 1) == Some(&b'\r') && data.get(i + 2) == Some(&b'\n') {
            i += 3;
            continue;
        }
        if data.get(i + 1) == Some(&b'\n') {
            i += 2;
            continue;
        }

        let hex = data
            .get(i + 1..i + 3)
            .ok_or_else(|| Error::InvalidEncoding("incomplete escape sequence".to_string()))?;
        let hex = std::str::from_utf8(hex)
            .map_err(|_| Error::InvalidEncoding("non-ASCII escape sequence".to_string()))?;
        let decoded = u8::from_str_radix(hex, 16)
            .map_err(|e| Error::InvalidEncoding(format!("invalid hex escape: {e}")))?;
        result.push(decoded);
        i += 3;
    }

    Ok(result)
}

/// Decodes a body according to its Content-Transfer-Encoding value.
///
/// `7bit`, `8bit`, `binary` and an absent encoding pass through.
///
/// # Errors
///
/// Returns an error if the declared encoding cannot be decoded.
pub fn decode_body(encoding: &str, body: &[u8]) -> Result<Vec<u8>> {
    match encoding.trim().to_ascii_lowercase().as_str() {
        "" | "7bit" | "8bit" | "binary" => Ok(body.to_vec()),
        "base64" => decode_base64(&String::from_utf8_lossy(body)),
        "quoted-printable" => decode_quoted_printable(body),
        other => Err(Error::InvalidEncoding(format!(
            "unknown transfer encoding: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_roundtrip() {
        let data = b"hello, world";
        let encoded = encode_base64(data);
        assert_eq!(decode_base64(&encoded).unwrap(), data);
    }

    #[test]
    fn base64_folds_lines() {
        let data = vec![0xAB_u8; 120];
        let encoded = encode_base64(&data);
        assert!(encoded.lines().all(|l| l.trim_end().len() <= 76));
        assert_eq!(decode_base64(&encoded).unwrap(), data);
    }

    #[test]
    fn qp_passes_plain_text() {
        let encoded = encode_quoted_printable(b"plain text\r\nsecond line");
        assert_eq!(encoded, "plain text\r\nsecond line");
    }

    #[test]
    fn qp_escapes_high_bytes() {
        let encoded = encode_quoted_printable("caf\u{e9}".as_bytes());
        assert_eq!(encoded, "caf=C3=A9");
        assert_eq!(
            decode_quoted_printable(encoded.as_bytes()).unwrap(),
            "caf\u{e9}".as_bytes()
        );
    }

    #[test]
    fn qp_roundtrip_long_line() {
        let data: Vec<u8> = (0..200).map(|i| b'a' + (i % 26) as u8).collect();
        let encoded = encode_quoted_printable(&data);
        assert!(encoded.lines().all(|l| l.len() <= 76));
        assert_eq!(decode_quoted_printable(encoded.as_bytes()).unwrap(), data);
    }

    #[test]
    fn qp_decode_soft_break() {
        assert_eq!(
            decode_quoted_printable(b"foo=\r\nbar").unwrap(),
            b"foobar"
        );
    }

    #[test]
    fn qp_decode_rejects_bad_escape() {
        assert!(decode_quoted_printable(b"bad =Z9 escape").is_err());
        assert!(decode_quoted_printable(b"truncated =A").is_err());
    }

    #[test]
    fn decode_body_dispatch() {
        assert_eq!(decode_body("7bit", b"x").unwrap(), b"x");
        assert_eq!(decode_body("", b"x").unwrap(), b"x");
        assert_eq!(decode_body("BASE64", b"aGk=").unwrap(), b"hi");
        assert_eq!(decode_body("quoted-printable", b"=41").unwrap(), b"A");
        assert!(decode_body("uuencode", b"x").is_err());
    }
}
