//! Serializing [`Msg`] for APPEND and SMTP DATA.

use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::encoding::{encode_base64, encode_quoted_printable};
use crate::{Msg, ParamHeader, Part, Result, format_address, format_address_list};

impl Msg {
    /// Serializes the message in wire form.
    ///
    /// A single part is written inline; several parts become a
    /// `multipart/mixed` body with a random boundary. Each part's
    /// transfer encoding is chosen by [`pick_encoding`].
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` return keeps the signature
    /// stable for encoders that can fail.
    pub fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        let mut top = crate::Header::new();
        if !self.from.is_empty() {
            top.set("From", &format_address(&self.from));
        }
        if !self.to.is_empty() {
            top.set("To", &format_address_list(&self.to));
        }
        if !self.subject.is_empty() {
            top.set("Subject", &self.subject);
        }
        if !self.cc.is_empty() {
            top.set("Cc", &format_address_list(&self.cc));
        }
        if !self.bcc.is_empty() {
            top.set("Bcc", &format_address_list(&self.bcc));
        }
        if !self.reply_to.is_empty() {
            top.set("Reply-To", &format_address(&self.reply_to));
        }
        if !self.message_id.is_empty() {
            top.set("Message-Id", &self.message_id);
        }
        if let Some(date) = self.date {
            top.set("Date", &date.to_rfc2822());
        }
        top.set("MIME-Version", "1.0");
        for (name, value) in self.misc.iter() {
            top.add(name, value);
        }

        match self.parts.as_slice() {
            [] => {
                out.extend_from_slice(&top.to_blob());
                out.extend_from_slice(b"\r\n");
            }
            [single] => write_single(&mut top, single, out),
            parts => write_multipart(&mut top, parts, out),
        }
        Ok(())
    }
}

fn write_single(top: &mut crate::Header, part: &Part, out: &mut Vec<u8>) {
    let body = part.body.as_deref().unwrap_or_default();
    if top.get("Content-Type").is_none() {
        if part.ptype.is_empty() {
            top.set("Content-Type", "text/plain; charset=utf-8");
        } else {
            top.set("Content-Type", &part.ptype.to_string());
        }
    }
    let encoding = pick_encoding(body);
    top.set("Content-Transfer-Encoding", encoding);

    out.extend_from_slice(&top.to_blob());
    out.extend_from_slice(b"\r\n");
    write_encoded(encoding, body, out);
}

fn write_multipart(top: &mut crate::Header, parts: &[Part], out: &mut Vec<u8>) {
    let boundary = random_boundary();
    if top.get("Content-Type").is_none() {
        let ct = ParamHeader::with_params(
            "multipart/mixed",
            vec![("boundary".to_string(), boundary.clone())],
        );
        top.set("Content-Type", &ct.to_string());
    }
    out.extend_from_slice(&top.to_blob());
    out.extend_from_slice(b"\r\n");

    for part in parts {
        out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());

        let mut hdrs = crate::Header::new();
        if part.ptype.is_empty() {
            hdrs.set("Content-Type", "text/plain; charset=utf-8");
        } else {
            hdrs.set("Content-Type", &part.ptype.to_string());
        }
        if !part.disposition.is_empty() {
            hdrs.set("Content-Disposition", &part.disposition.to_string());
        }
        for (name, value) in part.misc.iter() {
            hdrs.add(name, value);
        }

        let body = part.body.as_deref().unwrap_or_default();
        let encoding = pick_encoding(body);
        hdrs.set("Content-Transfer-Encoding", encoding);

        out.extend_from_slice(&hdrs.to_blob());
        out.extend_from_slice(b"\r\n");
        write_encoded(encoding, body, out);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
}

fn write_encoded(encoding: &str, body: &[u8], out: &mut Vec<u8>) {
    match encoding {
        "base64" => out.extend_from_slice(encode_base64(body).as_bytes()),
        "quoted-printable" => out.extend_from_slice(encode_quoted_printable(body).as_bytes()),
        _ => out.extend_from_slice(body),
    }
}

/// Picks a transfer encoding for a body.
///
/// All bytes ASCII-printable (plus CR and LF): `7bit`. More than 75 %
/// printable: `quoted-printable`. Otherwise: `base64`.
#[must_use]
pub fn pick_encoding(body: &[u8]) -> &'static str {
    if body.is_empty() {
        return "7bit";
    }
    let ascii = body
        .iter()
        .filter(|&&b| b < 126 && (b >= 32 || b == b'\n' || b == b'\r'))
        .count();

    if ascii == body.len() {
        "7bit"
    } else if ascii as f64 / body.len() as f64 > 0.75 {
        "quoted-printable"
    } else {
        "base64"
    }
}

fn random_boundary() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("=_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Address, read_msg};

    #[test]
    fn pick_encoding_all_ascii() {
        assert_eq!(pick_encoding(b"plain text\r\nwith lines"), "7bit");
        assert_eq!(pick_encoding(b""), "7bit");
    }

    #[test]
    fn pick_encoding_mostly_ascii() {
        // 1 high byte in 10: > 75 % printable.
        let body = b"abcdefghi\xFF";
        assert_eq!(pick_encoding(body), "quoted-printable");
    }

    #[test]
    fn pick_encoding_binary() {
        let body: Vec<u8> = (0..100).map(|i| if i % 2 == 0 { 0xFF } else { b'a' }).collect();
        assert_eq!(pick_encoding(&body), "base64");
    }

    #[test]
    fn write_read_roundtrip_single() {
        let msg = Msg {
            from: Address::with_name("John", "john@example.com"),
            to: vec![Address::new("jane@example.com")],
            subject: "Round trip".to_string(),
            parts: vec![Part::text("text/plain", b"hello there".to_vec())],
            ..Msg::default()
        };
        let mut raw = Vec::new();
        msg.write(&mut raw).unwrap();

        let parsed = read_msg(&raw).unwrap();
        assert_eq!(parsed.from, msg.from);
        assert_eq!(parsed.to, msg.to);
        assert_eq!(parsed.subject, msg.subject);
        assert_eq!(parsed.parts[0].body, msg.parts[0].body);
    }

    #[test]
    fn write_read_roundtrip_multipart() {
        let msg = Msg {
            from: Address::new("a@x.com"),
            to: vec![Address::new("b@x.com")],
            subject: "Two parts".to_string(),
            parts: vec![
                Part::text("text/plain", b"text body".to_vec()),
                Part {
                    ptype: ParamHeader::new("application/octet-stream"),
                    disposition: ParamHeader::with_params(
                        "attachment",
                        vec![("filename".to_string(), "blob.bin".to_string())],
                    ),
                    size: 4,
                    body: Some(vec![0x00, 0xFF, 0x00, 0xFF]),
                    ..Part::default()
                },
            ],
            ..Msg::default()
        };
        let mut raw = Vec::new();
        msg.write(&mut raw).unwrap();

        let parsed = read_msg(&raw).unwrap();
        assert_eq!(parsed.parts.len(), 2);
        assert_eq!(parsed.parts[0].body.as_deref(), Some(&b"text body"[..]));
        assert_eq!(
            parsed.parts[1].body.as_deref(),
            Some(&[0x00, 0xFF, 0x00, 0xFF][..])
        );
        assert_eq!(parsed.parts[1].filename(), Some("blob.bin"));
    }

    #[test]
    fn quoted_printable_body_roundtrip() {
        let msg = Msg {
            from: Address::new("a@x.com"),
            parts: vec![Part::text("text/plain", "caf\u{e9} time, mostly ascii".as_bytes().to_vec())],
            ..Msg::default()
        };
        let mut raw = Vec::new();
        msg.write(&mut raw).unwrap();
        assert!(
            String::from_utf8_lossy(&raw).contains("Content-Transfer-Encoding: quoted-printable")
        );

        let parsed = read_msg(&raw).unwrap();
        assert_eq!(
            parsed.parts[0].body.as_deref(),
            Some("caf\u{e9} time, mostly ascii".as_bytes())
        );
    }

    #[test]
    fn headerless_body_message() {
        let msg = Msg::default();
        let mut raw = Vec::new();
        msg.write(&mut raw).unwrap();
        assert!(raw.ends_with(b"\r\n"));
    }
}
