//! Transport and framed I/O for the IMAP wire protocol.
//!
//! IMAP responses are CRLF-terminated lines that may carry literals
//! (`{n}` followed by `n` raw bytes). [`FramedStream`] reassembles one
//! complete response per read and enforces the session's per-I/O
//! deadline, which the IDLE loop suspends while parked on the socket.
//!
//! The framing is generic over the byte stream, which is also how the
//! two connection modes share one code path: the account core only
//! accepts `tls` and `starttls` endpoints, so every established
//! session runs on [`ImapStream`] (a TLS stream), and the plaintext
//! phase of a STARTTLS upgrade is just the same generic client driven
//! over the bare TCP socket until [`tls_handshake`] wraps it.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::{Error, Result};

/// The transport of an established session. Plaintext never outlives
/// the STARTTLS upgrade window, so there is exactly one steady-state
/// stream type.
pub type ImapStream = TlsStream<TcpStream>;

/// Runs the client-side TLS handshake over an established TCP
/// connection, trusting the bundled webpki roots.
///
/// # Errors
///
/// Returns an error if the hostname is not a valid TLS server name or
/// the handshake fails.
pub async fn tls_handshake(tcp: TcpStream, host: &str) -> Result<ImapStream> {
    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(host.to_string())?;
    Ok(connector.connect(server_name, tcp).await?)
}

/// Read buffer size.
const BUFFER_SIZE: usize = 8192;

/// Upper bound on a single response line.
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Upper bound on a single literal.
const MAX_LITERAL_SIZE: usize = 128 * 1024 * 1024;

/// Framed connection with an optional per-I/O deadline.
#[derive(Debug)]
pub struct FramedStream<S> {
    reader: BufReader<S>,
    write_buffer: BytesMut,
    io_timeout: Option<Duration>,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a framed stream with the given per-I/O deadline.
    pub fn new(stream: S, io_timeout: Option<Duration>) -> Self {
        Self {
            reader: BufReader::with_capacity(BUFFER_SIZE, stream),
            write_buffer: BytesMut::with_capacity(BUFFER_SIZE),
            io_timeout,
        }
    }

    /// Replaces the per-I/O deadline. `None` disables it (IDLE mode).
    pub fn set_io_timeout(&mut self, io_timeout: Option<Duration>) {
        self.io_timeout = io_timeout;
    }

    /// Reads one complete response: a line plus any literals embedded
    /// in it.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionLost` on EOF, `Timeout` past the per-I/O
    /// deadline and `Protocol` on oversized frames.
    pub async fn read_response(&mut self) -> Result<Vec<u8>> {
        let io_timeout = self.io_timeout;
        let reader = &mut self.reader;
        let fut = async move {
            let mut response = Vec::new();
            loop {
                let line = read_line(reader).await?;
                response.extend_from_slice(&line);

                if let Some(literal_len) = parse_literal_length(&line) {
                    if literal_len > MAX_LITERAL_SIZE {
                        return Err(Error::Protocol(format!(
                            "literal too large: {literal_len} bytes"
                        )));
                    }
                    let mut literal = vec![0_u8; literal_len];
                    reader.read_exact(&mut literal).await?;
                    response.extend_from_slice(&literal);
                    // More of the line may follow the literal.
                } else {
                    return Ok(response);
                }
            }
        };
        match io_timeout {
            Some(dur) => timeout(dur, fut).await.map_err(|_| Error::Timeout(dur))?,
            None => fut.await,
        }
    }

    /// Writes one command line (already CRLF-terminated).
    ///
    /// # Errors
    ///
    /// Returns `Timeout` past the per-I/O deadline or the underlying
    /// I/O error.
    pub async fn write_command(&mut self, data: &[u8]) -> Result<()> {
        self.write_buffer.clear();
        self.write_buffer.extend_from_slice(data);
        let io_timeout = self.io_timeout;
        let reader = &mut self.reader;
        let buf = &self.write_buffer;
        let fut = async move {
            let stream = reader.get_mut();
            stream.write_all(buf).await?;
            stream.flush().await?;
            Ok(())
        };
        match io_timeout {
            Some(dur) => timeout(dur, fut).await.map_err(|_| Error::Timeout(dur))?,
            None => fut.await,
        }
    }

    /// Writes raw bytes (literal payloads).
    ///
    /// # Errors
    ///
    /// Same failure modes as [`FramedStream::write_command`].
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let io_timeout = self.io_timeout;
        let reader = &mut self.reader;
        let fut = async move {
            let stream = reader.get_mut();
            stream.write_all(data).await?;
            stream.flush().await?;
            Ok(())
        };
        match io_timeout {
            Some(dur) => timeout(dur, fut).await.map_err(|_| Error::Timeout(dur))?,
            None => fut.await,
        }
    }

    /// Consumes the framing and returns the inner stream (STARTTLS
    /// upgrade point). Buffered data is dropped.
    pub fn into_inner(self) -> S {
        self.reader.into_inner()
    }
}

/// Reads a single CRLF-terminated line.
async fn read_line<S>(reader: &mut BufReader<S>) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Err(Error::ConnectionLost("connection closed by peer".to_string()));
        }

        if let Some(pos) = find_crlf(buf) {
            line.extend_from_slice(&buf[..pos + 2]);
            reader.consume(pos + 2);
            return Ok(line);
        }

        let len = buf.len();
        line.extend_from_slice(buf);
        reader.consume(len);

        if line.len() > MAX_LINE_LENGTH {
            return Err(Error::Protocol("response line too long".to_string()));
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Parses a literal length from the end of a line: `{123}` or `{123+}`.
fn parse_literal_length(line: &[u8]) -> Option<usize> {
    let line = line.strip_suffix(b"\r\n")?;
    let open = line.iter().rposition(|&b| b == b'{')?;
    let inner = line.get(open + 1..line.len().checked_sub(1)?)?;
    if !line.ends_with(b"}") {
        return None;
    }
    let inner = inner.strip_suffix(b"+").unwrap_or(inner);
    std::str::from_utf8(inner).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_length_forms() {
        assert_eq!(parse_literal_length(b"BODY {123}\r\n"), Some(123));
        assert_eq!(parse_literal_length(b"BODY {123+}\r\n"), Some(123));
        assert_eq!(parse_literal_length(b"{0}\r\n"), Some(0));
        assert_eq!(parse_literal_length(b"no literal\r\n"), None);
        assert_eq!(parse_literal_length(b"partial {12"), None);
        assert_eq!(parse_literal_length(b"{abc}\r\n"), None);
    }

    #[tokio::test]
    async fn read_simple_line() {
        let mock = tokio_test::io::Builder::new().read(b"* OK ready\r\n").build();
        let mut framed = FramedStream::new(mock, None);
        let response = framed.read_response().await.unwrap();
        assert_eq!(response, b"* OK ready\r\n");
    }

    #[tokio::test]
    async fn read_response_with_literal() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* 1 FETCH (BODY[1] {5}\r\n")
            .read(b"hello)\r\n")
            .build();
        let mut framed = FramedStream::new(mock, None);
        let response = framed.read_response().await.unwrap();
        assert_eq!(response, b"* 1 FETCH (BODY[1] {5}\r\nhello)\r\n");
    }

    #[tokio::test]
    async fn eof_is_connection_lost() {
        let mock = tokio_test::io::Builder::new().build();
        let mut framed = FramedStream::new(mock, None);
        let err = framed.read_response().await.unwrap_err();
        assert!(err.is_connection_lost());
    }

    #[tokio::test]
    async fn write_command_passes_through() {
        let mock = tokio_test::io::Builder::new()
            .write(b"A001 NOOP\r\n")
            .build();
        let mut framed = FramedStream::new(mock, None);
        framed.write_command(b"A001 NOOP\r\n").await.unwrap();
    }

    #[tokio::test]
    async fn oversized_literal_is_rejected() {
        let header = format!("* 1 FETCH (BODY {{{}}}\r\n", MAX_LITERAL_SIZE + 1);
        let mock = tokio_test::io::Builder::new()
            .read(header.as_bytes())
            .build();
        let mut framed = FramedStream::new(mock, None);
        assert!(framed.read_response().await.is_err());
    }

    #[tokio::test]
    async fn io_timeout_fires() {
        let mock = tokio_test::io::Builder::new()
            .wait(Duration::from_millis(50))
            .read(b"* OK late\r\n")
            .build();
        let mut framed = FramedStream::new(mock, Some(Duration::from_millis(5)));
        let err = framed.read_response().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn io_timeout_can_be_disabled() {
        let mock = tokio_test::io::Builder::new()
            .wait(Duration::from_millis(20))
            .read(b"* OK late\r\n")
            .build();
        let mut framed = FramedStream::new(mock, Some(Duration::from_millis(5)));
        framed.set_io_timeout(None);
        assert!(framed.read_response().await.is_ok());
    }
}
