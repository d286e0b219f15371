//! The SMTP submission client.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use mailbox_mime::Msg;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::reply::{Reply, parse_reply_line};
use crate::{Error, Result};

/// The transport of an established submission. Both supported modes
/// end encrypted; plaintext exists only inside the STARTTLS upgrade.
type SmtpStream = TlsStream<TcpStream>;

/// Deadline for the whole connect + greeting + EHLO sequence.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-reply deadline after connect.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Hostname announced in EHLO.
const LOCAL_NAME: &str = "localhost.localdomain";

/// Connection security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmtpSecurity {
    /// TLS from the first byte (submission port 465).
    #[default]
    Tls,
    /// Plaintext connect upgraded with STARTTLS (port 587). The
    /// extension must be advertised; absence is a hard error.
    StartTls,
}

/// Server endpoint and credentials for one submission.
#[derive(Clone)]
pub struct SmtpConfig {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Security mode.
    pub security: SmtpSecurity,
    /// Login user; empty means anonymous submission.
    pub user: String,
    /// Login password.
    pub pass: String,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("security", &self.security)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// One SMTP connection: `connect` → `auth` → `send` → `quit`.
pub struct SmtpClient {
    stream: BufReader<SmtpStream>,
    extensions: HashSet<String>,
    auth_mechanisms: Vec<String>,
}

impl SmtpClient {
    /// Connects, reads the greeting, performs EHLO and (for
    /// [`SmtpSecurity::StartTls`]) the TLS upgrade plus a second EHLO.
    /// The whole sequence runs under a 30-second deadline.
    ///
    /// # Errors
    ///
    /// Returns an error on dial/handshake failure, a negative
    /// greeting, or a STARTTLS server lacking the extension.
    pub async fn connect(config: &SmtpConfig) -> Result<Self> {
        timeout(CONNECT_TIMEOUT, Self::connect_inner(config))
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn connect_inner(config: &SmtpConfig) -> Result<Self> {
        let tcp = TcpStream::connect((config.host.as_str(), config.port)).await?;
        let tls = match config.security {
            SmtpSecurity::Tls => tls_handshake(tcp, &config.host).await?,
            SmtpSecurity::StartTls => {
                // Greeting, capability discovery and the upgrade
                // command itself run in plaintext over the bare TCP
                // stream.
                let mut reader = BufReader::new(tcp);
                read_reply(&mut reader).await?.into_result()?;
                let ehlo = exchange(&mut reader, &format!("EHLO {LOCAL_NAME}"))
                    .await?
                    .into_result()?;
                let starttls_offered = ehlo.lines.iter().skip(1).any(|line| {
                    line.split_whitespace()
                        .next()
                        .is_some_and(|word| word.eq_ignore_ascii_case("STARTTLS"))
                });
                if !starttls_offered {
                    return Err(Error::NotSupported("STARTTLS".to_string()));
                }
                exchange(&mut reader, "STARTTLS").await?.into_result()?;
                tls_handshake(reader.into_inner(), &config.host).await?
            }
        };

        let mut client = Self {
            stream: BufReader::new(tls),
            extensions: HashSet::new(),
            auth_mechanisms: Vec::new(),
        };

        if config.security == SmtpSecurity::Tls {
            client.read_reply().await?;
        }
        // Extensions are (re-)learned on the encrypted channel.
        client.ehlo().await?;
        Ok(client)
    }

    /// Authenticates with the best mechanism the server offers: PLAIN
    /// when credentials are configured, ANONYMOUS otherwise. A server
    /// without AUTH is accepted only for anonymous submission.
    ///
    /// # Errors
    ///
    /// Returns an error when no usable mechanism exists or the server
    /// refuses the credentials.
    pub async fn auth(&mut self, config: &SmtpConfig) -> Result<()> {
        if !self.extensions.contains("AUTH") {
            if config.user.is_empty() {
                return Ok(());
            }
            return Err(Error::Auth("server offers no AUTH".to_string()));
        }

        if !config.user.is_empty() && self.auth_mechanisms.iter().any(|m| m == "PLAIN") {
            let payload = BASE64.encode(format!("\0{}\0{}", config.user, config.pass));
            self.command(&format!("AUTH PLAIN {payload}")).await?;
            debug!(user = %config.user, "authenticated");
            Ok(())
        } else if self.auth_mechanisms.iter().any(|m| m == "ANONYMOUS") {
            self.command(&format!("AUTH ANONYMOUS {}", BASE64.encode("anonymous")))
                .await?;
            Ok(())
        } else if config.user.is_empty() {
            Ok(())
        } else {
            Err(Error::Auth("no supported auth mechanism".to_string()))
        }
    }

    /// Sends one message. Envelope recipients are taken from the To,
    /// Cc and Bcc headers; the sender from the From header.
    ///
    /// # Errors
    ///
    /// Returns an error when the server refuses the sender, any
    /// recipient, or the message data.
    pub async fn send(&mut self, msg: &Msg) -> Result<()> {
        self.command(&format!("MAIL FROM:<{}>", msg.from.address))
            .await?;

        for rcpt in msg.recipients() {
            if let Err(e) = self.command(&format!("RCPT TO:<{}>", rcpt.address)).await {
                self.command("RSET").await.ok();
                return Err(e);
            }
        }

        let reply = self.command_raw("DATA").await?;
        if reply.code != 354 {
            self.command("RSET").await.ok();
            return Err(Error::Server {
                code: reply.code,
                message: reply.text(),
            });
        }

        let mut body = Vec::new();
        msg.write(&mut body)?;
        self.write_dot_stuffed(&body).await?;
        self.read_reply().await?;
        Ok(())
    }

    /// Sends QUIT and drops the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn quit(mut self) -> Result<()> {
        self.command("QUIT").await?;
        Ok(())
    }

    // === Internals ===

    async fn ehlo(&mut self) -> Result<()> {
        let reply = self.command_raw(&format!("EHLO {LOCAL_NAME}")).await?;
        let reply = reply.into_result()?;
        self.extensions.clear();
        self.auth_mechanisms.clear();
        // First line is the server greeting, the rest are extensions.
        for line in reply.lines.iter().skip(1) {
            let mut words = line.split_whitespace();
            let Some(keyword) = words.next() else {
                continue;
            };
            let keyword = keyword.to_ascii_uppercase();
            if keyword == "AUTH" {
                self.auth_mechanisms = words.map(|w| w.to_ascii_uppercase()).collect();
            }
            self.extensions.insert(keyword);
        }
        Ok(())
    }

    /// Sends a command and requires a positive reply.
    async fn command(&mut self, line: &str) -> Result<Reply> {
        self.command_raw(line).await?.into_result()
    }

    /// Sends a command and returns whatever reply came back.
    async fn command_raw(&mut self, line: &str) -> Result<Reply> {
        exchange(&mut self.stream, line).await
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        read_reply(&mut self.stream).await?.into_result()
    }

    /// Writes the DATA payload with dot-stuffing and the final
    /// `CRLF.CRLF` terminator.
    async fn write_dot_stuffed(&mut self, body: &[u8]) -> Result<()> {
        let stuffed = dot_stuff(body);
        let stream = self.stream.get_mut();
        stream.write_all(&stuffed).await?;
        stream.flush().await?;
        Ok(())
    }
}

/// Runs the client-side TLS handshake over an established TCP
/// connection, trusting the bundled webpki roots.
async fn tls_handshake(tcp: TcpStream, host: &str) -> Result<SmtpStream> {
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

/// Writes one command line and reads the (possibly multiline) reply.
/// Generic over the stream so the plaintext STARTTLS phase and the
/// established TLS session share it.
async fn exchange<S>(reader: &mut BufReader<S>, line: &str) -> Result<Reply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let stream = reader.get_mut();
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await?;
    read_reply(reader).await
}

/// Reads one complete reply, joining continuation lines.
async fn read_reply<S>(reader: &mut BufReader<S>) -> Result<Reply>
where
    S: AsyncRead + Unpin,
{
    let mut lines = Vec::new();
    let mut code = 0;
    loop {
        let mut line = String::new();
        let n = timeout(REPLY_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| Error::Timeout)??;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed",
            )));
        }
        let (line_code, last, text) = parse_reply_line(&line)?;
        if code != 0 && line_code != code {
            return Err(Error::MalformedReply(format!(
                "code changed mid-reply: {code} then {line_code}"
            )));
        }
        code = line_code;
        lines.push(text);
        if last {
            return Ok(Reply { code, lines });
        }
    }
}

/// Dot-stuffs a DATA payload (RFC 5321 §4.5.2) and appends the
/// end-of-data marker.
fn dot_stuff(body: &[u8]) -> Vec<u8> {
    let mut stuffed = Vec::with_capacity(body.len() + 8);
    let mut at_line_start = true;
    for &b in body {
        if at_line_start && b == b'.' {
            stuffed.push(b'.');
        }
        stuffed.push(b);
        at_line_start = b == b'\n';
    }
    if !stuffed.ends_with(b"\r\n") {
        stuffed.extend_from_slice(b"\r\n");
    }
    stuffed.extend_from_slice(b".\r\n");
    stuffed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_stuffing() {
        assert_eq!(dot_stuff(b"hello\r\n.world\r\n"), b"hello\r\n..world\r\n.\r\n");
        assert_eq!(dot_stuff(b"."), b"..\r\n.\r\n");
        assert_eq!(dot_stuff(b"no dots"), b"no dots\r\n.\r\n");
    }

    #[test]
    fn config_debug_hides_password() {
        let cfg = SmtpConfig {
            host: "smtp.example.com".to_string(),
            port: 465,
            security: SmtpSecurity::Tls,
            user: "u".to_string(),
            pass: "secret".to_string(),
        };
        assert!(!format!("{cfg:?}").contains("secret"));
    }
}
