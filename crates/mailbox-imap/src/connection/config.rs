//! Server connection configuration.

use std::time::Duration;

/// Connection security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    /// TLS from the first byte. **Recommended.**
    #[default]
    Tls,
    /// Plaintext connect upgraded with STARTTLS. The server must
    /// advertise the capability; absence is a hard error.
    StartTls,
}

/// Everything needed to (re-)establish and authenticate one session.
///
/// The session keeps a copy so reconnection never needs the caller.
#[derive(Clone)]
pub struct ServerConfig {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Security mode.
    pub security: Security,
    /// Login user.
    pub user: String,
    /// Login password.
    pub pass: String,
    /// Deadline for the whole connect + handshake sequence.
    pub connect_timeout: Duration,
    /// Per-I/O deadline once connected. Suspended while idling.
    pub io_timeout: Duration,
}

impl ServerConfig {
    /// Creates a configuration with the standard timeouts: 15 s to
    /// connect, 30 s per subsequent I/O.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, security: Security) -> Self {
        Self {
            host: host.into(),
            port,
            security,
            user: String::new(),
            pass: String::new(),
            connect_timeout: Duration::from_secs(15),
            io_timeout: Duration::from_secs(30),
        }
    }

    /// Sets the credentials.
    #[must_use]
    pub fn credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = user.into();
        self.pass = pass.into();
        self
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Credentials stay out of logs.
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("security", &self.security)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}
