//! On-disk configuration: the global file and per-account files under
//! the mailbox home directory.
//!
//! Layout:
//!
//! ```text
//! <home>/global.yml          — connection and encryption settings
//! <home>/accounts/<name>.yml — one account
//! <home>/accounts/<name>.db  — that account's message cache
//! ```
//!
//! `<home>` is `$MAILBOX_HOME` when set, otherwise the platform config
//! directory (`$XDG_CONFIG_HOME/mailbox` on Unix,
//! `%USERPROFILE%\AppData\Roaming\mailbox` on Windows).

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default number of attempts for retried network operations.
pub const DEFAULT_MAX_TRIES: u32 = 5;

/// Resolves the mailbox home directory.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Ok(home) = std::env::var("MAILBOX_HOME") {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    if cfg!(windows) {
        let profile = std::env::var("USERPROFILE").unwrap_or_default();
        return PathBuf::from(profile)
            .join("AppData")
            .join("Roaming")
            .join("mailbox");
    }
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("mailbox");
        }
    }
    PathBuf::from(std::env::var("HOME").unwrap_or_default())
        .join(".config")
        .join("mailbox")
}

/// Path of an account's cache database.
#[must_use]
pub fn cache_db_path(account_id: &str) -> PathBuf {
    config_dir().join("accounts").join(format!("{account_id}.db"))
}

fn account_cfg_path(account_id: &str) -> PathBuf {
    config_dir().join("accounts").join(format!("{account_id}.yml"))
}

/// Connection-related global settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Attempts per retried network operation. `None` means default.
    #[serde(default)]
    pub max_tries: Option<u32>,
}

impl ConnectionConfig {
    /// The effective attempt count.
    #[must_use]
    pub fn effective_max_tries(&self) -> u32 {
        self.max_tries.unwrap_or(DEFAULT_MAX_TRIES)
    }
}

/// Encryption-related global settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Whether a user-chosen master password protects stored secrets.
    #[serde(default)]
    pub use_master_pass: bool,
    /// Hex-encoded 64-byte Argon2 salt; generated on first launch.
    #[serde(default)]
    pub master_key_salt: String,
}

/// Contents of `global.yml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Encryption settings.
    #[serde(default)]
    pub encryption: EncryptionConfig,
}

/// One server endpoint in an account config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEndpoint {
    /// Hostname.
    pub host: String,
    /// Port.
    pub port: u16,
    /// `tls` or `starttls`.
    pub encryption: String,
}

impl Default for ServerEndpoint {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            encryption: "tls".to_string(),
        }
    }
}

/// The `server:` section of an account config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSection {
    /// IMAP endpoint.
    pub imap: ServerEndpoint,
    /// SMTP endpoint.
    pub smtp: ServerEndpoint,
}

/// The `credentials:` section of an account config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    /// Login user.
    pub user: String,
    /// Hex of IV ‖ AES-256-CFB(BLAKE2b-512(password) ‖ password).
    /// Empty means "prompt at load".
    #[serde(default)]
    pub pass: String,
}

/// Logical directory-role assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirRoles {
    /// Drafts directory.
    #[serde(default = "default_drafts")]
    pub drafts: String,
    /// Sent directory.
    #[serde(default = "default_sent")]
    pub sent: String,
    /// Trash directory.
    #[serde(default = "default_trash")]
    pub trash: String,
    /// Directories whose text parts are downloaded for offline use.
    #[serde(default = "default_offline")]
    pub download_for_offline: Vec<String>,
}

fn default_drafts() -> String {
    "Drafts".to_string()
}

fn default_sent() -> String {
    "Sent".to_string()
}

fn default_trash() -> String {
    "Trash".to_string()
}

fn default_offline() -> Vec<String> {
    vec!["INBOX".to_string()]
}

impl Default for DirRoles {
    fn default() -> Self {
        Self {
            drafts: default_drafts(),
            sent: default_sent(),
            trash: default_trash(),
            download_for_offline: default_offline(),
        }
    }
}

const fn default_copy_to_sent() -> bool {
    true
}

/// Contents of `accounts/<name>.yml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Display name of the account.
    #[serde(default)]
    pub account_name: String,
    /// Display name used in the From header.
    #[serde(default)]
    pub sender_name: String,
    /// Address used in the From header.
    #[serde(default)]
    pub sender_email: String,
    /// IMAP and SMTP endpoints.
    pub server: ServerSection,
    /// Login credentials.
    pub credentials: Credentials,
    /// Directory-role assignment.
    #[serde(default)]
    pub dirs: DirRoles,
    /// Whether sent messages are copied into the Sent directory.
    #[serde(default = "default_copy_to_sent")]
    pub copy_to_sent: bool,
}

impl AccountConfig {
    fn validate(&self) -> Result<()> {
        for (what, endpoint) in [("imap", &self.server.imap), ("smtp", &self.server.smtp)] {
            if endpoint.encryption != "tls" && endpoint.encryption != "starttls" {
                return Err(Error::Validation(format!(
                    "{what} encryption must be 'tls' or 'starttls', got '{}'",
                    endpoint.encryption
                )));
            }
        }
        Ok(())
    }
}

/// Loads `global.yml`, creating it with defaults when missing.
///
/// # Errors
///
/// Returns an error when the directory cannot be created or the file
/// is unreadable/malformed.
pub fn load_global() -> Result<GlobalConfig> {
    let dir = config_dir();
    fs::create_dir_all(&dir)?;
    let path = dir.join("global.yml");

    match fs::read_to_string(&path) {
        Ok(text) => Ok(serde_yaml::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let cfg = GlobalConfig::default();
            save_global(&cfg)?;
            Ok(cfg)
        }
        Err(e) => Err(e.into()),
    }
}

/// Writes `global.yml`.
///
/// # Errors
///
/// Returns an error when the file cannot be written.
pub fn save_global(cfg: &GlobalConfig) -> Result<()> {
    let dir = config_dir();
    fs::create_dir_all(&dir)?;
    fs::write(dir.join("global.yml"), serde_yaml::to_string(cfg)?)?;
    Ok(())
}

/// Loads one account config and validates it.
///
/// # Errors
///
/// Returns an error when the file is missing, malformed, or declares
/// an unknown encryption mode.
pub fn load_account(account_id: &str) -> Result<AccountConfig> {
    let text = fs::read_to_string(account_cfg_path(account_id))?;
    let cfg: AccountConfig = serde_yaml::from_str(&text)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Writes one account config.
///
/// # Errors
///
/// Returns an error when the file cannot be written.
pub fn save_account(account_id: &str, cfg: &AccountConfig) -> Result<()> {
    let dir = config_dir().join("accounts");
    fs::create_dir_all(&dir)?;
    fs::write(
        account_cfg_path(account_id),
        serde_yaml::to_string(cfg)?,
    )?;
    Ok(())
}

/// Removes one account config file.
///
/// # Errors
///
/// Returns an error when the file exists but cannot be removed.
pub fn delete_account(account_id: &str) -> Result<()> {
    match fs::remove_file(account_cfg_path(account_id)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Discovers every `accounts/*.yml` file.
///
/// # Errors
///
/// Returns an error when a present file fails to load; a missing
/// accounts directory yields an empty map.
pub fn load_all_accounts() -> Result<BTreeMap<String, AccountConfig>> {
    let dir = config_dir().join("accounts");
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };

    let mut accounts = BTreeMap::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "yml") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        accounts.insert(name.to_string(), load_account(name)?);
    }
    Ok(accounts)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The config root comes from the environment, so these tests
    // redirect MAILBOX_HOME into a tempdir and run serially.
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn scoped_home(dir: &std::path::Path) -> MutexGuard<'static, ()> {
        let guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var("MAILBOX_HOME", dir);
        guard
    }

    fn sample_account() -> AccountConfig {
        AccountConfig {
            account_name: "work".to_string(),
            sender_name: "John Doe".to_string(),
            sender_email: "john@example.com".to_string(),
            server: ServerSection {
                imap: ServerEndpoint {
                    host: "imap.example.com".to_string(),
                    port: 993,
                    encryption: "tls".to_string(),
                },
                smtp: ServerEndpoint {
                    host: "smtp.example.com".to_string(),
                    port: 587,
                    encryption: "starttls".to_string(),
                },
            },
            credentials: Credentials {
                user: "john".to_string(),
                pass: String::new(),
            },
            dirs: DirRoles::default(),
            copy_to_sent: true,
        }
    }

    #[test]
    fn global_roundtrip_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let _guard = scoped_home(tmp.path());

        let cfg = load_global().unwrap();
        assert_eq!(cfg.connection.effective_max_tries(), DEFAULT_MAX_TRIES);
        assert!(!cfg.encryption.use_master_pass);
        assert!(tmp.path().join("global.yml").exists());

        let mut cfg = cfg;
        cfg.connection.max_tries = Some(3);
        cfg.encryption.master_key_salt = "ab".repeat(64);
        save_global(&cfg).unwrap();

        let reloaded = load_global().unwrap();
        assert_eq!(reloaded.connection.effective_max_tries(), 3);
        assert_eq!(reloaded.encryption.master_key_salt, "ab".repeat(64));
    }

    #[test]
    fn account_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let _guard = scoped_home(tmp.path());

        save_account("work", &sample_account()).unwrap();
        let loaded = load_account("work").unwrap();
        assert_eq!(loaded.sender_email, "john@example.com");
        assert_eq!(loaded.server.smtp.encryption, "starttls");
        assert_eq!(loaded.dirs.trash, "Trash");
        assert_eq!(loaded.dirs.download_for_offline, vec!["INBOX"]);
        assert!(loaded.copy_to_sent);

        let all = load_all_accounts().unwrap();
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("work"));

        delete_account("work").unwrap();
        assert!(load_all_accounts().unwrap().is_empty());
        // Deleting again is fine.
        delete_account("work").unwrap();
    }

    #[test]
    fn bad_encryption_mode_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let _guard = scoped_home(tmp.path());

        let mut cfg = sample_account();
        cfg.server.imap.encryption = "plain".to_string();
        save_account("bad", &cfg).unwrap();
        assert!(load_account("bad").is_err());
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let tmp = tempfile::tempdir().unwrap();
        let _guard = scoped_home(tmp.path());

        let minimal = "\
server:
  imap: {host: imap.example.com, port: 993, encryption: tls}
  smtp: {host: smtp.example.com, port: 465, encryption: tls}
credentials: {user: u}
";
        fs::create_dir_all(tmp.path().join("accounts")).unwrap();
        fs::write(tmp.path().join("accounts").join("min.yml"), minimal).unwrap();

        let cfg = load_account("min").unwrap();
        assert_eq!(cfg.dirs.drafts, "Drafts");
        assert_eq!(cfg.dirs.sent, "Sent");
        assert!(cfg.copy_to_sent);
        assert!(cfg.credentials.pass.is_empty());
    }

    #[test]
    fn cache_path_shape() {
        let tmp = tempfile::tempdir().unwrap();
        let _guard = scoped_home(tmp.path());
        let path = cache_db_path("work");
        assert!(path.ends_with("accounts/work.db"));
    }
}
