//! The top-level client: one [`AccountController`] per account, the
//! master key, and account lifecycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use mailbox_imap::MessageInfo;
use mailbox_mime as mime;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::account::AccountController;
use crate::config::{self, AccountConfig, GlobalConfig};
use crate::crypto::{MasterKey, system_identity};
use crate::hooks::FrontendHooks;
use crate::search::{SearchCriteria, SearchResult};
use crate::{Error, Result};

/// Why one account failed to load. Recorded, never fatal to launch.
#[derive(Debug, Clone, Error)]
#[error("account {account_id}: {message}")]
pub struct AccountError {
    /// The account that failed.
    pub account_id: String,
    /// The failure, rendered.
    pub message: String,
}

struct AccountEntry {
    controller: Arc<AccountController>,
    config: AccountConfig,
    /// Kept in memory so `change_master_pass` can re-seal it.
    password: String,
}

/// The mailbox core as the frontend sees it.
pub struct Client {
    global: StdMutex<GlobalConfig>,
    master_key: StdMutex<MasterKey>,
    hooks: Arc<dyn FrontendHooks>,
    accounts: RwLock<HashMap<String, AccountEntry>>,
    skipped: StdMutex<Vec<AccountError>>,
}

impl Client {
    /// Reads the configuration, derives the master key (prompting for
    /// the master password when one is configured) and brings every
    /// discovered account online. A failing account is recorded in
    /// [`Client::skipped_accounts`] and does not abort the launch.
    ///
    /// # Errors
    ///
    /// Returns an error when the global configuration is unreadable,
    /// the prompt is rejected, or key derivation fails.
    pub async fn launch(hooks: Arc<dyn FrontendHooks>) -> Result<Self> {
        info!("loading configuration");
        let mut global = config::load_global()?;

        let pass = if global.encryption.use_master_pass {
            hooks
                .password_prompt("Enter master password: ")
                .ok_or(Error::PasswordPromptRejected)?
        } else {
            system_identity()
        };

        if global.encryption.master_key_salt.is_empty() {
            global.encryption.master_key_salt = MasterKey::generate_salt();
            config::save_global(&global)?;
        }
        let master_key = MasterKey::derive(&pass, &global.encryption.master_key_salt)?;

        let client = Self {
            global: StdMutex::new(global),
            master_key: StdMutex::new(master_key),
            hooks,
            accounts: RwLock::new(HashMap::new()),
            skipped: StdMutex::new(Vec::new()),
        };

        for (name, cfg) in config::load_all_accounts()? {
            info!(account = %name, "setting up account");
            if let Err(e) = client.load_account(&name, cfg).await {
                warn!(account = %name, error = %e, "account skipped");
                client
                    .skipped
                    .lock()
                    .expect("lock poisoned")
                    .push(AccountError {
                        account_id: name,
                        message: e.to_string(),
                    });
            }
        }

        Ok(client)
    }

    /// Accounts that failed to load during [`Client::launch`].
    #[must_use]
    pub fn skipped_accounts(&self) -> Vec<AccountError> {
        self.skipped.lock().expect("lock poisoned").clone()
    }

    /// Unloads every account.
    pub async fn stop(&self) {
        let ids: Vec<String> = self.accounts.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.unload_account(&id).await {
                warn!(account = %id, error = %e, "unload failed during stop");
            }
        }
    }

    /// Registers a new account and brings it online. The password is
    /// sealed with the master key before it is written out.
    ///
    /// # Errors
    ///
    /// Surfaces configuration write and load failures.
    pub async fn add_account(
        &self,
        account_id: &str,
        mut cfg: AccountConfig,
        password: &str,
        update_config: bool,
    ) -> Result<()> {
        cfg.credentials.pass = {
            let key = self.master_key.lock().expect("lock poisoned");
            hex::encode(key.encrypt(password.as_bytes()))
        };
        if update_config {
            info!(account = %account_id, "writing account configuration");
            config::save_account(account_id, &cfg)?;
        }
        self.load_account(account_id, cfg).await
    }

    /// Brings a configured account online: decrypts (or prompts for)
    /// its password, connects, and starts prefetching in the
    /// background.
    ///
    /// # Errors
    ///
    /// Surfaces connection, authentication and cache failures.
    pub async fn load_account(&self, account_id: &str, cfg: AccountConfig) -> Result<()> {
        let password = self.account_password(&cfg)?;
        let max_tries = self
            .global
            .lock()
            .expect("lock poisoned")
            .connection
            .effective_max_tries();

        let controller = AccountController::load(
            account_id.to_string(),
            cfg.clone(),
            password.clone(),
            max_tries,
            self.hooks.clone(),
        )
        .await?;

        self.accounts.write().await.insert(
            account_id.to_string(),
            AccountEntry {
                controller: controller.clone(),
                config: cfg,
                password,
            },
        );

        // Early data population runs in the background; a failure
        // leaves the cache cold, not the account broken.
        let prefetcher = controller.clone();
        tokio::spawn(async move {
            if let Err(e) = prefetcher.prefetch().await {
                warn!(account = %prefetcher.id(), error = %e, "prefetch failed");
            }
        });

        Ok(())
    }

    /// Takes an account offline: stops its IDLE loop, dispatcher and
    /// event loop (each interrupt + ack), closes the session and the
    /// cache.
    ///
    /// # Errors
    ///
    /// Fails when the account is not loaded.
    pub async fn unload_account(&self, account_id: &str) -> Result<()> {
        let entry = self
            .accounts
            .write()
            .await
            .remove(account_id)
            .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))?;
        entry.controller.unload().await;
        Ok(())
    }

    /// Unloads an account and erases its configuration and cache.
    ///
    /// # Errors
    ///
    /// Surfaces filesystem failures; an already-unloaded account is
    /// fine.
    pub async fn delete_account(&self, account_id: &str) -> Result<()> {
        match self.unload_account(account_id).await {
            Ok(()) | Err(Error::AccountNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        config::delete_account(account_id)?;
        match std::fs::remove_file(config::cache_db_path(account_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Changes the master password (empty disables it, falling back to
    /// the system identity) and re-encrypts every stored account
    /// password in one pass: everything is re-sealed in memory first,
    /// then the global config and every account file are written.
    ///
    /// # Errors
    ///
    /// Surfaces derivation and write failures.
    pub async fn change_master_pass(&self, pass: &str) -> Result<()> {
        let use_master = !pass.is_empty();
        let effective = if use_master {
            pass.to_string()
        } else {
            system_identity()
        };
        let salt = MasterKey::generate_salt();
        let key = MasterKey::derive(&effective, &salt)?;

        let mut accounts = self.accounts.write().await;
        let staged: Vec<(String, AccountConfig)> = accounts
            .iter()
            .map(|(id, entry)| {
                let mut cfg = entry.config.clone();
                cfg.credentials.pass = hex::encode(key.encrypt(entry.password.as_bytes()));
                (id.clone(), cfg)
            })
            .collect();

        {
            let mut global = self.global.lock().expect("lock poisoned");
            global.encryption.use_master_pass = use_master;
            global.encryption.master_key_salt = salt;
            config::save_global(&global)?;
        }
        for (id, cfg) in &staged {
            config::save_account(id, cfg)?;
        }
        for (id, cfg) in staged {
            if let Some(entry) = accounts.get_mut(&id) {
                entry.config = cfg;
            }
        }
        *self.master_key.lock().expect("lock poisoned") = key;
        Ok(())
    }

    // === Per-account delegation ===

    /// All directories of an account, normalized.
    ///
    /// # Errors
    ///
    /// Fails when the account is not loaded or the operation fails.
    pub async fn get_dirs(&self, account_id: &str) -> Result<Vec<String>> {
        self.controller(account_id).await?.get_dirs().await
    }

    /// Unread count of one directory.
    ///
    /// # Errors
    ///
    /// Fails when the account is not loaded or the operation fails.
    pub async fn get_unread_count(&self, account_id: &str, dir: &str) -> Result<u32> {
        self.controller(account_id)
            .await?
            .get_unread_count(dir)
            .await
    }

    /// Full message list of one directory.
    ///
    /// # Errors
    ///
    /// Fails when the account is not loaded or the operation fails.
    pub async fn get_msgs_list(&self, account_id: &str, dir: &str) -> Result<Vec<MessageInfo>> {
        self.controller(account_id).await?.get_msgs_list(dir).await
    }

    /// Headers and text parts of one message.
    ///
    /// # Errors
    ///
    /// Fails when the account is not loaded or the operation fails.
    pub async fn get_msg_text(
        &self,
        account_id: &str,
        dir: &str,
        uid: u32,
        allow_outdated: bool,
    ) -> Result<mime::Msg> {
        self.controller(account_id)
            .await?
            .get_msg_text(dir, uid, allow_outdated)
            .await
    }

    /// One message part, uncached.
    ///
    /// # Errors
    ///
    /// Fails when the account is not loaded or the operation fails.
    pub async fn get_msg_part(
        &self,
        account_id: &str,
        dir: &str,
        uid: u32,
        part_index: usize,
    ) -> Result<mime::Part> {
        self.controller(account_id)
            .await?
            .get_msg_part(dir, uid, part_index)
            .await
    }

    /// Resolves a sequence number to a UID.
    ///
    /// # Errors
    ///
    /// Fails when the account is not loaded or the operation fails.
    pub async fn resolve_uid(&self, account_id: &str, dir: &str, seqnum: u32) -> Result<u32> {
        self.controller(account_id)
            .await?
            .resolve_uid(dir, seqnum)
            .await
    }

    /// Downloads the offline-use directories of an account.
    ///
    /// # Errors
    ///
    /// Fails when the account is not loaded.
    pub async fn download_offline_dirs(&self, account_id: &str) -> Result<()> {
        self.controller(account_id)
            .await?
            .download_offline_dirs()
            .await;
        Ok(())
    }

    /// Creates a directory.
    ///
    /// # Errors
    ///
    /// Fails when the account is not loaded or the operation fails.
    pub async fn create_dir(&self, account_id: &str, parent: &str, name: &str) -> Result<()> {
        self.controller(account_id)
            .await?
            .create_dir(parent, name)
            .await
    }

    /// Removes a directory.
    ///
    /// # Errors
    ///
    /// Fails when the account is not loaded or the operation fails.
    pub async fn remove_dir(&self, account_id: &str, parent: &str, name: &str) -> Result<()> {
        self.controller(account_id)
            .await?
            .remove_dir(parent, name)
            .await
    }

    /// Renames a directory.
    ///
    /// # Errors
    ///
    /// Fails when the account is not loaded or the operation fails.
    pub async fn rename_dir(&self, account_id: &str, old: &str, new: &str) -> Result<()> {
        self.controller(account_id).await?.rename_dir(old, new).await
    }

    /// Moves a directory between parents.
    ///
    /// # Errors
    ///
    /// Fails when the account is not loaded or the operation fails.
    pub async fn move_dir(
        &self,
        account_id: &str,
        dir: &str,
        old_parent: &str,
        new_parent: &str,
    ) -> Result<()> {
        self.controller(account_id)
            .await?
            .move_dir(dir, old_parent, new_parent)
            .await
    }

    /// Moves messages between directories.
    ///
    /// # Errors
    ///
    /// Fails when the account is not loaded or the operation fails.
    pub async fn move_msgs(
        &self,
        account_id: &str,
        from: &str,
        to: &str,
        uids: &[u32],
    ) -> Result<()> {
        self.controller(account_id)
            .await?
            .move_msgs(from, to, uids)
            .await
    }

    /// Copies messages between directories.
    ///
    /// # Errors
    ///
    /// Fails when the account is not loaded or the operation fails.
    pub async fn copy_msgs(
        &self,
        account_id: &str,
        from: &str,
        to: &str,
        uids: &[u32],
    ) -> Result<()> {
        self.controller(account_id)
            .await?
            .copy_msgs(from, to, uids)
            .await
    }

    /// Deletes messages (or moves them to Trash).
    ///
    /// # Errors
    ///
    /// Fails when the account is not loaded or the operation fails.
    pub async fn del_msg(
        &self,
        account_id: &str,
        dir: &str,
        skip_trash: bool,
        uids: &[u32],
    ) -> Result<()> {
        self.controller(account_id)
            .await?
            .del_msg(dir, skip_trash, uids)
            .await
    }

    /// Adds a tag to messages.
    ///
    /// # Errors
    ///
    /// Fails when the account is not loaded or the operation fails.
    pub async fn tag(&self, account_id: &str, dir: &str, tag: &str, uids: &[u32]) -> Result<()> {
        self.controller(account_id).await?.tag(dir, tag, uids).await
    }

    /// Removes a tag from messages.
    ///
    /// # Errors
    ///
    /// Fails when the account is not loaded or the operation fails.
    pub async fn untag(&self, account_id: &str, dir: &str, tag: &str, uids: &[u32]) -> Result<()> {
        self.controller(account_id)
            .await?
            .untag(dir, tag, uids)
            .await
    }

    /// Saves a draft; returns its UID.
    ///
    /// # Errors
    ///
    /// Fails when the account is not loaded or the operation fails.
    pub async fn save_draft(&self, account_id: &str, draft: &mime::Msg) -> Result<u32> {
        self.controller(account_id).await?.save_draft(draft).await
    }

    /// Replaces a draft; returns the new UID.
    ///
    /// # Errors
    ///
    /// Fails when the account is not loaded or the operation fails.
    pub async fn update_draft(
        &self,
        account_id: &str,
        old_uid: u32,
        draft: &mime::Msg,
    ) -> Result<u32> {
        self.controller(account_id)
            .await?
            .update_draft(old_uid, draft)
            .await
    }

    /// Sends a message; returns the Sent-copy UID (zero when copying
    /// is disabled).
    ///
    /// # Errors
    ///
    /// Fails when the account is not loaded or the operation fails.
    pub async fn send_message(&self, account_id: &str, msg: &mime::Msg) -> Result<u32> {
        self.controller(account_id).await?.send_message(msg).await
    }

    /// Searches one account.
    ///
    /// # Errors
    ///
    /// Fails when the account is not loaded or the operation fails.
    pub async fn search(
        &self,
        account_id: &str,
        criteria: &SearchCriteria,
    ) -> Result<Vec<SearchResult>> {
        self.controller(account_id).await?.search(criteria).await
    }

    // === Internals ===

    async fn controller(&self, account_id: &str) -> Result<Arc<AccountController>> {
        self.accounts
            .read()
            .await
            .get(account_id)
            .map(|entry| entry.controller.clone())
            .ok_or_else(|| Error::AccountNotFound(account_id.to_string()))
    }

    /// Recovers an account's plaintext password: decrypt the stored
    /// blob with the master key, falling back to a prompt when the
    /// blob is absent or does not open.
    fn account_password(&self, cfg: &AccountConfig) -> Result<String> {
        if !cfg.credentials.pass.is_empty() {
            let opened = hex::decode(&cfg.credentials.pass)
                .ok()
                .and_then(|blob| {
                    let key = self.master_key.lock().expect("lock poisoned");
                    key.decrypt(&blob).ok()
                })
                .and_then(|plain| String::from_utf8(plain).ok());
            if let Some(pass) = opened {
                return Ok(pass);
            }
            warn!("stored password blob did not open, prompting");
        }

        self.hooks
            .password_prompt(&format!("Enter password for {}:", cfg.sender_email))
            .ok_or(Error::PasswordPromptRejected)
    }
}
