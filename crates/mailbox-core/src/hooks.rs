//! The callback surface the frontend registers at launch.

use mailbox_imap::MessageInfo;

/// Callbacks from the core into the frontend.
///
/// Methods may be invoked from any of the core's tasks at any time,
/// concurrently across accounts; implementations must be reentrant
/// and thread-safe.
pub trait FrontendHooks: Send + Sync {
    /// Asks the user for a password. `None` means the prompt was
    /// rejected.
    fn password_prompt(&self, prompt: &str) -> Option<String>;

    /// The entire account's cached view is stale; re-pull everything.
    fn reset(&self, account_id: &str);

    /// One directory's cached view is stale; re-pull it.
    fn reset_dir(&self, account_id: &str, dir: &str);

    /// A new message arrived. `info` already reflects the cache.
    fn new_message(&self, account_id: &str, dir: &str, info: &MessageInfo);
}

/// Hook implementation that ignores everything (headless use, tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl FrontendHooks for NoopHooks {
    fn password_prompt(&self, _prompt: &str) -> Option<String> {
        None
    }

    fn reset(&self, _account_id: &str) {}

    fn reset_dir(&self, _account_id: &str, _dir: &str) {}

    fn new_message(&self, _account_id: &str, _dir: &str, _info: &MessageInfo) {}
}
