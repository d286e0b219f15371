//! Handling of server-pushed updates.
//!
//! The session delivers plain-data [`SessionEvent`]s over a channel;
//! this task consumes them and patches the cache (or, when the
//! sequence numbers have drifted from the cached view, triggers a full
//! message-list reload). The frontend learns about every change via
//! the registered hooks.

use std::sync::Arc;

use mailbox_imap::{SessionEvent, text_only};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::AccountController;

/// The per-account event loop. Exits on the stop signal (interrupt;
/// the ack is task completion) or when the session's event channel
/// closes.
pub(super) async fn run_event_loop(
    controller: Arc<AccountController>,
    mut events: mailbox_imap::EventStream,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop_rx => return,
            event = events.recv() => {
                let Some(event) = event else { return };
                handle_event(&controller, event).await;
            }
        }
    }
}

async fn handle_event(controller: &AccountController, event: SessionEvent) {
    match event {
        SessionEvent::NewMessage { dir, seqnum } => {
            on_new_message(controller, &dir, seqnum).await;
        }
        SessionEvent::MessageRemoved { dir, seqnum } => {
            on_message_removed(controller, &dir, seqnum).await;
        }
        SessionEvent::MessageUpdate { dir, uid, flags } => {
            // Flag changes are the only per-message update the server
            // pushes; anything without both parts is unactionable.
            if let (Some(uid), Some(flags)) = (uid, flags) {
                let dir = controller.normalize_dir(&dir);
                if let Err(e) = controller
                    .cache
                    .dir(&dir)
                    .replace_tag_list(uid, &flags)
                    .await
                {
                    warn!(account = %controller.id, dir = %dir, uid, error = %e,
                          "failed to apply pushed flag change");
                }
            }
        }
        SessionEvent::MailboxUpdate { status } => {
            on_mailbox_update(controller, status).await;
        }
    }
}

/// A message appeared at `seqnum`. When it extends the cached list by
/// exactly one, fetch just that message; any other shape means the
/// local and server sequences have drifted, so reload the whole list.
async fn on_new_message(controller: &AccountController, raw_dir: &str, seqnum: u32) {
    let dir = controller.normalize_dir(raw_dir);
    debug!(account = %controller.id, dir = %dir, seqnum, "new message pushed");

    let uid = match controller
        .with_retry(|| controller.session.resolve_uid(raw_dir, seqnum))
        .await
    {
        Ok(uid) => uid,
        Err(e) => {
            warn!(account = %controller.id, dir = %dir, error = %e,
                  "reloading message list: UID resolution failed");
            controller.reload_maillist(&dir).await;
            return;
        }
    };

    let count = match controller.cache.dir(&dir).msgs_count().await {
        Ok(count) => count,
        Err(e) => {
            warn!(account = %controller.id, dir = %dir, error = %e, "cache count failed");
            controller.reload_maillist(&dir).await;
            return;
        }
    };
    if seqnum != count + 1 {
        debug!(account = %controller.id, dir = %dir, seqnum, cached = count,
               "reloading message list: sequence numbers de-synced");
        controller.reload_maillist(&dir).await;
        return;
    }

    let info = match controller
        .with_retry(|| controller.session.fetch_partial_mail(raw_dir, uid, text_only))
        .await
    {
        Ok(info) => info,
        Err(e) => {
            warn!(account = %controller.id, dir = %dir, uid, error = %e,
                  "reloading message list: message download failed");
            controller.reload_maillist(&dir).await;
            return;
        }
    };

    if let Err(e) = controller.cache.dir(&dir).add_msg(&info).await {
        warn!(account = %controller.id, dir = %dir, uid, error = %e, "cache add_msg failed");
    }

    controller.hooks.new_message(&controller.id, &dir, &info);
    controller.hooks.reset_dir(&controller.id, &dir);
}

/// A message at `seqnum` was expunged. The UID is resolved from the
/// cache's own ordering; an out-of-range sequence number means drift.
async fn on_message_removed(controller: &AccountController, raw_dir: &str, seqnum: u32) {
    let dir = controller.normalize_dir(raw_dir);
    debug!(account = %controller.id, dir = %dir, seqnum, "message removal pushed");

    let handle = controller.cache.dir(&dir);
    let count = match handle.msgs_count().await {
        Ok(count) => count,
        Err(e) => {
            warn!(account = %controller.id, dir = %dir, error = %e, "cache count failed");
            controller.reload_maillist(&dir).await;
            return;
        }
    };
    if seqnum > count {
        debug!(account = %controller.id, dir = %dir, seqnum, cached = count,
               "reloading message list: sequence number out of range");
        controller.reload_maillist(&dir).await;
        return;
    }

    let uid = match handle.resolve_uid(seqnum).await {
        Ok(uid) => uid,
        Err(_) => {
            debug!(account = %controller.id, dir = %dir, seqnum,
                   "reloading message list: removed message not in cache");
            controller.reload_maillist(&dir).await;
            return;
        }
    };
    if let Err(e) = handle.del_msg(uid).await {
        warn!(account = %controller.id, dir = %dir, uid, error = %e, "cache del_msg failed");
    }

    controller.hooks.reset_dir(&controller.id, &dir);
}

/// Mailbox counters changed. A UIDVALIDITY change voids every cached
/// UID, so the list is invalidated and reloaded before anything else
/// reads it.
async fn on_mailbox_update(controller: &AccountController, status: mailbox_imap::DirStatus) {
    let dir = controller.normalize_dir(&status.name);
    let handle = controller.cache.dir(&dir);

    if let Some(server) = status.uidvalidity {
        match handle.uid_validity().await {
            Ok(Some(cached)) if cached != server => {
                debug!(account = %controller.id, dir = %dir, cached, server, "UIDVALIDITY changed");
                if let Err(e) = handle.invalidate_msglist().await {
                    warn!(account = %controller.id, dir = %dir, error = %e, "cache invalidation failed");
                }
                if let Err(e) = handle.set_uid_validity(server).await {
                    warn!(account = %controller.id, dir = %dir, error = %e, "cache update failed");
                }
                controller.reload_maillist(&dir).await;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Err(e) = handle.set_uid_validity(server).await {
                    warn!(account = %controller.id, dir = %dir, error = %e, "cache update failed");
                }
            }
            Err(e) => {
                warn!(account = %controller.id, dir = %dir, error = %e, "cache read failed");
                return;
            }
        }
    }

    if let Some(unseen) = status.unseen {
        if let Err(e) = controller.cache.dir(&dir).set_unread_count(unseen).await {
            warn!(account = %controller.id, dir = %dir, error = %e, "cache update failed");
        }
    }
}
