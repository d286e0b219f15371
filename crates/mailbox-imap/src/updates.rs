//! Server-push bookkeeping: translating untagged traffic into the
//! events the account controller consumes.
//!
//! The raw connection reports what it saw ([`RawEvent`]); the
//! [`UpdateTracker`] remembers the last known size of every mailbox
//! and decides what that observation *means* — one `NewMessage` per
//! sequence number past the remembered size, a removal with size
//! decrement on EXPUNGE, and so on. First observation of a mailbox
//! records its size without firing a new-message event.
//!
//! The tracker is pure state; the session's dispatcher task drives it
//! and forwards the produced [`SessionEvent`]s over a channel.

use std::collections::HashMap;

use crate::types::DirStatus;

/// What the connection observed, before interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    /// Mailbox status observed (selection or untagged EXISTS).
    MailboxSize {
        /// Raw mailbox name.
        status: DirStatus,
    },
    /// Untagged EXPUNGE.
    Expunge {
        /// Raw mailbox name the connection had selected.
        dir: String,
        /// Expunged sequence number.
        seqnum: u32,
    },
    /// Unsolicited untagged FETCH (flag change).
    Fetch {
        /// Raw mailbox name the connection had selected.
        dir: String,
        /// Sequence number of the changed message.
        seqnum: u32,
        /// UID when the server included it.
        uid: Option<u32>,
        /// New flag set when included.
        flags: Option<Vec<String>>,
    },
}

/// An interpreted update, delivered to the controller as plain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A message beyond the known mailbox size appeared.
    NewMessage {
        /// Raw mailbox name.
        dir: String,
        /// Sequence number of the new message.
        seqnum: u32,
    },
    /// A message was expunged.
    MessageRemoved {
        /// Raw mailbox name.
        dir: String,
        /// Sequence number it had.
        seqnum: u32,
    },
    /// Flags of a message changed.
    MessageUpdate {
        /// Raw mailbox name.
        dir: String,
        /// UID when known.
        uid: Option<u32>,
        /// New flag set when known.
        flags: Option<Vec<String>>,
    },
    /// Mailbox-level counters changed.
    MailboxUpdate {
        /// The observed status.
        status: DirStatus,
    },
}

/// Remembered mailbox sizes and the event derivation rules.
#[derive(Debug, Default)]
pub struct UpdateTracker {
    known_sizes: HashMap<String, u32>,
}

impl UpdateTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the remembered size for a mailbox.
    #[must_use]
    pub fn known_size(&self, dir: &str) -> Option<u32> {
        self.known_sizes.get(dir).copied()
    }

    /// Overrides the remembered size (cache resync seeds this so a
    /// replayed selection reports only genuinely new messages).
    pub fn set_known_size(&mut self, dir: &str, size: u32) {
        self.known_sizes.insert(dir.to_string(), size);
    }

    /// Renames bookkeeping when a directory is renamed on the server.
    pub fn rename(&mut self, from: &str, to: &str) {
        if let Some(size) = self.known_sizes.remove(from) {
            self.known_sizes.insert(to.to_string(), size);
        }
    }

    /// Drops bookkeeping for a removed directory.
    pub fn forget(&mut self, dir: &str) {
        self.known_sizes.remove(dir);
    }

    /// Interprets one raw observation into zero or more events.
    pub fn process(&mut self, event: RawEvent) -> Vec<SessionEvent> {
        match event {
            RawEvent::MailboxSize { status } => self.process_size(status),
            RawEvent::Expunge { dir, seqnum } => {
                if let Some(size) = self.known_sizes.get_mut(&dir) {
                    *size = size.saturating_sub(1);
                }
                vec![SessionEvent::MessageRemoved { dir, seqnum }]
            }
            RawEvent::Fetch {
                dir,
                seqnum: _,
                uid,
                flags,
            } => vec![SessionEvent::MessageUpdate { dir, uid, flags }],
        }
    }

    fn process_size(&mut self, status: DirStatus) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let dir = status.name.clone();
        match self.known_sizes.get(&dir).copied() {
            None => {
                // First sight: record without firing.
                self.known_sizes.insert(dir, status.messages);
            }
            Some(known) => {
                if known < status.messages {
                    for seqnum in known + 1..=status.messages {
                        events.push(SessionEvent::NewMessage {
                            dir: dir.clone(),
                            seqnum,
                        });
                    }
                }
                self.known_sizes.insert(dir, status.messages);
            }
        }
        events.push(SessionEvent::MailboxUpdate { status });
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn size_event(dir: &str, messages: u32) -> RawEvent {
        RawEvent::MailboxSize {
            status: DirStatus {
                name: dir.to_string(),
                messages,
                ..DirStatus::default()
            },
        }
    }

    #[test]
    fn first_observation_records_without_new_message() {
        let mut tracker = UpdateTracker::new();
        let events = tracker.process(size_event("INBOX", 3));
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, SessionEvent::NewMessage { .. }))
        );
        assert_eq!(tracker.known_size("INBOX"), Some(3));
    }

    #[test]
    fn growth_fires_once_per_new_seqnum() {
        let mut tracker = UpdateTracker::new();
        tracker.process(size_event("INBOX", 3));
        let events = tracker.process(size_event("INBOX", 5));
        let new: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::NewMessage { seqnum, .. } => Some(*seqnum),
                _ => None,
            })
            .collect();
        assert_eq!(new, vec![4, 5]);
        assert_eq!(tracker.known_size("INBOX"), Some(5));
    }

    #[test]
    fn shrink_updates_without_new_message() {
        let mut tracker = UpdateTracker::new();
        tracker.process(size_event("INBOX", 5));
        let events = tracker.process(size_event("INBOX", 4));
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, SessionEvent::NewMessage { .. }))
        );
        assert_eq!(tracker.known_size("INBOX"), Some(4));
    }

    #[test]
    fn expunge_decrements_and_fires_removal() {
        let mut tracker = UpdateTracker::new();
        tracker.process(size_event("INBOX", 4));
        let events = tracker.process(RawEvent::Expunge {
            dir: "INBOX".to_string(),
            seqnum: 2,
        });
        assert_eq!(
            events,
            vec![SessionEvent::MessageRemoved {
                dir: "INBOX".to_string(),
                seqnum: 2
            }]
        );
        assert_eq!(tracker.known_size("INBOX"), Some(3));
    }

    #[test]
    fn fetch_becomes_message_update() {
        let mut tracker = UpdateTracker::new();
        let events = tracker.process(RawEvent::Fetch {
            dir: "INBOX".to_string(),
            seqnum: 1,
            uid: Some(9),
            flags: Some(vec!["\\Seen".to_string()]),
        });
        assert_eq!(
            events,
            vec![SessionEvent::MessageUpdate {
                dir: "INBOX".to_string(),
                uid: Some(9),
                flags: Some(vec!["\\Seen".to_string()])
            }]
        );
    }

    #[test]
    fn seeded_size_suppresses_replay_of_known_messages() {
        let mut tracker = UpdateTracker::new();
        tracker.set_known_size("INBOX", 3);
        let events = tracker.process(size_event("INBOX", 4));
        let new: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::NewMessage { seqnum, .. } => Some(*seqnum),
                _ => None,
            })
            .collect();
        assert_eq!(new, vec![4]);
    }

    #[test]
    fn rename_and_forget() {
        let mut tracker = UpdateTracker::new();
        tracker.set_known_size("old", 7);
        tracker.rename("old", "new");
        assert_eq!(tracker.known_size("old"), None);
        assert_eq!(tracker.known_size("new"), Some(7));
        tracker.forget("new");
        assert_eq!(tracker.known_size("new"), None);
    }
}
