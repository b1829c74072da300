//! Append-only chat log with change notification.
//!
//! Pure data holder: invariants (one reply per turn, user messages without
//! provenance) are enforced by the coordinator, the log's single writer.
//! Presentation reads and subscribes only.

use chrono::Utc;
use parking_lot::RwLock;
use shared::types::{HistoryEntry, Message, MessageDraft, MessageId};
use tokio::sync::watch;

struct Inner {
    messages: Vec<Message>,
    is_generating: bool,
    next_id: u64,
}

/// Ordered record of conversation turns. Insertion order is display order;
/// messages are never reordered or mutated after append.
pub struct ChatLog {
    inner: RwLock<Inner>,
    changed_tx: watch::Sender<u64>,
}

impl ChatLog {
    pub fn new() -> Self {
        let (changed_tx, _) = watch::channel(0);
        Self {
            inner: RwLock::new(Inner {
                messages: Vec::new(),
                is_generating: false,
                next_id: 1,
            }),
            changed_tx,
        }
    }

    /// Assigns the next id, stamps the creation time, and appends.
    pub fn append(&self, draft: MessageDraft) -> MessageId {
        let id = {
            let mut inner = self.inner.write();
            let id = MessageId(inner.next_id);
            inner.next_id += 1;
            inner.messages.push(draft.into_message(id, Utc::now()));
            id
        };
        self.notify();
        id
    }

    pub fn set_generating(&self, generating: bool) {
        {
            let mut inner = self.inner.write();
            if inner.is_generating == generating {
                return;
            }
            inner.is_generating = generating;
        }
        self.notify();
    }

    pub fn is_generating(&self) -> bool {
        self.inner.read().is_generating
    }

    /// Drops all messages. Ids keep increasing across a clear, so an id
    /// never refers to two different messages within one process.
    pub fn clear(&self) {
        self.inner.write().messages.clear();
        self.notify();
    }

    pub fn len(&self) -> usize {
        self.inner.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().messages.is_empty()
    }

    /// Cloned view for presentation.
    pub fn messages(&self) -> Vec<Message> {
        self.inner.read().messages.clone()
    }

    /// The last `n` messages projected to `{role, content}` — the context
    /// sent to the backend with each turn.
    pub fn history_window(&self, n: usize) -> Vec<HistoryEntry> {
        let inner = self.inner.read();
        let skip = inner.messages.len().saturating_sub(n);
        inner.messages[skip..].iter().map(HistoryEntry::from).collect()
    }

    /// Change notification: the value is a generation counter bumped on
    /// every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed_tx.subscribe()
    }

    fn notify(&self) {
        self.changed_tx.send_modify(|generation| *generation += 1);
    }
}

impl Default for ChatLog {
    fn default() -> Self {
        Self::new()
    }
}
