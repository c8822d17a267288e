//! Per-channel message store. Dedup on append and the history install rules
//! live here; routing decisions do not.

use tokio::sync::watch;
use tracing::debug;

use crate::models::{Channel, ChatMessage, ViewState};

/// Result of [`ChannelStore::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Matched an existing entry; nothing changed.
    Duplicate,
    /// A server-confirmed copy replaced its optimistic entry in place.
    Reconciled,
}

/// Ordered, de-duplicated message list for one channel, plus the channel's
/// active partner and view state. Every field is observable.
pub struct ChannelStore {
    channel: Channel,
    messages: watch::Sender<Vec<ChatMessage>>,
    partner: watch::Sender<Option<String>>,
    view: watch::Sender<ViewState>,
}

impl ChannelStore {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            messages: watch::channel(Vec::new()).0,
            partner: watch::channel(None).0,
            view: watch::channel(ViewState::Idle).0,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Append unless an entry with the same id or the same
    /// `(timestamp, content)` is present. A confirmed candidate that matches
    /// exactly one provisional entry takes its place.
    pub fn append(&self, message: ChatMessage) -> AppendOutcome {
        let mut outcome = AppendOutcome::Duplicate;
        self.messages.send_if_modified(|list| {
            let mut matches = list
                .iter()
                .enumerate()
                .filter(|(_, m)| m.same_entry(&message))
                .map(|(i, _)| i);
            match (matches.next(), matches.next()) {
                (None, _) => {
                    list.push(message);
                    outcome = AppendOutcome::Appended;
                    true
                }
                (Some(i), None) if list[i].is_provisional() && !message.is_provisional() => {
                    list[i] = message;
                    outcome = AppendOutcome::Reconciled;
                    true
                }
                _ => false,
            }
        });
        if outcome == AppendOutcome::Duplicate {
            debug!(channel = %self.channel, "duplicate message ignored");
        }
        outcome
    }

    /// Replace the content with a history batch. Duplicates inside the batch
    /// collapse; optimistic entries the batch does not confirm are kept at
    /// the tail.
    pub fn replace_all(&self, batch: Vec<ChatMessage>) {
        self.install(batch, ChatMessage::is_provisional);
    }

    /// Install the history batch that answers a fresh open. The store was
    /// emptied when the load began, so every entry it holds now was routed
    /// for this conversation during the load; entries the batch does not
    /// cover are kept after it.
    pub fn merge_history(&self, batch: Vec<ChatMessage>) {
        self.install(batch, |_| true);
    }

    fn install(&self, batch: Vec<ChatMessage>, keep: impl Fn(&ChatMessage) -> bool) {
        self.messages.send_modify(|list| {
            let mut next: Vec<ChatMessage> = Vec::with_capacity(batch.len() + list.len());
            for message in batch {
                if !next.iter().any(|m| m.same_entry(&message)) {
                    next.push(message);
                }
            }
            for carried in list.drain(..).filter(|m| keep(m)) {
                if !next.iter().any(|m| m.same_entry(&carried)) {
                    next.push(carried);
                }
            }
            *list = next;
        });
    }

    pub fn clear(&self) {
        self.messages.send_if_modified(|list| {
            let changed = !list.is_empty();
            list.clear();
            changed
        });
    }

    /// Empty the list, forget the partner, return the view to Idle.
    pub fn reset(&self) {
        self.clear();
        self.set_partner(None);
        self.set_view_state(ViewState::Idle);
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.borrow().is_empty()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.messages.subscribe()
    }

    pub fn active_partner(&self) -> Option<String> {
        self.partner.borrow().clone()
    }

    pub fn is_active_partner(&self, partner: &str) -> bool {
        self.partner.borrow().as_deref() == Some(partner)
    }

    pub fn set_partner(&self, partner: Option<String>) {
        self.partner.send_if_modified(|current| {
            let changed = *current != partner;
            *current = partner;
            changed
        });
    }

    pub fn subscribe_partner(&self) -> watch::Receiver<Option<String>> {
        self.partner.subscribe()
    }

    pub fn view_state(&self) -> ViewState {
        *self.view.borrow()
    }

    pub fn set_view_state(&self, state: ViewState) {
        self.view.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    pub fn subscribe_view(&self) -> watch::Receiver<ViewState> {
        self.view.subscribe()
    }
}
