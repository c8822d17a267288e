//! Admin conversation directory, derived from live traffic and the REST
//! conversation list.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::api::StorefrontApi;
use crate::error::Result;
use crate::history::HistorySync;
use crate::models::{Channel, ChatMessage, Conversation};
use crate::store::ChannelStore;

/// Admin-only sidebar: one entry per customer, most recent activity first.
pub struct ConversationDirectory {
    me: String,
    entries: watch::Sender<Vec<Conversation>>,
    /// Source of the active partner
    admin: Arc<ChannelStore>,
    history: Arc<HistorySync>,
    api: Arc<dyn StorefrontApi>,
    /// Partners with a display-name lookup in flight
    resolving: Mutex<HashSet<String>>,
}

impl ConversationDirectory {
    pub fn new(
        me: impl Into<String>,
        admin: Arc<ChannelStore>,
        history: Arc<HistorySync>,
        api: Arc<dyn StorefrontApi>,
    ) -> Self {
        Self {
            me: me.into(),
            entries: watch::channel(Vec::new()).0,
            admin,
            history,
            api,
            resolving: Mutex::new(HashSet::new()),
        }
    }

    /// Merge the server's conversation list. Entries already touched by live
    /// traffic keep their counters and position; the rest are appended in
    /// server order.
    pub async fn load(&self) -> Result<usize> {
        let users = self.api.list_conversations().await?;
        let mut added = 0;
        self.entries.send_modify(|list| {
            for user in users {
                match list.iter_mut().find(|c| c.partner_id == user.id) {
                    Some(existing) => {
                        if !user.name.is_empty() {
                            existing.display_name = user.name;
                        }
                    }
                    None => {
                        let display_name = if user.name.is_empty() {
                            user.id.clone()
                        } else {
                            user.name
                        };
                        list.push(Conversation {
                            partner_id: user.id,
                            display_name,
                            preview_text: user.last_message.unwrap_or_default(),
                            unread_count: user.unread_count,
                        });
                        added += 1;
                    }
                }
            }
        });
        debug!(added = added, "conversation list merged");
        Ok(added)
    }

    /// Fold a live non-bot message into the directory: move its partner to
    /// the head, refresh the preview, and count it unread unless it is
    /// outbound or the partner is the one on screen.
    pub fn observe(self: &Arc<Self>, message: &ChatMessage) {
        if message.involves_bot() {
            return;
        }
        let partner = message.counterpart(&self.me).to_string();
        if partner == self.me {
            return;
        }
        let inbound = message.from != self.me;
        let on_screen = self.admin.is_active_partner(&partner);
        let preview = if inbound {
            message.content.clone()
        } else {
            format!("You: {}", message.content)
        };

        let mut created = false;
        self.entries.send_modify(|list| {
            let mut entry = match list.iter().position(|c| c.partner_id == partner) {
                Some(i) => list.remove(i),
                None => {
                    created = true;
                    let name = if inbound && !message.from_name.is_empty() {
                        message.from_name.as_str()
                    } else {
                        partner.as_str()
                    };
                    Conversation::placeholder(&partner, name)
                }
            };
            entry.preview_text = preview;
            if inbound && !on_screen {
                entry.unread_count += 1;
            }
            list.insert(0, entry);
        });

        if created {
            self.resolve_display_name(partner);
        }
    }

    /// Make `partner` the admin's active conversation: zero its badge and
    /// load its history.
    pub async fn select_partner(&self, partner: &str) -> Result<()> {
        let ticket = self.history.begin(Channel::Admin, partner);
        self.mark_seen(partner);
        self.history.request(ticket).await
    }

    pub fn mark_seen(&self, partner: &str) {
        self.entries.send_if_modified(|list| {
            match list.iter_mut().find(|c| c.partner_id == partner) {
                Some(entry) if entry.unread_count > 0 => {
                    entry.unread_count = 0;
                    true
                }
                _ => false,
            }
        });
    }

    fn resolve_display_name(self: &Arc<Self>, partner: String) {
        {
            let mut resolving = self.resolving.lock().unwrap_or_else(PoisonError::into_inner);
            if !resolving.insert(partner.clone()) {
                return;
            }
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(partner = %partner, "no runtime; skipping name lookup");
            self.finish_lookup(&partner);
            return;
        };

        let directory = Arc::clone(self);
        handle.spawn(async move {
            match directory.api.lookup_user(&partner).await {
                Ok(Some(user)) if !user.name.is_empty() => {
                    directory.merge_display_name(&partner, user.name);
                }
                Ok(_) => debug!(partner = %partner, "no display name found"),
                Err(e) => warn!(partner = %partner, code = e.error_code(), "name lookup failed: {}", e),
            }
            directory.finish_lookup(&partner);
        });
    }

    fn finish_lookup(&self, partner: &str) {
        self.resolving
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(partner);
    }

    /// Only the name changes; counters, preview and position are kept.
    fn merge_display_name(&self, partner: &str, name: String) {
        self.entries.send_if_modified(|list| {
            match list.iter_mut().find(|c| c.partner_id == partner) {
                Some(entry) if entry.display_name != name => {
                    entry.display_name = name;
                    true
                }
                _ => false,
            }
        });
    }

    pub fn clear(&self) {
        self.entries.send_replace(Vec::new());
    }

    pub fn snapshot(&self) -> Vec<Conversation> {
        self.entries.borrow().clone()
    }

    pub fn get(&self, partner: &str) -> Option<Conversation> {
        self.entries
            .borrow()
            .iter()
            .find(|c| c.partner_id == partner)
            .cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Conversation>> {
        self.entries.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ConversationSummary;
    use crate::test_helpers::{FakeApi, chat, eventually, history_fixture};

    const ME: &str = "admin-1";

    fn directory(api: Arc<FakeApi>) -> (Arc<ConversationDirectory>, Arc<HistorySync>) {
        let (history, _) = history_fixture(ME, true, api.clone());
        let admin = history.store(Channel::Admin).clone();
        let dir = Arc::new(ConversationDirectory::new(ME, admin, history.clone(), api));
        (dir, history)
    }

    fn order(dir: &ConversationDirectory) -> Vec<String> {
        dir.snapshot().into_iter().map(|c| c.partner_id).collect()
    }

    #[tokio::test]
    async fn inbound_messages_reorder_and_count() {
        let api = Arc::new(FakeApi::new());
        let (dir, _) = directory(api);

        dir.observe(&chat("U1", ME, "one", 1));
        dir.observe(&chat("U2", ME, "two", 2));
        assert_eq!(order(&dir), vec!["U2", "U1"]);

        dir.observe(&chat("U1", ME, "three", 3));
        assert_eq!(order(&dir), vec!["U1", "U2"]);
        let u1 = dir.get("U1").unwrap();
        assert_eq!(u1.unread_count, 2);
        assert_eq!(u1.preview_text, "three");
    }

    #[tokio::test]
    async fn outbound_message_gets_prefix_and_no_unread() {
        let api = Arc::new(FakeApi::new());
        let (dir, _) = directory(api);

        dir.observe(&chat(ME, "U1", "on my way", 1));
        let u1 = dir.get("U1").unwrap();
        assert_eq!(u1.preview_text, "You: on my way");
        assert_eq!(u1.unread_count, 0);
    }

    #[tokio::test]
    async fn active_partner_messages_are_not_unread() {
        let api = Arc::new(FakeApi::new());
        let (dir, history) = directory(api);
        history.store(Channel::Admin).set_partner(Some("U1".into()));

        dir.observe(&chat("U1", ME, "hello", 1));
        assert_eq!(dir.get("U1").unwrap().unread_count, 0);
    }

    #[tokio::test]
    async fn bot_traffic_is_ignored() {
        let api = Arc::new(FakeApi::new());
        let (dir, _) = directory(api);
        dir.observe(&chat("BOT", ME, "beep", 1));
        assert!(dir.snapshot().is_empty());
    }

    #[tokio::test]
    async fn unknown_partner_gets_placeholder_then_name() {
        let api = Arc::new(FakeApi::new());
        api.add_user("U7", "Nguyen Van A");
        let (dir, _) = directory(api.clone());

        dir.observe(&chat("U7", ME, "hi", 1));
        assert_eq!(dir.get("U7").unwrap().display_name, "U7");

        eventually(|| dir.get("U7").unwrap().display_name == "Nguyen Van A").await;
        let entry = dir.get("U7").unwrap();
        assert_eq!(entry.unread_count, 1);
        assert_eq!(entry.preview_text, "hi");
        assert_eq!(api.lookups(), 1);
    }

    #[tokio::test]
    async fn placeholder_prefers_sender_name() {
        let api = Arc::new(FakeApi::new());
        let (dir, _) = directory(api);
        let mut msg = chat("U3", ME, "hi", 1);
        msg.from_name = "Lan".into();
        dir.observe(&msg);
        assert_eq!(dir.get("U3").unwrap().display_name, "Lan");
    }

    #[tokio::test]
    async fn load_merges_without_disturbing_live_entries() {
        let api = Arc::new(FakeApi::new());
        api.set_conversations(vec![
            ConversationSummary {
                id: "U2".into(),
                name: "Minh".into(),
                last_message: Some("server preview".into()),
                unread_count: 9,
            },
            ConversationSummary {
                id: "U5".into(),
                name: "Hoa".into(),
                last_message: None,
                unread_count: 1,
            },
        ]);
        let (dir, _) = directory(api);

        dir.observe(&chat("U2", ME, "live", 1));
        assert_eq!(dir.load().await.unwrap(), 1);

        assert_eq!(order(&dir), vec!["U2", "U5"]);
        let u2 = dir.get("U2").unwrap();
        assert_eq!(u2.display_name, "Minh");
        assert_eq!(u2.preview_text, "live");
        assert_eq!(u2.unread_count, 1);
        assert_eq!(dir.get("U5").unwrap().unread_count, 1);
    }

    #[tokio::test]
    async fn select_partner_zeroes_unread_and_loads_history() {
        let api = Arc::new(FakeApi::new());
        api.set_history("U1", vec![chat("U1", ME, "older", 1)]);
        let (dir, history) = directory(api);

        dir.observe(&chat("U1", ME, "new", 2));
        dir.select_partner("U1").await.unwrap();

        assert_eq!(dir.get("U1").unwrap().unread_count, 0);
        let admin = history.store(Channel::Admin);
        assert_eq!(admin.active_partner().as_deref(), Some("U1"));
        assert_eq!(admin.snapshot()[0].content, "older");
    }
}
