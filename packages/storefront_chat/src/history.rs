//! History synchronization: (re)populating a channel store when its
//! conversation is opened, without ever applying a response to the wrong
//! conversation.
//!
//! Each request is stamped with a [`HistoryTicket`] naming the channel and
//! partner it was issued for. A response is applied only while that partner
//! is still the channel's active partner; otherwise it is discarded. Socket
//! responses carry no correlation id, so tickets for socket requests are
//! matched to incoming batches in FIFO order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::api::StorefrontApi;
use crate::connection::Publisher;
use crate::error::Result;
use crate::models::{BOT_ID, Channel, ChatMessage, Identity, SUPPORT_ID, ViewState};
use crate::protocol::{GET_HISTORY, HistoryRequest};
use crate::store::ChannelStore;

/// Where a channel's history comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistorySource {
    /// `getHistory` publish, answered by an array on the chat topic
    Socket,
    /// `GET /chat/history/{partner}`
    Rest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTicket {
    pub channel: Channel,
    pub partner: String,
    pub seq: u64,
}

pub struct HistorySync {
    me: String,
    admin_identity: bool,
    bot: Arc<ChannelStore>,
    admin: Arc<ChannelStore>,
    publisher: Publisher,
    api: Arc<dyn StorefrontApi>,
    pending: Mutex<VecDeque<HistoryTicket>>,
    seq: AtomicU64,
}

impl HistorySync {
    pub fn new(
        identity: &Identity,
        bot: Arc<ChannelStore>,
        admin: Arc<ChannelStore>,
        publisher: Publisher,
        api: Arc<dyn StorefrontApi>,
    ) -> Self {
        Self {
            me: identity.id.clone(),
            admin_identity: identity.is_admin(),
            bot,
            admin,
            publisher,
            api,
            pending: Mutex::new(VecDeque::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn store(&self, channel: Channel) -> &Arc<ChannelStore> {
        match channel {
            Channel::Bot => &self.bot,
            Channel::Admin => &self.admin,
        }
    }

    pub fn source(&self, channel: Channel) -> HistorySource {
        if channel == Channel::Admin && self.admin_identity {
            HistorySource::Rest
        } else {
            HistorySource::Socket
        }
    }

    /// Switch `channel` to `partner`: Loading, empty, partner set. The
    /// returned ticket identifies the request that will fill it.
    pub fn begin(&self, channel: Channel, partner: &str) -> HistoryTicket {
        let store = self.store(channel);
        store.set_view_state(ViewState::Loading);
        store.clear();
        store.set_partner(Some(partner.to_string()));
        self.stamp(channel, partner.to_string())
    }

    pub async fn open_conversation(&self, channel: Channel, partner: &str) -> Result<()> {
        let ticket = self.begin(channel, partner);
        self.request(ticket).await
    }

    /// Issue the request for `ticket`. A REST failure leaves the view in
    /// Loading.
    pub async fn request(&self, ticket: HistoryTicket) -> Result<()> {
        match self.source(ticket.channel) {
            HistorySource::Socket => self.request_over_socket(ticket),
            HistorySource::Rest => {
                let batch = match self.api.history_with(&ticket.partner).await {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(
                            partner = %ticket.partner,
                            code = e.error_code(),
                            "history fetch failed: {}", e
                        );
                        return Err(e);
                    }
                };
                self.apply(&ticket, batch);
                Ok(())
            }
        }
    }

    fn request_over_socket(&self, ticket: HistoryTicket) -> Result<()> {
        let payload = HistoryRequest {
            target_user_id: ticket.partner.clone(),
        };
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        self.publisher.publish(GET_HISTORY, &payload)?;
        debug!(channel = %ticket.channel, partner = %ticket.partner, seq = ticket.seq, "history requested");
        pending.push_back(ticket);
        Ok(())
    }

    /// Apply `batch` if `ticket` is still current. Returns whether it was
    /// applied.
    pub fn apply(&self, ticket: &HistoryTicket, batch: Vec<ChatMessage>) -> bool {
        let store = self.store(ticket.channel);
        if !store.is_active_partner(&ticket.partner) {
            debug!(
                channel = %ticket.channel,
                partner = %ticket.partner,
                seq = ticket.seq,
                "discarding stale history"
            );
            return false;
        }
        let total = batch.len();
        let batch: Vec<ChatMessage> = batch
            .into_iter()
            .filter(|m| self.belongs(ticket, m))
            .collect();
        if batch.len() != total {
            debug!(
                channel = %ticket.channel,
                dropped = total - batch.len(),
                "history entries outside this conversation dropped"
            );
        }
        // Anything already in a Loading store arrived live during the load
        if store.view_state() == ViewState::Loading {
            store.merge_history(batch);
        } else {
            store.replace_all(batch);
        }
        store.set_view_state(ViewState::Ready);
        true
    }

    /// Handle a history array from the chat topic. A non-empty batch answers
    /// the oldest pending request for the channel its content belongs to;
    /// an empty one can only be matched in request order.
    pub fn resolve_batch(&self, batch: Vec<ChatMessage>) -> bool {
        let ticket = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            match batch.first() {
                Some(first) => {
                    let channel = first.channel();
                    pending
                        .iter()
                        .position(|t| t.channel == channel)
                        .and_then(|i| pending.remove(i))
                }
                None => pending.pop_front(),
            }
        };
        match ticket {
            Some(ticket) => self.apply(&ticket, batch),
            None => self.apply_unsolicited(batch),
        }
    }

    /// A batch nobody asked for: infer its conversation from the content.
    fn apply_unsolicited(&self, batch: Vec<ChatMessage>) -> bool {
        let Some(first) = batch.first() else {
            debug!("discarding empty unsolicited history");
            return false;
        };
        let channel = first.channel();
        let partner = match channel {
            Channel::Bot => BOT_ID.to_string(),
            Channel::Admin if self.admin_identity => first.counterpart(&self.me).to_string(),
            Channel::Admin => self
                .admin
                .active_partner()
                .unwrap_or_else(|| SUPPORT_ID.to_string()),
        };
        let ticket = HistoryTicket {
            channel,
            partner,
            seq: 0,
        };
        self.apply(&ticket, batch)
    }

    /// Re-request history for every channel with an active partner. Called on
    /// each (re)connect; requests issued on a previous link are forgotten.
    pub fn resync(self: &Arc<Self>) {
        let dropped = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let n = pending.len();
            pending.clear();
            n
        };
        if dropped > 0 {
            debug!(dropped = dropped, "forgetting unanswered history requests");
        }

        for channel in Channel::ALL {
            let Some(partner) = self.store(channel).active_partner() else {
                continue;
            };
            let ticket = self.stamp(channel, partner);
            match self.source(channel) {
                HistorySource::Socket => {
                    if let Err(e) = self.request_over_socket(ticket) {
                        warn!(channel = %channel, code = e.error_code(), "history resync failed: {}", e);
                    }
                }
                HistorySource::Rest => {
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        let _ = this.request(ticket).await;
                    });
                }
            }
        }
    }

    /// Leave the channel's conversation: empty, no partner, Idle.
    pub fn close(&self, channel: Channel) {
        self.store(channel).reset();
    }

    pub fn forget_pending(&self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn stamp(&self, channel: Channel, partner: String) -> HistoryTicket {
        HistoryTicket {
            channel,
            partner,
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    fn belongs(&self, ticket: &HistoryTicket, message: &ChatMessage) -> bool {
        match ticket.channel {
            Channel::Bot => message.involves_bot(),
            Channel::Admin if self.admin_identity => {
                !message.involves_bot() && message.involves(&ticket.partner)
            }
            Channel::Admin => !message.involves_bot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FakeApi, chat, chat_with_id, eventually, history_fixture, within};

    #[tokio::test]
    async fn open_conversation_over_socket_publishes_request() {
        let api = Arc::new(FakeApi::new());
        let (history, mut published) = history_fixture("u1", false, api);

        history.open_conversation(Channel::Bot, BOT_ID).await.unwrap();
        let (destination, body) = published.next().unwrap();
        assert_eq!(destination, GET_HISTORY);
        assert_eq!(body, serde_json::json!({"targetUserId": "BOT"}));

        let bot = history.store(Channel::Bot);
        assert_eq!(bot.view_state(), ViewState::Loading);
        assert_eq!(history.pending_len(), 1);

        assert!(history.resolve_batch(vec![chat(BOT_ID, "u1", "hello", 1)]));
        assert_eq!(bot.view_state(), ViewState::Ready);
        assert_eq!(bot.len(), 1);
        assert_eq!(history.pending_len(), 0);
    }

    #[tokio::test]
    async fn batches_answered_out_of_order_reach_their_channels() {
        let api = Arc::new(FakeApi::new());
        let (history, _published) = history_fixture("u1", false, api);

        history.open_conversation(Channel::Bot, BOT_ID).await.unwrap();
        history.open_conversation(Channel::Admin, SUPPORT_ID).await.unwrap();
        assert_eq!(history.pending_len(), 2);

        assert!(history.resolve_batch(vec![chat("u1", SUPPORT_ID, "need help", 1)]));
        assert!(history.resolve_batch(vec![chat(BOT_ID, "u1", "bot hello", 2)]));

        let bot = history.store(Channel::Bot);
        let admin = history.store(Channel::Admin);
        assert_eq!(bot.snapshot()[0].content, "bot hello");
        assert_eq!(admin.snapshot()[0].content, "need help");
        assert_eq!(bot.len() + admin.len(), 2);
        assert_eq!(bot.view_state(), ViewState::Ready);
        assert_eq!(admin.view_state(), ViewState::Ready);
        assert_eq!(history.pending_len(), 0);
    }

    #[tokio::test]
    async fn empty_batch_answers_oldest_request() {
        let api = Arc::new(FakeApi::new());
        let (history, _published) = history_fixture("u1", false, api);

        history.open_conversation(Channel::Bot, BOT_ID).await.unwrap();
        history.open_conversation(Channel::Admin, SUPPORT_ID).await.unwrap();

        assert!(history.resolve_batch(Vec::new()));
        assert_eq!(history.store(Channel::Bot).view_state(), ViewState::Ready);
        assert_eq!(history.store(Channel::Admin).view_state(), ViewState::Loading);
        assert_eq!(history.pending_len(), 1);
    }

    #[tokio::test]
    async fn live_message_during_rest_load_survives_history() {
        let api = Arc::new(FakeApi::new());
        api.set_history("U1", vec![chat_with_id("1", "U1", "admin-1", "older", 10)]);
        let release = api.gate_history("U1");
        let (history, _published) = history_fixture("admin-1", true, api);

        let loader = history.clone();
        let open =
            tokio::spawn(async move { loader.open_conversation(Channel::Admin, "U1").await });
        let admin = history.store(Channel::Admin).clone();
        eventually(|| admin.is_active_partner("U1")).await;
        assert_eq!(admin.view_state(), ViewState::Loading);

        admin.append(chat_with_id("9", "U1", "admin-1", "live while loading", 20));
        let _ = release.send(());
        within(open).await.unwrap().unwrap();

        let contents: Vec<_> = admin.snapshot().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["older", "live while loading"]);
        assert_eq!(admin.view_state(), ViewState::Ready);
    }

    #[tokio::test]
    async fn stale_response_is_discarded() {
        let api = Arc::new(FakeApi::new());
        let (history, _published) = history_fixture("admin-1", true, api);

        let ticket_a = history.begin(Channel::Admin, "A");
        let _ticket_b = history.begin(Channel::Admin, "B");

        assert!(!history.apply(&ticket_a, vec![chat("A", "admin-1", "from A", 1)]));
        let admin = history.store(Channel::Admin);
        assert!(admin.is_empty());
        assert_eq!(admin.view_state(), ViewState::Loading);
        assert_eq!(admin.active_partner().as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn admin_history_comes_from_rest() {
        let api = Arc::new(FakeApi::new());
        api.set_history(
            "U1",
            vec![
                chat_with_id("1", "U1", "admin-1", "hi", 1),
                chat("admin-1", "U1", "hello", 2),
                chat("U2", "admin-1", "other conversation", 3),
            ],
        );
        let (history, mut published) = history_fixture("admin-1", true, api);

        history.open_conversation(Channel::Admin, "U1").await.unwrap();
        assert!(published.next().is_none());
        let admin = history.store(Channel::Admin);
        assert_eq!(admin.view_state(), ViewState::Ready);
        let contents: Vec<_> = admin.snapshot().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["hi", "hello"]);
    }

    #[tokio::test]
    async fn rest_failure_leaves_loading() {
        let api = Arc::new(FakeApi::new());
        api.fail_history(true);
        let (history, _published) = history_fixture("admin-1", true, api);

        assert!(history.open_conversation(Channel::Admin, "U1").await.is_err());
        assert_eq!(history.store(Channel::Admin).view_state(), ViewState::Loading);
    }

    #[tokio::test]
    async fn bot_entries_never_enter_admin_store() {
        let api = Arc::new(FakeApi::new());
        let (history, _published) = history_fixture("u1", false, api);

        history.open_conversation(Channel::Admin, SUPPORT_ID).await.unwrap();
        history.resolve_batch(vec![
            chat("u1", SUPPORT_ID, "need help", 1),
            chat(BOT_ID, "u1", "bot reply", 2),
        ]);
        let admin = history.store(Channel::Admin).snapshot();
        assert_eq!(admin.len(), 1);
        assert!(admin.iter().all(|m| !m.involves_bot()));
    }

    #[tokio::test]
    async fn unsolicited_batch_is_inferred() {
        let api = Arc::new(FakeApi::new());
        let (history, _published) = history_fixture("u1", false, api);
        history.store(Channel::Bot).set_partner(Some(BOT_ID.into()));

        assert!(history.resolve_batch(vec![chat(BOT_ID, "u1", "hi", 1)]));
        assert_eq!(history.store(Channel::Bot).len(), 1);
        assert!(!history.resolve_batch(Vec::new()));
    }

    #[tokio::test]
    async fn resync_rerequests_without_clearing() {
        let api = Arc::new(FakeApi::new());
        let (history, mut published) = history_fixture("u1", false, api);

        history.open_conversation(Channel::Bot, BOT_ID).await.unwrap();
        history.resolve_batch(vec![chat(BOT_ID, "u1", "hello", 1)]);
        published.next();

        history.resync();
        assert_eq!(history.store(Channel::Bot).len(), 1);
        let (_, body) = published.next().unwrap();
        assert_eq!(body["targetUserId"], "BOT");
        assert!(published.next().is_none());
        assert_eq!(history.pending_len(), 1);
    }

    #[tokio::test]
    async fn close_returns_to_idle() {
        let api = Arc::new(FakeApi::new());
        let (history, _published) = history_fixture("u1", false, api);
        history.open_conversation(Channel::Bot, BOT_ID).await.unwrap();

        history.close(Channel::Bot);
        let bot = history.store(Channel::Bot);
        assert_eq!(bot.view_state(), ViewState::Idle);
        assert_eq!(bot.active_partner(), None);
        assert!(!history.resolve_batch(vec![chat(BOT_ID, "u1", "late", 1)]));
    }
}
