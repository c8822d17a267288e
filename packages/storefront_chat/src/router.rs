//! Classifies every inbound topic frame and dispatches it to exactly the
//! right store.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::connection::FrameHandler;
use crate::history::HistorySync;
use crate::models::{BOT_ID, Channel, ChatMessage, Identity, Notification};
use crate::protocol::{ChatPayload, TopicKind};
use crate::store::{AppendOutcome, ChannelStore, ConversationDirectory, NotificationStore};

/// What [`MessageRouter::route`] did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    History { applied: bool },
    Live(Channel, AppendOutcome),
    /// Observed, but not for the conversation on screen.
    Filtered,
    Notification { accepted: bool },
    Malformed,
}

pub struct MessageRouter {
    identity: Identity,
    bot: Arc<ChannelStore>,
    admin: Arc<ChannelStore>,
    notifications: Arc<NotificationStore>,
    directory: Option<Arc<ConversationDirectory>>,
    history: Arc<HistorySync>,
    observed: broadcast::Sender<ChatMessage>,
    bot_typing: Arc<watch::Sender<bool>>,
}

impl MessageRouter {
    pub fn new(
        identity: Identity,
        history: Arc<HistorySync>,
        notifications: Arc<NotificationStore>,
        directory: Option<Arc<ConversationDirectory>>,
        bot_typing: Arc<watch::Sender<bool>>,
        event_capacity: usize,
    ) -> Self {
        Self {
            identity,
            bot: history.store(Channel::Bot).clone(),
            admin: history.store(Channel::Admin).clone(),
            notifications,
            directory,
            history,
            observed: broadcast::channel(event_capacity.max(1)).0,
            bot_typing,
        }
    }

    /// Every live chat message, before channel filtering.
    pub fn subscribe_observed(&self) -> broadcast::Receiver<ChatMessage> {
        self.observed.subscribe()
    }

    pub fn route(&self, topic: TopicKind, body: &str) -> RouteOutcome {
        match topic {
            TopicKind::Chat => self.route_chat(body),
            TopicKind::Notifications => self.route_notification(body),
        }
    }

    fn route_chat(&self, body: &str) -> RouteOutcome {
        match serde_json::from_str::<ChatPayload>(body) {
            Ok(ChatPayload::History(batch)) => RouteOutcome::History {
                applied: self.history.resolve_batch(batch),
            },
            Ok(ChatPayload::Live(message)) => self.route_live(message),
            Err(e) => {
                warn!(error = %e, "discarding malformed chat payload");
                RouteOutcome::Malformed
            }
        }
    }

    fn route_live(&self, message: ChatMessage) -> RouteOutcome {
        // Observation happens before filtering: the directory and the
        // observed feed see every message.
        if let Some(directory) = &self.directory {
            directory.observe(&message);
        }
        let _ = self.observed.send(message.clone());
        if message.from == BOT_ID {
            self.bot_typing.send_replace(false);
        }

        if message.involves_bot() {
            return RouteOutcome::Live(Channel::Bot, self.bot.append(message));
        }
        if !self.identity.is_admin() {
            return RouteOutcome::Live(Channel::Admin, self.admin.append(message));
        }
        match self.admin.active_partner() {
            Some(partner) if message.involves(&partner) => {
                RouteOutcome::Live(Channel::Admin, self.admin.append(message))
            }
            _ => {
                debug!(
                    partner = message.counterpart(&self.identity.id),
                    "message for a conversation not on screen"
                );
                RouteOutcome::Filtered
            }
        }
    }

    fn route_notification(&self, body: &str) -> RouteOutcome {
        match serde_json::from_str::<Notification>(body) {
            Ok(notification) => RouteOutcome::Notification {
                accepted: self.notifications.prepend(notification),
            },
            Err(e) => {
                warn!(error = %e, "discarding malformed notification");
                RouteOutcome::Malformed
            }
        }
    }
}

impl FrameHandler for MessageRouter {
    fn on_connected(&self) {
        self.history.resync();
    }

    fn on_frame(&self, topic: TopicKind, body: &str) {
        let outcome = self.route(topic, body);
        debug!(?topic, ?outcome, "routed");
    }
}
