//! Broker destinations and the JSON payloads exchanged over them.

use serde::{Deserialize, Serialize};

use crate::models::ChatMessage;

/// Publish destination for outgoing chat messages.
pub const SEND_MESSAGE: &str = "/app/chat.sendMessage";
/// Publish destination for history requests.
pub const GET_HISTORY: &str = "/app/chat.getHistory";

pub const CHAT_SUBSCRIPTION: &str = "sub-chat";
pub const NOTIFICATION_SUBSCRIPTION: &str = "sub-notifications";

/// The two per-identity topics a session subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Chat,
    Notifications,
}

impl TopicKind {
    pub const ALL: [TopicKind; 2] = [TopicKind::Chat, TopicKind::Notifications];

    pub fn destination(&self, identity_id: &str) -> String {
        match self {
            TopicKind::Chat => format!("/topic/user/{identity_id}"),
            TopicKind::Notifications => format!("/topic/notifications/{identity_id}"),
        }
    }

    pub fn subscription_id(&self) -> &'static str {
        match self {
            TopicKind::Chat => CHAT_SUBSCRIPTION,
            TopicKind::Notifications => NOTIFICATION_SUBSCRIPTION,
        }
    }

    pub fn from_subscription_id(id: &str) -> Option<Self> {
        match id {
            CHAT_SUBSCRIPTION => Some(TopicKind::Chat),
            NOTIFICATION_SUBSCRIPTION => Some(TopicKind::Notifications),
            _ => None,
        }
    }
}

/// A MESSAGE frame body as delivered on a topic, before routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub topic: TopicKind,
    pub destination: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    pub target_user_id: String,
}

/// Payload on the chat topic: an array is a history batch, an object a
/// single live message.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChatPayload {
    History(Vec<ChatMessage>),
    Live(ChatMessage),
}
