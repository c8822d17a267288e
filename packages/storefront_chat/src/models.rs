//! Domain types shared by the stores, the router, and the wire protocol.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Participant id reserved for the automated assistant.
pub const BOT_ID: &str = "BOT";

/// Participant id a customer addresses when writing to the support desk.
pub const SUPPORT_ID: &str = "ADMIN";

// === Identity ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "user")]
    Customer,
    Admin,
}

/// The signed-in user, as supplied by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub role: Role,
}

impl Identity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// === Chat ===

/// The two logical chat streams a client maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Channel {
    Bot,
    Admin,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Bot, Channel::Admin];
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Bot => f.write_str("BOT"),
            Channel::Admin => f.write_str("ADMIN"),
        }
    }
}

/// Local delivery phase of a message. Never serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Server-confirmed (or received from the server).
    #[default]
    Confirmed,
    /// Created locally by an optimistic send, not yet seen from the server.
    Provisional { local_id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(
        default,
        deserialize_with = "de_optional_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    pub from: String,
    pub to: String,
    #[serde(default, deserialize_with = "de_nullable_string")]
    pub from_name: String,
    pub content: String,
    pub timestamp: i64,
    #[serde(skip)]
    pub delivery: Delivery,
}

impl ChatMessage {
    /// An optimistic, locally created message awaiting server confirmation.
    pub fn provisional(
        from: impl Into<String>,
        to: impl Into<String>,
        from_name: impl Into<String>,
        content: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            id: None,
            from: from.into(),
            to: to.into(),
            from_name: from_name.into(),
            content: content.into(),
            timestamp,
            delivery: Delivery::Provisional {
                local_id: Uuid::new_v4(),
            },
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self.delivery, Delivery::Provisional { .. })
    }

    pub fn involves(&self, participant: &str) -> bool {
        self.from == participant || self.to == participant
    }

    pub fn involves_bot(&self) -> bool {
        self.involves(BOT_ID)
    }

    /// The channel this message belongs to, judged only by the bot sentinel.
    pub fn channel(&self) -> Channel {
        if self.involves_bot() {
            Channel::Bot
        } else {
            Channel::Admin
        }
    }

    /// The endpoint that is not `me`.
    pub fn counterpart(&self, me: &str) -> &str {
        if self.from == me { &self.to } else { &self.from }
    }

    /// Dedup key: same server id (when both carry one), or the same
    /// `(timestamp, content)` pair. The latter collapses an optimistic entry
    /// with its confirmed counterpart.
    pub fn same_entry(&self, other: &ChatMessage) -> bool {
        if let (Some(a), Some(b)) = (&self.id, &other.id) {
            if a == b {
                return true;
            }
        }
        self.timestamp == other.timestamp && self.content == other.content
    }
}

// === Notifications ===

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, deserialize_with = "de_nullable_string")]
    pub user_id: String,
    pub message: String,
    #[serde(default, deserialize_with = "de_nullable_string")]
    pub link: String,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub timestamp: i64,
}

// === Directory ===

/// One row of the admin sidebar. List position is the recency rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub partner_id: String,
    pub display_name: String,
    pub preview_text: String,
    pub unread_count: u32,
}

impl Conversation {
    pub fn placeholder(partner_id: &str, display_name: &str) -> Self {
        Self {
            partner_id: partner_id.to_string(),
            display_name: display_name.to_string(),
            preview_text: String::new(),
            unread_count: 0,
        }
    }
}

// === State machines ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Per-channel conversation view state: Idle → Loading → Ready → Idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ViewState {
    #[default]
    Idle,
    Loading,
    Ready,
}

// === serde helpers ===

/// Server ids arrive as strings or numbers depending on the endpoint.
fn de_optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) if s.is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    de_optional_id(deserializer)?.ok_or_else(|| serde::de::Error::custom("missing id"))
}

fn de_nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}
