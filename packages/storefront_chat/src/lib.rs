//! Real-time chat and notification core for the storefront: one broker
//! connection per signed-in identity, a router that sorts inbound frames,
//! and observable stores for the bot channel, the support channel,
//! notifications, and the admin conversation directory.

pub mod api;
pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod models;
pub mod protocol;
pub mod router;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use api::{HttpApi, StorefrontApi};
pub use auth::{CredentialSource, SharedCredential};
pub use config::{ClientConfig, ClientDirs, ConnectionConfig};
pub use connection::ConnectionManager;
pub use error::{ChatError, Result};
pub use history::{HistorySource, HistorySync, HistoryTicket};
pub use models::{
    BOT_ID, Channel, ChatMessage, ConnectionState, Conversation, Identity, Notification, Role,
    SUPPORT_ID, ViewState,
};
pub use router::{MessageRouter, RouteOutcome};
pub use session::ChatSession;
pub use store::{AppendOutcome, ChannelStore, ConversationDirectory, NotificationStore};
pub use supervisor::SessionSupervisor;
pub use transport::{Connector, WsConnector};
