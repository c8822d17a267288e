//! REST collaborators: conversation listing, chat history, notifications,
//! and user lookup.
//!
//! Every endpoint answers with a `{ "success": bool, ... }` envelope. A
//! `success: false` body becomes [`ChatError::Api`] carrying the server's
//! `message` when present.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::auth::CredentialSource;
use crate::error::{ChatError, Result};
use crate::models::{ChatMessage, Notification};

/// One row of `GET /chat/conversations`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserSummary {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[async_trait]
pub trait StorefrontApi: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>>;
    async fn history_with(&self, partner_id: &str) -> Result<Vec<ChatMessage>>;
    async fn notifications(&self) -> Result<Vec<Notification>>;
    async fn unread_count(&self) -> Result<u32>;
    async fn mark_notification_read(&self, notification_id: &str) -> Result<()>;
    /// `Ok(None)` when the user does not exist.
    async fn lookup_user(&self, user_id: &str) -> Result<Option<UserSummary>>;
}

#[derive(Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(flatten)]
    data: T,
}

#[derive(Deserialize)]
struct UsersBody {
    #[serde(default)]
    users: Vec<ConversationSummary>,
}

#[derive(Deserialize)]
struct HistoryBody {
    #[serde(default)]
    history: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct NotificationsBody {
    #[serde(default)]
    notifications: Vec<Notification>,
}

#[derive(Deserialize)]
struct CountBody {
    #[serde(default)]
    count: u32,
}

#[derive(Deserialize)]
struct UserBody {
    user: Option<UserSummary>,
}

#[derive(Deserialize)]
struct Empty {}

/// [`StorefrontApi`] over HTTP with bearer authentication.
pub struct HttpApi {
    client: reqwest::Client,
    base_url: Url,
    credentials: Arc<dyn CredentialSource>,
}

impl HttpApi {
    pub fn new(api_url: &str, credentials: Arc<dyn CredentialSource>) -> Result<Self> {
        let base_url = Url::parse(api_url)
            .map_err(|e| ChatError::Config(format!("invalid api_url {api_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ChatError::Config(format!(
                "api_url cannot be a base: {api_url}"
            )));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            credentials,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn bearer(&self) -> Result<String> {
        self.credentials
            .credential()
            .ok_or(ChatError::Unauthenticated)
    }

    async fn unwrap_envelope<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let envelope: Envelope<T> = response.error_for_status()?.json().await?;
        if !envelope.success {
            return Err(ChatError::Api(
                envelope
                    .message
                    .unwrap_or_else(|| "request was not successful".to_string()),
            ));
        }
        Ok(envelope.data)
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T> {
        let url = self.endpoint(segments);
        debug!(url = %url, "GET");
        let response = self
            .client
            .get(url)
            .bearer_auth(self.bearer()?)
            .send()
            .await?;
        Self::unwrap_envelope(response).await
    }
}

#[async_trait]
impl StorefrontApi for HttpApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let body: UsersBody = self.get(&["chat", "conversations"]).await?;
        Ok(body.users)
    }

    async fn history_with(&self, partner_id: &str) -> Result<Vec<ChatMessage>> {
        let body: HistoryBody = self.get(&["chat", "history", partner_id]).await?;
        Ok(body.history)
    }

    async fn notifications(&self) -> Result<Vec<Notification>> {
        let body: NotificationsBody = self.get(&["notifications"]).await?;
        Ok(body.notifications)
    }

    async fn unread_count(&self) -> Result<u32> {
        let body: CountBody = self.get(&["notifications", "unread-count"]).await?;
        Ok(body.count)
    }

    async fn mark_notification_read(&self, notification_id: &str) -> Result<()> {
        let url = self.endpoint(&["notifications", notification_id, "read"]);
        debug!(url = %url, "PUT");
        let response = self
            .client
            .put(url)
            .bearer_auth(self.bearer()?)
            .send()
            .await?;
        let _: Empty = Self::unwrap_envelope(response).await?;
        Ok(())
    }

    async fn lookup_user(&self, user_id: &str) -> Result<Option<UserSummary>> {
        let url = self.endpoint(&["users", user_id]);
        let response = self
            .client
            .get(url)
            .bearer_auth(self.bearer()?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: UserBody = Self::unwrap_envelope(response).await?;
        Ok(body.user)
    }
}
