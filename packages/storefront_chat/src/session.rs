//! ChatSession: everything one signed-in identity owns. Stores, history,
//! the router, and the broker connection are created together and torn down
//! together.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::StorefrontApi;
use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, Publisher};
use crate::error::{ChatError, Result};
use crate::history::HistorySync;
use crate::models::{BOT_ID, Channel, ChatMessage, ConnectionState, Identity, SUPPORT_ID};
use crate::protocol::{RawFrame, SEND_MESSAGE, TopicKind};
use crate::router::MessageRouter;
use crate::store::{ChannelStore, ConversationDirectory, NotificationStore};
use crate::transport::Connector;

pub struct ChatSession {
    identity: Identity,
    api: Arc<dyn StorefrontApi>,
    connection: ConnectionManager,
    publisher: Publisher,
    router: Arc<MessageRouter>,
    history: Arc<HistorySync>,
    notifications: Arc<NotificationStore>,
    directory: Option<Arc<ConversationDirectory>>,
    bot_typing: Arc<watch::Sender<bool>>,
    last_timestamp: AtomicI64,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatSession {
    /// Build a session without connecting.
    pub fn new(
        identity: Identity,
        api: Arc<dyn StorefrontApi>,
        connector: Arc<dyn Connector>,
        config: &ClientConfig,
    ) -> Self {
        let connection = ConnectionManager::new(
            connector,
            config.connection.clone(),
            broker_host(&config.ws_url),
        );
        let publisher = connection.publisher();

        let bot = Arc::new(ChannelStore::new(Channel::Bot));
        let admin = Arc::new(ChannelStore::new(Channel::Admin));
        let history = Arc::new(HistorySync::new(
            &identity,
            bot,
            admin.clone(),
            publisher.clone(),
            api.clone(),
        ));
        let notifications = Arc::new(NotificationStore::new(config.connection.event_capacity));
        let directory = identity.is_admin().then(|| {
            Arc::new(ConversationDirectory::new(
                identity.id.clone(),
                admin,
                history.clone(),
                api.clone(),
            ))
        });
        let bot_typing = Arc::new(watch::channel(false).0);
        let router = Arc::new(MessageRouter::new(
            identity.clone(),
            history.clone(),
            notifications.clone(),
            directory.clone(),
            bot_typing.clone(),
            config.connection.event_capacity,
        ));

        Self {
            identity,
            api,
            connection,
            publisher,
            router,
            history,
            notifications,
            directory,
            bot_typing,
            last_timestamp: AtomicI64::new(0),
            cancel: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        }
    }

    /// Build, open the default conversations, connect, and start the initial
    /// REST loads.
    pub async fn start(
        identity: Identity,
        credential: &str,
        api: Arc<dyn StorefrontApi>,
        connector: Arc<dyn Connector>,
        config: &ClientConfig,
    ) -> Arc<Self> {
        let session = Arc::new(Self::new(identity, api, connector, config));
        session.open_default_conversations();
        session
            .connection
            .connect(&session.identity.id, credential, session.router.clone())
            .await;
        session.spawn_initial_loads();
        info!(identity = %session.identity.id, admin = session.identity.is_admin(), "chat session started");
        session
    }

    /// BOT always; support for customers. Requests go out on connect.
    fn open_default_conversations(&self) {
        self.history.begin(Channel::Bot, BOT_ID);
        if !self.identity.is_admin() {
            self.history.begin(Channel::Admin, SUPPORT_ID);
        }
    }

    fn spawn_initial_loads(&self) {
        let mut handles = Vec::new();

        let notifications = self.notifications.clone();
        let api = self.api.clone();
        let cancel = self.cancel.clone();
        handles.push(tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                result = notifications.load_initial(api.as_ref()) => {
                    if let Err(e) = result {
                        warn!(code = e.error_code(), "initial notification load failed: {}", e);
                    }
                }
            }
        }));

        if let Some(directory) = self.directory.clone() {
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {}
                    result = directory.load() => {
                        if let Err(e) = result {
                            warn!(code = e.error_code(), "conversation list load failed: {}", e);
                        }
                    }
                }
            }));
        }

        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
    }

    // === Chat ===

    /// Optimistically append `content` to `channel` and publish it. The
    /// entry stays provisional until the server's copy reconciles it.
    pub fn send_message(&self, channel: Channel, content: &str) -> Result<ChatMessage> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let to = match channel {
            Channel::Bot => BOT_ID.to_string(),
            Channel::Admin if self.identity.is_admin() => self
                .history
                .store(Channel::Admin)
                .active_partner()
                .ok_or(ChatError::NoActivePartner)?,
            Channel::Admin => SUPPORT_ID.to_string(),
        };

        let message = ChatMessage::provisional(
            &self.identity.id,
            to,
            &self.identity.display_name,
            content,
            self.next_timestamp(),
        );
        self.publisher.publish(SEND_MESSAGE, &message)?;

        self.history.store(channel).append(message.clone());
        match channel {
            Channel::Bot => {
                self.bot_typing.send_replace(true);
            }
            Channel::Admin => {
                if let Some(directory) = &self.directory {
                    directory.observe(&message);
                }
            }
        }
        Ok(message)
    }

    pub async fn open_conversation(&self, channel: Channel, partner: &str) -> Result<()> {
        self.history.open_conversation(channel, partner).await
    }

    pub fn close_conversation(&self, channel: Channel) {
        self.history.close(channel);
    }

    /// Admin only: make `partner` the active support conversation.
    pub async fn select_partner(&self, partner: &str) -> Result<()> {
        let directory = self
            .directory
            .as_ref()
            .ok_or(ChatError::NotPermitted("conversation directory is admin-only"))?;
        directory.select_partner(partner).await
    }

    // === Notifications ===

    pub async fn mark_read(&self, notification_id: &str) -> bool {
        self.notifications
            .mark_read(notification_id, self.api.as_ref())
            .await
    }

    pub async fn mark_all_read(&self) -> usize {
        self.notifications.mark_all_read(self.api.as_ref()).await
    }

    pub async fn refresh_notifications(&self) -> Result<()> {
        self.notifications.load_initial(self.api.as_ref()).await
    }

    // === Lifecycle ===

    /// Stop background work, close the connection, and empty every store.
    /// Idempotent.
    pub async fn teardown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }

        self.connection.disconnect().await;

        self.history.forget_pending();
        for channel in Channel::ALL {
            self.history.store(channel).reset();
        }
        self.notifications.clear();
        if let Some(directory) = &self.directory {
            directory.clear();
        }
        self.bot_typing.send_replace(false);
        info!(identity = %self.identity.id, "chat session torn down");
    }

    // === Accessors ===

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn store(&self, channel: Channel) -> &Arc<ChannelStore> {
        self.history.store(channel)
    }

    pub fn notifications(&self) -> &Arc<NotificationStore> {
        &self.notifications
    }

    pub fn directory(&self) -> Option<&Arc<ConversationDirectory>> {
        self.directory.as_ref()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.connection_state()
    }

    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    pub fn subscribe_topic(&self, topic: TopicKind) -> broadcast::Receiver<RawFrame> {
        self.connection.subscribe_topic(topic)
    }

    pub fn subscribe_observed(&self) -> broadcast::Receiver<ChatMessage> {
        self.router.subscribe_observed()
    }

    pub fn bot_typing(&self) -> watch::Receiver<bool> {
        self.bot_typing.subscribe()
    }

    /// Wall-clock millis, strictly increasing within the session so two
    /// identical sends never share a dedup key.
    fn next_timestamp(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let previous = self
            .last_timestamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// STOMP `host` header value for a broker URL.
fn broker_host(ws_url: &str) -> String {
    url::Url::parse(ws_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
        .unwrap_or_else(|| "localhost".to_string())
}
