use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use stomp_frame::{Command, Frame, decode_all};
use tokio::sync::{mpsc, oneshot};

use crate::api::{ConversationSummary, StorefrontApi, UserSummary};
use crate::config::{ClientConfig, ConnectionConfig};
use crate::connection::{FrameHandler, OutboundFrame, Publisher};
use crate::error::{ChatError, Result};
use crate::history::HistorySync;
use crate::models::{ChatMessage, Delivery, Identity, Notification, Role};
use crate::protocol::TopicKind;
use crate::store::ChannelStore;
use crate::transport::{Connector, Link};

/// Await `fut`, failing the test after five seconds.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out waiting")
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

pub fn test_connection_config() -> ConnectionConfig {
    ConnectionConfig {
        reconnect_delay: Duration::from_millis(20),
        outbox_capacity: 16,
        event_capacity: 64,
        connect_timeout: Duration::from_secs(2),
    }
}

pub fn test_client_config() -> ClientConfig {
    ClientConfig {
        ws_url: "ws://shop.test/ws".into(),
        api_url: "http://shop.test/api".into(),
        connection: test_connection_config(),
    }
}

// ── message builders ────────────────────────────────────────────────────

pub fn chat(from: &str, to: &str, content: &str, timestamp: i64) -> ChatMessage {
    ChatMessage {
        id: None,
        from: from.into(),
        to: to.into(),
        from_name: String::new(),
        content: content.into(),
        timestamp,
        delivery: Delivery::Confirmed,
    }
}

pub fn chat_with_id(id: &str, from: &str, to: &str, content: &str, timestamp: i64) -> ChatMessage {
    ChatMessage {
        id: Some(id.into()),
        ..chat(from, to, content, timestamp)
    }
}

pub fn notification(id: &str, message: &str, read: bool) -> Notification {
    Notification {
        id: id.into(),
        user_id: "u1".into(),
        message: message.into(),
        link: String::new(),
        read,
        timestamp: 0,
    }
}

// ── in-memory broker ────────────────────────────────────────────────────

/// A [`Connector`] whose links terminate in the test, which plays broker.
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<Link>,
    refuse: AtomicUsize,
    opened: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> (Arc<Self>, MemoryBroker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            accepted: tx,
            refuse: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
        });
        (connector, MemoryBroker { links: rx })
    }

    /// Fail the next `n` opens (`usize::MAX` = forever).
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    /// Open attempts so far, refused ones included.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self) -> Result<Link> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(n),
                n => Some(n - 1),
            })
            .is_ok();
        if refused {
            return Err(ChatError::Transport("connection refused".into()));
        }
        let (client, server) = Link::pair(64);
        self.accepted
            .send(server)
            .map_err(|_| ChatError::Transport("broker gone".into()))?;
        Ok(client)
    }
}

pub struct MemoryBroker {
    links: mpsc::UnboundedReceiver<Link>,
}

impl MemoryBroker {
    pub async fn accept(&mut self) -> BrokerSide {
        let link = self.links.recv().await.expect("connector dropped");
        BrokerSide {
            link,
            pending: VecDeque::new(),
            subscriptions: HashMap::new(),
            next_message_id: 0,
        }
    }
}

/// The broker's end of one link.
pub struct BrokerSide {
    link: Link,
    pending: VecDeque<Frame>,
    /// subscription id → destination
    subscriptions: HashMap<String, String>,
    next_message_id: u64,
}

impl BrokerSide {
    pub async fn expect_frame(&mut self) -> Frame {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return frame;
            }
            let text = self.link.incoming.recv().await.expect("client closed link");
            self.pending.extend(decode_all(&text).expect("client sent a malformed frame"));
        }
    }

    /// Next SEND frame as `(destination, json body)`.
    pub async fn expect_send(&mut self) -> (String, serde_json::Value) {
        let frame = self.expect_frame().await;
        assert_eq!(frame.command, Command::Send, "expected SEND, got {frame:?}");
        let destination = frame.get("destination").unwrap_or_default().to_string();
        let body = serde_json::from_str(&frame.body).expect("SEND body is JSON");
        (destination, body)
    }

    pub async fn send_raw(&self, text: &str) {
        self.link
            .outgoing
            .send(text.to_string())
            .await
            .expect("client dropped link");
    }

    pub async fn send_connected(&self) {
        let frame = Frame::new(Command::Connected).with_header("version", "1.2");
        self.send_raw(&frame.encode()).await;
    }

    pub async fn send_error(&self, message: &str) {
        let frame = Frame::new(Command::Error).with_header("message", message);
        self.send_raw(&frame.encode()).await;
    }

    /// CONNECT → CONNECTED → both SUBSCRIBEs. Returns the CONNECT frame.
    pub async fn complete_handshake(&mut self) -> Frame {
        let connect = self.expect_frame().await;
        assert_eq!(connect.command, Command::Connect);
        self.send_connected().await;
        for _ in TopicKind::ALL {
            let sub = self.expect_frame().await;
            assert_eq!(sub.command, Command::Subscribe);
            self.subscriptions.insert(
                sub.get("id").unwrap_or_default().to_string(),
                sub.get("destination").unwrap_or_default().to_string(),
            );
        }
        connect
    }

    pub async fn deliver(&mut self, topic: TopicKind, body: &str) {
        let id = topic.subscription_id();
        let destination = self.subscriptions.get(id).cloned().unwrap_or_default();
        self.next_message_id += 1;
        let frame = Frame::new(Command::Message)
            .with_header("subscription", id)
            .with_header("destination", destination)
            .with_header("message-id", self.next_message_id.to_string())
            .with_body(body);
        self.send_raw(&frame.encode()).await;
    }

    pub async fn deliver_json(&mut self, topic: TopicKind, value: serde_json::Value) {
        self.deliver(topic, &value.to_string()).await;
    }

    pub fn close(self) {}
}

// ── frame handler ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingHandler {
    connected: AtomicUsize,
    frames: Mutex<Vec<(TopicKind, String)>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<(TopicKind, String)> {
        self.frames.lock().unwrap().clone()
    }

    pub async fn wait_frames(&self, n: usize) {
        eventually(|| self.frames.lock().unwrap().len() >= n).await
    }

    pub async fn wait_connected(&self, n: usize) {
        eventually(|| self.connected.load(Ordering::SeqCst) >= n).await
    }
}

impl FrameHandler for RecordingHandler {
    fn on_connected(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_frame(&self, topic: TopicKind, body: &str) {
        self.frames.lock().unwrap().push((topic, body.to_string()));
    }
}

// ── history fixture ─────────────────────────────────────────────────────

/// Frames a test publisher has queued.
pub struct PublishedFrames {
    rx: mpsc::Receiver<OutboundFrame>,
}

impl PublishedFrames {
    pub fn next(&mut self) -> Option<(String, serde_json::Value)> {
        let frame = self.rx.try_recv().ok()?;
        let body = serde_json::from_str(&frame.body).expect("published JSON");
        Some((frame.destination, body))
    }
}

pub fn history_fixture(
    me: &str,
    admin: bool,
    api: Arc<FakeApi>,
) -> (Arc<HistorySync>, PublishedFrames) {
    let role = if admin { Role::Admin } else { Role::Customer };
    let identity = Identity::new(me, me, role);
    let (publisher, rx) = Publisher::attached(16);
    let history = HistorySync::new(
        &identity,
        Arc::new(ChannelStore::new(crate::models::Channel::Bot)),
        Arc::new(ChannelStore::new(crate::models::Channel::Admin)),
        publisher,
        api,
    );
    (Arc::new(history), PublishedFrames { rx })
}

// ── fake REST API ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeApi {
    conversations: Mutex<Vec<ConversationSummary>>,
    histories: Mutex<HashMap<String, Vec<ChatMessage>>>,
    history_gates: Mutex<HashMap<String, oneshot::Receiver<()>>>,
    notifications: Mutex<(Vec<Notification>, u32)>,
    notifications_gate: Mutex<Option<oneshot::Receiver<()>>>,
    users: Mutex<HashMap<String, String>>,
    marked_read: Mutex<Vec<String>>,
    fail_history: AtomicBool,
    fail_mark_read: AtomicBool,
    lookups: AtomicUsize,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_conversations(&self, conversations: Vec<ConversationSummary>) {
        *self.conversations.lock().unwrap() = conversations;
    }

    pub fn set_history(&self, partner: &str, history: Vec<ChatMessage>) {
        self.histories
            .lock()
            .unwrap()
            .insert(partner.to_string(), history);
    }

    /// Hold `history_with(partner)` until the returned sender fires.
    pub fn gate_history(&self, partner: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.history_gates
            .lock()
            .unwrap()
            .insert(partner.to_string(), rx);
        tx
    }

    pub fn set_notifications(&self, items: Vec<Notification>, unread: u32) {
        *self.notifications.lock().unwrap() = (items, unread);
    }

    /// Hold `notifications()` until the returned sender fires.
    pub fn gate_notifications(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.notifications_gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn add_user(&self, id: &str, name: &str) {
        self.users
            .lock()
            .unwrap()
            .insert(id.to_string(), name.to_string());
    }

    pub fn fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    pub fn fail_mark_read(&self, fail: bool) {
        self.fail_mark_read.store(fail, Ordering::SeqCst);
    }

    pub fn marked_read(&self) -> Vec<String> {
        self.marked_read.lock().unwrap().clone()
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorefrontApi for FakeApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn history_with(&self, partner_id: &str) -> Result<Vec<ChatMessage>> {
        let gate = self.history_gates.lock().unwrap().remove(partner_id);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(ChatError::Api("history unavailable".into()));
        }
        Ok(self
            .histories
            .lock()
            .unwrap()
            .get(partner_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn notifications(&self) -> Result<Vec<Notification>> {
        let gate = self.notifications_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        Ok(self.notifications.lock().unwrap().0.clone())
    }

    async fn unread_count(&self) -> Result<u32> {
        Ok(self.notifications.lock().unwrap().1)
    }

    async fn mark_notification_read(&self, notification_id: &str) -> Result<()> {
        self.marked_read
            .lock()
            .unwrap()
            .push(notification_id.to_string());
        if self.fail_mark_read.load(Ordering::SeqCst) {
            return Err(ChatError::Api("mark read failed".into()));
        }
        Ok(())
    }

    async fn lookup_user(&self, user_id: &str) -> Result<Option<UserSummary>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .users
            .lock()
            .unwrap()
            .get(user_id)
            .map(|name| UserSummary {
                id: user_id.to_string(),
                name: name.clone(),
            }))
    }
}
