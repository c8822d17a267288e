//! ConnectionManager: the single live broker session for the signed-in
//! identity.
//!
//! One worker task per identity drives the cycle
//! `Connecting → CONNECT/CONNECTED → SUBSCRIBE → Connected → pump`, falling
//! back to `Disconnected` and a fixed reconnect delay whenever the link is
//! lost. Outgoing frames go through a bounded outbox that outlives individual
//! links, so a publish made while reconnecting is delivered by the next link.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;
use stomp_frame::{Command, Frame, decode_all, is_heartbeat};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{ChatError, Result};
use crate::models::ConnectionState;
use crate::protocol::{RawFrame, TopicKind};
use crate::transport::{Connector, Link};

/// Receives every MESSAGE frame synchronously, in arrival order, before it
/// reaches the raw topic taps.
pub trait FrameHandler: Send + Sync + 'static {
    /// Called each time a link completes its handshake and subscriptions.
    fn on_connected(&self);
    fn on_frame(&self, topic: TopicKind, body: &str);
}

#[derive(Debug)]
pub(crate) struct OutboundFrame {
    pub(crate) destination: String,
    pub(crate) body: String,
}

impl OutboundFrame {
    fn to_stomp(&self) -> Frame {
        Frame::send(&self.destination, self.body.clone())
    }
}

/// Cloneable handle for publishing to the broker through the session outbox.
#[derive(Clone)]
pub struct Publisher {
    slot: Arc<RwLock<Option<mpsc::Sender<OutboundFrame>>>>,
    capacity: usize,
}

impl Publisher {
    fn new(capacity: usize) -> Self {
        Self {
            slot: Arc::new(RwLock::new(None)),
            capacity,
        }
    }

    /// Queue `payload` as JSON for `destination`. Never waits: a full outbox
    /// is reported as [`ChatError::OutboxFull`].
    pub fn publish<T: Serialize + ?Sized>(&self, destination: &str, payload: &T) -> Result<()> {
        let guard = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return Err(ChatError::NotConnected);
        };
        let frame = OutboundFrame {
            destination: destination.to_string(),
            body: serde_json::to_string(payload)?,
        };
        tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => ChatError::OutboxFull {
                capacity: self.capacity,
            },
            TrySendError::Closed(_) => ChatError::NotConnected,
        })
    }

    pub fn is_attached(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn attach(&self, tx: mpsc::Sender<OutboundFrame>) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    fn detach(&self) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    #[cfg(test)]
    pub(crate) fn attached(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let publisher = Self::new(capacity);
        let (tx, rx) = mpsc::channel(capacity);
        publisher.attach(tx);
        (publisher, rx)
    }
}

struct TopicTaps {
    chat: broadcast::Sender<RawFrame>,
    notifications: broadcast::Sender<RawFrame>,
}

impl TopicTaps {
    fn new(capacity: usize) -> Self {
        Self {
            chat: broadcast::channel(capacity).0,
            notifications: broadcast::channel(capacity).0,
        }
    }

    fn get(&self, topic: TopicKind) -> &broadcast::Sender<RawFrame> {
        match topic {
            TopicKind::Chat => &self.chat,
            TopicKind::Notifications => &self.notifications,
        }
    }
}

struct LiveSession {
    identity_id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    /// Value of the STOMP `host` header
    host: String,
    state: Arc<watch::Sender<ConnectionState>>,
    taps: Arc<TopicTaps>,
    publisher: Publisher,
    live: Mutex<Option<LiveSession>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
        host: impl Into<String>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            host: host.into(),
            state: Arc::new(state),
            taps: Arc::new(TopicTaps::new(config.event_capacity)),
            publisher: Publisher::new(config.outbox_capacity),
            config,
            live: Mutex::new(None),
        }
    }

    /// Start the session for `identity_id`. A no-op returning `false` while a
    /// session for the same identity is alive; a different identity replaces
    /// the current session.
    pub async fn connect(
        &self,
        identity_id: &str,
        credential: &str,
        handler: Arc<dyn FrameHandler>,
    ) -> bool {
        {
            let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(session) = live.as_ref() {
                if session.identity_id == identity_id && !session.task.is_finished() {
                    debug!(identity = %identity_id, "session already running");
                    return false;
                }
            }
        }
        self.disconnect().await;

        let (tx, rx) = mpsc::channel(self.config.outbox_capacity);
        self.publisher.attach(tx);

        let cancel = CancellationToken::new();
        let worker = SessionWorker {
            connector: self.connector.clone(),
            config: self.config.clone(),
            host: self.host.clone(),
            identity_id: identity_id.to_string(),
            credential: credential.to_string(),
            handler,
            state: self.state.clone(),
            taps: self.taps.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run(rx));

        info!(identity = %identity_id, "session started");
        *self.live.lock().unwrap_or_else(PoisonError::into_inner) = Some(LiveSession {
            identity_id: identity_id.to_string(),
            cancel,
            task,
        });
        true
    }

    /// Tear down the live session and wait for its worker to finish. Unsent
    /// frames are discarded. Idempotent.
    pub async fn disconnect(&self) {
        self.publisher.detach();
        let session = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(session) = session else {
            return;
        };

        session.cancel.cancel();
        if let Err(e) = session.task.await {
            if e.is_panic() {
                error!(identity = %session.identity_id, "session worker panicked");
            }
        }
        self.state.send_replace(ConnectionState::Disconnected);
        info!(identity = %session.identity_id, "session ended");
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Raw MESSAGE bodies for one topic, delivered after the frame handler.
    pub fn subscribe_topic(&self, topic: TopicKind) -> broadcast::Receiver<RawFrame> {
        self.taps.get(topic).subscribe()
    }

    pub fn active_identity(&self) -> Option<String> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.identity_id.clone())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let live = self.live.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = live.take() {
            session.cancel.cancel();
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

enum PumpExit {
    Cancelled,
    Lost(String),
}

/// A [`Link`] speaking STOMP frames.
struct StompLink {
    link: Link,
    pending: VecDeque<Frame>,
}

impl StompLink {
    fn new(link: Link) -> Self {
        Self {
            link,
            pending: VecDeque::new(),
        }
    }

    async fn send(&self, frame: &Frame) -> Result<()> {
        self.link
            .outgoing
            .send(frame.encode())
            .await
            .map_err(|_| ChatError::Transport("link closed".into()))
    }

    /// Next decoded frame, or `None` once the link is closed. Malformed
    /// messages are logged and skipped.
    async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(frame);
            }
            let text = self.link.incoming.recv().await?;
            if is_heartbeat(&text) {
                continue;
            }
            match decode_all(&text) {
                Ok(frames) => self.pending.extend(frames),
                Err(e) => warn!(error = %e, code = e.error_code(), "discarding malformed frame"),
            }
        }
    }
}

struct SessionWorker {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    host: String,
    identity_id: String,
    credential: String,
    handler: Arc<dyn FrameHandler>,
    state: Arc<watch::Sender<ConnectionState>>,
    taps: Arc<TopicTaps>,
    cancel: CancellationToken,
}

impl SessionWorker {
    async fn run(self, mut outbox: mpsc::Receiver<OutboundFrame>) {
        // A frame whose write failed; it goes out first on the next link
        let mut carry: Option<OutboundFrame> = None;
        let mut attempt = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            attempt += 1;
            self.state.send_replace(ConnectionState::Connecting);
            debug!(identity = %self.identity_id, attempt = attempt, "connecting");

            let established = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = tokio::time::timeout(self.config.connect_timeout, self.establish()) => {
                    result.unwrap_or_else(|_| Err(ChatError::Handshake("timed out".into())))
                }
            };

            match established {
                Ok(mut link) => {
                    info!(identity = %self.identity_id, attempt = attempt, "connected");
                    attempt = 0;
                    self.state.send_replace(ConnectionState::Connected);
                    self.handler.on_connected();

                    match self.pump(&mut link, &mut outbox, &mut carry).await {
                        PumpExit::Cancelled => break,
                        PumpExit::Lost(reason) => warn!(
                            identity = %self.identity_id,
                            pending = outbox.len() + usize::from(carry.is_some()),
                            "connection lost: {}", reason
                        ),
                    }
                }
                Err(e) => warn!(
                    identity = %self.identity_id,
                    attempt = attempt,
                    code = e.error_code(),
                    "connection attempt failed: {}", e
                ),
            }

            self.state.send_replace(ConnectionState::Disconnected);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        let dropped = outbox.len() + usize::from(carry.is_some());
        outbox.close();
        if dropped > 0 {
            info!(identity = %self.identity_id, dropped = dropped, "discarding unsent frames");
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    async fn establish(&self) -> Result<StompLink> {
        let mut link = StompLink::new(self.connector.open().await?);

        link.send(
            &Frame::connect(&self.host)
                .with_header("Authorization", format!("Bearer {}", self.credential)),
        )
        .await?;

        loop {
            let frame = link
                .next_frame()
                .await
                .ok_or_else(|| ChatError::Handshake("link closed before CONNECTED".into()))?;
            match frame.command {
                Command::Connected => break,
                Command::Error => {
                    return Err(ChatError::Handshake(
                        frame.get("message").unwrap_or("broker error").to_string(),
                    ));
                }
                other => debug!(command = %other, "ignoring frame before CONNECTED"),
            }
        }

        for topic in TopicKind::ALL {
            link.send(&Frame::subscribe(
                topic.subscription_id(),
                &topic.destination(&self.identity_id),
            ))
            .await?;
        }
        Ok(link)
    }

    async fn pump(
        &self,
        link: &mut StompLink,
        outbox: &mut mpsc::Receiver<OutboundFrame>,
        carry: &mut Option<OutboundFrame>,
    ) -> PumpExit {
        if let Some(frame) = carry.take() {
            if let Err(e) = link.send(&frame.to_stomp()).await {
                *carry = Some(frame);
                return PumpExit::Lost(e.to_string());
            }
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = link.send(&Frame::disconnect()).await;
                    return PumpExit::Cancelled;
                }
                next = outbox.recv() => {
                    let Some(frame) = next else {
                        return PumpExit::Cancelled;
                    };
                    if let Err(e) = link.send(&frame.to_stomp()).await {
                        *carry = Some(frame);
                        return PumpExit::Lost(e.to_string());
                    }
                }
                incoming = link.next_frame() => match incoming {
                    Some(frame) => self.dispatch(frame),
                    None => return PumpExit::Lost("link closed".into()),
                }
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        match frame.command {
            Command::Message => {
                let Some(topic) = frame
                    .get("subscription")
                    .and_then(TopicKind::from_subscription_id)
                else {
                    debug!(
                        destination = frame.get("destination").unwrap_or_default(),
                        "MESSAGE for unknown subscription"
                    );
                    return;
                };
                self.handler.on_frame(topic, &frame.body);
                let raw = RawFrame {
                    topic,
                    destination: frame.get("destination").map(str::to_owned),
                    body: frame.body,
                };
                let _ = self.taps.get(topic).send(raw);
            }
            Command::Error => warn!(
                identity = %self.identity_id,
                message = frame.get("message").unwrap_or_default(),
                "broker reported an error"
            ),
            other => debug!(command = %other, "ignoring frame"),
        }
    }
}
