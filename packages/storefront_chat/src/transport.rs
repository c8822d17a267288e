//! Socket transport: a [`Connector`] opens a text-message [`Link`] to the
//! broker. [`WsConnector`] is the WebSocket implementation.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::{ChatError, Result};

const LINK_CHANNEL_CAPACITY: usize = 256;

/// A bidirectional text channel to the broker. Dropping `outgoing` closes
/// the underlying socket; `incoming` yields `None` once the peer is gone.
pub struct Link {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

impl Link {
    /// A connected pair: what one end sends, the other receives.
    pub fn pair(capacity: usize) -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            Link {
                outgoing: a_tx,
                incoming: b_rx,
            },
            Link {
                outgoing: b_tx,
                incoming: a_rx,
            },
        )
    }
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self) -> Result<Link>;
}

pub struct WsConnector {
    url: String,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self) -> Result<Link> {
        let (ws_stream, _) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(&self.url))
                .await
                .map_err(|_| ChatError::Transport(format!("timed out connecting to {}", self.url)))?
                .map_err(|e| ChatError::Transport(e.to_string()))?;

        debug!(url = %self.url, "websocket open");
        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(LINK_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<String>(LINK_CHANNEL_CAPACITY);

        // Writer: drain outgoing → socket; close the socket once the link is dropped
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                    warn!("websocket write error: {}", e);
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        // Reader: socket → incoming
        tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("dropping non-UTF-8 binary message");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "websocket closed by peer");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("websocket read error: {}", e);
                        break;
                    }
                };
                if in_tx.send(text).await.is_err() {
                    break;
                }
            }
        });

        Ok(Link {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
