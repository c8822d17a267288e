//! Ties the chat session lifecycle to the observable identity: a session
//! exists exactly while an identity is present.

use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::api::StorefrontApi;
use crate::auth::CredentialSource;
use crate::config::ClientConfig;
use crate::models::Identity;
use crate::session::ChatSession;
use crate::transport::Connector;

pub struct SessionSupervisor {
    api: Arc<dyn StorefrontApi>,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialSource>,
    config: ClientConfig,
    current: watch::Sender<Option<Arc<ChatSession>>>,
    /// Serializes identity transitions
    transition: Mutex<()>,
}

impl SessionSupervisor {
    pub fn new(
        api: Arc<dyn StorefrontApi>,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialSource>,
        config: ClientConfig,
    ) -> Self {
        Self {
            api,
            connector,
            credentials,
            config,
            current: watch::channel(None).0,
            transition: Mutex::new(()),
        }
    }

    pub fn current(&self) -> Option<Arc<ChatSession>> {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<ChatSession>>> {
        self.current.subscribe()
    }

    /// Follow `identity` until its sender is dropped, then tear down.
    pub async fn run(&self, mut identity: watch::Receiver<Option<Identity>>) {
        let initial = identity.borrow_and_update().clone();
        self.apply(initial).await;
        while identity.changed().await.is_ok() {
            let next = identity.borrow_and_update().clone();
            self.apply(next).await;
        }
        debug!("identity source closed");
        self.apply(None).await;
    }

    /// Move to `identity`: start, keep, replace, or tear down the session.
    pub async fn apply(&self, identity: Option<Identity>) {
        let _guard = self.transition.lock().await;

        let existing = self.current();
        if let (Some(session), Some(next)) = (&existing, &identity) {
            if session.identity() == next {
                debug!(identity = %next.id, "identity unchanged");
                return;
            }
        }

        if let Some(session) = existing {
            session.teardown().await;
            self.current.send_replace(None);
        }

        let Some(identity) = identity else {
            return;
        };
        let Some(credential) = self.credentials.credential() else {
            warn!(identity = %identity.id, "identity present without a credential; not connecting");
            return;
        };

        info!(identity = %identity.id, "starting chat session");
        let session = ChatSession::start(
            identity,
            &credential,
            self.api.clone(),
            self.connector.clone(),
            &self.config,
        )
        .await;
        self.current.send_replace(Some(session));
    }

    pub async fn shutdown(&self) {
        self.apply(None).await;
    }
}
