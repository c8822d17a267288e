//! Credential access for the socket handshake and the REST collaborators.

use std::sync::{Arc, PoisonError, RwLock};

/// Read access to the current bearer credential. The auth flow owns it;
/// this crate only reads it.
pub trait CredentialSource: Send + Sync {
    fn credential(&self) -> Option<String>;
}

impl<F> CredentialSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn credential(&self) -> Option<String> {
        self()
    }
}

/// A credential slot that the embedding app updates on login and logout.
#[derive(Clone, Default)]
pub struct SharedCredential {
    inner: Arc<RwLock<Option<String>>>,
}

impl SharedCredential {
    pub fn new(token: Option<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(token)),
        }
    }

    pub fn set(&self, token: Option<String>) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = token;
    }
}

impl CredentialSource for SharedCredential {
    fn credential(&self) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .filter(|t| !t.is_empty())
    }
}

impl std::fmt::Debug for SharedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let present = self.credential().is_some();
        f.debug_struct("SharedCredential")
            .field("present", &present)
            .finish()
    }
}
