//! Notification feed and unread counter, fed by pushes and by the initial
//! REST pull.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::api::StorefrontApi;
use crate::error::Result;
use crate::models::Notification;

/// Notification feed (newest first), unread counter, and an arrival stream
/// for UI reactions such as opening the bell dropdown.
pub struct NotificationStore {
    feed: watch::Sender<Vec<Notification>>,
    unread: watch::Sender<u32>,
    arrivals: broadcast::Sender<Notification>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Ids pushed since the last baseline load
    pushed: HashSet<String>,
}

impl NotificationStore {
    pub fn new(arrival_capacity: usize) -> Self {
        Self {
            feed: watch::channel(Vec::new()).0,
            unread: watch::channel(0).0,
            arrivals: broadcast::channel(arrival_capacity.max(1)).0,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Fetch the feed and the unread count and install them as the baseline.
    ///
    /// Items pushed while the fetch was in flight are reconciled by id: one
    /// already in the pulled list is not counted twice, one missing from it
    /// stays at the head and adds to the server count.
    pub async fn load_initial(&self, api: &dyn StorefrontApi) -> Result<()> {
        let (items, count) = tokio::try_join!(api.notifications(), api.unread_count())?;
        self.install_baseline(items, count);
        Ok(())
    }

    pub fn install_baseline(&self, items: Vec<Notification>, server_unread: u32) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let pulled: HashSet<&str> = items.iter().map(|n| n.id.as_str()).collect();

        let current = self.feed.borrow().clone();
        let extras: Vec<Notification> = current
            .into_iter()
            .filter(|n| inner.pushed.contains(&n.id) && !pulled.contains(n.id.as_str()))
            .collect();
        let extra_unread = extras.iter().filter(|n| !n.read).count() as u32;

        let mut feed = extras;
        feed.extend(items);
        let total = feed.len();
        let unread = server_unread.saturating_add(extra_unread);

        self.feed.send_replace(feed);
        self.unread.send_replace(unread);
        inner.pushed.clear();
        info!(items = total, unread = unread, "notification baseline loaded");
    }

    /// Insert a pushed notification at the head. Returns `false` for an id
    /// already in the feed.
    pub fn prepend(&self, notification: Notification) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = notification.id.clone();
        let unread = !notification.read;
        let inserted = self.feed.send_if_modified(|feed| {
            if feed.iter().any(|n| n.id == id) {
                return false;
            }
            feed.insert(0, notification.clone());
            true
        });
        if !inserted {
            debug!(id = %id, "duplicate notification ignored");
            return false;
        }
        if unread {
            self.unread.send_modify(|c| *c = c.saturating_add(1));
        }
        inner.pushed.insert(id);
        drop(inner);

        let _ = self.arrivals.send(notification);
        true
    }

    /// Flip `id` to read locally and tell the server. Only an unread → read
    /// flip decrements the counter or reaches the server. Server failures are
    /// logged; the local state is kept.
    pub async fn mark_read(&self, id: &str, api: &dyn StorefrontApi) -> bool {
        let flipped = self.flip_read(id);
        if flipped {
            if let Err(e) = api.mark_notification_read(id).await {
                warn!(id = %id, code = e.error_code(), "failed to mark notification read: {}", e);
            }
        }
        flipped
    }

    /// Mark every unread item read. Returns how many flipped.
    pub async fn mark_all_read(&self, api: &dyn StorefrontApi) -> usize {
        let ids: Vec<String> = self
            .feed
            .borrow()
            .iter()
            .filter(|n| !n.read)
            .map(|n| n.id.clone())
            .collect();
        let mut flipped = 0;
        for id in ids {
            if self.mark_read(&id, api).await {
                flipped += 1;
            }
        }
        flipped
    }

    fn flip_read(&self, id: &str) -> bool {
        let _inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let flipped = self.feed.send_if_modified(|feed| {
            match feed.iter_mut().find(|n| n.id == id && !n.read) {
                Some(n) => {
                    n.read = true;
                    true
                }
                None => false,
            }
        });
        if flipped {
            self.unread.send_modify(|c| *c = c.saturating_sub(1));
        }
        flipped
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.pushed.clear();
        self.feed.send_replace(Vec::new());
        self.unread.send_replace(0);
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.feed.borrow().clone()
    }

    pub fn unread_count(&self) -> u32 {
        *self.unread.borrow()
    }

    pub fn subscribe_feed(&self) -> watch::Receiver<Vec<Notification>> {
        self.feed.subscribe()
    }

    pub fn subscribe_unread(&self) -> watch::Receiver<u32> {
        self.unread.subscribe()
    }

    pub fn subscribe_arrivals(&self) -> broadcast::Receiver<Notification> {
        self.arrivals.subscribe()
    }
}
