//! Incoming-call notification lifecycle.
//!
//! The registry dispatches a ticket when a recipient starts being rung and
//! closes the same key once that recipient stops being rung. Closing a key
//! that is not pending is a no-op.

use async_trait::async_trait;
use callcore::notification::{IncomingCallNotice, NotificationKey};
use callcore::types::CallId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::debug;

#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn dispatch(&self, key: NotificationKey, notice: IncomingCallNotice);

    /// Returns whether a pending ticket was actually closed.
    async fn close(&self, key: &NotificationKey) -> bool;
}

#[derive(Debug, Clone)]
pub struct PendingNotification {
    pub notice: IncomingCallNotice,
    pub dispatched_at: DateTime<Utc>,
}

/// Keeps pending tickets in memory; stands in for the push delivery service.
#[derive(Debug, Default)]
pub struct InMemoryNotificationCenter {
    pending: DashMap<NotificationKey, PendingNotification>,
}

impl InMemoryNotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self, key: &NotificationKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn pending_for_call(&self, call_id: &CallId) -> Vec<NotificationKey> {
        self.pending
            .iter()
            .filter(|entry| &entry.key().call_id == call_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl NotificationService for InMemoryNotificationCenter {
    async fn dispatch(&self, key: NotificationKey, notice: IncomingCallNotice) {
        debug!("dispatch notification {}", key);
        self.pending.insert(
            key,
            PendingNotification {
                notice,
                dispatched_at: Utc::now(),
            },
        );
    }

    async fn close(&self, key: &NotificationKey) -> bool {
        let closed = self.pending.remove(key).is_some();
        if closed {
            debug!("closed notification {}", key);
        }
        closed
    }
}
