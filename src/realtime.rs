//! Live update fan-out: one broadcast topic per geographic group plus a global one.
//!
//! No delivery guarantee across a disconnect or a lagging receiver; a lagged
//! subscriber gets a `Resync` notice and is expected to re-fetch state.

use metrics::counter;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::aggregate::FireEvent;

pub const DEFAULT_REALTIME_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    EventAdded { group: String, event: FireEvent },
    EventUpdated { group: String, event: FireEvent },
    EventRemoved { group: String, event_id: String },
    Batch { group: String, events: Vec<FireEvent> },
    /// Sent to a subscriber that fell behind; `missed` notifications were lost.
    Resync { missed: u64 },
}

impl Notification {
    pub fn group(&self) -> Option<&str> {
        match self {
            Notification::EventAdded { group, .. }
            | Notification::EventUpdated { group, .. }
            | Notification::EventRemoved { group, .. }
            | Notification::Batch { group, .. } => Some(group),
            Notification::Resync { .. } => None,
        }
    }
}

/// Group names are case-insensitive.
pub fn group_key(name: &str) -> String {
    name.trim().to_lowercase()
}

#[derive(Clone)]
pub struct RealtimeFanout {
    groups: Arc<RwLock<HashMap<String, broadcast::Sender<Notification>>>>,
    global: broadcast::Sender<Notification>,
    capacity: usize,
}

impl RealtimeFanout {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (global, _) = broadcast::channel(capacity);
        Self {
            groups: Arc::new(RwLock::new(HashMap::new())),
            global,
            capacity,
        }
    }

    fn sender(&self, group: &str) -> broadcast::Sender<Notification> {
        let key = group_key(group);
        {
            let guard = self.groups.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(tx) = guard.get(&key) {
                return tx.clone();
            }
        }
        let mut guard = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        guard
            .entry(key)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn subscribe(&self, group: &str) -> Subscription {
        Subscription {
            rx: self.sender(group).subscribe(),
        }
    }

    pub fn subscribe_global(&self) -> Subscription {
        Subscription {
            rx: self.global.subscribe(),
        }
    }

    /// Deliver to the notification's group (if anyone listens) and the global channel.
    pub fn publish(&self, notification: Notification) {
        if let Some(group) = notification.group() {
            let tx = {
                let guard = self.groups.read().unwrap_or_else(PoisonError::into_inner);
                guard.get(&group_key(group)).cloned()
            };
            if let Some(tx) = tx {
                // no receivers is fine
                let _ = tx.send(notification.clone());
            }
        }
        let _ = self.global.send(notification);
        counter!("realtime_notifications_total").increment(1);
    }

    pub fn publish_batch(&self, group: &str, events: Vec<FireEvent>) {
        if events.is_empty() {
            return;
        }
        self.publish(Notification::Batch {
            group: group_key(group),
            events,
        });
    }
}

impl Default for RealtimeFanout {
    fn default() -> Self {
        Self::new(DEFAULT_REALTIME_CAPACITY)
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<Notification>,
}

impl Subscription {
    /// `None` once the fan-out is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        match self.rx.recv().await {
            Ok(n) => Some(n),
            Err(RecvError::Lagged(missed)) => {
                counter!("realtime_lagged_total").increment(1);
                Some(Notification::Resync { missed })
            }
            Err(RecvError::Closed) => None,
        }
    }
}
