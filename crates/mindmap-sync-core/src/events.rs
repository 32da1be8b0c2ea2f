//! Event infrastructure for observing sync cycles.
//!
//! Delivery is best effort: listeners may miss events and nothing in the
//! engine depends on anyone receiving them.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// A sync cycle began.
    Started {
        /// Milliseconds since Unix epoch.
        timestamp: u64,
    },
    /// A sync cycle finished; counts mirror `SyncReport`.
    Completed {
        pushed: usize,
        failed: usize,
        pulled: usize,
        removed: usize,
        timestamp: u64,
    },
    /// A sync cycle aborted.
    Error { message: String, timestamp: u64 },
    /// An operation was parked or rejected.
    OperationFailed {
        #[serde(rename = "operationId")]
        operation_id: String,
        kind: String,
        #[serde(rename = "documentId")]
        document_id: String,
        #[serde(rename = "nodeId")]
        node_id: Option<String>,
        error: String,
    },
    /// Pushes are suspended until the remote's Retry-After elapses.
    RateLimited {
        #[serde(rename = "retryAfterMs")]
        retry_after_ms: u64,
    },
    /// A remote copy replaced the local document.
    DocumentPulled {
        #[serde(rename = "documentId")]
        document_id: String,
    },
    /// A newer remote copy was not applied because a node is being edited.
    PullDeferred {
        #[serde(rename = "documentId")]
        document_id: String,
    },
    /// A document deleted remotely was removed locally.
    DocumentRemoved {
        #[serde(rename = "documentId")]
        document_id: String,
    },
}

type Listener = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Fan-out of `SyncEvent`s to registered listeners.
///
/// Listeners run synchronously on the emitting task, so they should hand
/// work off rather than block.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<BTreeMap<u64, Listener>>,
    next_key: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. It stays registered until the returned
    /// `Subscription` is dropped.
    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Arc::new(listener));
        Subscription {
            bus: Arc::downgrade(self),
            key,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Deliver `event` to every listener registered at the time of the call.
    pub fn emit(&self, event: SyncEvent) {
        // The lock is released before any listener runs.
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(event.clone());
        }
    }

    fn remove(&self, key: u64) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
    }
}

/// Keeps a listener registered; dropping it removes the listener.
#[must_use = "the listener is removed as soon as the subscription is dropped"]
pub struct Subscription {
    bus: Weak<EventBus>,
    key: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.key);
        }
    }
}
