//! Event infrastructure for sync status.
//!
//! Provides `SyncEvent` for UI status badges and `EventBus` for
//! subscriptions. The orchestrator, presence tracker, and photo
//! synchronizer emit; the UI subscribes instead of polling, so there is
//! no hidden timing dependency between sync progress and display.

use crate::assets::AssetStatus;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Per-entity sync phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    Idle,
    Syncing,
    Success,
    Error,
}

/// Sync events emitted during operation for real-time monitoring.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// An entity's sync state machine transitioned.
    SyncStateChanged {
        #[serde(rename = "entityId")]
        entity_id: String,
        state: SyncState,
        /// When the transition happened, in milliseconds since Unix epoch.
        timestamp: u64,
    },
    /// A document changed (local mutation or merged remote delta).
    DocumentUpdated {
        #[serde(rename = "entityId")]
        entity_id: String,
        timestamp: u64,
    },
    /// The server acknowledged a queued operation.
    OperationAcknowledged {
        #[serde(rename = "entityId")]
        entity_id: String,
        #[serde(rename = "operationId")]
        operation_id: String,
        timestamp: u64,
    },
    /// A queued operation exhausted its retries and needs attention.
    OperationDeadLettered {
        #[serde(rename = "entityId")]
        entity_id: String,
        #[serde(rename = "operationId")]
        operation_id: String,
        timestamp: u64,
    },
    /// The set of active users on a document changed.
    PresenceChanged {
        #[serde(rename = "documentId")]
        document_id: String,
        timestamp: u64,
    },
    /// An asset's transfer state changed.
    AssetStatusChanged {
        #[serde(rename = "assetId")]
        asset_id: String,
        #[serde(rename = "entityId")]
        entity_id: String,
        status: AssetStatus,
        timestamp: u64,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving
/// events, drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing sync events to subscribers.
///
/// Thread-safe for use in a multi-threaded Tokio runtime.
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Arc<dyn Fn(SyncEvent) + Send + Sync>)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // Use try_write to avoid deadlock if Drop runs during panic unwinding
        // while a read lock is held (e.g., during emit).
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SyncEvent) {
        // Clone the callback list to prevent deadlock if a callback calls subscribe.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}
