//! Event infrastructure for collab-core.
//!
//! Provides `SessionEvent` for the editing surface and `EventBus` for subscriptions.
//! Wrap the bus in `Arc` and hold the returned `Subscription` to keep listening.

use crate::persistence::SaveStatus;
use crate::session::{ConnectionStatus, SessionPhase};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Severity of a user-visible notification.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// Events emitted by a session for the editing surface.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// Session lifecycle phase changed.
    PhaseChanged {
        #[serde(rename = "documentId")]
        document_id: String,
        phase: SessionPhase,
        timestamp: f64,
    },
    /// Connection status shown to the user changed.
    ConnectionChanged {
        #[serde(rename = "documentId")]
        document_id: String,
        status: ConnectionStatus,
        timestamp: f64,
    },
    /// Save status changed.
    SaveStatusChanged {
        #[serde(rename = "documentId")]
        document_id: String,
        status: SaveStatus,
        timestamp: f64,
    },
    /// Other participants changed.
    PresenceChanged {
        #[serde(rename = "documentId")]
        document_id: String,
        /// Display names of other users, one per user
        active: Vec<String>,
        /// Display names of other users currently typing
        typing: Vec<String>,
        timestamp: f64,
    },
    /// Something the user should be told about (disconnect cause, auth failure, failed save).
    Notification {
        level: NotificationLevel,
        message: String,
        timestamp: f64,
    },
}

/// Milliseconds since Unix epoch, for event timestamps.
pub fn now_ms() -> f64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0)
}

/// Subscription handle that unsubscribes automatically when dropped.
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

/// Event bus for publishing session events to subscribers.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Arc<dyn Fn(SessionEvent) + Send + Sync>)>>,
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
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SessionEvent) + Send + Sync + 'static,
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

    // emit releases the lock before running callbacks, so a blocking write is safe
    fn unsubscribe(&self, id: usize) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SessionEvent) {
        // Clone the callback list so a callback may subscribe without deadlocking
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

    /// Emit a notification with the current timestamp.
    pub fn notify(&self, level: NotificationLevel, message: impl Into<String>) {
        self.emit(SessionEvent::Notification {
            level,
            message: message.into(),
            timestamp: now_ms(),
        });
    }
}
