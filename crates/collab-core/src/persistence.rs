//! Persistence pipeline: debounced snapshot writes to the durable store.
//!
//! Only local, focused edits feed the pipeline. Bursts of edits inside the
//! debounce window collapse into one write carrying the snapshot taken at
//! flush time. Failures flip the save status to `Error` and are reported; the
//! CRDT state is never rolled back.

use crate::document::SharedDocument;
use crate::events::{now_ms, EventBus, NotificationLevel, SessionEvent};
use crate::timer::Debouncer;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store request failed: {0}")]
    Request(String),

    #[error("Store rejected snapshot for {document_id}: HTTP {status}")]
    Rejected { document_id: String, status: u16 },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Durable form of a document, as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub text: String,
}

impl Snapshot {
    /// Capture the current text of a document. None if the handle is destroyed.
    pub fn capture(document: &SharedDocument) -> Option<Self> {
        document.text().ok().map(|text| Self { text })
    }

    /// Parse the raw persisted form.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Snapshot serialization should not fail")
    }
}

/// Durable store collaborator.
///
/// `load` returns the raw persisted form so a malformed payload reaches the
/// bootstrap reconciler instead of failing the open.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load(&self, document_id: &str) -> Result<Option<String>, StoreError>;

    async fn save(&self, document_id: &str, snapshot: &Snapshot) -> Result<(), StoreError>;
}

/// Save status shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SaveStatus {
    /// Idle; everything handed to the pipeline has been written.
    Saved,
    Saving,
    Error { message: String },
}

/// Outcome of one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveResult {
    Saved,
    NothingToSave,
    Cancelled,
    Failed(String),
}

type SnapshotSource = Box<dyn Fn() -> Option<Snapshot> + Send + Sync>;

struct PipelineInner {
    document_id: String,
    store: Arc<dyn DocumentStore>,
    events: Arc<EventBus>,
    status: Mutex<SaveStatus>,
    pending: Mutex<Option<SnapshotSource>>,
    last_failed: Mutex<Option<Snapshot>>,
    cancelled: AtomicBool,
    // Serializes writes so an older snapshot never lands after a newer one
    flush_lock: tokio::sync::Mutex<()>,
}

impl PipelineInner {
    fn set_status(&self, status: SaveStatus) {
        {
            let mut current = self.status.lock().unwrap_or_else(|e| e.into_inner());
            if *current == status {
                return;
            }
            *current = status.clone();
        }
        self.events.emit(SessionEvent::SaveStatusChanged {
            document_id: self.document_id.clone(),
            status,
            timestamp: now_ms(),
        });
    }

    fn take_pending(&self) -> Option<SnapshotSource> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    async fn flush(&self) -> SaveResult {
        let _guard = self.flush_lock.lock().await;
        if self.cancelled.load(Ordering::Acquire) {
            return SaveResult::Cancelled;
        }

        let Some(source) = self.take_pending() else {
            return SaveResult::NothingToSave;
        };
        let Some(snapshot) = source() else {
            debug!("No snapshot available for {}, skipping save", self.document_id);
            return SaveResult::NothingToSave;
        };

        self.write(snapshot).await
    }

    async fn retry(&self) -> SaveResult {
        let _guard = self.flush_lock.lock().await;
        if self.cancelled.load(Ordering::Acquire) {
            return SaveResult::Cancelled;
        }

        // A newer pending edit supersedes the failed snapshot
        let snapshot = match self.take_pending().and_then(|source| source()) {
            Some(snapshot) => snapshot,
            None => match self
                .last_failed
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
            {
                Some(snapshot) => snapshot,
                None => return SaveResult::NothingToSave,
            },
        };

        self.write(snapshot).await
    }

    async fn write(&self, snapshot: Snapshot) -> SaveResult {
        self.set_status(SaveStatus::Saving);
        debug!(
            "Saving {} ({} chars)",
            self.document_id,
            snapshot.text.chars().count()
        );

        let result = self.store.save(&self.document_id, &snapshot).await;
        if self.cancelled.load(Ordering::Acquire) {
            return SaveResult::Cancelled;
        }

        match result {
            Ok(()) => {
                *self.last_failed.lock().unwrap_or_else(|e| e.into_inner()) = None;
                self.set_status(SaveStatus::Saved);
                info!("Saved {}", self.document_id);
                SaveResult::Saved
            }
            Err(e) => {
                let message = e.to_string();
                warn!("Failed to save {}: {}", self.document_id, message);
                *self.last_failed.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
                self.set_status(SaveStatus::Error {
                    message: message.clone(),
                });
                self.events.notify(
                    NotificationLevel::Error,
                    format!("Could not save document: {}", message),
                );
                SaveResult::Failed(message)
            }
        }
    }
}

/// Debounced writer from local edits to the durable store.
pub struct PersistencePipeline {
    inner: Arc<PipelineInner>,
    debounce: Duration,
    debouncer: Debouncer,
}

impl PersistencePipeline {
    pub fn new(
        document_id: &str,
        store: Arc<dyn DocumentStore>,
        events: Arc<EventBus>,
        debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                document_id: document_id.to_string(),
                store,
                events,
                status: Mutex::new(SaveStatus::Saved),
                pending: Mutex::new(None),
                last_failed: Mutex::new(None),
                cancelled: AtomicBool::new(false),
                flush_lock: tokio::sync::Mutex::new(()),
            }),
            debounce,
            debouncer: Debouncer::new(),
        }
    }

    pub fn status(&self) -> SaveStatus {
        self.inner
            .status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether a debounced flush is waiting to fire.
    pub fn has_pending(&self) -> bool {
        self.debouncer.is_pending()
    }

    /// Record a local, focused edit. Must only be called for user input,
    /// never for remote merges.
    ///
    /// The getter is evaluated at flush time, so the write carries the latest state.
    pub fn on_local_edit(&self, get_snapshot: impl Fn() -> Option<Snapshot> + Send + Sync + 'static) {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return;
        }
        *self.inner.pending.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(Box::new(get_snapshot));

        let inner = Arc::clone(&self.inner);
        self.debouncer.schedule(self.debounce, async move {
            inner.flush().await;
        });
    }

    /// Write the pending snapshot now, skipping the rest of the debounce window.
    pub async fn flush(&self) -> SaveResult {
        self.debouncer.cancel_pending();
        self.inner.flush().await
    }

    /// Re-dispatch the last failed snapshot (or a newer pending one).
    pub async fn retry(&self) -> SaveResult {
        self.debouncer.cancel_pending();
        self.inner.retry().await
    }

    /// Cancel pending and in-flight flushes; no write is dispatched afterwards.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        if self.debouncer.cancel() {
            debug!("Cancelled pending save for {}", self.inner.document_id);
        }
        self.inner.take_pending();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

/// In-memory durable store for tests and offline demos.
#[derive(Default)]
pub struct InMemoryStore {
    documents: RwLock<HashMap<String, String>>,
    saves: RwLock<Vec<(String, Snapshot)>>,
    failing: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate the raw persisted form of a document.
    pub fn with_document(self, document_id: &str, raw: &str) -> Self {
        self.documents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(document_id.to_string(), raw.to_string());
        self
    }

    /// Make every subsequent save fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every successful save, in order.
    pub fn saves(&self) -> Vec<(String, Snapshot)> {
        self.saves.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn load(&self, document_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .documents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(document_id)
            .cloned())
    }

    async fn save(&self, document_id: &str, snapshot: &Snapshot) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Request("store unavailable".into()));
        }
        self.documents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(document_id.to_string(), snapshot.to_json());
        self.saves
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((document_id.to_string(), snapshot.clone()));
        Ok(())
    }
}
