//! Session manager: one open document with its transport, presence, bootstrap
//! and persistence, behind a single open/close lifecycle.
//!
//! Phases:
//! - `Uninitialized`: nothing open
//! - `Opening`: handle created, transport connecting, saved copy loading
//! - `Active`: transport synced, saved copy loaded, bootstrap done
//! - `Closing`: tearing down in order (persistence, subscriptions, presence,
//!   transport, handle)
//!
//! Edits are only accepted once the session is `Active`. The synchronous
//! entry points schedule timers on the runtime the document was opened on, so
//! they may be called from threads outside it.
//!
//! One manager per editing slot; there is no global connection state.

use crate::bootstrap::{BootstrapOutcome, BootstrapReconciler};
use crate::config::{ConfigError, SessionConfig};
use crate::document::{DocumentError, LocalEdit, SharedDocument};
use crate::events::{now_ms, EventBus, NotificationLevel, SessionEvent, Subscription};
use crate::persistence::{DocumentStore, PersistencePipeline, SaveResult, SaveStatus, Snapshot};
use crate::presence::{
    CursorState, PresenceEntry, PresenceField, PresenceRegistry, PresenceSnapshot, PresenceState,
    PresenceSubscription,
};
use crate::transport::{
    ConnectionState, Credential, RemotePresence, SyncProvider, TransportError, TransportHandle,
    TransportObserver,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No document is open")]
    NotOpen,

    #[error("Session is closing")]
    Closing,

    #[error("Document is not synced yet")]
    NotSynced,

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Lifecycle phase of a session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    Uninitialized,
    Opening,
    Active,
    Closing,
}

/// Connection status shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Synced,
    /// Link lost without a reported error; reconnecting
    Offline,
    /// Link lost with an error; reconnecting
    Error { message: String },
    AuthFailed { reason: String },
}

impl From<&ConnectionState> for ConnectionStatus {
    fn from(state: &ConnectionState) -> Self {
        match state {
            ConnectionState::Connecting => ConnectionStatus::Connecting,
            ConnectionState::Connected { .. } => ConnectionStatus::Connected,
            ConnectionState::Synced { .. } => ConnectionStatus::Synced,
            ConnectionState::Disconnected { cause: None } => ConnectionStatus::Offline,
            ConnectionState::Disconnected { cause: Some(cause) } => ConnectionStatus::Error {
                message: cause.clone(),
            },
            ConnectionState::AuthFailed { reason } => ConnectionStatus::AuthFailed {
                reason: reason.clone(),
            },
        }
    }
}

/// Durable identity of the local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: String,
    pub name: String,
    pub avatar: Option<String>,
    /// Overrides the colour derived from the user id
    pub color: Option<String>,
}

impl UserIdentity {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            avatar: None,
            color: None,
        }
    }

    fn presence_state(&self) -> PresenceState {
        let mut state = PresenceState::new(&self.user_id, &self.name);
        state.avatar = self.avatar.clone();
        if let Some(color) = &self.color {
            state.color = color.clone();
        }
        state
    }
}

/// Phase shared between the manager and the observer of its current session.
struct PhaseCell {
    phase: RwLock<SessionPhase>,
    events: Arc<EventBus>,
}

impl PhaseCell {
    fn get(&self) -> SessionPhase {
        *self.phase.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, document_id: &str, phase: SessionPhase) {
        {
            let mut current = self.phase.write().unwrap_or_else(|e| e.into_inner());
            if *current == phase {
                return;
            }
            *current = phase;
        }
        debug!("Session for {} is now {:?}", document_id, phase);
        self.events.emit(SessionEvent::PhaseChanged {
            document_id: document_id.to_string(),
            phase,
            timestamp: now_ms(),
        });
    }

    /// Move Opening to Active; any other phase is left alone.
    fn activate(&self, document_id: &str) {
        let activated = {
            let mut current = self.phase.write().unwrap_or_else(|e| e.into_inner());
            if *current != SessionPhase::Opening {
                false
            } else {
                *current = SessionPhase::Active;
                true
            }
        };
        if activated {
            info!("Session for {} is active", document_id);
            self.events.emit(SessionEvent::PhaseChanged {
                document_id: document_id.to_string(),
                phase: SessionPhase::Active,
                timestamp: now_ms(),
            });
        }
    }
}

/// Saved copy of the document, as far as the session knows it.
enum Persisted {
    Loading,
    Loaded(Option<String>),
}

/// Bootstrap runs once the transport is synced and the saved copy is loaded,
/// whichever comes last.
struct BootstrapGate {
    synced: bool,
    persisted: Persisted,
}

/// Per-open-document state; observes the transport.
struct SessionCore {
    document: SharedDocument,
    presence: Arc<PresenceRegistry>,
    reconciler: BootstrapReconciler,
    gate: Mutex<BootstrapGate>,
    phase: Arc<PhaseCell>,
    events: Arc<EventBus>,
    closing: AtomicBool,
    runtime: Handle,
}

impl SessionCore {
    fn snapshot_loaded(&self, persisted: Option<String>) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        self.gate.lock().unwrap_or_else(|e| e.into_inner()).persisted =
            Persisted::Loaded(persisted);
        self.try_bootstrap();
    }

    fn try_bootstrap(&self) {
        let persisted = {
            let gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
            match &gate.persisted {
                Persisted::Loaded(persisted) if gate.synced => persisted.clone(),
                _ => return,
            }
        };

        let document_id = self.document.document_id();
        match self.reconciler.reconcile(&self.document, persisted.as_deref()) {
            // The caller that actually ran the bootstrap activates
            Ok(BootstrapOutcome::AlreadyReconciled) => return,
            Ok(outcome) => debug!("Bootstrap for {}: {:?}", document_id, outcome),
            Err(e) => warn!("Bootstrap for {} failed: {}", document_id, e),
        }
        self.phase.activate(document_id);
    }
}

impl TransportObserver for SessionCore {
    fn on_state_change(&self, state: &ConnectionState) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        let document_id = self.document.document_id();

        self.events.emit(SessionEvent::ConnectionChanged {
            document_id: document_id.to_string(),
            status: ConnectionStatus::from(state),
            timestamp: now_ms(),
        });

        match state {
            ConnectionState::Connected { session } => {
                self.presence.connected(*session);
            }
            ConnectionState::Synced { .. } => {
                self.gate.lock().unwrap_or_else(|e| e.into_inner()).synced = true;
                self.try_bootstrap();
            }
            ConnectionState::Disconnected { cause: Some(cause) } => {
                self.events.notify(
                    NotificationLevel::Warning,
                    format!("Connection lost: {}", cause),
                );
            }
            ConnectionState::AuthFailed { reason } => {
                self.events.notify(
                    NotificationLevel::Error,
                    format!("Sync server rejected credentials: {}", reason),
                );
            }
            ConnectionState::Connecting | ConnectionState::Disconnected { cause: None } => {}
        }
    }

    fn on_remote_presence(&self, presence: RemotePresence) {
        if !self.closing.load(Ordering::Acquire) {
            self.presence.apply(presence);
        }
    }
}

fn names(entries: Vec<&PresenceEntry>) -> Vec<String> {
    entries.iter().map(|e| e.state.name.clone()).collect()
}

struct ActiveSession {
    document_id: String,
    credential: Credential,
    core: Arc<SessionCore>,
    persistence: Arc<PersistencePipeline>,
    transport: TransportHandle,
    loader: JoinHandle<()>,
    presence_events: Option<PresenceSubscription>,
}

/// Binds one editing surface to one shared document at a time.
pub struct SessionManager {
    provider: Arc<dyn SyncProvider>,
    store: Arc<dyn DocumentStore>,
    config: SessionConfig,
    events: Arc<EventBus>,
    phase: Arc<PhaseCell>,
    current: Mutex<Option<ActiveSession>>,
    // Serializes open/close
    lifecycle: tokio::sync::Mutex<()>,
}

impl SessionManager {
    pub fn new(
        provider: Arc<dyn SyncProvider>,
        store: Arc<dyn DocumentStore>,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let events = Arc::new(EventBus::new());
        Ok(Self {
            provider,
            store,
            config,
            phase: Arc::new(PhaseCell {
                phase: RwLock::new(SessionPhase::Uninitialized),
                events: Arc::clone(&events),
            }),
            events,
            current: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    /// Subscribe to session events. Survives reopening other documents.
    pub fn subscribe(&self, callback: impl Fn(SessionEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(callback)
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase.get()
    }

    pub fn document_id(&self) -> Option<String> {
        self.with_current(|s| s.document_id.clone())
    }

    fn with_current<T>(&self, f: impl FnOnce(&ActiveSession) -> T) -> Option<T> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(f)
    }

    fn core(&self) -> Result<(Arc<SessionCore>, Arc<PersistencePipeline>)> {
        if self.phase() == SessionPhase::Closing {
            return Err(SessionError::Closing);
        }
        self.with_current(|s| (Arc::clone(&s.core), Arc::clone(&s.persistence)))
            .ok_or(SessionError::NotOpen)
    }

    /// Open `document_id`, closing whatever was open before.
    ///
    /// Returns once the transport is started; the saved copy loads in the
    /// background and the session turns `Active` when it and the first sync
    /// are both in. Re-opening the open document with the same credential only
    /// refreshes the local presence identity.
    pub async fn open(
        &self,
        document_id: &str,
        credential: Credential,
        identity: UserIdentity,
    ) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        let unchanged = self.with_current(|s| {
            if s.document_id == document_id && s.credential == credential {
                Some(Arc::clone(&s.core))
            } else {
                None
            }
        });
        if let Some(Some(core)) = unchanged {
            debug!("{} already open", document_id);
            let same_user = core
                .presence
                .local()
                .is_some_and(|local| local.user_id == identity.user_id);
            if same_user {
                core.presence
                    .update_local_field(PresenceField::Name(identity.name.clone()));
                core.presence
                    .update_local_field(PresenceField::Avatar(identity.avatar.clone()));
            } else {
                core.presence.publish_local(identity.presence_state());
            }
            return Ok(());
        }

        self.close_current().await;
        self.phase.set(document_id, SessionPhase::Opening);
        info!("Opening {}", document_id);

        let document = SharedDocument::new(document_id);
        let presence = PresenceRegistry::new();
        presence.publish_local(identity.presence_state());

        let core = Arc::new(SessionCore {
            document: document.clone(),
            presence: Arc::clone(&presence),
            reconciler: BootstrapReconciler::new(),
            gate: Mutex::new(BootstrapGate {
                synced: false,
                persisted: Persisted::Loading,
            }),
            phase: Arc::clone(&self.phase),
            events: Arc::clone(&self.events),
            closing: AtomicBool::new(false),
            runtime: Handle::current(),
        });

        let transport = match TransportHandle::open(
            document.clone(),
            credential.clone(),
            Arc::clone(&self.provider),
            Arc::clone(&core) as Arc<dyn TransportObserver>,
            self.config.reconnect.clone(),
        ) {
            Ok(transport) => transport,
            Err(e) => {
                document.destroy();
                self.phase.set(document_id, SessionPhase::Uninitialized);
                return Err(e.into());
            }
        };
        presence.attach(transport.outbound());

        let loader = {
            let core = Arc::clone(&core);
            let store = Arc::clone(&self.store);
            let id = document_id.to_string();
            tokio::spawn(async move {
                let persisted = match store.load(&id).await {
                    Ok(persisted) => persisted,
                    Err(e) => {
                        warn!("Could not load persisted snapshot for {}: {}", id, e);
                        core.events.notify(
                            NotificationLevel::Warning,
                            format!("Could not load saved copy: {}", e),
                        );
                        None
                    }
                };
                core.snapshot_loaded(persisted);
            })
        };

        let events = Arc::clone(&self.events);
        let id = document_id.to_string();
        let presence_events = presence.subscribe(move |snapshot| {
            events.emit(SessionEvent::PresenceChanged {
                document_id: id.clone(),
                active: names(snapshot.active_users_excluding_self()),
                typing: names(snapshot.typing_users()),
                timestamp: now_ms(),
            });
        });

        let persistence = Arc::new(PersistencePipeline::new(
            document_id,
            Arc::clone(&self.store),
            Arc::clone(&self.events),
            self.config.save_debounce,
        ));

        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(ActiveSession {
            document_id: document_id.to_string(),
            credential,
            core,
            persistence,
            transport,
            loader,
            presence_events: Some(presence_events),
        });
        Ok(())
    }

    /// Close the open document, if any. Idempotent.
    pub async fn close(&self) {
        let _guard = self.lifecycle.lock().await;
        self.close_current().await;
    }

    async fn close_current(&self) {
        let Some(mut session) = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };
        let document_id = session.document_id.clone();
        self.phase.set(&document_id, SessionPhase::Closing);
        session.core.closing.store(true, Ordering::Release);

        session.loader.abort();
        session.persistence.cancel();
        session.presence_events.take();
        session.core.presence.clear_local();
        session.transport.close().await;
        session.core.presence.detach();
        session.core.document.destroy();

        self.phase.set(&document_id, SessionPhase::Uninitialized);
        info!("Closed {}", document_id);
    }

    /// Apply an edit from the editing surface.
    ///
    /// `focused` marks user input in the focused editor; only those edits are
    /// persisted and flip the typing flag. Returns false if nothing changed.
    ///
    /// Fails with `NotSynced` until the session is `Active`. May be called
    /// from any thread; timers run on the runtime that opened the document.
    pub fn edit(&self, edit: LocalEdit, focused: bool) -> Result<bool> {
        let (core, persistence) = self.core()?;
        if self.phase() != SessionPhase::Active {
            return Err(SessionError::NotSynced);
        }
        let _runtime = core.runtime.enter();
        let changed = core.document.apply_local_edit(&edit)?;

        if changed && focused {
            let document = core.document.clone();
            persistence.on_local_edit(move || Snapshot::capture(&document));
            core.presence.mark_typing(self.config.typing_timeout);
        }
        Ok(changed)
    }

    /// Publish the local cursor or selection, as unicode offsets into the text.
    pub fn update_cursor(&self, anchor: usize, head: usize) -> Result<()> {
        let (core, _) = self.core()?;
        let cursor = match (core.document.anchor_at(anchor)?, core.document.anchor_at(head)?) {
            (Some(anchor), Some(head)) => Some(CursorState { anchor, head }),
            _ => None,
        };
        core.presence
            .update_local_field(PresenceField::Cursor(cursor));
        Ok(())
    }

    pub fn clear_cursor(&self) -> Result<()> {
        let (core, _) = self.core()?;
        core.presence.update_local_field(PresenceField::Cursor(None));
        Ok(())
    }

    /// Resolve a presence cursor to current (anchor, head) offsets.
    pub fn resolve_cursor(&self, cursor: &CursorState) -> Result<Option<(usize, usize)>> {
        let (core, _) = self.core()?;
        let anchor = core.document.resolve_anchor(&cursor.anchor)?;
        let head = core.document.resolve_anchor(&cursor.head)?;
        Ok(anchor.zip(head))
    }

    /// Write pending edits now instead of waiting for the debounce window.
    pub async fn save_now(&self) -> Result<SaveResult> {
        let (_, persistence) = self.core()?;
        Ok(persistence.flush().await)
    }

    /// Re-dispatch the last failed save.
    pub async fn retry_save(&self) -> Result<SaveResult> {
        let (_, persistence) = self.core()?;
        Ok(persistence.retry().await)
    }

    pub fn text(&self) -> Result<String> {
        let (core, _) = self.core()?;
        Ok(core.document.text()?)
    }

    /// Status of the transport; `Offline` when nothing is open.
    pub fn connection_status(&self) -> ConnectionStatus {
        self.with_current(|s| ConnectionStatus::from(&s.transport.state()))
            .unwrap_or(ConnectionStatus::Offline)
    }

    /// Save status; `Saved` when nothing is open.
    pub fn save_status(&self) -> SaveStatus {
        self.with_current(|s| s.persistence.status())
            .unwrap_or(SaveStatus::Saved)
    }

    pub fn presence_snapshot(&self) -> PresenceSnapshot {
        self.with_current(|s| s.core.presence.snapshot())
            .unwrap_or_default()
    }

    /// Subscribe to presence snapshots of the open document. Fires immediately.
    ///
    /// The subscription ends when the document is closed.
    pub fn subscribe_presence(
        &self,
        callback: impl Fn(&PresenceSnapshot) + Send + Sync + 'static,
    ) -> Result<PresenceSubscription> {
        let (core, _) = self.core()?;
        Ok(core.presence.subscribe(callback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;
    use crate::persistence::{InMemoryStore, StoreError};
    use crate::transport::ReconnectConfig;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Store whose loads never complete.
    struct StalledStore;

    #[async_trait]
    impl DocumentStore for StalledStore {
        async fn load(&self, _document_id: &str) -> std::result::Result<Option<String>, StoreError> {
            std::future::pending().await
        }

        async fn save(
            &self,
            _document_id: &str,
            _snapshot: &Snapshot,
        ) -> std::result::Result<(), StoreError> {
            Ok(())
        }
    }

    /// Store that answers loads after a delay.
    struct SlowStore {
        delay: Duration,
        inner: InMemoryStore,
    }

    #[async_trait]
    impl DocumentStore for SlowStore {
        async fn load(&self, document_id: &str) -> std::result::Result<Option<String>, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.load(document_id).await
        }

        async fn save(
            &self,
            document_id: &str,
            snapshot: &Snapshot,
        ) -> std::result::Result<(), StoreError> {
            self.inner.save(document_id, snapshot).await
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                backoff_factor: 2.0,
                max_attempts: None,
            },
            ..Default::default()
        }
    }

    fn manager(relay: &MemoryProvider, store: &Arc<InMemoryStore>) -> SessionManager {
        SessionManager::new(
            Arc::new(relay.clone()),
            Arc::clone(store) as Arc<dyn DocumentStore>,
            config(),
        )
        .unwrap()
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn append(manager: &SessionManager, text: &str) {
        let index = manager.text().unwrap().chars().count();
        manager
            .edit(
                LocalEdit::Insert {
                    index,
                    text: text.into(),
                },
                true,
            )
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_seeds_from_store_and_activates() {
        let relay = MemoryProvider::new();
        let store = Arc::new(InMemoryStore::new().with_document("doc-1", r#"{"text":"Hello"}"#));
        let manager = manager(&relay, &store);

        let phases = Arc::new(Mutex::new(Vec::new()));
        let phases_clone = Arc::clone(&phases);
        let _sub = manager.subscribe(move |event| {
            if let SessionEvent::PhaseChanged { phase, .. } = event {
                phases_clone.lock().unwrap().push(phase);
            }
        });

        manager
            .open("doc-1", Credential::new("t"), UserIdentity::new("u1", "Ann"))
            .await
            .unwrap();
        settle().await;

        assert_eq!(manager.phase(), SessionPhase::Active);
        assert_eq!(manager.connection_status(), ConnectionStatus::Synced);
        assert_eq!(manager.text().unwrap(), "Hello");
        assert_eq!(relay.server_text("doc-1").as_deref(), Some("Hello"));
        assert_eq!(
            *phases.lock().unwrap(),
            vec![SessionPhase::Opening, SessionPhase::Active]
        );
        // Bootstrap seeding is not a user edit
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edits_coalesce_into_one_write() {
        let relay = MemoryProvider::new();
        let store = Arc::new(InMemoryStore::new());
        let manager = manager(&relay, &store);
        manager
            .open("doc-1", Credential::new("t"), UserIdentity::new("u1", "Ann"))
            .await
            .unwrap();
        settle().await;

        append(&manager, "a");
        tokio::time::sleep(Duration::from_millis(100)).await;
        append(&manager, "b");
        tokio::time::sleep(Duration::from_millis(600)).await;

        let saves = store.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].1.text, "ab");
        assert_eq!(manager.save_status(), SaveStatus::Saved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_merge_never_saves() {
        let relay = MemoryProvider::new();
        let store = Arc::new(InMemoryStore::new());
        let writer = manager(&relay, &store);
        let reader = manager(&relay, &store);
        for (manager, user) in [(&writer, "u1"), (&reader, "u2")] {
            manager
                .open("doc-1", Credential::new("t"), UserIdentity::new(user, user))
                .await
                .unwrap();
        }
        settle().await;

        writer
            .edit(
                LocalEdit::Insert {
                    index: 0,
                    text: "typed elsewhere".into(),
                },
                false,
            )
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(reader.text().unwrap(), "typed elsewhere");
        assert_eq!(store.save_count(), 0);
        assert_eq!(reader.save_status(), SaveStatus::Saved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_bootstrap_yields_single_copy() {
        let relay = MemoryProvider::new();
        let store = Arc::new(InMemoryStore::new().with_document("doc-1", r#"{"text":"Hello"}"#));
        let managers: Vec<_> = (0..3).map(|_| manager(&relay, &store)).collect();

        // Open all before any of them gets to run its transport
        for (i, manager) in managers.iter().enumerate() {
            manager
                .open(
                    "doc-1",
                    Credential::new("t"),
                    UserIdentity::new(format!("u{}", i), "User"),
                )
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        for manager in &managers {
            assert_eq!(manager.text().unwrap(), "Hello");
        }
        assert_eq!(relay.server_text("doc-1").as_deref(), Some("Hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_with_cause_keeps_presence_and_save_state() {
        let relay = MemoryProvider::new();
        let store = Arc::new(InMemoryStore::new());
        let ann = manager(&relay, &store);
        let bob = manager(&relay, &store);
        ann.open("doc-1", Credential::new("t"), UserIdentity::new("u1", "Ann"))
            .await
            .unwrap();
        bob.open("doc-1", Credential::new("t"), UserIdentity::new("u2", "Bob"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(ann.presence_snapshot().active_users_excluding_self().len(), 1);

        let notes = Arc::new(Mutex::new(Vec::new()));
        let notes_clone = Arc::clone(&notes);
        let _sub = ann.subscribe(move |event| {
            if let SessionEvent::Notification { message, .. } = event {
                notes_clone.lock().unwrap().push(message);
            }
        });

        relay.sever("doc-1", Some("connection reset"));
        settle().await;

        assert_eq!(
            ann.connection_status(),
            ConnectionStatus::Error {
                message: "Receive failed: connection reset".into()
            }
        );
        assert_eq!(ann.save_status(), SaveStatus::Saved);
        assert_eq!(ann.presence_snapshot().active_users_excluding_self().len(), 1);
        assert_eq!(notes.lock().unwrap().len(), 1);
        assert_eq!(ann.phase(), SessionPhase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_duplicate_presence_across_reconnects() {
        let relay = MemoryProvider::new();
        let store = Arc::new(InMemoryStore::new());
        let ann = manager(&relay, &store);
        let bob = manager(&relay, &store);
        ann.open("doc-1", Credential::new("t"), UserIdentity::new("u1", "Ann"))
            .await
            .unwrap();
        bob.open("doc-1", Credential::new("t"), UserIdentity::new("u2", "Bob"))
            .await
            .unwrap();
        settle().await;

        for _ in 0..3 {
            relay.sever("doc-1", None);
            tokio::time::sleep(Duration::from_secs(2)).await;
        }

        assert_eq!(ann.connection_status(), ConnectionStatus::Synced);
        assert_eq!(relay.presence_count("doc-1"), 2);
        for manager in [&ann, &bob] {
            let snapshot = manager.presence_snapshot();
            assert_eq!(snapshot.len(), 2);
            assert_eq!(snapshot.active_users_excluding_self().len(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_flag_resets_after_inactivity() {
        let relay = MemoryProvider::new();
        let store = Arc::new(InMemoryStore::new());
        let ann = manager(&relay, &store);
        let bob = manager(&relay, &store);
        ann.open("doc-1", Credential::new("t"), UserIdentity::new("u1", "Ann"))
            .await
            .unwrap();
        bob.open("doc-1", Credential::new("t"), UserIdentity::new("u2", "Bob"))
            .await
            .unwrap();
        settle().await;

        append(&ann, "x");
        settle().await;
        assert_eq!(bob.presence_snapshot().typing_users().len(), 1);

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(bob.presence_snapshot().typing_users().is_empty());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(bob.presence_snapshot().typing_users().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_complete() {
        let relay = MemoryProvider::new();
        let store = Arc::new(InMemoryStore::new());
        let ann = manager(&relay, &store);
        let bob = manager(&relay, &store);
        ann.open("doc-1", Credential::new("t"), UserIdentity::new("u1", "Ann"))
            .await
            .unwrap();
        bob.open("doc-1", Credential::new("t"), UserIdentity::new("u2", "Bob"))
            .await
            .unwrap();
        settle().await;

        // Edit right before closing leaves a debounced save pending
        append(&ann, "unsaved");
        ann.close().await;
        settle().await;

        assert_eq!(ann.phase(), SessionPhase::Uninitialized);
        assert!(matches!(ann.text(), Err(SessionError::NotOpen)));
        assert!(matches!(
            ann.edit(LocalEdit::Replace { text: "x".into() }, true),
            Err(SessionError::NotOpen)
        ));
        assert!(bob.presence_snapshot().active_users_excluding_self().is_empty());
        assert_eq!(relay.link_count("doc-1"), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.save_count(), 0);

        ann.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reopen_same_document_is_noop_other_document_switches() {
        let relay = MemoryProvider::new();
        let store = Arc::new(InMemoryStore::new());
        let manager = manager(&relay, &store);

        manager
            .open("doc-1", Credential::new("t"), UserIdentity::new("u1", "Ann"))
            .await
            .unwrap();
        settle().await;
        manager
            .open("doc-1", Credential::new("t"), UserIdentity::new("u1", "Ann"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(relay.connect_count(), 1);

        manager
            .open("doc-2", Credential::new("t"), UserIdentity::new("u1", "Ann"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(manager.document_id().as_deref(), Some("doc-2"));
        assert_eq!(relay.link_count("doc-1"), 0);
        assert_eq!(relay.link_count("doc-2"), 1);
        assert_eq!(manager.phase(), SessionPhase::Active);

        // New credential on the same document also reconnects
        manager
            .open("doc-2", Credential::new("t2"), UserIdentity::new("u1", "Ann"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(relay.connect_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_is_surfaced() {
        let relay = MemoryProvider::new();
        relay.reject_token("expired");
        let store = Arc::new(InMemoryStore::new());
        let manager = manager(&relay, &store);

        manager
            .open(
                "doc-1",
                Credential::new("expired"),
                UserIdentity::new("u1", "Ann"),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(matches!(
            manager.connection_status(),
            ConnectionStatus::AuthFailed { .. }
        ));
        assert_eq!(manager.phase(), SessionPhase::Opening);
        assert_eq!(relay.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_failure_then_retry() {
        let relay = MemoryProvider::new();
        let store = Arc::new(InMemoryStore::new());
        let manager = manager(&relay, &store);
        manager
            .open("doc-1", Credential::new("t"), UserIdentity::new("u1", "Ann"))
            .await
            .unwrap();
        settle().await;

        store.set_failing(true);
        append(&manager, "draft");
        assert!(matches!(
            manager.save_now().await.unwrap(),
            SaveResult::Failed(_)
        ));
        assert!(matches!(manager.save_status(), SaveStatus::Error { .. }));
        assert_eq!(manager.text().unwrap(), "draft");

        store.set_failing(false);
        assert_eq!(manager.retry_save().await.unwrap(), SaveResult::Saved);
        assert_eq!(store.saves()[0].1.text, "draft");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_round_trips_through_presence() {
        let relay = MemoryProvider::new();
        let store = Arc::new(InMemoryStore::new());
        let ann = manager(&relay, &store);
        let bob = manager(&relay, &store);
        ann.open("doc-1", Credential::new("t"), UserIdentity::new("u1", "Ann"))
            .await
            .unwrap();
        bob.open("doc-1", Credential::new("t"), UserIdentity::new("u2", "Bob"))
            .await
            .unwrap();
        settle().await;

        append(&ann, "hello world");
        settle().await;
        ann.update_cursor(6, 10).unwrap();
        settle().await;

        let snapshot = bob.presence_snapshot();
        let others = snapshot.active_users_excluding_self();
        let cursor = others[0].state.cursor.clone().unwrap();
        assert_eq!(bob.resolve_cursor(&cursor).unwrap(), Some((6, 10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_edits_rejected_until_synced() {
        let relay = MemoryProvider::new();
        relay.set_offline(true);
        let store = Arc::new(InMemoryStore::new().with_document("doc-1", r#"{"text":"Hello"}"#));
        let manager = manager(&relay, &store);
        manager
            .open("doc-1", Credential::new("t"), UserIdentity::new("u1", "Ann"))
            .await
            .unwrap();
        settle().await;

        let early = manager.edit(
            LocalEdit::Insert {
                index: 0,
                text: "x".into(),
            },
            true,
        );
        assert!(matches!(early, Err(SessionError::NotSynced)));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.phase(), SessionPhase::Opening);
        assert_eq!(store.save_count(), 0);

        relay.set_offline(false);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(manager.phase(), SessionPhase::Active);
        assert_eq!(manager.text().unwrap(), "Hello");
        assert_eq!(store.save_count(), 0);

        append(&manager, "!");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.saves()[0].1.text, "Hello!");
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_does_not_wait_for_snapshot_load() {
        let relay = MemoryProvider::new();
        let manager = SessionManager::new(Arc::new(relay.clone()), Arc::new(StalledStore), config())
            .unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            manager.open("doc-1", Credential::new("t"), UserIdentity::new("u1", "Ann")),
        )
        .await
        .expect("open returned")
        .unwrap();
        settle().await;

        // Transport runs while the saved copy is still loading
        assert_eq!(relay.connect_count(), 1);
        assert_eq!(manager.connection_status(), ConnectionStatus::Synced);
        assert_eq!(manager.phase(), SessionPhase::Opening);

        tokio::time::timeout(Duration::from_secs(60), manager.close())
            .await
            .expect("close returned");
        settle().await;
        assert_eq!(manager.phase(), SessionPhase::Uninitialized);
        assert_eq!(relay.link_count("doc-1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_loaded_after_sync_still_seeds() {
        let relay = MemoryProvider::new();
        let store = SlowStore {
            delay: Duration::from_secs(2),
            inner: InMemoryStore::new().with_document("doc-1", r#"{"text":"Hello"}"#),
        };
        let manager = SessionManager::new(Arc::new(relay.clone()), Arc::new(store), config())
            .unwrap();
        manager
            .open("doc-1", Credential::new("t"), UserIdentity::new("u1", "Ann"))
            .await
            .unwrap();
        settle().await;
        assert_eq!(manager.connection_status(), ConnectionStatus::Synced);
        assert_eq!(manager.phase(), SessionPhase::Opening);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(manager.phase(), SessionPhase::Active);
        assert_eq!(manager.text().unwrap(), "Hello");
        assert_eq!(relay.server_text("doc-1").as_deref(), Some("Hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_from_thread_outside_runtime() {
        let relay = MemoryProvider::new();
        let store = Arc::new(InMemoryStore::new());
        let manager = manager(&relay, &store);
        manager
            .open("doc-1", Credential::new("t"), UserIdentity::new("u1", "Ann"))
            .await
            .unwrap();
        settle().await;

        std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    assert!(Handle::try_current().is_err());
                    append(&manager, "from a plain thread");
                })
                .join()
                .unwrap();
        });
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(store.saves()[0].1.text, "from a plain thread");
        let snapshot = manager.presence_snapshot();
        assert!(snapshot.entries.iter().any(|e| e.is_local && e.state.typing));
    }
}
