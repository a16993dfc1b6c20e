//! Session transport: the network session between one document handle and the
//! sync server.
//!
//! `open` spawns a driver task that connects through a `SyncProvider`, runs the
//! initial version exchange, relays CRDT updates and presence, and reconnects
//! with exponential backoff. State changes are reported to a
//! `TransportObserver`. Auth rejection is terminal.

mod reconnect;
mod state;

pub use reconnect::{calculate_backoff, ReconnectConfig, ReconnectState};
pub use state::{ConnectionState, TransportSignal};

use crate::document::{DocumentError, SharedDocument};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session_id::SessionId;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `close` waits for the driver to flush and exit before aborting it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("Invalid transition: {signal} while {from}")]
    InvalidTransition {
        from: &'static str,
        signal: &'static str,
    },

    #[error(transparent)]
    Document(#[from] DocumentError),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Opaque bearer credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Parameters of one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub document_id: String,
    pub credential: Credential,
    /// Fresh for every attempt
    pub session: SessionId,
}

/// An established link to the sync server for one document.
#[async_trait]
pub trait ProviderLink: Send + Sync {
    async fn send(&self, message: ClientMessage) -> Result<()>;

    /// Receive the next server message. Must be cancel-safe: the driver polls
    /// it inside `select!`.
    async fn recv(&self) -> Result<ServerMessage>;

    async fn close(&self) -> Result<()>;
}

/// Connects to the sync server.
#[async_trait]
pub trait SyncProvider: Send + Sync {
    /// Establish a link. Returns `TransportError::AuthRejected` if the server
    /// refuses the credential.
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn ProviderLink>>;
}

/// Presence traffic received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemotePresence {
    Upsert { session: SessionId, state: Vec<u8> },
    Remove { session: SessionId },
    Snapshot { entries: Vec<(SessionId, Vec<u8>)> },
}

/// Receives transport events. Called from the driver task with no locks held.
pub trait TransportObserver: Send + Sync {
    fn on_state_change(&self, state: &ConnectionState);

    fn on_remote_presence(&self, _presence: RemotePresence) {}
}

/// Outbound queue of a transport. Messages queued while offline are dropped
/// when the next connection is established.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl Outbound {
    /// Create a queue and its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a message. Returns false if the transport is gone.
    pub fn send(&self, message: ClientMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Handle to a running transport.
pub struct TransportHandle {
    document_id: String,
    state: Arc<RwLock<ConnectionState>>,
    outbound: Outbound,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    local_updates: Mutex<Option<loro::Subscription>>,
}

impl TransportHandle {
    /// Open a transport for `document` and start connecting.
    ///
    /// Returns immediately; progress is reported to `observer`.
    pub fn open(
        document: SharedDocument,
        credential: Credential,
        provider: Arc<dyn SyncProvider>,
        observer: Arc<dyn TransportObserver>,
        config: ReconnectConfig,
    ) -> Result<Self> {
        let document_id = document.document_id().to_string();
        let (outbound, rx) = Outbound::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));

        // Forward local commits only; remote imports don't fire this
        let forward = outbound.clone();
        let local_updates = document.subscribe_local_update(move |update| {
            forward.send(ClientMessage::Update {
                data: update.to_vec(),
            });
        })?;

        let driver = Driver {
            document,
            document_id: document_id.clone(),
            credential,
            provider,
            observer,
            config,
            state: Arc::clone(&state),
            outbound: rx,
            shutdown: shutdown_rx,
        };

        info!("Opening transport for {}", document_id);
        let task = tokio::spawn(driver.run());

        Ok(Self {
            document_id,
            state,
            outbound,
            shutdown: Some(shutdown_tx),
            task: Some(task),
            local_updates: Mutex::new(Some(local_updates)),
        })
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn outbound(&self) -> Outbound {
        self.outbound.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_none()
    }

    /// Stop the transport. Queued messages are flushed to the live link first.
    ///
    /// Idempotent.
    pub async fn close(&mut self) {
        self.local_updates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let Some(task) = self.task.take() else {
            return;
        };
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        let abort = task.abort_handle();
        if tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_err() {
            warn!("Transport for {} did not stop in time, aborting", self.document_id);
            abort.abort();
        }
        info!("Closed transport for {}", self.document_id);
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

enum LinkEnd {
    Shutdown,
    Lost(Option<String>),
    AuthRejected(String),
}

struct Driver {
    document: SharedDocument,
    document_id: String,
    credential: Credential,
    provider: Arc<dyn SyncProvider>,
    observer: Arc<dyn TransportObserver>,
    config: ReconnectConfig,
    state: Arc<RwLock<ConnectionState>>,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    shutdown: oneshot::Receiver<()>,
}

impl Driver {
    async fn run(mut self) {
        let mut reconnect = ReconnectState::new();

        loop {
            let request = ConnectRequest {
                document_id: self.document_id.clone(),
                credential: self.credential.clone(),
                session: SessionId::generate(),
            };
            debug!(
                "Connecting {} as session {}",
                self.document_id, request.session
            );

            let connected = tokio::select! {
                result = self.provider.connect(&request) => result,
                _ = &mut self.shutdown => return,
            };

            match connected {
                Ok(link) => {
                    self.discard_stale_outbound();
                    self.apply(TransportSignal::HandshakeOk(request.session));

                    match self.drive_link(link.as_ref(), &mut reconnect).await {
                        LinkEnd::Shutdown => return,
                        LinkEnd::AuthRejected(reason) => {
                            let _ = link.close().await;
                            self.reject(reason);
                            return;
                        }
                        LinkEnd::Lost(cause) => {
                            let _ = link.close().await;
                            self.apply(TransportSignal::SocketLost(cause));
                        }
                    }
                }
                Err(TransportError::AuthRejected(reason)) => {
                    self.reject(reason);
                    return;
                }
                Err(e) => {
                    self.apply(TransportSignal::SocketLost(Some(e.to_string())));
                }
            }

            let delay = reconnect.record_failure(&self.config);
            if reconnect.exceeded_max_attempts(&self.config) {
                error!(
                    "Giving up on {} after {} attempts",
                    self.document_id, reconnect.attempts
                );
                return;
            }

            info!("Reconnecting {} in {:?}", self.document_id, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut self.shutdown => return,
            }
            self.apply(TransportSignal::Reconnect);
        }
    }

    async fn drive_link(&mut self, link: &dyn ProviderLink, reconnect: &mut ReconnectState) -> LinkEnd {
        let version = match self.document.encoded_version() {
            Ok(version) => version,
            Err(e) => return LinkEnd::Lost(Some(e.to_string())),
        };
        if let Err(e) = link.send(ClientMessage::SyncRequest { version }).await {
            return LinkEnd::Lost(Some(e.to_string()));
        }

        loop {
            tokio::select! {
                _ = &mut self.shutdown => {
                    self.flush_outbound(link).await;
                    let _ = link.close().await;
                    return LinkEnd::Shutdown;
                }
                Some(message) = self.outbound.recv() => {
                    if let Err(e) = link.send(message).await {
                        return LinkEnd::Lost(Some(e.to_string()));
                    }
                }
                incoming = link.recv() => match incoming {
                    Ok(message) => {
                        if let Some(end) = self.handle_message(link, message, reconnect).await {
                            return end;
                        }
                    }
                    Err(TransportError::Closed) => return LinkEnd::Lost(None),
                    Err(TransportError::AuthRejected(reason)) => return LinkEnd::AuthRejected(reason),
                    Err(e) => return LinkEnd::Lost(Some(e.to_string())),
                }
            }
        }
    }

    async fn handle_message(
        &mut self,
        link: &dyn ProviderLink,
        message: ServerMessage,
        reconnect: &mut ReconnectState,
    ) -> Option<LinkEnd> {
        debug!("Received {} for {}", message.kind(), self.document_id);

        match message {
            ServerMessage::SyncReply { update, version } => {
                if let Some(update) = update {
                    if let Err(e) = self.document.apply_remote_update(&update) {
                        return Some(LinkEnd::Lost(Some(e.to_string())));
                    }
                }

                // Push back whatever the server is missing
                match self.document.export_missing(&version) {
                    Ok(Some(data)) => {
                        if let Err(e) = link.send(ClientMessage::Update { data }).await {
                            return Some(LinkEnd::Lost(Some(e.to_string())));
                        }
                    }
                    Ok(None) => {}
                    Err(e) => return Some(LinkEnd::Lost(Some(e.to_string()))),
                }

                if self.apply(TransportSignal::SyncConfirmed) {
                    reconnect.reset();
                }
            }
            ServerMessage::Update { data } => {
                if let Err(e) = self.document.apply_remote_update(&data) {
                    warn!("Failed to import update for {}: {}", self.document_id, e);
                }
            }
            ServerMessage::Presence { session, state } => {
                let presence = match state {
                    Some(state) => RemotePresence::Upsert { session, state },
                    None => RemotePresence::Remove { session },
                };
                self.observer.on_remote_presence(presence);
            }
            ServerMessage::PresenceSnapshot { entries } => {
                self.observer
                    .on_remote_presence(RemotePresence::Snapshot { entries });
            }
            ServerMessage::AuthRejected { reason } => {
                return Some(LinkEnd::AuthRejected(reason));
            }
        }
        None
    }

    /// Drop messages queued while no link was up. The sync exchange re-delivers
    /// content and presence is re-published on Connected.
    fn discard_stale_outbound(&mut self) {
        let mut dropped = 0;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(
                "Discarded {} stale outbound messages for {}",
                dropped, self.document_id
            );
        }
    }

    async fn flush_outbound(&mut self, link: &dyn ProviderLink) {
        while let Ok(message) = self.outbound.try_recv() {
            if let Err(e) = link.send(message).await {
                debug!("Flush on close failed for {}: {}", self.document_id, e);
                break;
            }
        }
    }

    fn reject(&self, reason: String) {
        error!("Credential rejected for {}: {}", self.document_id, reason);
        self.apply(TransportSignal::AuthRejected(reason));
    }

    /// Apply a signal and notify the observer. Returns false if the transition
    /// was illegal.
    fn apply(&self, signal: TransportSignal) -> bool {
        let next = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            match state.transition(signal) {
                Ok(next) => {
                    *state = next.clone();
                    next
                }
                Err(e) => {
                    warn!("Transport for {}: {}", self.document_id, e);
                    return false;
                }
            }
        };

        debug!("Transport for {} is now {}", self.document_id, next.name());
        self.observer.on_state_change(&next);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::LocalEdit;
    use crate::memory::MemoryProvider;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingObserver {
        states: Mutex<Vec<ConnectionState>>,
        presence: Mutex<Vec<RemotePresence>>,
    }

    impl RecordingObserver {
        fn names(&self) -> Vec<&'static str> {
            self.states.lock().unwrap().iter().map(|s| s.name()).collect()
        }
    }

    impl TransportObserver for RecordingObserver {
        fn on_state_change(&self, state: &ConnectionState) {
            self.states.lock().unwrap().push(state.clone());
        }

        fn on_remote_presence(&self, presence: RemotePresence) {
            self.presence.lock().unwrap().push(presence);
        }
    }

    /// Fails the first `failures` connects, then rejects or defers to a relay.
    struct FlakyProvider {
        failures: u32,
        attempts: AtomicU32,
        reject: bool,
        relay: MemoryProvider,
    }

    #[async_trait]
    impl SyncProvider for FlakyProvider {
        async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn ProviderLink>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(TransportError::ConnectionFailed("connection refused".into()));
            }
            if self.reject {
                return Err(TransportError::AuthRejected("token expired".into()));
            }
            self.relay.connect(request).await
        }
    }

    fn fast_reconnect() -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaches_synced_and_exchanges_content() {
        let relay = MemoryProvider::new();
        relay.seed_server("doc-1", "server text");

        let doc = SharedDocument::new("doc-1");
        let observer = Arc::new(RecordingObserver::default());
        let mut handle = TransportHandle::open(
            doc.clone(),
            Credential::new("token"),
            Arc::new(relay.clone()),
            observer.clone(),
            fast_reconnect(),
        )
        .unwrap();

        settle().await;
        assert_eq!(observer.names(), vec!["Connected", "Synced"]);
        assert!(handle.state().is_synced());
        assert_eq!(doc.text().unwrap(), "server text");

        doc.apply_local_edit(&LocalEdit::Insert {
            index: 0,
            text: ">> ".into(),
        })
        .unwrap();
        settle().await;
        assert_eq!(relay.server_text("doc-1").as_deref(), Some(">> server text"));

        handle.close().await;
        assert!(handle.is_closed());
        handle.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff_then_syncs() {
        let provider = Arc::new(FlakyProvider {
            failures: 2,
            attempts: AtomicU32::new(0),
            reject: false,
            relay: MemoryProvider::new(),
        });
        let observer = Arc::new(RecordingObserver::default());
        let mut handle = TransportHandle::open(
            SharedDocument::new("doc-1"),
            Credential::new("token"),
            provider.clone(),
            observer.clone(),
            fast_reconnect(),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            observer.names(),
            vec![
                "Disconnected",
                "Connecting",
                "Disconnected",
                "Connecting",
                "Connected",
                "Synced"
            ]
        );
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 3);
        handle.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_rejection_is_terminal() {
        let provider = Arc::new(FlakyProvider {
            failures: 0,
            attempts: AtomicU32::new(0),
            reject: true,
            relay: MemoryProvider::new(),
        });
        let observer = Arc::new(RecordingObserver::default());
        let handle = TransportHandle::open(
            SharedDocument::new("doc-1"),
            Credential::new("bad"),
            provider.clone(),
            observer.clone(),
            fast_reconnect(),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(observer.names(), vec!["AuthFailed"]);
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 1);
        assert!(handle.state().is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let provider = Arc::new(FlakyProvider {
            failures: u32::MAX,
            attempts: AtomicU32::new(0),
            reject: false,
            relay: MemoryProvider::new(),
        });
        let observer = Arc::new(RecordingObserver::default());
        let handle = TransportHandle::open(
            SharedDocument::new("doc-1"),
            Credential::new("token"),
            provider.clone(),
            observer.clone(),
            ReconnectConfig {
                max_attempts: Some(3),
                ..fast_reconnect()
            },
        )
        .unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 3);
        assert!(matches!(
            handle.state(),
            ConnectionState::Disconnected { cause: Some(_) }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_queued_presence() {
        let relay = MemoryProvider::new();
        let observer = Arc::new(RecordingObserver::default());
        let mut handle = TransportHandle::open(
            SharedDocument::new("doc-1"),
            Credential::new("token"),
            Arc::new(relay.clone()),
            observer.clone(),
            fast_reconnect(),
        )
        .unwrap();
        settle().await;

        let session = handle.state().session().unwrap();
        handle.outbound().send(ClientMessage::Presence {
            session,
            state: Some(br#"{"userId":"u1","name":"Ann"}"#.to_vec()),
        });
        settle().await;
        assert_eq!(relay.presence_count("doc-1"), 1);

        handle.outbound().send(ClientMessage::Presence {
            session,
            state: None,
        });
        handle.close().await;
        assert_eq!(relay.presence_count("doc-1"), 0);
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = Credential::new("secret-token");
        assert!(!format!("{:?}", credential).contains("secret"));
        assert_eq!(credential.token(), "secret-token");
    }
}
