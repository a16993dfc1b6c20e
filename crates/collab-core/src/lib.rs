//! collab-core: synchronization core for real-time collaborative document editing.
//!
//! This crate provides the core functionality for:
//! - Binding an editing surface to a shared Loro document
//! - Session transport with reconnection and auth failure handling
//! - Presence (cursors, identity, typing state) for everyone in a document
//! - One-time seeding of empty shared documents from persisted snapshots
//! - Debounced persistence of local edits to a durable store
//! - SyncProvider and DocumentStore trait abstractions

pub mod bootstrap;
pub mod config;
pub mod document;
pub mod events;
pub mod memory;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod session_id;
pub mod timer;
pub mod transport;

pub use bootstrap::{BootstrapOutcome, BootstrapReconciler};
pub use config::{ConfigError, SessionConfig};
pub use document::{DocumentError, LocalEdit, SharedDocument};
pub use events::{EventBus, NotificationLevel, SessionEvent, Subscription};
pub use memory::MemoryProvider;
pub use persistence::{
    DocumentStore, InMemoryStore, PersistencePipeline, SaveResult, SaveStatus, Snapshot,
    StoreError,
};
pub use presence::{
    CursorState, PresenceEntry, PresenceField, PresenceRegistry, PresenceSnapshot, PresenceState,
};
pub use protocol::{ClientMessage, ServerMessage};
pub use session::{ConnectionStatus, SessionError, SessionManager, SessionPhase, UserIdentity};
pub use session_id::{SessionId, SessionIdError};
pub use transport::{
    ConnectRequest, ConnectionState, Credential, ProviderLink, ReconnectConfig, SyncProvider,
    TransportError, TransportHandle,
};
