//! Presence registry: ephemeral per-connection state of everyone editing a document.
//!
//! The local entry is owned by this client and broadcast through the transport's
//! outbound queue. Remote entries are stored as the raw payloads received from
//! the server, keyed by session id, and parsed when a snapshot is built; a
//! malformed payload is kept but never shown.

use crate::protocol::ClientMessage;
use crate::session_id::SessionId;
use crate::timer::Debouncer;
use crate::transport::{Outbound, RemotePresence};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Predefined collaborator colours (pastel-ish for readability).
const COLLABORATOR_COLORS: [u32; 8] = [
    0xFF6B6BFF, // Red
    0x4ECDC4FF, // Teal
    0xFFE66DFF, // Yellow
    0x95E1D3FF, // Mint
    0xF38181FF, // Coral
    0xAA96DAFF, // Purple
    0xFCBF49FF, // Orange
    0x2EC4B6FF, // Cyan
];

/// Stable display colour for a user, as a CSS hex string.
pub fn color_for_user(user_id: &str) -> String {
    let hash = user_id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    let rgba = COLLABORATOR_COLORS[hash as usize % COLLABORATOR_COLORS.len()];
    format!("#{:06X}", rgba >> 8)
}

/// Cursor or selection, as relative anchors into the shared text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub anchor: Vec<u8>,
    /// Other end of the selection; equal to `anchor` when collapsed
    pub head: Vec<u8>,
}

/// State published by one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorState>,
}

impl PresenceState {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            color: color_for_user(&user_id),
            user_id,
            name: name.into(),
            avatar: None,
            typing: false,
            cursor: None,
        }
    }

    /// Parse a payload received from the server. None if malformed.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        serde_json::from_slice(payload).ok()
    }

    fn apply(&mut self, field: PresenceField) {
        match field {
            PresenceField::Name(name) => self.name = name,
            PresenceField::Color(color) => self.color = color,
            PresenceField::Avatar(avatar) => self.avatar = avatar,
            PresenceField::Typing(typing) => self.typing = typing,
            PresenceField::Cursor(cursor) => self.cursor = cursor,
        }
    }
}

/// A single field of the local entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceField {
    Name(String),
    Color(String),
    Avatar(Option<String>),
    Typing(bool),
    Cursor(Option<CursorState>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub session: Option<SessionId>,
    pub state: PresenceState,
    pub is_local: bool,
}

/// Everyone currently present, local entry first, remote entries by session id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub entries: Vec<PresenceEntry>,
}

impl PresenceSnapshot {
    fn local_user(&self) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.is_local)
            .map(|e| e.state.user_id.as_str())
    }

    /// Other users, one entry per user. Sessions of the local user in other
    /// tabs or devices are excluded too.
    pub fn active_users_excluding_self(&self) -> Vec<&PresenceEntry> {
        let local_user = self.local_user();
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|e| !e.is_local && Some(e.state.user_id.as_str()) != local_user)
            .filter(|e| seen.insert(e.state.user_id.as_str()))
            .collect()
    }

    /// Other users currently typing.
    pub fn typing_users(&self) -> Vec<&PresenceEntry> {
        self.active_users_excluding_self()
            .into_iter()
            .filter(|e| e.state.typing)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Handle that unsubscribes from the registry when dropped.
pub struct PresenceSubscription {
    registry: Weak<PresenceRegistry>,
    id: usize,
}

impl Drop for PresenceSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(self.id);
        }
    }
}

type SnapshotCallback = Arc<dyn Fn(&PresenceSnapshot) + Send + Sync>;

#[derive(Default)]
struct RegistryState {
    session: Option<SessionId>,
    local: Option<PresenceState>,
    remote: HashMap<SessionId, Vec<u8>>,
    outbound: Option<Outbound>,
}

impl RegistryState {
    fn snapshot(&self) -> PresenceSnapshot {
        let mut entries = Vec::with_capacity(self.remote.len() + 1);
        if let Some(local) = &self.local {
            entries.push(PresenceEntry {
                session: self.session,
                state: local.clone(),
                is_local: true,
            });
        }

        let mut remote: Vec<_> = self
            .remote
            .iter()
            .filter(|(session, _)| Some(**session) != self.session)
            .filter_map(|(session, payload)| {
                PresenceState::parse(payload).map(|state| PresenceEntry {
                    session: Some(*session),
                    state,
                    is_local: false,
                })
            })
            .collect();
        remote.sort_by_key(|e| e.session);
        entries.extend(remote);

        PresenceSnapshot { entries }
    }

    /// Message announcing the local entry (or its removal), if it can be sent.
    fn local_message(&self) -> Option<(Outbound, ClientMessage)> {
        let outbound = self.outbound.clone()?;
        let session = self.session?;
        let state = match &self.local {
            Some(local) => match serde_json::to_vec(local) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!("Failed to encode presence: {}", e);
                    return None;
                }
            },
            None => None,
        };
        Some((outbound, ClientMessage::Presence { session, state }))
    }
}

/// Presence registry for one document session.
#[derive(Default)]
pub struct PresenceRegistry {
    state: RwLock<RegistryState>,
    subscribers: RwLock<Vec<(usize, SnapshotCallback)>>,
    next_id: AtomicUsize,
    typing_timer: Debouncer,
}

impl PresenceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route local broadcasts through a transport's outbound queue.
    ///
    /// Publishes the local entry right away if the connection is already up.
    pub fn attach(&self, outbound: Outbound) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).outbound = Some(outbound);
        self.broadcast_local();
    }

    /// Stop broadcasting.
    pub fn detach(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.outbound = None;
        state.session = None;
    }

    pub fn session(&self) -> Option<SessionId> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).session
    }

    /// A new connection came up: adopt its session id and re-publish the local entry.
    pub fn connected(&self, session: SessionId) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).session = Some(session);
        debug!("Presence session is now {}", session);
        self.broadcast_local();
        self.notify();
    }

    /// Replace the local entry in full and broadcast it.
    pub fn publish_local(&self, local: PresenceState) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).local = Some(local);
        self.broadcast_local();
        self.notify();
    }

    /// Merge one field into the local entry. Returns false if there is no local
    /// entry yet, or the field already had that value.
    pub fn update_local_field(&self, field: PresenceField) -> bool {
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let Some(local) = state.local.as_mut() else {
                return false;
            };
            let before = local.clone();
            local.apply(field);
            if *local == before {
                return false;
            }
        }
        self.broadcast_local();
        self.notify();
        true
    }

    /// Flag the local user as typing, and reset the flag after `timeout` without
    /// another call.
    pub fn mark_typing(self: &Arc<Self>, timeout: Duration) {
        self.update_local_field(PresenceField::Typing(true));

        let registry = Arc::downgrade(self);
        self.typing_timer.schedule(timeout, async move {
            if let Some(registry) = registry.upgrade() {
                registry.update_local_field(PresenceField::Typing(false));
            }
        });
    }

    /// Remove the local entry and broadcast the removal.
    pub fn clear_local(&self) {
        self.typing_timer.cancel();
        let had_local = self
            .state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .local
            .take()
            .is_some();
        if had_local {
            self.broadcast_local();
            self.notify();
        }
    }

    pub fn local(&self) -> Option<PresenceState> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .local
            .clone()
    }

    /// Store a remote entry, replacing any previous one for the session.
    pub fn apply_remote(&self, session: SessionId, payload: Vec<u8>) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remote
            .insert(session, payload);
        self.notify();
    }

    pub fn remove_remote(&self, session: SessionId) {
        let removed = self
            .state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remote
            .remove(&session)
            .is_some();
        if removed {
            self.notify();
        }
    }

    /// Replace every remote entry with the server's full snapshot.
    pub fn replace_remote(&self, entries: Vec<(SessionId, Vec<u8>)>) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).remote =
            entries.into_iter().collect();
        self.notify();
    }

    /// Route presence traffic from the transport.
    pub fn apply(&self, presence: RemotePresence) {
        match presence {
            RemotePresence::Upsert { session, state } => self.apply_remote(session, state),
            RemotePresence::Remove { session } => self.remove_remote(session),
            RemotePresence::Snapshot { entries } => self.replace_remote(entries),
        }
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        self.state.read().unwrap_or_else(|e| e.into_inner()).snapshot()
    }

    /// Receive the full snapshot on every change, starting with the current one.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&PresenceSnapshot) + Send + Sync + 'static,
    ) -> PresenceSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: SnapshotCallback = Arc::new(callback);
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::clone(&callback)));

        callback(&self.snapshot());

        PresenceSubscription {
            registry: Arc::downgrade(self),
            id,
        }
    }

    // notify never holds the lock while callbacks run, so this cannot deadlock
    fn unsubscribe(&self, id: usize) {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn broadcast_local(&self) {
        let message = self
            .state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .local_message();
        if let Some((outbound, message)) = message {
            outbound.send(message);
        }
    }

    fn notify(&self) {
        let callbacks: Vec<_> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        if callbacks.is_empty() {
            return;
        }

        let snapshot = self.snapshot();
        for callback in callbacks {
            callback(&snapshot);
        }
    }
}
