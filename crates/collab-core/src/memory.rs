//! In-process sync relay implementing `SyncProvider`.
//!
//! Keeps one server-side replica and presence map per document and relays
//! messages between connected links, the way the real sync server does. Used by
//! tests and the offline demo; also lets tests sever links, go offline, or
//! reject credentials.

use crate::document::{LocalEdit, SharedDocument};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session_id::SessionId;
use crate::transport::{ConnectRequest, ProviderLink, Result, SyncProvider, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

type Inbox = mpsc::UnboundedSender<std::result::Result<ServerMessage, String>>;

struct LinkRecord {
    session: SessionId,
    token: String,
    inbox: Inbox,
}

struct Room {
    replica: SharedDocument,
    presence: HashMap<SessionId, Vec<u8>>,
    links: HashMap<u64, LinkRecord>,
}

impl Room {
    fn new(document_id: &str) -> Self {
        Self {
            replica: SharedDocument::new(document_id),
            presence: HashMap::new(),
            links: HashMap::new(),
        }
    }

    fn broadcast(&self, from: u64, message: &ServerMessage) {
        for (id, link) in &self.links {
            if *id != from {
                let _ = link.inbox.send(Ok(message.clone()));
            }
        }
    }
}

#[derive(Default)]
struct Relay {
    rooms: HashMap<String, Room>,
    rejected: HashSet<String>,
    offline: bool,
    next_link: u64,
    connects: usize,
}

impl Relay {
    fn room(&mut self, document_id: &str) -> &mut Room {
        self.rooms
            .entry(document_id.to_string())
            .or_insert_with(|| Room::new(document_id))
    }
}

/// In-memory sync server shared by every clone.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    relay: Arc<Mutex<Relay>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn relay(&self) -> std::sync::MutexGuard<'_, Relay> {
        self.relay.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Put content into the server-side replica, as if another client wrote it.
    pub fn seed_server(&self, document_id: &str, text: &str) {
        let mut relay = self.relay();
        let replica = &relay.room(document_id).replica;
        let index = replica.len().unwrap_or(0);
        let _ = replica.apply_local_edit(&LocalEdit::Insert {
            index,
            text: text.to_string(),
        });
    }

    pub fn server_text(&self, document_id: &str) -> Option<String> {
        self.relay()
            .rooms
            .get(document_id)
            .and_then(|room| room.replica.text().ok())
    }

    /// Number of live presence entries the server holds for a document.
    pub fn presence_count(&self, document_id: &str) -> usize {
        self.relay()
            .rooms
            .get(document_id)
            .map(|room| room.presence.len())
            .unwrap_or(0)
    }

    pub fn link_count(&self, document_id: &str) -> usize {
        self.relay()
            .rooms
            .get(document_id)
            .map(|room| room.links.len())
            .unwrap_or(0)
    }

    /// Total successful connects across all documents.
    pub fn connect_count(&self) -> usize {
        self.relay().connects
    }

    /// Refuse this token on connect and revoke it on live links.
    pub fn reject_token(&self, token: &str) {
        let mut relay = self.relay();
        relay.rejected.insert(token.to_string());
        for room in relay.rooms.values() {
            for link in room.links.values().filter(|l| l.token == token) {
                let _ = link.inbox.send(Ok(ServerMessage::AuthRejected {
                    reason: "credential revoked".into(),
                }));
            }
        }
    }

    /// Refuse new connections while offline.
    pub fn set_offline(&self, offline: bool) {
        self.relay().offline = offline;
    }

    /// Drop every link of a document, optionally reporting `cause` to clients.
    pub fn sever(&self, document_id: &str, cause: Option<&str>) {
        let mut relay = self.relay();
        if let Some(room) = relay.rooms.get_mut(document_id) {
            for (_, link) in room.links.drain() {
                if let Some(cause) = cause {
                    let _ = link.inbox.send(Err(cause.to_string()));
                }
            }
            room.presence.clear();
        }
    }
}

#[async_trait]
impl SyncProvider for MemoryProvider {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn ProviderLink>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let link_id = {
            let mut relay = self.relay();
            if relay.offline {
                return Err(TransportError::ConnectionFailed("relay offline".into()));
            }
            if relay.rejected.contains(request.credential.token()) {
                return Err(TransportError::AuthRejected("invalid token".into()));
            }

            relay.connects += 1;
            relay.next_link += 1;
            let link_id = relay.next_link;
            let room = relay.room(&request.document_id);

            let entries = room
                .presence
                .iter()
                .map(|(session, state)| (*session, state.clone()))
                .collect();
            let _ = tx.send(Ok(ServerMessage::PresenceSnapshot { entries }));

            room.links.insert(
                link_id,
                LinkRecord {
                    session: request.session,
                    token: request.credential.token().to_string(),
                    inbox: tx,
                },
            );
            link_id
        };

        debug!(
            "Relay accepted session {} for {}",
            request.session, request.document_id
        );
        Ok(Box::new(MemoryLink {
            relay: Arc::clone(&self.relay),
            document_id: request.document_id.clone(),
            link_id,
            session: request.session,
            inbox: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryLink {
    relay: Arc<Mutex<Relay>>,
    document_id: String,
    link_id: u64,
    session: SessionId,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<std::result::Result<ServerMessage, String>>>,
    closed: AtomicBool,
}

#[async_trait]
impl ProviderLink for MemoryLink {
    async fn send(&self, message: ClientMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let mut relay = self.relay.lock().unwrap_or_else(|e| e.into_inner());
        let room = relay
            .rooms
            .get_mut(&self.document_id)
            .filter(|room| room.links.contains_key(&self.link_id))
            .ok_or(TransportError::Closed)?;

        match message {
            ClientMessage::SyncRequest { version } => {
                let update = room
                    .replica
                    .export_missing(&version)
                    .map_err(|e| TransportError::SendFailed(e.to_string()))?;
                let reply = ServerMessage::SyncReply {
                    update,
                    version: room.replica.encoded_version()?,
                };
                if let Some(link) = room.links.get(&self.link_id) {
                    let _ = link.inbox.send(Ok(reply));
                }
            }
            ClientMessage::Update { data } => {
                room.replica
                    .apply_remote_update(&data)
                    .map_err(|e| TransportError::SendFailed(e.to_string()))?;
                room.broadcast(self.link_id, &ServerMessage::Update { data });
            }
            ClientMessage::Presence { session, state } => {
                match &state {
                    Some(state) => {
                        room.presence.insert(session, state.clone());
                    }
                    None => {
                        room.presence.remove(&session);
                    }
                }
                room.broadcast(self.link_id, &ServerMessage::Presence { session, state });
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<ServerMessage> {
        match self.inbox.lock().await.recv().await {
            Some(Ok(message)) => Ok(message),
            Some(Err(cause)) => Err(TransportError::ReceiveFailed(cause)),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut relay = self.relay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(room) = relay.rooms.get_mut(&self.document_id) {
            room.links.remove(&self.link_id);
            // Server-side cleanup in case the client never sent its removal
            if room.presence.remove(&self.session).is_some() {
                room.broadcast(
                    self.link_id,
                    &ServerMessage::Presence {
                        session: self.session,
                        state: None,
                    },
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Credential;

    fn request(document_id: &str, token: &str) -> ConnectRequest {
        ConnectRequest {
            document_id: document_id.into(),
            credential: Credential::new(token),
            session: SessionId::generate(),
        }
    }

    #[tokio::test]
    async fn test_relays_presence_between_links() {
        let relay = MemoryProvider::new();
        let a_req = request("doc-1", "t");
        let a = relay.connect(&a_req).await.unwrap();
        let b = relay.connect(&request("doc-1", "t")).await.unwrap();

        // Each link starts with the presence snapshot
        assert!(matches!(
            a.recv().await.unwrap(),
            ServerMessage::PresenceSnapshot { .. }
        ));
        assert!(matches!(
            b.recv().await.unwrap(),
            ServerMessage::PresenceSnapshot { .. }
        ));

        a.send(ClientMessage::Presence {
            session: a_req.session,
            state: Some(b"{}".to_vec()),
        })
        .await
        .unwrap();
        assert!(matches!(
            b.recv().await.unwrap(),
            ServerMessage::Presence { state: Some(_), .. }
        ));
        assert_eq!(relay.presence_count("doc-1"), 1);

        a.close().await.unwrap();
        assert_eq!(
            b.recv().await.unwrap(),
            ServerMessage::Presence {
                session: a_req.session,
                state: None
            }
        );
        assert_eq!(relay.presence_count("doc-1"), 0);
        assert!(matches!(
            a.send(ClientMessage::Update { data: vec![] }).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_rejects_token_and_offline() {
        let relay = MemoryProvider::new();
        relay.reject_token("bad");
        assert!(matches!(
            relay.connect(&request("doc-1", "bad")).await,
            Err(TransportError::AuthRejected(_))
        ));

        relay.set_offline(true);
        assert!(matches!(
            relay.connect(&request("doc-1", "good")).await,
            Err(TransportError::ConnectionFailed(_))
        ));
        assert_eq!(relay.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_sever_reports_cause() {
        let relay = MemoryProvider::new();
        let link = relay.connect(&request("doc-1", "t")).await.unwrap();
        link.recv().await.unwrap();

        relay.sever("doc-1", Some("connection reset"));
        assert!(matches!(
            link.recv().await,
            Err(TransportError::ReceiveFailed(cause)) if cause == "connection reset"
        ));
        assert!(matches!(link.recv().await, Err(TransportError::Closed)));
        assert_eq!(relay.link_count("doc-1"), 0);
    }
}
