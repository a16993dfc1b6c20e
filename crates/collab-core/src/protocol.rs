//! Wire messages exchanged with the sync server.
//!
//! Messages are bincode-encoded. Presence state travels as opaque JSON bytes so
//! the server relays it without interpreting it, and a malformed payload from
//! one client cannot break decoding for the others.

use crate::session_id::SessionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum encoded message size (50MB).
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Message too large: {size} bytes (max {MAX_MESSAGE_SIZE})")]
    TooLarge { size: usize },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Ask for everything the server has that `version` does not cover
    SyncRequest {
        /// Encoded Loro version vector
        version: Vec<u8>,
    },

    /// Local CRDT update for the server to apply and relay
    Update { data: Vec<u8> },

    /// Publish (Some) or remove (None) this connection's presence entry
    Presence {
        session: SessionId,
        state: Option<Vec<u8>>,
    },
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Reply to `SyncRequest`
    SyncReply {
        /// Updates the client is missing (None if up to date)
        update: Option<Vec<u8>>,
        /// Server's version vector, so the client can push what the server lacks
        version: Vec<u8>,
    },

    /// CRDT update from another client
    Update { data: Vec<u8> },

    /// Presence change from another client
    Presence {
        session: SessionId,
        state: Option<Vec<u8>>,
    },

    /// Every live presence entry, sent after each (re)connect
    PresenceSnapshot { entries: Vec<(SessionId, Vec<u8>)> },

    /// Credential rejected; the server closes the link after this
    AuthRejected { reason: String },
}

fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let bytes = bincode::serialize(message).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge { size: bytes.len() });
    }
    Ok(bytes)
}

fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge { size: data.len() });
    }
    bincode::deserialize(data).map_err(|e| ProtocolError::Decode(e.to_string()))
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        decode(data)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::SyncRequest { .. } => "SyncRequest",
            ClientMessage::Update { .. } => "Update",
            ClientMessage::Presence { .. } => "Presence",
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        decode(data)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::SyncReply { .. } => "SyncReply",
            ServerMessage::Update { .. } => "Update",
            ServerMessage::Presence { .. } => "Presence",
            ServerMessage::PresenceSnapshot { .. } => "PresenceSnapshot",
            ServerMessage::AuthRejected { .. } => "AuthRejected",
        }
    }
}
