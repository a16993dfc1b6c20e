//! Connection state machine for the session transport.
//!
//! ```text
//! Connecting ──handshake──▶ Connected ──sync──▶ Synced
//!     ▲                        │                  │
//!     └──reconnect── Disconnected ◀──socket lost──┘
//!
//! any non-terminal ──auth rejected──▶ AuthFailed (terminal)
//! ```

use super::TransportError;
use crate::session_id::SessionId;

/// State of a session transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Establishing the link (initial state)
    Connecting,
    /// Handshake done, initial sync in progress
    Connected { session: SessionId },
    /// Initial sync merged; authoritative for content and presence
    Synced { session: SessionId },
    /// Link lost; a reconnect is scheduled unless the retry budget ran out
    Disconnected { cause: Option<String> },
    /// Credential rejected (terminal)
    AuthFailed { reason: String },
}

/// Inputs that drive the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    HandshakeOk(SessionId),
    SyncConfirmed,
    SocketLost(Option<String>),
    AuthRejected(String),
    Reconnect,
}

impl TransportSignal {
    pub fn name(&self) -> &'static str {
        match self {
            TransportSignal::HandshakeOk(_) => "HandshakeOk",
            TransportSignal::SyncConfirmed => "SyncConfirmed",
            TransportSignal::SocketLost(_) => "SocketLost",
            TransportSignal::AuthRejected(_) => "AuthRejected",
            TransportSignal::Reconnect => "Reconnect",
        }
    }
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected { .. } => "Connected",
            ConnectionState::Synced { .. } => "Synced",
            ConnectionState::Disconnected { .. } => "Disconnected",
            ConnectionState::AuthFailed { .. } => "AuthFailed",
        }
    }

    /// Session identifier of the live connection, if any.
    pub fn session(&self) -> Option<SessionId> {
        match self {
            ConnectionState::Connected { session } | ConnectionState::Synced { session } => {
                Some(*session)
            }
            _ => None,
        }
    }

    pub fn is_synced(&self) -> bool {
        matches!(self, ConnectionState::Synced { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::AuthFailed { .. })
    }

    /// Compute the state that follows `signal`.
    ///
    /// Illegal transitions return `TransportError::InvalidTransition`; the caller
    /// keeps its current state.
    pub fn transition(&self, signal: TransportSignal) -> Result<ConnectionState, TransportError> {
        use ConnectionState::*;
        use TransportSignal as S;

        match (self, signal) {
            (Connecting, S::HandshakeOk(session)) => Ok(Connected { session }),
            (Connected { session }, S::SyncConfirmed) => Ok(Synced { session: *session }),
            (Connecting | Connected { .. } | Synced { .. }, S::SocketLost(cause)) => {
                Ok(Disconnected { cause })
            }
            (state, S::AuthRejected(reason)) if !state.is_terminal() => Ok(AuthFailed { reason }),
            (Disconnected { .. }, S::Reconnect) => Ok(Connecting),
            (state, signal) => Err(TransportError::InvalidTransition {
                from: state.name(),
                signal: signal.name(),
            }),
        }
    }
}
