//! Binary wire protocol for session events.
//!
//! Every frame on the wire is one bincode-encoded [`ClientEvent`] or
//! [`ServerEvent`] carried in a binary WebSocket message. The first client
//! frame on a connection must be [`ClientEvent::Join`]; everything else is
//! rejected until the handshake has been accepted.
//!
//! Server-to-client frames that fan out through a room's broadcast channel
//! carry an origin connection id alongside the encoded bytes (see
//! `broadcast::RoomFrame`), which is how "relay to everyone but the
//! originator" is routed without re-decoding on the hot path.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A chat message as submitted by a client.
///
/// The timestamp is client-declared milliseconds since the epoch and is
/// stored verbatim; replay ordering follows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub text: String,
    pub timestamp: u64,
}

/// A chat message in its canonical stored form, as echoed to the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub username: String,
    pub text: String,
    pub timestamp: u64,
}

/// An editor cursor position. Ephemeral: relayed, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPos {
    pub line: u32,
    pub column: u32,
}

/// One roster entry as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    /// Connection id of the live entry.
    pub id: Uuid,
    pub username: String,
    /// Display color, hex string from the server palette.
    pub color: String,
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientEvent {
    /// Handshake. Must be the first frame on a connection; the credential is
    /// verified before any room-scoped event is processed.
    Join { room_id: String, credential: String },
    /// Replace the room's code buffer (last-write-wins).
    CodeChange { room_id: String, code: String },
    /// Replace the room's language tag.
    LanguageChange { room_id: String, language: String },
    /// Append a chat message.
    Chat { room_id: String, message: ChatPayload },
    /// Ephemeral cursor movement.
    Cursor { room_id: String, position: CursorPos },
    /// Request an immutable snapshot of the room's current state.
    RequestSnapshot { room_id: String },
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// Current code buffer, sent once on join.
    CodeSnapshot { code: String },
    /// Current language. Sent on join and re-sent on every later change.
    LanguageUpdate { language: String },
    /// Bounded replay of recent chat, sent on join only, ascending timestamps.
    ChatHistory { messages: Vec<ChatEntry> },
    /// The full roster. Re-sent to the whole room after every join and leave.
    RoomJoined { participants: Vec<ParticipantInfo> },
    /// A code mutation, relayed to everyone but the originator.
    CodeUpdate { code: String },
    /// A persisted chat message, relayed to everyone including the sender.
    Chat { message: ChatEntry },
    /// A cursor movement, relayed to everyone but the originator.
    CursorUpdate {
        user_id: Uuid,
        username: String,
        position: CursorPos,
    },
    /// Snapshot acknowledgment, sent to the requester only.
    SnapshotSaved {
        success: bool,
        error: Option<String>,
    },
}

impl ClientEvent {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(event)
    }

    /// The room this event targets.
    pub fn room_id(&self) -> &str {
        match self {
            ClientEvent::Join { room_id, .. }
            | ClientEvent::CodeChange { room_id, .. }
            | ClientEvent::LanguageChange { room_id, .. }
            | ClientEvent::Chat { room_id, .. }
            | ClientEvent::Cursor { room_id, .. }
            | ClientEvent::RequestSnapshot { room_id } => room_id,
        }
    }
}

impl ServerEvent {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(event)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
