//! Persistence boundary for rooms, chat, and snapshots.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   get / create-if-absent / update   ┌──────────────┐
//! │ CollabServer │ ───────────────────────────────────► │  RoomStore   │
//! │ (event loop) │                                      │  (trait)     │
//! └──────────────┘                                      └──────┬───────┘
//!                                             ┌────────────────┴───────────────┐
//!                                             ▼                                ▼
//!                                     ┌──────────────┐                 ┌──────────────┐
//!                                     │ MemoryStore  │                 │   RoomDb     │
//!                                     │ (tests, dev) │                 │  (RocksDB)   │
//!                                     └──────────────┘                 └──────────────┘
//! ```
//!
//! The store is injected into the server rather than reached through a
//! process-wide registry. Room creation is idempotent: the default record for
//! a given id is deterministic, so two connections racing to create the same
//! room converge on identical state under the store's unique-key semantics.
//! No in-process lock is relied on for this.
//!
//! Room access is read-current, mutate-in-memory, write-back. There is no
//! compare-and-swap and no per-room write serialization: concurrent mutations
//! to the same room from different connections can lose an intermediate
//! update. Callers must not assume stronger guarantees.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RoomDb, StoreConfig};

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// Code buffer seeded into a freshly created room.
pub const DEFAULT_CODE: &str = "// Start coding together!";
/// Language tag seeded into a freshly created room.
pub const DEFAULT_LANGUAGE: &str = "javascript";

/// Inactivity window after which a room expires, regardless of roster size.
pub const ROOM_TTL_MS: u64 = 24 * 60 * 60 * 1000;
/// Retention window after which chat messages are purged.
pub const CHAT_RETENTION_MS: u64 = 7 * 24 * 60 * 60 * 1000;
/// Maximum number of messages replayed to a joining connection.
pub const CHAT_REPLAY_LIMIT: usize = 100;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A live presence entry embedded in a [`Room`].
///
/// Invariant: at most one entry per username per room. A join under an
/// existing username replaces the prior entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub connection_id: Uuid,
    pub username: String,
    pub color: String,
    pub joined_at: u64,
}

/// The shared session record. The only state mutated by more than one
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub room_id: String,
    pub participants: Vec<Participant>,
    pub code: String,
    pub language: String,
    /// Incremented by exactly one per accepted code mutation. An
    /// observability signal, not a conflict-resolution mechanism.
    pub version: u64,
    pub created_at: u64,
    pub last_activity: u64,
}

impl Room {
    /// The default record seeded on first connection to a room id.
    pub fn with_defaults(room_id: impl Into<String>, now: u64) -> Self {
        Self {
            room_id: room_id.into(),
            participants: Vec::new(),
            code: DEFAULT_CODE.to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
            version: 0,
            created_at: now,
            last_activity: now,
        }
    }
}

/// An append-only chat record. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub room_id: String,
    pub username: String,
    pub text: String,
    /// Client-declared, stored verbatim. Ordering within a room follows it.
    pub timestamp: u64,
}

/// An immutable point-in-time copy of a room's code state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub room_id: String,
    pub code: String,
    pub language: String,
    pub version: u64,
    pub created_by: String,
    pub created_at: u64,
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend failure (RocksDB, lock poisoning, ...).
    DatabaseError(String),
    /// No record under the given room id.
    NotFound(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Room not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// The persistence boundary.
///
/// Every method is a single storage round-trip; callers compose them and own
/// the read-modify-write cycle for room mutations.
pub trait RoomStore: Send + Sync {
    /// Fetch a room by id.
    fn get_room(&self, room_id: &str) -> Result<Option<Room>, StoreError>;

    /// Create `room` unless a record already exists under its id. Returns the
    /// stored record either way. Idempotent under concurrent creation.
    fn create_room_if_absent(&self, room: Room) -> Result<Room, StoreError>;

    /// Write back a room record (full replacement).
    fn put_room(&self, room: &Room) -> Result<(), StoreError>;

    /// Delete rooms whose `last_activity` is strictly before `cutoff`.
    /// Returns the number deleted.
    fn delete_rooms_idle_before(&self, cutoff: u64) -> Result<u64, StoreError>;

    /// Append a chat message.
    fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError>;

    /// The most recent `limit` messages for a room, ascending by timestamp.
    fn recent_messages(&self, room_id: &str, limit: usize)
        -> Result<Vec<ChatMessage>, StoreError>;

    /// Delete messages with a timestamp strictly before `cutoff`. Returns the
    /// number deleted.
    fn purge_messages_before(&self, cutoff: u64) -> Result<u64, StoreError>;

    /// Append a snapshot. Never overwrites: every call produces a distinct
    /// record. Returns the sequence number assigned to it.
    fn append_snapshot(&self, snapshot: &Snapshot) -> Result<u64, StoreError>;

    /// All snapshots for a room, in creation order.
    fn snapshots(&self, room_id: &str) -> Result<Vec<Snapshot>, StoreError>;
}
