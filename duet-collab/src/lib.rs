//! # duet-collab — Real-time collaborative code sessions
//!
//! Room-based session management over WebSockets: a shared code buffer with
//! last-write-wins edits, a live participant roster, an append-only chat log,
//! and explicit immutable snapshots.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄─────────────────► │ CollabServer │
//! │ (per user)   │    Binary Proto     │ (central)    │
//! └──────────────┘                     └──────┬───────┘
//!                                             │
//!                              ┌──────────────┼──────────────┐
//!                              ▼              ▼              ▼
//!                       ┌────────────┐ ┌─────────────┐ ┌───────────┐
//!                       │ RoomStore  │ │ RoomChannels│ │ TokenReg. │
//!                       │ (RocksDB / │ │ (fan-out)   │ │ (auth)    │
//!                       │  memory)   │ └─────────────┘ └───────────┘
//!                       └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded client/server events)
//! - [`auth`] — Bearer-credential gatekeeper, identity binding
//! - [`presence`] — Roster mutation and display colors
//! - [`registry`] — Lazy room creation and TTL sweeps
//! - [`broadcast`] — Room-based fan-out with origin filtering
//! - [`server`] — WebSocket session server
//! - [`client`] — WebSocket session client
//! - [`storage`] — Injected persistence boundary (RocksDB / in-memory)
//!
//! Code edits are last-write-wins by design; this crate is not a CRDT or
//! operational-transform engine.

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use auth::{AuthError, Authenticator, Identity, TokenRegistry};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomChannels, RoomFrame};
pub use client::{CollabClient, ConnectionState, SessionEvent};
pub use protocol::{
    ChatEntry, ChatPayload, ClientEvent, CursorPos, ParticipantInfo, ProtocolError, ServerEvent,
};
pub use registry::{RoomRegistry, SweepReport};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use storage::{
    ChatMessage, MemoryStore, Participant, Room, RoomDb, RoomStore, Snapshot, StoreConfig,
    StoreError,
};
