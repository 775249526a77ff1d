//! WebSocket session server with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (room_id) ── Room record ── BroadcastGroup
//! Client B ──┘                          │
//!                                       ├── RoomStore (RocksDB / memory)
//!                                       │       │
//!                                       │       ├── Rooms (LZ4)
//!                                       │       ├── Chat log
//!                                       │       └── Snapshots (LZ4)
//!                                       │
//!                            ┌──────────┼───────────┐
//!                            ▼          ▼           ▼
//!                         Client A   Client B    Client C
//! ```
//!
//! Each connection runs one task: a `select!` loop over its socket and its
//! room's broadcast receiver, so events from one connection are handled in
//! the order received. There is no cross-connection ordering guarantee: two
//! events touching the same room from different connections may interleave
//! arbitrarily at the store.
//!
//! Handler failures are isolated: a storage error aborts only that event and
//! the connection stays open. Code, language, chat and cursor failures
//! degrade silently to the client; snapshot requests always receive a
//! definitive acknowledgment. Only authentication and missing-room-id
//! failures terminate the session.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::broadcast::RoomChannels;
use crate::presence;
use crate::protocol::{ChatEntry, ClientEvent, ServerEvent};
use crate::registry::RoomRegistry;
use crate::storage::{
    now_ms, ChatMessage, MemoryStore, RoomDb, RoomStore, Snapshot, StoreConfig, StoreError,
    CHAT_REPLAY_LIMIT, CHAT_RETENTION_MS, ROOM_TTL_MS,
};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Messages replayed to a joining connection
    pub chat_replay_limit: usize,
    /// Inactivity window before a room expires
    pub room_ttl_ms: u64,
    /// Retention window for chat messages
    pub chat_retention_ms: u64,
    /// Seconds between TTL maintenance sweeps
    pub maintenance_interval_secs: u64,
    /// Persistence path (None = in-memory store)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            chat_replay_limit: CHAT_REPLAY_LIMIT,
            room_ttl_ms: ROOM_TTL_MS,
            chat_retention_ms: CHAT_RETENTION_MS,
            maintenance_interval_secs: 60,
            storage_path: None,
        }
    }
}

/// Server-wide counters.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    /// Connections admitted to a room and not yet closed.
    pub active_connections: u64,
    pub auth_rejections: u64,
    pub total_events: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// The session server.
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    channels: Arc<RoomChannels>,
    auth: Arc<dyn Authenticator>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    /// Create a server with the store selected by `config.storage_path`
    /// (RocksDB when set, in-memory otherwise).
    pub fn new(config: ServerConfig, auth: Arc<dyn Authenticator>) -> Result<Self, StoreError> {
        let store: Arc<dyn RoomStore> = match &config.storage_path {
            Some(path) => Arc::new(RoomDb::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, auth, store))
    }

    /// Create a server over an injected store.
    pub fn with_store(
        config: ServerConfig,
        auth: Arc<dyn Authenticator>,
        store: Arc<dyn RoomStore>,
    ) -> Self {
        let channels = Arc::new(RoomChannels::new(config.broadcast_capacity));
        Self {
            config,
            registry: Arc::new(RoomRegistry::new(store)),
            channels,
            auth,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Start listening for WebSocket connections. Runs the accept loop; call
    /// from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_maintenance();

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collab server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let config = self.config.clone();
            let registry = self.registry.clone();
            let channels = self.channels.clone();
            let auth = self.auth.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, config, registry, channels, auth, stats)
                        .await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Periodic TTL sweep: expire idle rooms, purge old chat.
    fn spawn_maintenance(&self) {
        let registry = self.registry.clone();
        let room_ttl_ms = self.config.room_ttl_ms;
        let chat_retention_ms = self.config.chat_retention_ms;
        let period = Duration::from_secs(self.config.maintenance_interval_secs);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                if let Err(e) = registry.sweep(now_ms(), room_ttl_ms, chat_retention_ms) {
                    log::error!("Maintenance sweep failed: {e}");
                }
            }
        });
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        config: ServerConfig,
        registry: Arc<RoomRegistry>,
        channels: Arc<RoomChannels>,
        auth: Arc<dyn Authenticator>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> ConnectionResult {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::debug!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
        }

        // Handshake: the first frame must be a Join. No room-scoped event is
        // processed before the credential has been verified.
        let handshake = match ws_receiver.next().await {
            Some(Ok(Message::Binary(data))) => ClientEvent::decode(&data).ok(),
            _ => None,
        };
        let (room_id, credential) = match handshake {
            Some(ClientEvent::Join {
                room_id,
                credential,
            }) => (room_id, credential),
            _ => {
                log::warn!("Connection from {addr} did not open with a join handshake");
                return Self::reject(&mut ws_sender, "expected join handshake").await;
            }
        };
        if room_id.is_empty() {
            log::warn!("Connection from {addr} supplied no room id");
            return Self::reject(&mut ws_sender, "missing room id").await;
        }
        let identity = match auth.verify(&credential) {
            Ok(identity) => identity,
            Err(e) => {
                log::warn!("Rejected connection from {addr}: {e}");
                let mut s = stats.write().await;
                s.auth_rejections += 1;
                drop(s);
                return Self::reject(&mut ws_sender, "authentication failed").await;
            }
        };

        let connection_id = Uuid::new_v4();
        log::info!(
            "{} (user {}) connecting to room {room_id}",
            identity.username,
            identity.user_id
        );

        // Admit the participant: replace any roster entry under the same
        // username, persist, then give the joiner its initial state.
        let now = now_ms();
        let mut room = registry.open(&room_id, now)?;
        let entrant = presence::new_participant(connection_id, identity.username.clone(), now);
        if let Some(evicted) = presence::admit(&mut room.participants, entrant) {
            log::info!(
                "Replaced roster entry for {} (stale connection {})",
                evicted.username,
                evicted.connection_id
            );
        }
        room.last_activity = now;
        registry.update(&room)?;

        // Initial state for the joiner. A replay failure degrades to empty
        // history rather than ending the session; a dead socket surfaces in
        // the event loop and runs the reconciler below.
        let history = registry
            .store()
            .recent_messages(&room_id, config.chat_replay_limit)
            .unwrap_or_else(|e| {
                log::error!("Error replaying chat for {room_id}: {e}");
                Vec::new()
            });
        let initial = [
            ServerEvent::CodeSnapshot {
                code: room.code.clone(),
            },
            ServerEvent::LanguageUpdate {
                language: room.language.clone(),
            },
            ServerEvent::ChatHistory {
                messages: history.iter().map(chat_entry).collect(),
            },
        ];
        for event in &initial {
            if let Err(e) = Self::send_event(&mut ws_sender, event).await {
                log::warn!(
                    "Failed to deliver initial state to {}: {e}",
                    identity.username
                );
                break;
            }
        }

        // The full roster goes to everyone in the room, the joiner included.
        let group = channels.get_or_create(&room_id).await;
        let mut room_rx = group
            .add_connection(connection_id, identity.username.clone())
            .await;
        let _ = group.send_event(
            None,
            &ServerEvent::RoomJoined {
                participants: presence::roster_view(&room.participants),
            },
        );
        log::info!("{} joined room {room_id}", identity.username);

        let room_count = channels.room_count().await;
        {
            let mut s = stats.write().await;
            s.active_connections += 1;
            s.active_rooms = room_count;
        }

        // Per-connection event loop. Incoming frames from this connection
        // are handled in order; room broadcasts interleave between them.
        loop {
            tokio::select! {
                incoming = ws_receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_events += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            let event = match ClientEvent::decode(&bytes) {
                                Ok(event) => event,
                                Err(e) => {
                                    log::warn!(
                                        "Undecodable frame from {}: {e}",
                                        identity.username
                                    );
                                    continue;
                                }
                            };

                            match event {
                                ClientEvent::Join { .. } => {
                                    log::debug!(
                                        "Ignoring repeated join from {}",
                                        identity.username
                                    );
                                }

                                ClientEvent::CodeChange { room_id: target, code } => {
                                    // Last-write-wins; the version counter
                                    // observes mutations, it does not order
                                    // them.
                                    match registry.store().get_room(&target) {
                                        Ok(Some(mut room)) => {
                                            room.code = code.clone();
                                            room.version += 1;
                                            room.last_activity = now_ms();
                                            match registry.update(&room) {
                                                Ok(()) => {
                                                    let target_group =
                                                        channels.get_or_create(&target).await;
                                                    let _ = target_group.send_event(
                                                        Some(connection_id),
                                                        &ServerEvent::CodeUpdate { code },
                                                    );
                                                }
                                                Err(e) => log::error!(
                                                    "Error updating code in {target}: {e}"
                                                ),
                                            }
                                        }
                                        Ok(None) => {
                                            log::debug!("Code change for unknown room {target}")
                                        }
                                        Err(e) => {
                                            log::error!("Error loading room {target}: {e}")
                                        }
                                    }
                                }

                                ClientEvent::LanguageChange { room_id: target, language } => {
                                    // Same shape as a code change, but the
                                    // version counter does not move.
                                    match registry.store().get_room(&target) {
                                        Ok(Some(mut room)) => {
                                            room.language = language.clone();
                                            room.last_activity = now_ms();
                                            match registry.update(&room) {
                                                Ok(()) => {
                                                    let target_group =
                                                        channels.get_or_create(&target).await;
                                                    let _ = target_group.send_event(
                                                        Some(connection_id),
                                                        &ServerEvent::LanguageUpdate { language },
                                                    );
                                                }
                                                Err(e) => log::error!(
                                                    "Error updating language in {target}: {e}"
                                                ),
                                            }
                                        }
                                        Ok(None) => log::debug!(
                                            "Language change for unknown room {target}"
                                        ),
                                        Err(e) => {
                                            log::error!("Error loading room {target}: {e}")
                                        }
                                    }
                                }

                                ClientEvent::Chat { room_id: target, message } => {
                                    // Attribution comes from the verified
                                    // identity; the timestamp is the client's,
                                    // stored verbatim.
                                    let stored = ChatMessage {
                                        room_id: target.clone(),
                                        username: identity.username.clone(),
                                        text: message.text,
                                        timestamp: message.timestamp,
                                    };
                                    match registry.store().append_message(&stored) {
                                        Ok(()) => {
                                            // Echo the canonical stored form to
                                            // everyone, the sender included.
                                            let target_group =
                                                channels.get_or_create(&target).await;
                                            let _ = target_group.send_event(
                                                None,
                                                &ServerEvent::Chat {
                                                    message: chat_entry(&stored),
                                                },
                                            );
                                            log::debug!(
                                                "Chat message in {target} from {}",
                                                stored.username
                                            );
                                        }
                                        Err(e) => {
                                            log::error!("Error saving message in {target}: {e}")
                                        }
                                    }
                                }

                                ClientEvent::Cursor { room_id: target, position } => {
                                    // Ephemeral: relayed, never persisted.
                                    let target_group = channels.get_or_create(&target).await;
                                    let _ = target_group.send_event(
                                        Some(connection_id),
                                        &ServerEvent::CursorUpdate {
                                            user_id: connection_id,
                                            username: identity.username.clone(),
                                            position,
                                        },
                                    );
                                }

                                ClientEvent::RequestSnapshot { room_id: target } => {
                                    let ack = match registry.store().get_room(&target) {
                                        Ok(Some(room)) => {
                                            let snapshot = Snapshot {
                                                room_id: target.clone(),
                                                code: room.code,
                                                language: room.language,
                                                version: room.version,
                                                created_by: identity.username.clone(),
                                                created_at: now_ms(),
                                            };
                                            match registry.store().append_snapshot(&snapshot) {
                                                Ok(_) => ServerEvent::SnapshotSaved {
                                                    success: true,
                                                    error: None,
                                                },
                                                Err(e) => {
                                                    log::error!(
                                                        "Error saving snapshot for {target}: {e}"
                                                    );
                                                    ServerEvent::SnapshotSaved {
                                                        success: false,
                                                        error: Some(e.to_string()),
                                                    }
                                                }
                                            }
                                        }
                                        Ok(None) => ServerEvent::SnapshotSaved {
                                            success: false,
                                            error: Some(format!("Room not found: {target}")),
                                        },
                                        Err(e) => {
                                            log::error!("Error loading room {target}: {e}");
                                            ServerEvent::SnapshotSaved {
                                                success: false,
                                                error: Some(e.to_string()),
                                            }
                                        }
                                    };
                                    // Requester only, never broadcast.
                                    if Self::send_event(&mut ws_sender, &ack).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Connection closed from {addr}");
                            break;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                frame = room_rx.recv() => {
                    match frame {
                        Ok(frame) => {
                            if frame.skips(connection_id) {
                                continue;
                            }
                            if ws_sender
                                .send(Message::Binary(frame.bytes.to_vec().into()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!(
                                "Connection {connection_id} in {room_id} lagged by {n} frames"
                            );
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }

        // Disconnect reconciler: remove the roster entry by connection id and
        // rebroadcast to whoever remains. The room record itself stays; its
        // lifetime is governed by the inactivity TTL, not by presence.
        log::info!("{} disconnected from room {room_id}", identity.username);
        match registry.store().get_room(&room_id) {
            Ok(Some(mut room)) => {
                // No-op if a reconnect already replaced this username's entry
                // under a newer connection id.
                presence::remove_connection(&mut room.participants, connection_id);
                match registry.update(&room) {
                    Ok(()) => {
                        if room.participants.is_empty() {
                            log::debug!("Room {room_id} is now empty (kept until TTL)");
                        }
                        let _ = group.send_event(
                            None,
                            &ServerEvent::RoomJoined {
                                participants: presence::roster_view(&room.participants),
                            },
                        );
                    }
                    Err(e) => log::error!("Error persisting roster after disconnect: {e}"),
                }
            }
            Ok(None) => {}
            Err(e) => log::error!("Error handling disconnect for {room_id}: {e}"),
        }
        group.remove_connection(&connection_id).await;
        channels.remove_if_empty(&room_id).await;

        let room_count = channels.room_count().await;
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = room_count;
        }

        Ok(())
    }

    /// Terminate a handshake with a policy close frame. Fatal by contract:
    /// no retry, no partial admission.
    async fn reject(sender: &mut WsSink, reason: &str) -> ConnectionResult {
        let frame = CloseFrame {
            code: CloseCode::Policy,
            reason: reason.to_string().into(),
        };
        let _ = sender.send(Message::Close(Some(frame))).await;
        Ok(())
    }

    /// Encode and send one event to a single connection.
    async fn send_event(sender: &mut WsSink, event: &ServerEvent) -> ConnectionResult {
        let encoded = event.encode()?;
        sender.send(Message::Binary(encoded.into())).await?;
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the room registry.
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Get the broadcast channel map.
    pub fn channels(&self) -> &Arc<RoomChannels> {
        &self.channels
    }
}

/// A stored chat message in its wire form.
fn chat_entry(message: &ChatMessage) -> ChatEntry {
    ChatEntry {
        username: message.username.clone(),
        text: message.text.clone(),
        timestamp: message.timestamp,
    }
}
