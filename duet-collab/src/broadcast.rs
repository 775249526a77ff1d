//! Per-room fan-out over tokio broadcast channels.
//!
//! All connections in a room share one channel. Frames are pre-encoded once
//! and shared as `Arc<Vec<u8>>`; each frame carries the originating
//! connection id so receivers can drop their own echoes without re-decoding.
//! Fan-out order is the channel's send order, so every receiver observes the
//! same event sequence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerEvent};

/// One fan-out unit: an encoded server event plus its origin.
///
/// `origin: Some(id)` means "relay to everyone except connection `id`";
/// `None` means "deliver to everyone".
#[derive(Debug, Clone)]
pub struct RoomFrame {
    pub origin: Option<Uuid>,
    pub bytes: Arc<Vec<u8>>,
}

impl RoomFrame {
    /// Whether the connection `id` should skip this frame.
    pub fn skips(&self, id: Uuid) -> bool {
        self.origin == Some(id)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub active_connections: usize,
}

/// Lock-free counters for the broadcast hot path.
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
}

/// A broadcast group for a single room.
///
/// Tracks which connections are subscribed (by connection id) so empty
/// groups can be dropped; the persisted roster lives in the room record,
/// not here.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RoomFrame>,
    connections: Arc<RwLock<HashMap<Uuid, String>>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a new group. `capacity` bounds how many frames a slow receiver
    /// may buffer before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            connections: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats {
                frames_sent: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe a connection. Returns its receiver.
    pub async fn add_connection(
        &self,
        connection_id: Uuid,
        username: impl Into<String>,
    ) -> broadcast::Receiver<RoomFrame> {
        let mut connections = self.connections.write().await;
        connections.insert(connection_id, username.into());
        self.sender.subscribe()
    }

    /// Unsubscribe a connection. Returns its username if it was present.
    pub async fn remove_connection(&self, connection_id: &Uuid) -> Option<String> {
        let mut connections = self.connections.write().await;
        connections.remove(connection_id)
    }

    /// Encode `event` once and fan it out. Returns the number of receivers
    /// the frame reached (before origin filtering).
    pub fn send_event(
        &self,
        origin: Option<Uuid>,
        event: &ServerEvent,
    ) -> Result<usize, ProtocolError> {
        let encoded = event.encode()?;
        Ok(self.send_raw(RoomFrame {
            origin,
            bytes: Arc::new(encoded),
        }))
    }

    /// Fan out a pre-encoded frame. Lock-free.
    pub fn send_raw(&self, frame: RoomFrame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Current subscriber count.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Whether a connection is subscribed.
    pub async fn has_connection(&self, connection_id: &Uuid) -> bool {
        self.connections.read().await.contains_key(connection_id)
    }

    /// Broadcast statistics.
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.atomic_stats.frames_sent.load(Ordering::Relaxed),
            active_connections: self.connections.read().await.len(),
        }
    }

    /// The channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe without registering a connection (monitoring).
    pub fn subscribe(&self) -> broadcast::Receiver<RoomFrame> {
        self.sender.subscribe()
    }
}

/// Maps room ids to broadcast groups.
///
/// Groups are created lazily and dropped once their last connection leaves;
/// this is in-memory channel bookkeeping only. The persisted room record
/// has its own TTL-governed lifetime.
pub struct RoomChannels {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomChannels {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the group for a room.
    pub async fn get_or_create(&self, room_id: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(group) = rooms.get(room_id) {
                return group.clone();
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(group) = rooms.get(room_id) {
            return group.clone();
        }

        let group = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(room_id.to_string(), group.clone());
        group
    }

    /// Drop a group once it has no subscribers. Returns whether it was
    /// removed.
    pub async fn remove_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(group) = rooms.get(room_id) {
            if group.connection_count().await == 0 {
                rooms.remove(room_id);
                return true;
            }
        }
        false
    }

    /// Number of live groups.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Ids of rooms with a live group.
    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
