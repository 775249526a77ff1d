//! In-memory `RoomStore` for tests and storage-free deployments.
//!
//! Mirrors the persistent store's observable behavior, including unique-key
//! create semantics (one record per room id) and bounded chat replay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use super::{ChatMessage, Room, RoomStore, Snapshot, StoreError};

/// Map-backed store. All collections live behind their own lock so chat
/// traffic never contends with room writes.
pub struct MemoryStore {
    rooms: RwLock<HashMap<String, Room>>,
    messages: RwLock<Vec<ChatMessage>>,
    snapshots: RwLock<Vec<(u64, Snapshot)>>,
    sequence: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            messages: RwLock::new(Vec::new()),
            snapshots: RwLock::new(Vec::new()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Number of stored rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.read().expect("rooms lock poisoned").len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomStore for MemoryStore {
    fn get_room(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        Ok(self
            .rooms
            .read()
            .expect("rooms lock poisoned")
            .get(room_id)
            .cloned())
    }

    fn create_room_if_absent(&self, room: Room) -> Result<Room, StoreError> {
        let mut rooms = self.rooms.write().expect("rooms lock poisoned");
        Ok(rooms
            .entry(room.room_id.clone())
            .or_insert(room)
            .clone())
    }

    fn put_room(&self, room: &Room) -> Result<(), StoreError> {
        self.rooms
            .write()
            .expect("rooms lock poisoned")
            .insert(room.room_id.clone(), room.clone());
        Ok(())
    }

    fn delete_rooms_idle_before(&self, cutoff: u64) -> Result<u64, StoreError> {
        let mut rooms = self.rooms.write().expect("rooms lock poisoned");
        let before = rooms.len();
        rooms.retain(|_, room| room.last_activity >= cutoff);
        Ok((before - rooms.len()) as u64)
    }

    fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        self.messages
            .write()
            .expect("messages lock poisoned")
            .push(message.clone());
        Ok(())
    }

    fn recent_messages(
        &self,
        room_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let messages = self.messages.read().expect("messages lock poisoned");
        let mut in_room: Vec<ChatMessage> = messages
            .iter()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect();
        // Stable sort: equal timestamps keep append order.
        in_room.sort_by_key(|m| m.timestamp);
        let skip = in_room.len().saturating_sub(limit);
        Ok(in_room.split_off(skip))
    }

    fn purge_messages_before(&self, cutoff: u64) -> Result<u64, StoreError> {
        let mut messages = self.messages.write().expect("messages lock poisoned");
        let before = messages.len();
        messages.retain(|m| m.timestamp >= cutoff);
        Ok((before - messages.len()) as u64)
    }

    fn append_snapshot(&self, snapshot: &Snapshot) -> Result<u64, StoreError> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.snapshots
            .write()
            .expect("snapshots lock poisoned")
            .push((seq, snapshot.clone()));
        Ok(seq)
    }

    fn snapshots(&self, room_id: &str) -> Result<Vec<Snapshot>, StoreError> {
        Ok(self
            .snapshots
            .read()
            .expect("snapshots lock poisoned")
            .iter()
            .filter(|(_, s)| s.room_id == room_id)
            .map(|(_, s)| s.clone())
            .collect())
    }
}
