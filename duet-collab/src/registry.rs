//! Room registry: lazy creation over the persistence boundary, plus the
//! TTL sweeps that bound room and chat lifetime.

use std::sync::Arc;

use crate::storage::{Room, RoomStore, StoreError};

/// What a maintenance sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub rooms_expired: u64,
    pub messages_purged: u64,
}

/// Resolves room ids to room records through an injected store.
pub struct RoomRegistry {
    store: Arc<dyn RoomStore>,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn RoomStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn RoomStore> {
        &self.store
    }

    /// Return the room under `room_id`, creating it with default state on
    /// first use. Two connections racing to create the same room both land on
    /// the same record: creation is idempotent at the store.
    pub fn open(&self, room_id: &str, now: u64) -> Result<Room, StoreError> {
        if let Some(room) = self.store.get_room(room_id)? {
            return Ok(room);
        }
        let room = self
            .store
            .create_room_if_absent(Room::with_defaults(room_id, now))?;
        log::info!("Created room {room_id}");
        Ok(room)
    }

    /// Write back a mutated room record.
    pub fn update(&self, room: &Room) -> Result<(), StoreError> {
        self.store.put_room(room)
    }

    /// Expire idle rooms and purge old chat. Room lifetime is governed solely
    /// by the inactivity TTL; an empty roster alone never deletes a room.
    pub fn sweep(
        &self,
        now: u64,
        room_ttl_ms: u64,
        chat_retention_ms: u64,
    ) -> Result<SweepReport, StoreError> {
        let rooms_expired = self
            .store
            .delete_rooms_idle_before(now.saturating_sub(room_ttl_ms))?;
        let messages_purged = self
            .store
            .purge_messages_before(now.saturating_sub(chat_retention_ms))?;

        if rooms_expired > 0 || messages_purged > 0 {
            log::info!("Sweep: expired {rooms_expired} rooms, purged {messages_purged} messages");
        }
        Ok(SweepReport {
            rooms_expired,
            messages_purged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ChatMessage, MemoryStore, DEFAULT_CODE, DEFAULT_LANGUAGE};

    fn registry() -> (Arc<MemoryStore>, RoomRegistry) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), RoomRegistry::new(store))
    }

    #[test]
    fn test_open_seeds_defaults() {
        let (_, registry) = registry();
        let room = registry.open("r1", 1000).unwrap();
        assert_eq!(room.code, DEFAULT_CODE);
        assert_eq!(room.language, DEFAULT_LANGUAGE);
        assert_eq!(room.version, 0);
        assert!(room.participants.is_empty());
    }

    #[test]
    fn test_open_returns_existing() {
        let (_, registry) = registry();
        let mut room = registry.open("r1", 1000).unwrap();
        room.code = "print(1)".into();
        room.version = 1;
        registry.update(&room).unwrap();

        let reopened = registry.open("r1", 2000).unwrap();
        assert_eq!(reopened.code, "print(1)");
        assert_eq!(reopened.version, 1);
        // First creation wins; a later open never resets timestamps.
        assert_eq!(reopened.created_at, 1000);
    }

    #[test]
    fn test_sweep_expires_only_idle_rooms() {
        let (_, registry) = registry();
        registry.open("idle", 1000).unwrap();
        registry.open("busy", 1000).unwrap();

        let mut busy = registry.open("busy", 1000).unwrap();
        busy.last_activity = 50_000;
        registry.update(&busy).unwrap();

        let report = registry.sweep(60_000, 10_000, u64::MAX).unwrap();
        assert_eq!(report.rooms_expired, 1);
        assert!(registry.store().get_room("idle").unwrap().is_none());
        assert!(registry.store().get_room("busy").unwrap().is_some());
    }

    #[test]
    fn test_sweep_purges_old_chat() {
        let (store, registry) = registry();
        for ts in [100u64, 5000] {
            store
                .append_message(&ChatMessage {
                    room_id: "r1".into(),
                    username: "alice".into(),
                    text: "x".into(),
                    timestamp: ts,
                })
                .unwrap();
        }

        let report = registry.sweep(6000, u64::MAX, 2000).unwrap();
        assert_eq!(report.messages_purged, 1);
        let left = store.recent_messages("r1", 100).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].timestamp, 5000);
    }

    #[test]
    fn test_sweep_noop_when_nothing_expired() {
        let (_, registry) = registry();
        registry.open("r1", 1000).unwrap();
        let report = registry.sweep(1500, 10_000, 10_000).unwrap();
        assert_eq!(report, SweepReport::default());
    }
}
