//! Presence primitives: display colors and roster mutation.
//!
//! The lifecycle per participant is `absent → joining → active`; a later join
//! under the same username evicts the previous active entry while the new one
//! becomes active, and an explicit disconnect walks `active → leaving →
//! absent`. Both transitions are expressed here as pure mutations on a
//! roster; the server persists the result and rebroadcasts the full roster.
//!
//! Joins replace by **username** (so a refresh/reconnect never duplicates a
//! user), removals match by **connection id** (so a close event from a stale
//! connection whose username was already re-claimed is a safe no-op).

use rand::seq::SliceRandom;
use uuid::Uuid;

use crate::protocol::ParticipantInfo;
use crate::storage::Participant;

/// Fixed display palette. Collisions between participants are permitted;
/// colors are cosmetic only.
pub const COLOR_PALETTE: [&str; 6] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#FFA07A", "#98D8C8", "#F7DC6F",
];

/// Pick a display color uniformly at random from the palette.
pub fn pick_color() -> &'static str {
    COLOR_PALETTE
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(COLOR_PALETTE[0])
}

/// Build a participant record for a joining connection.
pub fn new_participant(connection_id: Uuid, username: impl Into<String>, now: u64) -> Participant {
    Participant {
        connection_id,
        username: username.into(),
        color: pick_color().to_string(),
        joined_at: now,
    }
}

/// Admit `entrant` to the roster, evicting any existing entry that shares its
/// username. Returns the evicted entry, if there was one.
pub fn admit(roster: &mut Vec<Participant>, entrant: Participant) -> Option<Participant> {
    let evicted = roster
        .iter()
        .position(|p| p.username == entrant.username)
        .map(|i| roster.remove(i));
    roster.push(entrant);
    evicted
}

/// Remove the entry owned by `connection_id`, if present.
pub fn remove_connection(roster: &mut Vec<Participant>, connection_id: Uuid) -> Option<Participant> {
    roster
        .iter()
        .position(|p| p.connection_id == connection_id)
        .map(|i| roster.remove(i))
}

/// The roster as sent to clients.
pub fn roster_view(roster: &[Participant]) -> Vec<ParticipantInfo> {
    roster
        .iter()
        .map(|p| ParticipantInfo {
            id: p.connection_id,
            username: p.username.clone(),
            color: p.color.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(username: &str) -> Participant {
        new_participant(Uuid::new_v4(), username, 1000)
    }

    #[test]
    fn test_pick_color_from_palette() {
        for _ in 0..50 {
            assert!(COLOR_PALETTE.contains(&pick_color()));
        }
    }

    #[test]
    fn test_distinct_usernames_grow_roster() {
        let mut roster = Vec::new();
        for name in ["alice", "bob", "carol"] {
            assert!(admit(&mut roster, participant(name)).is_none());
        }
        assert_eq!(roster.len(), 3);

        let mut usernames: Vec<&str> = roster.iter().map(|p| p.username.as_str()).collect();
        usernames.sort();
        usernames.dedup();
        assert_eq!(usernames.len(), 3);
    }

    #[test]
    fn test_rejoin_replaces_entry() {
        let mut roster = Vec::new();
        admit(&mut roster, participant("alice"));
        admit(&mut roster, participant("bob"));

        let old_connection = roster[0].connection_id;
        let rejoined = participant("alice");
        let new_connection = rejoined.connection_id;

        let evicted = admit(&mut roster, rejoined).unwrap();
        assert_eq!(evicted.connection_id, old_connection);

        // Roster size unchanged, connection id updated.
        assert_eq!(roster.len(), 2);
        let alice = roster.iter().find(|p| p.username == "alice").unwrap();
        assert_eq!(alice.connection_id, new_connection);
    }

    #[test]
    fn test_remove_by_connection_id() {
        let mut roster = Vec::new();
        let alice = participant("alice");
        let alice_connection = alice.connection_id;
        admit(&mut roster, alice);
        admit(&mut roster, participant("bob"));

        let removed = remove_connection(&mut roster, alice_connection).unwrap();
        assert_eq!(removed.username, "alice");
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].username, "bob");
    }

    #[test]
    fn test_stale_removal_is_noop() {
        let mut roster = Vec::new();
        admit(&mut roster, participant("alice"));
        let stale_connection = roster[0].connection_id;

        // Reconnect replaces alice's entry under a new connection id...
        admit(&mut roster, participant("alice"));

        // ...so the old connection's close must not touch the roster.
        assert!(remove_connection(&mut roster, stale_connection).is_none());
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_roster_view_mirrors_entries() {
        let mut roster = Vec::new();
        admit(&mut roster, participant("alice"));
        admit(&mut roster, participant("bob"));

        let view = roster_view(&roster);
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].username, roster[0].username);
        assert_eq!(view[0].id, roster[0].connection_id);
        assert_eq!(view[1].color, roster[1].color);
    }
}
