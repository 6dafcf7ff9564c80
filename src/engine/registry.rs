//! RoomRegistry (spec.md §2, §4.3): owns `Room` aggregates in memory.
//!
//! Grounded on `sharify/room_manager.rs`: a plain struct guarded by a single
//! `Arc<RwLock<RoomRegistry>>` at the call sites (handlers acquire a write
//! guard, mutate, `drop` it, then publish — see SPEC_FULL.md §F.1 for why a
//! single lock rather than a per-room task satisfies spec.md §5).

use std::collections::HashMap;

use serde::Serialize;

use super::room::{Room, RoomError, RoomId, RoomKind, RoomVisibility, UserId};

#[derive(Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomId, Room>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RoomSummary {
    pub id: RoomId,
    pub name: String,
    pub kind: RoomKind,
    pub visibility: RoomVisibility,
    pub user_count: usize,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_room(
        &mut self,
        owner_id: UserId,
        owner_username: String,
        name: String,
        description: Option<String>,
        kind: RoomKind,
        visibility: RoomVisibility,
        hidden: bool,
        default_bpm: u32,
    ) -> Room {
        let id = uuid::Uuid::now_v7();
        let room = Room::new(
            id,
            owner_id,
            owner_username,
            name,
            description,
            kind,
            visibility,
            hidden,
            default_bpm,
        );

        self.rooms.insert(id, room.clone());

        debug!("[{}] room '{}' created", id, room.name);

        room
    }

    pub fn get_room(&self, id: &RoomId) -> Option<&Room> {
        self.rooms.get(id)
    }

    pub fn get_room_mut(&mut self, id: &RoomId) -> Option<&mut Room> {
        self.rooms.get_mut(id)
    }

    pub fn remove_room(&mut self, id: &RoomId) -> Option<Room> {
        self.rooms.remove(id)
    }

    pub fn room_exists(&self, id: &RoomId) -> bool {
        self.rooms.contains_key(id)
    }

    /// Snapshot read for the lobby listing (spec.md §5 "cross-room
    /// operations: rare... read a snapshot"). Hidden rooms never appear.
    pub fn list_public_rooms(&self) -> Vec<RoomSummary> {
        self.rooms
            .values()
            .filter(|r| !r.hidden && matches!(r.visibility, RoomVisibility::Public))
            .map(|r| RoomSummary {
                id: r.id,
                name: r.name.clone(),
                kind: r.kind,
                visibility: r.visibility,
                user_count: r.users.len(),
            })
            .collect()
    }

    /// Rooms with zero users and no grace period references get garbage
    /// collected (spec.md §4.3); the caller checks `GracePeriodRegistry`
    /// before calling this.
    pub fn gc_candidates(&self) -> Vec<RoomId> {
        self.rooms
            .values()
            .filter(|r| r.is_empty())
            .map(|r| r.id)
            .collect()
    }

    pub fn owner_of(&self, id: &RoomId) -> Result<UserId, RoomError> {
        self.get_room(id)
            .map(|r| r.owner.clone())
            .ok_or(RoomError::RoomNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_room_inserts_owner_as_room_owner() {
        let mut registry = RoomRegistry::new();
        let room = registry.create_room(
            "owner".into(),
            "Alice".into(),
            "Jam".into(),
            None,
            RoomKind::Perform,
            RoomVisibility::Public,
            false,
            120,
        );

        assert!(room.owner_invariant_holds());
        assert_eq!(room.users.len(), 1);
        assert!(registry.room_exists(&room.id));
    }

    #[test]
    fn hidden_rooms_excluded_from_lobby_listing() {
        let mut registry = RoomRegistry::new();
        registry.create_room(
            "owner".into(),
            "Alice".into(),
            "Visible".into(),
            None,
            RoomKind::Perform,
            RoomVisibility::Public,
            false,
            120,
        );
        registry.create_room(
            "owner2".into(),
            "Bob".into(),
            "Hidden".into(),
            None,
            RoomKind::Perform,
            RoomVisibility::Public,
            true,
            120,
        );
        registry.create_room(
            "owner3".into(),
            "Carl".into(),
            "Private".into(),
            None,
            RoomKind::Perform,
            RoomVisibility::Private,
            false,
            120,
        );

        let listing = registry.list_public_rooms();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "Visible");
    }

    #[test]
    fn gc_candidates_lists_only_empty_rooms() {
        let mut registry = RoomRegistry::new();
        let room = registry.create_room(
            "owner".into(),
            "Alice".into(),
            "Jam".into(),
            None,
            RoomKind::Perform,
            RoomVisibility::Public,
            false,
            120,
        );

        assert!(registry.gc_candidates().is_empty());

        registry.get_room_mut(&room.id).unwrap().users.clear();
        assert_eq!(registry.gc_candidates(), vec![room.id]);
    }
}
