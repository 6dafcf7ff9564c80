//! VoiceConnectionHandler (spec.md §4.8): WebRTC signaling relay.
//!
//! The server never inspects SDP/ICE payloads, it only relays them between
//! the two named parties and tracks who has joined the room's voice mesh —
//! the same "opaque payload, server just routes it" shape as the teacher's
//! `discord.rs` webhook relay.

use std::sync::Arc;

use tokio::sync::RwLock;

use super::bus::{ConnectionId, SharedEventBus};
use super::messages::ServerEvent;
use super::registry::RoomRegistry;
use super::room::{Room, RoomError, RoomId, UserId};

pub struct VoiceConnectionHandler;

impl VoiceConnectionHandler {
    pub async fn join(
        registry: &Arc<RwLock<RoomRegistry>>,
        bus: &SharedEventBus,
        sender_conn: ConnectionId,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Vec<UserId>, RoomError> {
        let existing = {
            let mut guard = registry.write().await;
            let room = guard.get_room_mut(&room_id).ok_or(RoomError::RoomNotFound)?;
            room.get_user(&user_id).ok_or(RoomError::RoomUserNotFound)?;

            let existing: Vec<UserId> = room
                .voice_participants
                .iter()
                .filter(|id| **id != user_id)
                .cloned()
                .collect();
            room.voice_participants.insert(user_id.clone());
            existing
        };

        bus.publish_except(
            &Room::namespace_path(&room_id),
            sender_conn,
            ServerEvent::UserJoinedVoice {
                user_id: user_id.clone(),
            },
        )
        .await;

        Ok(existing)
    }

    pub async fn leave(
        registry: &Arc<RwLock<RoomRegistry>>,
        bus: &SharedEventBus,
        sender_conn: ConnectionId,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<(), RoomError> {
        {
            let mut guard = registry.write().await;
            let room = guard.get_room_mut(&room_id).ok_or(RoomError::RoomNotFound)?;
            room.voice_participants.remove(&user_id);
        }

        bus.publish_except(
            &Room::namespace_path(&room_id),
            sender_conn,
            ServerEvent::UserLeftVoice { user_id },
        )
        .await;

        Ok(())
    }

    /// Forwards an offer/answer/ICE candidate to its named target verbatim
    /// (spec.md §4.8 "the server relays the payload without interpreting
    /// it"). No-op if the target isn't connected to the room namespace.
    pub async fn relay_offer(
        bus: &SharedEventBus,
        room_id: RoomId,
        target_conn: ConnectionId,
        from_user_id: UserId,
        sdp: serde_json::Value,
    ) {
        bus.send_to(
            &Room::namespace_path(&room_id),
            target_conn,
            ServerEvent::VoiceOffer { from_user_id, sdp },
        )
        .await;
    }

    pub async fn relay_answer(
        bus: &SharedEventBus,
        room_id: RoomId,
        target_conn: ConnectionId,
        from_user_id: UserId,
        sdp: serde_json::Value,
    ) {
        bus.send_to(
            &Room::namespace_path(&room_id),
            target_conn,
            ServerEvent::VoiceAnswer { from_user_id, sdp },
        )
        .await;
    }

    pub async fn relay_ice_candidate(
        bus: &SharedEventBus,
        room_id: RoomId,
        target_conn: ConnectionId,
        from_user_id: UserId,
        candidate: serde_json::Value,
    ) {
        bus.send_to(
            &Room::namespace_path(&room_id),
            target_conn,
            ServerEvent::VoiceIceCandidate {
                from_user_id,
                candidate,
            },
        )
        .await;
    }

    /// Disconnect while in the voice mesh behaves like an explicit
    /// `leave_voice` (spec.md §4.8 edge case).
    pub async fn on_disconnect(
        registry: &Arc<RwLock<RoomRegistry>>,
        bus: &SharedEventBus,
        sender_conn: ConnectionId,
        room_id: RoomId,
        user_id: UserId,
    ) {
        let was_in_voice = {
            let mut guard = registry.write().await;
            guard
                .get_room_mut(&room_id)
                .map(|room| room.voice_participants.remove(&user_id))
                .unwrap_or(false)
        };

        if was_in_voice {
            bus.publish_except(
                &Room::namespace_path(&room_id),
                sender_conn,
                ServerEvent::UserLeftVoice { user_id },
            )
            .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bus::EventBus;
    use crate::engine::room::{RoomKind, RoomVisibility, User, UserRole};

    async fn setup() -> (Arc<RwLock<RoomRegistry>>, SharedEventBus, RoomId) {
        let mut registry = RoomRegistry::new();
        let room = registry.create_room(
            "a".into(),
            "Alice".into(),
            "Jam".into(),
            None,
            RoomKind::Perform,
            RoomVisibility::Public,
            false,
            120,
        );
        let room_id = room.id;
        registry
            .get_room_mut(&room_id)
            .unwrap()
            .users
            .insert("b".into(), User::new("b".into(), "Bob".into(), UserRole::BandMember));

        let bus: SharedEventBus = Arc::new(EventBus::new());
        bus.create_namespace(&Room::namespace_path(&room_id)).await;

        (Arc::new(RwLock::new(registry)), bus, room_id)
    }

    #[tokio::test]
    async fn join_returns_existing_participants() {
        let (registry, bus, room_id) = setup().await;
        let conn_a = ConnectionId::new_v4();
        let conn_b = ConnectionId::new_v4();

        let first = VoiceConnectionHandler::join(&registry, &bus, conn_a, room_id, "a".into())
            .await
            .unwrap();
        assert!(first.is_empty());

        let second = VoiceConnectionHandler::join(&registry, &bus, conn_b, room_id, "b".into())
            .await
            .unwrap();
        assert_eq!(second, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn disconnect_while_in_voice_emits_leave() {
        let (registry, bus, room_id) = setup().await;
        let conn = ConnectionId::new_v4();

        VoiceConnectionHandler::join(&registry, &bus, conn, room_id, "a".into())
            .await
            .unwrap();

        let guard = registry.read().await;
        assert!(guard.get_room(&room_id).unwrap().voice_participants.contains("a"));
        drop(guard);

        VoiceConnectionHandler::on_disconnect(&registry, &bus, conn, room_id, "a".into()).await;

        let guard = registry.read().await;
        assert!(!guard.get_room(&room_id).unwrap().voice_participants.contains("a"));
    }
}
