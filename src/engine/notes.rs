//! AudioRoutingHandler / NotePlayingHandler (spec.md §4.6).
//!
//! Note events and instrument/synth-param changes fan out through the room
//! namespace. Instrument changes additionally trigger a synth-params
//! handshake between the changing user and the room's existing synthesizer
//! players, mirroring the teacher's `sharify/websocket/commands.rs` pattern
//! of one inbound command producing several outbound broadcasts.

use std::sync::Arc;

use tokio::sync::RwLock;

use super::bus::{ConnectionId, SharedEventBus};
use super::messages::ServerEvent;
use super::registry::RoomRegistry;
use super::room::{Category, Instrument, Room, RoomError, RoomId, UserId};

pub struct NotePlayingHandler;

impl NotePlayingHandler {
    /// `play_note` has no dedicated method: the caller (`ws::instance::dispatch`)
    /// builds the `NotePlayed` event itself so it can hand the same value to
    /// the batcher first and fall back to `bus.publish_except` only if
    /// coalescing doesn't apply.
    pub async fn stop_all_notes(
        bus: &SharedEventBus,
        sender_conn: ConnectionId,
        room_id: RoomId,
        user_id: UserId,
    ) {
        bus.publish_except(
            &Room::namespace_path(&room_id),
            sender_conn,
            ServerEvent::StopAllNotes { user_id },
        )
        .await;
    }

    /// Updates the user's instrument/category, broadcasts the change to the
    /// room, and if the new category is a synthesizer, kicks off the
    /// synth-params handshake (spec.md §4.6 "auto-send to new user").
    ///
    /// Broadcast order matters: listeners may still be decaying notes from
    /// the previous instrument, so `stop_all_notes` goes out first, then
    /// `instrument_changed`, both excluding the sender, then
    /// `room_state_updated` to everyone including the sender (spec.md §4.6).
    pub async fn change_instrument(
        registry: &Arc<RwLock<RoomRegistry>>,
        bus: &SharedEventBus,
        sender_conn: ConnectionId,
        room_id: RoomId,
        user_id: UserId,
        username: String,
        instrument: Instrument,
        category: Category,
    ) -> Result<(), RoomError> {
        let (became_synthesizer, other_synth_ids, saved_params, snapshot) = {
            let mut guard = registry.write().await;
            let room = guard.get_room_mut(&room_id).ok_or(RoomError::RoomNotFound)?;
            let user = room
                .get_user_mut(&user_id)
                .ok_or(RoomError::RoomUserNotFound)?;

            user.current_instrument = Some(instrument.clone());
            user.current_category = Some(category.clone());
            let became_synthesizer = category == "synthesizer";
            let saved_params = user.synth_params.clone();

            let other_synth_ids: Vec<UserId> = room
                .synthesizer_users()
                .into_iter()
                .filter(|u| u.id != user_id)
                .map(|u| u.id.clone())
                .collect();

            let snapshot = serde_json::to_value(&*room).map_err(|_| RoomError::RoomCreationFailed)?;

            (became_synthesizer, other_synth_ids, saved_params, snapshot)
        };

        let namespace = Room::namespace_path(&room_id);
        bus.publish_except(
            &namespace,
            sender_conn,
            ServerEvent::StopAllNotes {
                user_id: user_id.clone(),
            },
        )
        .await;
        bus.publish_except(
            &namespace,
            sender_conn,
            ServerEvent::InstrumentChanged {
                user_id: user_id.clone(),
                instrument,
                category,
            },
        )
        .await;
        bus.publish(&namespace, ServerEvent::RoomStateUpdated { room: snapshot })
            .await;

        if became_synthesizer {
            if let Some(params) = saved_params {
                bus.publish(
                    &namespace,
                    ServerEvent::AutoSendSynthParamsToNewUser {
                        new_user_id: user_id.clone(),
                        new_username: username.clone(),
                    },
                )
                .await;
                bus.publish(
                    &namespace,
                    ServerEvent::SynthParamsChanged {
                        user_id: user_id.clone(),
                        params,
                    },
                )
                .await;
            }

            if !other_synth_ids.is_empty() {
                bus.publish(
                    &namespace,
                    ServerEvent::RequestCurrentSynthParamsForNewUser {
                        new_user_id: user_id,
                        new_username: username,
                    },
                )
                .await;
            }
        }

        Ok(())
    }

    pub async fn update_synth_params(
        registry: &Arc<RwLock<RoomRegistry>>,
        bus: &SharedEventBus,
        room_id: RoomId,
        user_id: UserId,
        params: serde_json::Value,
    ) -> Result<(), RoomError> {
        {
            let mut guard = registry.write().await;
            let room = guard.get_room_mut(&room_id).ok_or(RoomError::RoomNotFound)?;
            let user = room
                .get_user_mut(&user_id)
                .ok_or(RoomError::RoomUserNotFound)?;
            user.synth_params = Some(params.clone());
        }

        bus.publish(
            &Room::namespace_path(&room_id),
            ServerEvent::SynthParamsChanged { user_id, params },
        )
        .await;

        Ok(())
    }

    pub async fn request_synth_params(
        registry: &Arc<RwLock<RoomRegistry>>,
        bus: &SharedEventBus,
        sender_conn: ConnectionId,
        room_id: RoomId,
        target_user_id: UserId,
    ) -> Result<(), RoomError> {
        let params = {
            let guard = registry.read().await;
            let room = guard.get_room(&room_id).ok_or(RoomError::RoomNotFound)?;
            room.get_user(&target_user_id)
                .ok_or(RoomError::RoomUserNotFound)?
                .synth_params
                .clone()
        };

        bus.send_to(
            &Room::namespace_path(&room_id),
            sender_conn,
            ServerEvent::RequestSynthParamsResponse {
                user_id: target_user_id,
                params,
            },
        )
        .await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bus::EventBus;
    use crate::engine::room::{RoomKind, RoomVisibility};

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
        let bus: SharedEventBus = Arc::new(EventBus::new());
        bus.create_namespace(&Room::namespace_path(&room_id)).await;
        (Arc::new(RwLock::new(registry)), bus, room_id)
    }

    #[tokio::test]
    async fn change_instrument_updates_user_state() {
        let (registry, bus, room_id) = setup().await;

        NotePlayingHandler::change_instrument(
            &registry,
            &bus,
            uuid::Uuid::new_v4(),
            room_id,
            "a".into(),
            "Alice".into(),
            "moog".into(),
            "synthesizer".into(),
        )
        .await
        .unwrap();

        let guard = registry.read().await;
        let user = guard.get_room(&room_id).unwrap().get_user(&"a".to_string()).unwrap();
        assert_eq!(user.current_instrument.as_deref(), Some("moog"));
        assert!(user.is_synthesizer());
    }

    #[tokio::test]
    async fn update_synth_params_persists_on_user() {
        let (registry, bus, room_id) = setup().await;
        let params = serde_json::json!({"cutoff": 0.5});

        NotePlayingHandler::update_synth_params(&registry, &bus, room_id, "a".into(), params.clone())
            .await
            .unwrap();

        let guard = registry.read().await;
        let user = guard.get_room(&room_id).unwrap().get_user(&"a".to_string()).unwrap();
        assert_eq!(user.synth_params, Some(params));
    }
}
