//! BroadcastHandler (spec.md §4.9): owner-gated HLS broadcast lifecycle.
//!
//! Delegates the actual transcoding to a `BroadcastTranscoder` collaborator
//! (`crate::collaborators`); this module only gates access, tracks state on
//! the `Room` aggregate, and fans out the lifecycle events.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::collaborators::BroadcastTranscoder;

use super::bus::SharedEventBus;
use super::messages::ServerEvent;
use super::registry::RoomRegistry;
use super::room::{Room, RoomError, RoomId, UserId};

pub struct BroadcastHandler;

impl BroadcastHandler {
    /// Only the room owner may toggle broadcasting (spec.md §4.9).
    pub async fn toggle(
        registry: &Arc<RwLock<RoomRegistry>>,
        bus: &SharedEventBus,
        transcoder: &dyn BroadcastTranscoder,
        room_id: RoomId,
        actor_id: UserId,
        on: bool,
    ) -> Result<(), RoomError> {
        {
            let guard = registry.read().await;
            let room = guard.get_room(&room_id).ok_or(RoomError::RoomNotFound)?;
            if room.owner != actor_id {
                return Err(RoomError::Unauthorized);
            }
            if on && room.broadcast.active {
                return Ok(());
            }
            if !on && !room.broadcast.active {
                return Ok(());
            }
        }

        let namespace = Room::namespace_path(&room_id);

        if on {
            let playlist_url = match transcoder.start(room_id).await {
                Ok(url) => url,
                Err(_) => {
                    bus.publish(
                        &namespace,
                        ServerEvent::BroadcastError {
                            message: "transcoder unavailable".into(),
                        },
                    )
                    .await;
                    return Ok(());
                }
            };

            {
                let mut guard = registry.write().await;
                let room = guard.get_room_mut(&room_id).ok_or(RoomError::RoomNotFound)?;
                room.broadcast.active = true;
                room.broadcast.playlist_url = Some(playlist_url.clone());
            }

            bus.publish(
                &namespace,
                ServerEvent::BroadcastStateChanged {
                    active: true,
                    playlist_url: Some(playlist_url),
                },
            )
            .await;
            bus.publish(
                &namespace,
                ServerEvent::RoomBroadcastChanged {
                    room_id,
                    active: true,
                },
            )
            .await;
        } else {
            let _ = transcoder.stop(room_id).await;

            {
                let mut guard = registry.write().await;
                let room = guard.get_room_mut(&room_id).ok_or(RoomError::RoomNotFound)?;
                room.broadcast.active = false;
                room.broadcast.playlist_url = None;
            }

            bus.publish(
                &namespace,
                ServerEvent::BroadcastStateChanged {
                    active: false,
                    playlist_url: None,
                },
            )
            .await;
            bus.publish(
                &namespace,
                ServerEvent::RoomBroadcastChanged {
                    room_id,
                    active: false,
                },
            )
            .await;
        }

        Ok(())
    }

    pub async fn push_audio_chunk(
        registry: &Arc<RwLock<RoomRegistry>>,
        transcoder: &dyn BroadcastTranscoder,
        room_id: RoomId,
        chunk: Vec<u8>,
    ) -> Result<(), RoomError> {
        let active = {
            let guard = registry.read().await;
            guard
                .get_room(&room_id)
                .ok_or(RoomError::RoomNotFound)?
                .broadcast
                .active
        };

        if active {
            let _ = transcoder.push_audio_chunk(room_id, chunk).await;
        }

        Ok(())
    }

    pub async fn request_state(
        registry: &Arc<RwLock<RoomRegistry>>,
        room_id: RoomId,
    ) -> Result<ServerEvent, RoomError> {
        let guard = registry.read().await;
        let room = guard.get_room(&room_id).ok_or(RoomError::RoomNotFound)?;
        Ok(ServerEvent::BroadcastState {
            active: room.broadcast.active,
            playlist_url: room.broadcast.playlist_url.clone(),
        })
    }

    /// Owner disconnect stops any active broadcast (spec.md §4.9 edge case).
    pub async fn on_owner_disconnect(
        registry: &Arc<RwLock<RoomRegistry>>,
        bus: &SharedEventBus,
        transcoder: &dyn BroadcastTranscoder,
        room_id: RoomId,
        owner_id: UserId,
    ) {
        let _ = Self::toggle(registry, bus, transcoder, room_id, owner_id, false).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::NullBroadcastTranscoder;
    use crate::engine::bus::EventBus;
    use crate::engine::room::{RoomKind, RoomVisibility};

    async fn setup() -> (Arc<RwLock<RoomRegistry>>, SharedEventBus, RoomId) {
        let mut registry = RoomRegistry::new();
        let room = registry.create_room(
            "owner".into(),
            "Owner".into(),
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
    async fn non_owner_cannot_toggle_broadcast() {
        let (registry, bus, room_id) = setup().await;
        let transcoder = NullBroadcastTranscoder;

        let err = BroadcastHandler::toggle(&registry, &bus, &transcoder, room_id, "intruder".into(), true)
            .await
            .unwrap_err();
        assert_eq!(err, RoomError::Unauthorized);
    }

    #[tokio::test]
    async fn owner_toggle_on_then_off_updates_state() {
        let (registry, bus, room_id) = setup().await;
        let transcoder = NullBroadcastTranscoder;

        BroadcastHandler::toggle(&registry, &bus, &transcoder, room_id, "owner".into(), true)
            .await
            .unwrap();

        let guard = registry.read().await;
        assert!(guard.get_room(&room_id).unwrap().broadcast.active);
        drop(guard);

        BroadcastHandler::toggle(&registry, &bus, &transcoder, room_id, "owner".into(), false)
            .await
            .unwrap();

        let guard = registry.read().await;
        assert!(!guard.get_room(&room_id).unwrap().broadcast.active);
    }
}
