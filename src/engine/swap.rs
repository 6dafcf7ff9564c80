//! InstrumentSwapHandler (spec.md §4.5): two-party atomic instrument swap.
//!
//! Grounded on the same single-pending-request shape as
//! `ApprovalSessionManager` (one outstanding request per target user), but
//! keyed only by the target since a swap request is between exactly two
//! parties rather than a room-wide queue.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::bus::SharedEventBus;
use super::messages::ServerEvent;
use super::registry::RoomRegistry;
use super::room::{Room, RoomError, RoomId, UserId, UserRole};

#[derive(Clone)]
struct SwapRequest {
    requester_id: UserId,
}

/// One outstanding swap request per `(roomId, targetUserId)`. A user can be
/// the target of at most one pending request at a time (spec.md §4.5
/// "Concurrent requests to the same target: second request rejected").
#[derive(Default)]
pub struct InstrumentSwapHandler {
    pending: RwLock<HashMap<(RoomId, UserId), SwapRequest>>,
}

impl InstrumentSwapHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn request(
        &self,
        registry: &Arc<RwLock<RoomRegistry>>,
        bus: &SharedEventBus,
        room_id: RoomId,
        requester_id: UserId,
        target_id: UserId,
    ) -> Result<(), RoomError> {
        if requester_id == target_id {
            return Err(RoomError::Unauthorized);
        }

        {
            let guard = registry.read().await;
            let room = guard.get_room(&room_id).ok_or(RoomError::RoomNotFound)?;
            let requester = room.get_user(&requester_id).ok_or(RoomError::RoomUserNotFound)?;
            let target = room.get_user(&target_id).ok_or(RoomError::RoomUserNotFound)?;
            // spec.md §4.5: "rejected if requester or target are `audience`".
            if requester.role == UserRole::Audience || target.role == UserRole::Audience {
                return Err(RoomError::Unauthorized);
            }
        }

        let key = (room_id, target_id.clone());
        {
            let mut pending = self.pending.write().await;
            if pending.contains_key(&key) {
                return Err(RoomError::UserAlreadyPending);
            }
            pending.insert(
                key,
                SwapRequest {
                    requester_id: requester_id.clone(),
                },
            );
        }

        let namespace = Room::namespace_path(&room_id);
        bus.publish(
            &namespace,
            ServerEvent::SwapRequestSent {
                target_user_id: target_id,
            },
        )
        .await;
        bus.publish(
            &namespace,
            ServerEvent::SwapRequestReceived { requester_id },
        )
        .await;

        Ok(())
    }

    /// Performs the swap and broadcasts `swap_completed`, then per-party
    /// `instrument_changed`, then `synth_params_changed` where applicable
    /// (spec.md §4.5 "Broadcast order").
    pub async fn approve(
        &self,
        registry: &Arc<RwLock<RoomRegistry>>,
        bus: &SharedEventBus,
        room_id: RoomId,
        target_id: UserId,
        requester_id: UserId,
    ) -> Result<(), RoomError> {
        let key = (room_id, target_id.clone());
        {
            let mut pending = self.pending.write().await;
            match pending.remove(&key) {
                Some(r) if r.requester_id == requester_id => {}
                Some(r) => {
                    // Wrong approver for this pending request: put it back.
                    pending.insert(key, r);
                    return Err(RoomError::Unauthorized);
                }
                None => return Ok(()),
            }
        }

        let namespace = Room::namespace_path(&room_id);

        let swapped = {
            let mut guard = registry.write().await;
            let room = guard.get_room_mut(&room_id).ok_or(RoomError::RoomNotFound)?;

            let a = room
                .get_user(&requester_id)
                .ok_or(RoomError::RoomUserNotFound)?
                .clone();
            let b = room
                .get_user(&target_id)
                .ok_or(RoomError::RoomUserNotFound)?
                .clone();

            // spec.md §4.5: "Precondition: both have defined instrument and
            // category -- else abort with `swap_error` to both parties and
            // clear the mapping." The mapping is already cleared above.
            if a.current_instrument.is_none()
                || a.current_category.is_none()
                || b.current_instrument.is_none()
                || b.current_category.is_none()
            {
                None
            } else {
                {
                    let user_a = room.get_user_mut(&requester_id).unwrap();
                    user_a.current_instrument = b.current_instrument.clone();
                    user_a.current_category = b.current_category.clone();
                    // Carryover is per-recipient on the *new* category: A's new
                    // category came from B, so A adopts B's params when B was a
                    // synthesizer, else A's params are cleared (spec.md §4.5).
                    if b.is_synthesizer() && b.synth_params.is_some() {
                        user_a.synth_params = b.synth_params.clone();
                    } else {
                        user_a.synth_params = None;
                    }
                }
                {
                    let user_b = room.get_user_mut(&target_id).unwrap();
                    user_b.current_instrument = a.current_instrument.clone();
                    user_b.current_category = a.current_category.clone();
                    if a.is_synthesizer() && a.synth_params.is_some() {
                        user_b.synth_params = a.synth_params.clone();
                    } else {
                        user_b.synth_params = None;
                    }
                }

                let updated_a = room.get_user(&requester_id).unwrap().clone();
                let updated_b = room.get_user(&target_id).unwrap().clone();

                Some((
                    updated_a.current_instrument.clone().unwrap_or_default(),
                    updated_a.current_category.clone().unwrap_or_default(),
                    updated_a.synth_params.clone(),
                    updated_b.current_instrument.clone().unwrap_or_default(),
                    updated_b.current_category.clone().unwrap_or_default(),
                    updated_b.synth_params.clone(),
                ))
            }
        };

        let Some((a_instrument, a_category, a_synth, b_instrument, b_category, b_synth)) = swapped
        else {
            let message = "both parties must have an instrument and category selected to swap";
            bus.publish(
                &namespace,
                ServerEvent::SwapError {
                    message: message.into(),
                },
            )
            .await;
            return Ok(());
        };

        bus.publish(
            &namespace,
            ServerEvent::SwapCompleted {
                user_a: requester_id.clone(),
                user_b: target_id.clone(),
            },
        )
        .await;

        bus.publish(
            &namespace,
            ServerEvent::InstrumentChanged {
                user_id: requester_id.clone(),
                instrument: a_instrument,
                category: a_category,
            },
        )
        .await;
        bus.publish(
            &namespace,
            ServerEvent::InstrumentChanged {
                user_id: target_id.clone(),
                instrument: b_instrument,
                category: b_category,
            },
        )
        .await;

        if let Some(params) = a_synth {
            bus.publish(
                &namespace,
                ServerEvent::SynthParamsChanged {
                    user_id: requester_id,
                    params,
                },
            )
            .await;
        }
        if let Some(params) = b_synth {
            bus.publish(
                &namespace,
                ServerEvent::SynthParamsChanged {
                    user_id: target_id,
                    params,
                },
            )
            .await;
        }

        Ok(())
    }

    pub async fn reject(
        &self,
        bus: &SharedEventBus,
        room_id: RoomId,
        target_id: UserId,
        requester_id: UserId,
    ) -> Result<(), RoomError> {
        let key = (room_id, target_id.clone());
        {
            let mut pending = self.pending.write().await;
            match pending.remove(&key) {
                Some(r) if r.requester_id == requester_id => {}
                Some(r) => {
                    pending.insert(key, r);
                    return Err(RoomError::Unauthorized);
                }
                None => return Ok(()),
            }
        }

        bus.publish(
            &Room::namespace_path(&room_id),
            ServerEvent::SwapRejected {
                by_user_id: target_id,
            },
        )
        .await;

        Ok(())
    }

    /// Cancellable only by the original requester.
    pub async fn cancel(
        &self,
        bus: &SharedEventBus,
        room_id: RoomId,
        requester_id: UserId,
    ) -> Result<(), RoomError> {
        let mut pending = self.pending.write().await;
        let key = pending
            .iter()
            .find(|(k, v)| k.0 == room_id && v.requester_id == requester_id)
            .map(|(k, _)| k.clone());

        let Some(key) = key else {
            return Ok(());
        };
        pending.remove(&key);
        drop(pending);

        bus.publish(&Room::namespace_path(&room_id), ServerEvent::SwapCancelled)
            .await;

        Ok(())
    }

    /// A disconnecting party cancels or rejects anything it was party to.
    pub async fn on_disconnect(&self, bus: &SharedEventBus, room_id: RoomId, user_id: UserId) {
        let mut pending = self.pending.write().await;
        let keys: Vec<(RoomId, UserId)> = pending
            .iter()
            .filter(|(k, v)| k.0 == room_id && (k.1 == user_id || v.requester_id == user_id))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            pending.remove(&key);
        }
        drop(pending);

        bus.publish(&Room::namespace_path(&room_id), ServerEvent::SwapCancelled)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bus::EventBus;
    use crate::engine::room::{RoomKind, RoomVisibility, UserRole};

    async fn setup() -> (InstrumentSwapHandler, Arc<RwLock<RoomRegistry>>, SharedEventBus, RoomId) {
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
            .insert("b".into(), super::super::room::User::new("b".into(), "Bob".into(), UserRole::BandMember));

        let handler = InstrumentSwapHandler::new();
        let bus: SharedEventBus = Arc::new(EventBus::new());
        bus.create_namespace(&Room::namespace_path(&room_id)).await;

        (handler, Arc::new(RwLock::new(registry)), bus, room_id)
    }

    #[tokio::test]
    async fn approve_swaps_instruments() {
        let (handler, registry, bus, room_id) = setup().await;

        {
            let mut guard = registry.write().await;
            let room = guard.get_room_mut(&room_id).unwrap();
            let user_a = room.get_user_mut(&"a".to_string()).unwrap();
            user_a.current_instrument = Some("guitar".into());
            user_a.current_category = Some("string".into());
            let user_b = room.get_user_mut(&"b".to_string()).unwrap();
            user_b.current_instrument = Some("drums".into());
            user_b.current_category = Some("percussion".into());
        }

        handler
            .request(&registry, &bus, room_id, "a".into(), "b".into())
            .await
            .unwrap();
        handler
            .approve(&registry, &bus, room_id, "b".into(), "a".into())
            .await
            .unwrap();

        let guard = registry.read().await;
        let room = guard.get_room(&room_id).unwrap();
        assert_eq!(room.get_user(&"a".to_string()).unwrap().current_instrument.as_deref(), Some("drums"));
        assert_eq!(room.get_user(&"b".to_string()).unwrap().current_instrument.as_deref(), Some("guitar"));
    }

    #[tokio::test]
    async fn second_request_to_same_target_rejected() {
        let (handler, registry, bus, room_id) = setup().await;
        registry
            .write()
            .await
            .get_room_mut(&room_id)
            .unwrap()
            .users
            .insert("c".into(), super::super::room::User::new("c".into(), "Carl".into(), UserRole::BandMember));

        handler
            .request(&registry, &bus, room_id, "a".into(), "b".into())
            .await
            .unwrap();
        let err = handler
            .request(&registry, &bus, room_id, "c".into(), "b".into())
            .await
            .unwrap_err();
        assert_eq!(err, RoomError::UserAlreadyPending);
    }

    #[tokio::test]
    async fn audience_cannot_request_or_be_targeted() {
        let (handler, registry, bus, room_id) = setup().await;
        registry
            .write()
            .await
            .get_room_mut(&room_id)
            .unwrap()
            .users
            .insert("c".into(), super::super::room::User::new("c".into(), "Carl".into(), UserRole::Audience));

        let err = handler
            .request(&registry, &bus, room_id, "c".into(), "b".into())
            .await
            .unwrap_err();
        assert_eq!(err, RoomError::Unauthorized);

        let err = handler
            .request(&registry, &bus, room_id, "a".into(), "c".into())
            .await
            .unwrap_err();
        assert_eq!(err, RoomError::Unauthorized);
    }

    #[tokio::test]
    async fn approve_aborts_when_instrument_or_category_missing() {
        let (handler, registry, bus, room_id) = setup().await;
        // Neither "a" nor "b" has an instrument/category set by default.
        let mut rx = bus.subscribe(&Room::namespace_path(&room_id), uuid::Uuid::new_v4(), 16).await;

        handler
            .request(&registry, &bus, room_id, "a".into(), "b".into())
            .await
            .unwrap();
        handler
            .approve(&registry, &bus, room_id, "b".into(), "a".into())
            .await
            .unwrap();

        let event = rx.try_recv().expect("swap_error not published");
        assert!(matches!(event, ServerEvent::SwapError { .. }));

        let guard = registry.read().await;
        let room = guard.get_room(&room_id).unwrap();
        assert!(room.get_user(&"a".to_string()).unwrap().current_instrument.is_none());
    }

    #[tokio::test]
    async fn approve_adopts_new_category_synth_params() {
        let (handler, registry, bus, room_id) = setup().await;

        {
            let mut guard = registry.write().await;
            let room = guard.get_room_mut(&room_id).unwrap();
            let user_a = room.get_user_mut(&"a".to_string()).unwrap();
            user_a.current_instrument = Some("piano".into());
            user_a.current_category = Some("keyboard".into());
            let user_b = room.get_user_mut(&"b".to_string()).unwrap();
            user_b.current_instrument = Some("analog_lead".into());
            user_b.current_category = Some("synthesizer".into());
            user_b.synth_params = Some(serde_json::json!({ "cutoff": 0.3 }));
        }

        handler
            .request(&registry, &bus, room_id, "a".into(), "b".into())
            .await
            .unwrap();
        handler
            .approve(&registry, &bus, room_id, "b".into(), "a".into())
            .await
            .unwrap();

        let guard = registry.read().await;
        let room = guard.get_room(&room_id).unwrap();
        let user_a = room.get_user(&"a".to_string()).unwrap();
        assert_eq!(user_a.current_category.as_deref(), Some("synthesizer"));
        assert_eq!(user_a.synth_params, Some(serde_json::json!({ "cutoff": 0.3 })));
        let user_b = room.get_user(&"b".to_string()).unwrap();
        assert_eq!(user_b.current_category.as_deref(), Some("keyboard"));
        assert!(user_b.synth_params.is_none());
    }
}
