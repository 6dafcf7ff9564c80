//! RoomLifecycleHandler (spec.md §4.3): create/join/leave/kick/transfer/GC.
//!
//! The orchestration point that ties `RoomRegistry`, `EventBus`,
//! `SessionRegistry`, `GracePeriodRegistry`, `MetronomeScheduler` and
//! `ApprovalWorkflowHandler` together. Grounded on `sharify/room_manager.rs`
//! for the create/join/leave shape, generalized with the grace-period
//! reconnect and approval-gated private join paths the original teacher
//! room manager doesn't have.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use super::approval::ApprovalWorkflowHandler;
use super::batcher::NoteBatcher;
use super::bus::{ConnectionId, SharedEventBus};
use super::grace::GracePeriodRegistry;
use super::messages::ServerEvent;
use super::metronome::MetronomeScheduler;
use super::registry::RoomRegistry;
use super::room::{Room, RoomError, RoomId, RoomKind, RoomVisibility, User, UserId, UserRole, LOBBY_NAMESPACE};
use super::session::SessionRegistry;

pub enum JoinOutcome {
    Joined { room_snapshot: serde_json::Value },
    PendingApproval,
}

pub struct RoomLifecycleHandler {
    pub registry: Arc<RwLock<RoomRegistry>>,
    pub bus: SharedEventBus,
    pub sessions: Arc<SessionRegistry>,
    pub grace: Arc<GracePeriodRegistry>,
    pub metronome: Arc<MetronomeScheduler>,
    pub approvals: Arc<ApprovalWorkflowHandler>,
    pub batcher: Arc<NoteBatcher>,
    pub grace_period: Duration,
    pub batch_interval: Duration,
}

impl RoomLifecycleHandler {
    #[allow(clippy::too_many_arguments)]
    pub async fn create_room(
        &self,
        conn: ConnectionId,
        owner_id: UserId,
        owner_username: String,
        name: String,
        description: Option<String>,
        kind: RoomKind,
        visibility: RoomVisibility,
        hidden: bool,
        default_bpm: u32,
    ) -> Result<Room, RoomError> {
        let room = {
            let mut guard = self.registry.write().await;
            guard.create_room(
                owner_id.clone(),
                owner_username,
                name.clone(),
                description,
                kind,
                visibility,
                hidden,
                default_bpm,
            )
        };

        self.bus.create_namespace(&Room::namespace_path(&room.id)).await;
        self.bus
            .create_namespace(&Room::approval_namespace_path(&room.id))
            .await;

        self.sessions
            .attach(conn, room.id, owner_id, Room::namespace_path(&room.id))
            .await;

        self.metronome
            .start(room.id, room.metronome.bpm, Arc::clone(&self.bus), Arc::clone(&self.registry))
            .await;
        self.batcher
            .start(room.id, Room::namespace_path(&room.id), Arc::clone(&self.bus), self.batch_interval)
            .await;

        if visibility == RoomVisibility::Public && !hidden {
            self.bus
                .publish(
                    LOBBY_NAMESPACE,
                    ServerEvent::RoomCreated {
                        room_id: room.id,
                        name,
                    },
                )
                .await;
        }

        Ok(room)
    }

    /// Handles `join_room`: a grace-period reconnect takes priority over a
    /// fresh join; a fresh join to a public room is immediate, a fresh join
    /// to a private room is delegated to the approval workflow (spec.md
    /// §4.3 step 3).
    pub async fn join_room(
        &self,
        conn: ConnectionId,
        room_id: RoomId,
        user_id: UserId,
        username: String,
        requested_role: Option<UserRole>,
    ) -> Result<JoinOutcome, RoomError> {
        if let Some(entry) = self.grace.take(room_id, &user_id).await {
            let mut guard = self.registry.write().await;
            let room = guard.get_room_mut(&room_id).ok_or(RoomError::RoomNotFound)?;
            room.users.insert(user_id.clone(), entry.user_snapshot);
            drop(guard);

            let previous = self
                .sessions
                .attach(conn, room_id, user_id.clone(), entry.namespace_path.clone())
                .await;
            self.evict_stale_connection(&entry.namespace_path, previous).await;

            let snapshot = self.room_snapshot(room_id).await?;
            self.bus
                .publish(
                    &entry.namespace_path,
                    ServerEvent::UserJoined {
                        user_id,
                        username,
                        role: requested_role.unwrap_or(UserRole::BandMember),
                    },
                )
                .await;

            return Ok(JoinOutcome::Joined {
                room_snapshot: snapshot,
            });
        }

        let (visibility, already_member) = {
            let guard = self.registry.read().await;
            let room = guard.get_room(&room_id).ok_or(RoomError::RoomNotFound)?;
            (room.visibility, room.users.contains_key(&user_id))
        };

        if already_member {
            return Err(RoomError::UserAlreadyInRoom);
        }

        match visibility {
            RoomVisibility::Public => {
                let role = requested_role.unwrap_or(UserRole::BandMember);
                {
                    let mut guard = self.registry.write().await;
                    let room = guard.get_room_mut(&room_id).ok_or(RoomError::RoomNotFound)?;
                    room.users
                        .insert(user_id.clone(), User::new(user_id.clone(), username.clone(), role));
                }

                let namespace = Room::namespace_path(&room_id);
                let previous = self
                    .sessions
                    .attach(conn, room_id, user_id.clone(), namespace.clone())
                    .await;
                self.evict_stale_connection(&namespace, previous).await;

                let snapshot = self.room_snapshot(room_id).await?;
                self.bus
                    .publish(
                        &namespace,
                        ServerEvent::UserJoined {
                            user_id,
                            username,
                            role,
                        },
                    )
                    .await;

                Ok(JoinOutcome::Joined {
                    room_snapshot: snapshot,
                })
            }
            RoomVisibility::Private => {
                let role = requested_role.unwrap_or(UserRole::BandMember);
                self.approvals
                    .request(conn, room_id, user_id, username, role)
                    .await?;
                Ok(JoinOutcome::PendingApproval)
            }
        }
    }

    /// `intended = true` removes the user outright; `false` (e.g. a socket
    /// drop) starts the grace-period window instead (spec.md §4.3 "Leave vs
    /// disconnect").
    pub async fn leave_room(
        &self,
        conn: ConnectionId,
        room_id: RoomId,
        user_id: UserId,
        intended: bool,
    ) -> Result<(), RoomError> {
        let namespace = Room::namespace_path(&room_id);

        if intended {
            self.remove_member(room_id, &user_id).await?;
            self.bus.unsubscribe(&namespace, conn).await;
            self.sessions.detach(conn).await;

            self.bus
                .publish(
                    &namespace,
                    ServerEvent::UserLeft {
                        user_id,
                        temporary: false,
                    },
                )
                .await;

            self.maybe_gc_room(room_id).await;
        } else {
            let snapshot = {
                let mut guard = self.registry.write().await;
                let room = guard.get_room_mut(&room_id).ok_or(RoomError::RoomNotFound)?;
                room.users.get(&user_id).cloned()
            };

            if let Some(snapshot) = snapshot {
                self.remove_member(room_id, &user_id).await?;
                self.bus.unsubscribe(&namespace, conn).await;
                self.sessions.detach(conn).await;

                let grace = Arc::clone(&self.grace);
                let bus = Arc::clone(&self.bus);
                let gc_room_id = room_id;
                let gc_user_id = user_id.clone();
                let window = self.grace_period;

                // Expiry only announces the permanent departure; reaping the
                // now-possibly-empty room is left to the periodic
                // `gc_sweep`, which already re-checks `GracePeriodRegistry`.
                self.grace
                    .insert(room_id, user_id.clone(), namespace.clone(), snapshot, window, move || {
                        tokio::spawn(async move {
                            tokio::time::sleep(window).await;
                            if grace.expire(gc_room_id, &gc_user_id).await {
                                bus.publish(
                                    &Room::namespace_path(&gc_room_id),
                                    ServerEvent::UserLeft {
                                        user_id: gc_user_id.clone(),
                                        temporary: false,
                                    },
                                )
                                .await;
                            }
                        })
                    })
                    .await;

                self.bus
                    .publish(
                        &namespace,
                        ServerEvent::UserLeft {
                            user_id,
                            temporary: true,
                        },
                    )
                    .await;
            }
        }

        Ok(())
    }

    pub async fn kick_user(
        &self,
        room_id: RoomId,
        actor_id: UserId,
        target_id: UserId,
    ) -> Result<(), RoomError> {
        {
            let guard = self.registry.read().await;
            let room = guard.get_room(&room_id).ok_or(RoomError::RoomNotFound)?;
            if room.owner != actor_id {
                return Err(RoomError::Unauthorized);
            }
            if room.owner == target_id {
                return Err(RoomError::Unauthorized);
            }
        }

        self.remove_member(room_id, &target_id).await?;

        let namespace = Room::namespace_path(&room_id);
        if let Some(target_conn) = self.sessions.conn_by_user(room_id, &target_id).await {
            self.bus.unsubscribe(&namespace, target_conn).await;
            self.sessions.detach(target_conn).await;
        }

        self.bus
            .publish(&namespace, ServerEvent::UserKicked { user_id: target_id })
            .await;

        self.maybe_gc_room(room_id).await;
        Ok(())
    }

    pub async fn transfer_ownership(
        &self,
        room_id: RoomId,
        actor_id: UserId,
        new_owner_id: UserId,
    ) -> Result<(), RoomError> {
        {
            let mut guard = self.registry.write().await;
            let room = guard.get_room_mut(&room_id).ok_or(RoomError::RoomNotFound)?;
            if room.owner != actor_id {
                return Err(RoomError::Unauthorized);
            }
            if !room.users.contains_key(&new_owner_id) {
                return Err(RoomError::RoomUserNotFound);
            }

            if let Some(prev) = room.get_user_mut(&actor_id) {
                prev.role = UserRole::BandMember;
            }
            if let Some(next) = room.get_user_mut(&new_owner_id) {
                next.role = UserRole::RoomOwner;
            }
            room.owner = new_owner_id.clone();
        }

        self.bus
            .publish(
                &Room::namespace_path(&room_id),
                ServerEvent::OwnershipTransferred { new_owner_id },
            )
            .await;

        Ok(())
    }

    /// Reaps empty rooms with no outstanding grace entries (spec.md §4.3
    /// "garbage collection"). Intended to be driven by a periodic sweep
    /// task started from `main.rs`.
    pub async fn gc_sweep(&self) {
        let candidates = self.registry.read().await.gc_candidates();
        for room_id in candidates {
            self.maybe_gc_room(room_id).await;
        }
    }

    async fn maybe_gc_room(&self, room_id: RoomId) {
        if self.grace.has_any_for_room(room_id).await {
            return;
        }

        let is_empty = {
            let guard = self.registry.read().await;
            guard.get_room(&room_id).map(|r| r.is_empty()).unwrap_or(false)
        };

        if !is_empty {
            return;
        }

        self.metronome.stop(room_id).await;
        self.batcher.stop(room_id).await;
        self.bus.destroy_namespace(&Room::namespace_path(&room_id)).await;
        self.bus
            .destroy_namespace(&Room::approval_namespace_path(&room_id))
            .await;
        self.registry.write().await.remove_room(&room_id);

        self.bus
            .publish(LOBBY_NAMESPACE, ServerEvent::RoomRemoved { room_id })
            .await;
    }

    /// Drops a connection displaced by a newer `attach` for the same
    /// (room, user) pair from the bus, per spec.md §4.2: "any prior
    /// connection for the same (roomId, userId) is detached". The displaced
    /// socket's own read loop notices on its next send and exits.
    async fn evict_stale_connection(&self, namespace: &str, previous: Option<ConnectionId>) {
        if let Some(prev_conn) = previous {
            self.bus.unsubscribe(namespace, prev_conn).await;
        }
    }

    async fn remove_member(&self, room_id: RoomId, user_id: &UserId) -> Result<(), RoomError> {
        let mut guard = self.registry.write().await;
        let room = guard.get_room_mut(&room_id).ok_or(RoomError::RoomNotFound)?;
        room.users.remove(user_id);
        room.voice_participants.remove(user_id);
        Ok(())
    }

    async fn room_snapshot(&self, room_id: RoomId) -> Result<serde_json::Value, RoomError> {
        let guard = self.registry.read().await;
        let room = guard.get_room(&room_id).ok_or(RoomError::RoomNotFound)?;
        serde_json::to_value(room).map_err(|_| RoomError::RoomCreationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bus::EventBus;
    use crate::engine::registry::RoomRegistry;

    fn handler() -> RoomLifecycleHandler {
        let registry = Arc::new(RwLock::new(RoomRegistry::new()));
        let bus: SharedEventBus = Arc::new(EventBus::new());
        let sessions = Arc::new(SessionRegistry::new());
        let grace = Arc::new(GracePeriodRegistry::new());
        let metronome = Arc::new(MetronomeScheduler::new());
        let approvals = Arc::new(ApprovalWorkflowHandler {
            registry: Arc::clone(&registry),
            bus: Arc::clone(&bus),
            sessions: Arc::clone(&sessions),
            approvals: Arc::new(super::super::approval::ApprovalSessionManager::new()),
            timeout: Duration::from_millis(30_000),
        });

        RoomLifecycleHandler {
            registry,
            bus,
            sessions,
            grace,
            metronome,
            approvals,
            batcher: Arc::new(super::batcher::NoteBatcher::new()),
            grace_period: Duration::from_millis(30_000),
            batch_interval: Duration::from_millis(16),
        }
    }

    #[tokio::test]
    async fn create_then_join_public_room() {
        let handler = handler();
        let owner_conn = ConnectionId::new_v4();

        let room = handler
            .create_room(
                owner_conn,
                "owner".into(),
                "Owner".into(),
                "Jam".into(),
                None,
                RoomKind::Perform,
                RoomVisibility::Public,
                false,
                120,
            )
            .await
            .unwrap();

        let joiner_conn = ConnectionId::new_v4();
        let outcome = handler
            .join_room(joiner_conn, room.id, "joiner".into(), "Joiner".into(), None)
            .await
            .unwrap();

        assert!(matches!(outcome, JoinOutcome::Joined { .. }));

        let guard = handler.registry.read().await;
        assert_eq!(guard.get_room(&room.id).unwrap().users.len(), 2);
    }

    #[tokio::test]
    async fn private_room_join_requires_approval() {
        let handler = handler();
        let owner_conn = ConnectionId::new_v4();

        let room = handler
            .create_room(
                owner_conn,
                "owner".into(),
                "Owner".into(),
                "Jam".into(),
                None,
                RoomKind::Perform,
                RoomVisibility::Private,
                false,
                120,
            )
            .await
            .unwrap();

        let joiner_conn = ConnectionId::new_v4();
        let outcome = handler
            .join_room(joiner_conn, room.id, "joiner".into(), "Joiner".into(), None)
            .await
            .unwrap();

        assert!(matches!(outcome, JoinOutcome::PendingApproval));
    }

    #[tokio::test]
    async fn kick_requires_owner_and_cannot_target_owner() {
        let handler = handler();
        let owner_conn = ConnectionId::new_v4();
        let room = handler
            .create_room(
                owner_conn,
                "owner".into(),
                "Owner".into(),
                "Jam".into(),
                None,
                RoomKind::Perform,
                RoomVisibility::Public,
                false,
                120,
            )
            .await
            .unwrap();

        let err = handler
            .kick_user(room.id, "owner".into(), "owner".into())
            .await
            .unwrap_err();
        assert_eq!(err, RoomError::Unauthorized);
    }
}
