//! ApprovalSessionManager + ApprovalWorkflowHandler (spec.md §4.4).
//!
//! The state machine's "lock" is the session record itself: every outcome
//! path (`approve`/`reject`/`cancel`/`timeout`/`disconnect`) removes the
//! session before acting, so whichever path removes it first wins and the
//! loser's callback finds nothing and is a no-op (spec.md §4.4 "Race between
//! timeout and approve/reject").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::bus::{ConnectionId, SharedEventBus};
use super::messages::ServerEvent;
use super::registry::RoomRegistry;
use super::room::{Room, RoomError, RoomId, User, UserId, UserRole};
use super::session::SessionRegistry;

#[derive(Clone)]
pub struct ApprovalSession {
    pub user_id: UserId,
    pub room_id: RoomId,
    pub connection_id: ConnectionId,
    pub username: String,
    pub role: UserRole,
    pub created_at: Instant,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<(RoomId, UserId), ApprovalSession>,
    timers: HashMap<(RoomId, UserId), JoinHandle<()>>,
}

#[derive(Default)]
pub struct ApprovalSessionManager {
    inner: RwLock<Inner>,
}

impl ApprovalSessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    async fn insert(
        &self,
        session: ApprovalSession,
        timer: impl FnOnce() -> JoinHandle<()>,
    ) -> bool {
        let key = (session.room_id, session.user_id.clone());
        let mut inner = self.inner.write().await;
        if inner.sessions.contains_key(&key) {
            return false;
        }
        inner.sessions.insert(key.clone(), session);
        inner.timers.insert(key, timer());
        true
    }

    /// Removes the session, cancelling its timer. This *is* the race lock:
    /// only the first caller for a given key gets `Some`.
    async fn take(&self, room_id: RoomId, user_id: &UserId) -> Option<ApprovalSession> {
        let key = (room_id, user_id.clone());
        let mut inner = self.inner.write().await;
        let session = inner.sessions.remove(&key)?;
        if let Some(timer) = inner.timers.remove(&key) {
            timer.abort();
        }
        Some(session)
    }

    pub async fn contains(&self, room_id: RoomId, user_id: &UserId) -> bool {
        self.inner
            .read()
            .await
            .sessions
            .contains_key(&(room_id, user_id.clone()))
    }
}

/// Stateless coordinator: holds shared handles to the registries it mutates.
/// Constructed fresh per call site (mirrors the teacher's per-command
/// `websocket/commands.rs::Command` struct).
pub struct ApprovalWorkflowHandler {
    pub registry: Arc<RwLock<RoomRegistry>>,
    pub bus: SharedEventBus,
    pub sessions: Arc<SessionRegistry>,
    pub approvals: Arc<ApprovalSessionManager>,
    pub timeout: Duration,
}

impl ApprovalWorkflowHandler {
    /// `approval_request` received on `/approval/{roomId}`.
    pub async fn request(
        &self,
        conn: ConnectionId,
        room_id: RoomId,
        user_id: UserId,
        username: String,
        role: UserRole,
    ) -> Result<(), RoomError> {
        {
            let guard = self.registry.read().await;
            let room = guard.get_room(&room_id).ok_or(RoomError::RoomNotFound)?;
            if room.users.contains_key(&user_id) {
                return Err(RoomError::UserAlreadyInRoom);
            }
            if room.pending_members.contains_key(&user_id) {
                return Err(RoomError::UserAlreadyPending);
            }
        }

        if self.approvals.contains(room_id, &user_id).await {
            return Err(RoomError::UserAlreadyPending);
        }

        {
            let mut guard = self.registry.write().await;
            let room = guard.get_room_mut(&room_id).ok_or(RoomError::RoomNotFound)?;
            room.pending_members.insert(
                user_id.clone(),
                User::new(user_id.clone(), username.clone(), role),
            );
        }

        let session = ApprovalSession {
            user_id: user_id.clone(),
            room_id,
            connection_id: conn,
            username: username.clone(),
            role,
            created_at: Instant::now(),
        };

        let timeout_handler = self.clone_for_timer();
        let timeout_room = room_id;
        let timeout_user = user_id.clone();
        let timeout_dur = self.timeout;

        self.approvals
            .insert(session, move || {
                tokio::spawn(async move {
                    tokio::time::sleep(timeout_dur).await;
                    timeout_handler.fire_timeout(timeout_room, timeout_user).await;
                })
            })
            .await;

        self.bus
            .send_to(
                &Room::approval_namespace_path(&room_id),
                conn,
                ServerEvent::ApprovalPending,
            )
            .await;

        self.bus
            .publish(
                &Room::namespace_path(&room_id),
                ServerEvent::NewMemberRequest {
                    user_id,
                    username,
                    role,
                },
            )
            .await;

        Ok(())
    }

    /// Approve/reject must originate from the room's current owner.
    async fn assert_is_owner(&self, room_id: RoomId, actor: &UserId) -> Result<(), RoomError> {
        let guard = self.registry.read().await;
        let room = guard.get_room(&room_id).ok_or(RoomError::RoomNotFound)?;
        if &room.owner != actor {
            return Err(RoomError::Unauthorized);
        }
        Ok(())
    }

    pub async fn approve(
        &self,
        room_id: RoomId,
        owner_id: UserId,
        requester_id: UserId,
    ) -> Result<(), RoomError> {
        self.assert_is_owner(room_id, &owner_id).await?;

        let Some(session) = self.approvals.take(room_id, &requester_id).await else {
            // Already resolved by a concurrent timeout/cancel; no-op.
            return Ok(());
        };

        {
            let mut guard = self.registry.write().await;
            let room = guard.get_room_mut(&room_id).ok_or(RoomError::RoomNotFound)?;
            if let Some(user) = room.pending_members.remove(&session.user_id) {
                room.users.insert(session.user_id.clone(), user);
            }
        }

        self.bus
            .send_to(
                &Room::approval_namespace_path(&room_id),
                session.connection_id,
                ServerEvent::ApprovalGranted,
            )
            .await;

        self.bus
            .publish(
                &Room::namespace_path(&room_id),
                ServerEvent::UserJoined {
                    user_id: session.user_id.clone(),
                    username: session.username.clone(),
                    role: session.role,
                },
            )
            .await;

        // spec.md §4.4 "approval_success" to the owner, distinct from the
        // `approval_granted` the requester got above.
        if let Some(owner_conn) = self.sessions.conn_by_user(room_id, &owner_id).await {
            self.bus
                .send_to(
                    &Room::namespace_path(&room_id),
                    owner_conn,
                    ServerEvent::ApprovalSuccess {
                        user_id: session.user_id,
                    },
                )
                .await;
        }

        Ok(())
    }

    pub async fn reject(
        &self,
        room_id: RoomId,
        owner_id: UserId,
        requester_id: UserId,
    ) -> Result<(), RoomError> {
        self.assert_is_owner(room_id, &owner_id).await?;

        let Some(session) = self.approvals.take(room_id, &requester_id).await else {
            return Ok(());
        };

        self.remove_pending(room_id, &session.user_id).await;

        self.bus
            .send_to(
                &Room::approval_namespace_path(&room_id),
                session.connection_id,
                ServerEvent::ApprovalRejected,
            )
            .await;

        Ok(())
    }

    /// Accepted only when the cancel message matches the stored session.
    pub async fn cancel(&self, room_id: RoomId, requester_id: UserId) -> Result<(), RoomError> {
        let Some(session) = self.approvals.take(room_id, &requester_id).await else {
            return Ok(());
        };

        self.remove_pending(room_id, &session.user_id).await;

        self.bus
            .send_to(
                &Room::approval_namespace_path(&room_id),
                session.connection_id,
                ServerEvent::ApprovalCancelled,
            )
            .await;

        Ok(())
    }

    /// Disconnect of the requester counts as cancel (spec.md §4.4).
    pub async fn disconnect(&self, room_id: RoomId, requester_id: UserId) {
        let _ = self.cancel(room_id, requester_id).await;
    }

    async fn fire_timeout(&self, room_id: RoomId, user_id: UserId) {
        let Some(session) = self.approvals.take(room_id, &user_id).await else {
            // Already approved/rejected/cancelled: timer callback is a no-op.
            return;
        };

        self.remove_pending(room_id, &session.user_id).await;

        self.bus
            .send_to(
                &Room::approval_namespace_path(&room_id),
                session.connection_id,
                ServerEvent::ApprovalTimedOut,
            )
            .await;
    }

    async fn remove_pending(&self, room_id: RoomId, user_id: &UserId) {
        let mut guard = self.registry.write().await;
        if let Some(room) = guard.get_room_mut(&room_id) {
            room.pending_members.remove(user_id);
        }
    }

    fn clone_for_timer(&self) -> ApprovalWorkflowHandler {
        ApprovalWorkflowHandler {
            registry: Arc::clone(&self.registry),
            bus: Arc::clone(&self.bus),
            sessions: Arc::clone(&self.sessions),
            approvals: Arc::clone(&self.approvals),
            timeout: self.timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bus::EventBus;
    use crate::engine::room::{RoomKind, RoomVisibility};

    fn handler() -> (ApprovalWorkflowHandler, RoomId) {
        let mut registry = RoomRegistry::new();
        let room = registry.create_room(
            "owner".into(),
            "Owner".into(),
            "Jam".into(),
            None,
            RoomKind::Perform,
            RoomVisibility::Private,
            false,
            120,
        );
        let room_id = room.id;

        let handler = ApprovalWorkflowHandler {
            registry: Arc::new(RwLock::new(registry)),
            bus: Arc::new(EventBus::new()),
            sessions: Arc::new(SessionRegistry::new()),
            approvals: Arc::new(ApprovalSessionManager::new()),
            timeout: Duration::from_millis(30_000),
        };

        (handler, room_id)
    }

    #[tokio::test]
    async fn approve_moves_pending_to_users() {
        let (handler, room_id) = handler();
        handler.bus.create_namespace(&Room::approval_namespace_path(&room_id)).await;
        handler.bus.create_namespace(&Room::namespace_path(&room_id)).await;

        let conn = ConnectionId::new_v4();
        handler
            .request(conn, room_id, "x".into(), "X".into(), UserRole::BandMember)
            .await
            .unwrap();

        handler
            .approve(room_id, "owner".into(), "x".into())
            .await
            .unwrap();

        let guard = handler.registry.read().await;
        let room = guard.get_room(&room_id).unwrap();
        assert!(room.users.contains_key("x"));
        assert!(!room.pending_members.contains_key("x"));
    }

    #[tokio::test]
    async fn reject_requires_owner() {
        let (handler, room_id) = handler();
        handler.bus.create_namespace(&Room::approval_namespace_path(&room_id)).await;
        handler.bus.create_namespace(&Room::namespace_path(&room_id)).await;

        let conn = ConnectionId::new_v4();
        handler
            .request(conn, room_id, "x".into(), "X".into(), UserRole::BandMember)
            .await
            .unwrap();

        let err = handler
            .reject(room_id, "not-owner".into(), "x".into())
            .await
            .unwrap_err();
        assert_eq!(err, RoomError::Unauthorized);
    }

    #[tokio::test]
    async fn second_approve_after_reject_is_noop() {
        let (handler, room_id) = handler();
        handler.bus.create_namespace(&Room::approval_namespace_path(&room_id)).await;
        handler.bus.create_namespace(&Room::namespace_path(&room_id)).await;

        let conn = ConnectionId::new_v4();
        handler
            .request(conn, room_id, "x".into(), "X".into(), UserRole::BandMember)
            .await
            .unwrap();

        handler.reject(room_id, "owner".into(), "x".into()).await.unwrap();
        // Simulates a race: approve arrives after reject already won.
        handler.approve(room_id, "owner".into(), "x".into()).await.unwrap();

        let guard = handler.registry.read().await;
        let room = guard.get_room(&room_id).unwrap();
        assert!(!room.users.contains_key("x"));
    }
}
