//! SessionRegistry (spec.md §4.2): connection id -> {roomId, userId,
//! namespace, timestamps}, with reverse lookup by userId within a room.
//!
//! Grounded on `sharify/websocket/instance.rs`'s `SharifyWsManager` map, but
//! keyed by connection rather than by user so a user can be looked up
//! per-room instead of globally, and carrying the namespace path + activity
//! timestamp the spec requires.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::RwLock;

use super::bus::ConnectionId;
use super::room::{RoomId, UserId};

#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub namespace: String,
    pub connected_at: Instant,
    pub last_activity: Instant,
}

#[derive(Default)]
pub struct SessionRegistry {
    by_conn: RwLock<HashMap<ConnectionId, SessionInfo>>,
    /// (roomId, userId) -> connectionId, for O(1) reverse lookup and the
    /// "at most one active connection per (room, user)" invariant.
    by_room_user: RwLock<HashMap<(RoomId, UserId), ConnectionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a connection. If `(roomId, userId)` already had a
    /// connection, returns its old id so the caller can close it (spec.md
    /// §4.2: "any prior connection for the same (roomId, userId) is
    /// detached and its underlying connection closed").
    pub async fn attach(
        &self,
        conn: ConnectionId,
        room_id: RoomId,
        user_id: UserId,
        namespace: String,
    ) -> Option<ConnectionId> {
        let now = Instant::now();
        let key = (room_id, user_id.clone());

        let previous = {
            let mut by_room_user = self.by_room_user.write().await;
            by_room_user.insert(key.clone(), conn)
        };

        if let Some(prev_conn) = previous {
            self.by_conn.write().await.remove(&prev_conn);
        }

        self.by_conn.write().await.insert(
            conn,
            SessionInfo {
                room_id,
                user_id,
                namespace,
                connected_at: now,
                last_activity: now,
            },
        );

        previous
    }

    pub async fn detach(&self, conn: ConnectionId) -> Option<SessionInfo> {
        let info = self.by_conn.write().await.remove(&conn)?;
        let key = (info.room_id, info.user_id.clone());
        let mut by_room_user = self.by_room_user.write().await;
        if by_room_user.get(&key) == Some(&conn) {
            by_room_user.remove(&key);
        }
        Some(info)
    }

    pub async fn by_conn(&self, conn: ConnectionId) -> Option<SessionInfo> {
        self.by_conn.read().await.get(&conn).cloned()
    }

    pub async fn conns_in_room(&self, room_id: RoomId) -> Vec<ConnectionId> {
        self.by_conn
            .read()
            .await
            .iter()
            .filter(|(_, info)| info.room_id == room_id)
            .map(|(conn, _)| *conn)
            .collect()
    }

    pub async fn conn_by_user(&self, room_id: RoomId, user_id: &UserId) -> Option<ConnectionId> {
        self.by_room_user
            .read()
            .await
            .get(&(room_id, user_id.clone()))
            .copied()
    }

    /// Touches `lastActivity` for a session (spec.md §4.2: "touched on
    /// every handler invocation referencing the session").
    pub async fn touch(&self, conn: ConnectionId) {
        if let Some(info) = self.by_conn.write().await.get_mut(&conn) {
            info.last_activity = Instant::now();
        }
    }
}
