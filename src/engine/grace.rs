//! GracePeriodRegistry (spec.md §4.3 "grace expiry", §3 "GracePeriodEntry").
//!
//! Holds a disconnected user's last-known `User` snapshot for a bounded
//! window so a reconnect within the window skips re-approval. Independent
//! ownership from `RoomRegistry` (spec.md §3: "never shared ownership").

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::room::{RoomId, User, UserId};

#[derive(Clone)]
pub struct GracePeriodEntry {
    pub namespace_path: String,
    pub user_snapshot: User,
    pub expires_at: Instant,
    pub intended_leave: bool,
}

#[derive(Default)]
pub struct GracePeriodRegistry {
    entries: RwLock<HashMap<(RoomId, UserId), GracePeriodEntry>>,
    timers: RwLock<HashMap<(RoomId, UserId), JoinHandle<()>>>,
}

impl GracePeriodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a grace entry, replacing (and cancelling the timer of) any
    /// prior entry for the same `(userId, roomId)` (spec.md §5 resource cap:
    /// "new disconnect replaces the prior entry").
    pub async fn insert(
        &self,
        room_id: RoomId,
        user_id: UserId,
        namespace_path: String,
        user_snapshot: User,
        window: Duration,
        on_expire: impl FnOnce() -> JoinHandle<()>,
    ) {
        let key = (room_id, user_id);
        let entry = GracePeriodEntry {
            namespace_path,
            user_snapshot,
            expires_at: Instant::now() + window,
            intended_leave: false,
        };

        self.entries.write().await.insert(key.clone(), entry);

        let new_timer = on_expire();
        if let Some(old) = self.timers.write().await.insert(key, new_timer) {
            old.abort();
        }
    }

    /// Removes and returns the entry for `(roomId, userId)` if present and
    /// not yet expired, cancelling its timer (used on reconnect).
    pub async fn take(&self, room_id: RoomId, user_id: &UserId) -> Option<GracePeriodEntry> {
        let key = (room_id, user_id.clone());
        let entry = self.entries.write().await.remove(&key)?;
        if let Some(timer) = self.timers.write().await.remove(&key) {
            timer.abort();
        }

        if Instant::now() >= entry.expires_at {
            return None;
        }

        Some(entry)
    }

    /// Called by the timer callback on expiry; no-op if the entry was
    /// already consumed by a reconnect (spec.md §5 "timer callback must
    /// re-check that its target state still exists").
    pub async fn expire(&self, room_id: RoomId, user_id: &UserId) -> bool {
        let key = (room_id, user_id.clone());
        self.timers.write().await.remove(&key);
        self.entries.write().await.remove(&key).is_some()
    }

    pub async fn contains(&self, room_id: RoomId, user_id: &UserId) -> bool {
        self.entries
            .read()
            .await
            .contains_key(&(room_id, user_id.clone()))
    }

    pub async fn has_any_for_room(&self, room_id: RoomId) -> bool {
        self.entries
            .read()
            .await
            .keys()
            .any(|(r, _)| *r == room_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::room::UserRole;

    #[tokio::test]
    async fn take_within_window_returns_snapshot() {
        let registry = GracePeriodRegistry::new();
        let room = RoomId::new_v4();
        let user_id: UserId = "u1".into();
        let snapshot = User::new(user_id.clone(), "alice".into(), UserRole::BandMember);

        registry
            .insert(
                room,
                user_id.clone(),
                "/room/x".into(),
                snapshot.clone(),
                Duration::from_secs(30),
                || tokio::spawn(async {}),
            )
            .await;

        let taken = registry.take(room, &user_id).await;
        assert!(taken.is_some());
        assert_eq!(taken.unwrap().user_snapshot.username, "alice");
        assert!(!registry.contains(room, &user_id).await);
    }

    #[tokio::test]
    async fn expire_is_noop_after_reconnect_consumed_entry() {
        let registry = GracePeriodRegistry::new();
        let room = RoomId::new_v4();
        let user_id: UserId = "u1".into();
        let snapshot = User::new(user_id.clone(), "alice".into(), UserRole::BandMember);

        registry
            .insert(
                room,
                user_id.clone(),
                "/room/x".into(),
                snapshot,
                Duration::from_secs(30),
                || tokio::spawn(async {}),
            )
            .await;

        registry.take(room, &user_id).await;
        assert!(!registry.expire(room, &user_id).await);
    }

    #[tokio::test]
    async fn new_disconnect_replaces_prior_entry() {
        let registry = GracePeriodRegistry::new();
        let room = RoomId::new_v4();
        let user_id: UserId = "u1".into();

        registry
            .insert(
                room,
                user_id.clone(),
                "/room/x".into(),
                User::new(user_id.clone(), "first".into(), UserRole::BandMember),
                Duration::from_secs(30),
                || tokio::spawn(async {}),
            )
            .await;
        registry
            .insert(
                room,
                user_id.clone(),
                "/room/x".into(),
                User::new(user_id.clone(), "second".into(), UserRole::BandMember),
                Duration::from_secs(30),
                || tokio::spawn(async {}),
            )
            .await;

        let taken = registry.take(room, &user_id).await.unwrap();
        assert_eq!(taken.user_snapshot.username, "second");
    }
}
