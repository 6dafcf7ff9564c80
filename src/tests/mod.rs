//! Cross-module integration tests exercising the engine handlers together,
//! the way `RoomLifecycleHandler`'s callers (the `ws` layer) actually chain
//! them. Unit behavior per handler lives in each module's own `#[cfg(test)]`
//! block; this file is for sequences that span more than one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::engine::approval::{ApprovalSessionManager, ApprovalWorkflowHandler};
use crate::engine::batcher::NoteBatcher;
use crate::engine::bus::{ConnectionId, EventBus};
use crate::engine::grace::GracePeriodRegistry;
use crate::engine::lifecycle::{JoinOutcome, RoomLifecycleHandler};
use crate::engine::metronome::MetronomeScheduler;
use crate::engine::registry::RoomRegistry;
use crate::engine::room::{Room, RoomKind, RoomVisibility};
use crate::engine::session::SessionRegistry;
use crate::engine::swap::InstrumentSwapHandler;

fn lifecycle() -> RoomLifecycleHandler {
    let registry = Arc::new(RwLock::new(RoomRegistry::new()));
    let bus = Arc::new(EventBus::new());
    let sessions = Arc::new(SessionRegistry::new());
    let grace = Arc::new(GracePeriodRegistry::new());
    let metronome = Arc::new(MetronomeScheduler::new());
    let approvals = Arc::new(ApprovalWorkflowHandler {
        registry: Arc::clone(&registry),
        bus: Arc::clone(&bus),
        sessions: Arc::clone(&sessions),
        approvals: Arc::new(ApprovalSessionManager::new()),
        timeout: Duration::from_millis(200),
    });

    RoomLifecycleHandler {
        registry,
        bus,
        sessions,
        grace,
        metronome,
        approvals,
        batcher: Arc::new(NoteBatcher::new()),
        grace_period: Duration::from_millis(200),
        batch_interval: Duration::from_millis(16),
    }
}

#[tokio::test]
async fn disconnect_then_reconnect_within_grace_window_restores_membership() {
    let handler = lifecycle();
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

    let member_conn = ConnectionId::new_v4();
    handler
        .join_room(member_conn, room.id, "member".into(), "Member".into(), None)
        .await
        .unwrap();

    // Unintended disconnect: starts the grace window instead of a full leave.
    handler
        .leave_room(member_conn, room.id, "member".into(), false)
        .await
        .unwrap();

    {
        let guard = handler.registry.read().await;
        assert!(!guard.get_room(&room.id).unwrap().users.contains_key("member"));
    }
    assert!(handler.grace.contains(room.id, &"member".to_string()).await);

    let new_conn = ConnectionId::new_v4();
    let outcome = handler
        .join_room(new_conn, room.id, "member".into(), "Member".into(), None)
        .await
        .unwrap();

    assert!(matches!(outcome, JoinOutcome::Joined { .. }));

    let guard = handler.registry.read().await;
    assert!(guard.get_room(&room.id).unwrap().users.contains_key("member"));
}

#[tokio::test]
async fn approval_timeout_releases_pending_slot_for_a_later_request() {
    let handler = lifecycle();
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

    let conn = ConnectionId::new_v4();
    let outcome = handler
        .join_room(conn, room.id, "latecomer".into(), "Latecomer".into(), None)
        .await
        .unwrap();
    assert!(matches!(outcome, JoinOutcome::PendingApproval));

    tokio::time::sleep(Duration::from_millis(350)).await;

    {
        let guard = handler.registry.read().await;
        assert!(!guard.get_room(&room.id).unwrap().pending_members.contains_key("latecomer"));
    }

    // A fresh request from the same user after timeout is accepted again.
    let conn2 = ConnectionId::new_v4();
    let outcome = handler
        .join_room(conn2, room.id, "latecomer".into(), "Latecomer".into(), None)
        .await
        .unwrap();
    assert!(matches!(outcome, JoinOutcome::PendingApproval));
}

#[tokio::test]
async fn kicked_user_cannot_rejoin_without_a_new_request() {
    let handler = lifecycle();
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

    let member_conn = ConnectionId::new_v4();
    handler
        .join_room(member_conn, room.id, "member".into(), "Member".into(), None)
        .await
        .unwrap();

    handler
        .kick_user(room.id, "owner".into(), "member".into())
        .await
        .unwrap();

    let guard = handler.registry.read().await;
    assert!(!guard.get_room(&room.id).unwrap().users.contains_key("member"));
    assert!(!handler.grace.contains(room.id, &"member".to_string()).await);
}

#[tokio::test]
async fn instrument_swap_round_trip_through_the_room_namespace() {
    let handler = lifecycle();
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

    let member_conn = ConnectionId::new_v4();
    handler
        .join_room(member_conn, room.id, "member".into(), "Member".into(), None)
        .await
        .unwrap();

    {
        let mut guard = handler.registry.write().await;
        let r = guard.get_room_mut(&room.id).unwrap();
        r.get_user_mut(&"owner".to_string()).unwrap().current_instrument = Some("guitar".into());
        r.get_user_mut(&"member".to_string()).unwrap().current_instrument = Some("bass".into());
    }

    let swaps = InstrumentSwapHandler::new();
    swaps
        .request(&handler.registry, &handler.bus, room.id, "owner".into(), "member".into())
        .await
        .unwrap();
    swaps
        .approve(&handler.registry, &handler.bus, room.id, "member".into(), "owner".into())
        .await
        .unwrap();

    let guard = handler.registry.read().await;
    let r = guard.get_room(&room.id).unwrap();
    assert_eq!(r.get_user(&"owner".to_string()).unwrap().current_instrument.as_deref(), Some("bass"));
    assert_eq!(r.get_user(&"member".to_string()).unwrap().current_instrument.as_deref(), Some("guitar"));
}

#[tokio::test]
async fn room_namespaces_are_destroyed_on_gc_sweep() {
    let handler = lifecycle();
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

    handler
        .leave_room(owner_conn, room.id, "owner".into(), true)
        .await
        .unwrap();

    handler.gc_sweep().await;

    assert!(!handler.registry.read().await.room_exists(&room.id));
    assert!(!handler.bus.namespace_exists(&Room::namespace_path(&room.id)).await);
}
