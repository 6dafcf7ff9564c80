//! Process-wide shared state handed to every route as `web::Data<AppState>`.
//!
//! Grounded on the teacher's `main.rs`, which wraps its single
//! `Arc<RwLock<RoomManager>>` in `web::Data` and clones it into each route;
//! generalized here into one struct bundling every registry the engine
//! needs, per SPEC_FULL.md §F.1's single-lock resolution.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::collaborators::{BroadcastTranscoder, IdentityVerifier};
use crate::config::Config;
use crate::engine::approval::{ApprovalSessionManager, ApprovalWorkflowHandler};
use crate::engine::batcher::NoteBatcher;
use crate::engine::bus::{EventBus, SharedEventBus};
use crate::engine::grace::GracePeriodRegistry;
use crate::engine::lifecycle::RoomLifecycleHandler;
use crate::engine::metronome::MetronomeScheduler;
use crate::engine::registry::RoomRegistry;
use crate::engine::session::SessionRegistry;
use crate::engine::swap::InstrumentSwapHandler;

pub struct AppState {
    pub config: Config,
    pub registry: Arc<RwLock<RoomRegistry>>,
    pub bus: SharedEventBus,
    pub sessions: Arc<SessionRegistry>,
    pub grace: Arc<GracePeriodRegistry>,
    pub metronome: Arc<MetronomeScheduler>,
    pub approvals: Arc<ApprovalWorkflowHandler>,
    pub swaps: Arc<InstrumentSwapHandler>,
    pub batcher: Arc<NoteBatcher>,
    pub lifecycle: Arc<RoomLifecycleHandler>,
    pub identity: Arc<dyn IdentityVerifier>,
    pub transcoder: Arc<dyn BroadcastTranscoder>,
    active_connections: AtomicUsize,
}

impl AppState {
    pub fn new(
        config: Config,
        identity: Arc<dyn IdentityVerifier>,
        transcoder: Arc<dyn BroadcastTranscoder>,
    ) -> Self {
        let registry = Arc::new(RwLock::new(RoomRegistry::new()));
        let bus: SharedEventBus = Arc::new(EventBus::new());
        let sessions = Arc::new(SessionRegistry::new());
        let grace = Arc::new(GracePeriodRegistry::new());
        let metronome = Arc::new(MetronomeScheduler::new());
        let swaps = Arc::new(InstrumentSwapHandler::new());
        let batcher = Arc::new(NoteBatcher::new());

        let approvals = Arc::new(ApprovalWorkflowHandler {
            registry: Arc::clone(&registry),
            bus: Arc::clone(&bus),
            sessions: Arc::clone(&sessions),
            approvals: Arc::new(ApprovalSessionManager::new()),
            timeout: config.approval_timeout,
        });

        let lifecycle = Arc::new(RoomLifecycleHandler {
            registry: Arc::clone(&registry),
            bus: Arc::clone(&bus),
            sessions: Arc::clone(&sessions),
            grace: Arc::clone(&grace),
            metronome: Arc::clone(&metronome),
            approvals: Arc::clone(&approvals),
            batcher: Arc::clone(&batcher),
            grace_period: config.grace_period,
            batch_interval: config.batch_interval,
        });

        Self {
            config,
            registry,
            bus,
            sessions,
            grace,
            metronome,
            approvals,
            swaps,
            batcher,
            lifecycle,
            identity,
            transcoder,
            active_connections: AtomicUsize::new(0),
        }
    }

    /// Attempts to reserve a connection slot against
    /// `config.max_concurrent_connections` (spec.md §6 "Configuration").
    /// Returns a guard that releases the slot on drop, or `None` if the
    /// process is already at capacity. Takes `Arc<Self>` so the guard can
    /// outlive the request handler and be moved into the spawned connection
    /// task.
    pub fn try_acquire_connection_slot(self: &Arc<Self>) -> Option<ConnectionSlot> {
        let limit = self.config.max_concurrent_connections;
        let mut current = self.active_connections.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return None;
            }
            match self.active_connections.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(ConnectionSlot { state: Arc::clone(self) }),
                Err(observed) => current = observed,
            }
        }
    }

    /// Background sweep that reaps empty, grace-free rooms (spec.md §4.3).
    /// Started once from `main.rs` alongside the server.
    pub fn spawn_gc_sweep(self: &Arc<Self>, interval: std::time::Duration) {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                state.lifecycle.gc_sweep().await;
            }
        });
    }
}

/// Released automatically when the connection task that acquired it ends,
/// whichever way it ends (graceful close, error, panic).
pub struct ConnectionSlot {
    state: Arc<AppState>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::AcqRel);
    }
}
