//! Optional coalescing batcher for high-frequency room events (spec.md
//! §4.6: "Coalescing batcher (optional, non-critical events only)").
//!
//! Grounded on the teacher's periodic background task shape
//! (`sharify/websocket/instance.rs`'s polling loop), generalized into a
//! per-room queue flushed on a `Config::batch_interval` tick. [`is_critical`]
//! events (notes, joins/leaves, stop-all-notes, instrument/param changes)
//! always bypass the queue and publish immediately — those are the ones
//! spec.md §4.6 names as never-coalesced, never-dropped. Everything else is
//! eligible for coalescing, keyed by `(event, userId)` so only the latest
//! update per key survives a tick.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::bus::SharedEventBus;
use super::messages::ServerEvent;
use super::room::{RoomId, UserId};

/// spec.md §4.6: "Critical events (`note_played`, … `stop_all_notes` …)
/// bypass the batcher." Everything else may be coalesced.
fn is_critical(event: &ServerEvent) -> bool {
    matches!(
        event,
        ServerEvent::NotePlayed { .. }
            | ServerEvent::StopAllNotes { .. }
            | ServerEvent::UserJoined { .. }
            | ServerEvent::UserLeft { .. }
            | ServerEvent::SynthParamsChanged { .. }
            | ServerEvent::InstrumentChanged { .. }
    )
}

/// A coalescing slot: the event's own wire tag plus whichever id scopes it
/// to a single user/room, so two updates about the same subject replace
/// each other instead of both surviving to the next flush.
type EventKey = (&'static str, Option<UserId>);

fn event_key(event: &ServerEvent) -> EventKey {
    match event {
        ServerEvent::UserJoined { user_id, .. } => ("user_joined", Some(user_id.clone())),
        ServerEvent::UserLeft { user_id, .. } => ("user_left", Some(user_id.clone())),
        ServerEvent::UserKicked { user_id } => ("user_kicked", Some(user_id.clone())),
        ServerEvent::OwnershipTransferred { new_owner_id } => ("ownership_transferred", Some(new_owner_id.clone())),
        ServerEvent::RoomStateUpdated { .. } => ("room_state_updated", None),
        ServerEvent::NotePlayed { user_id, .. } => ("note_played", Some(user_id.clone())),
        ServerEvent::StopAllNotes { user_id } => ("stop_all_notes", Some(user_id.clone())),
        ServerEvent::InstrumentChanged { user_id, .. } => ("instrument_changed", Some(user_id.clone())),
        ServerEvent::SynthParamsChanged { user_id, .. } => ("synth_params_changed", Some(user_id.clone())),
        ServerEvent::RequestSynthParamsResponse { user_id, .. } => ("request_synth_params_response", Some(user_id.clone())),
        ServerEvent::AutoSendSynthParamsToNewUser { new_user_id, .. } => {
            ("auto_send_synth_params_to_new_user", Some(new_user_id.clone()))
        }
        ServerEvent::RequestCurrentSynthParamsForNewUser { new_user_id, .. } => {
            ("request_current_synth_params_for_new_user", Some(new_user_id.clone()))
        }
        ServerEvent::SwapRequestSent { target_user_id } => ("swap_request_sent", Some(target_user_id.clone())),
        ServerEvent::SwapRequestReceived { requester_id } => ("swap_request_received", Some(requester_id.clone())),
        ServerEvent::SwapCompleted { user_a, user_b } => ("swap_completed", Some(format!("{user_a}:{user_b}"))),
        ServerEvent::SwapRejected { by_user_id } => ("swap_rejected", Some(by_user_id.clone())),
        ServerEvent::SwapCancelled => ("swap_cancelled", None),
        ServerEvent::SwapError { .. } => ("swap_error", None),
        ServerEvent::KickError { .. } => ("kick_error", None),
        ServerEvent::MembershipError { .. } => ("membership_error", None),
        ServerEvent::ApprovalPending => ("approval_pending", None),
        ServerEvent::ApprovalGranted => ("approval_granted", None),
        ServerEvent::ApprovalRejected => ("approval_rejected", None),
        ServerEvent::ApprovalCancelled => ("approval_cancelled", None),
        ServerEvent::ApprovalTimedOut => ("approval_timed_out", None),
        ServerEvent::ApprovalSuccess { user_id } => ("approval_success", Some(user_id.clone())),
        ServerEvent::ApprovalError { .. } => ("approval_error", None),
        ServerEvent::NewMemberRequest { user_id, .. } => ("new_member_request", Some(user_id.clone())),
        ServerEvent::MetronomeTick { .. } => ("metronome_tick", None),
        ServerEvent::UserJoinedVoice { user_id } => ("user_joined_voice", Some(user_id.clone())),
        ServerEvent::UserLeftVoice { user_id } => ("user_left_voice", Some(user_id.clone())),
        ServerEvent::VoiceOffer { from_user_id, .. } => ("voice_offer", Some(from_user_id.clone())),
        ServerEvent::VoiceAnswer { from_user_id, .. } => ("voice_answer", Some(from_user_id.clone())),
        ServerEvent::VoiceIceCandidate { from_user_id, .. } => ("voice_ice_candidate", Some(from_user_id.clone())),
        ServerEvent::BroadcastStateChanged { .. } => ("broadcast_state_changed", None),
        ServerEvent::RoomBroadcastChanged { room_id, .. } => ("room_broadcast_changed", Some(room_id.to_string())),
        ServerEvent::BroadcastError { .. } => ("broadcast_error", None),
        ServerEvent::BroadcastState { .. } => ("broadcast_state", None),
        ServerEvent::SequencerStateRequested { from_user_id } => ("sequencer_state_requested", Some(from_user_id.clone())),
        ServerEvent::SequencerState { from_user_id, .. } => ("sequencer_state", Some(from_user_id.clone())),
        ServerEvent::JoinError { .. } => ("join_error", None),
        ServerEvent::RoomCreated { room_id, .. } => ("room_created", Some(room_id.to_string())),
        ServerEvent::RoomRemoved { room_id } => ("room_removed", Some(room_id.to_string())),
        ServerEvent::EventBatch { .. } => ("event_batch", None),
    }
}

#[derive(Default)]
struct Queue {
    entries: HashMap<EventKey, ServerEvent>,
    // Insertion order of distinct keys, oldest first; used to drop the
    // oldest half on overflow without disturbing which key maps to which
    // (latest) event.
    order: VecDeque<EventKey>,
}

#[derive(Default)]
pub struct NoteBatcher {
    queues: Arc<RwLock<HashMap<RoomId, Queue>>>,
    tasks: RwLock<HashMap<RoomId, JoinHandle<()>>>,
}

impl NoteBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start(
        &self,
        room_id: RoomId,
        namespace: String,
        bus: SharedEventBus,
        interval: Duration,
    ) {
        self.queues
            .write()
            .await
            .entry(room_id)
            .or_insert_with(Queue::default);

        let queues = Arc::clone(&self.queues);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let batch = {
                    let mut guard = queues.write().await;
                    let Some(q) = guard.get_mut(&room_id) else {
                        break;
                    };
                    if q.entries.is_empty() {
                        continue;
                    }
                    q.order.clear();
                    q.entries.drain().map(|(_, event)| event).collect::<Vec<_>>()
                };

                if batch.len() == 1 {
                    bus.publish(&namespace, batch.into_iter().next().unwrap())
                        .await;
                } else {
                    bus.publish(&namespace, ServerEvent::EventBatch { events: batch })
                        .await;
                }
            }
        });

        if let Some(old) = self.tasks.write().await.insert(room_id, handle) {
            old.abort();
        }
    }

    /// Enqueues a coalescible event. Returns `false` for critical kinds or
    /// rooms with no running batcher, in which case the caller must publish
    /// directly instead.
    pub async fn enqueue(&self, room_id: RoomId, event: ServerEvent, max_queue_size: usize) -> bool {
        if is_critical(&event) {
            return false;
        }

        let mut guard = self.queues.write().await;
        let Some(queue) = guard.get_mut(&room_id) else {
            return false;
        };

        let key = event_key(&event);
        if queue.entries.insert(key.clone(), event).is_none() {
            queue.order.push_back(key);
        }

        if queue.order.len() > max_queue_size {
            // spec.md §4.6: "On queue overflow the oldest half is dropped."
            let drop_count = queue.order.len() / 2;
            for _ in 0..drop_count {
                if let Some(old_key) = queue.order.pop_front() {
                    queue.entries.remove(&old_key);
                }
            }
        }

        true
    }

    pub async fn stop(&self, room_id: RoomId) {
        if let Some(handle) = self.tasks.write().await.remove(&room_id) {
            handle.abort();
        }
        self.queues.write().await.remove(&room_id);
    }
}
