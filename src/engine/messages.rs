//! Wire protocol: client -> server commands and server -> client events.
//!
//! Framed as JSON text over the WebSocket, tagged by `"type"` the way a
//! discriminated union protocol is idiomatically modeled with serde. See
//! SPEC_FULL.md §D for why this replaced the teacher's protobuf framing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::room::{Category, Instrument, RoomId, RoomKind, RoomVisibility, UserId, UserRole};

/// Messages accepted on the `/room/{roomId}` namespace, plus `join_room`
/// which may also arrive to request creation of a new room.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomClientMessage {
    JoinRoom {
        username: String,
        #[serde(default)]
        requested_role: Option<UserRole>,
    },
    CreateRoom {
        username: String,
        name: String,
        #[serde(default)]
        description: Option<String>,
        kind: RoomKind,
        visibility: RoomVisibility,
        #[serde(default)]
        hidden: bool,
    },
    LeaveRoom {
        #[serde(default)]
        intended: bool,
    },
    PlayNote {
        notes: Vec<String>,
        velocity: f32,
        instrument: Instrument,
        category: Category,
        event_type: String,
        #[serde(default)]
        is_key_held: bool,
    },
    StopAllNotes,
    ChangeInstrument {
        instrument: Instrument,
        category: Category,
    },
    UpdateSynthParams {
        params: Value,
    },
    RequestSynthParams {
        target_user_id: UserId,
    },
    RequestInstrumentSwap {
        target_user_id: UserId,
    },
    ApproveInstrumentSwap {
        requester_id: UserId,
    },
    RejectInstrumentSwap {
        requester_id: UserId,
    },
    CancelInstrumentSwap,
    KickUser {
        user_id: UserId,
    },
    TransferOwnership {
        new_owner_id: UserId,
    },
    JoinVoice,
    LeaveVoice,
    VoiceOffer {
        target_user_id: UserId,
        sdp: Value,
    },
    VoiceAnswer {
        target_user_id: UserId,
        sdp: Value,
    },
    VoiceIceCandidate {
        target_user_id: UserId,
        candidate: Value,
    },
    RequestMeshConnections,
    ToggleBroadcast {
        on: bool,
    },
    BroadcastAudioChunk {
        base64: String,
    },
    RequestBroadcastState,
    SetBpm {
        bpm: u32,
    },
    RequestSequencerState,
    SendSequencerState {
        target_user_id: UserId,
        state: Value,
    },
}

/// Messages accepted on the `/approval/{roomId}` namespace.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalClientMessage {
    ApprovalRequest {
        username: String,
        #[serde(default)]
        role: Option<UserRole>,
    },
    ApprovalCancel,
    ApproveApproval {
        user_id: UserId,
    },
    RejectApproval {
        user_id: UserId,
    },
}

/// Events delivered to clients. Carries every `Server -> Client` message
/// named in spec.md §6.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    UserJoined {
        user_id: UserId,
        username: String,
        role: UserRole,
    },
    UserLeft {
        user_id: UserId,
        #[serde(default)]
        temporary: bool,
    },
    UserKicked {
        user_id: UserId,
    },
    OwnershipTransferred {
        new_owner_id: UserId,
    },
    RoomStateUpdated {
        room: Value,
    },
    NotePlayed {
        user_id: UserId,
        notes: Vec<String>,
        velocity: f32,
        instrument: Instrument,
        category: Category,
        event_type: String,
        is_key_held: bool,
    },
    StopAllNotes {
        user_id: UserId,
    },
    InstrumentChanged {
        user_id: UserId,
        instrument: Instrument,
        category: Category,
    },
    SynthParamsChanged {
        user_id: UserId,
        params: Value,
    },
    RequestSynthParamsResponse {
        user_id: UserId,
        params: Option<Value>,
    },
    AutoSendSynthParamsToNewUser {
        new_user_id: UserId,
        new_username: String,
    },
    RequestCurrentSynthParamsForNewUser {
        new_user_id: UserId,
        new_username: String,
    },
    SwapRequestSent {
        target_user_id: UserId,
    },
    SwapRequestReceived {
        requester_id: UserId,
    },
    SwapCompleted {
        user_a: UserId,
        user_b: UserId,
    },
    SwapRejected {
        by_user_id: UserId,
    },
    SwapCancelled,
    SwapError {
        message: String,
    },
    KickError {
        message: String,
    },
    MembershipError {
        message: String,
    },
    ApprovalPending,
    ApprovalGranted,
    ApprovalRejected,
    ApprovalCancelled,
    ApprovalTimedOut,
    ApprovalSuccess {
        user_id: UserId,
    },
    ApprovalError {
        message: String,
    },
    NewMemberRequest {
        user_id: UserId,
        username: String,
        role: UserRole,
    },
    MetronomeTick {
        bpm: u32,
        tick: u64,
        timestamp_ms: u64,
    },
    UserJoinedVoice {
        user_id: UserId,
    },
    UserLeftVoice {
        user_id: UserId,
    },
    VoiceOffer {
        from_user_id: UserId,
        sdp: Value,
    },
    VoiceAnswer {
        from_user_id: UserId,
        sdp: Value,
    },
    VoiceIceCandidate {
        from_user_id: UserId,
        candidate: Value,
    },
    BroadcastStateChanged {
        active: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        playlist_url: Option<String>,
    },
    RoomBroadcastChanged {
        room_id: RoomId,
        active: bool,
    },
    BroadcastError {
        message: String,
    },
    BroadcastState {
        active: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        playlist_url: Option<String>,
    },
    SequencerStateRequested {
        from_user_id: UserId,
    },
    SequencerState {
        from_user_id: UserId,
        state: Value,
    },
    JoinError {
        message: String,
    },
    RoomCreated {
        room_id: RoomId,
        name: String,
    },
    RoomRemoved {
        room_id: RoomId,
    },
    /// Coalesced batch of high-frequency events (spec.md §4.6 "optional
    /// batching"). Only ever wraps batchable event kinds; critical events
    /// bypass the batcher entirely and are published standalone.
    EventBatch {
        events: Vec<ServerEvent>,
    },
}
