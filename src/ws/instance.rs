//! Per-connection actix-ws loop for the `/room/{roomId}` namespace.
//!
//! Grounded on `sharify/websocket/instance.rs`'s heartbeat + message loop
//! (`tokio::select!` between the socket stream and a ping interval), but
//! framed as JSON text (SPEC_FULL.md §D) and fed a second stream: the
//! connection's `EventBus` subscription, so outbound server events and
//! inbound client commands are both handled on one task per socket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use actix_ws::{AggregatedMessage, Session};
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::bus::ConnectionId;
use crate::engine::lifecycle::JoinOutcome;
use crate::engine::messages::{ApprovalClientMessage, RoomClientMessage, ServerEvent};
use crate::engine::notes::NotePlayingHandler;
use crate::engine::room::{Room, RoomId, RoomError, UserId, UserRole, LOBBY_NAMESPACE};
use crate::engine::voice::VoiceConnectionHandler;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ConnectQuery {
    pub token: String,
}

/// `GET /ws/room/{room_id}` — `room_id` of `"new"` opens a pre-creation
/// scope accepting only `create_room`; any other value must name an
/// existing room and the first accepted message is `join_room`.
pub async fn room_ws(
    req: HttpRequest,
    body: web::Payload,
    path: web::Path<String>,
    query: web::Query<ConnectQuery>,
    state: web::Data<Arc<AppState>>,
) -> actix_web::Result<impl Responder> {
    let identity = match state.identity.verify(&query.token).await {
        Ok(identity) => identity,
        Err(_) => return Ok(HttpResponse::Unauthorized().finish()),
    };

    let app_state = state.get_ref().clone();
    let Some(slot) = app_state.try_acquire_connection_slot() else {
        return Ok(HttpResponse::ServiceUnavailable().body("server at capacity"));
    };

    let room_path = path.into_inner();
    let initial_room_id = if room_path == "new" {
        None
    } else {
        match Uuid::parse_str(&room_path) {
            Ok(id) => Some(id),
            Err(_) => return Ok(HttpResponse::BadRequest().body("invalid room id")),
        }
    };

    let (response, session, stream) = actix_ws::handle(&req, body)?;
    let stream = stream.max_frame_size(128 * 1024).aggregate_continuations();

    let conn: ConnectionId = Uuid::new_v4();

    tokio::spawn(run_room_connection(
        app_state,
        session,
        stream,
        conn,
        initial_room_id,
        identity.user_id,
        identity.username,
        slot,
    ));

    Ok(response)
}

struct ConnCtx {
    room_id: Option<RoomId>,
    user_id: UserId,
    username: String,
    joined: bool,
}

async fn run_room_connection(
    state: Arc<AppState>,
    mut session: Session,
    mut stream: actix_ws::AggregatedMessageStream,
    conn: ConnectionId,
    initial_room_id: Option<RoomId>,
    user_id: UserId,
    username: String,
    _slot: crate::state::ConnectionSlot,
) {
    let heartbeat_interval = state.config.heartbeat_interval;
    let mut last_pong = Instant::now();
    let mut ticker = tokio::time::interval(heartbeat_interval);

    let mut ctx = ConnCtx {
        room_id: initial_room_id,
        user_id,
        username,
        joined: false,
    };

    let mut events = if let Some(room_id) = ctx.room_id {
        Some(
            state
                .bus
                .subscribe(&Room::namespace_path(&room_id), conn, state.config.subscriber_buffer)
                .await,
        )
    } else {
        None
    };

    loop {
        let event_recv = async {
            match events.as_mut() {
                Some(rx) => rx.recv().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            stream_msg = stream.recv() => {
                match stream_msg {
                    Some(Ok(AggregatedMessage::Ping(bytes))) => {
                        if session.pong(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(AggregatedMessage::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(AggregatedMessage::Text(text))) => {
                        if let Some(new_events) = handle_text(&state, &mut session, &mut ctx, conn, &text).await {
                            events = Some(new_events);
                        }
                    }
                    Some(Ok(AggregatedMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(AggregatedMessage::Binary(_))) => {}
                }
            }
            event = event_recv => {
                match event {
                    Some(event) => {
                        if send_event(&mut session, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                if Instant::now().duration_since(last_pong) > heartbeat_interval * 2 {
                    break;
                }
                if session.ping(b"PING").await.is_err() {
                    break;
                }
            }
        }
    }

    on_disconnect(&state, conn, &ctx).await;
}

async fn send_event(session: &mut Session, event: &ServerEvent) -> Result<(), ()> {
    let payload = serde_json::to_string(event).map_err(|_| ())?;
    session.text(payload).await.map_err(|_| ())
}

/// Returns a freshly subscribed receiver when `join_room`/`create_room`
/// just attached this connection to a room namespace for the first time.
async fn handle_text(
    state: &Arc<AppState>,
    session: &mut Session,
    ctx: &mut ConnCtx,
    conn: ConnectionId,
    text: &str,
) -> Option<tokio::sync::mpsc::Receiver<ServerEvent>> {
    let parsed: Result<RoomClientMessage, _> = serde_json::from_str(text);
    let Ok(message) = parsed else {
        let _ = session
            .text(
                serde_json::to_string(&ServerEvent::JoinError {
                    message: "malformed message".into(),
                })
                .unwrap(),
            )
            .await;
        return None;
    };

    if ctx.joined {
        let room_id = ctx.room_id.expect("joined implies a room is attached");
        state.sessions.touch(conn).await;
        if let Err(err) = dispatch(state, session, ctx, conn, room_id, message.clone()).await {
            let _ = session
                .text(serde_json::to_string(&ServerEvent::MembershipError { message: err.message().into() }).unwrap())
                .await;
        }
    }

    match message {
        RoomClientMessage::CreateRoom {
            username,
            name,
            description,
            kind,
            visibility,
            hidden,
        } if ctx.room_id.is_none() => {
            match state
                .lifecycle
                .create_room(conn, ctx.user_id.clone(), username, name.clone(), description, kind, visibility, hidden, state.config.default_bpm)
                .await
            {
                Ok(room) => {
                    ctx.room_id = Some(room.id);
                    ctx.joined = true;
                    let _ = session
                        .text(serde_json::to_string(&ServerEvent::RoomCreated { room_id: room.id, name }).unwrap())
                        .await;
                    Some(
                        state
                            .bus
                            .subscribe(&Room::namespace_path(&room.id), conn, state.config.subscriber_buffer)
                            .await,
                    )
                }
                Err(err) => {
                    let _ = session
                        .text(serde_json::to_string(&ServerEvent::JoinError { message: err.message().into() }).unwrap())
                        .await;
                    None
                }
            }
        }
        RoomClientMessage::JoinRoom { username, requested_role } if ctx.room_id.is_some() && !ctx.joined => {
            let room_id = ctx.room_id.unwrap();
            match state
                .lifecycle
                .join_room(conn, room_id, ctx.user_id.clone(), username, requested_role)
                .await
            {
                Ok(JoinOutcome::Joined { room_snapshot }) => {
                    ctx.joined = true;
                    let _ = session
                        .text(serde_json::to_string(&ServerEvent::RoomStateUpdated { room: room_snapshot }).unwrap())
                        .await;
                    None
                }
                Ok(JoinOutcome::PendingApproval) => None,
                Err(err) => {
                    let _ = session
                        .text(serde_json::to_string(&ServerEvent::JoinError { message: err.message().into() }).unwrap())
                        .await;
                    None
                }
            }
        }
        _ => None,
    }
}

#[allow(clippy::too_many_lines)]
async fn dispatch(
    state: &Arc<AppState>,
    session: &mut Session,
    ctx: &mut ConnCtx,
    conn: ConnectionId,
    room_id: RoomId,
    message: RoomClientMessage,
) -> Result<(), RoomError> {
    let user_id = ctx.user_id.clone();
    let username = ctx.username.clone();

    match message {
        RoomClientMessage::JoinRoom { .. } | RoomClientMessage::CreateRoom { .. } => Ok(()),
        RoomClientMessage::LeaveRoom { intended } => {
            state.lifecycle.leave_room(conn, room_id, user_id, intended).await
        }
        RoomClientMessage::PlayNote {
            notes,
            velocity,
            instrument,
            category,
            event_type,
            is_key_held,
        } => {
            let event = ServerEvent::NotePlayed {
                user_id: user_id.clone(),
                notes,
                velocity,
                instrument,
                category,
                event_type,
                is_key_held,
            };
            if !state.batcher.enqueue(room_id, event.clone(), state.config.max_queue_size).await {
                state.bus.publish_except(&Room::namespace_path(&room_id), conn, event).await;
            }
            Ok(())
        }
        RoomClientMessage::StopAllNotes => {
            let event = ServerEvent::StopAllNotes { user_id: user_id.clone() };
            if !state.batcher.enqueue(room_id, event.clone(), state.config.max_queue_size).await {
                NotePlayingHandler::stop_all_notes(&state.bus, conn, room_id, user_id).await;
            }
            Ok(())
        }
        RoomClientMessage::ChangeInstrument { instrument, category } => {
            NotePlayingHandler::change_instrument(&state.registry, &state.bus, conn, room_id, user_id, username, instrument, category).await
        }
        RoomClientMessage::UpdateSynthParams { params } => {
            NotePlayingHandler::update_synth_params(&state.registry, &state.bus, room_id, user_id, params).await
        }
        RoomClientMessage::RequestSynthParams { target_user_id } => {
            NotePlayingHandler::request_synth_params(&state.registry, &state.bus, conn, room_id, target_user_id).await
        }
        RoomClientMessage::RequestInstrumentSwap { target_user_id } => {
            state.swaps.request(&state.registry, &state.bus, room_id, user_id, target_user_id).await
        }
        RoomClientMessage::ApproveInstrumentSwap { requester_id } => {
            state.swaps.approve(&state.registry, &state.bus, room_id, user_id, requester_id).await
        }
        RoomClientMessage::RejectInstrumentSwap { requester_id } => {
            state.swaps.reject(&state.bus, room_id, user_id, requester_id).await
        }
        RoomClientMessage::CancelInstrumentSwap => {
            state.swaps.cancel(&state.bus, room_id, user_id).await
        }
        RoomClientMessage::KickUser { user_id: target } => {
            state.lifecycle.kick_user(room_id, user_id, target).await
        }
        RoomClientMessage::TransferOwnership { new_owner_id } => {
            state.lifecycle.transfer_ownership(room_id, user_id, new_owner_id).await
        }
        RoomClientMessage::JoinVoice => {
            let others = VoiceConnectionHandler::join(&state.registry, &state.bus, conn, room_id, user_id).await?;
            let _ = others;
            Ok(())
        }
        RoomClientMessage::LeaveVoice => {
            VoiceConnectionHandler::leave(&state.registry, &state.bus, conn, room_id, user_id).await
        }
        RoomClientMessage::VoiceOffer { target_user_id, sdp } => {
            if let Some(target_conn) = state.sessions.conn_by_user(room_id, &target_user_id).await {
                VoiceConnectionHandler::relay_offer(&state.bus, room_id, target_conn, user_id, sdp).await;
            }
            Ok(())
        }
        RoomClientMessage::VoiceAnswer { target_user_id, sdp } => {
            if let Some(target_conn) = state.sessions.conn_by_user(room_id, &target_user_id).await {
                VoiceConnectionHandler::relay_answer(&state.bus, room_id, target_conn, user_id, sdp).await;
            }
            Ok(())
        }
        RoomClientMessage::VoiceIceCandidate { target_user_id, candidate } => {
            if let Some(target_conn) = state.sessions.conn_by_user(room_id, &target_user_id).await {
                VoiceConnectionHandler::relay_ice_candidate(&state.bus, room_id, target_conn, user_id, candidate).await;
            }
            Ok(())
        }
        RoomClientMessage::RequestMeshConnections => {
            let participants = {
                let guard = state.registry.read().await;
                let room = guard.get_room(&room_id).ok_or(RoomError::RoomNotFound)?;
                room.voice_participants
                    .iter()
                    .filter(|id| **id != user_id)
                    .cloned()
                    .collect::<Vec<_>>()
            };
            for peer_id in participants {
                let _ = session
                    .text(serde_json::to_string(&ServerEvent::UserJoinedVoice { user_id: peer_id }).unwrap())
                    .await;
            }
            Ok(())
        }
        RoomClientMessage::ToggleBroadcast { on } => {
            crate::engine::broadcast::BroadcastHandler::toggle(&state.registry, &state.bus, state.transcoder.as_ref(), room_id, user_id, on).await
        }
        RoomClientMessage::BroadcastAudioChunk { base64 } => {
            use base64::Engine as _;
            let Ok(chunk) = base64::prelude::BASE64_STANDARD.decode(base64.as_bytes()) else {
                return Err(RoomError::InvalidPayload);
            };
            crate::engine::broadcast::BroadcastHandler::push_audio_chunk(&state.registry, state.transcoder.as_ref(), room_id, chunk).await
        }
        RoomClientMessage::RequestBroadcastState => {
            let event = crate::engine::broadcast::BroadcastHandler::request_state(&state.registry, room_id).await?;
            let _ = session.text(serde_json::to_string(&event).unwrap()).await;
            Ok(())
        }
        RoomClientMessage::SetBpm { bpm } => {
            if state.metronome.set_bpm(&state.registry, room_id, bpm).await {
                Ok(())
            } else {
                Err(RoomError::InvalidBpm)
            }
        }
        RoomClientMessage::RequestSequencerState => {
            state
                .bus
                .publish_except(
                    &Room::namespace_path(&room_id),
                    conn,
                    ServerEvent::SequencerStateRequested { from_user_id: user_id },
                )
                .await;
            Ok(())
        }
        RoomClientMessage::SendSequencerState { target_user_id, state: seq_state } => {
            if let Some(target_conn) = state.sessions.conn_by_user(room_id, &target_user_id).await {
                state
                    .bus
                    .send_to(
                        &Room::namespace_path(&room_id),
                        target_conn,
                        ServerEvent::SequencerState { from_user_id: user_id, state: seq_state },
                    )
                    .await;
            }
            Ok(())
        }
    }
}

async fn on_disconnect(state: &Arc<AppState>, conn: ConnectionId, ctx: &ConnCtx) {
    let Some(room_id) = ctx.room_id else {
        return;
    };

    state.bus.unsubscribe_all(conn).await;

    if !ctx.joined {
        return;
    }

    let user_id = ctx.user_id.clone();

    state.swaps.on_disconnect(&state.bus, room_id, user_id.clone()).await;
    VoiceConnectionHandler::on_disconnect(&state.registry, &state.bus, conn, room_id, user_id.clone()).await;

    let is_owner = state
        .registry
        .read()
        .await
        .get_room(&room_id)
        .map(|r| r.owner == user_id)
        .unwrap_or(false);
    if is_owner {
        crate::engine::broadcast::BroadcastHandler::on_owner_disconnect(
            &state.registry,
            &state.bus,
            state.transcoder.as_ref(),
            room_id,
            user_id.clone(),
        )
        .await;
    }

    let _ = state.lifecycle.leave_room(conn, room_id, user_id, false).await;
}

/// `GET /ws/lobby-monitor` — subscribers receive `room_created`/
/// `room_removed` events as rooms come and go (spec.md §4.1, SPEC_FULL.md
/// §C "lobby snapshot listing").
pub async fn lobby_ws(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<Arc<AppState>>,
) -> actix_web::Result<impl Responder> {
    let app_state = state.get_ref().clone();
    let Some(slot) = app_state.try_acquire_connection_slot() else {
        return Ok(HttpResponse::ServiceUnavailable().body("server at capacity"));
    };

    let (response, mut session, stream) = actix_ws::handle(&req, body)?;
    let mut stream = stream.max_frame_size(64 * 1024).aggregate_continuations();
    let conn: ConnectionId = Uuid::new_v4();

    tokio::spawn(async move {
        let _slot = slot;
        let mut rx = app_state.bus.subscribe(LOBBY_NAMESPACE, conn, 32).await;
        let mut ticker = tokio::time::interval(Duration::from_secs(30));

        loop {
            tokio::select! {
                biased;
                msg = stream.recv() => {
                    match msg {
                        Some(Ok(AggregatedMessage::Ping(bytes))) => {
                            if session.pong(&bytes).await.is_err() { break; }
                        }
                        Some(Ok(AggregatedMessage::Close(_))) | None | Some(Err(_)) => break,
                        _ => {}
                    }
                }
                event = rx.recv() => {
                    match event {
                        Some(event) => { if send_event(&mut session, &event).await.is_err() { break; } }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    if session.ping(b"PING").await.is_err() { break; }
                }
            }
        }

        app_state.bus.unsubscribe(LOBBY_NAMESPACE, conn).await;
    });

    Ok(response)
}

/// `GET /ws/approval/{room_id}` — carries `ApprovalClientMessage` and
/// owner-facing approval decisions for one pending membership request.
pub async fn approval_ws(
    req: HttpRequest,
    body: web::Payload,
    path: web::Path<RoomId>,
    query: web::Query<ConnectQuery>,
    state: web::Data<Arc<AppState>>,
) -> actix_web::Result<impl Responder> {
    let identity = match state.identity.verify(&query.token).await {
        Ok(identity) => identity,
        Err(_) => return Ok(HttpResponse::Unauthorized().finish()),
    };

    let app_state = state.get_ref().clone();
    let Some(slot) = app_state.try_acquire_connection_slot() else {
        return Ok(HttpResponse::ServiceUnavailable().body("server at capacity"));
    };

    let room_id = path.into_inner();
    let (response, mut session, stream) = actix_ws::handle(&req, body)?;
    let mut stream = stream.max_frame_size(64 * 1024).aggregate_continuations();
    let conn: ConnectionId = Uuid::new_v4();
    let user_id = identity.user_id;
    let username = identity.username;

    tokio::spawn(async move {
        let _slot = slot;
        let mut rx = app_state
            .bus
            .subscribe(&Room::approval_namespace_path(&room_id), conn, 16)
            .await;
        let mut ticker = tokio::time::interval(Duration::from_secs(30));

        loop {
            tokio::select! {
                biased;
                msg = stream.recv() => {
                    match msg {
                        Some(Ok(AggregatedMessage::Text(text))) => {
                            if let Ok(cmd) = serde_json::from_str::<ApprovalClientMessage>(&text) {
                                handle_approval_message(&app_state, conn, room_id, &user_id, &username, cmd).await;
                            }
                        }
                        Some(Ok(AggregatedMessage::Ping(bytes))) => {
                            if session.pong(&bytes).await.is_err() { break; }
                        }
                        Some(Ok(AggregatedMessage::Close(_))) | None | Some(Err(_)) => break,
                        _ => {}
                    }
                }
                event = rx.recv() => {
                    match event {
                        Some(event) => { if send_event(&mut session, &event).await.is_err() { break; } }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    if session.ping(b"PING").await.is_err() { break; }
                }
            }
        }

        app_state.bus.unsubscribe(&Room::approval_namespace_path(&room_id), conn).await;
        app_state.approvals.disconnect(room_id, user_id).await;
    });

    Ok(response)
}

async fn handle_approval_message(
    state: &Arc<AppState>,
    conn: ConnectionId,
    room_id: RoomId,
    user_id: &UserId,
    username: &str,
    message: ApprovalClientMessage,
) {
    let result = match message {
        ApprovalClientMessage::ApprovalRequest { username: requested_username, role } => {
            state
                .approvals
                .request(
                    conn,
                    room_id,
                    user_id.clone(),
                    requested_username,
                    role.unwrap_or(UserRole::BandMember),
                )
                .await
        }
        ApprovalClientMessage::ApprovalCancel => state.approvals.cancel(room_id, user_id.clone()).await,
        ApprovalClientMessage::ApproveApproval { user_id: requester } => {
            state.approvals.approve(room_id, user_id.clone(), requester).await
        }
        ApprovalClientMessage::RejectApproval { user_id: requester } => {
            state.approvals.reject(room_id, user_id.clone(), requester).await
        }
    };

    let _ = username;
    if let Err(err) = result {
        state
            .bus
            .send_to(
                &Room::approval_namespace_path(&room_id),
                conn,
                ServerEvent::ApprovalError { message: err.message().into() },
            )
            .await;
    }
}
