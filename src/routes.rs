use std::sync::Arc;

use actix_web::{get, web, HttpResponse, Responder};

use crate::engine::registry::RoomSummary;
use crate::state::AppState;
use crate::ws::instance;

#[get("/")]
pub async fn root() -> impl Responder {
    HttpResponse::Ok()
}

/// Snapshot read of public, non-hidden rooms (spec.md §5 "cross-room
/// operations: rare... read a snapshot"). Live updates are carried over
/// `/ws/lobby-monitor` instead.
#[get("/v1/rooms")]
pub async fn list_rooms(state: web::Data<Arc<AppState>>) -> impl Responder {
    let rooms: Vec<RoomSummary> = state.registry.read().await.list_public_rooms();
    HttpResponse::Ok().json(rooms)
}

pub fn configure_ws(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/ws/room/{room_id}").route(web::get().to(instance::room_ws)))
        .service(web::resource("/ws/approval/{room_id}").route(web::get().to(instance::approval_ws)))
        .service(web::resource("/ws/lobby-monitor").route(web::get().to(instance::lobby_ws)));
}
