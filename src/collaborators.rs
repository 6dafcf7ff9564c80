//! External collaborator interfaces (spec.md §6 "External Interfaces").
//!
//! The room engine only ever talks to identity verification and HLS
//! transcoding through these traits; who actually authenticates a user or
//! runs the transcoder subprocess is out of scope here (SPEC_FULL.md §A —
//! the HTTP auth surface and transcoding subprocess internals are
//! non-goals). Grounded on the teacher's `spotify.rs`/`discord.rs` split
//! between "room logic" and "talks to an external system" modules, folded
//! into `async_trait` objects so the engine can depend on the interface
//! rather than a concrete implementation.

use async_trait::async_trait;

use crate::engine::room::{RoomId, UserId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentityError {
    Invalid,
    Expired,
}

/// Verifies a bearer credential presented at WebSocket upgrade time into a
/// `(userId, username)` pair. The concrete implementation (session cookie,
/// JWT, OAuth introspection) lives outside this crate's scope.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, IdentityError>;
}

/// Development stand-in: treats the presented token itself as the user id
/// and echoes it back as the username. Never wired up when `Config::is_prod`
/// is set; production deployments supply their own `IdentityVerifier`.
pub struct AnonymousIdentityVerifier;

#[async_trait]
impl IdentityVerifier for AnonymousIdentityVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, IdentityError> {
        if token.trim().is_empty() {
            return Err(IdentityError::Invalid);
        }
        Ok(VerifiedIdentity {
            user_id: token.to_owned(),
            username: token.to_owned(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BroadcastError {
    AlreadyActive,
    NotActive,
    TranscoderUnavailable,
}

/// Drives an HLS broadcast for one room. `start`/`stop` bracket the
/// transcoder subprocess's lifetime; `push_audio_chunk` forwards decoded
/// audio as it arrives. Internals of the transcoder process are out of
/// scope (SPEC_FULL.md §A).
#[async_trait]
pub trait BroadcastTranscoder: Send + Sync {
    async fn start(&self, room_id: RoomId) -> Result<String, BroadcastError>;
    async fn push_audio_chunk(&self, room_id: RoomId, chunk: Vec<u8>) -> Result<(), BroadcastError>;
    async fn stop(&self, room_id: RoomId) -> Result<(), BroadcastError>;
}

/// Development stand-in that accepts the lifecycle calls but performs no
/// actual transcoding, returning a fixed placeholder playlist URL.
pub struct NullBroadcastTranscoder;

#[async_trait]
impl BroadcastTranscoder for NullBroadcastTranscoder {
    async fn start(&self, room_id: RoomId) -> Result<String, BroadcastError> {
        Ok(format!("/broadcasts/{room_id}/playlist.m3u8"))
    }

    async fn push_audio_chunk(&self, _room_id: RoomId, _chunk: Vec<u8>) -> Result<(), BroadcastError> {
        Ok(())
    }

    async fn stop(&self, _room_id: RoomId) -> Result<(), BroadcastError> {
        Ok(())
    }
}
