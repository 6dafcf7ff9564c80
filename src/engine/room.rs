//! The `Room` / `User` aggregate (spec.md §3 "DATA MODEL").
//!
//! Grounded on `sharify/room.rs`: a plain data struct plus a co-located
//! `RoomError` enum, `Serialize`-able for broadcasting room snapshots.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type RoomId = Uuid;
pub type UserId = String;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Perform,
    Arrange,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomVisibility {
    Public,
    Private,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    RoomOwner,
    BandMember,
    Audience,
}

pub type Instrument = String;
pub type Category = String;

/// In-room user record (spec.md §3 "User").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub role: UserRole,
    #[serde(default)]
    pub is_ready: bool,
    #[serde(default)]
    pub current_instrument: Option<Instrument>,
    #[serde(default)]
    pub current_category: Option<Category>,
    #[serde(default)]
    pub synth_params: Option<serde_json::Value>,
    #[serde(default)]
    pub effect_chains: Option<serde_json::Value>,
}

impl User {
    pub fn new(id: UserId, username: String, role: UserRole) -> Self {
        Self {
            id,
            username,
            role,
            is_ready: false,
            current_instrument: None,
            current_category: None,
            synth_params: None,
            effect_chains: None,
        }
    }

    pub fn is_synthesizer(&self) -> bool {
        self.current_category.as_deref() == Some("synthesizer")
    }
}

#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct Metronome {
    pub bpm: u32,
    /// Milliseconds since the scheduler's epoch instant; `None` before the
    /// first tick fires.
    pub last_tick_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BroadcastState {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playlist_url: Option<String>,
}

/// The `Room` aggregate. `RoomRegistry` owns these, one per active session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub owner: UserId,
    pub kind: RoomKind,
    pub visibility: RoomVisibility,
    #[serde(default)]
    pub hidden: bool,
    pub users: HashMap<UserId, User>,
    pub pending_members: HashMap<UserId, User>,
    pub metronome: Metronome,
    pub broadcast: BroadcastState,
    #[serde(skip)]
    pub created_at: Option<Instant>,
    #[serde(skip)]
    pub voice_participants: std::collections::HashSet<UserId>,
    #[serde(skip)]
    pub last_empty_since: Option<Instant>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RoomError {
    RoomNotFound,
    RoomUserNotFound,
    Unauthorized,
    UserAlreadyInRoom,
    UserAlreadyPending,
    InvalidBpm,
    RoomCreationFailed,
    InvalidPayload,
}

impl RoomError {
    pub fn message(&self) -> &'static str {
        match self {
            RoomError::RoomNotFound => "room not found",
            RoomError::RoomUserNotFound => "user not found in room",
            RoomError::Unauthorized => "not authorized",
            RoomError::UserAlreadyInRoom => "user already in room",
            RoomError::UserAlreadyPending => "user already awaiting approval",
            RoomError::InvalidBpm => "bpm out of range",
            RoomError::RoomCreationFailed => "room creation failed",
            RoomError::InvalidPayload => "invalid payload",
        }
    }
}

impl Room {
    pub fn new(
        id: RoomId,
        owner_id: UserId,
        owner_username: String,
        name: String,
        description: Option<String>,
        kind: RoomKind,
        visibility: RoomVisibility,
        hidden: bool,
        default_bpm: u32,
    ) -> Self {
        let mut users = HashMap::new();
        users.insert(
            owner_id.clone(),
            User::new(owner_id.clone(), owner_username, UserRole::RoomOwner),
        );

        Self {
            id,
            name,
            description,
            owner: owner_id,
            kind,
            visibility,
            hidden,
            users,
            pending_members: HashMap::new(),
            metronome: Metronome {
                bpm: default_bpm,
                last_tick_ms: None,
            },
            broadcast: BroadcastState::default(),
            created_at: Some(Instant::now()),
            voice_participants: std::collections::HashSet::new(),
            last_empty_since: None,
        }
    }

    /// Invariant 1 (spec.md §8): `owner ∈ users ∨ users = ∅`.
    pub fn owner_invariant_holds(&self) -> bool {
        self.users.is_empty() || self.users.contains_key(&self.owner)
    }

    /// Invariant 2: a userId is never in both `users` and `pendingMembers`.
    pub fn membership_invariant_holds(&self, user_id: &UserId) -> bool {
        !(self.users.contains_key(user_id) && self.pending_members.contains_key(user_id))
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn get_user(&self, user_id: &UserId) -> Option<&User> {
        self.users.get(user_id)
    }

    pub fn get_user_mut(&mut self, user_id: &UserId) -> Option<&mut User> {
        self.users.get_mut(user_id)
    }

    pub fn synthesizer_users(&self) -> Vec<&User> {
        self.users.values().filter(|u| u.is_synthesizer()).collect()
    }

    pub fn namespace_path(id: &RoomId) -> String {
        format!("/room/{id}")
    }

    pub fn approval_namespace_path(id: &RoomId) -> String {
        format!("/approval/{id}")
    }
}

pub const LOBBY_NAMESPACE: &str = "/lobby-monitor";
