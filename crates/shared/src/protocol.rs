//! Session protocol: inbound event frames and endpoint paths.

use serde::{Deserialize, Serialize};

use crate::models::{
    id_from_string_or_number, opt_id_from_string_or_number, CartSnapshot, Order, Participant,
    SessionPatch, SessionState,
};

/// Close code the server uses for an intended shutdown. Anything else is
/// treated as an unexpected close.
pub const CLEAN_CLOSE_CODE: u16 = 1000;

/// Archival delay assumed when `session_completed` does not carry one (30 minutes).
pub const DEFAULT_ARCHIVE_DELAY_MS: u64 = 1_800_000;

/// Query parameter carrying the bearer token on the duplex endpoint.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Server-pushed events, framed as `{"type": "...", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionState(SessionState),
    SessionUpdate(SessionPatch),
    ParticipantJoined(Participant),
    ParticipantLeft(Participant),
    ParticipantApproved(Participant),
    OrderCreated(Order),
    OrderUpdated(Order),
    SessionLocked(LockChange),
    SessionUnlocked(LockChange),
    SessionCompleted(SessionCompleted),
    SessionArchived(SessionArchived),
    TableReleased(TableReleased),
    CartState(CartSnapshot),
    CartUpdate(CartSnapshot),
}

/// Discriminant of [`SessionEvent`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionState,
    SessionUpdate,
    ParticipantJoined,
    ParticipantLeft,
    ParticipantApproved,
    OrderCreated,
    OrderUpdated,
    SessionLocked,
    SessionUnlocked,
    SessionCompleted,
    SessionArchived,
    TableReleased,
    CartState,
    CartUpdate,
}

impl EventKind {
    /// Wire tag of this event kind.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::SessionState => "session_state",
            EventKind::SessionUpdate => "session_update",
            EventKind::ParticipantJoined => "participant_joined",
            EventKind::ParticipantLeft => "participant_left",
            EventKind::ParticipantApproved => "participant_approved",
            EventKind::OrderCreated => "order_created",
            EventKind::OrderUpdated => "order_updated",
            EventKind::SessionLocked => "session_locked",
            EventKind::SessionUnlocked => "session_unlocked",
            EventKind::SessionCompleted => "session_completed",
            EventKind::SessionArchived => "session_archived",
            EventKind::TableReleased => "table_released",
            EventKind::CartState => "cart_state",
            EventKind::CartUpdate => "cart_update",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::SessionState(_) => EventKind::SessionState,
            SessionEvent::SessionUpdate(_) => EventKind::SessionUpdate,
            SessionEvent::ParticipantJoined(_) => EventKind::ParticipantJoined,
            SessionEvent::ParticipantLeft(_) => EventKind::ParticipantLeft,
            SessionEvent::ParticipantApproved(_) => EventKind::ParticipantApproved,
            SessionEvent::OrderCreated(_) => EventKind::OrderCreated,
            SessionEvent::OrderUpdated(_) => EventKind::OrderUpdated,
            SessionEvent::SessionLocked(_) => EventKind::SessionLocked,
            SessionEvent::SessionUnlocked(_) => EventKind::SessionUnlocked,
            SessionEvent::SessionCompleted(_) => EventKind::SessionCompleted,
            SessionEvent::SessionArchived(_) => EventKind::SessionArchived,
            SessionEvent::TableReleased(_) => EventKind::TableReleased,
            SessionEvent::CartState(_) => EventKind::CartState,
            SessionEvent::CartUpdate(_) => EventKind::CartUpdate,
        }
    }
}

/// Payload of `session_locked` / `session_unlocked`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LockChange {
    /// Participant who toggled the lock, when known.
    #[serde(
        default,
        alias = "locked_by",
        alias = "unlocked_by",
        deserialize_with = "opt_id_from_string_or_number"
    )]
    pub actor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SessionCompleted {
    /// Milliseconds until the server archives the session.
    #[serde(default)]
    pub will_archive_in: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl SessionCompleted {
    pub fn archive_delay_ms(&self) -> u64 {
        self.will_archive_in.unwrap_or(DEFAULT_ARCHIVE_DELAY_MS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionArchived {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub session_id: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub redirect_suggested: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableReleased {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub table_id: String,
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub table_number: String,
    #[serde(default)]
    pub message: Option<String>,
}

// --- Endpoint paths (relative to the configured base URLs) ---

fn seg(value: &str) -> std::borrow::Cow<'_, str> {
    urlencoding::encode(value)
}

/// Duplex endpoint for a session: `session/<id>/`.
pub fn session_socket_path(session_id: &str) -> String {
    format!("session/{}/", seg(session_id))
}

pub fn session_path(session_id: &str) -> String {
    format!("sessions/{}/", seg(session_id))
}

pub fn cart_path(session_id: &str) -> String {
    format!("sessions/{}/cart/", seg(session_id))
}

pub fn cart_add_path(session_id: &str) -> String {
    format!("sessions/{}/cart_add/", seg(session_id))
}

pub fn cart_update_path(session_id: &str, item_id: &str) -> String {
    format!("sessions/{}/cart_update/{}/", seg(session_id), seg(item_id))
}

pub fn cart_remove_path(session_id: &str, item_id: &str) -> String {
    format!("sessions/{}/cart_remove/{}/", seg(session_id), seg(item_id))
}

pub fn cart_clear_path(session_id: &str) -> String {
    format!("sessions/{}/cart_clear/", seg(session_id))
}

pub fn lock_path(session_id: &str) -> String {
    format!("sessions/{}/lock/", seg(session_id))
}

pub fn unlock_path(session_id: &str) -> String {
    format!("sessions/{}/unlock/", seg(session_id))
}
