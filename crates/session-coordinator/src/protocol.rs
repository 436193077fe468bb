//! Wire protocol for the collaboration WebSocket.
//!
//! Every frame is a JSON object `{"event": <kebab-case name>, "data": <payload>}`
//! with camelCase payload fields. [`ClientEvent`] covers client-to-coordinator
//! frames, [`ServerEvent`] coordinator-to-client frames.
//!
//! Payload shapes are closed: `track-update` in particular deserializes into
//! the [`TrackUpdate`] field set and rejects unknown fields instead of
//! merging arbitrary keys into a track.

use crate::store::{Track, TrackUpdate};

use common::types::{ProjectId, SessionId, TrackId, UserId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A new track as submitted by a client (`track-add`).
///
/// Identifier, mix defaults, and ordering are assigned server-side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NewTrack {
    /// Track name.
    pub name: String,
    /// Instrument label.
    pub instrument: String,
    /// Note/pattern payload, opaque to the coordinator.
    #[serde(default)]
    pub notes: String,
}

/// One participant as seen in snapshots and join broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    /// User identifier.
    pub user_id: UserId,
    /// Display name from the verified token.
    pub display_name: String,
    /// Connection identifier (distinct per device).
    pub connection_id: common::types::ConnectionId,
    /// Cursor/avatar color assigned at join time.
    pub color: String,
}

/// One held lock as seen in snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockEntry {
    /// Locked track.
    pub track_id: TrackId,
    /// Lock owner.
    pub user_id: UserId,
    /// Lock owner's display name.
    pub display_name: String,
}

/// Full session snapshot sent to a joining connection (`session-state`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Participants in join order, including the joiner.
    pub participants: Vec<ParticipantInfo>,
    /// Cached track list.
    pub tracks: Vec<Track>,
    /// Held locks as a list of pairs.
    pub locks: Vec<LockEntry>,
    /// Project tempo.
    pub bpm: u32,
    /// Project time signature.
    pub time_signature: String,
}

/// Client-to-coordinator events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Join a named session for a project.
    JoinSession {
        project_id: ProjectId,
        session_id: SessionId,
    },

    /// Leave the connection's bound session.
    LeaveSession {},

    /// Append a new track to the project.
    TrackAdd { track_data: NewTrack },

    /// Partially update a track (lock-checked).
    TrackUpdate {
        track_id: TrackId,
        updates: TrackUpdate,
    },

    /// Remove a track from the project.
    TrackDelete { track_id: TrackId },

    /// Acquire an advisory lock on a track.
    LockTrack { track_id: TrackId },

    /// Release the lock on a track (unconditional).
    UnlockTrack { track_id: TrackId },

    /// Ephemeral transport state broadcast.
    PlayState { is_playing: bool },

    /// Ephemeral cursor position broadcast.
    CursorPosition { position: f64 },

    /// Relay an out-of-band project change to session peers.
    ProjectUpdated {
        project_id: ProjectId,
        update_type: String,
        #[serde(default)]
        metadata: serde_json::Value,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
}

/// Coordinator-to-client events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Full snapshot, sent to the joining connection only.
    SessionState(SessionSnapshot),

    /// A participant joined (sent to everyone else).
    UserJoined {
        user_id: UserId,
        display_name: String,
        color: String,
    },

    /// A participant left (sent to remaining participants).
    UserLeft {
        user_id: UserId,
        display_name: String,
    },

    /// A track was appended (sent to everyone including the caller).
    TrackAdded {
        track: Track,
        added_by: UserId,
        display_name: String,
    },

    /// A track was partially updated (sent to everyone except the caller).
    TrackUpdated {
        track_id: TrackId,
        updates: TrackUpdate,
        updated_by: UserId,
        display_name: String,
    },

    /// A track was removed (sent to everyone including the caller).
    TrackDeleted {
        track_id: TrackId,
        deleted_by: UserId,
    },

    /// A lock was acquired (sent to everyone including the caller).
    TrackLocked {
        track_id: TrackId,
        user_id: UserId,
        display_name: String,
    },

    /// A lock was released (sent to everyone including the caller).
    TrackUnlocked { track_id: TrackId, user_id: UserId },

    /// Transport state changed (sent to everyone except the caller).
    PlayStateChanged { is_playing: bool, user_id: UserId },

    /// Cursor moved (sent to everyone except the caller).
    UserCursor { user_id: UserId, position: f64 },

    /// Out-of-band project change relayed to session peers.
    ProjectUpdated {
        project_id: ProjectId,
        update_type: String,
        metadata: serde_json::Value,
        timestamp: DateTime<Utc>,
        user_id: UserId,
        display_name: String,
    },

    /// Operation failure, sent to the offending caller only.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        locked_by: Option<String>,
    },
}
