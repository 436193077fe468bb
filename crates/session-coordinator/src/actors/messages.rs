//! Message types for the actor system.
//!
//! All request/response interactions use oneshot `respond_to` channels;
//! fire-and-forget mutations (track edits, locks, ephemeral broadcasts)
//! are plain mailbox sends.

use crate::errors::CoordinatorError;
use crate::protocol::{LockEntry, NewTrack, ParticipantInfo, ServerEvent, SessionSnapshot};
use crate::store::TrackUpdate;

use super::session::SessionActorHandle;

use common::auth::Identity;
use common::types::{ConnectionId, ProjectId, SessionId, TrackId};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

/// Messages handled by a `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Deliver a server event to the client socket.
    Deliver {
        /// Event to serialize onto the wire.
        event: ServerEvent,
    },
    /// Close the connection.
    Close {
        /// Reason for closing (logged, not sent to the client).
        reason: String,
    },
}

/// An out-of-band project change relayed through the session.
#[derive(Debug, Clone)]
pub struct ProjectUpdateNotice {
    /// Project the change applies to (relayed verbatim).
    pub project_id: ProjectId,
    /// Kind of change (free-form, e.g. "metadata", "rename").
    pub update_type: String,
    /// Change details, opaque to the coordinator.
    pub metadata: serde_json::Value,
    /// Client-supplied timestamp; stamped server-side when absent.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Messages handled by a `SessionActor`.
pub enum SessionMessage {
    /// A verified connection joins the session.
    Join {
        connection_id: ConnectionId,
        identity: Identity,
        /// Outbound channel of the connection's socket writer.
        outbound: mpsc::Sender<ServerEvent>,
        respond_to: oneshot::Sender<Result<SessionSnapshot, CoordinatorError>>,
    },

    /// A connection leaves (explicit leave or transport disconnect).
    /// Responds with the number of remaining participants.
    Leave {
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<usize>,
    },

    /// Append a new track.
    AddTrack {
        connection_id: ConnectionId,
        track_data: NewTrack,
    },

    /// Partially update a track (lock-checked).
    UpdateTrack {
        connection_id: ConnectionId,
        track_id: TrackId,
        updates: TrackUpdate,
    },

    /// Remove a track.
    DeleteTrack {
        connection_id: ConnectionId,
        track_id: TrackId,
    },

    /// Acquire an advisory lock on a track.
    LockTrack {
        connection_id: ConnectionId,
        track_id: TrackId,
    },

    /// Release the lock on a track.
    UnlockTrack {
        connection_id: ConnectionId,
        track_id: TrackId,
    },

    /// Ephemeral transport state fan-out.
    PlayState {
        connection_id: ConnectionId,
        is_playing: bool,
    },

    /// Ephemeral cursor position fan-out.
    CursorPosition {
        connection_id: ConnectionId,
        position: f64,
    },

    /// Relay an out-of-band project change to session peers.
    ProjectUpdated {
        connection_id: ConnectionId,
        notice: ProjectUpdateNotice,
    },

    /// Get current session state (registry queries, tests).
    GetState {
        respond_to: oneshot::Sender<SessionState>,
    },
}

/// Snapshot of a session actor's state for registry queries and tests.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Session identifier.
    pub session_id: SessionId,
    /// Project bound to this session.
    pub project_id: ProjectId,
    /// Participants in join order.
    pub participants: Vec<ParticipantInfo>,
    /// Held locks.
    pub locks: Vec<LockEntry>,
    /// Number of cached tracks.
    pub track_count: usize,
    /// Current mailbox depth.
    pub mailbox_depth: usize,
}

/// Successful join response from the coordinator.
#[derive(Debug)]
pub struct JoinAck {
    /// Snapshot taken as the join completed. The joiner has already
    /// received it as `session-state` on its outbound channel.
    pub snapshot: SessionSnapshot,
    /// Handle for routing this connection's subsequent session events.
    pub session: SessionActorHandle,
}

/// Messages handled by the `CoordinatorActor`.
pub enum CoordinatorMessage {
    /// Route a verified connection into a session, spawning the session
    /// actor on first join.
    JoinSession {
        session_id: SessionId,
        project_id: ProjectId,
        connection_id: ConnectionId,
        identity: Identity,
        outbound: mpsc::Sender<ServerEvent>,
        respond_to: oneshot::Sender<Result<JoinAck, CoordinatorError>>,
    },

    /// Remove a connection from a session; deletes the session record
    /// when the last participant leaves.
    LeaveSession {
        session_id: SessionId,
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<()>,
    },

    /// Look up a live session by id.
    GetSession {
        session_id: SessionId,
        respond_to: oneshot::Sender<Option<SessionActorHandle>>,
    },

    /// Get the current coordinator status.
    GetStatus {
        respond_to: oneshot::Sender<CoordinatorStatus>,
    },

    /// Initiate graceful shutdown.
    Shutdown {
        respond_to: oneshot::Sender<Result<(), CoordinatorError>>,
    },
}

/// Coordinator status summary.
#[derive(Debug, Clone)]
pub struct CoordinatorStatus {
    /// Number of live sessions.
    pub session_count: usize,
    /// Number of live connections across all sessions.
    pub connection_count: usize,
    /// Whether the coordinator has stopped accepting joins.
    pub is_draining: bool,
    /// Current coordinator mailbox depth.
    pub mailbox_depth: usize,
}
