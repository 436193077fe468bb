//! Session coordinator error types.
//!
//! Error types map to protocol error codes for client responses.
//! Internal details are logged server-side but not exposed to clients.

use crate::protocol::ServerEvent;

use thiserror::Error;

/// Session coordinator error type.
///
/// Maps to protocol error codes:
/// - `Authentication`: `UNAUTHORIZED` (2)
/// - `AccessDenied`: `FORBIDDEN` (3)
/// - `ProjectNotFound`, `TrackNotFound`: `NOT_FOUND` (4)
/// - `LockConflict`: `CONFLICT` (5)
/// - `Persistence`, `Internal`: `INTERNAL_ERROR` (6)
/// - `Draining`: `CAPACITY_EXCEEDED` (7)
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Token verification failed at connection time.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Project does not exist in the store.
    #[error("Project not found")]
    ProjectNotFound,

    /// Authenticated user is not a collaborator on the project.
    #[error("Access denied")]
    AccessDenied,

    /// Track is locked by another participant.
    #[error("Track is locked by {locked_by}")]
    LockConflict {
        /// Display name of the current lock holder.
        locked_by: String,
    },

    /// Track does not exist in the project.
    #[error("Track not found")]
    TrackNotFound,

    /// Persistence layer failure.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Coordinator is draining (graceful shutdown).
    #[error("Coordinator is draining")]
    Draining,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Returns the protocol error code value for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            CoordinatorError::Authentication(_) => 2, // UNAUTHORIZED
            CoordinatorError::AccessDenied => 3,      // FORBIDDEN
            CoordinatorError::ProjectNotFound | CoordinatorError::TrackNotFound => 4, // NOT_FOUND
            CoordinatorError::LockConflict { .. } => 5, // CONFLICT
            CoordinatorError::Persistence(_) | CoordinatorError::Internal(_) => 6, // INTERNAL_ERROR
            CoordinatorError::Draining => 7,          // CAPACITY_EXCEEDED
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            CoordinatorError::Authentication(_) => "Invalid or expired token".to_string(),
            CoordinatorError::ProjectNotFound => "Project not found".to_string(),
            CoordinatorError::AccessDenied => {
                "You are not a collaborator on this project".to_string()
            }
            CoordinatorError::LockConflict { .. } => "Track is locked".to_string(),
            CoordinatorError::TrackNotFound => "Track not found".to_string(),
            CoordinatorError::Persistence(_) | CoordinatorError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            CoordinatorError::Draining => "Server is shutting down, please reconnect".to_string(),
        }
    }

    /// Render this error as a protocol `error` event for the offending client.
    ///
    /// `LockConflict` additionally carries the display name of the current
    /// lock holder so the client can show who has the track.
    #[must_use]
    pub fn to_error_event(&self) -> ServerEvent {
        let locked_by = match self {
            CoordinatorError::LockConflict { locked_by } => Some(locked_by.clone()),
            _ => None,
        };

        ServerEvent::Error {
            message: self.client_message(),
            locked_by,
        }
    }
}
