//! Test client harness for driving sessions through the coordinator.
//!
//! [`TestClient`] plays the role of one connected participant without a
//! real WebSocket: it joins through [`CoordinatorActorHandle`], holds the
//! outbound event channel a socket writer would drain, and forwards
//! operations to the bound session the way the transport layer does.

use common::auth::Identity;
use common::types::{ConnectionId, ProjectId, SessionId, TrackId};

use session_coordinator::actors::{
    CoordinatorActorHandle, ProjectUpdateNotice, SessionActorHandle,
};
use session_coordinator::errors::CoordinatorError;
use session_coordinator::protocol::{NewTrack, ServerEvent, SessionSnapshot};
use session_coordinator::store::TrackUpdate;

use std::time::Duration;
use tokio::sync::mpsc;

/// How long to wait for an expected event before failing the test.
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait when asserting that NO event arrives.
const SILENCE_TIMEOUT: Duration = Duration::from_millis(100);

/// One connected participant under test.
pub struct TestClient {
    /// Connection id used for all forwarded operations.
    pub connection_id: ConnectionId,
    /// The verified identity this client joined with.
    pub identity: Identity,
    /// Snapshot received at join time.
    pub snapshot: SessionSnapshot,
    session_id: SessionId,
    session: SessionActorHandle,
    events: mpsc::Receiver<ServerEvent>,
}

impl TestClient {
    /// Join a session through the coordinator.
    ///
    /// Consumes the `session-state` event the session delivers on the
    /// outbound channel, so the first `recv` after a successful join sees
    /// the first broadcast instead.
    ///
    /// # Errors
    ///
    /// Propagates the coordinator's rejection (missing project, access
    /// denied, draining).
    ///
    /// # Panics
    ///
    /// Panics if the join succeeds but no snapshot arrives.
    pub async fn join(
        coordinator: &CoordinatorActorHandle,
        session_id: impl Into<SessionId>,
        project_id: ProjectId,
        identity: Identity,
    ) -> Result<Self, CoordinatorError> {
        let session_id = session_id.into();
        let connection_id = ConnectionId::new();
        let (out_tx, mut events) = mpsc::channel(64);

        let ack = coordinator
            .join_session(
                session_id.clone(),
                project_id,
                connection_id,
                identity.clone(),
                out_tx,
            )
            .await?;

        let snapshot = match tokio::time::timeout(RECV_TIMEOUT, events.recv()).await {
            Ok(Some(ServerEvent::SessionState(snapshot))) => snapshot,
            other => panic!("expected session-state on join, got {other:?}"),
        };

        Ok(Self {
            connection_id,
            identity,
            snapshot,
            session_id,
            session: ack.session,
            events,
        })
    }

    /// Leave the session through the coordinator.
    ///
    /// # Panics
    ///
    /// Panics if the coordinator is unreachable.
    pub async fn leave(&mut self, coordinator: &CoordinatorActorHandle) {
        coordinator
            .leave_session(self.session_id.clone(), self.connection_id)
            .await
            .expect("leave should reach the coordinator");
    }

    /// Append a track with empty notes.
    ///
    /// # Panics
    ///
    /// Panics if the session mailbox is closed.
    pub async fn add_track(&self, name: &str, instrument: &str) {
        self.session
            .add_track(
                self.connection_id,
                NewTrack {
                    name: name.to_string(),
                    instrument: instrument.to_string(),
                    notes: String::new(),
                },
            )
            .await
            .expect("add_track should reach the session");
    }

    /// Partially update a track.
    ///
    /// # Panics
    ///
    /// Panics if the session mailbox is closed.
    pub async fn update_track(&self, track_id: TrackId, updates: TrackUpdate) {
        self.session
            .update_track(self.connection_id, track_id, updates)
            .await
            .expect("update_track should reach the session");
    }

    /// Delete a track.
    ///
    /// # Panics
    ///
    /// Panics if the session mailbox is closed.
    pub async fn delete_track(&self, track_id: TrackId) {
        self.session
            .delete_track(self.connection_id, track_id)
            .await
            .expect("delete_track should reach the session");
    }

    /// Acquire an advisory lock.
    ///
    /// # Panics
    ///
    /// Panics if the session mailbox is closed.
    pub async fn lock_track(&self, track_id: TrackId) {
        self.session
            .lock_track(self.connection_id, track_id)
            .await
            .expect("lock_track should reach the session");
    }

    /// Release a lock.
    ///
    /// # Panics
    ///
    /// Panics if the session mailbox is closed.
    pub async fn unlock_track(&self, track_id: TrackId) {
        self.session
            .unlock_track(self.connection_id, track_id)
            .await
            .expect("unlock_track should reach the session");
    }

    /// Broadcast a transport state change.
    ///
    /// # Panics
    ///
    /// Panics if the session mailbox is closed.
    pub async fn play_state(&self, is_playing: bool) {
        self.session
            .play_state(self.connection_id, is_playing)
            .await
            .expect("play_state should reach the session");
    }

    /// Broadcast a cursor position.
    ///
    /// # Panics
    ///
    /// Panics if the session mailbox is closed.
    pub async fn cursor_position(&self, position: f64) {
        self.session
            .cursor_position(self.connection_id, position)
            .await
            .expect("cursor_position should reach the session");
    }

    /// Relay an out-of-band project change.
    ///
    /// # Panics
    ///
    /// Panics if the session mailbox is closed.
    pub async fn project_updated(&self, notice: ProjectUpdateNotice) {
        self.session
            .project_updated(self.connection_id, notice)
            .await
            .expect("project_updated should reach the session");
    }

    /// Handle to the bound session, for registry-level assertions.
    #[must_use]
    pub fn session(&self) -> &SessionActorHandle {
        &self.session
    }

    /// Receive the next event, failing the test on timeout.
    ///
    /// # Panics
    ///
    /// Panics if no event arrives within the timeout or the channel closed.
    pub async fn recv(&mut self) -> ServerEvent {
        tokio::time::timeout(RECV_TIMEOUT, self.events.recv())
            .await
            .expect("expected an event before timeout")
            .expect("event channel closed unexpectedly")
    }

    /// Receive the next track-added event and return the new track's id.
    ///
    /// # Panics
    ///
    /// Panics if the next event is not `track-added`.
    pub async fn recv_track_added(&mut self) -> TrackId {
        match self.recv().await {
            ServerEvent::TrackAdded { track, .. } => track.id,
            other => panic!("expected track-added, got {other:?}"),
        }
    }

    /// Assert that no event arrives within a short window.
    ///
    /// # Panics
    ///
    /// Panics if an event arrives.
    pub async fn assert_silent(&mut self) {
        match tokio::time::timeout(SILENCE_TIMEOUT, self.events.recv()).await {
            Err(_) | Ok(None) => {}
            Ok(Some(event)) => panic!("expected silence, got {event:?}"),
        }
    }
}
