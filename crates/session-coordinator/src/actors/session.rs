//! `SessionActor` - owns the live state of one collaboration session.
//!
//! Each `SessionActor`:
//! - Owns the participant roster, track cache, and advisory lock table
//! - Spawns a `ConnectionActor` per accepted join
//! - Applies track mutations persist-first, then updates its cache and
//!   fans the event out to participants
//!
//! All state is owned by the actor task; nothing here is shared behind a
//! lock. Other components interact through [`SessionActorHandle`].

use crate::errors::CoordinatorError;
use crate::protocol::{LockEntry, NewTrack, ParticipantInfo, ServerEvent, SessionSnapshot};
use crate::store::{SharedProjectStore, StoreError, Track, TrackUpdate};

use super::connection::{ConnectionActor, ConnectionActorHandle};
use super::messages::{ProjectUpdateNotice, SessionMessage, SessionState};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::auth::Identity;
use common::types::{ConnectionId, ProjectId, SessionId, TrackId, UserId};

use chrono::Utc;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 100;

/// Timeout for each connection task to finish during graceful shutdown.
const CONNECTION_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Cursor/avatar colors handed out at join time.
const PARTICIPANT_COLORS: &[&str] = &[
    "#e74c3c", "#3498db", "#2ecc71", "#f39c12", "#9b59b6", "#1abc9c", "#e67e22", "#34495e",
];

/// Fallback color when the palette lookup yields nothing.
const FALLBACK_COLOR: &str = "#95a5a6";

/// Handle to a `SessionActor`.
#[derive(Clone, Debug)]
pub struct SessionActorHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    session_id: SessionId,
    project_id: ProjectId,
}

impl SessionActorHandle {
    /// Get the session ID.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Get the project this session is bound to.
    #[must_use]
    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    /// Join the session with a verified identity.
    ///
    /// On success the returned snapshot already includes the joiner.
    pub async fn join(
        &self,
        connection_id: ConnectionId,
        identity: Identity,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> Result<SessionSnapshot, CoordinatorError> {
        let (respond_to, response) = oneshot::channel();

        self.sender
            .send(SessionMessage::Join {
                connection_id,
                identity,
                outbound,
                respond_to,
            })
            .await
            .map_err(|e| CoordinatorError::Internal(format!("channel send failed: {e}")))?;

        response
            .await
            .map_err(|e| CoordinatorError::Internal(format!("response receive failed: {e}")))?
    }

    /// Leave the session. Returns the number of remaining participants.
    pub async fn leave(&self, connection_id: ConnectionId) -> Result<usize, CoordinatorError> {
        let (respond_to, response) = oneshot::channel();

        self.sender
            .send(SessionMessage::Leave {
                connection_id,
                respond_to,
            })
            .await
            .map_err(|e| CoordinatorError::Internal(format!("channel send failed: {e}")))?;

        response
            .await
            .map_err(|e| CoordinatorError::Internal(format!("response receive failed: {e}")))
    }

    /// Append a new track on behalf of a connection.
    pub async fn add_track(
        &self,
        connection_id: ConnectionId,
        track_data: NewTrack,
    ) -> Result<(), CoordinatorError> {
        self.send(SessionMessage::AddTrack {
            connection_id,
            track_data,
        })
        .await
    }

    /// Partially update a track on behalf of a connection.
    pub async fn update_track(
        &self,
        connection_id: ConnectionId,
        track_id: TrackId,
        updates: TrackUpdate,
    ) -> Result<(), CoordinatorError> {
        self.send(SessionMessage::UpdateTrack {
            connection_id,
            track_id,
            updates,
        })
        .await
    }

    /// Remove a track on behalf of a connection.
    pub async fn delete_track(
        &self,
        connection_id: ConnectionId,
        track_id: TrackId,
    ) -> Result<(), CoordinatorError> {
        self.send(SessionMessage::DeleteTrack {
            connection_id,
            track_id,
        })
        .await
    }

    /// Acquire an advisory lock on a track.
    pub async fn lock_track(
        &self,
        connection_id: ConnectionId,
        track_id: TrackId,
    ) -> Result<(), CoordinatorError> {
        self.send(SessionMessage::LockTrack {
            connection_id,
            track_id,
        })
        .await
    }

    /// Release the lock on a track.
    pub async fn unlock_track(
        &self,
        connection_id: ConnectionId,
        track_id: TrackId,
    ) -> Result<(), CoordinatorError> {
        self.send(SessionMessage::UnlockTrack {
            connection_id,
            track_id,
        })
        .await
    }

    /// Broadcast a transport state change.
    pub async fn play_state(
        &self,
        connection_id: ConnectionId,
        is_playing: bool,
    ) -> Result<(), CoordinatorError> {
        self.send(SessionMessage::PlayState {
            connection_id,
            is_playing,
        })
        .await
    }

    /// Broadcast a cursor position.
    pub async fn cursor_position(
        &self,
        connection_id: ConnectionId,
        position: f64,
    ) -> Result<(), CoordinatorError> {
        self.send(SessionMessage::CursorPosition {
            connection_id,
            position,
        })
        .await
    }

    /// Relay an out-of-band project change to session peers.
    pub async fn project_updated(
        &self,
        connection_id: ConnectionId,
        notice: ProjectUpdateNotice,
    ) -> Result<(), CoordinatorError> {
        self.send(SessionMessage::ProjectUpdated {
            connection_id,
            notice,
        })
        .await
    }

    /// Get the current session state.
    pub async fn get_state(&self) -> Result<SessionState, CoordinatorError> {
        let (respond_to, response) = oneshot::channel();

        self.sender
            .send(SessionMessage::GetState { respond_to })
            .await
            .map_err(|e| CoordinatorError::Internal(format!("channel send failed: {e}")))?;

        response
            .await
            .map_err(|e| CoordinatorError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the session actor and all its connections.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn send(&self, message: SessionMessage) -> Result<(), CoordinatorError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| CoordinatorError::Internal(format!("channel send failed: {e}")))
    }
}

/// One participant as tracked by the session actor.
struct Participant {
    user_id: UserId,
    display_name: String,
    connection_id: ConnectionId,
    color: String,
    connection: ConnectionActorHandle,
}

/// Current holder of an advisory lock.
struct LockHolder {
    user_id: UserId,
    display_name: String,
}

/// The `SessionActor` implementation.
pub struct SessionActor {
    /// Session identifier.
    session_id: SessionId,
    /// Project this session edits.
    project_id: ProjectId,
    /// Project tempo, cached at first join.
    bpm: u32,
    /// Project time signature, cached at first join.
    time_signature: String,
    /// Participants in join order.
    participants: Vec<Participant>,
    /// Cached track list, kept in step with the store.
    tracks: Vec<Track>,
    /// Advisory locks by track.
    locks: HashMap<TrackId, LockHolder>,
    /// Connection actor tasks, for panic monitoring.
    connection_tasks: HashMap<ConnectionId, JoinHandle<()>>,
    /// Persistence backend.
    store: SharedProjectStore,
    /// Message receiver.
    receiver: mpsc::Receiver<SessionMessage>,
    /// Cancellation token (child of the coordinator's token).
    cancel_token: CancellationToken,
    /// Shared metrics.
    metrics: Arc<ActorMetrics>,
    /// Mailbox monitor.
    mailbox: MailboxMonitor,
}

impl SessionActor {
    /// Spawn a new session actor bound to a project.
    ///
    /// The track cache is seeded lazily at the first successful join.
    pub fn spawn(
        session_id: SessionId,
        project_id: ProjectId,
        store: SharedProjectStore,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (SessionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);

        let actor = Self {
            session_id: session_id.clone(),
            project_id,
            bpm: 0,
            time_signature: String::new(),
            participants: Vec::new(),
            tracks: Vec::new(),
            locks: HashMap::new(),
            connection_tasks: HashMap::new(),
            store,
            receiver,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Session, session_id.as_str()),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SessionActorHandle {
            sender,
            cancel_token,
            session_id,
            project_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "tt.actor.session",
        fields(session_id = %self.session_id, project_id = %self.project_id)
    )]
    async fn run(mut self) {
        info!(
            target: "tt.actor.session",
            session_id = %self.session_id,
            project_id = %self.project_id,
            "SessionActor started"
        );

        loop {
            self.check_connection_health().await;

            tokio::select! {
                // Handle cancellation
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "tt.actor.session",
                        session_id = %self.session_id,
                        "SessionActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                // Handle messages
                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            debug!(
                                target: "tt.actor.session",
                                session_id = %self.session_id,
                                "SessionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "tt.actor.session",
            session_id = %self.session_id,
            messages_processed = self.mailbox.messages_processed(),
            "SessionActor stopped"
        );
    }

    /// Detect connection tasks that ended without a leave (panics).
    async fn check_connection_health(&mut self) {
        let finished: Vec<ConnectionId> = self
            .connection_tasks
            .iter()
            .filter(|(_, task)| task.is_finished())
            .map(|(id, _)| *id)
            .collect();

        for connection_id in finished {
            if let Some(task) = self.connection_tasks.remove(&connection_id) {
                if let Err(join_error) = task.await {
                    if join_error.is_panic() {
                        self.metrics.record_panic(ActorType::Connection);
                        error!(
                            target: "tt.actor.session",
                            session_id = %self.session_id,
                            connection_id = %connection_id,
                            "ConnectionActor panicked"
                        );
                    }
                }

                // A finished task with a participant still on the roster
                // means the connection died without a leave. Clean up as
                // if it had left.
                if self
                    .participants
                    .iter()
                    .any(|p| p.connection_id == connection_id)
                {
                    warn!(
                        target: "tt.actor.session",
                        session_id = %self.session_id,
                        connection_id = %connection_id,
                        "Connection task ended unexpectedly, removing participant"
                    );
                    self.remove_participant(connection_id).await;
                }
            }
        }
    }

    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Join {
                connection_id,
                identity,
                outbound,
                respond_to,
            } => {
                let result = self.handle_join(connection_id, identity, outbound).await;
                if respond_to.send(result).is_err() {
                    warn!(
                        target: "tt.actor.session",
                        session_id = %self.session_id,
                        "Join requester dropped before response"
                    );
                }
            }

            SessionMessage::Leave {
                connection_id,
                respond_to,
            } => {
                let remaining = self.remove_participant(connection_id).await;
                let _ = respond_to.send(remaining);
            }

            SessionMessage::AddTrack {
                connection_id,
                track_data,
            } => self.handle_add_track(connection_id, track_data).await,

            SessionMessage::UpdateTrack {
                connection_id,
                track_id,
                updates,
            } => {
                self.handle_update_track(connection_id, track_id, updates)
                    .await;
            }

            SessionMessage::DeleteTrack {
                connection_id,
                track_id,
            } => self.handle_delete_track(connection_id, track_id).await,

            SessionMessage::LockTrack {
                connection_id,
                track_id,
            } => self.handle_lock_track(connection_id, track_id).await,

            SessionMessage::UnlockTrack {
                connection_id,
                track_id,
            } => self.handle_unlock_track(connection_id, track_id).await,

            SessionMessage::PlayState {
                connection_id,
                is_playing,
            } => {
                if let Some(user_id) = self.participant_user(connection_id) {
                    self.broadcast_except(
                        connection_id,
                        ServerEvent::PlayStateChanged {
                            is_playing,
                            user_id,
                        },
                    )
                    .await;
                }
            }

            SessionMessage::CursorPosition {
                connection_id,
                position,
            } => {
                if let Some(user_id) = self.participant_user(connection_id) {
                    self.broadcast_except(
                        connection_id,
                        ServerEvent::UserCursor { user_id, position },
                    )
                    .await;
                }
            }

            SessionMessage::ProjectUpdated {
                connection_id,
                notice,
            } => self.handle_project_updated(connection_id, notice).await,

            SessionMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.session_state());
            }
        }
    }

    async fn handle_join(
        &mut self,
        connection_id: ConnectionId,
        identity: Identity,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> Result<SessionSnapshot, CoordinatorError> {
        // Load the project on every join: it is the authorization source,
        // not just the cache seed.
        let project = self
            .store
            .load_project(self.project_id)
            .await
            .map_err(|e| match e {
                StoreError::NotFound => CoordinatorError::ProjectNotFound,
                StoreError::Backend(msg) => CoordinatorError::Persistence(msg),
            })?;

        if !project.is_collaborator(identity.user_id) {
            warn!(
                target: "tt.actor.session",
                session_id = %self.session_id,
                project_id = %self.project_id,
                user_id = %identity.user_id,
                "Join rejected: not a collaborator"
            );
            return Err(CoordinatorError::AccessDenied);
        }

        // Empty roster means a fresh session (empty sessions are removed),
        // so the cache is seeded exactly once per session lifetime.
        if self.participants.is_empty() {
            self.bpm = project.bpm;
            self.time_signature = project.time_signature.clone();
            self.tracks = project.tracks.clone();
        }

        let color = self.assign_color();
        let (connection, task) = ConnectionActor::spawn(
            connection_id,
            identity.user_id,
            outbound,
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );
        self.connection_tasks.insert(connection_id, task);
        self.metrics.connection_created();

        self.participants.push(Participant {
            user_id: identity.user_id,
            display_name: identity.display_name.clone(),
            connection_id,
            color: color.clone(),
            connection,
        });

        // The snapshot must reach the joiner before any broadcast the
        // session processes after this join. Routing it through the new
        // connection's mailbox here, while the join is still being
        // handled, pins that order; a snapshot sent by the transport
        // after the join response could land behind a later mutation.
        let snapshot = self.snapshot();
        self.deliver_to(connection_id, ServerEvent::SessionState(snapshot.clone()))
            .await;

        // Best-effort activity stamp; a failure here must not fail the join.
        let store = Arc::clone(&self.store);
        let project_id = self.project_id;
        let user_id = identity.user_id;
        tokio::spawn(async move {
            if let Err(e) = store.touch_collaborator(project_id, user_id).await {
                debug!(
                    target: "tt.actor.session",
                    project_id = %project_id,
                    user_id = %user_id,
                    error = %e,
                    "Failed to record collaborator activity"
                );
            }
        });

        info!(
            target: "tt.actor.session",
            session_id = %self.session_id,
            connection_id = %connection_id,
            user_id = %identity.user_id,
            participant_count = self.participants.len(),
            "Participant joined"
        );

        self.broadcast_except(
            connection_id,
            ServerEvent::UserJoined {
                user_id: identity.user_id,
                display_name: identity.display_name,
                color,
            },
        )
        .await;

        Ok(snapshot)
    }

    /// Remove a participant, release their locks, notify the rest.
    ///
    /// Returns the number of remaining participants. Unknown connections
    /// are a no-op (leave after disconnect races are expected).
    async fn remove_participant(&mut self, connection_id: ConnectionId) -> usize {
        let Some(position) = self
            .participants
            .iter()
            .position(|p| p.connection_id == connection_id)
        else {
            return self.participants.len();
        };

        let participant = self.participants.remove(position);
        participant.connection.cancel();
        self.connection_tasks.remove(&connection_id);
        self.metrics.connection_closed();

        // Every lock held by the departing user is released, one
        // track-unlocked broadcast per lock.
        let released: Vec<TrackId> = self
            .locks
            .iter()
            .filter(|(_, holder)| holder.user_id == participant.user_id)
            .map(|(track_id, _)| *track_id)
            .collect();
        for track_id in released {
            self.locks.remove(&track_id);
            self.broadcast_all(ServerEvent::TrackUnlocked {
                track_id,
                user_id: participant.user_id,
            })
            .await;
        }

        info!(
            target: "tt.actor.session",
            session_id = %self.session_id,
            connection_id = %connection_id,
            user_id = %participant.user_id,
            participant_count = self.participants.len(),
            "Participant left"
        );

        self.broadcast_all(ServerEvent::UserLeft {
            user_id: participant.user_id,
            display_name: participant.display_name,
        })
        .await;

        self.participants.len()
    }

    async fn handle_add_track(&mut self, connection_id: ConnectionId, track_data: NewTrack) {
        let Some((user_id, display_name)) = self.participant_identity(connection_id) else {
            return;
        };

        let track_order = u32::try_from(self.tracks.len()).unwrap_or(u32::MAX);
        let track = Track::new(
            track_data.name,
            track_data.instrument,
            track_data.notes,
            user_id,
            track_order,
        );

        if let Err(e) = self.store.append_track(self.project_id, track.clone()).await {
            self.report_store_error(connection_id, "append track", e)
                .await;
            return;
        }

        self.tracks.push(track.clone());

        self.broadcast_all(ServerEvent::TrackAdded {
            track,
            added_by: user_id,
            display_name,
        })
        .await;
    }

    async fn handle_update_track(
        &mut self,
        connection_id: ConnectionId,
        track_id: TrackId,
        updates: TrackUpdate,
    ) {
        let Some((user_id, display_name)) = self.participant_identity(connection_id) else {
            return;
        };

        if updates.is_empty() {
            return;
        }

        // Lock check first: a conflicting update never reaches the store.
        if let Some(holder) = self.locks.get(&track_id) {
            if holder.user_id != user_id {
                let err = CoordinatorError::LockConflict {
                    locked_by: holder.display_name.clone(),
                };
                self.deliver_to(connection_id, err.to_error_event()).await;
                return;
            }
        }

        if let Err(e) = self
            .store
            .update_track(self.project_id, track_id, &updates)
            .await
        {
            self.report_store_error(connection_id, "update track", e)
                .await;
            return;
        }

        if let Some(track) = self.tracks.iter_mut().find(|t| t.id == track_id) {
            updates.apply_to(track);
        }

        self.broadcast_except(
            connection_id,
            ServerEvent::TrackUpdated {
                track_id,
                updates,
                updated_by: user_id,
                display_name,
            },
        )
        .await;
    }

    async fn handle_delete_track(&mut self, connection_id: ConnectionId, track_id: TrackId) {
        let Some((user_id, _)) = self.participant_identity(connection_id) else {
            return;
        };

        if let Err(e) = self.store.remove_track(self.project_id, track_id).await {
            self.report_store_error(connection_id, "remove track", e)
                .await;
            return;
        }

        self.tracks.retain(|t| t.id != track_id);
        // Deleting a locked track drops the lock without a track-unlocked
        // event; the deletion itself supersedes it.
        self.locks.remove(&track_id);

        self.broadcast_all(ServerEvent::TrackDeleted {
            track_id,
            deleted_by: user_id,
        })
        .await;
    }

    async fn handle_lock_track(&mut self, connection_id: ConnectionId, track_id: TrackId) {
        let Some((user_id, display_name)) = self.participant_identity(connection_id) else {
            return;
        };

        if !self.tracks.iter().any(|t| t.id == track_id) {
            self.deliver_to(connection_id, CoordinatorError::TrackNotFound.to_error_event())
                .await;
            return;
        }

        if let Some(holder) = self.locks.get(&track_id) {
            if holder.user_id != user_id {
                let err = CoordinatorError::LockConflict {
                    locked_by: holder.display_name.clone(),
                };
                self.deliver_to(connection_id, err.to_error_event()).await;
                return;
            }
            // Re-locking an already held track falls through and
            // re-broadcasts, which is harmless.
        }

        self.locks.insert(
            track_id,
            LockHolder {
                user_id,
                display_name: display_name.clone(),
            },
        );

        self.broadcast_all(ServerEvent::TrackLocked {
            track_id,
            user_id,
            display_name,
        })
        .await;
    }

    /// Release a lock, regardless of who holds it.
    ///
    /// Any participant can clear any lock; the lock table is advisory and
    /// a stale lock from a wedged client must never require the holder to
    /// come back. Unlocking an unlocked track is a silent no-op.
    async fn handle_unlock_track(&mut self, connection_id: ConnectionId, track_id: TrackId) {
        if self.participant_user(connection_id).is_none() {
            return;
        }

        if let Some(holder) = self.locks.remove(&track_id) {
            self.broadcast_all(ServerEvent::TrackUnlocked {
                track_id,
                user_id: holder.user_id,
            })
            .await;
        }
    }

    async fn handle_project_updated(
        &mut self,
        connection_id: ConnectionId,
        notice: ProjectUpdateNotice,
    ) {
        let Some((user_id, display_name)) = self.participant_identity(connection_id) else {
            return;
        };

        // The project id is relayed verbatim; peers decide whether the
        // change concerns what they have open.
        self.broadcast_except(
            connection_id,
            ServerEvent::ProjectUpdated {
                project_id: notice.project_id,
                update_type: notice.update_type,
                metadata: notice.metadata,
                timestamp: notice.timestamp.unwrap_or_else(Utc::now),
                user_id,
                display_name,
            },
        )
        .await;
    }

    /// Report a store failure to the offending caller only.
    async fn report_store_error(
        &self,
        connection_id: ConnectionId,
        operation: &str,
        e: StoreError,
    ) {
        let err = match e {
            StoreError::NotFound => CoordinatorError::TrackNotFound,
            StoreError::Backend(msg) => {
                error!(
                    target: "tt.actor.session",
                    session_id = %self.session_id,
                    project_id = %self.project_id,
                    operation,
                    error = %msg,
                    "Store operation failed"
                );
                CoordinatorError::Persistence(msg)
            }
        };

        self.deliver_to(connection_id, err.to_error_event()).await;
    }

    fn participant_user(&self, connection_id: ConnectionId) -> Option<UserId> {
        self.participants
            .iter()
            .find(|p| p.connection_id == connection_id)
            .map(|p| p.user_id)
    }

    fn participant_identity(&self, connection_id: ConnectionId) -> Option<(UserId, String)> {
        self.participants
            .iter()
            .find(|p| p.connection_id == connection_id)
            .map(|p| (p.user_id, p.display_name.clone()))
    }

    /// Pick a color not yet in use, falling back to a random palette entry.
    fn assign_color(&self) -> String {
        let used: Vec<&str> = self.participants.iter().map(|p| p.color.as_str()).collect();

        PARTICIPANT_COLORS
            .iter()
            .find(|c| !used.contains(*c))
            .or_else(|| PARTICIPANT_COLORS.choose(&mut rand::thread_rng()))
            .copied()
            .unwrap_or(FALLBACK_COLOR)
            .to_string()
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            participants: self.participant_infos(),
            tracks: self.tracks.clone(),
            locks: self.lock_entries(),
            bpm: self.bpm,
            time_signature: self.time_signature.clone(),
        }
    }

    fn session_state(&self) -> SessionState {
        SessionState {
            session_id: self.session_id.clone(),
            project_id: self.project_id,
            participants: self.participant_infos(),
            locks: self.lock_entries(),
            track_count: self.tracks.len(),
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    fn participant_infos(&self) -> Vec<ParticipantInfo> {
        self.participants
            .iter()
            .map(|p| ParticipantInfo {
                user_id: p.user_id,
                display_name: p.display_name.clone(),
                connection_id: p.connection_id,
                color: p.color.clone(),
            })
            .collect()
    }

    fn lock_entries(&self) -> Vec<LockEntry> {
        self.locks
            .iter()
            .map(|(track_id, holder)| LockEntry {
                track_id: *track_id,
                user_id: holder.user_id,
                display_name: holder.display_name.clone(),
            })
            .collect()
    }

    /// Deliver an event to every participant.
    async fn broadcast_all(&self, event: ServerEvent) {
        for participant in &self.participants {
            let _ = participant.connection.deliver(event.clone()).await;
        }
    }

    /// Deliver an event to every participant except one connection.
    async fn broadcast_except(&self, except: ConnectionId, event: ServerEvent) {
        for participant in &self.participants {
            if participant.connection_id == except {
                continue;
            }
            let _ = participant.connection.deliver(event.clone()).await;
        }
    }

    /// Deliver an event to one connection.
    async fn deliver_to(&self, connection_id: ConnectionId, event: ServerEvent) {
        if let Some(participant) = self
            .participants
            .iter()
            .find(|p| p.connection_id == connection_id)
        {
            let _ = participant.connection.deliver(event).await;
        }
    }

    /// Gracefully shut down: close and await every connection actor.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "tt.actor.session",
            session_id = %self.session_id,
            participant_count = self.participants.len(),
            "SessionActor shutting down"
        );

        for participant in self.participants.drain(..) {
            participant.connection.cancel();
            self.metrics.connection_closed();
        }

        for (connection_id, task) in self.connection_tasks.drain() {
            match tokio::time::timeout(CONNECTION_SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_error)) => {
                    if join_error.is_panic() {
                        self.metrics.record_panic(ActorType::Connection);
                    }
                }
                Err(_) => {
                    warn!(
                        target: "tt.actor.session",
                        session_id = %self.session_id,
                        connection_id = %connection_id,
                        "Connection task did not finish within shutdown timeout"
                    );
                }
            }
        }

        self.locks.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryProjectStore;
    use crate::store::{Collaborator, Project};
    use std::time::Duration;

    fn identity(name: &str) -> Identity {
        Identity {
            user_id: UserId::new(),
            display_name: name.to_string(),
        }
    }

    fn project_with(collaborators: &[UserId]) -> Project {
        Project {
            id: ProjectId::new(),
            name: "Test Jam".to_string(),
            bpm: 120,
            time_signature: "4/4".to_string(),
            collaborators: collaborators
                .iter()
                .map(|&user_id| Collaborator {
                    user_id,
                    role: "editor".to_string(),
                    last_active: None,
                })
                .collect(),
            tracks: Vec::new(),
        }
    }

    fn spawn_session(project: &Project, store: Arc<MemoryProjectStore>) -> SessionActorHandle {
        let metrics = ActorMetrics::new();
        let (handle, _task) = SessionActor::spawn(
            SessionId::from("jam-night"),
            project.id,
            store,
            CancellationToken::new(),
            metrics,
        );
        handle
    }

    async fn join(
        handle: &SessionActorHandle,
        identity: Identity,
    ) -> (
        ConnectionId,
        SessionSnapshot,
        mpsc::Receiver<ServerEvent>,
    ) {
        let connection_id = ConnectionId::new();
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let snapshot = handle
            .join(connection_id, identity, out_tx)
            .await
            .expect("join should succeed");

        // The joiner's first event is always its own snapshot
        match recv(&mut out_rx).await {
            ServerEvent::SessionState(_) => {}
            other => panic!("expected session-state first, got {other:?}"),
        }

        (connection_id, snapshot, out_rx)
    }

    async fn recv(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("should receive within timeout")
            .expect("channel should be open")
    }

    #[tokio::test]
    async fn test_join_missing_project_rejected() {
        let store = Arc::new(MemoryProjectStore::new());
        let project = project_with(&[]);
        let handle = spawn_session(&project, store);

        let (out_tx, _out_rx) = mpsc::channel(64);
        let result = handle
            .join(ConnectionId::new(), identity("Alice"), out_tx)
            .await;
        assert!(matches!(result, Err(CoordinatorError::ProjectNotFound)));
    }

    #[tokio::test]
    async fn test_join_non_collaborator_rejected() {
        let store = Arc::new(MemoryProjectStore::new());
        let project = project_with(&[UserId::new()]);
        store.insert_project(project.clone());
        let handle = spawn_session(&project, store);

        let (out_tx, _out_rx) = mpsc::channel(64);
        let result = handle
            .join(ConnectionId::new(), identity("Mallory"), out_tx)
            .await;
        assert!(matches!(result, Err(CoordinatorError::AccessDenied)));
    }

    #[tokio::test]
    async fn test_second_joiner_gets_snapshot_first_gets_user_joined() {
        let store = Arc::new(MemoryProjectStore::new());
        let alice = identity("Alice");
        let bob = identity("Bob");
        let project = project_with(&[alice.user_id, bob.user_id]);
        store.insert_project(project.clone());
        let handle = spawn_session(&project, store);

        let (_alice_conn, alice_snapshot, mut alice_rx) = join(&handle, alice.clone()).await;
        assert_eq!(alice_snapshot.participants.len(), 1);
        assert_eq!(alice_snapshot.bpm, 120);
        assert_eq!(alice_snapshot.time_signature, "4/4");

        let (_bob_conn, bob_snapshot, _bob_rx) = join(&handle, bob.clone()).await;
        assert_eq!(bob_snapshot.participants.len(), 2);
        assert_eq!(bob_snapshot.participants[1].display_name, "Bob");

        match recv(&mut alice_rx).await {
            ServerEvent::UserJoined {
                user_id,
                display_name,
                ..
            } => {
                assert_eq!(user_id, bob.user_id);
                assert_eq!(display_name, "Bob");
            }
            other => panic!("expected user-joined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_add_track_broadcast_to_all_and_persisted() {
        let store = Arc::new(MemoryProjectStore::new());
        let alice = identity("Alice");
        let bob = identity("Bob");
        let project = project_with(&[alice.user_id, bob.user_id]);
        store.insert_project(project.clone());
        let handle = spawn_session(&project, Arc::clone(&store));

        let (alice_conn, _, mut alice_rx) = join(&handle, alice.clone()).await;
        let (_bob_conn, _, mut bob_rx) = join(&handle, bob).await;
        // Drain Alice's user-joined for Bob
        let _ = recv(&mut alice_rx).await;

        handle
            .add_track(
                alice_conn,
                NewTrack {
                    name: "Bass Riff".to_string(),
                    instrument: "bass".to_string(),
                    notes: String::new(),
                },
            )
            .await
            .unwrap();

        for rx in [&mut alice_rx, &mut bob_rx] {
            match recv(rx).await {
                ServerEvent::TrackAdded { track, added_by, .. } => {
                    assert_eq!(track.name, "Bass Riff");
                    assert_eq!(added_by, alice.user_id);
                }
                other => panic!("expected track-added, got {other:?}"),
            }
        }

        let persisted = store.project(project.id).expect("project should exist");
        assert_eq!(persisted.tracks.len(), 1);
        assert_eq!(persisted.tracks[0].name, "Bass Riff");
    }

    #[tokio::test]
    async fn test_locked_track_update_rejected_and_not_persisted() {
        let store = Arc::new(MemoryProjectStore::new());
        let alice = identity("Alice");
        let bob = identity("Bob");
        let project = project_with(&[alice.user_id, bob.user_id]);
        store.insert_project(project.clone());
        let handle = spawn_session(&project, Arc::clone(&store));

        let (alice_conn, _, mut alice_rx) = join(&handle, alice.clone()).await;
        let (bob_conn, _, mut bob_rx) = join(&handle, bob).await;
        let _ = recv(&mut alice_rx).await; // user-joined

        handle
            .add_track(
                alice_conn,
                NewTrack {
                    name: "Lead".to_string(),
                    instrument: "synth".to_string(),
                    notes: String::new(),
                },
            )
            .await
            .unwrap();
        let track_id = match recv(&mut alice_rx).await {
            ServerEvent::TrackAdded { track, .. } => track.id,
            other => panic!("expected track-added, got {other:?}"),
        };
        let _ = recv(&mut bob_rx).await; // track-added

        handle.lock_track(alice_conn, track_id).await.unwrap();
        let _ = recv(&mut alice_rx).await; // track-locked
        let _ = recv(&mut bob_rx).await;

        // Bob's update against Alice's lock is rejected to Bob only
        handle
            .update_track(
                bob_conn,
                track_id,
                TrackUpdate {
                    volume: Some(0.1),
                    ..TrackUpdate::default()
                },
            )
            .await
            .unwrap();

        match recv(&mut bob_rx).await {
            ServerEvent::Error { message, locked_by } => {
                assert_eq!(message, "Track is locked");
                assert_eq!(locked_by.as_deref(), Some("Alice"));
            }
            other => panic!("expected error, got {other:?}"),
        }

        // Persisted volume unchanged
        let persisted = store.project(project.id).expect("project should exist");
        assert_eq!(persisted.tracks[0].volume, crate::store::DEFAULT_TRACK_VOLUME);

        // The holder's own update goes through
        handle
            .update_track(
                alice_conn,
                track_id,
                TrackUpdate {
                    volume: Some(0.5),
                    ..TrackUpdate::default()
                },
            )
            .await
            .unwrap();

        match recv(&mut bob_rx).await {
            ServerEvent::TrackUpdated { updates, .. } => {
                assert_eq!(updates.volume, Some(0.5));
            }
            other => panic!("expected track-updated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_snapshot_delivered_before_later_broadcasts() {
        let store = Arc::new(MemoryProjectStore::new());
        let alice = identity("Alice");
        let bob = identity("Bob");
        let project = project_with(&[alice.user_id, bob.user_id]);
        store.insert_project(project.clone());
        let handle = spawn_session(&project, store);

        let (alice_conn, _, mut alice_rx) = join(&handle, alice).await;

        // Bob joins raw so nothing is drained from his channel
        let bob_conn = ConnectionId::new();
        let (bob_tx, mut bob_rx) = mpsc::channel(64);
        handle
            .join(bob_conn, bob, bob_tx)
            .await
            .expect("join should succeed");
        let _ = recv(&mut alice_rx).await; // user-joined

        // A mutation lands right after Bob's join completes
        handle
            .add_track(
                alice_conn,
                NewTrack {
                    name: "Ghost".to_string(),
                    instrument: "theremin".to_string(),
                    notes: String::new(),
                },
            )
            .await
            .unwrap();

        // Bob's channel yields the snapshot first, without the new track,
        // then the track-added broadcast that postdates his join
        match recv(&mut bob_rx).await {
            ServerEvent::SessionState(snapshot) => {
                assert!(snapshot.tracks.iter().all(|t| t.name != "Ghost"));
                assert_eq!(snapshot.participants.len(), 2);
            }
            other => panic!("expected session-state first, got {other:?}"),
        }
        match recv(&mut bob_rx).await {
            ServerEvent::TrackAdded { track, .. } => assert_eq!(track.name, "Ghost"),
            other => panic!("expected track-added, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unlock_from_non_owner_clears_lock() {
        let store = Arc::new(MemoryProjectStore::new());
        let alice = identity("Alice");
        let bob = identity("Bob");
        let project = project_with(&[alice.user_id, bob.user_id]);
        store.insert_project(project.clone());
        let handle = spawn_session(&project, store);

        let (alice_conn, _, mut alice_rx) = join(&handle, alice.clone()).await;
        let (bob_conn, _, mut bob_rx) = join(&handle, bob).await;
        let _ = recv(&mut alice_rx).await; // user-joined

        handle
            .add_track(
                alice_conn,
                NewTrack {
                    name: "Keys".to_string(),
                    instrument: "piano".to_string(),
                    notes: String::new(),
                },
            )
            .await
            .unwrap();
        let track_id = match recv(&mut alice_rx).await {
            ServerEvent::TrackAdded { track, .. } => track.id,
            other => panic!("expected track-added, got {other:?}"),
        };
        let _ = recv(&mut bob_rx).await;

        handle.lock_track(alice_conn, track_id).await.unwrap();
        let _ = recv(&mut alice_rx).await;
        let _ = recv(&mut bob_rx).await;

        // Bob releases Alice's lock
        handle.unlock_track(bob_conn, track_id).await.unwrap();
        match recv(&mut bob_rx).await {
            ServerEvent::TrackUnlocked { track_id: t, user_id } => {
                assert_eq!(t, track_id);
                assert_eq!(user_id, alice.user_id);
            }
            other => panic!("expected track-unlocked, got {other:?}"),
        }

        let state = handle.get_state().await.unwrap();
        assert!(state.locks.is_empty());

        // Second unlock is a silent no-op: no event, lock table unchanged
        handle.unlock_track(bob_conn, track_id).await.unwrap();
        let state = handle.get_state().await.unwrap();
        assert!(state.locks.is_empty());
    }

    #[tokio::test]
    async fn test_leave_releases_all_locks_with_one_event_each() {
        let store = Arc::new(MemoryProjectStore::new());
        let alice = identity("Alice");
        let bob = identity("Bob");
        let project = project_with(&[alice.user_id, bob.user_id]);
        store.insert_project(project.clone());
        let handle = spawn_session(&project, store);

        let (alice_conn, _, mut alice_rx) = join(&handle, alice.clone()).await;
        let (_bob_conn, _, mut bob_rx) = join(&handle, bob).await;
        let _ = recv(&mut alice_rx).await;

        let mut track_ids = Vec::new();
        for name in ["One", "Two", "Three"] {
            handle
                .add_track(
                    alice_conn,
                    NewTrack {
                        name: name.to_string(),
                        instrument: "synth".to_string(),
                        notes: String::new(),
                    },
                )
                .await
                .unwrap();
            match recv(&mut alice_rx).await {
                ServerEvent::TrackAdded { track, .. } => track_ids.push(track.id),
                other => panic!("expected track-added, got {other:?}"),
            }
            let _ = recv(&mut bob_rx).await;
        }

        for &track_id in &track_ids {
            handle.lock_track(alice_conn, track_id).await.unwrap();
            let _ = recv(&mut alice_rx).await;
            let _ = recv(&mut bob_rx).await;
        }

        let remaining = handle.leave(alice_conn).await.unwrap();
        assert_eq!(remaining, 1);

        // Bob sees exactly one track-unlocked per held lock, then user-left
        let mut unlocked = Vec::new();
        for _ in 0..3 {
            match recv(&mut bob_rx).await {
                ServerEvent::TrackUnlocked { track_id, user_id } => {
                    assert_eq!(user_id, alice.user_id);
                    unlocked.push(track_id);
                }
                other => panic!("expected track-unlocked, got {other:?}"),
            }
        }
        unlocked.sort_by_key(std::string::ToString::to_string);
        let mut expected = track_ids.clone();
        expected.sort_by_key(std::string::ToString::to_string);
        assert_eq!(unlocked, expected);

        match recv(&mut bob_rx).await {
            ServerEvent::UserLeft { user_id, .. } => assert_eq!(user_id, alice.user_id),
            other => panic!("expected user-left, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_delete_locked_track_drops_lock() {
        let store = Arc::new(MemoryProjectStore::new());
        let alice = identity("Alice");
        let project = project_with(&[alice.user_id]);
        store.insert_project(project.clone());
        let handle = spawn_session(&project, store);

        let (alice_conn, _, mut alice_rx) = join(&handle, alice).await;

        handle
            .add_track(
                alice_conn,
                NewTrack {
                    name: "Doomed".to_string(),
                    instrument: "drums".to_string(),
                    notes: String::new(),
                },
            )
            .await
            .unwrap();
        let track_id = match recv(&mut alice_rx).await {
            ServerEvent::TrackAdded { track, .. } => track.id,
            other => panic!("expected track-added, got {other:?}"),
        };

        handle.lock_track(alice_conn, track_id).await.unwrap();
        let _ = recv(&mut alice_rx).await;

        handle.delete_track(alice_conn, track_id).await.unwrap();
        match recv(&mut alice_rx).await {
            ServerEvent::TrackDeleted { track_id: t, .. } => assert_eq!(t, track_id),
            other => panic!("expected track-deleted, got {other:?}"),
        }

        let state = handle.get_state().await.unwrap();
        assert!(state.locks.is_empty());
        assert_eq!(state.track_count, 0);

        // Unlock after delete is a silent no-op
        handle.unlock_track(alice_conn, track_id).await.unwrap();
        let state = handle.get_state().await.unwrap();
        assert!(state.locks.is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_reported_to_caller_only() {
        let store = Arc::new(MemoryProjectStore::new());
        let alice = identity("Alice");
        let bob = identity("Bob");
        let project = project_with(&[alice.user_id, bob.user_id]);
        store.insert_project(project.clone());
        let handle = spawn_session(&project, Arc::clone(&store));

        let (alice_conn, _, mut alice_rx) = join(&handle, alice).await;
        let (_bob_conn, _, mut bob_rx) = join(&handle, bob).await;
        let _ = recv(&mut alice_rx).await;

        store.set_fail_writes(true);

        handle
            .add_track(
                alice_conn,
                NewTrack {
                    name: "Lost".to_string(),
                    instrument: "synth".to_string(),
                    notes: String::new(),
                },
            )
            .await
            .unwrap();

        match recv(&mut alice_rx).await {
            ServerEvent::Error { message, .. } => {
                assert_eq!(message, "An internal error occurred");
            }
            other => panic!("expected error, got {other:?}"),
        }

        // Bob sees nothing
        let nothing = tokio::time::timeout(Duration::from_millis(100), bob_rx.recv()).await;
        assert!(nothing.is_err());

        let state = handle.get_state().await.unwrap();
        assert_eq!(state.track_count, 0);
    }

    #[tokio::test]
    async fn test_play_state_and_cursor_skip_caller() {
        let store = Arc::new(MemoryProjectStore::new());
        let alice = identity("Alice");
        let bob = identity("Bob");
        let project = project_with(&[alice.user_id, bob.user_id]);
        store.insert_project(project.clone());
        let handle = spawn_session(&project, store);

        let (alice_conn, _, mut alice_rx) = join(&handle, alice.clone()).await;
        let (_bob_conn, _, mut bob_rx) = join(&handle, bob).await;
        let _ = recv(&mut alice_rx).await;

        handle.play_state(alice_conn, true).await.unwrap();
        match recv(&mut bob_rx).await {
            ServerEvent::PlayStateChanged { is_playing, user_id } => {
                assert!(is_playing);
                assert_eq!(user_id, alice.user_id);
            }
            other => panic!("expected play-state-changed, got {other:?}"),
        }

        handle.cursor_position(alice_conn, 12.5).await.unwrap();
        match recv(&mut bob_rx).await {
            ServerEvent::UserCursor { position, .. } => assert_eq!(position, 12.5),
            other => panic!("expected user-cursor, got {other:?}"),
        }

        // Caller never hears their own ephemeral events
        let nothing = tokio::time::timeout(Duration::from_millis(100), alice_rx.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_project_updated_relays_verbatim_with_server_timestamp() {
        let store = Arc::new(MemoryProjectStore::new());
        let alice = identity("Alice");
        let bob = identity("Bob");
        let project = project_with(&[alice.user_id, bob.user_id]);
        store.insert_project(project.clone());
        let handle = spawn_session(&project, store);

        let (alice_conn, _, mut alice_rx) = join(&handle, alice.clone()).await;
        let (_bob_conn, _, mut bob_rx) = join(&handle, bob).await;
        let _ = recv(&mut alice_rx).await;

        let other_project = ProjectId::new();
        handle
            .project_updated(
                alice_conn,
                ProjectUpdateNotice {
                    project_id: other_project,
                    update_type: "metadata".to_string(),
                    metadata: serde_json::json!({"name": "Renamed"}),
                    timestamp: None,
                },
            )
            .await
            .unwrap();

        match recv(&mut bob_rx).await {
            ServerEvent::ProjectUpdated {
                project_id,
                update_type,
                user_id,
                ..
            } => {
                assert_eq!(project_id, other_project);
                assert_eq!(update_type, "metadata");
                assert_eq!(user_id, alice.user_id);
            }
            other => panic!("expected project-updated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_leave_unknown_connection_is_noop() {
        let store = Arc::new(MemoryProjectStore::new());
        let alice = identity("Alice");
        let project = project_with(&[alice.user_id]);
        store.insert_project(project.clone());
        let handle = spawn_session(&project, store);

        let (_alice_conn, _, _alice_rx) = join(&handle, alice).await;

        let remaining = handle.leave(ConnectionId::new()).await.unwrap();
        assert_eq!(remaining, 1);
    }
}
