//! `CoordinatorActor` - the session registry.
//!
//! A singleton actor that owns the map of live sessions. Sessions are
//! spawned on first join and removed when their last participant leaves,
//! so the registry invariant is simple: a session exists if and only if
//! it has at least one participant.
//!
//! The registry is injected wherever it is needed (WebSocket layer,
//! tests) via [`CoordinatorActorHandle`]; there is no global singleton.

use crate::errors::CoordinatorError;
use crate::store::SharedProjectStore;

use super::messages::{CoordinatorMessage, CoordinatorStatus, JoinAck};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::session::{SessionActor, SessionActorHandle};

use common::auth::Identity;
use common::types::{ConnectionId, ProjectId, SessionId};

use crate::protocol::ServerEvent;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the coordinator mailbox.
const COORDINATOR_CHANNEL_BUFFER: usize = 100;

/// Timeout for a removed session's task to finish.
const SESSION_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for each session to drain during graceful shutdown.
const SESSION_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to the `CoordinatorActor`.
#[derive(Clone, Debug)]
pub struct CoordinatorActorHandle {
    sender: mpsc::Sender<CoordinatorMessage>,
    cancel_token: CancellationToken,
}

impl CoordinatorActorHandle {
    /// Create the coordinator and spawn its actor task.
    #[must_use]
    pub fn new(store: SharedProjectStore, metrics: Arc<ActorMetrics>) -> Self {
        let (sender, receiver) = mpsc::channel(COORDINATOR_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = CoordinatorActor {
            sessions: HashMap::new(),
            accepting_new: true,
            store,
            receiver,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Coordinator, "coordinator"),
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Route a verified connection into a session.
    ///
    /// Spawns the session actor on first join.
    pub async fn join_session(
        &self,
        session_id: SessionId,
        project_id: ProjectId,
        connection_id: ConnectionId,
        identity: Identity,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> Result<JoinAck, CoordinatorError> {
        let (respond_to, response) = oneshot::channel();

        self.sender
            .send(CoordinatorMessage::JoinSession {
                session_id,
                project_id,
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

    /// Remove a connection from a session.
    ///
    /// Deletes the session when the last participant leaves.
    pub async fn leave_session(
        &self,
        session_id: SessionId,
        connection_id: ConnectionId,
    ) -> Result<(), CoordinatorError> {
        let (respond_to, response) = oneshot::channel();

        self.sender
            .send(CoordinatorMessage::LeaveSession {
                session_id,
                connection_id,
                respond_to,
            })
            .await
            .map_err(|e| CoordinatorError::Internal(format!("channel send failed: {e}")))?;

        response
            .await
            .map_err(|e| CoordinatorError::Internal(format!("response receive failed: {e}")))
    }

    /// Look up a live session by id.
    pub async fn get_session(
        &self,
        session_id: SessionId,
    ) -> Result<Option<SessionActorHandle>, CoordinatorError> {
        let (respond_to, response) = oneshot::channel();

        self.sender
            .send(CoordinatorMessage::GetSession {
                session_id,
                respond_to,
            })
            .await
            .map_err(|e| CoordinatorError::Internal(format!("channel send failed: {e}")))?;

        response
            .await
            .map_err(|e| CoordinatorError::Internal(format!("response receive failed: {e}")))
    }

    /// Get the current coordinator status.
    pub async fn get_status(&self) -> Result<CoordinatorStatus, CoordinatorError> {
        let (respond_to, response) = oneshot::channel();

        self.sender
            .send(CoordinatorMessage::GetStatus { respond_to })
            .await
            .map_err(|e| CoordinatorError::Internal(format!("channel send failed: {e}")))?;

        response
            .await
            .map_err(|e| CoordinatorError::Internal(format!("response receive failed: {e}")))
    }

    /// Initiate graceful shutdown: stop accepting joins, drain sessions.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        let (respond_to, response) = oneshot::channel();

        self.sender
            .send(CoordinatorMessage::Shutdown { respond_to })
            .await
            .map_err(|e| CoordinatorError::Internal(format!("channel send failed: {e}")))?;

        response
            .await
            .map_err(|e| CoordinatorError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the coordinator and every session under it.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the coordinator is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Create a child token tied to the coordinator's lifetime.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// A session tracked by the registry.
struct ManagedSession {
    handle: SessionActorHandle,
    task_handle: JoinHandle<()>,
    created_at: DateTime<Utc>,
}

/// The `CoordinatorActor` implementation.
struct CoordinatorActor {
    /// Live sessions by id.
    sessions: HashMap<SessionId, ManagedSession>,
    /// False once draining has begun; joins are rejected.
    accepting_new: bool,
    /// Persistence backend handed to spawned sessions.
    store: SharedProjectStore,
    /// Message receiver.
    receiver: mpsc::Receiver<CoordinatorMessage>,
    /// Root cancellation token for the actor tree.
    cancel_token: CancellationToken,
    /// Shared metrics.
    metrics: Arc<ActorMetrics>,
    /// Mailbox monitor.
    mailbox: MailboxMonitor,
}

impl CoordinatorActor {
    /// Run the actor message loop.
    #[instrument(skip_all, name = "tt.actor.coordinator")]
    async fn run(mut self) {
        info!(target: "tt.actor.coordinator", "CoordinatorActor started");

        loop {
            self.check_session_health().await;

            tokio::select! {
                // Handle cancellation
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "tt.actor.coordinator",
                        "CoordinatorActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                // Handle messages
                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            let should_exit = self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "tt.actor.coordinator",
                                "CoordinatorActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "tt.actor.coordinator",
            messages_processed = self.mailbox.messages_processed(),
            "CoordinatorActor stopped"
        );
    }

    /// Detect session tasks that ended without being removed (panics).
    async fn check_session_health(&mut self) {
        let finished: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for session_id in finished {
            if let Some(managed) = self.sessions.remove(&session_id) {
                if let Err(join_error) = managed.task_handle.await {
                    if join_error.is_panic() {
                        self.metrics.record_panic(ActorType::Session);
                        error!(
                            target: "tt.actor.coordinator",
                            session_id = %session_id,
                            "SessionActor panicked, removing from registry"
                        );
                    }
                }
                self.metrics.session_removed();
            }
        }
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: CoordinatorMessage) -> bool {
        match message {
            CoordinatorMessage::JoinSession {
                session_id,
                project_id,
                connection_id,
                identity,
                outbound,
                respond_to,
            } => {
                let result = self
                    .handle_join_session(session_id, project_id, connection_id, identity, outbound)
                    .await;
                let _ = respond_to.send(result);
                false
            }

            CoordinatorMessage::LeaveSession {
                session_id,
                connection_id,
                respond_to,
            } => {
                self.handle_leave_session(session_id, connection_id).await;
                let _ = respond_to.send(());
                false
            }

            CoordinatorMessage::GetSession {
                session_id,
                respond_to,
            } => {
                let handle = self.sessions.get(&session_id).map(|m| m.handle.clone());
                let _ = respond_to.send(handle);
                false
            }

            CoordinatorMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(CoordinatorStatus {
                    session_count: self.sessions.len(),
                    connection_count: self.metrics.connection_count(),
                    is_draining: !self.accepting_new,
                    mailbox_depth: self.mailbox.current_depth(),
                });
                false
            }

            CoordinatorMessage::Shutdown { respond_to } => {
                self.graceful_shutdown().await;
                let _ = respond_to.send(Ok(()));
                true
            }
        }
    }

    async fn handle_join_session(
        &mut self,
        session_id: SessionId,
        project_id: ProjectId,
        connection_id: ConnectionId,
        identity: Identity,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> Result<JoinAck, CoordinatorError> {
        if !self.accepting_new {
            return Err(CoordinatorError::Draining);
        }

        let newly_created = !self.sessions.contains_key(&session_id);

        if let Some(existing) = self.sessions.get(&session_id) {
            if existing.handle.project_id() != project_id {
                warn!(
                    target: "tt.actor.coordinator",
                    session_id = %session_id,
                    requested_project = %project_id,
                    bound_project = %existing.handle.project_id(),
                    "Join rejected: session is bound to a different project"
                );
                return Err(CoordinatorError::Internal(
                    "session is bound to a different project".to_string(),
                ));
            }
        } else {
            let (handle, task_handle) = SessionActor::spawn(
                session_id.clone(),
                project_id,
                Arc::clone(&self.store),
                self.cancel_token.child_token(),
                Arc::clone(&self.metrics),
            );
            self.sessions.insert(
                session_id.clone(),
                ManagedSession {
                    handle,
                    task_handle,
                    created_at: Utc::now(),
                },
            );
            self.metrics.session_created();
            info!(
                target: "tt.actor.coordinator",
                session_id = %session_id,
                project_id = %project_id,
                session_count = self.sessions.len(),
                "Session created"
            );
        }

        let session = self
            .sessions
            .get(&session_id)
            .map(|m| m.handle.clone())
            .ok_or_else(|| CoordinatorError::Internal("session vanished during join".to_string()))?;

        match session.join(connection_id, identity, outbound).await {
            Ok(snapshot) => Ok(JoinAck { snapshot, session }),
            Err(e) => {
                // A rejected first join leaves an empty session behind;
                // remove it so the registry invariant holds.
                if newly_created {
                    self.remove_session(&session_id);
                }
                Err(e)
            }
        }
    }

    async fn handle_leave_session(&mut self, session_id: SessionId, connection_id: ConnectionId) {
        let Some(managed) = self.sessions.get(&session_id) else {
            debug!(
                target: "tt.actor.coordinator",
                session_id = %session_id,
                "Leave for unknown session ignored"
            );
            return;
        };

        match managed.handle.leave(connection_id).await {
            Ok(0) => {
                info!(
                    target: "tt.actor.coordinator",
                    session_id = %session_id,
                    "Last participant left, removing session"
                );
                self.remove_session(&session_id);
            }
            Ok(remaining) => {
                debug!(
                    target: "tt.actor.coordinator",
                    session_id = %session_id,
                    remaining,
                    "Participant left session"
                );
            }
            Err(e) => {
                error!(
                    target: "tt.actor.coordinator",
                    session_id = %session_id,
                    error = %e,
                    "Failed to process leave, removing session"
                );
                self.remove_session(&session_id);
            }
        }
    }

    /// Remove a session from the registry and reap its task off-loop.
    fn remove_session(&mut self, session_id: &SessionId) {
        if let Some(managed) = self.sessions.remove(session_id) {
            managed.handle.cancel();
            self.metrics.session_removed();

            let session_id = session_id.clone();
            let age = Utc::now() - managed.created_at;
            tokio::spawn(async move {
                match tokio::time::timeout(SESSION_CLEANUP_TIMEOUT, managed.task_handle).await {
                    Ok(_) => {
                        debug!(
                            target: "tt.actor.coordinator",
                            session_id = %session_id,
                            age_seconds = age.num_seconds(),
                            "Session task finished"
                        );
                    }
                    Err(_) => {
                        warn!(
                            target: "tt.actor.coordinator",
                            session_id = %session_id,
                            "Session task did not finish within cleanup timeout"
                        );
                    }
                }
            });
        }
    }

    /// Gracefully shut down: reject new joins, drain every session.
    async fn graceful_shutdown(&mut self) {
        self.accepting_new = false;

        info!(
            target: "tt.actor.coordinator",
            session_count = self.sessions.len(),
            "CoordinatorActor shutting down"
        );

        for (session_id, managed) in self.sessions.drain() {
            managed.handle.cancel();
            self.metrics.session_removed();

            match tokio::time::timeout(SESSION_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_error)) => {
                    if join_error.is_panic() {
                        self.metrics.record_panic(ActorType::Session);
                    }
                }
                Err(_) => {
                    warn!(
                        target: "tt.actor.coordinator",
                        session_id = %session_id,
                        "Session did not drain within shutdown timeout"
                    );
                }
            }
        }
    }
}
