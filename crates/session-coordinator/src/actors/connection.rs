//! `ConnectionActor` - per-WebSocket connection actor.
//!
//! Each `ConnectionActor`:
//! - Handles exactly one WebSocket connection
//! - Is 1:1 with session participation (one connection = one session)
//! - Delivers server events from its `SessionActor` into the socket's
//!   outbound writer channel
//!
//! # Lifecycle
//!
//! 1. Created by the `SessionActor` when a join is accepted
//! 2. Runs until the connection closes, the participant leaves, or the
//!    session ends
//! 3. Cancellation via child token propagates from the `SessionActor`

use crate::errors::CoordinatorError;
use crate::protocol::ServerEvent;

use super::messages::ConnectionMessage;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::types::{ConnectionId, UserId};

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the connection mailbox.
const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: ConnectionId,
    user_id: UserId,
}

impl ConnectionActorHandle {
    /// Get the connection ID.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Get the user ID bound to this connection.
    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Deliver a server event to the client.
    pub async fn deliver(&self, event: ServerEvent) -> Result<(), CoordinatorError> {
        self.sender
            .send(ConnectionMessage::Deliver { event })
            .await
            .map_err(|e| CoordinatorError::Internal(format!("channel send failed: {e}")))
    }

    /// Close the connection.
    pub async fn close(&self, reason: String) -> Result<(), CoordinatorError> {
        self.sender
            .send(ConnectionMessage::Close { reason })
            .await
            .map_err(|e| CoordinatorError::Internal(format!("channel send failed: {e}")))
    }

    /// Cancel the connection actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    /// Connection ID.
    connection_id: ConnectionId,
    /// User bound to this connection.
    user_id: UserId,
    /// Message receiver.
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Cancellation token (child of the session's token).
    cancel_token: CancellationToken,
    /// Outbound channel drained by the socket writer task.
    outbound: mpsc::Sender<ServerEvent>,
    /// Shared metrics.
    metrics: Arc<ActorMetrics>,
    /// Mailbox monitor.
    mailbox: MailboxMonitor,
    /// Whether the connection is closing.
    is_closing: bool,
}

impl ConnectionActor {
    /// Spawn a new connection actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        connection_id: ConnectionId,
        user_id: UserId,
        outbound: mpsc::Sender<ServerEvent>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);

        let actor = Self {
            connection_id,
            user_id,
            receiver,
            cancel_token: cancel_token.clone(),
            outbound,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Connection, connection_id.to_string()),
            is_closing: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            connection_id,
            user_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "tt.actor.connection",
        fields(connection_id = %self.connection_id, user_id = %self.user_id)
    )]
    async fn run(mut self) {
        debug!(
            target: "tt.actor.connection",
            connection_id = %self.connection_id,
            user_id = %self.user_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                // Handle cancellation
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "tt.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
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
                                target: "tt.actor.connection",
                                connection_id = %self.connection_id,
                                "ConnectionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "tt.actor.connection",
            connection_id = %self.connection_id,
            user_id = %self.user_id,
            messages_processed = self.mailbox.messages_processed(),
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Deliver { event } => {
                self.handle_deliver(event).await;
                false
            }

            ConnectionMessage::Close { reason } => {
                debug!(
                    target: "tt.actor.connection",
                    connection_id = %self.connection_id,
                    reason = %reason,
                    "Closing connection"
                );
                self.is_closing = true;
                true
            }
        }
    }

    /// Forward a server event into the socket writer channel.
    async fn handle_deliver(&mut self, event: ServerEvent) {
        if self.is_closing {
            warn!(
                target: "tt.actor.connection",
                connection_id = %self.connection_id,
                "Attempted to deliver event while closing"
            );
            return;
        }

        if self.outbound.send(event).await.is_err() {
            // Writer task is gone; the read loop will report the
            // disconnect, nothing more to deliver here.
            debug!(
                target: "tt.actor.connection",
                connection_id = %self.connection_id,
                "Outbound channel closed, marking connection as closing"
            );
            self.is_closing = true;
        }
    }
}
