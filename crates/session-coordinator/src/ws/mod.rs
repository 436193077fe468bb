//! WebSocket layer: upgrade, authentication, and event dispatch.
//!
//! The socket task is deliberately thin. It authenticates the upgrade,
//! parses frames into [`ClientEvent`]s, and forwards them to the actor
//! system; all session state lives in the actors. Outbound events flow
//! through an mpsc channel drained by a writer task, so the session can
//! fan out without touching the socket directly.
//!
//! Connection protocol:
//! 1. Client connects to `GET /ws?token=<jwt>`; the token is verified
//!    before the upgrade completes (401 on failure)
//! 2. The first useful frame is `join-session`; everything else is
//!    dropped until a session is bound
//! 3. On socket close the connection leaves its session implicitly

use crate::actors::messages::ProjectUpdateNotice;
use crate::actors::{CoordinatorActorHandle, SessionActorHandle};
use crate::protocol::{ClientEvent, ServerEvent};

use common::auth::{Authenticator, Identity};
use common::types::{ConnectionId, SessionId};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Buffer size for the outbound event channel (socket writer).
const OUTBOUND_CHANNEL_BUFFER: usize = 256;

/// Shared state for the WebSocket router.
#[derive(Clone)]
pub struct AppState {
    /// Session registry.
    pub coordinator: CoordinatorActorHandle,
    /// Token verifier.
    pub authenticator: Arc<Authenticator>,
}

/// Query parameters for the upgrade request.
#[derive(Debug, Deserialize)]
struct WsParams {
    /// Bearer token; browsers cannot set headers on WebSocket upgrades,
    /// so it travels in the query string.
    token: String,
}

/// Create the WebSocket router serving `GET /ws`.
pub fn ws_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Authenticate and upgrade a WebSocket connection.
///
/// Token verification happens before the upgrade completes; a bad token
/// never gets a socket.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let identity = match state.authenticator.verify(&params.token) {
        Ok(identity) => identity,
        Err(e) => {
            debug!(target: "tt.ws", error = ?e, "Rejecting upgrade: token verification failed");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

/// Drive one authenticated socket until it closes.
async fn handle_socket(socket: WebSocket, state: AppState, identity: Identity) {
    let connection_id = ConnectionId::new();
    info!(
        target: "tt.ws",
        connection_id = %connection_id,
        user_id = %identity.user_id,
        "WebSocket connected"
    );

    let (sink, stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_CHANNEL_BUFFER);

    let writer = tokio::spawn(write_outbound(sink, out_rx, connection_id));

    let binding = read_inbound(stream, &state, &identity, connection_id, &out_tx).await;

    // Implicit leave on disconnect; the session releases this user's
    // locks and notifies the remaining participants.
    if let Some((session_id, _)) = binding {
        if let Err(e) = state
            .coordinator
            .leave_session(session_id, connection_id)
            .await
        {
            warn!(
                target: "tt.ws",
                connection_id = %connection_id,
                error = %e,
                "Failed to leave session on disconnect"
            );
        }
    }

    // The session teardown drops the connection actor's sender clone;
    // dropping ours lets the writer drain and exit.
    drop(out_tx);
    let _ = writer.await;

    info!(
        target: "tt.ws",
        connection_id = %connection_id,
        user_id = %identity.user_id,
        "WebSocket disconnected"
    );
}

/// Serialize outbound events onto the socket until the channel closes.
async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<ServerEvent>,
    connection_id: ConnectionId,
) {
    while let Some(event) = out_rx.recv().await {
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!(
                    target: "tt.ws",
                    connection_id = %connection_id,
                    error = %e,
                    "Failed to serialize outbound event"
                );
                continue;
            }
        };

        if sink.send(Message::Text(json)).await.is_err() {
            // Client is gone; the read side will observe the close.
            break;
        }
    }

    let _ = sink.close().await;
}

/// Read frames until the socket closes.
///
/// Returns the session binding still held at disconnect, if any.
async fn read_inbound(
    mut stream: SplitStream<WebSocket>,
    state: &AppState,
    identity: &Identity,
    connection_id: ConnectionId,
    out_tx: &mpsc::Sender<ServerEvent>,
) -> Option<(SessionId, SessionActorHandle)> {
    let mut binding: Option<(SessionId, SessionActorHandle)> = None;

    while let Some(frame) = stream.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                debug!(
                    target: "tt.ws",
                    connection_id = %connection_id,
                    error = %e,
                    "WebSocket read error"
                );
                break;
            }
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // Pings are answered by axum; binary and pong frames are ignored
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => continue,
        };

        let event = match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => event,
            Err(e) => {
                debug!(
                    target: "tt.ws",
                    connection_id = %connection_id,
                    error = %e,
                    "Unparseable client frame"
                );
                send_error(out_tx, "Invalid message format").await;
                continue;
            }
        };

        match event {
            ClientEvent::JoinSession {
                project_id,
                session_id,
            } => {
                if binding.is_some() {
                    send_error(out_tx, "Already in a session").await;
                    continue;
                }

                match state
                    .coordinator
                    .join_session(
                        session_id.clone(),
                        project_id,
                        connection_id,
                        identity.clone(),
                        out_tx.clone(),
                    )
                    .await
                {
                    // The session already delivered the session-state
                    // snapshot through the joiner's connection mailbox,
                    // ahead of any subsequent broadcast.
                    Ok(ack) => {
                        binding = Some((session_id, ack.session));
                    }
                    Err(e) => {
                        let _ = out_tx.send(e.to_error_event()).await;
                    }
                }
            }

            ClientEvent::LeaveSession {} => {
                if let Some((session_id, _)) = binding.take() {
                    if let Err(e) = state
                        .coordinator
                        .leave_session(session_id, connection_id)
                        .await
                    {
                        warn!(
                            target: "tt.ws",
                            connection_id = %connection_id,
                            error = %e,
                            "Failed to leave session"
                        );
                    }
                }
            }

            // Session-scoped events are dropped until a session is bound.
            other => {
                let Some((_, session)) = &binding else {
                    debug!(
                        target: "tt.ws",
                        connection_id = %connection_id,
                        "Dropping session event from unbound connection"
                    );
                    continue;
                };

                let result = match other {
                    ClientEvent::TrackAdd { track_data } => {
                        session.add_track(connection_id, track_data).await
                    }
                    ClientEvent::TrackUpdate { track_id, updates } => {
                        session.update_track(connection_id, track_id, updates).await
                    }
                    ClientEvent::TrackDelete { track_id } => {
                        session.delete_track(connection_id, track_id).await
                    }
                    ClientEvent::LockTrack { track_id } => {
                        session.lock_track(connection_id, track_id).await
                    }
                    ClientEvent::UnlockTrack { track_id } => {
                        session.unlock_track(connection_id, track_id).await
                    }
                    ClientEvent::PlayState { is_playing } => {
                        session.play_state(connection_id, is_playing).await
                    }
                    ClientEvent::CursorPosition { position } => {
                        session.cursor_position(connection_id, position).await
                    }
                    ClientEvent::ProjectUpdated {
                        project_id,
                        update_type,
                        metadata,
                        timestamp,
                    } => {
                        session
                            .project_updated(
                                connection_id,
                                ProjectUpdateNotice {
                                    project_id,
                                    update_type,
                                    metadata,
                                    timestamp,
                                },
                            )
                            .await
                    }
                    ClientEvent::JoinSession { .. } | ClientEvent::LeaveSession {} => Ok(()),
                };

                if let Err(e) = result {
                    // Session mailbox is gone (session torn down under us)
                    warn!(
                        target: "tt.ws",
                        connection_id = %connection_id,
                        error = %e,
                        "Failed to forward event to session, unbinding"
                    );
                    binding = None;
                }
            }
        }
    }

    binding
}

/// Send a protocol error event to this connection only.
async fn send_error(out_tx: &mpsc::Sender<ServerEvent>, message: &str) {
    let _ = out_tx
        .send(ServerEvent::Error {
            message: message.to_string(),
            locked_by: None,
        })
        .await;
}
