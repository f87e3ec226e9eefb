use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use tandem_proto::{ClientEnvelope, ServerEnvelope};

use crate::auth::{self, Claims};
use crate::config::Config;
use crate::matchmaker::{JoinOutcome, Matchmaker, QueueEntry};
use crate::registry::{ConnectionHandle, Registry};

/// Shared lobby state handed to every connection.
#[derive(Clone)]
pub struct Lobby {
    pub registry: Arc<Registry>,
    pub matchmaker: Arc<Matchmaker>,
    pub config: Arc<Config>,
}

impl Lobby {
    pub fn new(config: Config) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            matchmaker: Arc::new(Matchmaker::new()),
            config: Arc::new(config),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    token: String,
}

/// WebSocket upgrade handler. The identity token rides as a query
/// credential; an invalid one closes the connection before any envelope is
/// exchanged (there is no structured error surface pre-handshake).
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(lobby): State<Lobby>,
) -> Response {
    let claims = match auth::verify_token(&query.token, &lobby.config.jwt_secret) {
        Ok(claims) => claims,
        Err(err) => {
            warn!("rejecting signaling handshake: {err}");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_socket(socket, claims, lobby))
}

async fn handle_socket(socket: WebSocket, claims: Claims, lobby: Lobby) {
    let user_id = claims.sub;
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEnvelope>();

    if lobby
        .registry
        .register(ConnectionHandle {
            user_id,
            full_name: claims.name.clone(),
            tx,
        })
        .is_err()
    {
        warn!(user_id, "second signaling channel for connected user");
        let refusal = ServerEnvelope::Error {
            message: "already connected".to_string(),
        };
        if let Ok(json) = serde_json::to_string(&refusal) {
            let _ = sender.send(Message::Text(json)).await;
        }
        return;
    }

    // Drain the outbound channel onto the socket, interleaving keepalive
    // pings. Envelope order per direction is the channel's FIFO order.
    let keepalive = Duration::from_secs(lobby.config.keepalive_seconds.max(1));
    let send_task = tokio::spawn(async move {
        let mut ping = interval(keepalive);
        ping.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(envelope) => match serde_json::to_string(&envelope) {
                        Ok(json) => {
                            if sender.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => error!(user_id, "failed to encode envelope: {err}"),
                    },
                    None => break,
                },
                _ = ping.tick() => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    lobby.registry.send_to(user_id, ServerEnvelope::Connected);
    info!(user_id, name = %claims.name, "signaling channel open");

    // Inbound envelopes are handled one at a time, to completion, in
    // arrival order.
    while let Some(frame) = receiver.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(err) => {
                debug!(user_id, "websocket error: {err}");
                break;
            }
        };
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientEnvelope>(&text) {
                Ok(envelope) => handle_envelope(envelope, user_id, &lobby),
                Err(err) => {
                    warn!(user_id, "unparseable envelope: {err}");
                    lobby.registry.send_to(
                        user_id,
                        ServerEnvelope::Error {
                            message: format!("invalid envelope: {err}"),
                        },
                    );
                }
            },
            Message::Close(_) => break,
            // Ping/pong/binary frames carry nothing in this protocol.
            _ => {}
        }
    }

    // Teardown order matters: the queue entry goes first so a join racing
    // this disconnect either misses the entry or forms a session that the
    // leave below observes and destroys with a partner_left.
    lobby.matchmaker.cancel(user_id);
    if let Some(session_id) = lobby.registry.session_of(user_id) {
        lobby.registry.leave(&session_id, user_id);
    }
    lobby.registry.deregister(user_id);
    send_task.abort();
    info!(user_id, "signaling channel closed");
}

fn handle_envelope(envelope: ClientEnvelope, user_id: i64, lobby: &Lobby) {
    match envelope {
        ClientEnvelope::JoinQueue { topic } => {
            match lobby
                .matchmaker
                .join(&lobby.registry, QueueEntry::new(user_id, topic))
            {
                JoinOutcome::AlreadyQueued => lobby.registry.send_to(
                    user_id,
                    ServerEnvelope::Error {
                        message: "already searching".to_string(),
                    },
                ),
                JoinOutcome::AlreadyMatched => lobby.registry.send_to(
                    user_id,
                    ServerEnvelope::Error {
                        message: "already matched".to_string(),
                    },
                ),
                JoinOutcome::Matched | JoinOutcome::Enqueued => {}
            }
        }
        ClientEnvelope::CancelQueue => lobby.matchmaker.cancel(user_id),
        ClientEnvelope::Leave => {
            if let Some(session_id) = lobby.registry.session_of(user_id) {
                lobby.registry.leave(&session_id, user_id);
            }
        }
        // Everything else is relayed to the session partner. A relayable
        // envelope without a session is logged and dropped; the sender is
        // never blocked by it.
        relayable => match lobby.registry.session_of(user_id) {
            Some(session_id) => lobby.registry.relay(&session_id, user_id, relayable),
            None => debug!(user_id, "relayable envelope outside a session"),
        },
    }
}
