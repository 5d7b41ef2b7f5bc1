//! User-facing WebSocket endpoints `/ws` and `/shell`.
//!
//! A `?_slave=<id>` query parameter selects the node that serves the
//! session. Absent or `local`, the socket is bridged straight to the local
//! service's matching WebSocket. Otherwise the upgraded socket is handed to
//! the tunnel manager, which multiplexes it over the slave's control
//! connection. The user's `?token=` rides along either way; the gateway
//! never validates it.

use axum::extract::ws::{close_code, CloseFrame, Message as UserMessage, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message as LocalMessage;
use tracing::{debug, warn};

use crate::protocol::Channel;
use crate::state::AppState;

/// Query parameters accepted on a user WebSocket upgrade.
#[derive(Deserialize)]
pub struct UserWsQuery {
    /// Target node. Absent or `local` selects the local service.
    #[serde(rename = "_slave")]
    pub slave: Option<String>,
    /// Bearer token for the local service behind the selected node.
    pub token: Option<String>,
}

/// `GET /ws` — application WebSocket.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<UserWsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, query, ws, Channel::Ws)
}

/// `GET /shell` — terminal WebSocket.
pub async fn shell_upgrade(
    State(state): State<AppState>,
    Query(query): Query<UserWsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade(state, query, ws, Channel::Shell)
}

fn upgrade(state: AppState, query: UserWsQuery, ws: WebSocketUpgrade, channel: Channel) -> Response {
    let token = query.token.unwrap_or_default();
    let slave = query
        .slave
        .filter(|s| !s.is_empty() && s != "local");
    ws.on_upgrade(move |socket| handle_user_socket(socket, state, channel, slave, token))
}

async fn handle_user_socket(
    socket: WebSocket,
    state: AppState,
    channel: Channel,
    slave: Option<String>,
    token: String,
) {
    match slave {
        Some(slave_id) => match state.tunnel.clone() {
            Some(manager) => manager.create_ws_tunnel(&slave_id, socket, channel, token).await,
            None => close_policy(socket, "Not in master mode").await,
        },
        None => bridge_local(socket, state, channel, token).await,
    }
}

/// Relay a user WebSocket to the local service's matching endpoint.
async fn bridge_local(socket: WebSocket, state: AppState, channel: Channel, token: String) {
    let mut url = format!(
        "ws://localhost:{}{}",
        state.config.server.local_port,
        channel.path()
    );
    if !token.is_empty() {
        url.push_str(&format!("?token={}", urlencoding::encode(&token)));
    }

    let (local_ws, _) = match tokio_tungstenite::connect_async(&url).await {
        Ok(ok) => ok,
        Err(e) => {
            warn!(channel = channel.as_str(), error = %e, "Failed to reach local WebSocket");
            close_policy(socket, "Local service unavailable").await;
            return;
        }
    };
    debug!(channel = channel.as_str(), "Bridged to local service");

    let (mut user_sink, mut user_stream) = socket.split();
    let (mut local_sink, mut local_stream) = local_ws.split();

    loop {
        tokio::select! {
            msg = user_stream.next() => match msg {
                Some(Ok(UserMessage::Text(text))) => {
                    if local_sink
                        .send(LocalMessage::Text(text.to_string().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Ok(UserMessage::Close(_))) | Some(Err(_)) | None => {
                    let _ = local_sink.send(LocalMessage::Close(None)).await;
                    break;
                }
                Some(Ok(_)) => {}
            },
            msg = local_stream.next() => match msg {
                Some(Ok(LocalMessage::Text(text))) => {
                    if user_sink
                        .send(UserMessage::Text(text.to_string().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Some(Ok(LocalMessage::Close(_))) | Some(Err(_)) | None => {
                    let _ = user_sink.send(UserMessage::Close(None)).await;
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
    debug!(channel = channel.as_str(), "Local bridge ended");
}

/// Close an upgraded socket with a policy violation and a readable reason.
pub(crate) async fn close_policy(mut socket: WebSocket, reason: &'static str) {
    let _ = socket
        .send(UserMessage::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: reason.into(),
        })))
        .await;
}
