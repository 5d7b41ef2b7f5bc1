//! Master side of the tunnel: control-connection accept, handshake, dispatch.
//!
//! Slaves connect inbound at `GET /cluster/tunnel` and must authenticate with
//! an `auth` frame before anything else flows:
//!
//! - no `auth` within the deadline: close 4001
//! - first decodable frame is not `auth`: close 4003
//! - wrong secret or empty slave id: close 4002
//! - a later handshake for the same slave id: the older connection is closed
//!   with 4004 and its tunnels and pending requests are drained
//!
//! After the handshake every frame from the slave is dispatched to the
//! registry (pings), the correlator (responses) or the mux (tunnel traffic).
//! All writes to a control connection go through one writer task per
//! connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::correlator::{Completion, WaitError};
use super::mux::{DeliverOutcome, TunnelMux, UserFrame};
use super::registry::{SlaveRecord, SlaveRegistry};
use super::{Outbound, CLOSE_AUTH_FAILED, CLOSE_AUTH_TIMEOUT, CLOSE_EXPECTED_AUTH};
use crate::auth::constant_time_eq;
use crate::protocol::{self, Channel, Frame};
use crate::state::AppState;

/// Hop-by-hop headers, stripped from requests before they cross the tunnel.
pub(crate) const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Routing header consumed by the gateway, never forwarded.
pub const TARGET_SLAVE_HEADER: &str = "x-target-slave";

/// Outbound frames buffered per control connection before sends block.
const CONTROL_WRITE_BUFFER: usize = 256;

/// Frames buffered toward a user WebSocket before the tunnel is torn down.
const USER_WRITE_BUFFER: usize = 64;

/// Result of a successfully forwarded HTTP request.
#[derive(Debug)]
pub struct ForwardedResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

/// Why a forward attempt failed.
#[derive(Debug)]
pub enum ForwardError {
    /// No registry entry for the requested slave.
    NotConnected,
    /// The control connection's write channel rejected the frame.
    SendFailed,
    /// No response within the per-request deadline.
    Timeout,
    /// The slave disconnected while the request was in flight.
    Disconnected,
    /// The slave answered with an error instead of a response.
    Remote(String),
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "slave not connected"),
            Self::SendFailed => write!(f, "failed to send on control connection"),
            Self::Timeout => write!(f, "request timeout"),
            Self::Disconnected => write!(f, "slave disconnected"),
            Self::Remote(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ForwardError {}

/// Master-side tunnel state: slave registry, tunnel mux, handshake policy.
pub struct TunnelManager {
    registry: SlaveRegistry,
    mux: TunnelMux,
    secret: String,
    auth_timeout: Duration,
    request_timeout: Duration,
}

impl TunnelManager {
    #[must_use]
    pub fn new(secret: String, auth_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            registry: SlaveRegistry::new(),
            mux: TunnelMux::new(),
            secret,
            auth_timeout,
            request_timeout,
        }
    }

    pub fn registry(&self) -> &SlaveRegistry {
        &self.registry
    }

    pub fn mux(&self) -> &TunnelMux {
        &self.mux
    }

    /// Run one control connection to completion: handshake, dispatch loop,
    /// teardown of everything the slave owned.
    pub async fn handle_control(self: Arc<Self>, socket: WebSocket) {
        let (sink, mut stream) = socket.split();
        let (tx, rx) = mpsc::channel::<Outbound>(CONTROL_WRITE_BUFFER);
        let writer = tokio::spawn(control_writer(sink, rx));

        let Some((slave_id, slave_name)) = self.await_auth(&mut stream, &tx).await else {
            drop(tx);
            // Let the writer flush the close frame before the socket drops.
            let _ = writer.await;
            return;
        };

        let conn_id = Uuid::new_v4();
        if let Some(old) = self
            .registry
            .register(&slave_id, &slave_name, conn_id, tx.clone())
            .await
        {
            let closed = self.mux.remove_for_slave(&slave_id).await;
            let drained = old.pending.drain("slave replaced").await;
            if !closed.is_empty() || drained > 0 {
                info!(
                    %slave_id,
                    tunnels = closed.len(),
                    pending = drained,
                    "Drained state of replaced connection"
                );
            }
        }
        let Some(record) = self.registry.get(&slave_id).await else {
            // Evicted again before we could even ack; nothing left to run.
            writer.abort();
            return;
        };

        if tx
            .send(Outbound::Frame(Frame::AuthSuccess {
                slave_id: slave_id.clone(),
            }))
            .await
            .is_err()
        {
            self.teardown(&slave_id, conn_id).await;
            writer.abort();
            return;
        }
        info!(%slave_id, name = %slave_name, "Slave authenticated");

        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => match protocol::decode(text.as_str()) {
                    Ok(frame) => self.dispatch(&slave_id, &record, &tx, frame).await,
                    Err(e) => warn!(%slave_id, error = %e, "Dropping undecodable frame"),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }

        self.teardown(&slave_id, conn_id).await;
        writer.abort();
    }

    /// Wait for the `auth` frame, enforcing the handshake deadline. Returns
    /// the slave's id and display name on success; on failure the proper
    /// close frame has been queued and `None` is returned.
    async fn await_auth(
        &self,
        stream: &mut SplitStream<WebSocket>,
        tx: &mpsc::Sender<Outbound>,
    ) -> Option<(String, String)> {
        let deadline = Instant::now() + self.auth_timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, stream.next()).await;
            match next {
                Err(_) => {
                    let _ = tx
                        .send(Outbound::Close {
                            code: CLOSE_AUTH_TIMEOUT,
                            reason: "authentication timeout",
                        })
                        .await;
                    return None;
                }
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return None,
                Ok(Some(Ok(Message::Text(text)))) => match protocol::decode(text.as_str()) {
                    Ok(Frame::Auth {
                        slave_id,
                        slave_name,
                        secret,
                    }) => {
                        if slave_id.is_empty()
                            || !constant_time_eq(self.secret.as_bytes(), secret.as_bytes())
                        {
                            warn!(%slave_id, "Slave authentication failed");
                            let _ = tx
                                .send(Outbound::Close {
                                    code: CLOSE_AUTH_FAILED,
                                    reason: "authentication failed",
                                })
                                .await;
                            return None;
                        }
                        let name = if slave_name.is_empty() {
                            slave_id.clone()
                        } else {
                            slave_name
                        };
                        return Some((slave_id, name));
                    }
                    Ok(_) => {
                        let _ = tx
                            .send(Outbound::Close {
                                code: CLOSE_EXPECTED_AUTH,
                                reason: "expected auth",
                            })
                            .await;
                        return None;
                    }
                    Err(e) => {
                        warn!(error = %e, "Dropping undecodable frame during handshake");
                    }
                },
                // Protocol-level ping/pong and binary frames don't count as
                // handshake messages.
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    /// Route one authenticated frame.
    async fn dispatch(
        &self,
        slave_id: &str,
        record: &SlaveRecord,
        tx: &mpsc::Sender<Outbound>,
        frame: Frame,
    ) {
        match frame {
            Frame::Response {
                request_id,
                status,
                headers,
                body,
                error,
            } => {
                let completion = match error {
                    Some(e) => Completion::Error(e),
                    None => Completion::Response {
                        status: status.unwrap_or(200),
                        headers: headers.unwrap_or_default(),
                        body,
                    },
                };
                record.pending.complete(&request_id, completion).await;
            }
            Frame::WsData { tunnel_id, data } => {
                if self.mux.deliver(&tunnel_id, data).await == DeliverOutcome::Backpressure {
                    let _ = tx
                        .send(Outbound::Frame(Frame::WsTunnelClose {
                            tunnel_id: tunnel_id.clone(),
                        }))
                        .await;
                }
            }
            Frame::WsTunnelClosed { tunnel_id } => {
                if self.mux.close_local(&tunnel_id).await {
                    debug!(slave_id, %tunnel_id, "Tunnel closed by slave");
                }
            }
            Frame::Ping { timestamp } => {
                self.registry.touch(slave_id).await;
                let _ = tx.send(Outbound::Frame(Frame::Pong { timestamp })).await;
            }
            Frame::Error {
                tunnel_id,
                request_id,
                error,
            } => {
                if let Some(request_id) = request_id {
                    record
                        .pending
                        .complete(&request_id, Completion::Error(error))
                        .await;
                } else if let Some(tunnel_id) = tunnel_id {
                    warn!(slave_id, %tunnel_id, %error, "Tunnel error from slave");
                    self.mux.close_local(&tunnel_id).await;
                } else {
                    warn!(slave_id, %error, "Error frame from slave");
                }
            }
            Frame::Auth { .. } => {
                debug!(slave_id, "Duplicate auth frame ignored");
            }
            other => {
                warn!(slave_id, frame = ?other, "Unexpected frame on control connection");
            }
        }
    }

    async fn teardown(&self, slave_id: &str, conn_id: Uuid) {
        if let Some(record) = self.registry.unregister(slave_id, conn_id).await {
            let closed = self.mux.remove_for_slave(slave_id).await;
            let drained = record.pending.drain("slave disconnected").await;
            info!(
                slave_id,
                tunnels = closed.len(),
                pending = drained,
                "Slave disconnected"
            );
        }
    }

    /// Forward one HTTP request over a slave's control connection and await
    /// its response, bounded by the per-request deadline.
    pub async fn forward_http_request(
        &self,
        slave_id: &str,
        method: &str,
        path: &str,
        headers: &HeaderMap,
        body: Option<String>,
    ) -> Result<ForwardedResponse, ForwardError> {
        let Some(record) = self.registry.get(slave_id).await else {
            return Err(ForwardError::NotConnected);
        };
        let headers = sanitize_request_headers(headers);
        let (request_id, rx) = record.pending.issue().await;
        let frame = Frame::HttpRequest {
            request_id: request_id.clone(),
            method: method.to_string(),
            path: path.to_string(),
            headers,
            body,
        };
        if record.tx.send(Outbound::Frame(frame)).await.is_err() {
            record.pending.forget(&request_id).await;
            return Err(ForwardError::SendFailed);
        }
        match record
            .pending
            .wait(&request_id, rx, self.request_timeout)
            .await
        {
            Ok(Completion::Response {
                status,
                mut headers,
                body,
            }) => {
                sanitize_response_headers(&mut headers);
                Ok(ForwardedResponse {
                    status,
                    headers,
                    body,
                })
            }
            Ok(Completion::Error(e)) => Err(ForwardError::Remote(e)),
            Err(WaitError::Timeout) => Err(ForwardError::Timeout),
            Err(WaitError::ConnectionLost) => Err(ForwardError::Disconnected),
        }
    }

    /// Bind an upgraded user WebSocket to a new tunnel on `slave_id` and pump
    /// it until either end closes. The user's bearer token is forwarded in
    /// `ws_tunnel_open` so the slave's local service can re-authenticate.
    pub async fn create_ws_tunnel(
        &self,
        slave_id: &str,
        socket: WebSocket,
        channel: Channel,
        token: String,
    ) {
        let Some(record) = self.registry.get(slave_id).await else {
            reject_user(socket, "Slave not connected").await;
            return;
        };

        let tunnel_id = Uuid::new_v4().to_string();
        let (user_tx, user_rx) = mpsc::channel::<UserFrame>(USER_WRITE_BUFFER);
        let (sink, mut stream) = socket.split();
        let writer = tokio::spawn(user_writer(sink, user_rx));
        self.mux.insert(&tunnel_id, slave_id, channel, user_tx).await;

        let open = Frame::WsTunnelOpen {
            tunnel_id: tunnel_id.clone(),
            channel,
            token,
        };
        if record.tx.send(Outbound::Frame(open)).await.is_err() {
            self.mux.close_local(&tunnel_id).await;
            let _ = writer.await;
            return;
        }
        info!(slave_id, %tunnel_id, channel = channel.as_str(), "Tunnel opened");

        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => {
                    let frame = Frame::WsMessage {
                        tunnel_id: tunnel_id.clone(),
                        data: text.to_string(),
                    };
                    if record.tx.send(Outbound::Frame(frame)).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        // Only announce the close if the record was still ours; it may have
        // been removed already by a slave-side close or a disconnect sweep.
        if self.mux.remove(&tunnel_id).await.is_some() {
            let _ = record
                .tx
                .send(Outbound::Frame(Frame::WsTunnelClose {
                    tunnel_id: tunnel_id.clone(),
                }))
                .await;
        }
        writer.abort();
        debug!(slave_id, %tunnel_id, "Tunnel pump ended");
    }
}

/// `GET /cluster/tunnel` — control-connection endpoint for slaves.
pub async fn control_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let Some(manager) = state.tunnel.clone() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Not in master mode"})),
        )
            .into_response();
    };
    ws.on_upgrade(move |socket| {
        manager
            .handle_control(socket)
            .instrument(info_span!("control_conn"))
    })
}

/// Writer task: the only place that touches a control connection's sink.
async fn control_writer(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(out) = rx.recv().await {
        match out {
            Outbound::Frame(frame) => {
                let text = protocol::encode(&frame);
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

/// Writer task for a user-side tunnel WebSocket.
async fn user_writer(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<UserFrame>) {
    while let Some(frame) = rx.recv().await {
        match frame {
            UserFrame::Text(data) => {
                if sink.send(Message::Text(data.into())).await.is_err() {
                    break;
                }
            }
            UserFrame::Close => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: "tunnel closed".into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

async fn reject_user(mut socket: WebSocket, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: reason.into(),
        })))
        .await;
}

/// Drop hop-by-hop headers and the routing header; flatten the rest.
fn sanitize_request_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (name, value) in headers {
        let name = name.as_str();
        if HOP_BY_HOP.contains(&name) || name == TARGET_SLAVE_HEADER {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.insert(name.to_string(), value.to_string());
        }
    }
    out
}

/// Headers a proxied response must not carry back to the user.
fn sanitize_response_headers(headers: &mut HashMap<String, String>) {
    headers.retain(|name, _| {
        let name = name.to_ascii_lowercase();
        name != "transfer-encoding" && name != "connection"
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite;

    async fn spawn_master(secret: &str, auth_timeout: Duration) -> (Arc<TunnelManager>, String) {
        let manager = Arc::new(TunnelManager::new(
            secret.to_string(),
            auth_timeout,
            Duration::from_secs(5),
        ));
        let mgr = manager.clone();
        let app = Router::new().route(
            "/cluster/tunnel",
            get(move |ws: WebSocketUpgrade| {
                let mgr = mgr.clone();
                async move { ws.on_upgrade(move |socket| mgr.handle_control(socket)) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (manager, format!("ws://{addr}/cluster/tunnel"))
    }

    fn auth_frame(slave_id: &str, secret: &str) -> tungstenite::Message {
        tungstenite::Message::Text(
            protocol::encode(&Frame::Auth {
                slave_id: slave_id.into(),
                slave_name: format!("{slave_id} name"),
                secret: secret.into(),
            })
            .into(),
        )
    }

    async fn next_frame<S>(stream: &mut S) -> Frame
    where
        S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    {
        loop {
            match stream.next().await.expect("stream ended").expect("ws error") {
                tungstenite::Message::Text(text) => return protocol::decode(text.as_str()).unwrap(),
                tungstenite::Message::Close(cf) => panic!("unexpected close: {cf:?}"),
                _ => {}
            }
        }
    }

    async fn next_close_code<S>(stream: &mut S) -> u16
    where
        S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    {
        loop {
            match stream.next().await {
                Some(Ok(tungstenite::Message::Close(Some(cf)))) => return u16::from(cf.code),
                Some(Ok(_)) => {}
                Some(Err(_)) | None => panic!("connection ended without close frame"),
            }
        }
    }

    #[tokio::test]
    async fn handshake_success_registers_the_slave() {
        let (manager, url) = spawn_master("sekrit", Duration::from_secs(5)).await;
        let (mut ws, _) = connect_async(&url).await.unwrap();
        ws.send(auth_frame("s1", "sekrit")).await.unwrap();
        match next_frame(&mut ws).await {
            Frame::AuthSuccess { slave_id } => assert_eq!(slave_id, "s1"),
            other => panic!("expected auth_success, got {other:?}"),
        }
        assert!(manager.registry().is_connected("s1").await);
        let info = manager.registry().info("s1").await.unwrap();
        assert_eq!(info.name, "s1 name");
    }

    #[tokio::test]
    async fn wrong_secret_closes_with_4002() {
        let (manager, url) = spawn_master("sekrit", Duration::from_secs(5)).await;
        let (mut ws, _) = connect_async(&url).await.unwrap();
        ws.send(auth_frame("s1", "wrong")).await.unwrap();
        assert_eq!(next_close_code(&mut ws).await, CLOSE_AUTH_FAILED);
        assert!(!manager.registry().is_connected("s1").await);
    }

    #[tokio::test]
    async fn non_auth_first_frame_closes_with_4003() {
        let (_manager, url) = spawn_master("sekrit", Duration::from_secs(5)).await;
        let (mut ws, _) = connect_async(&url).await.unwrap();
        ws.send(tungstenite::Message::Text(
            protocol::encode(&Frame::Ping { timestamp: 1 }).into(),
        ))
        .await
        .unwrap();
        assert_eq!(next_close_code(&mut ws).await, CLOSE_EXPECTED_AUTH);
    }

    #[tokio::test]
    async fn handshake_deadline_closes_with_4001() {
        let (_manager, url) = spawn_master("sekrit", Duration::from_millis(50)).await;
        let (mut ws, _) = connect_async(&url).await.unwrap();
        assert_eq!(next_close_code(&mut ws).await, CLOSE_AUTH_TIMEOUT);
    }

    #[tokio::test]
    async fn second_handshake_evicts_the_first_with_4004() {
        let (manager, url) = spawn_master("sekrit", Duration::from_secs(5)).await;

        let (mut first, _) = connect_async(&url).await.unwrap();
        first.send(auth_frame("s1", "sekrit")).await.unwrap();
        let _ = next_frame(&mut first).await;

        let (mut second, _) = connect_async(&url).await.unwrap();
        second.send(auth_frame("s1", "sekrit")).await.unwrap();
        let _ = next_frame(&mut second).await;

        assert_eq!(next_close_code(&mut first).await, super::super::CLOSE_REPLACED);
        assert!(manager.registry().is_connected("s1").await);
        assert_eq!(manager.registry().count().await, 1);
    }

    #[tokio::test]
    async fn forward_strips_routing_and_hop_by_hop_headers() {
        let (manager, url) = spawn_master("sekrit", Duration::from_secs(5)).await;
        let (mut ws, _) = connect_async(&url).await.unwrap();
        ws.send(auth_frame("s1", "sekrit")).await.unwrap();
        let _ = next_frame(&mut ws).await;

        // Answer the forwarded request like a slave would.
        let echo = tokio::spawn(async move {
            let frame = next_frame(&mut ws).await;
            let Frame::HttpRequest {
                request_id,
                method,
                path,
                headers,
                body,
            } = frame
            else {
                panic!("expected http_request");
            };
            assert_eq!(method, "GET");
            assert_eq!(path, "/api/projects?full=1");
            assert!(body.is_none());
            assert!(!headers.contains_key("x-target-slave"));
            assert!(!headers.contains_key("connection"));
            assert!(!headers.contains_key("transfer-encoding"));
            assert_eq!(headers.get("accept").map(String::as_str), Some("*/*"));
            let reply = Frame::Response {
                request_id,
                status: Some(200),
                headers: Some(HashMap::from([
                    ("content-type".to_string(), "application/json".to_string()),
                    ("transfer-encoding".to_string(), "chunked".to_string()),
                ])),
                body: Some(r#"{"projects":["p"]}"#.to_string()),
                error: None,
            };
            ws.send(tungstenite::Message::Text(protocol::encode(&reply).into()))
                .await
                .unwrap();
        });

        let mut headers = HeaderMap::new();
        headers.insert("accept", "*/*".parse().unwrap());
        headers.insert("x-target-slave", "s1".parse().unwrap());
        headers.insert("connection", "keep-alive".parse().unwrap());
        let response = manager
            .forward_http_request("s1", "GET", "/api/projects?full=1", &headers, None)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body.as_deref(), Some(r#"{"projects":["p"]}"#));
        assert!(!response.headers.contains_key("transfer-encoding"));
        assert_eq!(
            response.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn forward_to_unknown_slave_is_not_connected() {
        let (manager, _url) = spawn_master("sekrit", Duration::from_secs(5)).await;
        let err = manager
            .forward_http_request("ghost", "GET", "/", &HeaderMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::NotConnected));
    }

    #[tokio::test]
    async fn disconnect_fails_pending_requests() {
        let (manager, url) = spawn_master("sekrit", Duration::from_secs(5)).await;
        let (mut ws, _) = connect_async(&url).await.unwrap();
        ws.send(auth_frame("s1", "sekrit")).await.unwrap();
        let _ = next_frame(&mut ws).await;

        let mgr = manager.clone();
        let pending = tokio::spawn(async move {
            mgr.forward_http_request("s1", "GET", "/slow", &HeaderMap::new(), None)
                .await
        });
        // Give the forward a moment to be issued, then drop the slave.
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(ws);

        let err = pending.await.unwrap().unwrap_err();
        match err {
            ForwardError::Remote(msg) => assert_eq!(msg, "slave disconnected"),
            other => panic!("expected remote error, got {other:?}"),
        }
        // The registry entry goes with the connection.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!manager.registry().is_connected("s1").await);
    }

    #[test]
    fn response_sanitizer_drops_connection_headers() {
        let mut headers = HashMap::from([
            ("Connection".to_string(), "close".to_string()),
            ("transfer-encoding".to_string(), "chunked".to_string()),
            ("content-type".to_string(), "text/plain".to_string()),
        ]);
        sanitize_response_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }
}
