//! Tunnel client: outbound control connection from a slave to the master.
//!
//! Spawned on startup when the node runs in slave mode. Maintains a single
//! persistent WebSocket to the master with capped exponential backoff plus
//! jitter, authenticates in-band, and serves forwarded traffic by calling
//! the local service over plain HTTP and WebSocket.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use reqwest::header::{HeaderName, HeaderValue};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tracing::{debug, info, warn};

use crate::config::SlaveSettings;
use crate::protocol::{self, Channel, Frame};
use crate::state::TunnelStats;
use crate::util::epoch_ms;

/// Write half of the control connection plus the stats it feeds, shared by
/// every sender.
struct ControlLink {
    sink: Mutex<
        futures::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            tungstenite::Message,
        >,
    >,
    stats: Arc<TunnelStats>,
}

type WsSink = Arc<ControlLink>;

/// Open local WebSocket tunnels, keyed by tunnel id.
type LocalTunnels = Arc<Mutex<HashMap<String, LocalTunnel>>>;

/// Header injected into local HTTP calls so the local service can trust
/// forwarded requests without a user bearer token.
pub const INTERNAL_AUTH_HEADER: &str = "x-cluster-internal-auth";

/// Deadline for a single call against the local service.
const LOCAL_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound (exclusive) of the random jitter added to every backoff.
const JITTER_MS: u64 = 1000;

/// Frames buffered toward a local WebSocket before the tunnel is torn down.
const LOCAL_WRITE_BUFFER: usize = 64;

/// Command for a local tunnel's pump task.
enum LocalCommand {
    Send(String),
    Close,
}

struct LocalTunnel {
    tx: mpsc::Sender<LocalCommand>,
    task: JoinHandle<()>,
}

/// Spawn the tunnel client task. Runs until the process exits.
pub fn spawn(
    settings: SlaveSettings,
    stats: Arc<TunnelStats>,
    http: reqwest::Client,
) -> JoinHandle<()> {
    tokio::spawn(client_loop(Arc::new(settings), stats, http))
}

/// Main loop: connect, run, back off, repeat forever.
async fn client_loop(settings: Arc<SlaveSettings>, stats: Arc<TunnelStats>, http: reqwest::Client) {
    let mut attempt: u32 = 0;
    loop {
        info!(url = %settings.master_url, slave_id = %settings.slave_id, "Connecting to master");
        match connect_and_run(&settings, &stats, &http, &mut attempt).await {
            Ok(()) => info!("Control connection closed, reconnecting"),
            Err(e) => warn!(error = %e, "Control connection failed"),
        }
        stats.connected.store(false, Ordering::Relaxed);
        stats.reconnects.fetch_add(1, Ordering::Relaxed);

        let delay = backoff_delay(
            settings.reconnect_delay,
            settings.reconnect_max_delay,
            attempt,
        );
        attempt = attempt.saturating_add(1);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off before reconnect");
        tokio::time::sleep(delay).await;
    }
}

/// min(base * 2^attempt, max) plus uniform jitter in [0, 1s).
fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.min(32));
    let exp_ms = u64::try_from(base.as_millis())
        .unwrap_or(u64::MAX)
        .saturating_mul(factor);
    let capped_ms = exp_ms.min(u64::try_from(max.as_millis()).unwrap_or(u64::MAX));
    let jitter = rand::thread_rng().gen_range(0..JITTER_MS);
    Duration::from_millis(capped_ms + jitter)
}

/// One connection attempt: dial, authenticate, serve frames until disconnect.
async fn connect_and_run(
    settings: &Arc<SlaveSettings>,
    stats: &Arc<TunnelStats>,
    http: &reqwest::Client,
    attempt: &mut u32,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let url = format!(
        "{}/cluster/tunnel",
        settings.master_url.trim_end_matches('/')
    );
    let (ws_stream, _response) = tokio_tungstenite::connect_async(&url).await?;
    let (ws_sink, mut ws_stream) = ws_stream.split();
    let ws_sink: WsSink = Arc::new(ControlLink {
        sink: Mutex::new(ws_sink),
        stats: stats.clone(),
    });

    send_frame(
        &ws_sink,
        &Frame::Auth {
            slave_id: settings.slave_id.clone(),
            slave_name: settings.slave_name.clone(),
            secret: settings.secret.clone(),
        },
    )
    .await?;

    // Nothing else flows until the master acknowledges the handshake.
    loop {
        match ws_stream.next().await {
            None => return Err("connection closed during handshake".into()),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(tungstenite::Message::Text(text))) => {
                match protocol::decode(text.as_str()) {
                    Ok(Frame::AuthSuccess { .. }) => break,
                    Ok(frame) => {
                        return Err(format!("unexpected frame during handshake: {frame:?}").into())
                    }
                    Err(e) => warn!(error = %e, "Dropping undecodable frame during handshake"),
                }
            }
            Some(Ok(tungstenite::Message::Close(cf))) => {
                let detail = cf
                    .map(|cf| format!("{} {}", u16::from(cf.code), cf.reason))
                    .unwrap_or_else(|| "no close frame".to_string());
                return Err(format!("master rejected connection: {detail}").into());
            }
            Some(Ok(_)) => {}
        }
    }
    info!(slave_id = %settings.slave_id, "Authenticated with master");
    *attempt = 0;
    stats.connected.store(true, Ordering::Relaxed);

    let tunnels: LocalTunnels = Arc::new(Mutex::new(HashMap::new()));

    // Heartbeat task. The master treats pings as liveness; pongs feed RTT.
    let ping_sink = ws_sink.clone();
    let ping_interval = settings.ping_interval;
    let ping_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(ping_interval);
        loop {
            interval.tick().await;
            let frame = Frame::Ping {
                timestamp: epoch_ms(),
            };
            if send_frame(&ping_sink, &frame).await.is_err() {
                break;
            }
        }
    });

    let result = loop {
        match ws_stream.next().await {
            None => break Ok(()),
            Some(Err(e)) => break Err(e.into()),
            Some(Ok(tungstenite::Message::Text(text))) => match protocol::decode(text.as_str()) {
                Ok(frame) => {
                    stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    handle_master_frame(settings, stats, http, &ws_sink, &tunnels, frame).await;
                }
                Err(e) => warn!(error = %e, "Dropping undecodable frame"),
            },
            Some(Ok(tungstenite::Message::Close(cf))) => {
                info!(close = ?cf, "Master closed control connection");
                break Ok(());
            }
            Some(Ok(_)) => {}
        }
    };

    // Control connection is gone; every local tunnel dies with it.
    ping_task.abort();
    let mut tunnels = tunnels.lock().await;
    for (_, tunnel) in tunnels.drain() {
        tunnel.task.abort();
    }
    result
}

/// Route one frame from the master.
async fn handle_master_frame(
    settings: &Arc<SlaveSettings>,
    stats: &Arc<TunnelStats>,
    http: &reqwest::Client,
    ws_sink: &WsSink,
    tunnels: &LocalTunnels,
    frame: Frame,
) {
    match frame {
        Frame::HttpRequest {
            request_id,
            method,
            path,
            headers,
            body,
        } => {
            let settings = settings.clone();
            let http = http.clone();
            let ws_sink = ws_sink.clone();
            tokio::spawn(async move {
                handle_http_request(
                    settings, http, ws_sink, request_id, method, path, headers, body,
                )
                .await;
            });
        }
        Frame::WsTunnelOpen {
            tunnel_id,
            channel,
            token,
        } => {
            let settings = settings.clone();
            let ws_sink = ws_sink.clone();
            let tunnels = tunnels.clone();
            tokio::spawn(async move {
                open_local_tunnel(settings, ws_sink, tunnels, tunnel_id, channel, token).await;
            });
        }
        Frame::WsMessage { tunnel_id, data } => {
            deliver_local(tunnels, ws_sink, &tunnel_id, data).await;
        }
        Frame::WsTunnelClose { tunnel_id } => {
            close_local_tunnel(tunnels, &tunnel_id).await;
        }
        Frame::Pong { timestamp } => {
            let now = epoch_ms();
            if now >= timestamp {
                stats.record_pong(now - timestamp).await;
            }
        }
        Frame::Error {
            tunnel_id,
            request_id,
            error,
        } => {
            warn!(?tunnel_id, ?request_id, %error, "Error frame from master");
        }
        other => {
            warn!(frame = ?other, "Unexpected frame from master");
        }
    }
}

/// Serve one forwarded HTTP request against the local service.
#[allow(clippy::too_many_arguments)]
async fn handle_http_request(
    settings: Arc<SlaveSettings>,
    http: reqwest::Client,
    ws_sink: WsSink,
    request_id: String,
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Option<String>,
) {
    let reply = match call_local(&settings, &http, &method, &path, headers, body).await {
        Ok((status, headers, body)) => Frame::Response {
            request_id,
            status: Some(status),
            headers: Some(headers),
            body,
            error: None,
        },
        Err(e) => {
            warn!(%method, %path, error = %e, "Local HTTP call failed");
            Frame::Response {
                request_id,
                status: None,
                headers: None,
                body: None,
                error: Some(e.to_string()),
            }
        }
    };
    let _ = send_frame(&ws_sink, &reply).await;
}

/// Issue the actual HTTP call to `localhost:<local_port>`.
async fn call_local(
    settings: &SlaveSettings,
    http: &reqwest::Client,
    method: &str,
    path: &str,
    headers: HashMap<String, String>,
    body: Option<String>,
) -> Result<(u16, HashMap<String, String>, Option<String>), Box<dyn std::error::Error + Send + Sync>>
{
    let method = reqwest::Method::from_bytes(method.as_bytes())?;
    let url = format!("http://localhost:{}{}", settings.local_port, path);

    let mut header_map = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        // Host and content-length are rewritten for the local hop.
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            header_map.insert(name, value);
        }
    }
    header_map.insert(
        reqwest::header::HOST,
        HeaderValue::from_str(&format!("localhost:{}", settings.local_port))?,
    );
    header_map.insert(
        HeaderName::from_static(INTERNAL_AUTH_HEADER),
        HeaderValue::from_str(&settings.secret)?,
    );

    let mut request = http
        .request(method, url)
        .headers(header_map)
        .timeout(LOCAL_HTTP_TIMEOUT);
    if let Some(body) = body {
        request = request.body(body);
    }

    let response = request.send().await?;
    let status = response.status().as_u16();
    let mut headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), value.to_string());
        }
    }
    let text = response.text().await?;
    let body = if text.is_empty() { None } else { Some(text) };
    Ok((status, headers, body))
}

/// Open the local WebSocket backing a new tunnel and start its pump.
async fn open_local_tunnel(
    settings: Arc<SlaveSettings>,
    ws_sink: WsSink,
    tunnels: LocalTunnels,
    tunnel_id: String,
    channel: Channel,
    token: String,
) {
    let url = format!(
        "ws://localhost:{}{}?token={}",
        settings.local_port,
        channel.path(),
        urlencoding::encode(&token)
    );
    let (local_ws, _) = match tokio_tungstenite::connect_async(&url).await {
        Ok(ok) => ok,
        Err(e) => {
            warn!(%tunnel_id, channel = channel.as_str(), error = %e, "Failed to open local WebSocket");
            let _ = send_frame(
                &ws_sink,
                &Frame::Error {
                    tunnel_id: Some(tunnel_id.clone()),
                    request_id: None,
                    error: format!("failed to open local websocket: {e}"),
                },
            )
            .await;
            let _ = send_frame(&ws_sink, &Frame::WsTunnelClosed { tunnel_id }).await;
            return;
        }
    };
    info!(%tunnel_id, channel = channel.as_str(), "Local tunnel opened");

    let (cmd_tx, cmd_rx) = mpsc::channel(LOCAL_WRITE_BUFFER);
    let task = tokio::spawn(run_local_tunnel(
        local_ws,
        cmd_rx,
        ws_sink,
        tunnels.clone(),
        tunnel_id.clone(),
    ));
    tunnels
        .lock()
        .await
        .insert(tunnel_id, LocalTunnel { tx: cmd_tx, task });
}

/// Pump a local WebSocket: inbound frames become `ws_data`, commands from
/// the control loop become writes or a close.
async fn run_local_tunnel(
    local_ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    mut cmd_rx: mpsc::Receiver<LocalCommand>,
    ws_sink: WsSink,
    tunnels: LocalTunnels,
    tunnel_id: String,
) {
    let (mut local_sink, mut local_stream) = local_ws.split();
    let mut notify_master = true;
    loop {
        tokio::select! {
            msg = local_stream.next() => match msg {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    let frame = Frame::WsData {
                        tunnel_id: tunnel_id.clone(),
                        data: text.to_string(),
                    };
                    if send_frame(&ws_sink, &frame).await.is_err() {
                        notify_master = false;
                        break;
                    }
                }
                Some(Ok(tungstenite::Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(LocalCommand::Send(data)) => {
                    if local_sink.send(tungstenite::Message::Text(data.into())).await.is_err() {
                        break;
                    }
                }
                Some(LocalCommand::Close) | None => {
                    let _ = local_sink.send(tungstenite::Message::Close(None)).await;
                    // The master asked for this close; no report needed.
                    notify_master = false;
                    break;
                }
            },
        }
    }
    tunnels.lock().await.remove(&tunnel_id);
    if notify_master {
        debug!(%tunnel_id, "Local WebSocket closed");
        let _ = send_frame(&ws_sink, &Frame::WsTunnelClosed { tunnel_id }).await;
    }
}

/// Deliver a user frame to the named local WebSocket, or drop it.
async fn deliver_local(tunnels: &LocalTunnels, ws_sink: &WsSink, tunnel_id: &str, data: String) {
    let sendable = tunnels
        .lock()
        .await
        .get(tunnel_id)
        .map(|t| t.tx.try_send(LocalCommand::Send(data)));
    match sendable {
        None => debug!(tunnel_id, "Dropping frame for unknown tunnel"),
        Some(Ok(())) => {}
        Some(Err(mpsc::error::TrySendError::Full(_))) => {
            warn!(tunnel_id, "Local WebSocket too slow, closing tunnel");
            if let Some(tunnel) = tunnels.lock().await.remove(tunnel_id) {
                tunnel.task.abort();
            }
            let _ = send_frame(
                ws_sink,
                &Frame::WsTunnelClosed {
                    tunnel_id: tunnel_id.to_string(),
                },
            )
            .await;
        }
        Some(Err(mpsc::error::TrySendError::Closed(_))) => {
            tunnels.lock().await.remove(tunnel_id);
        }
    }
}

/// Close and forget a local tunnel at the master's request.
async fn close_local_tunnel(tunnels: &LocalTunnels, tunnel_id: &str) {
    let Some(tunnel) = tunnels.lock().await.remove(tunnel_id) else {
        return;
    };
    if tunnel.tx.try_send(LocalCommand::Close).is_err() {
        tunnel.task.abort();
    }
}

/// Send one frame on the control connection.
async fn send_frame(ws_sink: &WsSink, frame: &Frame) -> Result<(), tungstenite::Error> {
    let mut sink = ws_sink.sink.lock().await;
    sink.send(tungstenite::Message::Text(protocol::encode(frame).into()))
        .await?;
    ws_sink.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
    Ok(())
}
