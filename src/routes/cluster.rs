//! Read-only cluster status endpoints.
//!
//! `/api/cluster/status` is open (suitable for probes and UI polling); the
//! `/api/cluster/slaves*` family requires the admin API key. Outside master
//! mode everything except `/status` answers `400 Not in master mode`.

use std::sync::atomic::Ordering;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::config::DeploymentMode;
use crate::state::AppState;

/// `GET /api/cluster/status` — cluster mode and connected-slave summary.
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let mut body = json!({
        "mode": state.config.cluster.mode.as_str(),
        "isMaster": state.tunnel.is_some(),
        "connectedSlaves": 0,
        "slaves": [],
        "uptimeSecs": state.start_time.elapsed().as_secs(),
    });

    if let Some(manager) = &state.tunnel {
        let slaves = manager.registry().list().await;
        body["connectedSlaves"] = json!(slaves.len());
        body["slaves"] = slaves
            .iter()
            .map(|s| json!({"id": s.id, "name": s.name, "status": "connected"}))
            .collect::<Vec<_>>()
            .into();
    } else if state.config.cluster.mode == DeploymentMode::Slave {
        let stats = &state.tunnel_stats;
        let mut tunnel = json!({
            "connected": stats.connected.load(Ordering::Relaxed),
            "reconnects": stats.reconnects.load(Ordering::Relaxed),
            "messagesSent": stats.messages_sent.load(Ordering::Relaxed),
            "messagesReceived": stats.messages_received.load(Ordering::Relaxed),
            "lastPong": stats.last_pong_ms.load(Ordering::Relaxed),
        });
        if let Some((median, p95)) = stats.rtt_stats().await {
            tunnel["rttMedianMs"] = json!(median);
            tunnel["rttP95Ms"] = json!(p95);
        }
        body["tunnel"] = tunnel;
    }

    Json(body)
}

/// `GET /api/cluster/slaves` — every reachable node, the local one first.
pub async fn list_slaves(State(state): State<AppState>) -> Response {
    let Some(manager) = &state.tunnel else {
        return not_master();
    };

    let mut clients = vec![local_entry()];
    for s in manager.registry().list().await {
        clients.push(json!({
            "id": s.id,
            "name": s.name,
            "status": "connected",
            "isLocal": false,
            "connectedAt": s.connected_at_ms,
            "lastPing": s.last_ping_ms,
        }));
    }
    Json(json!({"success": true, "clients": clients})).into_response()
}

/// `GET /api/cluster/slaves/{id}` — one node, or 404.
pub async fn get_slave(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(manager) = &state.tunnel else {
        return not_master();
    };

    if id == "local" {
        return Json(local_entry()).into_response();
    }
    match manager.registry().info(&id).await {
        Some(s) => Json(json!({
            "id": s.id,
            "name": s.name,
            "status": "connected",
            "isLocal": false,
            "connectedAt": s.connected_at_ms,
            "lastPing": s.last_ping_ms,
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Slave not found", "slaveId": id})),
        )
            .into_response(),
    }
}

/// `GET /api/cluster/slaves/{id}/health` — liveness view of one node.
pub async fn slave_health(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(manager) = &state.tunnel else {
        return not_master();
    };

    if id == "local" {
        return Json(json!({
            "healthy": true,
            "slaveId": "local",
            "name": "Local Server",
            "status": "connected",
            "message": "Local server",
        }))
        .into_response();
    }
    match manager.registry().info(&id).await {
        Some(s) => Json(json!({
            "healthy": true,
            "slaveId": s.id,
            "name": s.name,
            "status": "connected",
            "lastPing": s.last_ping_ms,
            "message": "Slave connected",
        }))
        .into_response(),
        None => Json(json!({
            "healthy": false,
            "slaveId": id,
            "message": "Slave not connected",
        }))
        .into_response(),
    }
}

fn local_entry() -> Value {
    json!({
        "id": "local",
        "name": "Local Server",
        "status": "connected",
        "isLocal": true,
    })
}

fn not_master() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "Not in master mode"})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, Config};
    use crate::tunnel::manager::TunnelManager;
    use std::sync::Arc;
    use std::time::Duration;

    fn standalone_state() -> AppState {
        AppState::new(Config::default())
    }

    fn state_in_mode(mode: DeploymentMode) -> AppState {
        let config = Config {
            cluster: ClusterConfig {
                mode,
                secret: Some("k".into()),
                ..ClusterConfig::default()
            },
            ..Config::default()
        };
        AppState::new(config)
    }

    fn master_state() -> AppState {
        let mut state = state_in_mode(DeploymentMode::Master);
        state.tunnel = Some(Arc::new(TunnelManager::new(
            "k".into(),
            Duration::from_secs(10),
            Duration::from_secs(30),
        )));
        state
    }

    #[tokio::test]
    async fn standalone_status_shape() {
        let Json(body) = status(State(standalone_state())).await;
        assert_eq!(body["mode"], "standalone");
        assert_eq!(body["isMaster"], false);
        assert_eq!(body["connectedSlaves"], 0);
        assert!(body["slaves"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn slave_status_reports_tunnel_stats() {
        let state = state_in_mode(DeploymentMode::Slave);
        state.tunnel_stats.record_pong(12).await;

        let Json(body) = status(State(state)).await;
        assert_eq!(body["mode"], "slave");
        assert_eq!(body["isMaster"], false);
        assert_eq!(body["tunnel"]["connected"], false);
        assert_eq!(body["tunnel"]["messagesSent"], 0);
        assert_eq!(body["tunnel"]["messagesReceived"], 0);
        assert_eq!(body["tunnel"]["rttMedianMs"], 12);
    }

    #[tokio::test]
    async fn master_status_lists_no_slaves_initially() {
        let Json(body) = status(State(master_state())).await;
        assert_eq!(body["mode"], "master");
        assert_eq!(body["isMaster"], true);
        assert_eq!(body["connectedSlaves"], 0);
    }

    #[tokio::test]
    async fn non_master_admin_endpoints_answer_400() {
        let state = standalone_state();
        let response = list_slaves(State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = get_slave(State(state.clone()), Path("s1".into())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = slave_health(State(state), Path("s1".into())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn master_list_contains_the_synthetic_local_entry() {
        let response = list_slaves(State(master_state())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 16)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], true);
        let clients = body["clients"].as_array().unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0]["id"], "local");
        assert_eq!(clients[0]["isLocal"], true);
    }

    #[tokio::test]
    async fn unknown_slave_is_404_but_health_reports_unhealthy() {
        let state = master_state();
        let response = get_slave(State(state.clone()), Path("ghost".into())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = slave_health(State(state), Path("ghost".into())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 16)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["healthy"], false);
        assert_eq!(body["slaveId"], "ghost");
    }
}
