//! Fallback reverse proxy to the local service.
//!
//! The gateway owns the listen port; the application it fronts runs on
//! `localhost:<local_port>`. Any HTTP request no other route claims is
//! relayed there verbatim, minus hop-by-hop headers in both directions.

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::state::AppState;
use crate::tunnel::manager::{HOP_BY_HOP, TARGET_SLAVE_HEADER};

/// Largest request body relayed to the local service (10 MB).
const MAX_PROXY_BODY: usize = 10 * 1024 * 1024;

/// Fallback handler: relay the request to the local service.
pub async fn proxy(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string());
    let url = format!("http://localhost:{}{}", state.config.server.local_port, path);

    let bytes = match to_bytes(body, MAX_PROXY_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(%path, error = %e, "Failed to read request body");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Failed to read request body"})),
            )
                .into_response();
        }
    };

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in &parts.headers {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower)
            || lower == TARGET_SLAVE_HEADER
            || lower == "host"
            || lower == "content-length"
        {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }

    let outcome = state
        .local_http
        .request(parts.method.clone(), url)
        .headers(headers)
        .body(bytes)
        .send()
        .await;

    let response = match outcome {
        Ok(response) => response,
        Err(e) => {
            warn!(%path, error = %e, "Local service call failed");
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "error": "Local service unavailable",
                    "message": e.to_string(),
                })),
            )
                .into_response();
        }
    };

    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (name, value) in response.headers() {
        let lower = name.as_str();
        if lower == "transfer-encoding" || lower == "connection" || lower == "content-length" {
            continue;
        }
        builder = builder.header(name.clone(), value.clone());
    }
    let body = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(%path, error = %e, "Failed to read local response body");
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "error": "Local service unavailable",
                    "message": e.to_string(),
                })),
            )
                .into_response();
        }
    };
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::routing::{get, post};

    async fn local_service() -> u16 {
        let app = axum::Router::new()
            .route(
                "/api/echo",
                post(|headers: axum::http::HeaderMap, body: String| async move {
                    assert!(headers.get(TARGET_SLAVE_HEADER).is_none());
                    body
                }),
            )
            .route("/api/ping", get(|| async { "pong" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    fn state_for(port: u16) -> AppState {
        let config = Config {
            server: crate::config::ServerConfig {
                local_port: port,
                ..crate::config::ServerConfig::default()
            },
            ..Config::default()
        };
        AppState::new(config)
    }

    #[tokio::test]
    async fn relays_method_body_and_status() {
        let port = local_service().await;
        let request = Request::builder()
            .method("POST")
            .uri("/api/echo")
            .header(TARGET_SLAVE_HEADER, "local")
            .body(Body::from("payload"))
            .unwrap();
        let response = proxy(State(state_for(port)), request).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), 1 << 16).await.unwrap();
        assert_eq!(&bytes[..], b"payload");
    }

    #[tokio::test]
    async fn unreachable_local_service_is_502() {
        // Nothing listens on this port.
        let request = Request::builder()
            .uri("/api/ping")
            .body(Body::empty())
            .unwrap();
        let response = proxy(State(state_for(1)), request).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
