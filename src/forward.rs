//! Routing middleware: decide local vs. forwarded handling per request.
//!
//! Applied ahead of the local handler chain. A request carrying
//! `X-Target-Slave: <id>` (anything but `local`) is serialized into an
//! `http_request` frame and sent over the target slave's control connection;
//! the reply becomes the user-visible response. Everything else, plus the
//! cluster-internal path prefixes, falls through to the local handlers.

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, warn};

use crate::state::AppState;
use crate::tunnel::manager::{ForwardError, ForwardedResponse, TARGET_SLAVE_HEADER};

/// Paths that are always handled locally, whatever the routing header says.
/// They concern the cluster itself or the caller's identity.
const LOCAL_PREFIXES: &[&str] = &["/api/cluster/", "/api/user/", "/api/auth/"];

/// Largest request body the gateway will buffer for forwarding (10 MB).
const MAX_FORWARD_BODY: usize = 10 * 1024 * 1024;

/// Middleware entry point.
pub async fn route_to_slave(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(slave_id) = target_slave(&request) else {
        return next.run(request).await;
    };
    if is_always_local(request.uri().path()) {
        return next.run(request).await;
    }

    let Some(manager) = state.tunnel.clone() else {
        return slave_unavailable(&slave_id, "Not in master mode");
    };
    if !manager.registry().is_connected(&slave_id).await {
        return slave_unavailable(&slave_id, "No control connection for this slave");
    }

    let (parts, body) = request.into_parts();
    let method = parts.method.as_str().to_string();
    let path = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string());
    let bytes = match to_bytes(body, MAX_FORWARD_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(%slave_id, error = %e, "Failed to read request body");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Failed to read request body"})),
            )
                .into_response();
        }
    };
    let body = if bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&bytes).into_owned())
    };

    debug!(%slave_id, %method, %path, "Forwarding request");
    match manager
        .forward_http_request(&slave_id, &method, &path, &parts.headers, body)
        .await
    {
        Ok(forwarded) => forwarded_response(&forwarded),
        Err(ForwardError::NotConnected) => {
            slave_unavailable(&slave_id, "No control connection for this slave")
        }
        Err(e) => {
            warn!(%slave_id, %method, %path, error = %e, "Forwarding failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "error": "Tunnel error",
                    "slaveId": slave_id,
                    "message": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}

/// The slave id from `X-Target-Slave`, unless it selects local handling.
fn target_slave(request: &Request) -> Option<String> {
    let value = request
        .headers()
        .get(TARGET_SLAVE_HEADER)?
        .to_str()
        .ok()?
        .trim();
    if value.is_empty() || value == "local" {
        None
    } else {
        Some(value.to_string())
    }
}

fn is_always_local(path: &str) -> bool {
    LOCAL_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

fn slave_unavailable(slave_id: &str, message: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "error": "Slave not connected",
            "slaveId": slave_id,
            "message": message,
        })),
    )
        .into_response()
}

/// Re-emit a forwarded response to the user. Headers arrive already cleared
/// of `transfer-encoding` and `connection`; content-length is recomputed for
/// the re-emitted body. A JSON body without a declared content type is
/// served as JSON.
fn forwarded_response(forwarded: &ForwardedResponse) -> Response {
    let status = StatusCode::from_u16(forwarded.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = forwarded.body.clone().unwrap_or_default();

    let mut builder = Response::builder().status(status);
    let mut has_content_type = false;
    for (name, value) in &forwarded.headers {
        let lower = name.to_ascii_lowercase();
        if lower == "content-length" {
            continue;
        }
        if lower == "content-type" {
            has_content_type = true;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }
    if !has_content_type
        && !body.is_empty()
        && serde_json::from_str::<serde_json::Value>(&body).is_ok()
    {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn request_with_header(value: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("/api/projects");
        if let Some(value) = value {
            builder = builder.header(TARGET_SLAVE_HEADER, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn absent_or_local_header_stays_local() {
        assert_eq!(target_slave(&request_with_header(None)), None);
        assert_eq!(target_slave(&request_with_header(Some("local"))), None);
        assert_eq!(target_slave(&request_with_header(Some(""))), None);
        assert_eq!(
            target_slave(&request_with_header(Some("s1"))),
            Some("s1".to_string())
        );
    }

    #[test]
    fn cluster_paths_are_always_local() {
        assert!(is_always_local("/api/cluster/status"));
        assert!(is_always_local("/api/user/me"));
        assert!(is_always_local("/api/auth/refresh"));
        assert!(!is_always_local("/api/projects"));
        assert!(!is_always_local("/ws"));
    }

    #[test]
    fn json_body_without_content_type_is_served_as_json() {
        let forwarded = ForwardedResponse {
            status: 200,
            headers: HashMap::new(),
            body: Some(r#"{"ok":true}"#.to_string()),
        };
        let response = forwarded_response(&forwarded);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some("application/json")
        );
    }

    #[test]
    fn declared_content_type_is_preserved() {
        let forwarded = ForwardedResponse {
            status: 404,
            headers: HashMap::from([
                ("content-type".to_string(), "text/html".to_string()),
                ("content-length".to_string(), "999".to_string()),
            ]),
            body: Some("<h1>nope</h1>".to_string()),
        };
        let response = forwarded_response(&forwarded);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some("text/html")
        );
        // The stale content-length is not copied through.
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
    }
}
