//! Wire protocol for the master<->slave control connection.
//!
//! Every frame is a single WebSocket text message containing one JSON object
//! with a `type` field. Field names on the wire are camelCase to stay
//! compatible with existing slave deployments.
//!
//! | Direction     | `type`             | Payload                                      |
//! |---------------|--------------------|----------------------------------------------|
//! | slave->master | `auth`             | `slaveId`, `slaveName`, `secret`             |
//! | master->slave | `auth_success`     | `slaveId`                                    |
//! | master->slave | `http_request`     | `requestId`, `method`, `path`, `headers`, `body` |
//! | slave->master | `response`         | `requestId`, `status`, `headers`, `body` or `error` |
//! | master->slave | `ws_tunnel_open`   | `tunnelId`, `channel`, `token`               |
//! | master->slave | `ws_message`       | `tunnelId`, `data`                           |
//! | slave->master | `ws_data`          | `tunnelId`, `data`                           |
//! | master->slave | `ws_tunnel_close`  | `tunnelId`                                   |
//! | slave->master | `ws_tunnel_closed` | `tunnelId`                                   |
//! | slave->master | `ping`             | `timestamp`                                  |
//! | master->slave | `pong`             | `timestamp`                                  |
//! | slave->master | `error`            | `tunnelId?`, `requestId?`, `error`           |
//!
//! `body` and `data` are UTF-8 strings. Binary WebSocket frames are ignored
//! by both ends. A frame that fails to decode never tears down the control
//! connection; callers log and drop it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A protocol frame, tagged by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Frame {
    /// First frame a slave must send on the control connection.
    Auth {
        slave_id: String,
        slave_name: String,
        secret: String,
    },
    /// Master's acknowledgement of a successful handshake.
    AuthSuccess { slave_id: String },
    /// An HTTP request the master wants executed against the slave's local
    /// service. `path` carries the original path plus query string.
    HttpRequest {
        request_id: String,
        method: String,
        path: String,
        headers: HashMap<String, String>,
        body: Option<String>,
    },
    /// Slave's reply to an `http_request`. Carries either the local service's
    /// status/headers/body or an `error` string, never both.
    Response {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Master asks the slave to open a local WebSocket for a new tunnel. The
    /// user's bearer token rides along so the local service can
    /// re-authenticate the session.
    WsTunnelOpen {
        tunnel_id: String,
        channel: Channel,
        token: String,
    },
    /// A frame from the user-side WebSocket, bound for the slave's local one.
    WsMessage { tunnel_id: String, data: String },
    /// A frame from the slave's local WebSocket, bound for the user-side one.
    WsData { tunnel_id: String, data: String },
    /// Master tells the slave the user side of a tunnel is gone.
    WsTunnelClose { tunnel_id: String },
    /// Slave tells the master its local side of a tunnel is gone.
    WsTunnelClosed { tunnel_id: String },
    /// Application-level heartbeat. `timestamp` is milliseconds since epoch
    /// and is echoed back verbatim in `pong` for RTT measurement.
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
    /// Slave-side failure report scoped to a tunnel or request.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tunnel_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: String,
    },
}

/// User-facing WebSocket channel a tunnel is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Ws,
    Shell,
}

impl Channel {
    /// The path this channel maps to on both the gateway and the local service.
    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            Self::Ws => "/ws",
            Self::Shell => "/shell",
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ws => "ws",
            Self::Shell => "shell",
        }
    }
}

/// Why an inbound text message could not be turned into a [`Frame`].
#[derive(Debug)]
pub enum DecodeError {
    /// The message was not valid JSON at all.
    Json(serde_json::Error),
    /// Valid JSON, but not a recognizable frame: unknown or missing `type`,
    /// or fields that don't match the declared type.
    Frame {
        frame_type: String,
        source: serde_json::Error,
    },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(e) => write!(f, "malformed JSON: {e}"),
            Self::Frame { frame_type, source } => {
                write!(f, "bad frame (type {frame_type:?}): {source}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode one text message into a frame.
pub fn decode(text: &str) -> Result<Frame, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(DecodeError::Json)?;
    let frame_type = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("")
        .to_string();
    serde_json::from_value(value).map_err(|source| DecodeError::Frame { frame_type, source })
}

/// Encode a frame as a JSON text message.
#[must_use]
pub fn encode(frame: &Frame) -> String {
    serde_json::to_string(frame).expect("Frame serializes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_auth_uses_camel_case_fields() {
        let frame = decode(r#"{"type":"auth","slaveId":"s1","slaveName":"Rack 1","secret":"k"}"#)
            .unwrap();
        assert_eq!(
            frame,
            Frame::Auth {
                slave_id: "s1".into(),
                slave_name: "Rack 1".into(),
                secret: "k".into(),
            }
        );
    }

    #[test]
    fn encode_http_request_shape() {
        let frame = Frame::HttpRequest {
            request_id: "r1".into(),
            method: "GET".into(),
            path: "/api/projects?x=1".into(),
            headers: HashMap::from([("accept".to_string(), "*/*".to_string())]),
            body: None,
        };
        let value: serde_json::Value = serde_json::from_str(&encode(&frame)).unwrap();
        assert_eq!(value["type"], "http_request");
        assert_eq!(value["requestId"], "r1");
        assert_eq!(value["path"], "/api/projects?x=1");
        assert_eq!(value["headers"]["accept"], "*/*");
        assert_eq!(value["body"], serde_json::Value::Null);
    }

    #[test]
    fn response_error_variant_omits_empty_fields() {
        let frame = Frame::Response {
            request_id: "r1".into(),
            status: None,
            headers: None,
            body: None,
            error: Some("connect refused".into()),
        };
        let value: serde_json::Value = serde_json::from_str(&encode(&frame)).unwrap();
        assert_eq!(value["error"], "connect refused");
        assert!(value.get("status").is_none());
        assert!(value.get("headers").is_none());
    }

    #[test]
    fn unknown_type_is_reported_with_its_name() {
        let err = decode(r#"{"type":"subspace_burst","x":1}"#).unwrap_err();
        match err {
            DecodeError::Frame { frame_type, .. } => assert_eq!(frame_type, "subspace_burst"),
            DecodeError::Json(_) => panic!("expected frame error"),
        }
    }

    #[test]
    fn malformed_json_is_distinguished() {
        assert!(matches!(decode("{nope"), Err(DecodeError::Json(_))));
    }

    #[test]
    fn channel_paths() {
        assert_eq!(Channel::Ws.path(), "/ws");
        assert_eq!(Channel::Shell.path(), "/shell");
        let ch: Channel = serde_json::from_str("\"shell\"").unwrap();
        assert_eq!(ch, Channel::Shell);
    }

    #[test]
    fn ping_roundtrip() {
        let frame = decode(r#"{"type":"ping","timestamp":1700000000000}"#).unwrap();
        assert_eq!(frame, Frame::Ping { timestamp: 1_700_000_000_000 });
    }
}
