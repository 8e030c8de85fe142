//! Tunnel message definitions and JSON (de)serialization.
//!
//! Wire frames are UTF-8 JSON objects, one per WebSocket text message,
//! tagged by a `"type"` discriminator:
//!
//! ```text
//! { "type":"welcome",      "client_id":str, "server_info":{...} }
//! { "type":"tunnel_data",  "payload":<base64>, "timestamp":float, "size":int }
//! { "type":"ping",         "timestamp":float, "stats":{...} }
//! { "type":"pong",         "timestamp":float, "client_timestamp":float }
//! { "type":"error",        "message":str, "code":str? }
//! { "type":"node_select",  "node_id":str }
//! { "type":"node_selected","node_id":str, "info":{...} }
//! ```
//!
//! Every frame has a `type` discriminator; unknown discriminators decode
//! to [`TunnelMessage::Unknown`] and are never fatal — the caller logs and
//! drops them.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::errors::FrameError;

/// One decoded tunnel message, direction-agnostic.
///
/// `NodeSelect`/`NodeSelected` are reserved control messages; the core
/// data plane only round-trips them for the Supervisor (multi-node
/// selection is out of scope — see spec Non-goals).
#[derive(Debug, Clone)]
pub enum TunnelMessage {
    /// First frame after authentication, server → client.
    Welcome {
        client_id: String,
        server_version: String,
        nodes: Vec<NodeInfo>,
    },
    /// Carries one IP packet, either direction.
    Data { payload: Vec<u8>, seq: u64, ts_ms: u64 },
    /// Liveness probe, client → server in this core (§4.4).
    Ping { ts_ms: u64 },
    /// Liveness reply, server → client. `echo_ts_ms` is the timestamp
    /// from the `Ping` being answered; `responder_ts_ms` is the
    /// responder's own clock, preserved under the wire name
    /// `client_timestamp` for compatibility with the original
    /// bidirectional-ping protocol this was distilled from.
    Pong { echo_ts_ms: u64, responder_ts_ms: u64 },
    /// Non-fatal unless `code` is in the fatal set (auth, protocol) —
    /// the caller, not this type, decides fatality.
    Error { code: Option<String>, message: String },
    /// Reserved control, consumed only by the Supervisor.
    NodeSelect { node_id: String },
    NodeSelected { node_id: String, info: Value },
    /// An unrecognized `type` tag. Carries the raw tag for logging.
    Unknown(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub host: String,
}

/// Untyped wire shape shared by all frames; fields absent for a given
/// `type` are simply ignored on encode and missing on decode.
#[derive(Debug, Serialize, Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_timestamp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    info: Option<Value>,
}

fn ms_to_secs(ts_ms: u64) -> f64 {
    ts_ms as f64 / 1000.0
}

fn secs_to_ms(secs: f64) -> u64 {
    (secs * 1000.0).round() as u64
}

impl TunnelMessage {
    /// Encodes this message as one JSON text frame, enforcing
    /// `max_frame_bytes` so an oversize `Data` payload is caught before
    /// it ever reaches the wire.
    pub fn encode(&self, max_frame_bytes: usize) -> Result<String, FrameError> {
        let wire = match self {
            TunnelMessage::Welcome { client_id, server_version, nodes } => WireFrame {
                kind: "welcome".into(),
                client_id: Some(client_id.clone()),
                server_info: Some(serde_json::json!({
                    "server_version": server_version,
                    "nodes": nodes,
                })),
                ..WireFrame::empty()
            },
            TunnelMessage::Data { payload, ts_ms, .. } => WireFrame {
                kind: "tunnel_data".into(),
                payload: Some(base64::engine::general_purpose::STANDARD.encode(payload)),
                timestamp: Some(ms_to_secs(*ts_ms)),
                size: Some(payload.len()),
                ..WireFrame::empty()
            },
            TunnelMessage::Ping { ts_ms } => WireFrame {
                kind: "ping".into(),
                timestamp: Some(ms_to_secs(*ts_ms)),
                ..WireFrame::empty()
            },
            TunnelMessage::Pong { echo_ts_ms, responder_ts_ms } => WireFrame {
                kind: "pong".into(),
                timestamp: Some(ms_to_secs(*echo_ts_ms)),
                client_timestamp: Some(ms_to_secs(*responder_ts_ms)),
                ..WireFrame::empty()
            },
            TunnelMessage::Error { code, message } => WireFrame {
                kind: "error".into(),
                message: Some(message.clone()),
                code: code.clone(),
                ..WireFrame::empty()
            },
            TunnelMessage::NodeSelect { node_id } => WireFrame {
                kind: "node_select".into(),
                node_id: Some(node_id.clone()),
                ..WireFrame::empty()
            },
            TunnelMessage::NodeSelected { node_id, info } => WireFrame {
                kind: "node_selected".into(),
                node_id: Some(node_id.clone()),
                info: Some(info.clone()),
                ..WireFrame::empty()
            },
            TunnelMessage::Unknown(tag) => WireFrame { kind: tag.clone(), ..WireFrame::empty() },
        };

        let text = serde_json::to_string(&wire)
            .map_err(|e| FrameError::Invalid(format!("encode: {e}")))?;
        if text.len() > max_frame_bytes {
            return Err(FrameError::TooLarge(text.len()));
        }
        Ok(text)
    }

    /// Decodes one JSON text frame. Oversize frames are rejected before
    /// JSON parsing; unknown `type` tags decode successfully to
    /// [`TunnelMessage::Unknown`] rather than erroring.
    pub fn decode(text: &str, max_frame_bytes: usize) -> Result<TunnelMessage, FrameError> {
        if text.len() > max_frame_bytes {
            return Err(FrameError::TooLarge(text.len()));
        }

        let wire: WireFrame =
            serde_json::from_str(text).map_err(|e| FrameError::Invalid(e.to_string()))?;

        let msg = match wire.kind.as_str() {
            "welcome" => {
                let client_id = wire
                    .client_id
                    .ok_or_else(|| FrameError::Invalid("welcome missing client_id".into()))?;
                let info = wire.server_info.unwrap_or(Value::Null);
                let server_version = info
                    .get("server_version")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let nodes = info
                    .get("nodes")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| FrameError::Invalid(format!("welcome nodes: {e}")))?
                    .unwrap_or_default();
                TunnelMessage::Welcome { client_id, server_version, nodes }
            }
            "tunnel_data" => {
                let payload_b64 = wire
                    .payload
                    .ok_or_else(|| FrameError::Invalid("tunnel_data missing payload".into()))?;
                let payload = base64::engine::general_purpose::STANDARD
                    .decode(payload_b64)
                    .map_err(|e| FrameError::BadPayload(e.to_string()))?;
                let ts_ms = wire.timestamp.map(secs_to_ms).unwrap_or(0);
                TunnelMessage::Data { payload, seq: 0, ts_ms }
            }
            "ping" => {
                let ts_ms = wire.timestamp.map(secs_to_ms).unwrap_or(0);
                TunnelMessage::Ping { ts_ms }
            }
            "pong" => {
                let echo_ts_ms = wire.timestamp.map(secs_to_ms).unwrap_or(0);
                let responder_ts_ms = wire.client_timestamp.map(secs_to_ms).unwrap_or(0);
                TunnelMessage::Pong { echo_ts_ms, responder_ts_ms }
            }
            "error" => TunnelMessage::Error {
                code: wire.code,
                message: wire.message.unwrap_or_else(|| "(no message)".into()),
            },
            "node_select" => TunnelMessage::NodeSelect {
                node_id: wire.node_id.unwrap_or_default(),
            },
            "node_selected" => TunnelMessage::NodeSelected {
                node_id: wire.node_id.unwrap_or_default(),
                info: wire.info.unwrap_or(Value::Null),
            },
            other => TunnelMessage::Unknown(other.to_string()),
        };

        Ok(msg)
    }
}

impl WireFrame {
    fn empty() -> Self {
        WireFrame {
            kind: String::new(),
            client_id: None,
            server_info: None,
            payload: None,
            timestamp: None,
            size: None,
            stats: None,
            client_timestamp: None,
            message: None,
            code: None,
            node_id: None,
            info: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_round_trips_byte_identical_payload() {
        let payload = vec![0x45u8, 0x00, 0x00, 0x54, 0xAB, 0xCD, 0xFF, 0x00];
        let msg = TunnelMessage::Data { payload: payload.clone(), seq: 7, ts_ms: 123_456 };
        let text = msg.encode(4096).unwrap();
        match TunnelMessage::decode(&text, 4096).unwrap() {
            TunnelMessage::Data { payload: got, .. } => assert_eq!(got, payload),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn oversize_frame_is_rejected_on_encode_and_decode() {
        let msg = TunnelMessage::Data { payload: vec![0u8; 100], seq: 0, ts_ms: 0 };
        let err = msg.encode(16).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));

        let text = msg.encode(4096).unwrap();
        let err = TunnelMessage::decode(&text, 16).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }

    #[test]
    fn unknown_type_tag_is_non_fatal() {
        let text = r#"{"type":"something_new","foo":1}"#;
        let msg = TunnelMessage::decode(text, 4096).unwrap();
        assert!(matches!(msg, TunnelMessage::Unknown(tag) if tag == "something_new"));
    }

    #[test]
    fn welcome_round_trips_nodes() {
        let msg = TunnelMessage::Welcome {
            client_id: "c1".into(),
            server_version: "1.2.3".into(),
            nodes: vec![NodeInfo { id: "n1".into(), name: "fr-1".into(), host: "1.2.3.4".into() }],
        };
        let text = msg.encode(4096).unwrap();
        match TunnelMessage::decode(&text, 4096).unwrap() {
            TunnelMessage::Welcome { client_id, server_version, nodes } => {
                assert_eq!(client_id, "c1");
                assert_eq!(server_version, "1.2.3");
                assert_eq!(nodes.len(), 1);
                assert_eq!(nodes[0].id, "n1");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn ping_pong_echo_timestamps_survive_round_trip() {
        let msg = TunnelMessage::Pong { echo_ts_ms: 1_000, responder_ts_ms: 1_050 };
        let text = msg.encode(4096).unwrap();
        match TunnelMessage::decode(&text, 4096).unwrap() {
            TunnelMessage::Pong { echo_ts_ms, responder_ts_ms } => {
                assert_eq!(echo_ts_ms, 1_000);
                assert_eq!(responder_ts_ms, 1_050);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn error_without_code_decodes() {
        let text = r#"{"type":"error","message":"boom"}"#;
        let msg = TunnelMessage::decode(text, 4096).unwrap();
        match msg {
            TunnelMessage::Error { code, message } => {
                assert_eq!(code, None);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
