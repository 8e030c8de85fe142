//! In-process status snapshot and its HTTP exposure.
//!
//! The original monitoring loop (`original_source/client/cli/client.py`'s
//! `start_monitoring`) logs a status table to the terminal every 30s.
//! That rendering is out of scope here (§1); this module keeps the
//! snapshot the rendering would have read from, shared the same way the
//! teacher's `client/http/cache.rs` shares its `StatusResponse` — a
//! `once_cell` global behind a `tokio::sync::RwLock` — and serves it over
//! a small axum endpoint for `status`/`list-nodes` to read.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::{routing::get, Router};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::codec::NodeInfo;
use crate::session::SessionStatus;

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub session_status: String,
    pub uptime_secs: u64,
    pub tun_name: String,
    pub uplink_packets: u64,
    pub uplink_bytes: u64,
    pub downlink_packets: u64,
    pub downlink_bytes: u64,
    pub downlink_dropped_oversize: u64,
    pub nodes: Vec<NodeInfo>,
    pub reconnect_attempts: u32,
}

impl StatusSnapshot {
    pub fn session_status_label(status: SessionStatus) -> &'static str {
        match status {
            SessionStatus::Closed => "closed",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Authenticating => "authenticating",
            SessionStatus::Active => "active",
            SessionStatus::Degraded => "degraded",
            SessionStatus::Reconnecting => "reconnecting",
        }
    }
}

static STATUS_CACHE: Lazy<Arc<RwLock<Option<StatusSnapshot>>>> =
    Lazy::new(|| Arc::new(RwLock::new(None)));

pub fn cache() -> Arc<RwLock<Option<StatusSnapshot>>> {
    STATUS_CACHE.clone()
}

pub async fn update(snapshot: StatusSnapshot) {
    let mut cache = STATUS_CACHE.write().await;
    *cache = Some(snapshot);
}

pub async fn current() -> Option<StatusSnapshot> {
    STATUS_CACHE.read().await.clone()
}

#[derive(Clone)]
struct AppState {
    cache: Arc<RwLock<Option<StatusSnapshot>>>,
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": "tunvpn-client" }))
}

async fn status_handler(
    State(state): State<AppState>,
) -> Result<Json<StatusSnapshot>, StatusCode> {
    match state.cache.read().await.clone() {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

/// Serves `/status` and `/health` on localhost. Not started unless the
/// Supervisor is given a port (the CLI's `start` leaves it optional — see
/// `cli.rs`); this is an ambient convenience, not part of the tunnel core.
pub async fn serve(port: u16) -> std::io::Result<()> {
    let state = AppState { cache: cache() };
    let app = Router::new()
        .route("/status", get(status_handler))
        .route("/health", get(health))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{port}")).await?;
    tracing::info!("status endpoint listening on http://127.0.0.1:{port}/status");
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_round_trips_snapshot() {
        let snapshot = StatusSnapshot {
            session_status: "active".into(),
            uptime_secs: 42,
            tun_name: "tun0".into(),
            uplink_packets: 1,
            uplink_bytes: 84,
            downlink_packets: 1,
            downlink_bytes: 84,
            downlink_dropped_oversize: 0,
            nodes: vec![],
            reconnect_attempts: 0,
        };
        update(snapshot.clone()).await;
        let got = current().await.unwrap();
        assert_eq!(got.uptime_secs, 42);
        assert_eq!(got.session_status, "active");
    }
}
