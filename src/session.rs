//! C4: the authenticated tunnel stream and its lifecycle state machine.
//!
//! ```text
//!           connect()
//!   Closed ──────────► Connecting
//!     ▲                   │
//!     │ fatal             │ upgraded
//!     │                   ▼
//!     │             Authenticating ──fail──► Closed (FatalAuth)
//!     │                   │ Welcome
//!     │                   ▼
//!     │                 Active ◄───pong──┐
//!     │                   │              │
//!     │ graceful close    │ ping_due     │
//!     ▼                   ▼              │
//!   Closed              Degraded ────────┘
//!                         │
//!                         │ heartbeat timeout / io error
//!                         ▼
//!                     Reconnecting ──► Connecting
//! ```

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::codec::TunnelMessage;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Closed,
    Connecting,
    Authenticating,
    Active,
    Degraded,
    Reconnecting,
}

/// Lifecycle events surfaced to the Supervisor.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Authenticated { nodes: Vec<crate::codec::NodeInfo> },
    Degraded,
    Disconnected { reason: String },
    FatalAuth { reason: String },
    FatalDisconnect { attempts: u32 },
}

const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_QUEUE_CAPACITY: usize = 1024;
const CANCEL_FLUSH_BUDGET: Duration = Duration::from_millis(500);

/// One connect-through-close lifetime. Reconnection produces a new
/// `Session` (and a new pair of channels) rather than mutating this one.
pub struct SessionClient {
    write_half: Arc<Mutex<futures_util::stream::SplitSink<WsStream, WsMessage>>>,
    status: SessionStatus,
    /// A child of the cancel token passed to `connect`: cancelling it
    /// stops this session's outbound/inbound/heartbeat tasks without
    /// touching the caller's (process-lifetime) token, so a superseded
    /// session's tasks don't outlive it across a reconnect.
    session_cancel: CancellationToken,
}

impl SessionClient {
    /// Upgrades to `server_url` carrying the bearer token in both the
    /// primary (`Authorization: Bearer`) and fallback (`X-Auth-Token`)
    /// headers, per §4.4. A 401/403 during the handshake is surfaced as
    /// `AuthRejected` and must never be retried by the caller.
    pub async fn connect(
        config: Arc<ClientConfig>,
        inbound_tx: mpsc::Sender<TunnelMessage>,
        cancel: CancellationToken,
    ) -> Result<(SessionClient, mpsc::Sender<TunnelMessage>, SessionEvent)> {
        let mut request = config.server_url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            http::header::AUTHORIZATION,
            format!("Bearer {}", config.auth_token).parse().map_err(|_| {
                ClientError::ConfigInvalid("auth_token is not a valid header value".into())
            })?,
        );
        headers.insert(
            "X-Auth-Token",
            config.auth_token.parse().map_err(|_| {
                ClientError::ConfigInvalid("auth_token is not a valid header value".into())
            })?,
        );

        let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
        let (write, mut read) = ws.split();

        let welcome = tokio::time::timeout(WELCOME_TIMEOUT, async {
            loop {
                match read.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        match TunnelMessage::decode(&text, config.max_frame_bytes()) {
                            Ok(msg @ TunnelMessage::Welcome { .. }) => return Ok(msg),
                            Ok(_) => continue,
                            Err(e) => return Err(ClientError::Codec(e)),
                        }
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return Err(ClientError::Protocol(
                            "stream closed before welcome".into(),
                        ))
                    }
                }
            }
        })
        .await
        .map_err(|_| ClientError::Protocol("no welcome within 10s".into()))??;

        let nodes = match &welcome {
            TunnelMessage::Welcome { nodes, .. } => nodes.clone(),
            _ => unreachable!(),
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let write_half = Arc::new(Mutex::new(write));
        let session_cancel = cancel.child_token();

        let session = SessionClient {
            write_half: Arc::clone(&write_half),
            status: SessionStatus::Active,
            session_cancel: session_cancel.clone(),
        };

        tokio::spawn(outbound_task(
            Arc::clone(&write_half),
            outbound_rx,
            config.max_frame_bytes(),
            session_cancel.clone(),
        ));
        tokio::spawn(inbound_task(
            read,
            inbound_tx,
            config.max_frame_bytes(),
            session_cancel.clone(),
        ));
        tokio::spawn(heartbeat_task(Arc::clone(&config), outbound_tx.clone(), session_cancel));

        Ok((session, outbound_tx, SessionEvent::Authenticated { nodes }))
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Flushes pending sends within a 500ms budget, sends a close frame,
    /// stops this session's own outbound/inbound/heartbeat tasks, and
    /// marks the session closed. Called once, either from the
    /// Supervisor's shutdown barrier or before reconnecting.
    pub async fn close(&mut self) {
        let _ = tokio::time::timeout(CANCEL_FLUSH_BUDGET, async {
            let mut write = self.write_half.lock().await;
            let _ = write.send(WsMessage::Close(None)).await;
            let _ = write.flush().await;
        })
        .await;
        self.session_cancel.cancel();
        self.status = SessionStatus::Closed;
    }

    /// Immediate teardown, skipping the flush/close-frame budget entirely.
    /// Used when a second SIGINT/SIGTERM arrives within the grace window of
    /// the first (§4.6) — the caller has already decided not to wait on
    /// `close()`'s in-flight flush.
    pub fn force_close(&mut self) {
        self.session_cancel.cancel();
        self.status = SessionStatus::Closed;
    }
}

async fn outbound_task(
    write_half: Arc<Mutex<futures_util::stream::SplitSink<WsStream, WsMessage>>>,
    mut outbound_rx: mpsc::Receiver<TunnelMessage>,
    max_frame_bytes: usize,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            msg = outbound_rx.recv() => {
                let Some(msg) = msg else { return };
                match msg.encode(max_frame_bytes) {
                    Ok(text) => {
                        let mut write = write_half.lock().await;
                        if let Err(e) = write.send(WsMessage::Text(text)).await {
                            tracing::warn!("outbound send failed: {e}");
                            return;
                        }
                    }
                    Err(e) => tracing::warn!("dropping outbound frame: {e}"),
                }
            }
        }
    }
}

async fn inbound_task(
    mut read: futures_util::stream::SplitStream<WsStream>,
    inbound_tx: mpsc::Sender<TunnelMessage>,
    max_frame_bytes: usize,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            frame = read.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match TunnelMessage::decode(&text, max_frame_bytes) {
                            Ok(msg) => {
                                if inbound_tx.send(msg).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => tracing::warn!("dropping unparsable frame: {e}"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        tracing::info!("session stream closed by peer");
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!("session stream error: {e}");
                        return;
                    }
                }
            }
        }
    }
}

/// Emits `Ping` every `heartbeat_interval_ms`. Pong tracking and the
/// Active → Degraded → Reconnecting demotion live in the Supervisor's
/// event loop, which observes inbound `Pong` frames and this task's
/// cadence together — this task only needs to keep producing pings.
async fn heartbeat_task(
    config: Arc<ClientConfig>,
    outbound_tx: mpsc::Sender<TunnelMessage>,
    cancel: CancellationToken,
) {
    let interval = Duration::from_millis(config.heartbeat_interval_ms);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {
                let ts_ms = now_ms();
                if outbound_tx.send(TunnelMessage::Ping { ts_ms }).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `reconnect_initial × 2^min(attempt,5)` with ±20% jitter, capped at 60s.
pub fn backoff_delay(reconnect_initial_ms: u64, attempt: u32) -> Duration {
    let exp = 2u64.saturating_pow(attempt.min(5));
    let base_ms = reconnect_initial_ms.saturating_mul(exp).min(60_000);
    let jitter_frac = rand::thread_rng().gen_range(-0.2..=0.2);
    let jittered_ms = (base_ms as f64 * (1.0 + jitter_frac)).max(0.0) as u64;
    Duration::from_millis(jittered_ms.min(60_000))
}

/// Tracks missed-pong state for the Active/Degraded/Reconnecting
/// transitions described in §4.4. Lives in the Supervisor's control
/// loop, not in `SessionClient`, so reconnection can freely construct a
/// fresh `SessionClient` without losing the attempt counter.
pub struct HeartbeatTracker {
    heartbeat_interval_ms: u128,
    last_pong: Instant,
}

impl HeartbeatTracker {
    pub fn new(heartbeat_interval_ms: u64) -> Self {
        HeartbeatTracker {
            heartbeat_interval_ms: heartbeat_interval_ms.max(1) as u128,
            last_pong: Instant::now(),
        }
    }

    pub fn record_pong(&mut self) {
        self.last_pong = Instant::now();
    }

    /// Derives the number of whole heartbeat intervals elapsed since the
    /// last pong from wall-clock time, rather than counting calls — this
    /// keeps the result independent of how often the caller happens to
    /// poll. Two missed intervals → `Degraded`, three → `Reconnecting`.
    pub fn tick(&mut self) -> SessionStatus {
        let missed = self.last_pong.elapsed().as_millis() / self.heartbeat_interval_ms;
        match missed {
            0 | 1 => SessionStatus::Active,
            2 => SessionStatus::Degraded,
            _ => SessionStatus::Reconnecting,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps_at_60s() {
        for attempt in 0..10 {
            let d = backoff_delay(5_000, attempt);
            assert!(d.as_millis() <= 60_000);
        }
        // attempt 5 and beyond hit the exponent cap (2^5 = 32x base)
        let capped = backoff_delay(5_000, 8);
        assert!(capped.as_millis() <= 60_000);
    }

    #[test]
    fn heartbeat_tracker_escalates_after_three_misses() {
        let mut tracker = HeartbeatTracker::new(0);
        assert_eq!(tracker.tick(), SessionStatus::Active);
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(tracker.tick(), SessionStatus::Active);
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(tracker.tick(), SessionStatus::Degraded);
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(tracker.tick(), SessionStatus::Reconnecting);
    }

    #[test]
    fn heartbeat_tracker_resets_on_pong() {
        let mut tracker = HeartbeatTracker::new(0);
        std::thread::sleep(Duration::from_millis(1));
        tracker.tick();
        tracker.tick();
        tracker.record_pong();
        assert_eq!(tracker.tick(), SessionStatus::Active);
    }
}
