//! C6: wires C1–C5, owns startup/shutdown ordering, signal handling, and
//! status exposure.
//!
//! Startup: privilege check → crash-recovery restore → TUN open →
//! snapshot → connect → wait Authenticated → apply tunnel defaults →
//! pump start. Shutdown (reverse order, every barrier runs regardless of
//! earlier failures): pump stop → restore → session close → TUN close.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec::TunnelMessage;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::netconfig::HostNetConfig;
use crate::pump::{self, PumpEvent, PumpStats};
use crate::session::{HeartbeatTracker, SessionClient, SessionEvent, SessionStatus};
use crate::status::{self, StatusSnapshot};
use crate::tun::TunInterface;

const SECOND_SIGNAL_GRACE: Duration = Duration::from_secs(3);

pub struct Supervisor {
    config: Arc<ClientConfig>,
    state_dir: std::path::PathBuf,
}

impl Supervisor {
    pub fn new(config: ClientConfig, state_dir: impl Into<std::path::PathBuf>) -> Self {
        Supervisor { config: Arc::new(config), state_dir: state_dir.into() }
    }

    /// Runs the tunnel until cancellation or a fatal error, enforcing the
    /// startup/shutdown ordering and the double-signal teardown rule.
    ///
    /// The Uplink/Downlink pump tasks are spawned once, against the TUN
    /// handle split at startup, and live for the whole process: they never
    /// reference a `SessionClient` directly (§9's cyclic-ownership note).
    /// They talk to a pair of channels this function owns
    /// (`pump_outbound_rx`/`tun_data_tx`) that survive across reconnects;
    /// only the forwarding between those stable channels and the *current*
    /// session's channels is re-pointed each time `SessionClient::connect`
    /// produces a fresh session, so a heartbeat-triggered reconnect (§4.4,
    /// S3) never has to tear down or re-split the TUN handle.
    pub async fn run(&self) -> Result<()> {
        check_privileges()?;

        let netconfig = HostNetConfig::new(&self.state_dir);
        netconfig.recover_if_needed()?;

        let tun_handle = TunInterface::open(&self.config.tun)?;
        let tun_name = tun_handle.name.clone();
        let (route_snapshot, resolver_snapshot) = netconfig.snapshot()?;

        let cancel = CancellationToken::new();
        let (tun_read, tun_write) = tun_handle.split();

        let (pump_outbound_tx, mut pump_outbound_rx) = mpsc::channel::<TunnelMessage>(1024);
        let (tun_data_tx, tun_data_rx) = mpsc::channel::<Vec<u8>>(1024);
        let (stats_tx, mut stats_rx) = mpsc::unbounded_channel::<PumpEvent>();

        let uplink_handle = tokio::spawn(pump::uplink(
            tun_read,
            pump_outbound_tx,
            stats_tx.clone(),
            cancel.clone(),
        ));
        let downlink_handle =
            tokio::spawn(pump::downlink(tun_write, tun_data_rx, stats_tx, cancel.clone()));

        let started_at = Instant::now();
        let mut stats = PumpStats::default();
        let mut attempt: u32 = 0;
        let mut first_connect = true;
        // Set as soon as `apply_tunnel_defaults` is called, even if it
        // fails partway through — it persists the snapshot before
        // mutating anything, so a partial failure still needs the
        // teardown barrier to attempt a restore.
        let mut host_state_touched = false;
        let mut nodes = Vec::new();
        let shutdown_reason;
        let mut fatal: Option<ClientError> = None;

        'reconnect: loop {
            let (inbound_tx, mut inbound_rx) = mpsc::channel::<TunnelMessage>(1024);
            let connect_result =
                SessionClient::connect(Arc::clone(&self.config), inbound_tx, cancel.clone()).await;

            let (mut session, outbound_tx, auth_event) = match connect_result {
                Ok(parts) => parts,
                Err(e) => {
                    if matches!(e, ClientError::AuthRejected(_)) {
                        tracing::error!("authentication rejected, not touching host state");
                        shutdown_reason = "fatal auth";
                        fatal = Some(e);
                        break 'reconnect;
                    }
                    attempt += 1;
                    if attempt > self.config.reconnect_max_attempts {
                        tracing::error!("reconnection abandoned after {attempt} attempts");
                        shutdown_reason = "fatal disconnect";
                        fatal = Some(ClientError::FatalDisconnect { attempts: attempt });
                        break 'reconnect;
                    }
                    let wait =
                        crate::session::backoff_delay(self.config.reconnect_initial_ms, attempt);
                    tracing::warn!("connect failed ({e}), retrying in {wait:?} (attempt {attempt})");
                    tokio::time::sleep(wait).await;
                    continue 'reconnect;
                }
            };

            if let SessionEvent::Authenticated { nodes: fresh_nodes } = auth_event {
                nodes = fresh_nodes;
            }

            if first_connect {
                host_state_touched = true;
                if let Err(e) = netconfig.apply_tunnel_defaults(
                    &route_snapshot,
                    &resolver_snapshot,
                    &tun_name,
                    &self.config.tun.peer_gateway,
                    &self.config.dns.servers,
                ) {
                    tracing::error!("failed to apply tunnel routing defaults: {e}");
                    session.close().await;
                    shutdown_reason = "route setup failed";
                    fatal = Some(e);
                    break 'reconnect;
                }
                first_connect = false;
            }
            // A successful (re)connect resets the attempt counter, per S3.
            attempt = 0;

            let mut heartbeat = HeartbeatTracker::new(self.config.heartbeat_interval_ms);
            let mut heartbeat_check = tokio::time::interval(Duration::from_millis(
                (self.config.heartbeat_interval_ms / 2).max(100),
            ));

            let session_break_reason = 'session: loop {
                tokio::select! {
                    _ = wait_for_signal() => {
                        tracing::info!("signal received, shutting down gracefully");
                        let forced = tokio::select! {
                            _ = session.close() => false,
                            forced = second_signal_within(SECOND_SIGNAL_GRACE) => forced,
                        };
                        if forced {
                            tracing::warn!("second signal received, forcing immediate teardown");
                            session.force_close();
                        }
                        shutdown_reason = "signal";
                        break 'reconnect;
                    }
                    event = stats_rx.recv() => {
                        match event {
                            Some(ev) => stats.apply(ev),
                            None => {
                                session.close().await;
                                fatal = Some(ClientError::Internal("pump tasks ended unexpectedly".into()));
                                shutdown_reason = "pump closed";
                                break 'reconnect;
                            }
                        }
                    }
                    outbound = pump_outbound_rx.recv() => {
                        match outbound {
                            Some(msg) => {
                                if outbound_tx.send(msg).await.is_err() {
                                    break 'session "outbound channel closed";
                                }
                            }
                            None => {
                                session.close().await;
                                fatal = Some(ClientError::Internal("pump tasks ended unexpectedly".into()));
                                shutdown_reason = "pump closed";
                                break 'reconnect;
                            }
                        }
                    }
                    msg = inbound_rx.recv() => {
                        match msg {
                            Some(TunnelMessage::Data { payload, .. }) => {
                                if tun_data_tx.send(payload).await.is_err() {
                                    session.close().await;
                                    fatal = Some(ClientError::Internal("downlink task ended unexpectedly".into()));
                                    shutdown_reason = "downlink closed";
                                    break 'reconnect;
                                }
                            }
                            Some(TunnelMessage::Pong { .. }) => {
                                heartbeat.record_pong();
                            }
                            Some(TunnelMessage::Error { code, message }) => {
                                tracing::warn!("server error ({code:?}): {message}");
                            }
                            Some(TunnelMessage::Unknown(tag)) => {
                                tracing::debug!("dropping unrecognized frame type: {tag}");
                            }
                            Some(_) => {}
                            None => break 'session "session stream closed",
                        }
                    }
                    _ = heartbeat_check.tick() => {}
                }

                let hb_status = heartbeat.tick();
                status::update(StatusSnapshot {
                    session_status: StatusSnapshot::session_status_label(hb_status).to_string(),
                    uptime_secs: started_at.elapsed().as_secs(),
                    tun_name: tun_name.clone(),
                    uplink_packets: stats.uplink_packets,
                    uplink_bytes: stats.uplink_bytes,
                    downlink_packets: stats.downlink_packets,
                    downlink_bytes: stats.downlink_bytes,
                    downlink_dropped_oversize: stats.downlink_dropped_oversize,
                    nodes: nodes.clone(),
                    reconnect_attempts: attempt,
                })
                .await;

                if hb_status == SessionStatus::Reconnecting {
                    break 'session "heartbeat timeout";
                }
            };

            tracing::warn!("session ended ({session_break_reason}), reconnecting");
            session.close().await;
            attempt += 1;
            if attempt > self.config.reconnect_max_attempts {
                tracing::error!("reconnection abandoned after {attempt} attempts");
                shutdown_reason = "fatal disconnect";
                fatal = Some(ClientError::FatalDisconnect { attempts: attempt });
                break 'reconnect;
            }
            let wait = crate::session::backoff_delay(self.config.reconnect_initial_ms, attempt);
            tracing::warn!("reconnecting in {wait:?} (attempt {attempt})");
            tokio::time::sleep(wait).await;
        }

        tracing::info!("tearing down ({shutdown_reason})");
        cancel.cancel();
        uplink_handle.abort();
        downlink_handle.abort();

        if host_state_touched {
            if let Err(e) = netconfig.restore(&route_snapshot, &resolver_snapshot) {
                tracing::error!("failed to restore host network state: {e}");
                return Err(ClientError::RestoreFailed(e.to_string()));
            }
        }

        // Aborting the pump tasks above drops their `TunReadHalf`/
        // `TunWriteHalf`, closing the underlying fd; `TunInterface::close`
        // exists for callers holding a still-owned `TunHandle` and is a
        // no-op here since this handle was consumed by `split()`.
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Resolves on the first SIGINT/SIGTERM and returns immediately — the
/// caller begins graceful shutdown right away rather than blocking here.
async fn wait_for_signal() {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

/// Races a further signal against `grace`. Returns `true` if a second
/// SIGINT/SIGTERM arrived within the window, `false` on timeout — this is
/// the forced-teardown rule of §4.6, run concurrently with the in-flight
/// graceful `close()` so it can actually cut the flush short.
async fn second_signal_within(grace: Duration) -> bool {
    tokio::select! {
        _ = wait_for_signal() => true,
        _ = tokio::time::sleep(grace) => false,
    }
}

fn check_privileges() -> Result<()> {
    #[cfg(unix)]
    {
        if !nix::unistd::geteuid().is_root() {
            return Err(ClientError::PermissionDenied(
                "tunvpn must run with root privileges to create a TUN device".into(),
            ));
        }
    }
    Ok(())
}
