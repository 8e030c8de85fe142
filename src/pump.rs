//! C5: the bidirectional forwarder between the TUN handle and the tunnel
//! session. Uplink and Downlink are two independent tasks that share no
//! mutable state except the outbound queue (backpressure) and the TUN
//! write capability — they never reference each other directly, breaking
//! the `PacketProcessor ↔ WebSocketTunnel ↔ TunDevice` cycle the source
//! had (spec §9).

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec::TunnelMessage;
use crate::error::ClientError;
use crate::tun::{TunReadHalf, TunWriteHalf};

const DRAIN_BATCH: usize = 32;

#[derive(Debug, Default)]
pub struct PumpStats {
    pub uplink_packets: u64,
    pub uplink_bytes: u64,
    pub downlink_packets: u64,
    pub downlink_bytes: u64,
    pub downlink_dropped_oversize: u64,
}

/// Drains up to [`DRAIN_BATCH`] packets per TUN readiness wakeup, wraps
/// each as `Data{payload, seq, ts_ms}`, and pushes to the outbound
/// queue. If the queue is full the push suspends — this is the
/// backpressure signal back to the TUN reader; packets are never
/// dropped here.
pub async fn uplink(
    mut tun_read: TunReadHalf,
    outbound_tx: mpsc::Sender<TunnelMessage>,
    stats_tx: mpsc::UnboundedSender<PumpEvent>,
    cancel: CancellationToken,
) {
    let mut seq: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let mut drained = 0;
        while drained < DRAIN_BATCH {
            let packet = tokio::select! {
                _ = cancel.cancelled() => return,
                result = tun_read.read() => result,
            };
            let packet = match packet {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!("uplink: tun read failed: {e}");
                    break;
                }
            };
            let len = packet.len();
            seq += 1;
            let msg = TunnelMessage::Data { payload: packet, seq, ts_ms: now_ms() };

            // Backpressure: suspend here (not drop) when the queue is full.
            tokio::select! {
                _ = cancel.cancelled() => return,
                send_result = outbound_tx.send(msg) => {
                    if send_result.is_err() {
                        return;
                    }
                }
            }
            let _ = stats_tx.send(PumpEvent::Uplink { bytes: len as u64 });
            drained += 1;
        }
    }
}

/// Consumes decoded packet payloads and writes each to the TUN handle.
/// Exactly one write per inbound `Data` frame — no batching, reordering,
/// or deduplication. The Supervisor's control loop is the one reading
/// the session's inbound channel and forwarding only `Data` payloads
/// here; Ping/Pong/Error/Welcome/NodeSelect(ed) never reach this task.
pub async fn downlink(
    mut tun_write: TunWriteHalf,
    mut tun_data_rx: mpsc::Receiver<Vec<u8>>,
    stats_tx: mpsc::UnboundedSender<PumpEvent>,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => return,
            payload = tun_data_rx.recv() => payload,
        };
        let Some(payload) = payload else { return };

        let len = payload.len();
        loop {
            match tun_write.write(&payload).await {
                Ok(()) => {
                    let _ = stats_tx.send(PumpEvent::Downlink { bytes: len as u64 });
                    break;
                }
                Err(ClientError::FrameTooLarge(n)) => {
                    tracing::warn!("downlink: dropping oversize packet ({n} bytes)");
                    let _ = stats_tx.send(PumpEvent::DroppedOversize);
                    break;
                }
                Err(ClientError::Transport(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    tokio::task::yield_now().await;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("downlink: tun write failed: {e}");
                    break;
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum PumpEvent {
    Uplink { bytes: u64 },
    Downlink { bytes: u64 },
    DroppedOversize,
}

impl PumpStats {
    pub fn apply(&mut self, event: PumpEvent) {
        match event {
            PumpEvent::Uplink { bytes } => {
                self.uplink_packets += 1;
                self.uplink_bytes += bytes;
            }
            PumpEvent::Downlink { bytes } => {
                self.downlink_packets += 1;
                self.downlink_bytes += bytes;
            }
            PumpEvent::DroppedOversize => {
                self.downlink_dropped_oversize += 1;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_accumulate_across_events() {
        let mut stats = PumpStats::default();
        stats.apply(PumpEvent::Uplink { bytes: 100 });
        stats.apply(PumpEvent::Uplink { bytes: 50 });
        stats.apply(PumpEvent::Downlink { bytes: 80 });
        stats.apply(PumpEvent::DroppedOversize);

        assert_eq!(stats.uplink_packets, 2);
        assert_eq!(stats.uplink_bytes, 150);
        assert_eq!(stats.downlink_packets, 1);
        assert_eq!(stats.downlink_bytes, 80);
        assert_eq!(stats.downlink_dropped_oversize, 1);
    }
}
