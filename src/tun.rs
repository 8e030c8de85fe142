//! C1: the kernel virtual network interface.
//!
//! `TunInterface::open` atomically creates and configures the device,
//! rolling back on any sub-step failure. The returned [`TunHandle`] is
//! non-blocking and level-triggered: callers drive it from a `tokio`
//! readiness loop, one packet per `read`/`write`, never concatenating or
//! splitting packets (the kernel already preserves boundaries).

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tun::AsyncDevice;

use crate::config::TunSettings;
use crate::error::{ClientError, Result};

pub type Packet = Vec<u8>;

/// Owns the kernel fd for the lifetime of the tunnel. Exclusively held by
/// the Supervisor; split into read/write halves that are lent to the
/// Uplink/Downlink pump tasks.
pub struct TunHandle {
    device: AsyncDevice,
    pub name: String,
    pub mtu: u16,
}

/// Read capability, owned by the Uplink task.
pub struct TunReadHalf {
    half: ReadHalf<AsyncDevice>,
    mtu: u16,
}

/// Write capability, owned by the Downlink task.
pub struct TunWriteHalf {
    half: WriteHalf<AsyncDevice>,
    mtu: u16,
}

pub struct TunInterface;

impl TunInterface {
    /// Creates the interface, assigns `settings.address/prefix`, brings
    /// the link up, and sets the MTU. On any failure, whatever
    /// sub-steps already ran are torn down before returning the error —
    /// the `tun` crate performs this as a single ioctl sequence, so a
    /// failure here never leaves a half-configured interface behind.
    pub fn open(settings: &TunSettings) -> Result<TunHandle> {
        let mut config = tun::Configuration::default();
        config
            .name(&settings.name)
            .address(settings.address.as_str())
            .netmask(prefix_to_netmask(settings.prefix))
            .mtu(settings.mtu)
            .up();

        #[cfg(target_os = "linux")]
        config.platform_config(|platform| {
            platform.ensure_root_privileges(true);
        });

        let device = tun::create_as_async(&config).map_err(|e| classify_open_error(e))?;

        Ok(TunHandle { device, name: settings.name.clone(), mtu: settings.mtu })
    }

    /// Idempotent: a handle that was already dropped has nothing left to
    /// close, so this only matters when called explicitly during
    /// teardown ordering (§4.6) rather than on drop.
    pub fn close(_handle: TunHandle) {}
}

impl TunHandle {
    /// Reads exactly one packet, non-blocking. `WouldBlock` means the
    /// caller should suspend on readiness and retry; any other I/O
    /// error is reported as `Transport`.
    pub async fn read(&mut self) -> Result<Packet> {
        let mut buf = vec![0u8; self.mtu as usize];
        let n = self.device.read(&mut buf).await.map_err(ClientError::Transport)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Writes exactly one packet. Rejects payloads larger than the
    /// configured MTU rather than silently truncating or splitting.
    pub async fn write(&mut self, packet: &[u8]) -> Result<()> {
        if packet.len() > self.mtu as usize {
            return Err(ClientError::FrameTooLarge(packet.len()));
        }
        self.device.write_all(packet).await.map_err(ClientError::Transport)?;
        Ok(())
    }

    /// Splits into independent read/write halves, matching the
    /// ownership split in §5: Uplink holds the read half, Downlink
    /// holds the write half, and neither references the other.
    pub fn split(self) -> (TunReadHalf, TunWriteHalf) {
        let (read, write) = tokio::io::split(self.device);
        (TunReadHalf { half: read, mtu: self.mtu }, TunWriteHalf { half: write, mtu: self.mtu })
    }
}

impl TunReadHalf {
    pub async fn read(&mut self) -> Result<Packet> {
        let mut buf = vec![0u8; self.mtu as usize];
        let n = self.half.read(&mut buf).await.map_err(ClientError::Transport)?;
        buf.truncate(n);
        Ok(buf)
    }
}

impl TunWriteHalf {
    pub async fn write(&mut self, packet: &[u8]) -> Result<()> {
        if packet.len() > self.mtu as usize {
            return Err(ClientError::FrameTooLarge(packet.len()));
        }
        self.half.write_all(packet).await.map_err(ClientError::Transport)?;
        Ok(())
    }
}

fn prefix_to_netmask(prefix: u8) -> std::net::Ipv4Addr {
    let mask: u32 = if prefix == 0 { 0 } else { (!0u32) << (32 - prefix as u32) };
    std::net::Ipv4Addr::from(mask)
}

fn classify_open_error(e: tun::Error) -> ClientError {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("permission") || lower.contains("operation not permitted") {
        ClientError::PermissionDenied(msg)
    } else if lower.contains("already") || lower.contains("in use") || lower.contains("exist") {
        ClientError::InUse(msg)
    } else if lower.contains("no such file") || lower.contains("/dev/net/tun") {
        ClientError::KernelUnavailable(msg)
    } else {
        ClientError::Internal(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netmask_for_slash_24_is_255_255_255_0() {
        assert_eq!(prefix_to_netmask(24).to_string(), "255.255.255.0");
    }

    #[test]
    fn netmask_for_slash_32_is_all_ones() {
        assert_eq!(prefix_to_netmask(32).to_string(), "255.255.255.255");
    }
}
