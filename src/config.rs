//! Client configuration: the JSON document at `--config` and its defaults.

use serde::Deserialize;
use std::path::Path;

use crate::error::{ClientError, Result};

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_reconnect_initial_ms() -> u64 {
    5_000
}

fn default_reconnect_max_attempts() -> u32 {
    10
}

fn default_tun_name() -> String {
    "tun0".to_string()
}

fn default_tun_address() -> String {
    "10.0.0.2".to_string()
}

fn default_tun_prefix() -> u8 {
    24
}

fn default_tun_mtu() -> u16 {
    1500
}

fn default_peer_gateway() -> String {
    "10.0.0.1".to_string()
}

fn default_dns_servers() -> Vec<String> {
    vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunSettings {
    #[serde(default = "default_tun_name")]
    pub name: String,
    #[serde(default = "default_tun_address")]
    pub address: String,
    #[serde(default = "default_tun_prefix")]
    pub prefix: u8,
    #[serde(default = "default_tun_mtu")]
    pub mtu: u16,
    #[serde(default = "default_peer_gateway")]
    pub peer_gateway: String,
}

impl Default for TunSettings {
    fn default() -> Self {
        TunSettings {
            name: default_tun_name(),
            address: default_tun_address(),
            prefix: default_tun_prefix(),
            mtu: default_tun_mtu(),
            peer_gateway: default_peer_gateway(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsSettings {
    #[serde(default = "default_dns_servers")]
    pub servers: Vec<String>,
}

impl Default for DnsSettings {
    fn default() -> Self {
        DnsSettings { servers: default_dns_servers() }
    }
}

/// Read-only, constructed once at startup and handed by reference to every
/// component; nothing mutates it afterward.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub server_url: String,
    pub auth_token: String,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
    #[serde(default)]
    pub tun: TunSettings,
    #[serde(default)]
    pub dns: DnsSettings,
}

impl ClientConfig {
    /// `max_frame_bytes` is MTU plus a fixed 256 bytes of framing/base64
    /// overhead, not a configurable field (spec §3).
    pub fn max_frame_bytes(&self) -> usize {
        self.tun.mtu as usize + 256
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_url.is_empty() {
            return Err(ClientError::ConfigInvalid("server_url must not be empty".into()));
        }
        if self.auth_token.is_empty() {
            return Err(ClientError::ConfigInvalid("auth_token must not be empty".into()));
        }
        let url = url::Url::parse(&self.server_url)
            .map_err(|e| ClientError::ConfigInvalid(format!("server_url: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ClientError::ConfigInvalid(format!(
                "server_url must use ws:// or wss://, got {}",
                url.scheme()
            )));
        }
        if self.tun.prefix > 32 {
            return Err(ClientError::ConfigInvalid(format!(
                "tun.prefix {} out of range",
                self.tun.prefix
            )));
        }
        Ok(())
    }
}

/// Loads and validates configuration from a JSON file at `path`.
pub fn load(path: &Path) -> Result<ClientConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ClientError::ConfigInvalid(format!("{}: {e}", path.display())))?;
    let cfg: ClientConfig = serde_json::from_str(&text)
        .map_err(|e| ClientError::ConfigInvalid(format!("{}: {e}", path.display())))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_missing_tun_and_dns() {
        let json = r#"{"server_url":"wss://127.0.0.1:9443","auth_token":"T"}"#;
        let cfg: ClientConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.tun.name, "tun0");
        assert_eq!(cfg.tun.mtu, 1500);
        assert_eq!(cfg.dns.servers, vec!["8.8.8.8", "8.8.4.4"]);
        assert_eq!(cfg.heartbeat_interval_ms, 30_000);
        assert_eq!(cfg.max_frame_bytes(), 1756);
    }

    #[test]
    fn empty_server_url_fails_validation() {
        let cfg = ClientConfig {
            server_url: String::new(),
            auth_token: "T".into(),
            heartbeat_interval_ms: 30_000,
            reconnect_initial_ms: 5_000,
            reconnect_max_attempts: 10,
            tun: TunSettings::default(),
            dns: DnsSettings::default(),
        };
        assert!(cfg.validate().is_err());
    }
}
