//! C2: host routing table and resolver takeover, with crash-recoverable
//! snapshot/restore.
//!
//! The source this was distilled from shells out to `ip`/`route` and
//! rewrites `/etc/resolv.conf` directly (`original_source/server/tun_manager.py`'s
//! `RouteManager`/`DnsManager`); per the platform-abstraction design note
//! (spec §9) that ambient behavior is preserved but isolated behind this
//! module so it can be swapped for an injectable executor in tests.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{ClientError, Result};

const SNAPSHOT_PATH: &str = "state/original.snap";
const RESOLV_BACKUP_PATH: &str = "state/resolv.backup";
const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSnapshot {
    /// `ip route show default` output lines, captured verbatim so restore
    /// can replay them without interpreting route syntax.
    pub default_routes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverSnapshot {
    pub resolv_conf: String,
}

pub struct HostNetConfig {
    state_dir: PathBuf,
}

impl HostNetConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        HostNetConfig { state_dir: state_dir.into() }
    }

    fn snapshot_path(&self) -> PathBuf {
        self.state_dir.join(SNAPSHOT_PATH)
    }

    fn resolv_backup_path(&self) -> PathBuf {
        self.state_dir.join(RESOLV_BACKUP_PATH)
    }

    /// Captures the host's current default routes and resolver file.
    /// Read-only; no host mutation happens here.
    pub fn snapshot(&self) -> Result<(RouteSnapshot, ResolverSnapshot)> {
        let routes = run_capture("ip", &["route", "show", "default"])?;
        let default_routes =
            routes.lines().map(str::to_string).filter(|l| !l.trim().is_empty()).collect();
        let resolv_conf = std::fs::read_to_string(RESOLV_CONF_PATH)
            .map_err(|e| ClientError::Internal(format!("reading {RESOLV_CONF_PATH}: {e}")))?;
        Ok((RouteSnapshot { default_routes }, ResolverSnapshot { resolv_conf }))
    }

    /// (1) persists the snapshot to disk, (2) installs a higher-priority
    /// default route via `tun_name`'s peer gateway, (3) atomically
    /// replaces the resolver file after backing up the original.
    pub fn apply_tunnel_defaults(
        &self,
        route: &RouteSnapshot,
        resolver: &ResolverSnapshot,
        tun_name: &str,
        gateway: &str,
        dns_servers: &[String],
    ) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir)
            .map_err(|e| ClientError::Internal(format!("creating state dir: {e}")))?;
        self.persist_snapshot(route)?;
        std::fs::write(
            self.resolv_backup_path(),
            resolver.resolv_conf.as_bytes(),
        )
        .map_err(|e| ClientError::Internal(format!("backing up resolv.conf: {e}")))?;

        run("ip", &["route", "add", "default", "via", gateway, "dev", tun_name, "metric", "1"])?;

        let mut contents = String::new();
        for server in dns_servers {
            contents.push_str("nameserver ");
            contents.push_str(server);
            contents.push('\n');
        }
        atomic_write(Path::new(RESOLV_CONF_PATH), &contents)?;

        Ok(())
    }

    /// Idempotent: restoring twice (or restoring when nothing was ever
    /// applied) is a no-op after the first successful run, matching the
    /// crash-recovery contract in §4.2.
    pub fn restore(&self, route: &RouteSnapshot, resolver: &ResolverSnapshot) -> Result<()> {
        // Best effort: clear whatever default route is currently installed,
        // then replay the snapshot's routes exactly as captured.
        let _ = run("ip", &["route", "del", "default"]);
        for line in &route.default_routes {
            if let Some(args) = reconstruct_route_add(line) {
                run("ip", &args.iter().map(String::as_str).collect::<Vec<_>>())?;
            }
        }

        atomic_write(Path::new(RESOLV_CONF_PATH), &resolver.resolv_conf)
            .map_err(|e| ClientError::RestoreFailed(e.to_string()))?;

        let _ = std::fs::remove_file(self.snapshot_path());
        let _ = std::fs::remove_file(self.resolv_backup_path());
        Ok(())
    }

    /// Checked at startup, before any other mutation: if a snapshot from
    /// a previous process is still on disk, that process crashed between
    /// `apply` and `restore`. Restore it first.
    pub fn recover_if_needed(&self) -> Result<()> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(());
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ClientError::RestoreFailed(format!("reading {}: {e}", path.display())))?;
        let route: RouteSnapshot = serde_json::from_str(&text)
            .map_err(|e| ClientError::RestoreFailed(format!("parsing {}: {e}", path.display())))?;
        let resolv_text = std::fs::read_to_string(self.resolv_backup_path())
            .unwrap_or_else(|_| String::new());
        let resolver = ResolverSnapshot { resolv_conf: resolv_text };
        tracing::warn!("found leftover network snapshot, restoring before startup");
        self.restore(&route, &resolver)
    }

    fn persist_snapshot(&self, route: &RouteSnapshot) -> Result<()> {
        let text = serde_json::to_string(route)?;
        atomic_write(&self.snapshot_path(), &text)
    }
}

fn reconstruct_route_add(show_line: &str) -> Option<Vec<String>> {
    // `ip route show default` lines look like: "default via 10.0.0.1 dev eth0 ..."
    let mut args = vec!["route".to_string(), "add".to_string()];
    args.extend(show_line.split_whitespace().map(str::to_string));
    Some(args)
}

fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)
        .map_err(|e| ClientError::Internal(format!("writing {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| ClientError::Internal(format!("renaming {}: {e}", tmp.display())))?;
    Ok(())
}

fn run(cmd: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .map_err(|e| ClientError::Internal(format!("executing {cmd}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::warn!("{cmd} {args:?} failed: {stderr}");
    }
    Ok(())
}

fn run_capture(cmd: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .map_err(|e| ClientError::Internal(format!("executing {cmd}: {e}")))?;
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconstructs_add_args_from_show_line() {
        let args = reconstruct_route_add("default via 10.0.0.1 dev eth0").unwrap();
        assert_eq!(args, vec!["route", "add", "default", "via", "10.0.0.1", "dev", "eth0"]);
    }

    #[test]
    fn snapshot_path_lives_under_state_dir() {
        let hc = HostNetConfig::new("/var/lib/tunvpn");
        assert_eq!(hc.snapshot_path(), Path::new("/var/lib/tunvpn/state/original.snap"));
    }
}
