//! CLI surface (collaborator boundary, §6): `start`, `status`,
//! `list-nodes`, `test`, each mapping to one of the five exit codes.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Layer-3 VPN client", long_about = None)]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "tunvpn.json")]
    pub config: PathBuf,

    /// Directory for crash-recovery state (`state/original.snap`, `state/resolv.backup`).
    #[arg(long, default_value = ".")]
    pub state_dir: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect and hold the tunnel open until a signal or fatal error.
    Start {
        /// Also serve a local `/status` and `/health` HTTP endpoint.
        #[arg(long)]
        http_port: Option<u16>,
    },
    /// Print the last known status snapshot from a running instance.
    Status {
        #[arg(long, default_value_t = 8088)]
        http_port: u16,
    },
    /// Connect, print the node roster from `Welcome`, and disconnect.
    ListNodes,
    /// One-shot connect + Welcome wait + ping/pong round trip, reporting latency.
    Test,
}

/// Exit code contract from spec §6: 0 success, 1 generic failure, 2
/// permission denied, 3 authentication failed, 4 unreachable after retry.
pub const EXIT_OK: i32 = 0;
pub const EXIT_GENERIC_FAILURE: i32 = 1;
