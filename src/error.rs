//! Crate-wide error taxonomy.
//!
//! The variants mirror the error-kind table of the tunnel session design:
//! each kind carries its own recovery policy (fatal at startup, reconnect
//! with backoff, drop-and-log, ...), enforced by the callers in
//! [`crate::supervisor`] and [`crate::session`] rather than by this type.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Creating or configuring the TUN device, or editing host network
    /// state, was refused by the OS. Fatal at startup; no host state is
    /// touched before this can occur.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The requested interface name is already attached to a device.
    #[error("interface already in use: {0}")]
    InUse(String),

    /// `/dev/net/tun` (or platform equivalent) is not available.
    #[error("kernel TUN support unavailable: {0}")]
    KernelUnavailable(String),

    /// The configuration file failed validation before anything started.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The stream upgrade was rejected by the server (401/403 or a 4xx
    /// during the WebSocket handshake). Never retried automatically.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// A frame violated protocol expectations (bad JSON, missing Welcome
    /// in time, too many oversize frames, ...). Closes the session and
    /// counts toward the reconnect attempt budget.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport-level I/O or TLS failure. Reconnect with backoff.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// `reconnect_max_attempts` was exhausted without a successful
    /// reconnect.
    #[error("reconnection abandoned after {attempts} attempts")]
    FatalDisconnect { attempts: u32 },

    /// A decoded frame exceeded `max_frame_bytes`.
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Host route/resolver restore failed; the operator must intervene.
    #[error("failed to restore host network state: {0}")]
    RestoreFailed(String),

    /// Wraps lower-level codec failures.
    #[error("frame codec error: {0}")]
    Codec(#[from] crate::codec::errors::FrameError),

    /// Catch-all for conditions that don't have a dedicated policy above
    /// (JSON (de)serialization, WebSocket library errors, etc).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Internal(format!("json: {e}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            // §4.4: any 4xx during the upgrade handshake (not just 401/403)
            // is fatal for the session and must never be retried.
            WsError::Http(resp) if resp.status().is_client_error() => {
                ClientError::AuthRejected(format!("upgrade rejected with {}", resp.status()))
            }
            other => ClientError::Transport(std::io::Error::other(other.to_string())),
        }
    }
}

impl ClientError {
    /// Exit code contract for the CLI surface (§6): 0 success, 1 generic
    /// failure, 2 permission denied, 3 authentication failed, 4
    /// unreachable after retry.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::PermissionDenied(_) => 2,
            ClientError::AuthRejected(_) => 3,
            ClientError::FatalDisconnect { .. } => 4,
            _ => 1,
        }
    }
}
