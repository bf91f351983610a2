//! Error taxonomy shared across the tunnel datapath and control plane.
//!
//! Each variant corresponds to one of the error kinds in the design's
//! error-handling section; propagation rules (drop-and-log vs. end-session
//! vs. terminate-process) live with the call sites, not here.

use std::io;

/// Top-level error type for the tunnel datapath and control plane.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Malformed capsule or IP header.
    #[error("decode error: {0}")]
    Decode(String),

    /// QUIC/stream/datagram I/O failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Rejected credentials.
    #[error("authentication failed")]
    Auth,

    /// Bad CIDR, missing certificate, or other misconfiguration.
    #[error("configuration error: {0}")]
    Config(String),

    /// IPAM pool exhausted or no lease available.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// Programming invariant violated (e.g. duplicate forwarding-table key).
    #[error("fatal invariant violation: {0}")]
    Fatal(String),
}

impl From<io::Error> for TunnelError {
    fn from(err: io::Error) -> Self {
        TunnelError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;
