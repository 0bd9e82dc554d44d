//! Network error types.

use std::time::Duration;

/// Errors that can occur in the pairlink_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A transport-level error (WebSocket connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The requested peer is not in the discovered set or has no known address.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Advertise or browse could not be started.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// The remote peer declined our invitation.
    #[error("Invitation rejected by {peer}: {reason}")]
    InvitationRejected { peer: String, reason: String },

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// There is no connected peer to talk to.
    #[error("No connected peer")]
    NotConnected,

    /// The node task has stopped or the link session is not open.
    #[error("Node not running")]
    NotRunning,

    /// A command could not be encoded for the wire.
    #[error(transparent)]
    Encode(#[from] crate::command::EncodeError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
