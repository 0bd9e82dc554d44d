//! Link seam: what the session owner needs from a discovery + transport
//! stack, independent of how bytes move.
//!
//! A [`LinkBackend`] opens one [`LinkSession`] per session incarnation;
//! `restart()` shuts the session down and opens a fresh one. Everything the
//! session observes is reported as a [`LinkEvent`] on a single channel.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::discovery::InvitationDecision;
use crate::error::NetworkError;
use crate::identity::{PeerDescriptor, PeerId};

/// Something the link session observed.
#[derive(Debug)]
pub enum LinkEvent {
    /// A peer passed the discovery filter.
    PeerFound(PeerDescriptor),
    /// A discovered peer departed or expired.
    PeerLost(PeerId),
    /// A remote device wants to connect. Dropping `reply` rejects.
    Invitation {
        peer: PeerDescriptor,
        reply: oneshot::Sender<InvitationDecision>,
    },
    /// A connection with `peer` is established.
    PeerConnected(PeerDescriptor),
    /// A connection, or a pending invitation, with the peer ended.
    PeerDisconnected(PeerId),
    /// Raw command-channel payload.
    CommandReceived { from: PeerId, bytes: Vec<u8> },
    /// A resource finished arriving and was written to `path`.
    ResourceReceived {
        from: PeerId,
        name: String,
        path: PathBuf,
    },
}

/// Opens link sessions.
#[async_trait]
pub trait LinkBackend: Send + Sync {
    /// Start advertising, browsing and accepting connections as `local`.
    async fn open(
        &self,
        local: PeerDescriptor,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Box<dyn LinkSession>, NetworkError>;
}

/// One live incarnation of discovery + transport.
#[async_trait]
pub trait LinkSession: Send + Sync {
    /// Invite a discovered peer. The outcome arrives later as
    /// `PeerConnected` or `PeerDisconnected`.
    fn invite(&self, peer: &PeerDescriptor) -> Result<(), NetworkError>;

    /// Send one encoded command to the connected peer.
    async fn send_command(&self, bytes: Vec<u8>) -> Result<(), NetworkError>;

    /// Begin streaming a file to the connected peer.
    async fn send_resource(&self, name: &str, path: &Path)
    -> Result<ResourceHandle, NetworkError>;

    /// Drop the connection with `peer` if it is the active one. Returns
    /// whether a connection was closed.
    async fn disconnect(&self, peer: &PeerId) -> bool;

    /// Stop advertising and browsing and close every connection.
    async fn shutdown(&self);
}

// ---------------------------------------------------------------------------
// Resource progress
// ---------------------------------------------------------------------------

/// Sender-side view of one outgoing resource.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResourceStatus {
    /// Fraction of the resource delivered so far, in `[0, 1)`.
    InFlight(f64),
    Completed,
    Cancelled,
}

impl ResourceStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InFlight(_))
    }
}

/// Handle returned when a resource send begins.
///
/// If the reporting side goes away without a terminal status the resource
/// counts as cancelled.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    name: String,
    status: watch::Receiver<ResourceStatus>,
    cancel: CancellationToken,
}

impl ResourceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ResourceStatus {
        *self.status.borrow()
    }

    /// A fresh receiver for status updates.
    pub fn subscribe(&self) -> watch::Receiver<ResourceStatus> {
        self.status.clone()
    }

    /// Ask the transport to abandon the resource.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Transport-side counterpart of a [`ResourceHandle`].
#[derive(Debug)]
pub struct ResourceReporter {
    status: watch::Sender<ResourceStatus>,
    cancel: CancellationToken,
}

impl ResourceReporter {
    /// Record delivery progress. Values are clamped below 1.0; only
    /// [`complete`](Self::complete) finishes a resource.
    pub fn progress(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 0.999);
        self.status.send_if_modified(|status| match status {
            ResourceStatus::InFlight(current) if fraction > *current => {
                *current = fraction;
                true
            }
            _ => false,
        });
    }

    pub fn complete(&self) {
        self.finish(ResourceStatus::Completed);
    }

    pub fn cancelled(&self) {
        self.finish(ResourceStatus::Cancelled);
    }

    /// Token cancelled when the handle holder calls `cancel()`.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn finish(&self, terminal: ResourceStatus) {
        self.status.send_if_modified(|status| {
            if status.is_terminal() {
                return false;
            }
            *status = terminal;
            true
        });
    }
}

/// Create a connected reporter/handle pair for a resource named `name`.
pub fn resource_channel(name: impl Into<String>) -> (ResourceReporter, ResourceHandle) {
    let (tx, rx) = watch::channel(ResourceStatus::InFlight(0.0));
    let cancel = CancellationToken::new();
    (
        ResourceReporter {
            status: tx,
            cancel: cancel.clone(),
        },
        ResourceHandle {
            name: name.into(),
            status: rx,
            cancel,
        },
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
