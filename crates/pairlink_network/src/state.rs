//! Connection lifecycle: the single authoritative connection state.
//!
//! [`ConnectionStateMachine`] is plain data with synchronous transition
//! methods. It performs no I/O; the node task owns the only instance and
//! applies transitions one at a time, publishing each resulting
//! [`ConnectionSnapshot`].

use serde::{Deserialize, Serialize};

use crate::identity::{PeerDescriptor, PeerId};

/// Lifecycle state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No session; nothing advertised.
    Idle,
    /// Advertising and browsing, no peer engaged.
    Browsing,
    /// An invitation is outstanding with the target peer.
    Connecting,
    /// Exactly one active peer.
    Connected,
    /// Session setup failed; `restart()` recovers.
    Failed,
}

/// Consistent view of the state and the active peer.
///
/// `active_peer` is `Some` exactly when `state` is `Connected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub active_peer: Option<PeerDescriptor>,
}

impl ConnectionSnapshot {
    pub fn idle() -> Self {
        Self {
            state: ConnectionState::Idle,
            active_peer: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// A transition that was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// Set when an established connection was lost (`Connected -> Browsing`).
    pub dropped: Option<PeerDescriptor>,
}

/// The connection state machine.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    active_peer: Option<PeerDescriptor>,
    target: Option<PeerDescriptor>,
    last_known: Option<String>,
}

impl ConnectionStateMachine {
    /// Start in `Idle`, optionally remembering the last connected peer name.
    pub fn new(last_known: Option<String>) -> Self {
        Self {
            state: ConnectionState::Idle,
            active_peer: None,
            target: None,
            last_known,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn active_peer(&self) -> Option<&PeerDescriptor> {
        self.active_peer.as_ref()
    }

    /// The peer an outstanding connect is aimed at.
    pub fn target(&self) -> Option<&PeerDescriptor> {
        self.target.as_ref()
    }

    /// Display name of the most recently connected peer.
    pub fn last_known(&self) -> Option<&str> {
        self.last_known.as_deref()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state,
            active_peer: self.active_peer.clone(),
        }
    }

    /// `Idle -> Browsing`.
    pub fn start(&mut self) -> Option<StateChange> {
        match self.state {
            ConnectionState::Idle => Some(self.enter(ConnectionState::Browsing, None)),
            _ => None,
        }
    }

    /// `Browsing -> Connecting`. Ignored in every other state, which makes a
    /// repeated connect while `Connecting` or `Connected` a no-op.
    pub fn connect(&mut self, peer: PeerDescriptor) -> Option<StateChange> {
        match self.state {
            ConnectionState::Browsing => {
                self.target = Some(peer);
                Some(self.enter(ConnectionState::Connecting, None))
            }
            _ => None,
        }
    }

    /// `Connecting -> Connected` when `peer` is the connect target.
    pub fn peer_connected(&mut self, peer: &PeerDescriptor) -> Option<StateChange> {
        if self.state != ConnectionState::Connecting || self.target.as_ref() != Some(peer) {
            return None;
        }
        self.target = None;
        self.active_peer = Some(peer.clone());
        self.last_known = Some(peer.display_name.clone());
        Some(self.enter(ConnectionState::Connected, None))
    }

    /// `Connecting -> Browsing` for the target, or `Connected -> Browsing`
    /// for the active peer. Events about any other peer are ignored.
    pub fn peer_disconnected(&mut self, peer_id: &PeerId) -> Option<StateChange> {
        match self.state {
            ConnectionState::Connecting
                if self.target.as_ref().is_some_and(|t| &t.id == peer_id) =>
            {
                self.target = None;
                Some(self.enter(ConnectionState::Browsing, None))
            }
            ConnectionState::Connected
                if self.active_peer.as_ref().is_some_and(|p| &p.id == peer_id) =>
            {
                let lost = self.active_peer.take();
                Some(self.enter(ConnectionState::Browsing, lost))
            }
            _ => None,
        }
    }

    /// Any state `-> Idle`, clearing the active peer and target.
    pub fn reset(&mut self) -> Option<StateChange> {
        if self.state == ConnectionState::Idle {
            return None;
        }
        self.target = None;
        self.active_peer = None;
        Some(self.enter(ConnectionState::Idle, None))
    }

    /// Any state `-> Failed`.
    pub fn fail(&mut self) -> Option<StateChange> {
        if self.state == ConnectionState::Failed {
            return None;
        }
        self.target = None;
        self.active_peer = None;
        Some(self.enter(ConnectionState::Failed, None))
    }

    fn enter(&mut self, to: ConnectionState, dropped: Option<PeerDescriptor>) -> StateChange {
        let from = self.state;
        self.state = to;
        debug_assert_eq!(to == ConnectionState::Connected, self.active_peer.is_some());
        StateChange { from, to, dropped }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
