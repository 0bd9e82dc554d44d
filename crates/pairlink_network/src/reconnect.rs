//! Reconnect supervisor: bounded, cancellable retries toward the last peer.
//!
//! The supervisor only sees the session owner through [`ReconnectLink`]. It
//! suspends at two points, the observation window after a connect and the
//! delay between attempts, and both race the cancellation token. The token
//! is also checked at every iteration boundary.
//!
//! [`SupervisorSlot`] is the owner's bookkeeping: one active loop at a time,
//! identified by a generation number. Connect requests tagged with a stale
//! generation are dropped by the owner.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::ReconnectPolicy;
use crate::identity::PeerDescriptor;
use crate::state::ConnectionSnapshot;

/// What the supervisor needs from the session owner.
#[async_trait]
pub trait ReconnectLink: Send + Sync {
    /// A currently discovered peer with this display name.
    async fn find_peer(&self, display_name: &str) -> Option<PeerDescriptor>;

    /// Ask for a connect on behalf of supervisor `generation`.
    async fn supervised_connect(&self, peer: PeerDescriptor, generation: u64);

    /// Connection snapshots.
    fn watch_state(&self) -> watch::Receiver<ConnectionSnapshot>;
}

#[async_trait]
impl<T: ReconnectLink + ?Sized> ReconnectLink for Arc<T> {
    async fn find_peer(&self, display_name: &str) -> Option<PeerDescriptor> {
        (**self).find_peer(display_name).await
    }

    async fn supervised_connect(&self, peer: PeerDescriptor, generation: u64) {
        (**self).supervised_connect(peer, generation).await
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionSnapshot> {
        (**self).watch_state()
    }
}

/// How a supervisor run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// The link reached `Connected` after `attempts` connects were tried.
    Reconnected { attempts: u32 },
    /// The token was cancelled.
    Cancelled,
    /// Every attempt was used.
    GaveUp { attempts: u32 },
    /// Disabled by policy, or already connected.
    Skipped,
}

pub struct ReconnectSupervisor<L> {
    link: L,
    policy: ReconnectPolicy,
}

impl<L: ReconnectLink> ReconnectSupervisor<L> {
    pub fn new(link: L, policy: ReconnectPolicy) -> Self {
        Self { link, policy }
    }

    /// Try to restore a connection to the peer named `target`.
    pub async fn run(
        &self,
        target: &str,
        generation: u64,
        cancel: &CancellationToken,
    ) -> ReconnectOutcome {
        let mut state = self.link.watch_state();
        if !self.policy.enabled || state.borrow().is_connected() {
            return ReconnectOutcome::Skipped;
        }

        let max = self.policy.max_attempts;
        info!("Reconnecting to '{target}' (up to {max} attempts)");

        for attempt in 1..=max {
            if cancel.is_cancelled() {
                return ReconnectOutcome::Cancelled;
            }

            let found = tokio::select! {
                peer = self.link.find_peer(target) => peer,
                _ = cancel.cancelled() => return ReconnectOutcome::Cancelled,
            };

            match found {
                Some(peer) => {
                    debug!("Reconnect attempt {attempt}/{max} to {peer}");
                    self.link.supervised_connect(peer, generation).await;

                    let window = self.policy.observation_window;
                    let connected = tokio::select! {
                        result = tokio::time::timeout(window, wait_connected(&mut state)) => {
                            result.unwrap_or(false)
                        }
                        _ = cancel.cancelled() => return ReconnectOutcome::Cancelled,
                    };
                    if connected {
                        info!("Reconnected to '{target}' on attempt {attempt}");
                        return ReconnectOutcome::Reconnected { attempts: attempt };
                    }
                }
                None => trace!("'{target}' not discovered on attempt {attempt}/{max}"),
            }

            if cancel.is_cancelled() {
                return ReconnectOutcome::Cancelled;
            }
            if attempt < max {
                tokio::select! {
                    _ = tokio::time::sleep(self.policy.retry_delay) => {}
                    _ = cancel.cancelled() => return ReconnectOutcome::Cancelled,
                }
            }
        }

        info!("Gave up reconnecting to '{target}' after {max} attempts");
        ReconnectOutcome::GaveUp { attempts: max }
    }
}

async fn wait_connected(state: &mut watch::Receiver<ConnectionSnapshot>) -> bool {
    state.wait_for(|s| s.is_connected()).await.is_ok()
}

// ---------------------------------------------------------------------------
// Supervisor slot
// ---------------------------------------------------------------------------

/// Tracks the single supervisor loop allowed to act.
#[derive(Debug, Default)]
pub struct SupervisorSlot {
    generation: u64,
    current: Option<(u64, CancellationToken)>,
}

impl SupervisorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any running loop and hand out the next generation.
    pub fn begin(&mut self) -> (u64, CancellationToken) {
        self.cancel();
        self.generation += 1;
        let token = CancellationToken::new();
        self.current = Some((self.generation, token.clone()));
        (self.generation, token)
    }

    /// Cancel the running loop. Returns whether there was one.
    pub fn cancel(&mut self) -> bool {
        match self.current.take() {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether `generation` is the loop currently allowed to act.
    pub fn is_current(&self, generation: u64) -> bool {
        self.current
            .as_ref()
            .is_some_and(|(g, token)| *g == generation && !token.is_cancelled())
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    /// Clear the slot if `generation` still owns it.
    pub fn finish(&mut self, generation: u64) {
        if self.current.as_ref().is_some_and(|(g, _)| *g == generation) {
            self.current = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
