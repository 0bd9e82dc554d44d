//! Session owner: the single task that owns the connection state.
//!
//! [`PairNode`] is spawned as an actor. It owns the state machine, the
//! discovered-peer set, the current link session and the reconnect
//! supervisor slot. Everything else talks to it through a cloneable
//! [`NodeHandle`] (requests over mpsc, replies over oneshot) and observes it
//! through a `watch` of [`ConnectionSnapshot`]s and one
//! [`NodeEvent`] stream.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::command::Command;
use crate::config::NetworkConfig;
use crate::discovery::{AcceptAll, InvitationDecision, InvitationGuard};
use crate::error::NetworkError;
use crate::identity::{DeviceIdentity, PeerDescriptor, PeerId};
use crate::link::{LinkBackend, LinkEvent, LinkSession, ResourceHandle};
use crate::memory::{InMemoryPeerMemory, PeerMemory};
use crate::peer::DiscoveredPeers;
use crate::reconnect::{ReconnectLink, ReconnectOutcome, ReconnectSupervisor, SupervisorSlot};
use crate::state::{ConnectionSnapshot, ConnectionState, ConnectionStateMachine, StateChange};
use crate::transfer::TransferLink;

/// Something the application should react to.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    StateChanged(ConnectionSnapshot),
    PeerFound(PeerDescriptor),
    PeerLost(PeerId),
    CommandReceived { from: PeerId, command: Command },
    ResourceReceived {
        from: PeerId,
        name: String,
        path: PathBuf,
    },
    ReconnectStarted { target: String },
    ReconnectGaveUp { target: String, attempts: u32 },
}

/// Who asked for a connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectOrigin {
    Manual,
    Supervisor(u64),
}

type Reply<T> = oneshot::Sender<T>;

enum Request {
    Start(Reply<Result<(), NetworkError>>),
    Stop(Reply<()>),
    Restart(Reply<Result<(), NetworkError>>),
    Connect {
        peer_id: PeerId,
        origin: ConnectOrigin,
        reply: Reply<Result<(), NetworkError>>,
    },
    Disconnect(Reply<()>),
    Send {
        command: Command,
        reply: Reply<Result<(), NetworkError>>,
    },
    SendResource {
        name: String,
        path: PathBuf,
        reply: Reply<Result<ResourceHandle, NetworkError>>,
    },
    DiscoveredPeers(Reply<Vec<PeerDescriptor>>),
    FindPeer {
        display_name: String,
        reply: Reply<Option<PeerDescriptor>>,
    },
    SupervisorFinished {
        generation: u64,
        target: String,
        outcome: ReconnectOutcome,
    },
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and spawns the session owner.
pub struct PairNode {
    identity: DeviceIdentity,
    config: NetworkConfig,
    backend: Arc<dyn LinkBackend>,
    memory: Arc<dyn PeerMemory>,
    guard: Arc<dyn InvitationGuard>,
}

impl PairNode {
    pub fn new(
        identity: DeviceIdentity,
        config: NetworkConfig,
        backend: Arc<dyn LinkBackend>,
    ) -> Self {
        Self {
            identity,
            config,
            backend,
            memory: Arc::new(InMemoryPeerMemory::new()),
            guard: Arc::new(AcceptAll),
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn PeerMemory>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_invitation_guard(mut self, guard: Arc<dyn InvitationGuard>) -> Self {
        self.guard = guard;
        self
    }

    /// Spawn the actor. The node stays `Idle` until [`NodeHandle::start`].
    pub fn spawn(self) -> (NodeHandle, mpsc::Receiver<NodeEvent>) {
        let (requests_tx, requests_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(256);
        let (state_tx, state_rx) = watch::channel(ConnectionSnapshot::idle());

        let local = self.identity.descriptor();
        let last_known = self.memory.load();
        if let Some(name) = &last_known {
            debug!("Last connected peer: '{name}'");
        }

        let actor = NodeActor {
            local: local.clone(),
            config: self.config,
            backend: self.backend,
            memory: self.memory,
            guard: self.guard,
            machine: ConnectionStateMachine::new(last_known),
            peers: DiscoveredPeers::new(),
            session: None,
            link_rx: None,
            supervisor: SupervisorSlot::new(),
            seeded: false,
            manual_disconnect: false,
            requests: requests_rx,
            requests_weak: requests_tx.downgrade(),
            state_tx,
            events: events_tx,
        };
        tokio::spawn(actor.run());

        let handle = NodeHandle {
            requests: requests_tx,
            state: state_rx,
            local,
        };
        (handle, events_rx)
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable access to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<ConnectionSnapshot>,
    local: PeerDescriptor,
}

impl NodeHandle {
    /// The descriptor other devices see for this node.
    pub fn local(&self) -> &PeerDescriptor {
        &self.local
    }

    /// `Idle -> Browsing`: open a link session. Fails into `Failed` if
    /// advertise or browse cannot start.
    pub async fn start(&self) -> Result<(), NetworkError> {
        self.request(Request::Start).await?
    }

    /// Close the link session and return to `Idle`.
    pub async fn stop(&self) -> Result<(), NetworkError> {
        self.request(Request::Stop).await
    }

    /// Tear the link session down and open a fresh one.
    pub async fn restart(&self) -> Result<(), NetworkError> {
        self.request(Request::Restart).await?
    }

    /// Invite a discovered peer. A no-op while `Connecting` or `Connected`.
    pub async fn connect(&self, peer_id: &PeerId) -> Result<(), NetworkError> {
        let peer_id = peer_id.clone();
        self.request(|reply| Request::Connect {
            peer_id,
            origin: ConnectOrigin::Manual,
            reply,
        })
        .await?
    }

    /// Drop the current connection without triggering a reconnect.
    pub async fn disconnect(&self) -> Result<(), NetworkError> {
        self.request(Request::Disconnect).await
    }

    pub async fn send(&self, command: Command) -> Result<(), NetworkError> {
        self.request(|reply| Request::Send { command, reply }).await?
    }

    pub async fn send_resource(
        &self,
        name: &str,
        path: &Path,
    ) -> Result<ResourceHandle, NetworkError> {
        let name = name.to_string();
        let path = path.to_path_buf();
        self.request(|reply| Request::SendResource { name, path, reply })
            .await?
    }

    pub async fn discovered_peers(&self) -> Result<Vec<PeerDescriptor>, NetworkError> {
        self.request(Request::DiscoveredPeers).await
    }

    pub async fn find_peer_by_name(
        &self,
        display_name: &str,
    ) -> Result<Option<PeerDescriptor>, NetworkError> {
        let display_name = display_name.to_string();
        self.request(|reply| Request::FindPeer {
            display_name,
            reply,
        })
        .await
    }

    /// The current state and active peer, read together.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state.clone()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Request,
    ) -> Result<T, NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .await
            .map_err(|_| NetworkError::NotRunning)?;
        rx.await.map_err(|_| NetworkError::NotRunning)
    }
}

#[async_trait]
impl ReconnectLink for NodeHandle {
    async fn find_peer(&self, display_name: &str) -> Option<PeerDescriptor> {
        self.find_peer_by_name(display_name).await.ok().flatten()
    }

    async fn supervised_connect(&self, peer: PeerDescriptor, generation: u64) {
        let result = self
            .request(|reply| Request::Connect {
                peer_id: peer.id,
                origin: ConnectOrigin::Supervisor(generation),
                reply,
            })
            .await;
        if let Ok(Err(e)) | Err(e) = result {
            debug!("Supervised connect failed: {e}");
        }
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state.clone()
    }
}

#[async_trait]
impl TransferLink for NodeHandle {
    async fn send_command(&self, command: Command) -> Result<(), NetworkError> {
        self.send(command).await
    }

    async fn send_resource(
        &self,
        name: &str,
        path: &Path,
    ) -> Result<ResourceHandle, NetworkError> {
        NodeHandle::send_resource(self, name, path).await
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

enum Input {
    Request(Request),
    Link(LinkEvent),
    LinkClosed,
    Shutdown,
}

struct NodeActor {
    local: PeerDescriptor,
    config: NetworkConfig,
    backend: Arc<dyn LinkBackend>,
    memory: Arc<dyn PeerMemory>,
    guard: Arc<dyn InvitationGuard>,
    machine: ConnectionStateMachine,
    peers: DiscoveredPeers,
    session: Option<Box<dyn LinkSession>>,
    link_rx: Option<mpsc::Receiver<LinkEvent>>,
    supervisor: SupervisorSlot,
    /// Whether the persisted last peer has been handed to a supervisor.
    seeded: bool,
    /// Set by `disconnect()` so the resulting drop is not retried.
    manual_disconnect: bool,
    requests: mpsc::Receiver<Request>,
    requests_weak: mpsc::WeakSender<Request>,
    state_tx: watch::Sender<ConnectionSnapshot>,
    events: mpsc::Sender<NodeEvent>,
}

async fn next_link_event(rx: &mut Option<mpsc::Receiver<LinkEvent>>) -> Option<LinkEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl NodeActor {
    async fn run(mut self) {
        loop {
            let input = tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => Input::Request(request),
                    None => Input::Shutdown,
                },
                event = next_link_event(&mut self.link_rx) => match event {
                    Some(event) => Input::Link(event),
                    None => Input::LinkClosed,
                },
            };

            match input {
                Input::Request(request) => self.handle_request(request).await,
                Input::Link(event) => self.handle_link_event(event).await,
                Input::LinkClosed => self.link_rx = None,
                Input::Shutdown => break,
            }
        }

        self.supervisor.cancel();
        self.close_session().await;
        debug!("Node task finished");
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Start(reply) => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            Request::Stop(reply) => {
                self.stop().await;
                let _ = reply.send(());
            }
            Request::Restart(reply) => {
                let result = self.restart().await;
                let _ = reply.send(result);
            }
            Request::Connect {
                peer_id,
                origin,
                reply,
            } => {
                let result = self.connect(&peer_id, origin).await;
                let _ = reply.send(result);
            }
            Request::Disconnect(reply) => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Request::Send { command, reply } => {
                let result = self.send(command).await;
                let _ = reply.send(result);
            }
            Request::SendResource { name, path, reply } => {
                let result = self.send_resource(&name, &path).await;
                let _ = reply.send(result);
            }
            Request::DiscoveredPeers(reply) => {
                let _ = reply.send(self.peers.list().to_vec());
            }
            Request::FindPeer {
                display_name,
                reply,
            } => {
                let _ = reply.send(self.peers.find_by_name(&display_name).cloned());
            }
            Request::SupervisorFinished {
                generation,
                target,
                outcome,
            } => {
                self.supervisor.finish(generation);
                match outcome {
                    ReconnectOutcome::GaveUp { attempts } => {
                        self.emit(NodeEvent::ReconnectGaveUp { target, attempts })
                            .await;
                    }
                    other => debug!("Supervisor {generation} for '{target}' ended: {other:?}"),
                }
            }
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    async fn start(&mut self) -> Result<(), NetworkError> {
        if self.machine.state() != ConnectionState::Idle {
            debug!("Start ignored in {:?}", self.machine.state());
            return Ok(());
        }

        let (link_tx, link_rx) = mpsc::channel(256);
        match self.backend.open(self.local.clone(), link_tx).await {
            Ok(session) => {
                self.session = Some(session);
                self.link_rx = Some(link_rx);
                let change = self.machine.start();
                self.apply(change).await;
                info!("Node started as {}", self.local);

                if !self.seeded {
                    self.seeded = true;
                    if let Some(name) = self.machine.last_known().map(str::to_string) {
                        self.start_supervisor(name).await;
                    }
                }
                Ok(())
            }
            Err(e) => {
                error!("Link session failed to start: {e}");
                let change = self.machine.fail();
                self.apply(change).await;
                Err(e)
            }
        }
    }

    async fn stop(&mut self) {
        self.supervisor.cancel();
        self.close_session().await;
        self.peers.clear();
        let change = self.machine.reset();
        self.apply(change).await;
    }

    async fn restart(&mut self) -> Result<(), NetworkError> {
        info!("Restarting link session");
        self.stop().await;
        self.start().await
    }

    async fn close_session(&mut self) {
        // Late events from the old session must not reach the new one.
        self.link_rx = None;
        self.manual_disconnect = false;
        if let Some(session) = self.session.take() {
            session.shutdown().await;
        }
    }

    // ── Connections ─────────────────────────────────────────────────

    async fn connect(
        &mut self,
        peer_id: &PeerId,
        origin: ConnectOrigin,
    ) -> Result<(), NetworkError> {
        match origin {
            ConnectOrigin::Manual => {
                if self.supervisor.cancel() {
                    debug!("Manual connect cancelled the reconnect supervisor");
                }
            }
            ConnectOrigin::Supervisor(generation) if !self.supervisor.is_current(generation) => {
                debug!("Dropping connect from stale supervisor {generation}");
                return Ok(());
            }
            ConnectOrigin::Supervisor(_) => {}
        }

        if self.session.is_none() {
            return Err(NetworkError::NotRunning);
        }
        let peer = self
            .peers
            .get(peer_id)
            .cloned()
            .ok_or_else(|| NetworkError::PeerNotFound(peer_id.to_string()))?;

        let Some(change) = self.machine.connect(peer.clone()) else {
            debug!("Connect to {peer} ignored in {:?}", self.machine.state());
            return Ok(());
        };

        let invited = match &self.session {
            Some(session) => session.invite(&peer),
            None => Err(NetworkError::NotRunning),
        };
        self.apply(Some(change)).await;

        if let Err(e) = invited {
            warn!("Cannot invite {peer}: {e}");
            let change = self.machine.peer_disconnected(&peer.id);
            self.apply(change).await;
            return Err(e);
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.supervisor.cancel();
        if self.machine.state() != ConnectionState::Connected {
            return;
        }
        let Some(peer_id) = self.machine.active_peer().map(|p| p.id.clone()) else {
            return;
        };
        if let Some(session) = &self.session {
            self.manual_disconnect = session.disconnect(&peer_id).await;
        }
    }

    async fn send(&mut self, command: Command) -> Result<(), NetworkError> {
        let session = self.connected_session()?;
        let bytes = command.encode()?;
        session.send_command(bytes).await.inspect_err(|e| {
            warn!("Failed to send {}: {e}", command.kind());
        })
    }

    async fn send_resource(
        &mut self,
        name: &str,
        path: &Path,
    ) -> Result<ResourceHandle, NetworkError> {
        let session = self.connected_session()?;
        session.send_resource(name, path).await.inspect_err(|e| {
            warn!("Failed to start '{name}': {e}");
        })
    }

    fn connected_session(&self) -> Result<&dyn LinkSession, NetworkError> {
        if !self.machine.snapshot().is_connected() {
            return Err(NetworkError::NotConnected);
        }
        self.session.as_deref().ok_or(NetworkError::NotRunning)
    }

    // ── Link events ─────────────────────────────────────────────────

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::PeerFound(peer) => {
                if self.peers.insert(peer.clone()) {
                    debug!("Peer found: {peer}");
                    self.emit(NodeEvent::PeerFound(peer)).await;
                }
            }
            LinkEvent::PeerLost(id) => {
                if let Some(peer) = self.peers.remove(&id) {
                    debug!("Peer lost: {peer}");
                    self.emit(NodeEvent::PeerLost(id)).await;
                }
            }
            LinkEvent::Invitation { peer, reply } => {
                let decision = self.review_invitation(&peer);
                let accepted = decision == InvitationDecision::Accept;
                if reply.send(decision).is_err() {
                    debug!("Invitation from {peer} withdrawn before it was answered");
                } else if accepted {
                    let change = self.machine.connect(peer.clone());
                    self.apply(change).await;
                }
            }
            LinkEvent::PeerConnected(peer) => {
                let change = self.machine.peer_connected(&peer);
                if change.is_none() && self.machine.active_peer() != Some(&peer) {
                    warn!("Unexpected connection with {peer}, closing it");
                    if let Some(session) = &self.session {
                        session.disconnect(&peer.id).await;
                    }
                }
                self.apply(change).await;
            }
            LinkEvent::PeerDisconnected(id) => {
                let change = self.machine.peer_disconnected(&id);
                self.apply(change).await;
            }
            LinkEvent::CommandReceived { from, bytes } => match Command::decode(&bytes) {
                Ok(command) => {
                    self.emit(NodeEvent::CommandReceived { from, command }).await;
                }
                Err(e) => warn!("Dropping command from {from}: {e}"),
            },
            LinkEvent::ResourceReceived { from, name, path } => {
                self.emit(NodeEvent::ResourceReceived { from, name, path })
                    .await;
            }
        }
    }

    fn review_invitation(&self, peer: &PeerDescriptor) -> InvitationDecision {
        match self.machine.state() {
            ConnectionState::Browsing => self.guard.review(peer),
            ConnectionState::Connecting | ConnectionState::Connected => {
                InvitationDecision::Reject("already paired".to_string())
            }
            ConnectionState::Idle | ConnectionState::Failed => {
                InvitationDecision::Reject("not ready".to_string())
            }
        }
    }

    // ── Transitions ─────────────────────────────────────────────────

    async fn apply(&mut self, change: Option<StateChange>) {
        let Some(change) = change else {
            return;
        };
        debug!("State {:?} -> {:?}", change.from, change.to);
        if change.to == ConnectionState::Connected {
            self.supervisor.cancel();
            if let Some(peer) = self.machine.active_peer() {
                info!("Connected to {peer}");
                self.memory.remember(&peer.display_name);
            }
        }

        let snapshot = self.machine.snapshot();
        self.state_tx.send_replace(snapshot.clone());
        self.emit(NodeEvent::StateChanged(snapshot)).await;

        if let Some(lost) = change.dropped {
            if std::mem::take(&mut self.manual_disconnect) {
                info!("Disconnected from {lost}");
            } else {
                warn!("Connection to {lost} dropped");
                self.start_supervisor(lost.display_name).await;
            }
        }
    }

    async fn start_supervisor(&mut self, target: String) {
        if !self.config.reconnect.enabled {
            return;
        }
        let Some(requests) = self.requests_weak.upgrade() else {
            return;
        };
        let (generation, cancel) = self.supervisor.begin();
        let link = NodeHandle {
            requests,
            state: self.state_tx.subscribe(),
            local: self.local.clone(),
        };
        let policy = self.config.reconnect.clone();

        self.emit(NodeEvent::ReconnectStarted {
            target: target.clone(),
        })
        .await;

        tokio::spawn(async move {
            let supervisor = ReconnectSupervisor::new(link.clone(), policy);
            let outcome = supervisor.run(&target, generation, &cancel).await;
            let _ = link
                .requests
                .send(Request::SupervisorFinished {
                    generation,
                    target,
                    outcome,
                })
                .await;
        });
    }

    async fn emit(&self, event: NodeEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Node event dropped: no consumer");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
