//! LAN peer discovery via UDP broadcast.
//!
//! A [`DiscoverySession`] runs two independent tasks: an advertiser that
//! broadcasts our [`Announcement`] at a fixed interval, and a browser that
//! listens for other devices' announcements. The browser applies the
//! configured [`RoleFilter`], deduplicates by peer id, and reports
//! [`DiscoveryEvent`]s through an mpsc channel. Peers that stop announcing
//! for longer than the TTL, or that announce their departure, are reported
//! lost.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::RoleFilter;
use crate::error::NetworkError;
use crate::identity::{PeerDescriptor, PeerId, Role};

/// An announcement broadcast by a device on the LAN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    /// The device's unique ID.
    pub peer_id: PeerId,
    /// Human-readable device name.
    pub name: String,
    /// Role attribute used for filtering.
    pub role: Role,
    /// The address the device accepts link connections on.
    pub listen_addr: String,
    /// Software version.
    pub version: String,
    /// Set on the final announcement sent when the device stops.
    #[serde(default)]
    pub departing: bool,
}

impl Announcement {
    pub fn descriptor(&self) -> PeerDescriptor {
        PeerDescriptor::new(self.peer_id.clone(), self.name.clone(), self.role)
    }

    /// Where to reach this device's link listener. An unspecified listen IP
    /// (`0.0.0.0`) is replaced by the datagram's source IP.
    pub fn link_addr(&self, source: SocketAddr) -> SocketAddr {
        match self.listen_addr.parse::<SocketAddr>() {
            Ok(addr) if addr.ip().is_unspecified() => SocketAddr::new(source.ip(), addr.port()),
            Ok(addr) => addr,
            Err(_) => source,
        }
    }
}

/// A peer surfaced by the browser.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub descriptor: PeerDescriptor,
    pub link_addr: SocketAddr,
}

/// Event emitted by the browser.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    PeerFound(DiscoveredPeer),
    PeerLost(PeerId),
}

/// Whether a peer advertising `remote` should be surfaced to a device
/// playing `local`.
pub fn role_accepted(filter: RoleFilter, local: Role, remote: Role) -> bool {
    match filter {
        RoleFilter::Opposite => remote == local.opposite(),
        RoleFilter::Any => true,
    }
}

// ---------------------------------------------------------------------------
// Invitation guard
// ---------------------------------------------------------------------------

/// Answer to an incoming invitation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvitationDecision {
    Accept,
    Reject(String),
}

/// Capability-level hook consulted before an incoming invitation is
/// accepted.
pub trait InvitationGuard: Send + Sync {
    fn review(&self, peer: &PeerDescriptor) -> InvitationDecision;
}

/// Accepts every invitation.
pub struct AcceptAll;

impl InvitationGuard for AcceptAll {
    fn review(&self, _peer: &PeerDescriptor) -> InvitationDecision {
        InvitationDecision::Accept
    }
}

// ---------------------------------------------------------------------------
// Browser state
// ---------------------------------------------------------------------------

/// Dedup and expiry bookkeeping for the browse task.
#[derive(Debug)]
pub struct Browser {
    local_id: PeerId,
    local_role: Role,
    filter: RoleFilter,
    ttl: Duration,
    seen: HashMap<PeerId, Instant>,
}

impl Browser {
    pub fn new(local_id: PeerId, local_role: Role, filter: RoleFilter, ttl: Duration) -> Self {
        Self {
            local_id,
            local_role,
            filter,
            ttl,
            seen: HashMap::new(),
        }
    }

    /// Process one announcement. Returns an event only on first sighting or
    /// departure; repeated announcements just refresh the peer.
    pub fn observe(
        &mut self,
        announcement: &Announcement,
        source: SocketAddr,
        now: Instant,
    ) -> Option<DiscoveryEvent> {
        if announcement.peer_id == self.local_id {
            return None;
        }
        if !role_accepted(self.filter, self.local_role, announcement.role) {
            trace!("Ignoring '{}' with role {}", announcement.name, announcement.role);
            return None;
        }

        if announcement.departing {
            return self
                .seen
                .remove(&announcement.peer_id)
                .map(|_| DiscoveryEvent::PeerLost(announcement.peer_id.clone()));
        }

        match self.seen.insert(announcement.peer_id.clone(), now) {
            Some(_) => None,
            None => Some(DiscoveryEvent::PeerFound(DiscoveredPeer {
                descriptor: announcement.descriptor(),
                link_addr: announcement.link_addr(source),
            })),
        }
    }

    /// Drop peers not heard from within the TTL and return their ids.
    pub fn sweep(&mut self, now: Instant) -> Vec<PeerId> {
        let ttl = self.ttl;
        let expired: Vec<PeerId> = self
            .seen
            .iter()
            .filter(|(_, last)| now.saturating_duration_since(**last) > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.seen.remove(id);
        }
        expired
    }

    pub fn known_count(&self) -> usize {
        self.seen.len()
    }
}

// ---------------------------------------------------------------------------
// Discovery session
// ---------------------------------------------------------------------------

/// Configuration for the discovery session.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port to broadcast on and listen on.
    pub port: u16,
    /// How often to broadcast an announcement.
    pub interval: Duration,
    /// Silence after which a peer is reported lost.
    pub ttl: Duration,
    /// Which roles to surface.
    pub role_filter: RoleFilter,
    /// Our own announcement to broadcast.
    pub announcement: Announcement,
}

/// Advertise + browse over UDP broadcast.
pub struct DiscoverySession {
    config: DiscoveryConfig,
    shutdown: CancellationToken,
    sender: Option<Arc<UdpSocket>>,
    tasks: Vec<JoinHandle<()>>,
}

impl DiscoverySession {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            sender: None,
            tasks: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.sender.is_some()
    }

    /// Bind both sockets and spawn the advertiser and browser.
    ///
    /// Fails if either socket cannot be set up; nothing is left running in
    /// that case.
    pub async fn start(
        &mut self,
        discovered_tx: mpsc::Sender<DiscoveryEvent>,
    ) -> Result<(), NetworkError> {
        if self.is_running() {
            return Ok(());
        }

        let listener_socket = bind_shared(self.config.port)?;
        info!("Discovery listening on UDP port {}", self.config.port);

        let sender_socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| NetworkError::Discovery(format!("Sender bind: {e}")))?;
        sender_socket
            .set_broadcast(true)
            .map_err(|e| NetworkError::Discovery(format!("Set broadcast: {e}")))?;
        let sender_socket = Arc::new(sender_socket);

        let announcement_bytes = serde_json::to_vec(&self.config.announcement)?;
        let broadcast_addr = broadcast_addr(self.config.port);
        let interval = self.config.interval;

        self.shutdown = CancellationToken::new();

        // Advertiser.
        let socket = Arc::clone(&sender_socket);
        let shutdown = self.shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                match socket.send_to(&announcement_bytes, broadcast_addr).await {
                    Ok(_) => trace!("Announcement sent"),
                    Err(e) => debug!("Announcement send failed: {e}"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.cancelled() => {
                        debug!("Discovery advertiser shutting down");
                        break;
                    }
                }
            }
        }));

        // Browser.
        let ann = &self.config.announcement;
        let mut browser = Browser::new(
            ann.peer_id.clone(),
            ann.role,
            self.config.role_filter,
            self.config.ttl,
        );
        let sweep_every = (self.config.ttl / 2).max(Duration::from_millis(100));
        let shutdown = self.shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let mut sweep = tokio::time::interval(sweep_every);
            loop {
                tokio::select! {
                    result = listener_socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, src_addr)) => {
                                let parsed = serde_json::from_slice::<Announcement>(&buf[..len]);
                                let Ok(announcement) = parsed else {
                                    trace!("Ignoring non-announcement datagram from {src_addr}");
                                    continue;
                                };
                                let now = Instant::now();
                                let observed = browser.observe(&announcement, src_addr, now);
                                if let Some(event) = observed {
                                    match &event {
                                        DiscoveryEvent::PeerFound(p) => {
                                            debug!(
                                                "Discovered peer '{}' at {}",
                                                p.descriptor.display_name, p.link_addr
                                            );
                                        }
                                        DiscoveryEvent::PeerLost(id) => {
                                            debug!("Peer {id} departed");
                                        }
                                    }
                                    if discovered_tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(e) => warn!("Discovery recv error: {e}"),
                        }
                    }
                    _ = sweep.tick() => {
                        for id in browser.sweep(Instant::now()) {
                            debug!("Peer {id} expired");
                            if discovered_tx.send(DiscoveryEvent::PeerLost(id)).await.is_err() {
                                return;
                            }
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Discovery browser shutting down");
                        break;
                    }
                }
            }
        }));

        self.sender = Some(sender_socket);
        Ok(())
    }

    /// Announce our departure and stop both tasks.
    pub async fn stop(&mut self) {
        let Some(sender) = self.sender.take() else {
            return;
        };

        let mut farewell = self.config.announcement.clone();
        farewell.departing = true;
        if let Ok(bytes) = serde_json::to_vec(&farewell) {
            if let Err(e) = sender.send_to(&bytes, broadcast_addr(self.config.port)).await {
                debug!("Departure announcement failed: {e}");
            }
        }

        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("Discovery stopped");
    }
}

impl Drop for DiscoverySession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn broadcast_addr(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port))
}

/// Bind the listener with address reuse so several instances on one host
/// can share the discovery port.
fn bind_shared(port: u16) -> Result<UdpSocket, NetworkError> {
    let setup = || -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        socket.bind(&addr.into())?;
        UdpSocket::from_std(socket.into())
    };
    setup().map_err(|e| NetworkError::Discovery(format!("Bind failed on port {port}: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn announcement(id: &str, name: &str, role: Role) -> Announcement {
        Announcement {
            peer_id: PeerId::from_string(id),
            name: name.to_string(),
            role,
            listen_addr: "0.0.0.0:9480".to_string(),
            version: "0.1.0".to_string(),
            departing: false,
        }
    }

    fn source() -> SocketAddr {
        "192.168.1.20:50000".parse().unwrap()
    }

    #[test]
    fn test_announcement_serialize_roundtrip() {
        let ann = announcement("test-peer", "studio", Role::Responder);
        let json = serde_json::to_string(&ann).unwrap();
        assert!(json.contains("\"role\":\"responder\""));

        let deserialized: Announcement = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.peer_id, ann.peer_id);
        assert!(!deserialized.departing);
    }

    #[test]
    fn test_link_addr_resolution() {
        let ann = announcement("a", "a", Role::Responder);
        assert_eq!(ann.link_addr(source()), "192.168.1.20:9480".parse().unwrap());

        let mut explicit = ann.clone();
        explicit.listen_addr = "10.0.0.5:7000".to_string();
        assert_eq!(explicit.link_addr(source()), "10.0.0.5:7000".parse().unwrap());

        let mut garbage = ann;
        garbage.listen_addr = "nonsense".to_string();
        assert_eq!(garbage.link_addr(source()), source());
    }

    #[test]
    fn test_role_filter() {
        assert!(role_accepted(RoleFilter::Opposite, Role::Initiator, Role::Responder));
        assert!(!role_accepted(RoleFilter::Opposite, Role::Initiator, Role::Initiator));
        assert!(role_accepted(RoleFilter::Any, Role::Initiator, Role::Initiator));
    }

    #[test]
    fn test_browser_reports_first_sighting_only() {
        let mut browser = Browser::new(
            PeerId::from_string("me"),
            Role::Initiator,
            RoleFilter::Opposite,
            Duration::from_secs(5),
        );
        let now = Instant::now();
        let ann = announcement("mac", "Studio", Role::Responder);

        let first = browser.observe(&ann, source(), now);
        match first {
            Some(DiscoveryEvent::PeerFound(p)) => {
                assert_eq!(p.descriptor.display_name, "Studio");
                assert_eq!(p.link_addr.port(), 9480);
            }
            other => panic!("Expected PeerFound, got {other:?}"),
        }
        assert!(browser.observe(&ann, source(), now).is_none());
        assert_eq!(browser.known_count(), 1);
    }

    #[test]
    fn test_browser_skips_self_and_filtered_roles() {
        let mut browser = Browser::new(
            PeerId::from_string("me"),
            Role::Initiator,
            RoleFilter::Opposite,
            Duration::from_secs(5),
        );
        let now = Instant::now();
        let me = announcement("me", "me", Role::Responder);
        let ipad = announcement("ipad", "iPad", Role::Initiator);
        assert!(browser.observe(&me, source(), now).is_none());
        assert!(browser.observe(&ipad, source(), now).is_none());
        assert_eq!(browser.known_count(), 0);
    }

    #[test]
    fn test_browser_dedupes_by_id_not_name() {
        let mut browser = Browser::new(
            PeerId::from_string("me"),
            Role::Initiator,
            RoleFilter::Any,
            Duration::from_secs(5),
        );
        let now = Instant::now();
        let first = announcement("a", "MacBook", Role::Responder);
        let second = announcement("b", "MacBook", Role::Responder);
        assert!(browser.observe(&first, source(), now).is_some());
        assert!(browser.observe(&second, source(), now).is_some());
        assert_eq!(browser.known_count(), 2);
    }

    #[test]
    fn test_browser_departure_and_expiry() {
        let mut browser = Browser::new(
            PeerId::from_string("me"),
            Role::Initiator,
            RoleFilter::Any,
            Duration::from_secs(5),
        );
        let t0 = Instant::now();
        browser.observe(&announcement("a", "A", Role::Responder), source(), t0);
        browser.observe(&announcement("b", "B", Role::Responder), source(), t0);

        let mut bye = announcement("a", "A", Role::Responder);
        bye.departing = true;
        assert!(matches!(
            browser.observe(&bye, source(), t0),
            Some(DiscoveryEvent::PeerLost(id)) if id.as_str() == "a"
        ));
        // A second departure for an unknown peer is silent.
        assert!(browser.observe(&bye, source(), t0).is_none());

        assert!(browser.sweep(t0 + Duration::from_secs(4)).is_empty());
        let expired = browser.sweep(t0 + Duration::from_secs(6));
        assert_eq!(expired, vec![PeerId::from_string("b")]);
        assert_eq!(browser.known_count(), 0);
    }

    #[test]
    fn test_accept_all_guard() {
        let peer = announcement("a", "A", Role::Responder).descriptor();
        assert_eq!(AcceptAll.review(&peer), InvitationDecision::Accept);
    }

    fn free_udp_port() -> u16 {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_session_surfaces_unicast_announcement() {
        let port = free_udp_port();
        let config = DiscoveryConfig {
            port,
            interval: Duration::from_secs(60),
            ttl: Duration::from_secs(30),
            role_filter: RoleFilter::Opposite,
            announcement: announcement("me", "iPhone", Role::Initiator),
        };
        let (tx, mut rx) = mpsc::channel(8);
        let mut session = DiscoverySession::new(config);
        session.start(tx).await.unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ann = announcement("mac", "Studio", Role::Responder);
        peer.send_to(&serde_json::to_vec(&ann).unwrap(), ("127.0.0.1", port))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            DiscoveryEvent::PeerFound(p) => {
                assert_eq!(p.descriptor.id.as_str(), "mac");
                assert_eq!(p.link_addr, "127.0.0.1:9480".parse().unwrap());
            }
            other => panic!("Expected PeerFound, got {other:?}"),
        }

        session.stop().await;
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_session_start_fails_when_port_is_taken() {
        let blocker = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = blocker.local_addr().unwrap().port();

        let config = DiscoveryConfig {
            port,
            interval: Duration::from_secs(1),
            ttl: Duration::from_secs(5),
            role_filter: RoleFilter::Any,
            announcement: announcement("me", "iPhone", Role::Initiator),
        };
        let (tx, _rx) = mpsc::channel(8);
        let mut session = DiscoverySession::new(config);
        let result = session.start(tx).await;
        assert!(matches!(result, Err(NetworkError::Discovery(_))));
        assert!(!session.is_running());
    }
}
