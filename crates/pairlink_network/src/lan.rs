//! LAN link backend: UDP discovery plus the WebSocket transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::discovery::{Announcement, DiscoveryConfig, DiscoveryEvent, DiscoverySession};
use crate::error::NetworkError;
use crate::identity::{PeerDescriptor, PeerId};
use crate::link::{LinkBackend, LinkEvent, LinkSession, ResourceHandle};
use crate::transport::{TransportSettings, WsTransport};

/// Opens [`LanSession`]s from a [`NetworkConfig`].
pub struct LanBackend {
    config: NetworkConfig,
}

impl LanBackend {
    pub fn new(config: NetworkConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl LinkBackend for LanBackend {
    async fn open(
        &self,
        local: PeerDescriptor,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Box<dyn LinkSession>, NetworkError> {
        let transport = WsTransport::bind(
            self.config.listen_addr,
            local.clone(),
            TransportSettings::from_config(&self.config),
            events.clone(),
        )
        .await
        .map_err(|e| NetworkError::Discovery(format!("Link server: {e}")))?;

        let announcement = Announcement {
            peer_id: local.id.clone(),
            name: local.display_name.clone(),
            role: local.role,
            listen_addr: transport.local_addr().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            departing: false,
        };
        let mut discovery = DiscoverySession::new(DiscoveryConfig {
            port: self.config.discovery_port,
            interval: self.config.announce_interval,
            ttl: self.config.peer_ttl,
            role_filter: self.config.role_filter,
            announcement,
        });

        let (discovered_tx, discovered_rx) = mpsc::channel(64);
        if let Err(e) = discovery.start(discovered_tx).await {
            transport.shutdown().await;
            return Err(e);
        }

        let addresses = Arc::new(Mutex::new(HashMap::new()));
        let forwarder = tokio::spawn(forward_discovery(
            discovered_rx,
            Arc::clone(&addresses),
            events,
        ));

        info!("LAN session open as {local}");
        Ok(Box::new(LanSession {
            discovery: tokio::sync::Mutex::new(discovery),
            transport,
            addresses,
            forwarder,
        }))
    }
}

/// Record link addresses and pass discovery results on as link events.
async fn forward_discovery(
    mut discovered_rx: mpsc::Receiver<DiscoveryEvent>,
    addresses: Arc<Mutex<HashMap<PeerId, SocketAddr>>>,
    events: mpsc::Sender<LinkEvent>,
) {
    while let Some(event) = discovered_rx.recv().await {
        let link_event = match event {
            DiscoveryEvent::PeerFound(found) => {
                addresses
                    .lock()
                    .insert(found.descriptor.id.clone(), found.link_addr);
                LinkEvent::PeerFound(found.descriptor)
            }
            DiscoveryEvent::PeerLost(id) => {
                addresses.lock().remove(&id);
                LinkEvent::PeerLost(id)
            }
        };
        if events.send(link_event).await.is_err() {
            break;
        }
    }
}

/// One incarnation of LAN discovery and transport.
pub struct LanSession {
    discovery: tokio::sync::Mutex<DiscoverySession>,
    transport: WsTransport,
    addresses: Arc<Mutex<HashMap<PeerId, SocketAddr>>>,
    forwarder: JoinHandle<()>,
}

#[async_trait]
impl LinkSession for LanSession {
    fn invite(&self, peer: &PeerDescriptor) -> Result<(), NetworkError> {
        let addr = self
            .addresses
            .lock()
            .get(&peer.id)
            .copied()
            .ok_or_else(|| NetworkError::PeerNotFound(peer.display_name.clone()))?;
        debug!("Inviting {peer} at {addr}");
        self.transport.invite(addr, peer.clone());
        Ok(())
    }

    async fn send_command(&self, bytes: Vec<u8>) -> Result<(), NetworkError> {
        self.transport.send_command(&bytes).await
    }

    async fn send_resource(
        &self,
        name: &str,
        path: &Path,
    ) -> Result<ResourceHandle, NetworkError> {
        self.transport.send_resource(name, path).await
    }

    async fn disconnect(&self, peer: &PeerId) -> bool {
        self.transport.disconnect_peer(peer).await
    }

    async fn shutdown(&self) {
        self.discovery.lock().await.stop().await;
        self.transport.shutdown().await;
        self.forwarder.abort();
        self.addresses.lock().clear();
        info!("LAN session closed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveredPeer;
    use crate::identity::Role;
    use std::time::Duration;

    #[tokio::test]
    async fn test_forwarder_tracks_addresses() {
        let (disc_tx, disc_rx) = mpsc::channel(8);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let addresses = Arc::new(Mutex::new(HashMap::new()));
        let task = tokio::spawn(forward_discovery(disc_rx, Arc::clone(&addresses), events_tx));

        let peer = PeerDescriptor::new(PeerId::from_string("mac"), "Studio", Role::Responder);
        let addr: SocketAddr = "192.168.1.20:9480".parse().unwrap();
        disc_tx
            .send(DiscoveryEvent::PeerFound(DiscoveredPeer {
                descriptor: peer.clone(),
                link_addr: addr,
            }))
            .await
            .unwrap();
        assert!(matches!(events_rx.recv().await, Some(LinkEvent::PeerFound(p)) if p == peer));
        assert_eq!(addresses.lock().get(&peer.id), Some(&addr));

        disc_tx.send(DiscoveryEvent::PeerLost(peer.id.clone())).await.unwrap();
        assert!(matches!(events_rx.recv().await, Some(LinkEvent::PeerLost(id)) if id == peer.id));
        assert!(addresses.lock().is_empty());

        drop(disc_tx);
        task.await.unwrap();
    }

    fn free_udp_port() -> u16 {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_invite_unknown_peer_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = NetworkConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            discovery_port: free_udp_port(),
            announce_interval: Duration::from_secs(60),
            incoming_dir: dir.path().to_path_buf(),
            ..NetworkConfig::default()
        };
        let backend = LanBackend::new(config);
        let (tx, _rx) = mpsc::channel(8);
        let local = PeerDescriptor::new(PeerId::generate(), "iPhone", Role::Initiator);
        let session = backend.open(local, tx).await.unwrap();

        let stranger = PeerDescriptor::new(PeerId::from_string("x"), "Nobody", Role::Responder);
        assert!(matches!(
            session.invite(&stranger),
            Err(NetworkError::PeerNotFound(name)) if name == "Nobody"
        ));
        assert!(matches!(
            session.send_command(b"{}".to_vec()).await,
            Err(NetworkError::NotConnected)
        ));

        session.shutdown().await;
    }
}
