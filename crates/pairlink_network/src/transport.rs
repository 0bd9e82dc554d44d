//! WebSocket link transport: invitation handshake, command channel and
//! resource streaming over a single connection.
//!
//! Every node runs a server on its listen address. The inviting side dials
//! the peer and opens with an `Invite` control frame; the remote answers
//! `Accept` or `Reject`. Once accepted, both ends hold a [`PeerConnection`]:
//!
//! - text frames carry JSON [`ControlFrame`]s;
//! - binary frames start with a channel tag: [`COMMAND_TAG`] followed by
//!   codec bytes, or [`CHUNK_TAG`] followed by a 16-byte resource id and a
//!   slice of file data.
//!
//! At most one connection is active. Its loss cancels every resource in
//! flight in either direction.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::NetworkConfig;
use crate::discovery::InvitationDecision;
use crate::error::NetworkError;
use crate::identity::{PeerDescriptor, PeerId};
use crate::link::{LinkEvent, ResourceHandle, ResourceReporter, resource_channel};

/// Binary frame tag for command-channel payloads.
pub const COMMAND_TAG: u8 = 0x01;
/// Binary frame tag for resource chunks.
pub const CHUNK_TAG: u8 = 0x02;

/// Control messages exchanged as text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ControlFrame {
    Invite { peer: PeerDescriptor },
    Accept { peer: PeerDescriptor },
    Reject { reason: String },
    ResourceStart { id: Uuid, name: String, size: u64 },
    ResourceEnd { id: Uuid },
    ResourceAck { id: Uuid },
    ResourceCancel { id: Uuid },
    Goodbye,
}

impl ControlFrame {
    pub fn to_message(&self) -> Result<Message, NetworkError> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }
}

/// A decoded binary frame.
#[derive(Debug, PartialEq, Eq)]
pub enum BinaryFrame<'a> {
    Command(&'a [u8]),
    Chunk { id: Uuid, data: &'a [u8] },
}

pub fn command_frame(bytes: &[u8]) -> Message {
    let mut frame = Vec::with_capacity(bytes.len() + 1);
    frame.push(COMMAND_TAG);
    frame.extend_from_slice(bytes);
    Message::Binary(frame.into())
}

pub fn chunk_frame(id: Uuid, data: &[u8]) -> Message {
    let mut frame = Vec::with_capacity(data.len() + 17);
    frame.push(CHUNK_TAG);
    frame.extend_from_slice(id.as_bytes());
    frame.extend_from_slice(data);
    Message::Binary(frame.into())
}

pub fn parse_binary(frame: &[u8]) -> Option<BinaryFrame<'_>> {
    let (&tag, rest) = frame.split_first()?;
    match tag {
        COMMAND_TAG => Some(BinaryFrame::Command(rest)),
        CHUNK_TAG if rest.len() >= 16 => {
            let id = Uuid::from_slice(&rest[..16]).ok()?;
            Some(BinaryFrame::Chunk {
                id,
                data: &rest[16..],
            })
        }
        _ => None,
    }
}

/// Transport knobs taken from [`NetworkConfig`].
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub connection_timeout: Duration,
    pub chunk_size: usize,
    pub incoming_dir: PathBuf,
}

impl TransportSettings {
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            connection_timeout: config.connection_timeout,
            chunk_size: config.chunk_size.max(1),
            incoming_dir: config.incoming_dir.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Peer connection
// ---------------------------------------------------------------------------

/// An established link with one peer.
///
/// Writes go through a dedicated writer task so any number of senders can
/// share the connection.
pub struct PeerConnection {
    peer: PeerDescriptor,
    outbound: mpsc::Sender<Message>,
    closed: CancellationToken,
    pending_acks: Mutex<HashMap<Uuid, oneshot::Sender<()>>>,
}

impl PeerConnection {
    pub fn peer(&self) -> &PeerDescriptor {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn send(&self, msg: Message) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::NotConnected);
        }
        self.outbound
            .send(msg)
            .await
            .map_err(|_| NetworkError::Transport(format!("Link with {} closed", self.peer)))
    }

    pub async fn send_frame(&self, frame: &ControlFrame) -> Result<(), NetworkError> {
        self.send(frame.to_message()?).await
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

struct Shared {
    local: PeerDescriptor,
    settings: TransportSettings,
    events: mpsc::Sender<LinkEvent>,
    active: Mutex<Option<Arc<PeerConnection>>>,
    shutdown: CancellationToken,
}

/// WebSocket server plus outbound dialer for one link session.
pub struct WsTransport {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
}

impl WsTransport {
    /// Bind the server and start accepting connections.
    pub async fn bind(
        addr: SocketAddr,
        local: PeerDescriptor,
        settings: TransportSettings,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Link server listening on {local_addr}");

        let shared = Arc::new(Shared {
            local,
            settings,
            events,
            active: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(accept_loop(listener, Arc::clone(&shared)));

        Ok(Self { shared, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local(&self) -> &PeerDescriptor {
        &self.shared.local
    }

    pub fn active_peer(&self) -> Option<PeerDescriptor> {
        self.shared
            .active
            .lock()
            .as_ref()
            .filter(|c| !c.is_closed())
            .map(|c| c.peer.clone())
    }

    /// Dial `addr` and invite `peer` in the background. Failure of any kind
    /// is reported as `PeerDisconnected` for the peer.
    pub fn invite(&self, addr: SocketAddr, peer: PeerDescriptor) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let timeout = shared.settings.connection_timeout;
            let result = tokio::select! {
                r = tokio::time::timeout(timeout, dial(&shared, addr, &peer)) => {
                    r.unwrap_or_else(|_| Err(NetworkError::Timeout(timeout)))
                }
                _ = shared.shutdown.cancelled() => return,
            };
            if let Err(e) = result {
                warn!("Invitation to {peer} failed: {e}");
                let _ = shared.events.send(LinkEvent::PeerDisconnected(peer.id)).await;
            }
        });
    }

    pub async fn send_command(&self, bytes: &[u8]) -> Result<(), NetworkError> {
        self.connection()?.send(command_frame(bytes)).await
    }

    /// Start streaming `path` to the connected peer under `name`.
    pub async fn send_resource(
        &self,
        name: &str,
        path: &Path,
    ) -> Result<ResourceHandle, NetworkError> {
        let conn = self.connection()?;
        let size = tokio::fs::metadata(path).await?.len();
        let file = File::open(path).await?;

        let id = Uuid::new_v4();
        let (ack_tx, ack_rx) = oneshot::channel();
        conn.pending_acks.lock().insert(id, ack_tx);

        let start = ControlFrame::ResourceStart {
            id,
            name: name.to_string(),
            size,
        };
        if let Err(e) = conn.send_frame(&start).await {
            conn.pending_acks.lock().remove(&id);
            return Err(e);
        }
        debug!("Streaming '{name}' ({size} bytes) to {}", conn.peer);

        let (reporter, handle) = resource_channel(name);
        let chunk_size = self.shared.settings.chunk_size;
        tokio::spawn(stream_resource(conn, id, file, size, chunk_size, reporter, ack_rx));
        Ok(handle)
    }

    /// Say goodbye and close the active connection. The read loop reports
    /// `PeerDisconnected` once it winds down.
    pub async fn disconnect(&self) {
        let conn = self.shared.active.lock().clone();
        if let Some(conn) = conn {
            say_goodbye(&conn).await;
        }
    }

    /// Like [`disconnect`](Self::disconnect), but only when the active
    /// connection is with `peer`. Returns whether one was closed.
    pub async fn disconnect_peer(&self, peer: &PeerId) -> bool {
        let conn = self
            .shared
            .active
            .lock()
            .clone()
            .filter(|c| c.peer.id == *peer && !c.is_closed());
        match conn {
            Some(conn) => {
                say_goodbye(&conn).await;
                true
            }
            None => false,
        }
    }

    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.shared.shutdown.cancel();
    }

    fn connection(&self) -> Result<Arc<PeerConnection>, NetworkError> {
        self.shared
            .active
            .lock()
            .clone()
            .filter(|c| !c.is_closed())
            .ok_or(NetworkError::NotConnected)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn say_goodbye(conn: &PeerConnection) {
    let _ = conn.send_frame(&ControlFrame::Goodbye).await;
    let _ = conn.send(Message::Close(None)).await;
    conn.close();
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        if let Err(e) = answer(&shared, stream, addr).await {
                            debug!("Inbound link from {addr} not established: {e}");
                        }
                    });
                }
                Err(e) => error!("TCP accept failed: {e}"),
            },
            _ = shared.shutdown.cancelled() => {
                info!("Link server shutting down");
                break;
            }
        }
    }
}

/// Handle one inbound connection: read the invite, ask the session owner,
/// answer.
async fn answer(
    shared: &Arc<Shared>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), NetworkError> {
    let timeout = shared.settings.connection_timeout;
    let mut ws = accept_async(stream)
        .await
        .map_err(|e| NetworkError::Transport(format!("WebSocket accept failed for {addr}: {e}")))?;

    let first = tokio::time::timeout(timeout, next_control(&mut ws))
        .await
        .map_err(|_| NetworkError::Timeout(timeout))??;
    let ControlFrame::Invite { peer } = first else {
        return Err(NetworkError::Transport(format!("{addr} did not open with an invite")));
    };
    debug!("Invitation from {peer} at {addr}");

    let (reply_tx, reply_rx) = oneshot::channel();
    shared
        .events
        .send(LinkEvent::Invitation {
            peer: peer.clone(),
            reply: reply_tx,
        })
        .await
        .map_err(|_| NetworkError::NotRunning)?;

    let decision = tokio::time::timeout(timeout, reply_rx)
        .await
        .ok()
        .and_then(Result::ok)
        .unwrap_or_else(|| InvitationDecision::Reject("no answer".to_string()));

    match decision {
        InvitationDecision::Accept => {
            let accept = ControlFrame::Accept {
                peer: shared.local.clone(),
            };
            if let Err(e) = ws.send(accept.to_message()?).await {
                let _ = shared.events.send(LinkEvent::PeerDisconnected(peer.id)).await;
                return Err(NetworkError::Transport(format!("Accept send failed: {e}")));
            }
            attach(shared, peer, ws).await;
            Ok(())
        }
        InvitationDecision::Reject(reason) => {
            info!("Rejected invitation from {peer}: {reason}");
            let _ = ws.send(ControlFrame::Reject { reason }.to_message()?).await;
            let _ = ws.close(None).await;
            Ok(())
        }
    }
}

async fn dial(
    shared: &Arc<Shared>,
    addr: SocketAddr,
    target: &PeerDescriptor,
) -> Result<(), NetworkError> {
    let url = format!("ws://{addr}");
    let (mut ws, _) = connect_async(url.as_str())
        .await
        .map_err(|e| NetworkError::Transport(format!("Connect to {addr} failed: {e}")))?;

    let invite = ControlFrame::Invite {
        peer: shared.local.clone(),
    };
    ws.send(invite.to_message()?)
        .await
        .map_err(|e| NetworkError::Transport(format!("Invite send failed: {e}")))?;

    match next_control(&mut ws).await? {
        ControlFrame::Accept { peer } if peer.id == target.id => {
            attach(shared, peer, ws).await;
            Ok(())
        }
        ControlFrame::Accept { peer } => Err(NetworkError::Transport(format!(
            "{addr} answered as {peer}, expected {target}"
        ))),
        ControlFrame::Reject { reason } => Err(NetworkError::InvitationRejected {
            peer: target.display_name.clone(),
            reason,
        }),
        other => Err(NetworkError::Transport(format!("Unexpected handshake frame: {other:?}"))),
    }
}

async fn next_control<S>(ws: &mut WebSocketStream<S>) -> Result<ControlFrame, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = ws.next().await {
        match msg.map_err(|e| NetworkError::Transport(format!("Read error: {e}")))? {
            Message::Text(text) => return Ok(serde_json::from_str(&text)?),
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(NetworkError::Transport("Connection closed during handshake".to_string()))
}

/// Install an accepted stream as the active connection and start its
/// writer and reader tasks.
async fn attach<S>(shared: &Arc<Shared>, peer: PeerDescriptor, ws: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, stream) = ws.split();
    let (outbound, mut outbound_rx) = mpsc::channel::<Message>(256);
    let conn = Arc::new(PeerConnection {
        peer: peer.clone(),
        outbound,
        closed: CancellationToken::new(),
        pending_acks: Mutex::new(HashMap::new()),
    });

    let closed = conn.closed.clone();
    tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                debug!("Link write error: {e}");
                break;
            }
        }
        closed.cancel();
        let _ = sink.close().await;
    });

    let previous = shared.active.lock().replace(Arc::clone(&conn));
    if let Some(previous) = previous {
        previous.close();
    }

    info!("Link established with {peer}");
    let _ = shared.events.send(LinkEvent::PeerConnected(peer)).await;

    tokio::spawn(read_loop(Arc::clone(shared), conn, stream));
}

struct IncomingResource {
    name: String,
    path: PathBuf,
    file: File,
    size: u64,
    received: u64,
}

impl IncomingResource {
    async fn discard(self) {
        drop(self.file);
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            debug!("Cannot remove partial '{}': {e}", self.path.display());
        }
    }
}

async fn read_loop<S>(
    shared: Arc<Shared>,
    conn: Arc<PeerConnection>,
    mut stream: SplitStream<WebSocketStream<S>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer_id = conn.peer.id.clone();
    let mut incoming: HashMap<Uuid, IncomingResource> = HashMap::new();

    loop {
        let msg = tokio::select! {
            msg = stream.next() => msg,
            _ = conn.closed.cancelled() => break,
            _ = shared.shutdown.cancelled() => break,
        };
        let Some(msg) = msg else { break };

        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ControlFrame>(&text) {
                Ok(ControlFrame::Goodbye) => {
                    debug!("{} said goodbye", conn.peer);
                    break;
                }
                Ok(frame) => handle_control(&shared, &conn, &mut incoming, frame).await,
                Err(e) => warn!("Bad control frame from {}: {e}", conn.peer),
            },
            Ok(Message::Binary(data)) => match parse_binary(&data) {
                Some(BinaryFrame::Command(bytes)) => {
                    let event = LinkEvent::CommandReceived {
                        from: peer_id.clone(),
                        bytes: bytes.to_vec(),
                    };
                    if shared.events.send(event).await.is_err() {
                        break;
                    }
                }
                Some(BinaryFrame::Chunk { id, data }) => {
                    write_chunk(&conn, &mut incoming, id, data).await;
                }
                None => warn!("Unknown binary frame from {}", conn.peer),
            },
            Ok(Message::Close(_)) => {
                debug!("{} sent close", conn.peer);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("Read error from {}: {e}", conn.peer);
                break;
            }
        }
    }

    conn.close();
    // Dropping the ack senders fails every outgoing stream still waiting.
    conn.pending_acks.lock().clear();
    for (_, resource) in incoming.drain() {
        resource.discard().await;
    }

    let was_active = {
        let mut active = shared.active.lock();
        let is_this = active.as_ref().is_some_and(|c| Arc::ptr_eq(c, &conn));
        if is_this {
            *active = None;
        }
        is_this
    };

    // A replaced connection ends silently; its successor is already current.
    if was_active {
        info!("Link with {} closed", conn.peer);
        let _ = shared.events.send(LinkEvent::PeerDisconnected(peer_id)).await;
    }
}

async fn handle_control(
    shared: &Arc<Shared>,
    conn: &Arc<PeerConnection>,
    incoming: &mut HashMap<Uuid, IncomingResource>,
    frame: ControlFrame,
) {
    match frame {
        ControlFrame::ResourceStart { id, name, size } => {
            match open_incoming(&shared.settings.incoming_dir, &name).await {
                Ok((path, file)) => {
                    debug!("Receiving '{name}' ({size} bytes) from {}", conn.peer);
                    incoming.insert(
                        id,
                        IncomingResource {
                            name,
                            path,
                            file,
                            size,
                            received: 0,
                        },
                    );
                }
                Err(e) => {
                    warn!("Cannot store '{name}' from {}: {e}", conn.peer);
                    let _ = conn.send_frame(&ControlFrame::ResourceCancel { id }).await;
                }
            }
        }
        ControlFrame::ResourceEnd { id } => {
            let Some(mut resource) = incoming.remove(&id) else {
                trace!("End for unknown resource {id}");
                return;
            };
            let flushed = resource.file.flush().await;
            if let Err(e) = flushed {
                warn!("Cannot finish '{}': {e}", resource.name);
            } else if resource.received != resource.size {
                warn!(
                    "'{}' ended at {} of {} bytes",
                    resource.name, resource.received, resource.size
                );
            } else {
                let _ = conn.send_frame(&ControlFrame::ResourceAck { id }).await;
                info!("Received '{}' from {}", resource.name, conn.peer);
                let event = LinkEvent::ResourceReceived {
                    from: conn.peer.id.clone(),
                    name: resource.name,
                    path: resource.path,
                };
                let _ = shared.events.send(event).await;
                return;
            }
            resource.discard().await;
            let _ = conn.send_frame(&ControlFrame::ResourceCancel { id }).await;
        }
        ControlFrame::ResourceAck { id } => {
            let ack = conn.pending_acks.lock().remove(&id);
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
        }
        ControlFrame::ResourceCancel { id } => {
            if let Some(resource) = incoming.remove(&id) {
                debug!("{} cancelled '{}'", conn.peer, resource.name);
                resource.discard().await;
            }
            conn.pending_acks.lock().remove(&id);
        }
        ControlFrame::Invite { .. } | ControlFrame::Accept { .. } | ControlFrame::Reject { .. } => {
            debug!("Ignoring handshake frame from {} on established link", conn.peer);
        }
        ControlFrame::Goodbye => {}
    }
}

async fn write_chunk(
    conn: &Arc<PeerConnection>,
    incoming: &mut HashMap<Uuid, IncomingResource>,
    id: Uuid,
    data: &[u8],
) {
    let Some(resource) = incoming.get_mut(&id) else {
        trace!("Chunk for unknown resource {id}");
        return;
    };
    match resource.file.write_all(data).await {
        Ok(()) => resource.received += data.len() as u64,
        Err(e) => {
            warn!("Write to '{}' failed: {e}", resource.path.display());
            if let Some(resource) = incoming.remove(&id) {
                resource.discard().await;
            }
            let _ = conn.send_frame(&ControlFrame::ResourceCancel { id }).await;
        }
    }
}

async fn stream_resource(
    conn: Arc<PeerConnection>,
    id: Uuid,
    mut file: File,
    size: u64,
    chunk_size: usize,
    reporter: ResourceReporter,
    ack: oneshot::Receiver<()>,
) {
    let sent = tokio::select! {
        result = pump(&conn, id, &mut file, size, chunk_size, &reporter) => result,
        _ = reporter.cancel_token().cancelled() => {
            Err(NetworkError::Transport("cancelled by sender".to_string()))
        }
    };

    let delivered = match sent {
        Ok(()) => tokio::select! {
            ack = ack => ack.is_ok(),
            _ = reporter.cancel_token().cancelled() => false,
        },
        Err(e) => {
            debug!("Resource {id} not delivered: {e}");
            false
        }
    };

    if delivered {
        reporter.complete();
    } else {
        conn.pending_acks.lock().remove(&id);
        let _ = conn.send_frame(&ControlFrame::ResourceCancel { id }).await;
        reporter.cancelled();
    }
}

async fn pump(
    conn: &PeerConnection,
    id: Uuid,
    file: &mut File,
    size: u64,
    chunk_size: usize,
    reporter: &ResourceReporter,
) -> Result<(), NetworkError> {
    let mut buf = vec![0u8; chunk_size];
    let mut sent: u64 = 0;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        conn.send(chunk_frame(id, &buf[..n])).await?;
        sent += n as u64;
        if size > 0 {
            reporter.progress(sent as f64 / size as f64);
        }
    }
    conn.send_frame(&ControlFrame::ResourceEnd { id }).await
}

async fn open_incoming(dir: &Path, name: &str) -> std::io::Result<(PathBuf, File)> {
    tokio::fs::create_dir_all(dir).await?;
    let path = unique_path(dir, &sanitize_name(name));
    let file = File::create(&path).await?;
    Ok((path, file))
}

/// The final path component of a remote-supplied name.
pub fn sanitize_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "resource".to_string())
}

/// `dir/name`, or `dir/stem (n).ext` if that already exists.
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let as_path = Path::new(name);
    let stem = as_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    let ext = as_path.extension().and_then(|e| e.to_str());
    (1u32..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;
    use crate::link::ResourceStatus;

    #[test]
    fn test_control_frame_wire_shape() {
        let frame = ControlFrame::Reject {
            reason: "busy".to_string(),
        };
        let Message::Text(text) = frame.to_message().unwrap() else {
            panic!("Expected a text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, serde_json::json!({"frame": "reject", "reason": "busy"}));

        let id = Uuid::new_v4();
        let start = ControlFrame::ResourceStart {
            id,
            name: "a.jpg".to_string(),
            size: 10,
        };
        let json = serde_json::to_string(&start).unwrap();
        assert_eq!(serde_json::from_str::<ControlFrame>(&json).unwrap(), start);
    }

    #[test]
    fn test_binary_frames() {
        let Message::Binary(cmd) = command_frame(br#"{"type":"submit"}"#) else {
            panic!("Expected a binary frame");
        };
        assert_eq!(cmd[0], COMMAND_TAG);
        assert_eq!(
            parse_binary(&cmd),
            Some(BinaryFrame::Command(br#"{"type":"submit"}"#))
        );

        let id = Uuid::new_v4();
        let Message::Binary(chunk) = chunk_frame(id, b"data") else {
            panic!("Expected a binary frame");
        };
        assert_eq!(parse_binary(&chunk), Some(BinaryFrame::Chunk { id, data: b"data" }));

        assert_eq!(parse_binary(&[]), None);
        assert_eq!(parse_binary(&[CHUNK_TAG, 1, 2, 3]), None);
        assert_eq!(parse_binary(&[0x7f, 1]), None);
    }

    #[test]
    fn test_sanitize_name_strips_directories() {
        assert_eq!(sanitize_name("IMG_0001.jpg"), "IMG_0001.jpg");
        assert_eq!(sanitize_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_name(".."), "resource");
        assert_eq!(sanitize_name(""), "resource");
    }

    #[test]
    fn test_unique_path_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique_path(dir.path(), "photo.jpg");
        assert_eq!(first, dir.path().join("photo.jpg"));

        std::fs::write(&first, b"x").unwrap();
        assert_eq!(unique_path(dir.path(), "photo.jpg"), dir.path().join("photo (1).jpg"));

        std::fs::write(dir.path().join("notes"), b"x").unwrap();
        assert_eq!(unique_path(dir.path(), "notes"), dir.path().join("notes (1)"));
    }

    async fn transport(
        name: &str,
        role: Role,
        incoming: &Path,
    ) -> (WsTransport, mpsc::Receiver<LinkEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let local = PeerDescriptor::new(PeerId::generate(), name, role);
        let settings = TransportSettings {
            connection_timeout: Duration::from_secs(5),
            chunk_size: 4,
            incoming_dir: incoming.to_path_buf(),
        };
        let transport = WsTransport::bind("127.0.0.1:0".parse().unwrap(), local, settings, tx)
            .await
            .unwrap();
        (transport, rx)
    }

    async fn next_event(rx: &mut mpsc::Receiver<LinkEvent>) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for link event")
            .expect("event channel closed")
    }

    async fn connect_pair(
        mac: &WsTransport,
        mac_rx: &mut mpsc::Receiver<LinkEvent>,
        phone: &WsTransport,
        phone_rx: &mut mpsc::Receiver<LinkEvent>,
    ) {
        phone.invite(mac.local_addr(), mac.local().clone());
        match next_event(mac_rx).await {
            LinkEvent::Invitation { peer, reply } => {
                assert_eq!(peer.display_name, "iPhone");
                reply.send(InvitationDecision::Accept).unwrap();
            }
            other => panic!("Expected Invitation, got {other:?}"),
        }
        assert!(matches!(
            next_event(mac_rx).await,
            LinkEvent::PeerConnected(p) if p.display_name == "iPhone"
        ));
        assert!(matches!(
            next_event(phone_rx).await,
            LinkEvent::PeerConnected(p) if p.id == mac.local().id
        ));
    }

    #[tokio::test]
    async fn test_invite_accept_then_command_and_resource() {
        let dir = tempfile::tempdir().unwrap();
        let (mac, mut mac_rx) = transport("Studio", Role::Responder, &dir.path().join("mac")).await;
        let (phone, mut phone_rx) =
            transport("iPhone", Role::Initiator, &dir.path().join("phone")).await;

        connect_pair(&mac, &mut mac_rx, &phone, &mut phone_rx).await;
        assert_eq!(phone.active_peer().map(|p| p.display_name), Some("Studio".to_string()));

        phone.send_command(br#"{"type":"submit"}"#).await.unwrap();
        match next_event(&mut mac_rx).await {
            LinkEvent::CommandReceived { from, bytes } => {
                assert_eq!(from, phone.local().id);
                assert_eq!(bytes, br#"{"type":"submit"}"#);
            }
            other => panic!("Expected CommandReceived, got {other:?}"),
        }

        let src = dir.path().join("IMG_0001.jpg");
        std::fs::write(&src, b"hello pairlink photo").unwrap();
        let handle = phone.send_resource("IMG_0001.jpg", &src).await.unwrap();

        match next_event(&mut mac_rx).await {
            LinkEvent::ResourceReceived { name, path, .. } => {
                assert_eq!(name, "IMG_0001.jpg");
                assert_eq!(std::fs::read(&path).unwrap(), b"hello pairlink photo");
                assert!(path.starts_with(dir.path().join("mac")));
            }
            other => panic!("Expected ResourceReceived, got {other:?}"),
        }

        let mut status = handle.subscribe();
        let final_status = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = *status.borrow_and_update();
                if current.is_terminal() {
                    return current;
                }
                if status.changed().await.is_err() {
                    return *status.borrow();
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(final_status, ResourceStatus::Completed);

        phone.disconnect().await;
        assert!(matches!(
            next_event(&mut phone_rx).await,
            LinkEvent::PeerDisconnected(id) if id == mac.local().id
        ));
        assert!(matches!(
            next_event(&mut mac_rx).await,
            LinkEvent::PeerDisconnected(id) if id == phone.local().id
        ));
    }

    #[tokio::test]
    async fn test_disconnect_peer_only_closes_matching_link() {
        let dir = tempfile::tempdir().unwrap();
        let (mac, mut mac_rx) = transport("Studio", Role::Responder, &dir.path().join("mac")).await;
        let (phone, mut phone_rx) =
            transport("iPhone", Role::Initiator, &dir.path().join("phone")).await;
        connect_pair(&mac, &mut mac_rx, &phone, &mut phone_rx).await;

        assert!(!phone.disconnect_peer(&PeerId::from_string("someone-else")).await);
        assert_eq!(phone.active_peer().map(|p| p.id), Some(mac.local().id.clone()));

        assert!(phone.disconnect_peer(&mac.local().id).await);
        assert!(matches!(
            next_event(&mut phone_rx).await,
            LinkEvent::PeerDisconnected(id) if id == mac.local().id
        ));
        assert!(!phone.disconnect_peer(&mac.local().id).await);
    }

    #[tokio::test]
    async fn test_rejected_invite_reports_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let (mac, mut mac_rx) = transport("Studio", Role::Responder, dir.path()).await;
        let (phone, mut phone_rx) = transport("iPhone", Role::Initiator, dir.path()).await;

        phone.invite(mac.local_addr(), mac.local().clone());
        match next_event(&mut mac_rx).await {
            LinkEvent::Invitation { reply, .. } => {
                reply.send(InvitationDecision::Reject("busy".to_string())).unwrap();
            }
            other => panic!("Expected Invitation, got {other:?}"),
        }

        assert!(matches!(
            next_event(&mut phone_rx).await,
            LinkEvent::PeerDisconnected(id) if id == mac.local().id
        ));
        assert!(phone.active_peer().is_none());
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (phone, _rx) = transport("iPhone", Role::Initiator, dir.path()).await;

        assert!(matches!(
            phone.send_command(b"{}").await,
            Err(NetworkError::NotConnected)
        ));
        let src = dir.path().join("a.jpg");
        std::fs::write(&src, b"x").unwrap();
        assert!(matches!(
            phone.send_resource("a.jpg", &src).await,
            Err(NetworkError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_remote_drop_cancels_outgoing_resource() {
        let dir = tempfile::tempdir().unwrap();
        let (mac, mut mac_rx) = transport("Studio", Role::Responder, &dir.path().join("mac")).await;
        let (phone, mut phone_rx) =
            transport("iPhone", Role::Initiator, &dir.path().join("phone")).await;
        connect_pair(&mac, &mut mac_rx, &phone, &mut phone_rx).await;

        let src = dir.path().join("big.bin");
        std::fs::write(&src, vec![7u8; 64 * 1024]).unwrap();
        let handle = phone.send_resource("big.bin", &src).await.unwrap();
        mac.shutdown().await;

        let mut status = handle.subscribe();
        let final_status = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = *status.borrow_and_update();
                if current.is_terminal() {
                    return current;
                }
                if status.changed().await.is_err() {
                    return *status.borrow();
                }
            }
        })
        .await
        .unwrap();
        // The receiver may have acked before shutting down on a fast machine.
        assert!(final_status.is_terminal());
        assert!(matches!(
            next_event(&mut phone_rx).await,
            LinkEvent::PeerDisconnected(_)
        ));
    }
}
