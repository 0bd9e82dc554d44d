//! Pairlink Network: local peer pairing and remote input.
//!
//! This crate lets a phone-style *initiator* drive a desktop-style
//! *responder* on the same LAN: the two devices discover each other, pair
//! over a single link, and exchange small input commands plus streamed
//! photo batches.
//!
//! # Architecture
//!
//! - **Discovery**: UDP broadcast announcements, filtered by role.
//! - **Transport**: one WebSocket (via `tokio-tungstenite`) per pairing,
//!   carrying JSON control frames, command payloads and file chunks.
//! - **Node**: a single task owning the connection state machine. The
//!   reconnect supervisor and the transfer coordinator talk to it
//!   through a [`NodeHandle`].
//! - **Dispatch**: the receiving side turns commands into simulated input.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pairlink_network::{LanBackend, NetworkConfig, PairNode};
//! use pairlink_network::identity::{DeviceIdentity, Role};
//!
//! # async fn example() {
//! let identity = DeviceIdentity::generate("my-phone", Role::Initiator);
//! let config = NetworkConfig::default();
//! let backend = Arc::new(LanBackend::new(config.clone()));
//! let (node, mut events) = PairNode::new(identity, config, backend).spawn();
//!
//! node.start().await.unwrap();
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # }
//! ```

pub mod command;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod lan;
pub mod link;
pub mod memory;
pub mod node;
pub mod peer;
pub mod reconnect;
pub mod state;
pub mod transfer;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use command::Command;
pub use config::{NetworkConfig, ReconnectPolicy, RoleFilter, TransferPolicy};
pub use dispatch::{CommandDispatcher, InputError, InputSimulator};
pub use error::NetworkError;
pub use identity::{DeviceIdentity, PeerDescriptor, PeerId, Role};
pub use lan::LanBackend;
pub use memory::PeerMemory;
pub use node::{NodeEvent, NodeHandle, PairNode};
pub use state::{ConnectionSnapshot, ConnectionState};
pub use transfer::{BatchReport, BatchResult, TransferCoordinator, TransferSource};
