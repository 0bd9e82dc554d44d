//! Pairlink Core: on-disk layout, configuration, logging and session
//! persistence shared by the pairlink binaries.

pub mod config;
pub mod logging;
pub mod session;

pub use config::PairlinkConfig;
pub use session::{JsonPeerMemory, SessionState};
