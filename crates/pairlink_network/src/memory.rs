//! Last-known peer persistence seam.

use parking_lot::Mutex;

/// Stores the display name of the most recently connected peer.
///
/// Read once when a node starts (to seed the reconnect supervisor) and
/// written on every successful connection.
pub trait PeerMemory: Send + Sync {
    fn load(&self) -> Option<String>;
    fn remember(&self, peer_name: &str);
}

/// Process-local memory, forgotten on exit.
#[derive(Debug, Default)]
pub struct InMemoryPeerMemory {
    name: Mutex<Option<String>>,
}

impl InMemoryPeerMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: Mutex::new(Some(name.into())),
        }
    }
}

impl PeerMemory for InMemoryPeerMemory {
    fn load(&self) -> Option<String> {
        self.name.lock().clone()
    }

    fn remember(&self, peer_name: &str) {
        *self.name.lock() = Some(peer_name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_remembers_latest() {
        let memory = InMemoryPeerMemory::new();
        assert!(memory.load().is_none());
        memory.remember("Studio");
        memory.remember("Laptop");
        assert_eq!(memory.load().as_deref(), Some("Laptop"));
        assert_eq!(InMemoryPeerMemory::with_name("Studio").load().as_deref(), Some("Studio"));
    }
}
