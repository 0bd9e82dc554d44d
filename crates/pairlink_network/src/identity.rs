//! Peer identity: device identification, roles and persistence.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;

use serde::{Deserialize, Serialize};

/// A unique identifier for a device on the link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generate a new random peer ID (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Create a PeerId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the pairing a device plays.
///
/// The serialized name is the role attribute carried in discovery
/// announcements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The device that drives input and sends photos (typically the phone).
    Initiator,
    /// The device that receives commands and photos (typically the desktop).
    Responder,
}

impl Role {
    /// The complementary role.
    pub fn opposite(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }

    /// The advertisement attribute string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiator => "initiator",
            Self::Responder => "responder",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of a discovered (or local) device.
///
/// Equality and hashing use `id` only: two devices may share a display name,
/// and a device keeps its identity if it renames itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub id: PeerId,
    pub display_name: String,
    pub role: Role,
}

impl PeerDescriptor {
    pub fn new(id: PeerId, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            role,
        }
    }
}

impl PartialEq for PeerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerDescriptor {}

impl Hash for PeerDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}

/// The persistent identity of this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Unique peer identifier, stable across restarts.
    pub peer_id: PeerId,
    /// Human-readable name shown to the other device.
    pub name: String,
    /// Role this device plays.
    pub role: Role,
    /// Software version string.
    pub version: String,
}

impl DeviceIdentity {
    /// Create a new identity with a fresh PeerId.
    pub fn generate(name: impl Into<String>, role: Role) -> Self {
        Self {
            peer_id: PeerId::generate(),
            name: name.into(),
            role,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// The descriptor other devices will see for us.
    pub fn descriptor(&self) -> PeerDescriptor {
        PeerDescriptor::new(self.peer_id.clone(), self.name.clone(), self.role)
    }

    /// Save the identity to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize identity: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write identity file: {e}"))
    }

    /// Load an identity from a JSON file, or generate a new one if the file
    /// does not exist. The stored id is kept while `name` and `role` follow
    /// the current configuration.
    pub fn load_or_generate(path: &Path, name: impl Into<String>, role: Role) -> Self {
        let name = name.into();
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<DeviceIdentity>(&data) {
                    Ok(mut identity) => {
                        if identity.name != name || identity.role != role {
                            identity.name = name;
                            identity.role = role;
                            if let Err(e) = identity.save_to_file(path) {
                                tracing::warn!("Failed to update identity file: {e}");
                            }
                        }
                        return identity;
                    }
                    Err(e) => {
                        tracing::warn!("Corrupt identity file, generating new: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read identity file, generating new: {e}");
                }
            }
        }

        let identity = Self::generate(name, role);
        if let Err(e) = identity.save_to_file(path) {
            tracing::warn!("Failed to persist new identity: {e}");
        }
        identity
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_peer_id_generation() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }

    #[test]
    fn test_role_opposite_and_attribute() {
        assert_eq!(Role::Initiator.opposite(), Role::Responder);
        assert_eq!(Role::Responder.opposite(), Role::Initiator);
        assert_eq!(serde_json::to_string(&Role::Initiator).unwrap(), "\"initiator\"");
        assert_eq!(Role::Responder.to_string(), "responder");
    }

    #[test]
    fn test_descriptor_identity_ignores_display_name() {
        let id = PeerId::from_string("device-1");
        let a = PeerDescriptor::new(id.clone(), "Kitchen iPad", Role::Initiator);
        let b = PeerDescriptor::new(id, "Renamed iPad", Role::Initiator);
        let c = PeerDescriptor::new(
            PeerId::from_string("device-2"),
            "Kitchen iPad",
            Role::Initiator,
        );

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_identity_save_load_keeps_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let original = DeviceIdentity::generate("studio-mac", Role::Responder);
        original.save_to_file(&path).unwrap();

        let loaded = DeviceIdentity::load_or_generate(&path, "studio-mac", Role::Responder);
        assert_eq!(loaded.peer_id, original.peer_id);
        assert_eq!(loaded.name, "studio-mac");
    }

    #[test]
    fn test_identity_load_follows_renamed_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let original = DeviceIdentity::generate("old-name", Role::Responder);
        original.save_to_file(&path).unwrap();

        let loaded = DeviceIdentity::load_or_generate(&path, "new-name", Role::Initiator);
        assert_eq!(loaded.peer_id, original.peer_id);
        assert_eq!(loaded.name, "new-name");
        assert_eq!(loaded.role, Role::Initiator);
    }

    #[test]
    fn test_identity_load_missing_generates_new() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("identity.json");

        let identity = DeviceIdentity::load_or_generate(&path, "fresh", Role::Initiator);
        assert_eq!(identity.name, "fresh");
        assert!(path.exists());
    }
}
