//! Stable 128-bit peer identity

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::protocol::UUID_BYTE_LENGTH;

/// Identifier of one running engine instance.
///
/// Sent as 16 raw bytes in the connection handshake and as its hyphenated
/// string form everywhere else (sync logs, discovery announcements).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn from_bytes(bytes: [u8; UUID_BYTE_LENGTH]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; UUID_BYTE_LENGTH] {
        self.0.as_bytes()
    }

    /// Read the id stored at `path`, generating and persisting a new one if
    /// the file does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.is_file() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read peer id from {}", path.display()))?;
            return raw
                .trim()
                .parse()
                .with_context(|| format!("invalid peer id in {}", path.display()));
        }

        let id = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        std::fs::write(path, id.to_string())
            .with_context(|| format!("write peer id to {}", path.display()))?;
        Ok(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0.hyphenated())
    }
}

impl FromStr for PeerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0.hyphenated())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_parse_round_trip() {
        let id = PeerId::generate();
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(PeerId::from_bytes(*id.as_bytes()), id);
    }

    #[test]
    fn test_load_or_create_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("conf/peer_id");

        let first = PeerId::load_or_create(&path).unwrap();
        assert!(path.is_file());
        let second = PeerId::load_or_create(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rejects_garbage_id_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("peer_id");
        std::fs::write(&path, "not-a-uuid").unwrap();
        assert!(PeerId::load_or_create(&path).is_err());
    }
}
