//! Entity identifier.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Width of an entity key on disk.
pub const ENTITY_ID_LEN: usize = 16;

/// Opaque 16-byte key of an entity.
///
/// Keys are supplied by the caller or generated by the engine as random
/// UUIDs. The engine never interprets them beyond equality and ordering.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Creates an entity ID from raw bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; ENTITY_ID_LEN]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Generates a new random entity ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the raw bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ENTITY_ID_LEN] {
        self.0.as_bytes()
    }

    /// Reads an entity ID from a slice.
    ///
    /// Returns `None` unless the slice is exactly 16 bytes.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        <[u8; ENTITY_ID_LEN]>::try_from(slice)
            .ok()
            .map(Self::from_bytes)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for EntityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for EntityId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<EntityId> for Uuid {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl From<[u8; ENTITY_ID_LEN]> for EntityId {
    fn from(bytes: [u8; ENTITY_ID_LEN]) -> Self {
        Self::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_differ() {
        assert_ne!(EntityId::generate(), EntityId::generate());
    }

    #[test]
    fn bytes_roundtrip() {
        let bytes = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];
        let id = EntityId::from_bytes(bytes);
        assert_eq!(*id.as_bytes(), bytes);
        assert_eq!(EntityId::from_slice(&bytes), Some(id));
        assert!(EntityId::from_slice(&bytes[..15]).is_none());
    }

    #[test]
    fn parses_display_form() {
        let id = EntityId::generate();
        let parsed: EntityId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<EntityId>().is_err());
    }

    #[test]
    fn orders_by_bytes() {
        assert!(EntityId::from_bytes([0; 16]) < EntityId::from_bytes([1; 16]));
    }
}
