use std::{fmt::Display, path::Path};

use blake3::Hash;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Represents the track ID.
///
/// Derived from the track's file path, so re-scanning the same file
/// always lands on the same row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackId(pub Hash);

impl TrackId {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes))
    }

    pub fn from_path(path: &Path) -> Self {
        Self::from_bytes(path.to_string_lossy().as_bytes())
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    pub fn from_hex(hex: &str) -> Result<Self, blake3::HexError> {
        Ok(Self(Hash::from_hex(hex)?))
    }
}

impl Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_hex())
    }
}

impl Serialize for TrackId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TrackId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// Id of an album, artist or playlist row.
pub type AggregateId = i64;

/// Id of the "unknown" album/artist every untagged track falls into.
pub const UNKNOWN_ID: AggregateId = 1;

/// stable id for a grouping name, case-insensitive
///
/// The top bit is cleared so ids stay positive, and the reserved range
/// (`0` and [`UNKNOWN_ID`]) is never produced.
pub fn reference_id(name: &str) -> AggregateId {
    let hash = blake3::hash(name.trim().to_lowercase().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    let id = (u64::from_le_bytes(bytes) >> 1) as i64;
    id.max(UNKNOWN_ID + 1)
}
