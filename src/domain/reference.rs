use serde::{Deserialize, Serialize};

use super::hash::{AggregateId, UNKNOWN_ID, reference_id};

/// (id, display name) pair pointing from a track to the album or artist it
/// belongs to. Two references name the same aggregate iff their ids match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub id: AggregateId,
    pub name: Option<String>,
}

impl Reference {
    pub fn unknown() -> Self {
        Self {
            id: UNKNOWN_ID,
            name: None,
        }
    }

    /// reference for a tag value, falling back to [`Reference::unknown`] for
    /// missing or blank tags
    pub fn from_tag(tag: Option<&str>) -> Self {
        match tag.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) => Self {
                id: reference_id(name),
                name: Some(name.to_string()),
            },
            None => Self::unknown(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.id == UNKNOWN_ID
    }
}
