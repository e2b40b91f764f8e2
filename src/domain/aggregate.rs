use std::{collections::HashSet, fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use super::hash::{AggregateId, TrackId, UNKNOWN_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateKind {
    Album,
    Artist,
    Playlist,
}

impl AggregateKind {
    pub const ALL: [AggregateKind; 3] = [Self::Album, Self::Artist, Self::Playlist];

    /// kinds grouped from track tags, as opposed to explicit lists
    pub const DERIVED: [AggregateKind; 2] = [Self::Album, Self::Artist];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Album => "album",
            Self::Artist => "artist",
            Self::Playlist => "playlist",
        }
    }

    pub fn is_derived(&self) -> bool {
        !matches!(self, Self::Playlist)
    }
}

impl Display for AggregateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "album" | "albums" => Ok(Self::Album),
            "artist" | "artists" => Ok(Self::Artist),
            "playlist" | "playlists" => Ok(Self::Playlist),
            other => Err(anyhow::anyhow!("unknown aggregate kind '{other}'")),
        }
    }
}

/// Persisted album, artist or playlist
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregate {
    pub kind: AggregateKind,
    pub id: AggregateId,
    pub name: Option<String>,
    pub media: Option<String>,
    pub track_ids: Vec<TrackId>,
}

impl Aggregate {
    pub fn empty(kind: AggregateKind, id: AggregateId) -> Self {
        Self {
            kind,
            id,
            name: None,
            media: None,
            track_ids: Vec::new(),
        }
    }

    /// the "unknown" album/artist, kept even when it has no tracks
    pub fn is_sentinel(&self) -> bool {
        self.kind.is_derived() && self.id == UNKNOWN_ID
    }

    /// Applies a mutation on top of this aggregate.
    ///
    /// Existing track order is kept, new ids go to the end, removed ids win
    /// over added ones and no id is listed twice. Name and media are kept
    /// unless the mutation provides them.
    pub fn merge(self, mutation: &Mutation) -> Self {
        let removed: HashSet<&TrackId> = mutation.removed_track_ids.iter().collect();
        let mut seen: HashSet<TrackId> = HashSet::new();

        let track_ids = self
            .track_ids
            .iter()
            .chain(&mutation.track_ids)
            .filter(|id| !removed.contains(id))
            .filter(|id| seen.insert(**id))
            .copied()
            .collect();

        Self {
            kind: self.kind,
            id: self.id,
            name: mutation.name.clone().or(self.name),
            media: mutation.media.clone().or(self.media),
            track_ids,
        }
    }
}

/// Change request for one aggregate: ids to append and ids to drop.
///
/// Never persisted as such; the store merges it into an [`Aggregate`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Mutation {
    pub id: AggregateId,
    pub name: Option<String>,
    pub media: Option<String>,
    pub track_ids: Vec<TrackId>,
    pub removed_track_ids: Vec<TrackId>,
}

impl Mutation {
    pub fn new(id: AggregateId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.name.is_none()
            && self.media.is_none()
            && self.track_ids.is_empty()
            && self.removed_track_ids.is_empty()
    }
}
