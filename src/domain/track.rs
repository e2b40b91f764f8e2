use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{aggregate::AggregateKind, hash::TrackId, reference::Reference};

/// Tag bag read from a music file.
///
/// Only `album`, `albumartist` and `artists` drive grouping; everything else
/// is carried along untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackTags {
    pub album: Option<String>,
    pub albumartist: Option<String>,
    #[serde(default)]
    pub artists: Vec<String>,
    pub title: Option<String>,
    pub year: Option<i32>,
    pub duration: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Track as handed over by the tag reader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackInput {
    pub path: PathBuf,
    #[serde(default)]
    pub tags: TrackTags,
    #[serde(default)]
    pub media: Option<String>,
}

/// Represent a music track
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Track {
    pub id: TrackId,
    pub path: PathBuf,
    pub tags: TrackTags,
    pub album_ref: Reference,
    pub artist_refs: Vec<Reference>,
    pub media: Option<String>,
}

impl Track {
    pub fn from_input(input: TrackInput) -> Self {
        let album_ref = Reference::from_tag(input.tags.album.as_deref());
        let artist_refs = artist_refs(&input.tags);
        Self {
            id: TrackId::from_path(&input.path),
            path: input.path,
            tags: input.tags,
            album_ref,
            artist_refs,
            media: input.media,
        }
    }

    /// references this track holds for one aggregate kind
    ///
    /// Playlists are explicit lists, so tracks never point at them.
    pub fn references(&self, kind: AggregateKind) -> &[Reference] {
        match kind {
            AggregateKind::Album => std::slice::from_ref(&self.album_ref),
            AggregateKind::Artist => &self.artist_refs,
            AggregateKind::Playlist => &[],
        }
    }
}

/// One reference per distinct artist (by id), in tag order.
/// Falls back to the album artist, then to the unknown artist.
fn artist_refs(tags: &TrackTags) -> Vec<Reference> {
    let mut refs: Vec<Reference> = Vec::new();
    for name in &tags.artists {
        let reference = Reference::from_tag(Some(name));
        if reference.is_unknown() || refs.iter().any(|r| r.id == reference.id) {
            continue;
        }
        refs.push(reference);
    }

    if refs.is_empty() {
        refs.push(Reference::from_tag(tags.albumartist.as_deref()));
    }
    refs
}

/// State of one track before and after a store mutation.
///
/// `previous` is `None` for a track the store did not know about,
/// `current` is `None` for a track that was just removed.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackDiff {
    pub id: TrackId,
    pub current: Option<Track>,
    pub previous: Option<Track>,
}

impl TrackDiff {
    pub fn saved(current: Track, previous: Option<Track>) -> Self {
        Self {
            id: current.id,
            current: Some(current),
            previous,
        }
    }

    pub fn removed(previous: Track) -> Self {
        Self {
            id: previous.id,
            current: None,
            previous: Some(previous),
        }
    }

    pub fn is_new(&self) -> bool {
        self.previous.is_none()
    }
}
