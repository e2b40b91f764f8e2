use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
};

use log::debug;
use rusqlite::{Connection, Row, params, params_from_iter};

use crate::{
    domain::{
        hash::TrackId,
        reference::Reference,
        track::{Track, TrackDiff, TrackInput},
    },
    storage::{
        db::{self, MAX_BATCH, SharedConnection, placeholders, record_update},
        encoding::{decode, encode},
        error::StorageError,
        schema::{columns::*, tables::*},
    },
};

/// Normalized track records, the source of truth every aggregate is
/// derived from.
#[derive(Clone)]
pub struct TrackStore {
    db: SharedConnection,
}

/// raw row, decoded into a [`Track`] outside of the rusqlite row closure
struct TrackRow {
    id: String,
    path: String,
    tags: String,
    album_id: i64,
    album_name: Option<String>,
    artist_refs: String,
    media: Option<String>,
}

fn select_columns() -> String {
    format!("{ID}, {PATH}, {TAGS}, {ALBUM_ID}, {ALBUM_NAME}, {ARTIST_REFS}, {MEDIA}")
}

impl TrackRow {
    fn read(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            path: row.get(1)?,
            tags: row.get(2)?,
            album_id: row.get(3)?,
            album_name: row.get(4)?,
            artist_refs: row.get(5)?,
            media: row.get(6)?,
        })
    }

    fn into_track(self) -> Result<Track, StorageError> {
        let id = TrackId::from_hex(&self.id).map_err(|e| StorageError::MalformedColumn {
            table: TRACKS,
            column: ID,
            reason: e.to_string(),
        })?;

        Ok(Track {
            id,
            path: PathBuf::from(self.path),
            tags: decode(TRACKS, TAGS, &self.tags)?,
            album_ref: Reference {
                id: self.album_id,
                name: self.album_name,
            },
            artist_refs: decode(TRACKS, ARTIST_REFS, &self.artist_refs)?,
            media: self.media,
        })
    }
}

/// reads tracks by id, in chunks, in no particular order
fn select_by_ids(conn: &Connection, ids: &[TrackId]) -> Result<Vec<Track>, StorageError> {
    let mut tracks = Vec::with_capacity(ids.len());

    for chunk in ids.chunks(MAX_BATCH) {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {TRACKS} WHERE {ID} IN ({})",
            select_columns(),
            placeholders(chunk.len())
        ))?;
        let rows = stmt
            .query_map(params_from_iter(chunk.iter().map(|id| id.to_hex())), TrackRow::read)?
            .collect::<Result<Vec<_>, _>>()?;

        for row in rows {
            tracks.push(row.into_track()?);
        }
    }

    Ok(tracks)
}

/// Reads the previous rows, then upserts the whole batch.
/// Must run inside the caller's transaction.
fn upsert(conn: &Connection, tracks: Vec<Track>) -> Result<Vec<TrackDiff>, StorageError> {
    let ids = tracks.iter().map(|t| t.id).collect::<Vec<_>>();
    let mut previous: HashMap<TrackId, Track> = select_by_ids(conn, &ids)?
        .into_iter()
        .map(|track| (track.id, track))
        .collect();

    {
        let mut stmt = conn.prepare_cached(&format!(
            "INSERT INTO {TRACKS} ({ID}, {PATH}, {TAGS}, {ALBUM_ID}, {ALBUM_NAME}, {ARTIST_REFS}, {MEDIA})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT({ID}) DO UPDATE SET
                {PATH} = excluded.{PATH},
                {TAGS} = excluded.{TAGS},
                {ALBUM_ID} = excluded.{ALBUM_ID},
                {ALBUM_NAME} = excluded.{ALBUM_NAME},
                {ARTIST_REFS} = excluded.{ARTIST_REFS},
                {MEDIA} = excluded.{MEDIA}"
        ))?;

        for track in &tracks {
            stmt.execute(params![
                track.id.to_hex(),
                track.path.to_string_lossy(),
                encode(&track.tags)?,
                track.album_ref.id,
                track.album_ref.name,
                encode(&track.artist_refs)?,
                track.media,
            ])?;
        }
    }

    record_update(conn)?;

    Ok(tracks
        .into_iter()
        .map(|current| {
            let before = previous.remove(&current.id);
            TrackDiff::saved(current, before)
        })
        .collect())
}

/// keeps the last occurrence of every id, in order of those occurrences
fn dedup_last_wins(tracks: Vec<Track>) -> Vec<Track> {
    let mut seen = HashSet::new();
    let mut unique = tracks
        .into_iter()
        .rev()
        .filter(|track| seen.insert(track.id))
        .collect::<Vec<_>>();
    unique.reverse();
    unique
}

impl TrackStore {
    pub fn new(db: SharedConnection) -> Self {
        Self { db }
    }

    /// Persists a batch of scanned tracks in one transaction.
    ///
    /// Returns, per track, its new state and the exact row it replaced
    /// (`None` if the track is new).
    pub fn save(&self, inputs: Vec<TrackInput>) -> Result<Vec<TrackDiff>, StorageError> {
        let tracks = dedup_last_wins(inputs.into_iter().map(Track::from_input).collect());
        if tracks.is_empty() {
            return Ok(Vec::new());
        }

        let mut db = db::lock(&self.db)?;
        let tx = db.transaction()?;
        let diffs = upsert(&tx, tracks)?;
        tx.commit()?;

        debug!(
            "saved {} tracks ({} new)",
            diffs.len(),
            diffs.iter().filter(|d| d.is_new()).count()
        );
        Ok(diffs)
    }

    /// replaces the media path of an existing track
    pub fn set_media(
        &self,
        id: TrackId,
        media: Option<String>,
    ) -> Result<TrackDiff, StorageError> {
        let mut db = db::lock(&self.db)?;
        let tx = db.transaction()?;

        let mut track = select_by_ids(&tx, &[id])?
            .pop()
            .ok_or(StorageError::TrackNotFound(id))?;
        track.media = media;

        let diff = upsert(&tx, vec![track])?
            .pop()
            .ok_or(StorageError::TrackNotFound(id))?;
        tx.commit()?;
        Ok(diff)
    }

    /// Deletes tracks by id, returning the last known state of each one
    /// that existed. Unknown ids are ignored.
    pub fn remove_by_ids(&self, ids: &[TrackId]) -> Result<Vec<Track>, StorageError> {
        let mut db = db::lock(&self.db)?;
        let tx = db.transaction()?;

        let removed = select_by_ids(&tx, ids)?;
        if removed.is_empty() {
            return Ok(removed);
        }

        for chunk in ids.chunks(MAX_BATCH) {
            tx.execute(
                &format!(
                    "DELETE FROM {TRACKS} WHERE {ID} IN ({})",
                    placeholders(chunk.len())
                ),
                params_from_iter(chunk.iter().map(|id| id.to_hex())),
            )?;
        }
        record_update(&tx)?;
        tx.commit()?;

        debug!("removed {} tracks", removed.len());
        Ok(order_like(removed, ids))
    }

    pub fn get(&self, id: TrackId) -> Result<Option<Track>, StorageError> {
        Ok(self.get_by_ids(&[id])?.pop())
    }

    /// existing tracks among `ids`, in the order of `ids`
    pub fn get_by_ids(&self, ids: &[TrackId]) -> Result<Vec<Track>, StorageError> {
        let db = db::lock(&self.db)?;
        let tracks = select_by_ids(&db, ids)?;
        Ok(order_like(tracks, ids))
    }

    pub fn list(&self) -> Result<Vec<Track>, StorageError> {
        let db = db::lock(&self.db)?;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM {TRACKS} ORDER BY {PATH}",
            select_columns()
        ))?;
        let rows = stmt
            .query_map([], TrackRow::read)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(TrackRow::into_track).collect()
    }

    pub fn count(&self) -> Result<usize, StorageError> {
        let db = db::lock(&self.db)?;
        let count: i64 = db.query_row(&format!("SELECT COUNT(*) FROM {TRACKS}"), [], |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }
}

fn order_like(tracks: Vec<Track>, ids: &[TrackId]) -> Vec<Track> {
    let mut by_id: HashMap<TrackId, Track> =
        tracks.into_iter().map(|track| (track.id, track)).collect();
    ids.iter().filter_map(|id| by_id.remove(id)).collect()
}
