use std::time::Duration;

use log::{debug, info};
use rand::Rng;

use crate::{
    broadcast::{BroadcastSink, Broadcaster, Notification, SubscriptionId},
    config::Config,
    domain::{
        aggregate::{Aggregate, AggregateKind, Mutation},
        hash::{AggregateId, TrackId, UNKNOWN_ID},
        track::{Track, TrackDiff, TrackInput},
    },
    engine::{differ::membership_events, grouping::group},
    storage::{
        aggregates::{AggregateSave, AggregateStore},
        db::{self, SecondsSinceUnix, SharedConnection},
        error::StorageError,
        tracks::TrackStore,
    },
};

/// What one [`Library::add`] or [`Library::remove`] call persisted
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChangeReport {
    /// tracks saved or removed
    pub tracks: Vec<TrackId>,
    pub albums: AggregateSave,
    pub artists: AggregateSave,
    pub playlists: AggregateSave,
}

/// The library: tracks plus the albums, artists and playlists kept in step
/// with them, and the broadcaster announcing every committed change.
pub struct Library {
    db: SharedConnection,
    tracks: TrackStore,
    albums: AggregateStore,
    artists: AggregateStore,
    playlists: AggregateStore,
    broadcaster: Broadcaster,
}

impl Library {
    pub fn open(config: &Config) -> Result<Self, StorageError> {
        let db = db::share(db::open(&config.database)?);
        Ok(Self::from_existing_conn(db, config.broadcast.batch_window()))
    }

    pub fn from_existing_conn(db: SharedConnection, batch_window: Duration) -> Self {
        Self {
            tracks: TrackStore::new(db.clone()),
            albums: AggregateStore::new(db.clone(), AggregateKind::Album),
            artists: AggregateStore::new(db.clone(), AggregateKind::Artist),
            playlists: AggregateStore::new(db.clone(), AggregateKind::Playlist),
            broadcaster: Broadcaster::start(batch_window),
            db,
        }
    }

    pub fn tracks(&self) -> &TrackStore {
        &self.tracks
    }

    pub fn store(&self, kind: AggregateKind) -> &AggregateStore {
        match kind {
            AggregateKind::Album => &self.albums,
            AggregateKind::Artist => &self.artists,
            AggregateKind::Playlist => &self.playlists,
        }
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn subscribe(&self, sink: impl BroadcastSink + 'static) -> SubscriptionId {
        self.broadcaster.subscribe(sink)
    }

    /// dispatches pending notifications now
    pub fn flush(&self) {
        self.broadcaster.flush()
    }

    pub fn last_update(&self) -> Result<Option<SecondsSinceUnix>, StorageError> {
        let conn = db::lock(&self.db)?;
        db::last_update(&conn)
    }

    /// Saves scanned tracks and brings albums and artists up to date.
    ///
    /// The album and artist pipelines commit independently: if one fails,
    /// its error is returned as [`StorageError::Pipeline`] while the other
    /// kind's changes stay committed and announced.
    pub fn add(&self, inputs: Vec<TrackInput>) -> Result<ChangeReport, StorageError> {
        let diffs = self.tracks.save(inputs)?;
        if diffs.is_empty() {
            return Ok(ChangeReport::default());
        }

        for track in diffs.iter().filter_map(|diff| diff.current.as_ref()) {
            self.broadcaster
                .publish(Notification::TrackChanged(track.clone()));
        }

        let (albums, artists) = rayon::join(
            || self.run_kind(&self.albums, &diffs),
            || self.run_kind(&self.artists, &diffs),
        );

        let report = ChangeReport {
            tracks: diffs.iter().map(|diff| diff.id).collect(),
            albums: albums?,
            artists: artists?,
            playlists: AggregateSave::default(),
        };
        info!(
            "added {} tracks: {} albums, {} artists touched",
            report.tracks.len(),
            report.albums.saved.len() + report.albums.removed_ids.len(),
            report.artists.saved.len() + report.artists.removed_ids.len()
        );
        Ok(report)
    }

    /// Removes tracks and drops them from every album, artist and playlist.
    /// Unknown ids are ignored.
    pub fn remove(&self, ids: &[TrackId]) -> Result<ChangeReport, StorageError> {
        let removed = self.tracks.remove_by_ids(ids)?;
        if removed.is_empty() {
            return Ok(ChangeReport::default());
        }

        let removed_ids: Vec<TrackId> = removed.iter().map(|track| track.id).collect();
        for id in &removed_ids {
            self.broadcaster.publish(Notification::TrackRemoved(*id));
        }

        let diffs: Vec<TrackDiff> = removed.into_iter().map(TrackDiff::removed).collect();
        let (albums, (artists, playlists)) = rayon::join(
            || self.run_kind(&self.albums, &diffs),
            || {
                rayon::join(
                    || self.run_kind(&self.artists, &diffs),
                    || self.detach_from_playlists(&removed_ids),
                )
            },
        );

        let report = ChangeReport {
            tracks: removed_ids,
            albums: albums?,
            artists: artists?,
            playlists: playlists?,
        };
        info!(
            "removed {} tracks: {} albums, {} artists, {} playlists emptied",
            report.tracks.len(),
            report.albums.removed_ids.len(),
            report.artists.removed_ids.len(),
            report.playlists.removed_ids.len()
        );
        Ok(report)
    }

    /// differ, grouping and store for one derived kind
    fn run_kind(
        &self,
        store: &AggregateStore,
        diffs: &[TrackDiff],
    ) -> Result<AggregateSave, StorageError> {
        let kind = store.kind();
        let mutations = group(diffs.iter().flat_map(|diff| membership_events(diff, kind)));
        debug!("{kind}: {} mutations", mutations.len());

        let outcome = store.save(mutations).map_err(|source| pipeline(kind, source))?;
        self.announce(kind, &outcome);
        Ok(outcome)
    }

    fn detach_from_playlists(&self, track_ids: &[TrackId]) -> Result<AggregateSave, StorageError> {
        let outcome = self
            .playlists
            .detach_tracks(track_ids)
            .map_err(|source| pipeline(AggregateKind::Playlist, source))?;
        self.announce(AggregateKind::Playlist, &outcome);
        Ok(outcome)
    }

    /// changes first, then removals
    fn announce(&self, kind: AggregateKind, outcome: &AggregateSave) {
        for aggregate in &outcome.saved {
            self.broadcaster
                .publish(Notification::AggregateChanged(aggregate.clone()));
        }
        for id in &outcome.removed_ids {
            self.broadcaster
                .publish(Notification::AggregateRemoved { kind, id: *id });
        }
    }

    /// Replaces the media path of a track. Memberships are unaffected.
    pub fn set_track_media(
        &self,
        id: TrackId,
        media: Option<String>,
    ) -> Result<Track, StorageError> {
        let track = self
            .tracks
            .set_media(id, media)?
            .current
            .ok_or(StorageError::TrackNotFound(id))?;
        self.broadcaster
            .publish(Notification::TrackChanged(track.clone()));
        Ok(track)
    }

    /// Sets or clears the cover of an album or playlist, or an artist's
    /// avatar.
    pub fn set_cover(
        &self,
        kind: AggregateKind,
        id: AggregateId,
        media: Option<String>,
    ) -> Result<Aggregate, StorageError> {
        let aggregate = self.store(kind).set_media(id, media)?;
        self.broadcaster
            .publish(Notification::AggregateChanged(aggregate.clone()));
        Ok(aggregate)
    }

    fn require_tracks(&self, ids: &[TrackId]) -> Result<(), StorageError> {
        let found = self.tracks.get_by_ids(ids)?;
        match ids
            .iter()
            .find(|id| !found.iter().any(|track| track.id == **id))
        {
            Some(missing) => Err(StorageError::TrackNotFound(*missing)),
            None => Ok(()),
        }
    }

    fn require_playlist(&self, id: AggregateId) -> Result<Aggregate, StorageError> {
        self.playlists
            .get(id)?
            .ok_or(StorageError::AggregateNotFound {
                kind: AggregateKind::Playlist,
                id,
            })
    }

    fn free_playlist_id(&self) -> Result<AggregateId, StorageError> {
        let mut rng = rand::rng();
        loop {
            let id = rng.random_range(UNKNOWN_ID + 1..AggregateId::MAX);
            if self.playlists.get(id)?.is_none() {
                return Ok(id);
            }
        }
    }

    /// Saves a playlist mutation, returning the playlist as stored after it,
    /// or `None` if it lost its last track.
    fn save_playlist(&self, mutation: Mutation) -> Result<Option<Aggregate>, StorageError> {
        let id = mutation.id;
        let mut outcome = self.playlists.save(vec![mutation])?;
        self.announce(AggregateKind::Playlist, &outcome);

        if outcome.removed_ids.contains(&id) {
            return Ok(None);
        }
        match outcome.saved.pop() {
            Some(playlist) => Ok(Some(playlist)),
            // nothing changed
            None => self.playlists.get(id),
        }
    }

    pub fn create_playlist(
        &self,
        name: &str,
        track_ids: &[TrackId],
    ) -> Result<Aggregate, StorageError> {
        if track_ids.is_empty() {
            return Err(StorageError::EmptyPlaylist);
        }
        self.require_tracks(track_ids)?;

        let id = self.free_playlist_id()?;
        let playlist = self
            .save_playlist(Mutation {
                name: Some(name.to_string()),
                track_ids: track_ids.to_vec(),
                ..Mutation::new(id)
            })?
            .ok_or(StorageError::EmptyPlaylist)?;
        info!("created playlist {id} with {} tracks", playlist.track_ids.len());
        Ok(playlist)
    }

    /// Appends tracks to a playlist; ids already listed keep their position.
    pub fn add_to_playlist(
        &self,
        id: AggregateId,
        track_ids: &[TrackId],
    ) -> Result<Aggregate, StorageError> {
        let existing = self.require_playlist(id)?;
        self.require_tracks(track_ids)?;

        let saved = self.save_playlist(Mutation {
            track_ids: track_ids.to_vec(),
            ..Mutation::new(id)
        })?;
        Ok(saved.unwrap_or(existing))
    }

    /// Drops tracks from a playlist. Returns `None` if that emptied and
    /// deleted it.
    pub fn remove_from_playlist(
        &self,
        id: AggregateId,
        track_ids: &[TrackId],
    ) -> Result<Option<Aggregate>, StorageError> {
        self.require_playlist(id)?;
        self.save_playlist(Mutation {
            removed_track_ids: track_ids.to_vec(),
            ..Mutation::new(id)
        })
    }

    pub fn rename_playlist(&self, id: AggregateId, name: &str) -> Result<Aggregate, StorageError> {
        let existing = self.require_playlist(id)?;
        let saved = self.save_playlist(Mutation {
            name: Some(name.to_string()),
            ..Mutation::new(id)
        })?;
        Ok(saved.unwrap_or(existing))
    }

    /// Returns whether the playlist existed.
    pub fn delete_playlist(&self, id: AggregateId) -> Result<bool, StorageError> {
        let deleted = self.playlists.remove(id)?;
        if deleted {
            self.broadcaster.publish(Notification::AggregateRemoved {
                kind: AggregateKind::Playlist,
                id,
            });
        }
        Ok(deleted)
    }
}

fn pipeline(kind: AggregateKind, source: StorageError) -> StorageError {
    StorageError::Pipeline {
        kind,
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use crossbeam::channel::Receiver;

    use super::*;
    use crate::{
        broadcast::Dispatch,
        config::Database,
        domain::{reference::Reference, track::TrackTags},
    };

    fn setup_library() -> anyhow::Result<(Library, Receiver<Dispatch>)> {
        let db = db::share(db::open(&Database::in_memory())?);
        let library = Library::from_existing_conn(db, Duration::from_secs(10));
        let (_, rx) = library.broadcaster().subscribe_channel();
        Ok((library, rx))
    }

    fn input(path: &str, album: Option<&str>, artists: &[&str]) -> TrackInput {
        TrackInput {
            path: path.into(),
            tags: TrackTags {
                album: album.map(str::to_string),
                artists: artists.iter().map(|a| a.to_string()).collect(),
                ..Default::default()
            },
            media: None,
        }
    }

    fn album_id(name: &str) -> AggregateId {
        Reference::from_tag(Some(name)).id
    }

    /// flushes and returns every dispatch received so far
    fn drain(library: &Library, rx: &Receiver<Dispatch>) -> Vec<Dispatch> {
        library.flush();
        rx.try_iter().collect()
    }

    fn types(dispatches: &[Dispatch]) -> Vec<&'static str> {
        dispatches.iter().map(|d| d.event_type.as_str()).collect()
    }

    #[test]
    fn test_add_creates_album_and_artists() -> anyhow::Result<()> {
        let (library, rx) = setup_library()?;

        let report = library.add(vec![input("/music/a.mp3", Some("A"), &["X", "Y"])])?;

        let track_id = report.tracks[0];
        assert_eq!(report.albums.created, vec![album_id("A")]);
        assert_eq!(report.artists.created.len(), 2);

        let album = library.store(AggregateKind::Album).get(album_id("A"))?.unwrap();
        assert_eq!(album.track_ids, vec![track_id]);
        assert_eq!(album.name.as_deref(), Some("A"));

        let dispatches = drain(&library, &rx);
        assert_eq!(
            types(&dispatches),
            vec!["track-change", "album-change", "artist-change"]
        );
        assert_eq!(dispatches[1].payloads, vec![Notification::AggregateChanged(album)]);
        assert_eq!(dispatches[2].payloads.len(), 2);

        Ok(())
    }

    #[test]
    fn test_untagged_track_lands_in_unknown_aggregates() -> anyhow::Result<()> {
        let (library, _rx) = setup_library()?;

        let report = library.add(vec![input("/music/untagged.mp3", None, &[])])?;
        let removed = library.remove(&report.tracks)?;

        assert!(removed.albums.removed_ids.is_empty());
        assert!(removed.artists.removed_ids.is_empty());
        let unknown = library.store(AggregateKind::Album).get(UNKNOWN_ID)?.unwrap();
        assert!(unknown.track_ids.is_empty());
        assert!(library.store(AggregateKind::Artist).get(UNKNOWN_ID)?.is_some());

        Ok(())
    }

    #[test]
    fn test_re_add_never_duplicates_track_ids() -> anyhow::Result<()> {
        let (library, rx) = setup_library()?;
        library.add(vec![input("/music/a.mp3", Some("A"), &["X"])])?;
        drain(&library, &rx);

        let report = library.add(vec![input("/music/a.mp3", Some("A"), &["X"])])?;

        assert!(report.albums.is_empty());
        assert!(report.artists.is_empty());
        let album = library.store(AggregateKind::Album).get(album_id("A"))?.unwrap();
        assert_eq!(album.track_ids.len(), 1);
        assert_eq!(types(&drain(&library, &rx)), vec!["track-change"]);

        Ok(())
    }

    #[test]
    fn test_album_rename_dispatches_change_before_removal() -> anyhow::Result<()> {
        let (library, rx) = setup_library()?;
        library.add(vec![input("/music/a.mp3", Some("Old"), &["X"])])?;
        drain(&library, &rx);

        let report = library.add(vec![input("/music/a.mp3", Some("New"), &["X"])])?;

        assert_eq!(report.albums.created, vec![album_id("New")]);
        assert_eq!(report.albums.removed_ids, vec![album_id("Old")]);
        assert!(report.artists.is_empty());
        assert!(library.store(AggregateKind::Album).get(album_id("Old"))?.is_none());

        let dispatches = drain(&library, &rx);
        assert_eq!(
            types(&dispatches),
            vec!["track-change", "album-change", "album-removal"]
        );

        Ok(())
    }

    #[test]
    fn test_reordered_artists_touch_nothing() -> anyhow::Result<()> {
        let (library, rx) = setup_library()?;
        library.add(vec![input("/music/a.mp3", Some("A"), &["X", "Y"])])?;
        drain(&library, &rx);

        let report = library.add(vec![input("/music/a.mp3", Some("A"), &["Y", "X"])])?;

        assert!(report.artists.is_empty());
        assert_eq!(types(&drain(&library, &rx)), vec!["track-change"]);

        Ok(())
    }

    #[test]
    fn test_removing_only_track_deletes_album() -> anyhow::Result<()> {
        let (library, _rx) = setup_library()?;
        let added = library.add(vec![
            input("/music/a.mp3", Some("A"), &["X"]),
            input("/music/b.mp3", Some("B"), &["X"]),
        ])?;

        let report = library.remove(&added.tracks[..1])?;

        assert_eq!(report.albums.removed_ids, vec![album_id("A")]);
        assert!(report.albums.saved.is_empty());
        assert!(report.artists.removed_ids.is_empty());
        assert_eq!(report.artists.saved[0].track_ids, vec![added.tracks[1]]);
        assert_eq!(library.store(AggregateKind::Album).count()?, 1);

        Ok(())
    }

    #[test]
    fn test_track_removals_are_dispatched_before_artist_removals() -> anyhow::Result<()> {
        let (library, rx) = setup_library()?;
        let added = library.add(vec![
            input("/music/a.mp3", Some("A"), &["X"]),
            input("/music/b.mp3", Some("B"), &["Y"]),
        ])?;
        drain(&library, &rx);

        library.remove(&added.tracks)?;

        let dispatches = drain(&library, &rx);
        assert_eq!(
            types(&dispatches),
            vec!["track-removal", "album-removal", "artist-removal"]
        );
        assert_eq!(dispatches[0].payloads.len(), 2);
        assert_eq!(dispatches[2].payloads.len(), 2);

        Ok(())
    }

    #[test]
    fn test_remove_unknown_ids_is_noop() -> anyhow::Result<()> {
        let (library, rx) = setup_library()?;

        let report = library.remove(&[TrackId::from_bytes(b"missing")])?;

        assert_eq!(report, ChangeReport::default());
        assert!(drain(&library, &rx).is_empty());

        Ok(())
    }

    #[test]
    fn test_retag_refreshes_album_name_and_media() -> anyhow::Result<()> {
        let (library, rx) = setup_library()?;
        library.add(vec![input("/music/a.mp3", Some("abbey road"), &["X"])])?;
        drain(&library, &rx);

        let mut retagged = input("/music/a.mp3", Some("Abbey Road"), &["X"]);
        retagged.media = Some("/covers/c.jpg".to_string());
        let report = library.add(vec![retagged])?;

        let album = library
            .store(AggregateKind::Album)
            .get(album_id("Abbey Road"))?
            .unwrap();
        assert_eq!(album.name.as_deref(), Some("Abbey Road"));
        assert_eq!(album.media.as_deref(), Some("/covers/c.jpg"));
        assert_eq!(album.track_ids.len(), 1);
        assert!(report.albums.created.is_empty());
        assert_eq!(
            types(&drain(&library, &rx)),
            vec!["track-change", "album-change", "artist-change"]
        );

        // a track without media keeps the cover
        library.add(vec![input("/music/b.mp3", Some("Abbey Road"), &["X"])])?;
        let album = library
            .store(AggregateKind::Album)
            .get(album_id("Abbey Road"))?
            .unwrap();
        assert_eq!(album.media.as_deref(), Some("/covers/c.jpg"));
        assert_eq!(album.track_ids.len(), 2);

        Ok(())
    }

    #[test]
    fn test_set_cover_and_track_media() -> anyhow::Result<()> {
        let (library, rx) = setup_library()?;
        let added = library.add(vec![input("/music/a.mp3", Some("A"), &["X"])])?;
        drain(&library, &rx);

        let album = library.set_cover(
            AggregateKind::Album,
            album_id("A"),
            Some("/covers/front.png".to_string()),
        )?;
        let track = library.set_track_media(added.tracks[0], Some("/covers/t.png".to_string()))?;

        assert_eq!(album.media.as_deref(), Some("/covers/front.png"));
        assert_eq!(track.media.as_deref(), Some("/covers/t.png"));
        assert_eq!(
            types(&drain(&library, &rx)),
            vec!["track-change", "album-change"]
        );
        assert!(matches!(
            library.set_cover(AggregateKind::Artist, 12345, None),
            Err(StorageError::AggregateNotFound { .. })
        ));

        Ok(())
    }

    #[test]
    fn test_artist_failure_keeps_album_commit() -> anyhow::Result<()> {
        let (library, rx) = setup_library()?;
        db::lock(&library.db)?.execute_batch(
            "CREATE TRIGGER reject_artists BEFORE INSERT ON artists
             BEGIN SELECT RAISE(ABORT, 'artists unavailable'); END;",
        )?;

        let result = library.add(vec![input("/music/a.mp3", Some("A"), &["X"])]);

        assert!(matches!(
            result,
            Err(StorageError::Pipeline {
                kind: AggregateKind::Artist,
                ..
            })
        ));
        assert!(library.store(AggregateKind::Album).get(album_id("A"))?.is_some());
        assert_eq!(library.store(AggregateKind::Artist).count()?, 0);
        assert_eq!(
            types(&drain(&library, &rx)),
            vec!["track-change", "album-change"]
        );

        Ok(())
    }

    #[test]
    fn test_readd_after_artist_failure_converges() -> anyhow::Result<()> {
        let (library, _rx) = setup_library()?;
        db::lock(&library.db)?.execute_batch(
            "CREATE TRIGGER reject_artists BEFORE INSERT ON artists
             BEGIN SELECT RAISE(ABORT, 'artists unavailable'); END;",
        )?;
        let tracks = vec![input("/music/a.mp3", Some("A"), &["X"])];
        assert!(library.add(tracks.clone()).is_err());

        db::lock(&library.db)?.execute_batch("DROP TRIGGER reject_artists;")?;
        let report = library.add(tracks)?;

        let artist = library
            .store(AggregateKind::Artist)
            .get(album_id("X"))?
            .unwrap();
        assert_eq!(artist.track_ids, report.tracks);
        assert_eq!(report.artists.created, vec![album_id("X")]);
        assert!(report.albums.is_empty());

        Ok(())
    }

    #[test]
    fn test_playlists() -> anyhow::Result<()> {
        let (library, rx) = setup_library()?;
        let added = library.add(vec![
            input("/music/a.mp3", Some("A"), &[]),
            input("/music/b.mp3", Some("A"), &[]),
            input("/music/c.mp3", Some("A"), &[]),
        ])?;
        let (a, b, c) = (added.tracks[0], added.tracks[1], added.tracks[2]);
        drain(&library, &rx);

        assert!(matches!(
            library.create_playlist("Empty", &[]),
            Err(StorageError::EmptyPlaylist)
        ));
        assert!(matches!(
            library.create_playlist("Ghost", &[TrackId::from_bytes(b"ghost")]),
            Err(StorageError::TrackNotFound(_))
        ));

        let mix = library.create_playlist("Mix", &[b, a])?;
        assert!(mix.id > UNKNOWN_ID);
        assert_eq!(mix.track_ids, vec![b, a]);

        let mix = library.add_to_playlist(mix.id, &[a, c])?;
        assert_eq!(mix.track_ids, vec![b, a, c]);

        let mix = library.rename_playlist(mix.id, "Evening")?;
        assert_eq!(mix.name.as_deref(), Some("Evening"));

        let mix = library.remove_from_playlist(mix.id, &[b])?.unwrap();
        assert_eq!(mix.track_ids, vec![a, c]);

        // removing tracks from the library detaches them from playlists
        let report = library.remove(&[a])?;
        assert_eq!(report.playlists.saved[0].track_ids, vec![c]);
        assert!(library.remove_from_playlist(mix.id, &[c])?.is_none());
        assert!(library.store(AggregateKind::Playlist).get(mix.id)?.is_none());

        let dispatched = types(&drain(&library, &rx));
        assert_eq!(dispatched.last(), Some(&"playlist-removal"));

        assert!(matches!(
            library.add_to_playlist(mix.id, &[c]),
            Err(StorageError::AggregateNotFound { .. })
        ));

        let solo = library.create_playlist("Solo", &[c])?;
        assert!(library.delete_playlist(solo.id)?);
        assert!(!library.delete_playlist(solo.id)?);

        Ok(())
    }

    #[test]
    fn test_concurrent_adds_to_same_album_lose_nothing() -> anyhow::Result<()> {
        let (library, _rx) = setup_library()?;

        thread::scope(|scope| {
            for n in 0..4 {
                let library = &library;
                scope.spawn(move || {
                    library.add(vec![input(&format!("/music/{n}.mp3"), Some("A"), &["X"])])
                });
            }
        });

        let album = library.store(AggregateKind::Album).get(album_id("A"))?.unwrap();
        assert_eq!(album.track_ids.len(), 4);
        assert_eq!(library.tracks().count()?, 4);
        assert!(library.last_update()?.is_some());

        Ok(())
    }
}
