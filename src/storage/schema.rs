use rusqlite::Connection;

use crate::domain::aggregate::AggregateKind;

pub mod tables {
    pub const TRACKS: &str = "tracks";
    pub const ALBUMS: &str = "albums";
    pub const ARTISTS: &str = "artists";
    pub const PLAYLISTS: &str = "playlists";
    pub const UPDATES: &str = "updates";

    pub const ALL_TABLES: &[&str] = &[TRACKS, ALBUMS, ARTISTS, PLAYLISTS, UPDATES];
}

pub mod columns {
    pub const ID: &str = "id";
    pub const PATH: &str = "path";
    pub const TAGS: &str = "tags";
    pub const ALBUM_ID: &str = "album_id";
    pub const ALBUM_NAME: &str = "album_name";
    pub const ARTIST_REFS: &str = "artist_refs";
    pub const MEDIA: &str = "media";
    pub const NAME: &str = "name";
    pub const TRACK_IDS: &str = "track_ids";
    pub const UPDATED_AT: &str = "updated_at";
}

pub use columns::*;
pub use tables::*;

pub fn aggregate_table(kind: AggregateKind) -> &'static str {
    match kind {
        AggregateKind::Album => ALBUMS,
        AggregateKind::Artist => ARTISTS,
        AggregateKind::Playlist => PLAYLISTS,
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tracks (
    id TEXT PRIMARY KEY NOT NULL,
    path TEXT NOT NULL,
    tags TEXT NOT NULL,
    album_id INTEGER NOT NULL,
    album_name TEXT,
    artist_refs TEXT NOT NULL,
    media TEXT
);

CREATE INDEX IF NOT EXISTS tracks_album_id ON tracks (album_id);

CREATE TABLE IF NOT EXISTS albums (
    id INTEGER PRIMARY KEY NOT NULL,
    name TEXT,
    media TEXT,
    track_ids TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS artists (
    id INTEGER PRIMARY KEY NOT NULL,
    name TEXT,
    media TEXT,
    track_ids TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS playlists (
    id INTEGER PRIMARY KEY NOT NULL,
    name TEXT,
    media TEXT,
    track_ids TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS updates (
    updated_at INTEGER NOT NULL
);
"#;

pub fn init(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA)
}
