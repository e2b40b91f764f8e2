use thiserror::Error;

use crate::domain::{
    aggregate::AggregateKind,
    hash::{AggregateId, TrackId},
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("malformed {column} in table {table}: {reason}")]
    MalformedColumn {
        table: &'static str,
        column: &'static str,
        reason: String,
    },

    #[error("track {0} not found")]
    TrackNotFound(TrackId),

    #[error("{kind} {id} not found")]
    AggregateNotFound { kind: AggregateKind, id: AggregateId },

    #[error("a playlist needs at least one track")]
    EmptyPlaylist,

    #[error("invalid track id")]
    InvalidTrackId,

    /// one aggregate kind failed to persist; other kinds may have committed
    #[error("{kind} pipeline failed: {source}")]
    Pipeline {
        kind: AggregateKind,
        source: Box<StorageError>,
    },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
