use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, anyhow};
use chrono::{DateTime, Local};
use rusqlite::{Connection, OptionalExtension, params};

use crate::{
    config::Database,
    storage::{
        error::StorageError,
        schema::{self, UPDATED_AT, UPDATES},
    },
};

pub type SecondsSinceUnix = i64;

/// Connection shared by every store; each store call holds the lock for the
/// lifetime of its own transaction.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// bound variables per `IN (...)` statement, well under SQLite's limit
pub(crate) const MAX_BATCH: usize = 500;

fn open_in_memory() -> Result<rusqlite::Connection, rusqlite::Error> {
    Connection::open_in_memory()
}

fn open_from_file(path: &Path) -> Result<rusqlite::Connection, rusqlite::Error> {
    Connection::open(path)
}

pub fn open(config: &Database) -> Result<rusqlite::Connection, StorageError> {
    let db = if config.in_memory {
        open_in_memory()?
    } else {
        let path = config
            .path
            .as_deref()
            .ok_or_else(|| anyhow!("database.path is required unless database.in_memory is set"))?;
        open_from_file(path)?
    };
    schema::init(&db)?;
    Ok(db)
}

pub fn share(db: Connection) -> SharedConnection {
    Arc::new(Mutex::new(db))
}

pub(crate) fn lock(db: &SharedConnection) -> Result<MutexGuard<'_, Connection>, StorageError> {
    db.lock().map_err(|e| {
        StorageError::Internal(anyhow!("could not access library database under lock: {e}"))
    })
}

/// `?, ?, ?` for an `IN (...)` clause
pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// appends the current time to the update log
pub(crate) fn record_update(conn: &Connection) -> Result<(), StorageError> {
    let now = system_time_to_i64(SystemTime::now()).map_err(StorageError::Internal)?;
    conn.execute(
        &format!("INSERT INTO {UPDATES} ({UPDATED_AT}) VALUES (?1)"),
        params![now],
    )?;
    Ok(())
}

/// time of the latest committed track mutation, if any
pub fn last_update(conn: &Connection) -> Result<Option<SecondsSinceUnix>, StorageError> {
    let updated_at = conn
        .query_row(
            &format!("SELECT MAX({UPDATED_AT}) FROM {UPDATES}"),
            [],
            |row| row.get::<_, Option<SecondsSinceUnix>>(0),
        )
        .optional()?
        .flatten();
    Ok(updated_at)
}

/// converts time to number of seconds since unix_epoch
pub fn system_time_to_i64(time: SystemTime) -> anyhow::Result<SecondsSinceUnix> {
    i64::try_from(
        time.duration_since(UNIX_EPOCH)
            .with_context(|| "failed to get unix timestamp")?
            .as_secs(),
    )
    .with_context(|| "failed to get update timestamp in seconds")
}

/// converts number of seconds since unix epoch local time to local date time
pub fn i64_seconds_to_local_time(since_unix: i64) -> anyhow::Result<DateTime<Local>> {
    let datetime = DateTime::from_timestamp_secs(since_unix).ok_or(anyhow!(
        "failed to convert {since_unix} s timestamp to datetime"
    ))?;

    Ok(DateTime::from(datetime))
}
