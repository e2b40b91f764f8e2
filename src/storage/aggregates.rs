use std::collections::{HashMap, HashSet};

use log::debug;
use rusqlite::{Connection, Row, params, params_from_iter};

use crate::{
    domain::{
        aggregate::{Aggregate, AggregateKind, Mutation},
        hash::{AggregateId, TrackId},
    },
    storage::{
        db::{self, MAX_BATCH, SharedConnection, placeholders},
        encoding::{decode, encode},
        error::StorageError,
        schema::{aggregate_table, columns::*},
    },
};

/// What one [`AggregateStore::save`] call did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AggregateSave {
    /// aggregates written, in mutation order
    pub saved: Vec<Aggregate>,
    /// subset of `saved` that did not exist before
    pub created: Vec<AggregateId>,
    /// aggregates deleted because they lost their last track
    pub removed_ids: Vec<AggregateId>,
}

impl AggregateSave {
    pub fn is_empty(&self) -> bool {
        self.saved.is_empty() && self.removed_ids.is_empty()
    }
}

/// Persists one aggregate kind (one table).
#[derive(Clone)]
pub struct AggregateStore {
    db: SharedConnection,
    kind: AggregateKind,
}

struct AggregateRow {
    id: AggregateId,
    name: Option<String>,
    media: Option<String>,
    track_ids: String,
}

impl AggregateRow {
    fn read(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            media: row.get(2)?,
            track_ids: row.get(3)?,
        })
    }
}

impl AggregateStore {
    pub fn new(db: SharedConnection, kind: AggregateKind) -> Self {
        Self { db, kind }
    }

    pub fn kind(&self) -> AggregateKind {
        self.kind
    }

    fn table(&self) -> &'static str {
        aggregate_table(self.kind)
    }

    fn decode_row(&self, row: AggregateRow) -> Result<Aggregate, StorageError> {
        Ok(Aggregate {
            kind: self.kind,
            id: row.id,
            name: row.name,
            media: row.media,
            track_ids: decode(self.table(), TRACK_IDS, &row.track_ids)?,
        })
    }

    fn select(
        &self,
        conn: &Connection,
        filter: &str,
        ids: &[AggregateId],
    ) -> Result<Vec<Aggregate>, StorageError> {
        let table = self.table();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ID}, {NAME}, {MEDIA}, {TRACK_IDS} FROM {table} {filter}"
        ))?;
        let rows = stmt
            .query_map(params_from_iter(ids), AggregateRow::read)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|row| self.decode_row(row))
            .collect()
    }

    fn select_by_ids(
        &self,
        conn: &Connection,
        ids: &[AggregateId],
    ) -> Result<Vec<Aggregate>, StorageError> {
        let mut found = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_BATCH) {
            let filter = format!("WHERE {ID} IN ({})", placeholders(chunk.len()));
            found.extend(self.select(conn, &filter, chunk)?);
        }
        Ok(found)
    }

    fn upsert(&self, conn: &Connection, aggregate: &Aggregate) -> Result<(), StorageError> {
        let table = self.table();
        let mut stmt = conn.prepare_cached(&format!(
            "INSERT INTO {table} ({ID}, {NAME}, {MEDIA}, {TRACK_IDS})
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT({ID}) DO UPDATE SET
                {NAME} = excluded.{NAME},
                {MEDIA} = excluded.{MEDIA},
                {TRACK_IDS} = excluded.{TRACK_IDS}"
        ))?;
        stmt.execute(params![
            aggregate.id,
            aggregate.name,
            aggregate.media,
            encode(&aggregate.track_ids)?,
        ])?;
        Ok(())
    }

    fn delete(&self, conn: &Connection, id: AggregateId) -> Result<bool, StorageError> {
        let table = self.table();
        let deleted = conn.execute(
            &format!("DELETE FROM {table} WHERE {ID} = ?1"),
            params![id],
        )?;
        Ok(deleted > 0)
    }

    /// Merges mutations into the stored rows.
    ///
    /// All rows are read, merged in memory and written back inside one
    /// transaction: either every mutation lands or none does. Aggregates
    /// left without tracks are deleted (the unknown album/artist excepted),
    /// unchanged ones are not written.
    pub fn save(&self, mut mutations: Vec<Mutation>) -> Result<AggregateSave, StorageError> {
        mutations.retain(|mutation| !mutation.is_noop());
        if mutations.is_empty() {
            return Ok(AggregateSave::default());
        }

        let mut db = db::lock(&self.db)?;
        let tx = db.transaction()?;
        let outcome = self.save_in(&tx, mutations)?;
        tx.commit()?;

        debug!(
            "{}: {} saved ({} new), {} removed",
            self.table(),
            outcome.saved.len(),
            outcome.created.len(),
            outcome.removed_ids.len()
        );
        Ok(outcome)
    }

    fn save_in(
        &self,
        conn: &Connection,
        mutations: Vec<Mutation>,
    ) -> Result<AggregateSave, StorageError> {
        let mut seen = HashSet::new();
        let order = mutations
            .iter()
            .map(|mutation| mutation.id)
            .filter(|id| seen.insert(*id))
            .collect::<Vec<_>>();

        let existing: HashMap<AggregateId, Aggregate> = self
            .select_by_ids(conn, &order)?
            .into_iter()
            .map(|aggregate| (aggregate.id, aggregate))
            .collect();

        let mut merged: HashMap<AggregateId, Aggregate> = HashMap::new();
        for mutation in &mutations {
            let base = merged.remove(&mutation.id).unwrap_or_else(|| {
                existing
                    .get(&mutation.id)
                    .cloned()
                    .unwrap_or_else(|| Aggregate::empty(self.kind, mutation.id))
            });
            merged.insert(mutation.id, base.merge(mutation));
        }

        let mut outcome = AggregateSave::default();
        for id in order {
            let Some(aggregate) = merged.remove(&id) else {
                continue;
            };
            let before = existing.get(&id);

            if aggregate.track_ids.is_empty() {
                // never create an empty row, not even the sentinel
                if before.is_none() {
                    continue;
                }
                if !aggregate.is_sentinel() {
                    if self.delete(conn, id)? {
                        outcome.removed_ids.push(id);
                    }
                    continue;
                }
            }

            if before == Some(&aggregate) {
                continue;
            }

            self.upsert(conn, &aggregate)?;
            if before.is_none() {
                outcome.created.push(id);
            }
            outcome.saved.push(aggregate);
        }

        Ok(outcome)
    }

    /// Drops the given tracks from every aggregate of this kind that lists
    /// them, in one transaction. Used for explicit lists, which tracks do not
    /// point back to.
    pub fn detach_tracks(&self, track_ids: &[TrackId]) -> Result<AggregateSave, StorageError> {
        if track_ids.is_empty() {
            return Ok(AggregateSave::default());
        }
        let gone: HashSet<&TrackId> = track_ids.iter().collect();

        let mut db = db::lock(&self.db)?;
        let tx = db.transaction()?;

        let mutations = self
            .select(&tx, "", &[])?
            .into_iter()
            .filter_map(|aggregate| {
                let removed_track_ids = aggregate
                    .track_ids
                    .iter()
                    .filter(|id| gone.contains(id))
                    .copied()
                    .collect::<Vec<_>>();
                (!removed_track_ids.is_empty()).then(|| Mutation {
                    removed_track_ids,
                    ..Mutation::new(aggregate.id)
                })
            })
            .collect::<Vec<_>>();

        let outcome = self.save_in(&tx, mutations)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Sets or clears the media (cover/avatar) of an existing aggregate.
    pub fn set_media(
        &self,
        id: AggregateId,
        media: Option<String>,
    ) -> Result<Aggregate, StorageError> {
        let mut db = db::lock(&self.db)?;
        let tx = db.transaction()?;

        let mut aggregate = self
            .select_by_ids(&tx, &[id])?
            .pop()
            .ok_or(StorageError::AggregateNotFound {
                kind: self.kind,
                id,
            })?;
        aggregate.media = media;
        self.upsert(&tx, &aggregate)?;

        tx.commit()?;
        Ok(aggregate)
    }

    /// Deletes an aggregate regardless of its tracks. Returns whether it
    /// existed.
    pub fn remove(&self, id: AggregateId) -> Result<bool, StorageError> {
        let db = db::lock(&self.db)?;
        self.delete(&db, id)
    }

    pub fn get(&self, id: AggregateId) -> Result<Option<Aggregate>, StorageError> {
        Ok(self.get_by_ids(&[id])?.pop())
    }

    /// existing aggregates among `ids`, in the order of `ids`
    pub fn get_by_ids(&self, ids: &[AggregateId]) -> Result<Vec<Aggregate>, StorageError> {
        let db = db::lock(&self.db)?;
        let mut by_id: HashMap<AggregateId, Aggregate> = self
            .select_by_ids(&db, ids)?
            .into_iter()
            .map(|aggregate| (aggregate.id, aggregate))
            .collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    pub fn list(&self) -> Result<Vec<Aggregate>, StorageError> {
        let db = db::lock(&self.db)?;
        self.select(&db, &format!("ORDER BY {NAME} COLLATE NOCASE, {ID}"), &[])
    }

    pub fn count(&self) -> Result<usize, StorageError> {
        let db = db::lock(&self.db)?;
        let table = self.table();
        let count: i64 =
            db.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Database,
        domain::hash::UNKNOWN_ID,
        storage::db::{open, share},
    };

    fn mock_trackid(x: i32) -> TrackId {
        TrackId::from_bytes(&x.to_be_bytes())
    }

    fn setup_store(kind: AggregateKind) -> anyhow::Result<AggregateStore> {
        Ok(AggregateStore::new(share(open(&Database::in_memory())?), kind))
    }

    fn adding(id: AggregateId, name: &str, tracks: &[i32]) -> Mutation {
        Mutation {
            name: Some(name.to_string()),
            track_ids: tracks.iter().map(|x| mock_trackid(*x)).collect(),
            ..Mutation::new(id)
        }
    }

    fn removing(id: AggregateId, tracks: &[i32]) -> Mutation {
        Mutation {
            removed_track_ids: tracks.iter().map(|x| mock_trackid(*x)).collect(),
            ..Mutation::new(id)
        }
    }

    #[test]
    fn test_save_creates_aggregate() -> anyhow::Result<()> {
        let store = setup_store(AggregateKind::Album)?;

        let outcome = store.save(vec![adding(10, "A", &[1])])?;

        assert_eq!(outcome.created, vec![10]);
        assert_eq!(outcome.saved.len(), 1);
        assert_eq!(outcome.saved[0].track_ids, vec![mock_trackid(1)]);
        assert_eq!(store.get(10)?, Some(outcome.saved[0].clone()));

        Ok(())
    }

    #[test]
    fn test_save_merges_without_duplicates() -> anyhow::Result<()> {
        let store = setup_store(AggregateKind::Album)?;
        store.save(vec![adding(10, "A", &[1, 2])])?;

        let outcome = store.save(vec![adding(10, "A", &[2, 3])])?;

        assert!(outcome.created.is_empty());
        assert_eq!(
            store.get(10)?.unwrap().track_ids,
            vec![mock_trackid(1), mock_trackid(2), mock_trackid(3)]
        );

        // nothing new: nothing written, nothing reported
        let again = store.save(vec![adding(10, "A", &[1])])?;
        assert!(again.is_empty());

        Ok(())
    }

    #[test]
    fn test_save_folds_mutations_for_the_same_id() -> anyhow::Result<()> {
        let store = setup_store(AggregateKind::Artist)?;

        let outcome = store.save(vec![adding(10, "A", &[1, 2]), removing(10, &[1])])?;

        assert_eq!(outcome.saved.len(), 1);
        assert_eq!(outcome.saved[0].track_ids, vec![mock_trackid(2)]);

        Ok(())
    }

    #[test]
    fn test_emptied_aggregate_is_removed_not_saved() -> anyhow::Result<()> {
        let store = setup_store(AggregateKind::Album)?;
        store.save(vec![adding(10, "A", &[1]), adding(11, "B", &[2])])?;

        let outcome = store.save(vec![removing(10, &[1]), removing(11, &[3])])?;

        assert_eq!(outcome.removed_ids, vec![10]);
        assert!(outcome.saved.is_empty());
        assert!(store.get(10)?.is_none());
        assert!(store.get(11)?.is_some());

        Ok(())
    }

    #[test]
    fn test_removal_for_unknown_aggregate_reports_nothing() -> anyhow::Result<()> {
        let store = setup_store(AggregateKind::Album)?;

        let outcome = store.save(vec![removing(99, &[1])])?;

        assert!(outcome.is_empty());
        assert_eq!(store.count()?, 0);

        Ok(())
    }

    #[test]
    fn test_sentinel_survives_when_empty() -> anyhow::Result<()> {
        let store = setup_store(AggregateKind::Artist)?;
        store.save(vec![Mutation {
            track_ids: vec![mock_trackid(1)],
            ..Mutation::new(UNKNOWN_ID)
        }])?;

        let outcome = store.save(vec![removing(UNKNOWN_ID, &[1])])?;

        assert!(outcome.removed_ids.is_empty());
        assert_eq!(outcome.saved.len(), 1);
        assert!(store.get(UNKNOWN_ID)?.unwrap().track_ids.is_empty());

        Ok(())
    }

    #[test]
    fn test_removal_for_missing_sentinel_creates_nothing() -> anyhow::Result<()> {
        let store = setup_store(AggregateKind::Album)?;

        let outcome = store.save(vec![removing(UNKNOWN_ID, &[1])])?;

        assert!(outcome.is_empty());
        assert!(outcome.created.is_empty());
        assert!(store.get(UNKNOWN_ID)?.is_none());

        Ok(())
    }

    #[test]
    fn test_empty_save_is_noop() -> anyhow::Result<()> {
        let store = setup_store(AggregateKind::Album)?;
        assert_eq!(store.save(vec![])?, AggregateSave::default());
        Ok(())
    }

    #[test]
    fn test_failed_write_rolls_back_whole_batch() -> anyhow::Result<()> {
        let store = setup_store(AggregateKind::Album)?;
        db::lock(&store.db)?.execute_batch(
            "CREATE TRIGGER reject_boom BEFORE INSERT ON albums
             WHEN NEW.name = 'Boom'
             BEGIN SELECT RAISE(ABORT, 'boom'); END;",
        )?;

        let result = store.save(vec![
            adding(1001, "First", &[1]),
            adding(1002, "Boom", &[2]),
            adding(1003, "Third", &[3]),
        ]);

        assert!(matches!(result, Err(StorageError::Database(_))));
        assert_eq!(store.count()?, 0);

        Ok(())
    }

    #[test]
    fn test_malformed_track_ids_surface_as_error() -> anyhow::Result<()> {
        let store = setup_store(AggregateKind::Album)?;
        store.save(vec![adding(10, "A", &[1])])?;
        db::lock(&store.db)?.execute("UPDATE albums SET track_ids = '[\"xyz\"]'", [])?;

        assert!(matches!(
            store.save(vec![adding(10, "A", &[2])]),
            Err(StorageError::MalformedColumn { .. })
        ));

        Ok(())
    }

    #[test]
    fn test_detach_tracks_from_lists() -> anyhow::Result<()> {
        let store = setup_store(AggregateKind::Playlist)?;
        store.save(vec![
            adding(500, "Mix", &[1, 2]),
            adding(501, "Solo", &[1]),
            adding(502, "Other", &[3]),
        ])?;

        let outcome = store.detach_tracks(&[mock_trackid(1)])?;

        assert_eq!(outcome.removed_ids, vec![501]);
        assert_eq!(outcome.saved.len(), 1);
        assert_eq!(outcome.saved[0].track_ids, vec![mock_trackid(2)]);
        assert_eq!(store.count()?, 2);

        Ok(())
    }

    #[test]
    fn test_set_media_and_remove() -> anyhow::Result<()> {
        let store = setup_store(AggregateKind::Album)?;
        store.save(vec![adding(10, "A", &[1])])?;

        let updated = store.set_media(10, Some("/covers/a.png".to_string()))?;
        assert_eq!(updated.media.as_deref(), Some("/covers/a.png"));
        assert_eq!(store.get(10)?, Some(updated));

        assert!(matches!(
            store.set_media(11, None),
            Err(StorageError::AggregateNotFound { id: 11, .. })
        ));

        assert!(store.remove(10)?);
        assert!(!store.remove(10)?);

        Ok(())
    }

    #[test]
    fn test_list_orders_by_name() -> anyhow::Result<()> {
        let store = setup_store(AggregateKind::Artist)?;
        store.save(vec![adding(10, "beta", &[1]), adding(11, "Alpha", &[2])])?;

        let names: Vec<_> = store
            .list()?
            .into_iter()
            .filter_map(|a| a.name)
            .collect();

        assert_eq!(names, vec!["Alpha", "beta"]);
        assert_eq!(store.get_by_ids(&[11, 12, 10])?.len(), 2);

        Ok(())
    }
}
