use std::collections::BTreeMap;

use rusqlite::{OptionalExtension, params};
use serde::Serialize;

use crate::error::RecordError;
use crate::store::Store;
use crate::util::now_utc_string;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecordOutcome {
    pub id: i64,
    pub created: bool,
}

/// Destination for imported rows.
pub trait RecordStore {
    fn create_or_update(
        &self,
        kind: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<RecordOutcome, RecordError>;
}

/// Default record store backed by the `records` table. With
/// `skip_duplicates` on, a row whose key field matches an existing record of
/// the same kind updates that record instead of adding another.
pub struct SqliteRecordStore {
    store: Store,
    key_field: String,
    skip_duplicates: bool,
}

impl SqliteRecordStore {
    pub fn new(store: Store, key_field: &str, skip_duplicates: bool) -> Self {
        Self {
            store,
            key_field: key_field.to_string(),
            skip_duplicates,
        }
    }

    pub fn count(&self, kind: &str) -> Result<u64, rusqlite::Error> {
        self.store.connection().query_row(
            "SELECT COUNT(*) FROM records WHERE kind = ?1",
            params![kind],
            |row| row.get(0),
        )
    }

    fn write(
        &self,
        kind: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<RecordOutcome, rusqlite::Error> {
        let connection = self.store.connection();
        let natural_key = fields
            .get(&self.key_field)
            .map(|value| value.trim().to_string())
            .unwrap_or_default();
        let payload = serde_json::to_string(fields)
            .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;
        let now = now_utc_string();

        if self.skip_duplicates && !natural_key.is_empty() {
            let existing: Option<i64> = connection
                .query_row(
                    "SELECT record_id FROM records WHERE kind = ?1 AND natural_key = ?2 ORDER BY record_id LIMIT 1",
                    params![kind, natural_key],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(id) = existing {
                connection.execute(
                    "UPDATE records SET fields = ?1, updated_at = ?2 WHERE record_id = ?3",
                    params![payload, now, id],
                )?;
                return Ok(RecordOutcome { id, created: false });
            }
        }

        connection.execute(
            "
            INSERT INTO records(kind, natural_key, fields, created_at, updated_at)
            VALUES(?1, ?2, ?3, ?4, ?4)
            ",
            params![kind, natural_key, payload, now],
        )?;
        Ok(RecordOutcome {
            id: connection.last_insert_rowid(),
            created: true,
        })
    }
}

impl RecordStore for SqliteRecordStore {
    fn create_or_update(
        &self,
        kind: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<RecordOutcome, RecordError> {
        self.write(kind, fields).map_err(|err| RecordError {
            kind: kind.to_string(),
            message: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn duplicates_update_the_existing_record() {
        let store = Store::open_in_memory().expect("store");
        let records = SqliteRecordStore::new(store, "title", true);

        let first = records
            .create_or_update("page", &fields(&[("title", "About"), ("content", "v1")]))
            .expect("insert");
        let second = records
            .create_or_update("page", &fields(&[("title", " About "), ("content", "v2")]))
            .expect("update");

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(records.count("page").expect("count"), 1);

        let other_kind = records
            .create_or_update("post", &fields(&[("title", "About")]))
            .expect("insert other kind");
        assert!(other_kind.created);
    }

    #[test]
    fn duplicates_are_inserted_when_skipping_is_off() {
        let store = Store::open_in_memory().expect("store");
        let records = SqliteRecordStore::new(store, "title", false);

        for _ in 0..3 {
            let outcome = records
                .create_or_update("page", &fields(&[("title", "About")]))
                .expect("insert");
            assert!(outcome.created);
        }
        assert_eq!(records.count("page").expect("count"), 3);
    }

    #[test]
    fn rows_without_a_key_are_always_inserted() {
        let store = Store::open_in_memory().expect("store");
        let records = SqliteRecordStore::new(store, "slug", true);

        records
            .create_or_update("page", &fields(&[("title", "One")]))
            .expect("insert");
        records
            .create_or_update("page", &fields(&[("title", "Two"), ("slug", "")]))
            .expect("insert");
        assert_eq!(records.count("page").expect("count"), 2);
    }
}
