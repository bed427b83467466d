use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;
use crate::model::ImportConfiguration;
use crate::util::{ensure_directory, now_utc_string};

pub const DB_SCHEMA_VERSION: &str = "0.1.0";

pub mod keys {
    pub const SCHEMA_VERSION: &str = "db_schema_version";
    pub const SETTINGS: &str = "settings";
    pub const COLUMN_MAPPING: &str = "column_mapping";
    pub const PROGRESS: &str = "import_progress";
    pub const LOCK: &str = "import_running_lock";
    pub const CANCEL_REQUESTED: &str = "import_cancel_requested";
    pub const SCHEDULED_FREQUENCY: &str = "scheduled_frequency";
    pub const SCHEDULED_SOURCE: &str = "scheduled_source";
    pub const LAST_RUN: &str = "last_run";
}

/// Handle to the persistent key-value store shared by the lock, the progress
/// record, the scheduler and the default collaborators. Cloning shares the
/// underlying connection.
#[derive(Clone)]
pub struct Store {
    connection: Rc<Connection>,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_directory(parent)?;
            }
        }

        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        configure_connection(&connection)?;
        ensure_schema(&connection)
            .with_context(|| format!("failed to initialize schema in {}", db_path.display()))?;

        Ok(Self {
            connection: Rc::new(connection),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let connection = Connection::open_in_memory()?;
        ensure_schema(&connection)?;
        Ok(Self {
            connection: Rc::new(connection),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let raw: Option<String> = self
            .connection
            .query_row(
                "SELECT value FROM options WHERE key = ?1 LIMIT 1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.connection.execute(
            "
            INSERT INTO options(key, value, updated_at) VALUES(?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at
            ",
            params![key, raw, now_utc_string()],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed = self
            .connection
            .execute("DELETE FROM options WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    pub fn settings(&self) -> Result<ImportConfiguration, StoreError> {
        Ok(self.get_json(keys::SETTINGS)?.unwrap_or_default())
    }

    pub fn save_settings(&self, settings: &ImportConfiguration) -> Result<(), StoreError> {
        self.put_json(keys::SETTINGS, settings)
    }
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set busy_timeout")?;
    Ok(())
}

fn ensure_schema(connection: &Connection) -> Result<(), StoreError> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS options (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS timers (
          timer_id INTEGER PRIMARY KEY AUTOINCREMENT,
          hook TEXT NOT NULL,
          fire_at INTEGER NOT NULL,
          interval_secs INTEGER,
          payload TEXT NOT NULL DEFAULT '{}'
        );

        CREATE TABLE IF NOT EXISTS records (
          record_id INTEGER PRIMARY KEY AUTOINCREMENT,
          kind TEXT NOT NULL,
          natural_key TEXT NOT NULL,
          fields TEXT NOT NULL,
          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_timers_hook_fire ON timers(hook, fire_at);
        CREATE INDEX IF NOT EXISTS idx_records_kind_key ON records(kind, natural_key);
        ",
    )?;

    connection.execute(
        "
        INSERT INTO options(key, value, updated_at) VALUES(?1, json_quote(?2), ?3)
        ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at
        ",
        params![keys::SCHEMA_VERSION, DB_SCHEMA_VERSION, now_utc_string()],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceKind;

    #[test]
    fn json_values_round_trip_through_options_table() {
        let store = Store::open_in_memory().expect("in-memory store should open");
        assert_eq!(store.get_json::<SourceKind>("missing").expect("read"), None);

        store
            .put_json("scheduled_source", &SourceKind::Local)
            .expect("write");
        store
            .put_json("scheduled_source", &SourceKind::Remote)
            .expect("overwrite");
        assert_eq!(
            store.get_json::<SourceKind>("scheduled_source").expect("read"),
            Some(SourceKind::Remote)
        );

        assert!(store.delete("scheduled_source").expect("delete"));
        assert!(!store.delete("scheduled_source").expect("second delete"));
    }

    #[test]
    fn schema_version_is_recorded_on_open() {
        let store = Store::open_in_memory().expect("in-memory store should open");
        let version: Option<String> = store.get_json(keys::SCHEMA_VERSION).expect("read");
        assert_eq!(version.as_deref(), Some(DB_SCHEMA_VERSION));
    }

    #[test]
    fn settings_default_when_never_saved() {
        let store = Store::open_in_memory().expect("in-memory store should open");
        let settings = store.settings().expect("settings");
        assert_eq!(settings, ImportConfiguration::default());

        let mut changed = settings.clone();
        changed.local_path = "data/pages.csv".to_string();
        store.save_settings(&changed).expect("save");
        assert_eq!(store.settings().expect("reload").local_path, "data/pages.csv");
    }
}
