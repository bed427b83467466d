use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::TimerError;
use crate::store::Store;

pub const DISABLE_TIMERS_ENV: &str = "CSV_IMPORT_DISABLE_TIMERS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub fire_at: DateTime<Utc>,
    /// Seconds between firings; `None` for a one-off trigger.
    pub interval_secs: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DueTimer {
    pub token: i64,
    pub hook: String,
    pub fired_for: DateTime<Utc>,
    pub payload: Value,
}

/// One pending registration as the substrate reports it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Registration {
    pub token: i64,
    pub hook: String,
    pub fire_at: DateTime<Utc>,
    pub interval_secs: Option<i64>,
    pub payload: Value,
}

/// Host facility that calls back into the pipeline at a given time.
pub trait TimerSubstrate {
    fn register(&self, hook: &str, trigger: Trigger, payload: &Value) -> Result<i64, TimerError>;

    /// Removes the earliest pending registration under `hook`.
    fn unregister(&self, hook: &str) -> Result<bool, TimerError>;

    fn next_fire(&self, hook: &str) -> Result<Option<DateTime<Utc>>, TimerError>;

    fn pending(&self, hook: &str) -> Result<usize, TimerError>;

    /// Whether the host has switched its timer mechanism off. Registrations are
    /// still kept, but nothing fires.
    fn is_disabled(&self) -> bool;

    /// Every pending registration under `hook`, earliest first.
    fn registrations(&self, _hook: &str) -> Result<Vec<Registration>, TimerError> {
        Err(TimerError::IntrospectionUnsupported)
    }

    /// Claims the registrations due at `now` for a caller that drives firing.
    /// Substrates that fire on their own have nothing to hand out.
    fn take_due(&self, _now: DateTime<Utc>) -> Result<Vec<DueTimer>, TimerError> {
        Ok(Vec::new())
    }
}

/// Timer substrate kept in the `timers` table and driven by `tick`.
pub struct SqliteTimers {
    store: Store,
    disabled: bool,
}

impl SqliteTimers {
    pub fn new(store: Store, disabled: bool) -> Self {
        Self { store, disabled }
    }

    pub fn from_env(store: Store) -> Self {
        let disabled = std::env::var(DISABLE_TIMERS_ENV)
            .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Self::new(store, disabled)
    }
}

impl TimerSubstrate for SqliteTimers {
    fn register(&self, hook: &str, trigger: Trigger, payload: &Value) -> Result<i64, TimerError> {
        let connection = self.store.connection();
        connection.execute(
            "INSERT INTO timers(hook, fire_at, interval_secs, payload) VALUES(?1, ?2, ?3, ?4)",
            params![
                hook,
                trigger.fire_at.timestamp(),
                trigger.interval_secs,
                payload.to_string()
            ],
        )?;
        let token = connection.last_insert_rowid();
        debug!(hook, token, fire_at = %trigger.fire_at, "registered timer");
        Ok(token)
    }

    fn unregister(&self, hook: &str) -> Result<bool, TimerError> {
        let removed = self.store.connection().execute(
            "
            DELETE FROM timers WHERE timer_id = (
              SELECT timer_id FROM timers WHERE hook = ?1 ORDER BY fire_at, timer_id LIMIT 1
            )
            ",
            params![hook],
        )?;
        Ok(removed > 0)
    }

    fn next_fire(&self, hook: &str) -> Result<Option<DateTime<Utc>>, TimerError> {
        let fire_at: Option<i64> = self
            .store
            .connection()
            .query_row(
                "SELECT MIN(fire_at) FROM timers WHERE hook = ?1",
                params![hook],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        Ok(fire_at.map(timestamp))
    }

    fn pending(&self, hook: &str) -> Result<usize, TimerError> {
        let count: i64 = self.store.connection().query_row(
            "SELECT COUNT(*) FROM timers WHERE hook = ?1",
            params![hook],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn registrations(&self, hook: &str) -> Result<Vec<Registration>, TimerError> {
        let connection = self.store.connection();
        let mut statement = connection.prepare(
            "
            SELECT timer_id, fire_at, interval_secs, payload
            FROM timers
            WHERE hook = ?1
            ORDER BY fire_at, timer_id
            ",
        )?;
        let registrations = statement
            .query_map(params![hook], |row| {
                let payload: String = row.get(3)?;
                Ok(Registration {
                    token: row.get(0)?,
                    hook: hook.to_string(),
                    fire_at: timestamp(row.get(1)?),
                    interval_secs: row.get(2)?,
                    payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(registrations)
    }

    /// Claims every registration due at `now`. Recurring timers are moved to
    /// their next slot after `now`; one-off timers are removed.
    fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<DueTimer>, TimerError> {
        let connection = self.store.connection();
        let mut statement = connection.prepare(
            "
            SELECT timer_id, hook, fire_at, interval_secs, payload
            FROM timers
            WHERE fire_at <= ?1
            ORDER BY fire_at, timer_id
            ",
        )?;
        let rows = statement
            .query_map(params![now.timestamp()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut due = Vec::with_capacity(rows.len());
        for (token, hook, fire_at, interval_secs, payload) in rows {
            match interval_secs.filter(|interval| *interval > 0) {
                Some(interval) => {
                    let missed = (now.timestamp() - fire_at) / interval + 1;
                    let next = fire_at + missed * interval;
                    connection.execute(
                        "UPDATE timers SET fire_at = ?1 WHERE timer_id = ?2",
                        params![next, token],
                    )?;
                }
                None => {
                    connection.execute("DELETE FROM timers WHERE timer_id = ?1", params![token])?;
                }
            }

            due.push(DueTimer {
                token,
                hook,
                fired_for: timestamp(fire_at),
                payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
            });
        }

        if !due.is_empty() {
            info!(count = due.len(), "claimed due timers");
        }
        Ok(due)
    }
}

fn timestamp(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .unwrap_or_default()
}
