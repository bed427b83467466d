//! Recurring import schedule on top of a [`TimerSubstrate`].
//!
//! Whether an import is scheduled is always read back from the substrate; the
//! saved frequency and source only describe what the next firing will run.

mod timers;

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::error::{ImportError, SchedulerError, TimerError};
use crate::import::{ImportExecutor, ProgressStore};
use crate::mapping::ColumnMapping;
use crate::model::{Frequency, ImportSummary, IntervalOption, ScheduleStatus, SourceKind};
use crate::store::{Store, keys};

pub use timers::{Registration, SqliteTimers, TimerSubstrate, Trigger};

pub const SCHEDULE_HOOK: &str = "csv_import_scheduled";
pub const SELF_TEST_HOOK: &str = "csv_import_scheduler_test";
pub const SCHEDULER_ACTOR: &str = "scheduler";

const SELF_TEST_DELAY_SECS: i64 = 60;
const SELF_TEST_TOLERANCE_SECS: i64 = 1;

#[derive(Debug, Clone, Serialize)]
pub struct SelfTestReport {
    pub expected_fire_at: DateTime<Utc>,
    pub observed_fire_at: DateTime<Utc>,
    pub drift_secs: i64,
    pub timers_disabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingRegistration {
    #[serde(flatten)]
    pub registration: Registration,
    pub seconds_until_fire: i64,
}

/// Raw view of the schedule: every registration under the hook and the
/// persisted run-state values as stored.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerDebug {
    pub generated_at: DateTime<Utc>,
    pub hook: &'static str,
    pub timers_disabled: bool,
    /// `None` when the substrate cannot list its registrations.
    pub registrations: Option<Vec<PendingRegistration>>,
    pub options: BTreeMap<&'static str, Option<Value>>,
}

const DEBUG_OPTION_KEYS: [&str; 6] = [
    keys::SCHEDULED_FREQUENCY,
    keys::SCHEDULED_SOURCE,
    keys::PROGRESS,
    keys::LOCK,
    keys::CANCEL_REQUESTED,
    keys::LAST_RUN,
];

pub fn available_intervals() -> Vec<IntervalOption> {
    Frequency::ALL
        .into_iter()
        .map(|frequency| IntervalOption {
            name: frequency.as_str(),
            label: frequency.label(),
            interval_secs: frequency.interval_secs(),
        })
        .collect()
}

pub struct Scheduler<'a> {
    store: &'a Store,
    timers: &'a dyn TimerSubstrate,
}

impl<'a> Scheduler<'a> {
    pub fn new(store: &'a Store, timers: &'a dyn TimerSubstrate) -> Self {
        Self { store, timers }
    }

    pub fn schedule(&self, frequency: &str, source: &str) -> Result<ScheduleStatus, SchedulerError> {
        self.schedule_at(frequency, source, Utc::now())
    }

    /// Replaces any existing registration with one recurring trigger. Calling
    /// it again with the same arguments leaves exactly one registration.
    pub fn schedule_at(
        &self,
        frequency: &str,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<ScheduleStatus, SchedulerError> {
        let frequency = frequency
            .parse::<Frequency>()
            .map_err(|_| SchedulerError::InvalidFrequency(frequency.to_string()))?;
        if source.trim().is_empty() {
            return Err(SchedulerError::MissingSource);
        }
        let source = source
            .parse::<SourceKind>()
            .map_err(|_| SchedulerError::InvalidSource(source.to_string()))?;

        let cleared = self.clear_registrations(SCHEDULE_HOOK)?;
        let trigger = Trigger {
            fire_at: now + Duration::seconds(frequency.interval_secs()),
            interval_secs: Some(frequency.interval_secs()),
        };
        self.timers
            .register(SCHEDULE_HOOK, trigger, &json!({ "source": source }))?;
        self.store.put_json(keys::SCHEDULED_FREQUENCY, &frequency)?;
        self.store.put_json(keys::SCHEDULED_SOURCE, &source)?;

        if self.timers.is_disabled() {
            warn!(
                frequency = %frequency,
                "import scheduled while the timer substrate is disabled; it will not fire"
            );
        }
        info!(
            frequency = %frequency,
            source = %source,
            replaced = cleared,
            next_fire_at = %trigger.fire_at,
            "import scheduled"
        );
        self.status()
    }

    /// Removes every pending registration under the schedule hook and returns
    /// how many were removed.
    pub fn unschedule(&self) -> Result<usize, SchedulerError> {
        let removed = self.clear_registrations(SCHEDULE_HOOK)?;
        self.store.delete(keys::SCHEDULED_FREQUENCY)?;
        self.store.delete(keys::SCHEDULED_SOURCE)?;
        info!(removed, "import unscheduled");
        Ok(removed)
    }

    fn clear_registrations(&self, hook: &str) -> Result<usize, TimerError> {
        let mut removed = 0;
        while self.timers.unregister(hook)? {
            removed += 1;
        }
        Ok(removed)
    }

    pub fn status(&self) -> Result<ScheduleStatus, SchedulerError> {
        let next_fire_at = self.timers.next_fire(SCHEDULE_HOOK)?;
        let pending_registrations = self.timers.pending(SCHEDULE_HOOK)?;
        let frequency = self.store.get_json::<Frequency>(keys::SCHEDULED_FREQUENCY)?;
        let source = self.store.get_json::<SourceKind>(keys::SCHEDULED_SOURCE)?;
        let timers_disabled = self.timers.is_disabled();
        let is_scheduled = next_fire_at.is_some();

        Ok(ScheduleStatus {
            is_scheduled,
            frequency,
            source,
            next_fire_at,
            pending_registrations,
            timers_disabled,
            degraded: timers_disabled && (is_scheduled || frequency.is_some()),
            available_intervals: available_intervals(),
        })
    }

    pub fn debug(&self) -> Result<SchedulerDebug, SchedulerError> {
        self.debug_at(Utc::now())
    }

    pub fn debug_at(&self, now: DateTime<Utc>) -> Result<SchedulerDebug, SchedulerError> {
        let registrations = match self.timers.registrations(SCHEDULE_HOOK) {
            Ok(registrations) => Some(
                registrations
                    .into_iter()
                    .map(|registration| PendingRegistration {
                        seconds_until_fire: (registration.fire_at - now).num_seconds(),
                        registration,
                    })
                    .collect(),
            ),
            Err(TimerError::IntrospectionUnsupported) => None,
            Err(err) => return Err(err.into()),
        };

        let mut options = BTreeMap::new();
        for key in DEBUG_OPTION_KEYS {
            options.insert(key, self.store.get_json::<Value>(key)?);
        }

        Ok(SchedulerDebug {
            generated_at: now,
            hook: SCHEDULE_HOOK,
            timers_disabled: self.timers.is_disabled(),
            registrations,
            options,
        })
    }

    /// Runs the scheduled import with the saved source and mapping. Failures
    /// are recorded in the progress snapshot and returned; nothing is retried.
    pub fn fire(
        &self,
        executor: &ImportExecutor<'_>,
        payload: &Value,
    ) -> Result<ImportSummary, ImportError> {
        let from_payload = payload
            .get("source")
            .and_then(Value::as_str)
            .and_then(|name| name.parse::<SourceKind>().ok());
        let source = match from_payload {
            Some(source) => Some(source),
            None => self.store.get_json::<SourceKind>(keys::SCHEDULED_SOURCE)?,
        };

        let Some(source) = source else {
            let err = ImportError::InvalidConfig {
                errors: vec!["no scheduled source saved".to_string()],
            };
            warn!(error = %err, "scheduled import skipped");
            return Err(err);
        };

        let result = match self.store.get_json::<ColumnMapping>(keys::COLUMN_MAPPING)? {
            Some(mapping) => executor.run(source, &mapping, SCHEDULER_ACTOR),
            None => Err(ImportError::MissingMapping),
        };

        if let Err(err) = &result {
            warn!(source = %source, kind = err.kind(), error = %err, "scheduled import failed");
            if matches!(
                err,
                ImportError::InvalidConfig { .. } | ImportError::MissingMapping
            ) {
                let progress = ProgressStore::new(self.store.clone());
                if let Err(store_err) =
                    progress.record_failure(source, SCHEDULER_ACTOR, &err.to_string(), Utc::now())
                {
                    warn!(error = %store_err, "failed to record scheduled failure");
                }
            }
        }
        result
    }

    pub fn test_scheduler(&self) -> Result<SelfTestReport, SchedulerError> {
        self.test_scheduler_at(Utc::now())
    }

    /// Registers a one-off trigger shortly in the future, reads it back and
    /// removes it again. No schedule state changes.
    pub fn test_scheduler_at(&self, now: DateTime<Utc>) -> Result<SelfTestReport, SchedulerError> {
        self.clear_registrations(SELF_TEST_HOOK)?;
        let expected = now + Duration::seconds(SELF_TEST_DELAY_SECS);
        self.timers.register(
            SELF_TEST_HOOK,
            Trigger {
                fire_at: expected,
                interval_secs: None,
            },
            &json!({ "self_test": true }),
        )?;

        let observed = self.timers.next_fire(SELF_TEST_HOOK);
        let cleanup = self.clear_registrations(SELF_TEST_HOOK);

        let observed = match observed {
            Ok(Some(observed)) => observed,
            Ok(None) => {
                return Err(SchedulerError::SubstrateUnavailable(
                    "registered trigger is not visible to the substrate".to_string(),
                ));
            }
            Err(TimerError::IntrospectionUnsupported) => {
                return Err(SchedulerError::SubstrateUnavailable(
                    "substrate cannot report pending triggers".to_string(),
                ));
            }
            Err(err) => return Err(err.into()),
        };
        cleanup?;

        let drift_secs = (observed - expected).num_seconds().abs();
        if drift_secs > SELF_TEST_TOLERANCE_SECS {
            return Err(SchedulerError::SubstrateUnavailable(format!(
                "trigger expected at {expected} but reported at {observed}"
            )));
        }

        info!(drift_secs, "scheduler self-test passed");
        Ok(SelfTestReport {
            expected_fire_at: expected,
            observed_fire_at: observed,
            drift_secs,
            timers_disabled: self.timers.is_disabled(),
        })
    }
}
