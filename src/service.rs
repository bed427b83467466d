//! Request surface of the import pipeline.
//!
//! Every operator or timer action is a [`Request`]; [`ImportService::handle`]
//! answers each one with a [`Response`] envelope that is serialized as-is by
//! the CLI.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::{ImportError, SchedulerError, SourceError, StoreError, TimerError};
use crate::health::HealthChecker;
use crate::import::{
    ImportExecutor, ImportLock, ProgressStore, RecordStore, SqliteRecordStore, request_cancel,
};
use crate::mapping::{ColumnMapper, ColumnMapping};
use crate::model::{HostLimits, LastRun, SourceKind, ValidateTarget};
use crate::scheduler::{SCHEDULE_HOOK, Scheduler, SqliteTimers, TimerSubstrate};
use crate::source::{HttpFetcher, RemoteFetcher, SourceReader};
use crate::store::{Store, keys};
use crate::validator::ConfigValidator;

#[derive(Debug, Clone)]
pub enum Request {
    Validate { target: ValidateTarget },
    StartImport {
        source: SourceKind,
        mapping: Option<ColumnMapping>,
    },
    GetProgress,
    GetProgressExtended,
    CancelImport,
    EmergencyReset,
    SchedulerStatus,
    Schedule { frequency: String, source: String },
    Unschedule,
    SchedulerTest,
    SchedulerDebug,
    Health,
    Tick,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn with_outcome(success: bool, data: Value) -> Self {
        Self {
            success,
            data: Some(data),
            error: None,
        }
    }

    fn failed(error: ErrorBody) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

impl From<ImportError> for ErrorBody {
    fn from(err: ImportError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            details: err.details(),
        }
    }
}

impl From<SchedulerError> for ErrorBody {
    fn from(err: SchedulerError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            details: Vec::new(),
        }
    }
}

impl From<SourceError> for ErrorBody {
    fn from(err: SourceError) -> Self {
        Self {
            kind: "source".to_string(),
            message: err.to_string(),
            details: vec![err.kind().to_string()],
        }
    }
}

impl From<StoreError> for ErrorBody {
    fn from(err: StoreError) -> Self {
        Self {
            kind: "storage".to_string(),
            message: err.to_string(),
            details: Vec::new(),
        }
    }
}

impl From<TimerError> for ErrorBody {
    fn from(err: TimerError) -> Self {
        Self {
            kind: "timer".to_string(),
            message: err.to_string(),
            details: Vec::new(),
        }
    }
}

impl From<serde_json::Error> for ErrorBody {
    fn from(err: serde_json::Error) -> Self {
        Self {
            kind: "serialization".to_string(),
            message: err.to_string(),
            details: Vec::new(),
        }
    }
}

type Handled = std::result::Result<Response, ErrorBody>;

pub struct ImportService {
    store: Store,
    limits: HostLimits,
    actor: String,
    fetcher: Box<dyn RemoteFetcher>,
    records: Box<dyn RecordStore>,
    timers: Box<dyn TimerSubstrate>,
}

impl ImportService {
    /// Wires the default collaborators: HTTP fetcher, the `records` table and
    /// the `timers` table.
    pub fn open(store: Store, limits: HostLimits, actor: &str) -> Result<Self> {
        let settings = store
            .settings()
            .context("failed to load import settings")?;
        let fetcher = HttpFetcher::new().context("failed to build HTTP client")?;
        let records =
            SqliteRecordStore::new(store.clone(), &settings.key_field, settings.skip_duplicates);
        let timers = SqliteTimers::from_env(store.clone());

        Ok(Self::from_parts(
            store,
            limits,
            actor,
            Box::new(fetcher),
            Box::new(records),
            Box::new(timers),
        ))
    }

    pub fn from_parts(
        store: Store,
        limits: HostLimits,
        actor: &str,
        fetcher: Box<dyn RemoteFetcher>,
        records: Box<dyn RecordStore>,
        timers: Box<dyn TimerSubstrate>,
    ) -> Self {
        Self {
            store,
            limits,
            actor: actor.to_string(),
            fetcher,
            records,
            timers,
        }
    }

    pub fn handle(&self, request: Request) -> Response {
        debug!(request = ?request, actor = %self.actor, "handling request");
        let handled = match request {
            Request::Validate { target } => self.validate(target),
            Request::StartImport { source, mapping } => self.start_import(source, mapping),
            Request::GetProgress => self.progress(),
            Request::GetProgressExtended => self.progress_extended(),
            Request::CancelImport => self.cancel_import(),
            Request::EmergencyReset => self.emergency_reset(),
            Request::SchedulerStatus => self.scheduler_status(),
            Request::Schedule { frequency, source } => self.schedule(&frequency, &source),
            Request::Unschedule => self.unschedule(),
            Request::SchedulerTest => self.scheduler_test(),
            Request::SchedulerDebug => self.scheduler_debug(),
            Request::Health => self.health(),
            Request::Tick => self.tick(),
        };
        handled.unwrap_or_else(Response::failed)
    }

    fn executor(&self) -> ImportExecutor<'_> {
        ImportExecutor::new(
            &self.store,
            self.fetcher.as_ref(),
            self.records.as_ref(),
            self.limits,
        )
    }

    fn scheduler(&self) -> Scheduler<'_> {
        Scheduler::new(&self.store, self.timers.as_ref())
    }

    fn validate(&self, target: ValidateTarget) -> Handled {
        let config = self.store.settings()?;
        let source = match target {
            ValidateTarget::Config => {
                let report =
                    ConfigValidator::new(self.fetcher.as_ref(), self.limits).validate(&config);
                return Ok(Response::with_outcome(report.valid, serde_json::to_value(&report)?));
            }
            ValidateTarget::Remote => SourceKind::Remote,
            ValidateTarget::Local => SourceKind::Local,
        };

        let reader = SourceReader::new(self.fetcher.as_ref(), &config);
        let table = reader.read(source, config.location(source), Some(reader.sample_rows()))?;
        let mapper = ColumnMapper::new(&config.known_fields);
        let inferred = mapper.infer_mapping(&table.headers);
        let missing_required =
            mapper.uncovered_required(&inferred, &table.headers, &config.required_fields);
        let saved = self.store.get_json::<ColumnMapping>(keys::COLUMN_MAPPING)?;

        info!(
            source = %source,
            columns = table.headers.len(),
            sample_rows = table.sample.len(),
            missing_required = missing_required.len(),
            "source preview ready"
        );
        Ok(Response::ok(json!({
            "source": source,
            "columns": table.headers,
            "sample": table.sample,
            "parse_errors": table.parse_errors(),
            "issues": table.issues(),
            "inferred_mapping": inferred,
            "saved_mapping": saved,
            "known_fields": config.known_fields,
            "required_fields": config.required_fields,
            "missing_required": missing_required,
        })))
    }

    /// An explicit mapping becomes the saved one only once a run has taken the
    /// lock and passed its checks; refused starts keep the previous mapping.
    fn start_import(&self, source: SourceKind, mapping: Option<ColumnMapping>) -> Handled {
        let (mapping, explicit) = match mapping {
            Some(mapping) => (mapping, true),
            None => (
                self.store
                    .get_json::<ColumnMapping>(keys::COLUMN_MAPPING)?
                    .ok_or(ImportError::MissingMapping)?,
                false,
            ),
        };

        let outcome = self.executor().run(source, &mapping, &self.actor);
        let started = matches!(outcome, Ok(_) | Err(ImportError::ExecutionFailed { .. }));
        if explicit && started {
            match self.store.put_json(keys::COLUMN_MAPPING, &mapping) {
                Ok(()) => debug!(columns = mapping.len(), "saved column mapping"),
                Err(err) => warn!(error = %err, "failed to save column mapping"),
            }
        }

        let summary = outcome?;
        Ok(Response::ok(serde_json::to_value(&summary)?))
    }

    fn progress(&self) -> Handled {
        let progress = ProgressStore::new(self.store.clone()).load()?;
        Ok(Response::ok(serde_json::to_value(&progress)?))
    }

    fn progress_extended(&self) -> Handled {
        let config = self.store.settings()?;
        let progress = ProgressStore::new(self.store.clone()).load()?;
        let lock = ImportLock::new(self.store.clone(), config.max_execution_secs).info()?;
        let last_run = self.store.get_json::<LastRun>(keys::LAST_RUN)?;
        let health = HealthChecker::new(&self.store, self.timers.as_ref(), self.limits).run()?;

        let scheduler = match self.scheduler().status() {
            Ok(status) => json!({
                "is_scheduled": status.is_scheduled,
                "next_fire_at": status.next_fire_at,
                "degraded": status.degraded,
            }),
            Err(err) => {
                warn!(error = %err, "scheduler status unavailable");
                Value::Null
            }
        };

        Ok(Response::ok(json!({
            "progress": progress,
            "lock_info": lock,
            "scheduler": scheduler,
            "last_run": last_run,
            "health": {
                "healthy": health.healthy,
                "issues_count": health.issues_count,
                "issues": health.issues,
            },
        })))
    }

    fn cancel_import(&self) -> Handled {
        let config = self.store.settings()?;
        let lock = ImportLock::new(self.store.clone(), config.max_execution_secs);

        if lock.is_held()? {
            request_cancel(&self.store)?;
            info!(actor = %self.actor, "cancel requested for running import");
            return Ok(Response::ok(json!({
                "cancel_requested": true,
                "progress_reset": false,
            })));
        }

        let reset = ProgressStore::new(self.store.clone())
            .reset_abandoned("cancelled by operator; no live import held the lock", Utc::now())?;
        if reset {
            warn!(actor = %self.actor, "reset progress of an abandoned import");
        }
        Ok(Response::ok(json!({
            "cancel_requested": false,
            "progress_reset": reset,
        })))
    }

    fn emergency_reset(&self) -> Handled {
        let config = self.store.settings()?;
        let mut actions = Vec::new();

        if ProgressStore::new(self.store.clone()).reset_abandoned("reset by operator", Utc::now())? {
            actions.push("import progress reset".to_string());
        }
        if ImportLock::new(self.store.clone(), config.max_execution_secs).force_release()? {
            actions.push("import lock released".to_string());
        }
        if self.store.delete(keys::CANCEL_REQUESTED)? {
            actions.push("pending cancel request cleared".to_string());
        }
        let removed = self.scheduler().unschedule()?;
        actions.push(format!("scheduler reset ({removed} registrations removed)"));

        warn!(actor = %self.actor, actions = ?actions, "emergency reset performed");
        Ok(Response::ok(json!({
            "actions_performed": actions,
            "timestamp": Utc::now(),
        })))
    }

    fn scheduler_status(&self) -> Handled {
        let status = self.scheduler().status()?;
        Ok(Response::ok(serde_json::to_value(&status)?))
    }

    fn schedule(&self, frequency: &str, source: &str) -> Handled {
        let status = self.scheduler().schedule(frequency, source)?;
        Ok(Response::ok(serde_json::to_value(&status)?))
    }

    fn unschedule(&self) -> Handled {
        let removed = self.scheduler().unschedule()?;
        Ok(Response::ok(json!({ "removed": removed })))
    }

    fn scheduler_test(&self) -> Handled {
        let report = self.scheduler().test_scheduler()?;
        Ok(Response::ok(serde_json::to_value(&report)?))
    }

    fn scheduler_debug(&self) -> Handled {
        let debug = self.scheduler().debug()?;
        Ok(Response::ok(serde_json::to_value(&debug)?))
    }

    fn health(&self) -> Handled {
        let report = HealthChecker::new(&self.store, self.timers.as_ref(), self.limits).run()?;
        Ok(Response::with_outcome(report.healthy, serde_json::to_value(&report)?))
    }

    /// Fires every due registration of the timer table. Failures of scheduled
    /// imports are reported per firing and never retried.
    fn tick(&self) -> Handled {
        if self.timers.is_disabled() {
            warn!("timer substrate disabled; nothing fired");
            return Ok(Response::ok(json!({ "fired": 0, "timers_disabled": true })));
        }

        let due = self.timers.take_due(Utc::now())?;
        let scheduler = self.scheduler();
        let executor = self.executor();
        let mut results = Vec::new();

        for timer in due {
            if timer.hook != SCHEDULE_HOOK {
                debug!(hook = %timer.hook, token = timer.token, "no handler for timer hook");
                continue;
            }
            let result = match scheduler.fire(&executor, &timer.payload) {
                Ok(summary) => json!({
                    "token": timer.token,
                    "fired_for": timer.fired_for,
                    "success": true,
                    "summary": summary,
                }),
                Err(err) => json!({
                    "token": timer.token,
                    "fired_for": timer.fired_for,
                    "success": false,
                    "error": ErrorBody::from(err),
                }),
            };
            results.push(result);
        }

        Ok(Response::ok(json!({
            "fired": results.len(),
            "timers_disabled": false,
            "results": results,
        })))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::model::{Progress, RunStatus};
    use crate::scheduler::Trigger;
    use crate::testing::{FakeFetcher, MemoryRecords, local_config, write_file};

    fn service(store: &Store, fetcher: FakeFetcher, timers_disabled: bool) -> ImportService {
        ImportService::from_parts(
            store.clone(),
            HostLimits::default(),
            "operator",
            Box::new(fetcher),
            Box::new(MemoryRecords::default()),
            Box::new(SqliteTimers::new(store.clone(), timers_disabled)),
        )
    }

    fn local_store(dir: &std::path::Path, body: &str) -> Store {
        write_file(dir, "pages.csv", body);
        let store = Store::open_in_memory().expect("store");
        store
            .save_settings(&local_config(dir, "pages.csv"))
            .expect("settings");
        store
    }

    fn data(response: &Response) -> &Value {
        response.data.as_ref().expect("response carries data")
    }

    #[test]
    fn start_without_any_mapping_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = local_store(dir.path(), "Title\nHello\n");
        let service = service(&store, FakeFetcher::default(), false);

        let response = service.handle(Request::StartImport {
            source: SourceKind::Local,
            mapping: None,
        });

        assert!(!response.success);
        let error = response.error.expect("error body");
        assert_eq!(error.kind, "missing_mapping");
    }

    #[test]
    fn explicit_mapping_is_saved_for_later_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = local_store(dir.path(), "Title\nHello\n");
        let service = service(&store, FakeFetcher::default(), false);
        let mapping = ColumnMapping::from([("Title".to_string(), Some("title".to_string()))]);

        let first = service.handle(Request::StartImport {
            source: SourceKind::Local,
            mapping: Some(mapping.clone()),
        });
        assert!(first.success, "{:?}", first.error);
        assert_eq!(data(&first)["processed"], 1);

        let saved: Option<ColumnMapping> = store.get_json(keys::COLUMN_MAPPING).expect("read");
        assert_eq!(saved, Some(mapping));

        let second = service.handle(Request::StartImport {
            source: SourceKind::Local,
            mapping: None,
        });
        assert!(second.success, "{:?}", second.error);
    }

    #[test]
    fn local_preview_reports_columns_and_inferred_mapping() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = local_store(dir.path(), "Title,E-Mail\nAda,ada@example.org\nBad\n");
        let service = service(&store, FakeFetcher::default(), false);

        let response = service.handle(Request::Validate {
            target: ValidateTarget::Local,
        });

        assert!(response.success, "{:?}", response.error);
        let data = data(&response);
        assert_eq!(data["columns"], json!(["Title", "E-Mail"]));
        assert_eq!(data["sample"], json!([["Ada", "ada@example.org"]]));
        assert_eq!(data["parse_errors"], 1);
        assert_eq!(data["inferred_mapping"]["Title"], "title");
        assert_eq!(data["inferred_mapping"]["E-Mail"], Value::Null);
        assert_eq!(data["missing_required"], json!([]));
    }

    #[test]
    fn config_validation_reports_outcome_in_the_envelope() {
        let store = Store::open_in_memory().expect("store");
        let service = service(&store, FakeFetcher::default(), false);

        let response = service.handle(Request::Validate {
            target: ValidateTarget::Config,
        });

        assert!(!response.success);
        assert_eq!(data(&response)["valid"], false);
        assert_eq!(data(&response)["source_readiness"]["local_ready"], false);
    }

    #[test]
    fn cancel_sets_the_flag_while_a_run_holds_the_lock() {
        let store = Store::open_in_memory().expect("store");
        let service = service(&store, FakeFetcher::default(), false);
        assert!(ImportLock::new(store.clone(), 300).acquire("alice").expect("acquire"));

        let response = service.handle(Request::CancelImport);

        assert_eq!(data(&response)["cancel_requested"], true);
        assert!(crate::import::cancel_requested(&store).expect("flag"));
    }

    #[test]
    fn cancel_resets_progress_left_by_a_crashed_run() {
        let store = Store::open_in_memory().expect("store");
        let service = service(&store, FakeFetcher::default(), false);
        ProgressStore::new(store.clone())
            .begin(SourceKind::Remote, "crashed", 100, Utc::now())
            .expect("begin");

        let response = service.handle(Request::CancelImport);

        assert_eq!(data(&response)["cancel_requested"], false);
        assert_eq!(data(&response)["progress_reset"], true);
        let progress: Progress = ProgressStore::new(store.clone()).load().expect("progress");
        assert_eq!(progress.status, RunStatus::Cancelled);
    }

    #[test]
    fn emergency_reset_clears_every_piece_of_run_state() {
        let store = Store::open_in_memory().expect("store");
        let service = service(&store, FakeFetcher::default(), false);
        assert!(ImportLock::new(store.clone(), 300).acquire("alice").expect("acquire"));
        ProgressStore::new(store.clone())
            .begin(SourceKind::Local, "alice", 10, Utc::now())
            .expect("begin");
        request_cancel(&store).expect("cancel");
        service.handle(Request::Schedule {
            frequency: "hourly".to_string(),
            source: "local".to_string(),
        });

        let response = service.handle(Request::EmergencyReset);

        assert!(response.success);
        let actions = data(&response)["actions_performed"]
            .as_array()
            .expect("actions list")
            .len();
        assert_eq!(actions, 4);
        assert!(!ImportLock::new(store.clone(), 300).is_held().expect("lock"));
        let status = service.handle(Request::SchedulerStatus);
        assert_eq!(data(&status)["is_scheduled"], false);
    }

    #[test]
    fn extended_progress_includes_lock_and_scheduler_state() {
        let store = Store::open_in_memory().expect("store");
        let service = service(&store, FakeFetcher::default(), false);
        assert!(ImportLock::new(store.clone(), 300).acquire("alice").expect("acquire"));

        let response = service.handle(Request::GetProgressExtended);

        let data = data(&response);
        assert_eq!(data["lock_info"]["locked_by"], "alice");
        assert_eq!(data["lock_info"]["stale"], false);
        assert_eq!(data["scheduler"]["is_scheduled"], false);
        assert!(data["health"]["issues_count"].is_number());
    }

    #[test]
    fn tick_fires_due_schedule_and_rearms_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = local_store(dir.path(), "Title\nTimed\n");
        store
            .put_json(
                keys::COLUMN_MAPPING,
                &ColumnMapping::from([("Title".to_string(), Some("title".to_string()))]),
            )
            .expect("mapping");
        let service = service(&store, FakeFetcher::default(), false);
        let timers = SqliteTimers::new(store.clone(), false);
        timers
            .register(
                SCHEDULE_HOOK,
                Trigger {
                    fire_at: Utc::now() - Duration::seconds(5),
                    interval_secs: Some(3_600),
                },
                &json!({ "source": "local" }),
            )
            .expect("register");

        let response = service.handle(Request::Tick);

        assert!(response.success);
        assert_eq!(data(&response)["fired"], 1);
        assert_eq!(data(&response)["results"][0]["success"], true);
        assert_eq!(timers.pending(SCHEDULE_HOOK).expect("pending"), 1);
        let last_run: LastRun = store.get_json(keys::LAST_RUN).expect("read").expect("run");
        assert_eq!(last_run.actor, "scheduler");
    }

    #[test]
    fn tick_refuses_to_fire_when_timers_are_disabled() {
        let store = Store::open_in_memory().expect("store");
        let service = service(&store, FakeFetcher::default(), true);

        let response = service.handle(Request::Tick);

        assert!(response.success);
        assert_eq!(data(&response)["fired"], 0);
        assert_eq!(data(&response)["timers_disabled"], true);
    }

    #[test]
    fn refused_start_keeps_the_saved_mapping() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = local_store(dir.path(), "Title,Body\nHello,World\n");
        let saved = ColumnMapping::from([("Title".to_string(), Some("title".to_string()))]);
        store.put_json(keys::COLUMN_MAPPING, &saved).expect("mapping");
        let service = service(&store, FakeFetcher::default(), false);

        assert!(ImportLock::new(store.clone(), 300).acquire("scheduler").expect("acquire"));
        let busy = service.handle(Request::StartImport {
            source: SourceKind::Local,
            mapping: Some(ColumnMapping::from([("Title".to_string(), None)])),
        });
        assert_eq!(busy.error.expect("error body").kind, "already_running");
        ImportLock::new(store.clone(), 300).force_release().expect("release");

        let unmapped = service.handle(Request::StartImport {
            source: SourceKind::Local,
            mapping: Some(ColumnMapping::from([("Body".to_string(), Some("content".to_string()))])),
        });
        assert_eq!(unmapped.error.expect("error body").kind, "invalid_config");

        let after: Option<ColumnMapping> = store.get_json(keys::COLUMN_MAPPING).expect("read");
        assert_eq!(after, Some(saved));
    }

    #[test]
    fn preview_with_zero_sample_rows_uses_the_default_sample() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = local_store(dir.path(), "Title\nOne\nTwo\n");
        let mut settings = store.settings().expect("settings");
        settings.sample_rows = 0;
        store.save_settings(&settings).expect("save");
        let service = service(&store, FakeFetcher::default(), false);

        let response = service.handle(Request::Validate {
            target: ValidateTarget::Local,
        });

        assert!(response.success, "{:?}", response.error);
        assert_eq!(data(&response)["sample"], json!([["One"], ["Two"]]));
    }

    #[test]
    fn scheduler_debug_lists_the_schedule_registration() {
        let store = Store::open_in_memory().expect("store");
        let service = service(&store, FakeFetcher::default(), false);
        service.handle(Request::Schedule {
            frequency: "weekly".to_string(),
            source: "remote".to_string(),
        });

        let response = service.handle(Request::SchedulerDebug);

        assert!(response.success, "{:?}", response.error);
        let data = data(&response);
        assert_eq!(data["hook"], SCHEDULE_HOOK);
        assert_eq!(data["registrations"].as_array().expect("list").len(), 1);
        assert_eq!(data["registrations"][0]["interval_secs"], 604_800);
        assert_eq!(data["options"]["scheduled_source"], "remote");
    }
}
