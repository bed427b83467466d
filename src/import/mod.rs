//! One end-to-end import run: lock, validate, read, map, write, report.

mod lock;
mod progress;
mod records;

use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{ImportError, StoreError};
use crate::mapping::{ColumnMapper, ColumnMapping, CompiledMapping};
use crate::model::{
    HostLimits, ImportConfiguration, ImportSummary, LastRun, Progress, RunStatus, SourceKind,
};
use crate::source::{ParsedTable, RemoteFetcher, SourceReader};
use crate::store::{Store, keys};
use crate::validator::ConfigValidator;

pub use lock::ImportLock;
pub use progress::ProgressStore;
pub use records::{RecordOutcome, RecordStore, SqliteRecordStore};

const MIN_BATCH_ROWS: u64 = 10;
const MAX_BATCH_ROWS: u64 = 1000;

/// Rows per batch, derived from the configured limits: tighter memory or time
/// budgets mean smaller batches and more frequent progress writes.
pub fn batch_size(config: &ImportConfiguration) -> usize {
    let by_memory = config.max_memory_mb / 2;
    let by_time = config.max_execution_secs / 2;
    by_memory.min(by_time).clamp(MIN_BATCH_ROWS, MAX_BATCH_ROWS) as usize
}

pub fn cancel_requested(store: &Store) -> Result<bool, StoreError> {
    Ok(store.get_json::<bool>(keys::CANCEL_REQUESTED)?.unwrap_or(false))
}

pub fn request_cancel(store: &Store) -> Result<(), StoreError> {
    store.put_json(keys::CANCEL_REQUESTED, &true)
}

#[derive(Default)]
struct RunCounts {
    rows: u64,
    row_errors: u64,
    created: u64,
    updated: u64,
}

impl RunCounts {
    fn processed(&self, table: &ParsedTable) -> u64 {
        self.rows + table.parse_errors()
    }

    fn errors(&self, table: &ParsedTable) -> u64 {
        self.row_errors + table.parse_errors()
    }
}

pub struct ImportExecutor<'a> {
    store: &'a Store,
    fetcher: &'a dyn RemoteFetcher,
    records: &'a dyn RecordStore,
    limits: HostLimits,
}

impl<'a> ImportExecutor<'a> {
    pub fn new(
        store: &'a Store,
        fetcher: &'a dyn RemoteFetcher,
        records: &'a dyn RecordStore,
        limits: HostLimits,
    ) -> Self {
        Self {
            store,
            fetcher,
            records,
            limits,
        }
    }

    pub fn run(
        &self,
        source: SourceKind,
        mapping: &ColumnMapping,
        actor: &str,
    ) -> Result<ImportSummary, ImportError> {
        let config = self.store.settings()?;
        let lock = ImportLock::new(self.store.clone(), config.max_execution_secs);
        let Some(guard) = lock.guard(actor)? else {
            let locked_by = lock
                .info()?
                .map(|info| info.locked_by)
                .unwrap_or_default();
            warn!(actor, locked_by = %locked_by, "import already running");
            return Err(ImportError::AlreadyRunning { locked_by });
        };
        debug!(actor, locked_at = guard.owner().locked_at, "import lock acquired");
        self.store.delete(keys::CANCEL_REQUESTED)?;

        let report = ConfigValidator::new(self.fetcher, self.limits).validate(&config);
        let blocking = report.blocking_for(source);
        if !blocking.is_empty() {
            warn!(source = %source, errors = blocking.len(), "import configuration rejected");
            return Err(ImportError::InvalidConfig { errors: blocking });
        }

        let progress_store = ProgressStore::new(self.store.clone());
        let reader = SourceReader::new(self.fetcher, &config);
        let mut table = match reader.read(source, config.location(source), None) {
            Ok(table) => table,
            Err(err) => {
                if let Err(store_err) =
                    progress_store.record_failure(source, actor, &err.to_string(), Utc::now())
                {
                    warn!(error = %store_err, "failed to record source failure");
                }
                return Err(err.into());
            }
        };

        let compiled = ColumnMapper::new(&config.known_fields).compile(mapping, &table.headers);
        let uncovered = compiled.uncovered(&config.required_fields);
        if !uncovered.is_empty() {
            warn!(source = %source, uncovered = ?uncovered, "mapping leaves required fields unmapped");
            return Err(ImportError::InvalidConfig {
                errors: uncovered
                    .iter()
                    .map(|field| format!("required field {field} is not mapped to any column"))
                    .collect(),
            });
        }
        let total = table.total_hint.unwrap_or(0);
        let batch_rows = batch_size(&config);
        info!(
            source = %source,
            actor,
            total,
            batch_rows,
            mapped_fields = compiled.mapped_fields().len(),
            "starting import"
        );

        let started = Instant::now();
        let mut progress = progress_store.begin(source, actor, total, Utc::now())?;
        let mut counts = RunCounts::default();
        let outcome = self.stream_rows(
            &mut table,
            &compiled,
            &config,
            batch_rows,
            &progress_store,
            &mut progress,
            &mut counts,
        );
        let processed = counts.processed(&table);
        let errors = counts.errors(&table);

        let cancelled = match outcome {
            Ok(cancelled) => cancelled,
            Err(message) => {
                warn!(processed, error = %message, "import aborted");
                if let Err(store_err) = progress_store.finish(
                    &mut progress,
                    RunStatus::Failed,
                    Some(message.clone()),
                    Utc::now(),
                ) {
                    warn!(error = %store_err, "failed to record import failure");
                }
                self.write_last_run(source, actor, RunStatus::Failed, processed, errors, &table);
                return Err(ImportError::ExecutionFailed { processed, message });
            }
        };

        let status = if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        progress_store.finish(&mut progress, status, None, Utc::now())?;
        self.store.delete(keys::CANCEL_REQUESTED)?;
        self.write_last_run(source, actor, status, processed, errors, &table);
        drop(guard);

        let summary = ImportSummary {
            success: !cancelled,
            source,
            processed,
            total: progress.total,
            errors,
            parse_errors: table.parse_errors(),
            created: counts.created,
            updated: counts.updated,
            cancelled,
            execution_time: started.elapsed().as_secs_f64(),
            rejected_columns: compiled.rejected,
        };
        info!(
            source = %source,
            processed = summary.processed,
            errors = summary.errors,
            created = summary.created,
            updated = summary.updated,
            cancelled,
            execution_time = summary.execution_time,
            "import finished"
        );
        Ok(summary)
    }

    /// Pushes rows to the record store batch by batch. Returns whether the
    /// run stopped on a cancel request; an error string aborts the run.
    #[allow(clippy::too_many_arguments)]
    fn stream_rows(
        &self,
        table: &mut ParsedTable,
        compiled: &CompiledMapping,
        config: &ImportConfiguration,
        batch_rows: usize,
        progress_store: &ProgressStore,
        progress: &mut Progress,
        counts: &mut RunCounts,
    ) -> Result<bool, String> {
        loop {
            let batch = table.rows().take(batch_rows).collect::<Vec<_>>();
            if batch.is_empty() {
                return Ok(false);
            }

            for row in &batch {
                counts.rows += 1;
                let fields = compiled.apply(row);
                let missing = config
                    .required_fields
                    .iter()
                    .filter(|field| {
                        fields
                            .get(field.as_str())
                            .is_none_or(|value| value.trim().is_empty())
                    })
                    .map(String::as_str)
                    .collect::<Vec<_>>();
                if !missing.is_empty() {
                    counts.row_errors += 1;
                    debug!(row = counts.rows, missing = ?missing, "row lacks required fields");
                    continue;
                }

                match self.records.create_or_update(&config.record_kind, &fields) {
                    Ok(outcome) if outcome.created => counts.created += 1,
                    Ok(_) => counts.updated += 1,
                    Err(err) => return Err(err.to_string()),
                }
            }

            progress_store
                .advance(
                    progress,
                    counts.processed(table),
                    counts.errors(table),
                    Utc::now(),
                )
                .map_err(|err| err.to_string())?;

            if cancel_requested(self.store).map_err(|err| err.to_string())? {
                info!(processed = progress.processed, "import cancelled between batches");
                return Ok(true);
            }
        }
    }

    fn write_last_run(
        &self,
        source: SourceKind,
        actor: &str,
        status: RunStatus,
        processed: u64,
        errors: u64,
        table: &ParsedTable,
    ) {
        let last_run = LastRun {
            finished_at: Utc::now(),
            source,
            actor: actor.to_string(),
            status,
            processed,
            errors,
            source_sha256: table.source_sha256.clone(),
        };
        if let Err(err) = self.store.put_json(keys::LAST_RUN, &last_run) {
            warn!(error = %err, "failed to record last run");
        }
    }
}
