use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::StoreError;
use crate::model::{Progress, RunStatus, SourceKind};
use crate::store::{Store, keys};
use crate::util::format_eta;

/// Persisted record of the current or most recent run. The executor is the
/// only writer; everything else polls [`ProgressStore::load`].
pub struct ProgressStore {
    store: Store,
}

impl ProgressStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn load(&self) -> Result<Progress, StoreError> {
        Ok(self.store.get_json(keys::PROGRESS)?.unwrap_or_default())
    }

    fn save(&self, progress: &Progress) -> Result<(), StoreError> {
        self.store.put_json(keys::PROGRESS, progress)
    }

    pub fn begin(
        &self,
        source: SourceKind,
        actor: &str,
        total: u64,
        now: DateTime<Utc>,
    ) -> Result<Progress, StoreError> {
        let progress = Progress {
            running: true,
            status: RunStatus::Running,
            processed: 0,
            total,
            percent: 0,
            errors: 0,
            source: Some(source),
            actor: Some(actor.to_string()),
            started_at: Some(now),
            updated_at: Some(now),
            eta_human: None,
            last_error: None,
        };
        self.save(&progress)?;
        Ok(progress)
    }

    /// Writes a per-batch snapshot. `processed` never moves backwards and a
    /// known total is raised when the stream turns out longer than counted.
    pub fn advance(
        &self,
        progress: &mut Progress,
        processed: u64,
        errors: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        progress.processed = progress.processed.max(processed);
        progress.errors = progress.errors.max(errors);
        if progress.total > 0 {
            progress.total = progress.total.max(progress.processed);
        }
        progress.percent = percent(progress.processed, progress.total);
        progress.eta_human = eta(progress, now);
        progress.updated_at = Some(now);

        debug!(
            processed = progress.processed,
            total = progress.total,
            percent = progress.percent,
            "progress updated"
        );
        self.save(progress)
    }

    pub fn finish(
        &self,
        progress: &mut Progress,
        status: RunStatus,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        progress.running = false;
        progress.status = status;
        if status == RunStatus::Completed {
            progress.total = progress.total.max(progress.processed);
            progress.percent = if progress.total == 0 { 0 } else { 100 };
        }
        progress.eta_human = None;
        progress.last_error = last_error;
        progress.updated_at = Some(now);
        self.save(progress)
    }

    /// Records a run that failed before any row was read, replacing the
    /// previous run's snapshot.
    pub fn record_failure(
        &self,
        source: SourceKind,
        actor: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let progress = Progress {
            status: RunStatus::Failed,
            source: Some(source),
            actor: Some(actor.to_string()),
            started_at: Some(now),
            updated_at: Some(now),
            last_error: Some(message.to_string()),
            ..Progress::default()
        };
        self.save(&progress)
    }

    /// Marks a snapshot left `running` by a run that no longer holds the lock
    /// as cancelled. Returns whether anything changed.
    pub fn reset_abandoned(&self, reason: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut progress = self.load()?;
        if !progress.running {
            return Ok(false);
        }
        self.finish(
            &mut progress,
            RunStatus::Cancelled,
            Some(reason.to_string()),
            now,
        )?;
        Ok(true)
    }
}

fn percent(processed: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let value = processed.saturating_mul(100) / total;
    value.min(100) as u8
}

fn eta(progress: &Progress, now: DateTime<Utc>) -> Option<String> {
    let started_at = progress.started_at?;
    if progress.total == 0 || progress.processed == 0 {
        return None;
    }
    let remaining = progress.total.saturating_sub(progress.processed);
    if remaining == 0 {
        return None;
    }
    let elapsed = (now - started_at).num_milliseconds().max(0) as f64 / 1000.0;
    let per_row = elapsed / progress.processed as f64;
    Some(format_eta((per_row * remaining as f64).round() as u64))
}
