use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::import::{ImportLock, ProgressStore};
use crate::model::{Frequency, HostLimits};
use crate::scheduler::{SCHEDULE_HOOK, TimerSubstrate};
use crate::store::{Store, keys};

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub issues_count: usize,
    pub issues: Vec<String>,
    /// Named checks; `true` means OK.
    pub checks: BTreeMap<&'static str, bool>,
}

pub struct HealthChecker<'a> {
    store: &'a Store,
    timers: &'a dyn TimerSubstrate,
    limits: HostLimits,
}

impl<'a> HealthChecker<'a> {
    pub fn new(store: &'a Store, timers: &'a dyn TimerSubstrate, limits: HostLimits) -> Self {
        Self {
            store,
            timers,
            limits,
        }
    }

    pub fn run(&self) -> Result<HealthReport, StoreError> {
        self.run_at(Utc::now())
    }

    pub fn run_at(&self, now: DateTime<Utc>) -> Result<HealthReport, StoreError> {
        let config = self.store.settings()?;
        let lock = ImportLock::new(self.store.clone(), config.max_execution_secs);
        let lock_info = lock.info_at(now)?;
        let progress = ProgressStore::new(self.store.clone()).load()?;

        let mut checks = BTreeMap::new();
        let mut issues = Vec::new();
        let mut check = |name: &'static str, ok: bool, issue: String| {
            checks.insert(name, ok);
            if !ok {
                issues.push(issue);
            }
        };

        check(
            "memory_ok",
            config.max_memory_mb > 0 && config.max_memory_mb <= self.limits.max_memory_mb,
            format!(
                "memory limit {} MB is outside the host ceiling of {} MB",
                config.max_memory_mb, self.limits.max_memory_mb
            ),
        );
        check(
            "time_ok",
            config.max_execution_secs > 0
                && config.max_execution_secs <= self.limits.max_execution_secs,
            format!(
                "execution limit {} s is outside the host ceiling of {} s",
                config.max_execution_secs, self.limits.max_execution_secs
            ),
        );
        check(
            "source_root_ok",
            config.local_root.is_dir(),
            format!(
                "local import root {} is not a readable directory",
                config.local_root.display()
            ),
        );
        check(
            "import_locks_ok",
            !lock_info.as_ref().is_some_and(|info| info.stale),
            format!(
                "stale import lock held by {}",
                lock_info
                    .as_ref()
                    .map(|info| info.locked_by.as_str())
                    .unwrap_or("unknown")
            ),
        );

        let lock_live = lock_info.as_ref().is_some_and(|info| !info.stale);
        check(
            "no_stuck_processes",
            !progress.running || lock_live,
            "progress reports a running import but no live lock exists".to_string(),
        );
        check(
            "timers_ok",
            !self.timers.is_disabled(),
            "timer substrate is disabled; scheduled imports will not fire".to_string(),
        );

        let saved_frequency = self
            .store
            .get_json::<Frequency>(keys::SCHEDULED_FREQUENCY)?;
        let pending = self.timers.pending(SCHEDULE_HOOK).ok();
        let consistent = match (saved_frequency, pending) {
            (Some(_), Some(pending)) => pending == 1,
            (None, Some(pending)) => pending == 0,
            (_, None) => false,
        };
        check(
            "schedule_consistent",
            consistent,
            format!(
                "schedule settings and timer registrations disagree ({} registered)",
                pending.map_or_else(|| "unknown".to_string(), |count| count.to_string())
            ),
        );

        let report = HealthReport {
            healthy: issues.is_empty(),
            issues_count: issues.len(),
            issues,
            checks,
        };
        if report.healthy {
            info!("health check passed");
        } else {
            warn!(issues = report.issues_count, "health check found issues");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::model::{ImportConfiguration, SourceKind};
    use crate::scheduler::{Scheduler, SqliteTimers, Trigger};

    fn healthy_store(root: &std::path::Path) -> Store {
        let store = Store::open_in_memory().expect("store");
        let config = ImportConfiguration {
            local_root: root.to_path_buf(),
            ..ImportConfiguration::default()
        };
        store.save_settings(&config).expect("settings");
        store
    }

    #[test]
    fn fresh_installation_is_healthy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = healthy_store(dir.path());
        let timers = SqliteTimers::new(store.clone(), false);

        let report = HealthChecker::new(&store, &timers, HostLimits::default())
            .run()
            .expect("health");

        assert!(report.healthy, "unexpected issues: {:?}", report.issues);
        assert_eq!(report.checks.len(), 7);
        assert!(report.checks.values().all(|ok| *ok));
    }

    #[test]
    fn stale_lock_and_stuck_progress_are_flagged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = healthy_store(dir.path());
        let timers = SqliteTimers::new(store.clone(), false);
        let now = Utc::now();

        let lock = ImportLock::new(store.clone(), 300);
        let abandoned_at = now - Duration::seconds(lock.stale_after_secs() + 60);
        assert!(lock.acquire_at("crashed", abandoned_at).expect("acquire"));
        ProgressStore::new(store.clone())
            .begin(SourceKind::Local, "crashed", 10, abandoned_at)
            .expect("begin");

        let report = HealthChecker::new(&store, &timers, HostLimits::default())
            .run_at(now)
            .expect("health");

        assert!(!report.healthy);
        assert_eq!(report.issues_count, 2);
        assert!(!report.checks["import_locks_ok"]);
        assert!(!report.checks["no_stuck_processes"]);
    }

    #[test]
    fn limits_above_host_ceilings_are_flagged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = healthy_store(dir.path());
        let mut config = store.settings().expect("settings");
        config.max_memory_mb = 8_192;
        config.local_root = dir.path().join("missing");
        store.save_settings(&config).expect("save");
        let timers = SqliteTimers::new(store.clone(), true);

        let report = HealthChecker::new(&store, &timers, HostLimits::default())
            .run()
            .expect("health");

        assert!(!report.checks["memory_ok"]);
        assert!(report.checks["time_ok"]);
        assert!(!report.checks["source_root_ok"]);
        assert!(!report.checks["timers_ok"]);
        assert_eq!(report.issues_count, 3);
    }

    #[test]
    fn duplicate_registrations_make_the_schedule_inconsistent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = healthy_store(dir.path());
        let timers = SqliteTimers::new(store.clone(), false);
        Scheduler::new(&store, &timers)
            .schedule("daily", "local")
            .expect("schedule");
        timers
            .register(
                SCHEDULE_HOOK,
                Trigger {
                    fire_at: Utc::now(),
                    interval_secs: Some(86_400),
                },
                &serde_json::Value::Null,
            )
            .expect("stray registration");

        let report = HealthChecker::new(&store, &timers, HostLimits::default())
            .run()
            .expect("health");

        assert!(!report.checks["schedule_consistent"]);
        assert_eq!(report.issues_count, 1);
    }
}
