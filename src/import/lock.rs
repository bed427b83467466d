use chrono::{DateTime, TimeZone, Utc};
use rusqlite::params;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::model::{LockInfo, LockRecord};
use crate::store::{Store, keys};
use crate::util::now_utc_string;

/// Grace period added to the run's wall-clock limit before a lock counts as
/// abandoned.
pub const LOCK_MARGIN_SECS: i64 = 300;

/// Single-flight token stored under [`keys::LOCK`].
pub struct ImportLock {
    store: Store,
    stale_after_secs: i64,
}

impl ImportLock {
    pub fn new(store: Store, max_execution_secs: u64) -> Self {
        let max_execution_secs = i64::try_from(max_execution_secs).unwrap_or(i64::MAX / 2);
        Self {
            store,
            stale_after_secs: max_execution_secs.saturating_add(LOCK_MARGIN_SECS),
        }
    }

    pub fn stale_after_secs(&self) -> i64 {
        self.stale_after_secs
    }

    pub fn acquire(&self, actor: &str) -> Result<bool, StoreError> {
        self.acquire_at(actor, Utc::now())
    }

    /// Takes the lock when it is free or stale. The check and the write are a
    /// single statement, so two processes sharing the database cannot both
    /// succeed.
    pub fn acquire_at(&self, actor: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let record = LockRecord {
            locked_at: now.timestamp(),
            locked_by: actor.to_string(),
        };
        let raw = serde_json::to_string(&record)?;
        let cutoff = record.locked_at - self.stale_after_secs;

        let changed = self.store.connection().execute(
            "
            INSERT INTO options(key, value, updated_at) VALUES(?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at
            WHERE COALESCE(json_extract(options.value, '$.locked_at'), 0) < ?4
            ",
            params![keys::LOCK, raw, now_utc_string(), cutoff],
        )?;

        if changed == 1 {
            info!(actor, "acquired import lock");
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Takes the lock and returns a guard that gives it back when dropped.
    pub fn guard(&self, actor: &str) -> Result<Option<LockGuard<'_>>, StoreError> {
        let now = Utc::now();
        if !self.acquire_at(actor, now)? {
            return Ok(None);
        }
        Ok(Some(LockGuard {
            lock: self,
            owner: LockRecord {
                locked_at: now.timestamp(),
                locked_by: actor.to_string(),
            },
            released: false,
        }))
    }

    /// Releases the lock only if `owner` still holds it; a lock taken over
    /// after going stale is left alone.
    pub fn release(&self, owner: &LockRecord) -> Result<bool, StoreError> {
        let removed = self.store.connection().execute(
            "
            DELETE FROM options
            WHERE key = ?1
              AND json_extract(value, '$.locked_by') = ?2
              AND json_extract(value, '$.locked_at') = ?3
            ",
            params![keys::LOCK, owner.locked_by, owner.locked_at],
        )?;
        if removed > 0 {
            info!(actor = %owner.locked_by, "released import lock");
        }
        Ok(removed > 0)
    }

    pub fn force_release(&self) -> Result<bool, StoreError> {
        let removed = self.store.delete(keys::LOCK)?;
        if removed {
            warn!("import lock force-released");
        }
        Ok(removed)
    }

    pub fn is_held(&self) -> Result<bool, StoreError> {
        Ok(self.info_at(Utc::now())?.is_some_and(|info| !info.stale))
    }

    pub fn info(&self) -> Result<Option<LockInfo>, StoreError> {
        self.info_at(Utc::now())
    }

    pub fn info_at(&self, now: DateTime<Utc>) -> Result<Option<LockInfo>, StoreError> {
        let Some(record) = self.store.get_json::<LockRecord>(keys::LOCK)? else {
            return Ok(None);
        };
        let age = now.timestamp() - record.locked_at;
        Ok(Some(LockInfo {
            locked_at: Utc
                .timestamp_opt(record.locked_at, 0)
                .single()
                .unwrap_or(now),
            locked_by: record.locked_by,
            lock_age_seconds: age.max(0),
            stale: age > self.stale_after_secs,
        }))
    }
}

pub struct LockGuard<'a> {
    lock: &'a ImportLock,
    owner: LockRecord,
    released: bool,
}

impl LockGuard<'_> {
    pub fn owner(&self) -> &LockRecord {
        &self.owner
    }

    pub fn release(mut self) -> Result<bool, StoreError> {
        self.released = true;
        self.lock.release(&self.owner)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.lock.release(&self.owner) {
            warn!(error = %err, actor = %self.owner.locked_by, "failed to release import lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn lock() -> ImportLock {
        ImportLock::new(Store::open_in_memory().expect("store"), 300)
    }

    #[test]
    fn only_one_actor_holds_the_lock() {
        let lock = lock();
        let now = Utc::now();

        assert!(lock.acquire_at("alice", now).expect("first acquire"));
        assert!(!lock.acquire_at("bob", now).expect("second acquire"));
        assert!(!lock.acquire_at("alice", now + Duration::seconds(10)).expect("re-entry"));

        let info = lock.info_at(now).expect("info").expect("lock present");
        assert_eq!(info.locked_by, "alice");
        assert!(!info.stale);
        assert!(lock.is_held().expect("held"));
    }

    #[test]
    fn stale_lock_is_overwritten() {
        let lock = lock();
        let now = Utc::now();
        let abandoned_at = now - Duration::seconds(lock.stale_after_secs() + 1);

        assert!(lock.acquire_at("crashed", abandoned_at).expect("old acquire"));
        assert!(lock.info_at(now).expect("info").expect("present").stale);
        assert!(!lock.is_held().expect("stale lock is not held"));

        assert!(lock.acquire_at("scheduler", now).expect("takeover"));
        let info = lock.info_at(now).expect("info").expect("present");
        assert_eq!(info.locked_by, "scheduler");
        assert_eq!(info.lock_age_seconds, 0);
    }

    #[test]
    fn lock_at_the_threshold_is_still_held() {
        let lock = lock();
        let now = Utc::now();
        let edge = now - Duration::seconds(lock.stale_after_secs());

        assert!(lock.acquire_at("alice", edge).expect("acquire"));
        assert!(!lock.acquire_at("bob", now).expect("not yet stale"));
    }

    #[test]
    fn release_only_removes_the_owners_lock() {
        let lock = lock();
        let now = Utc::now();
        let abandoned_at = now - Duration::seconds(lock.stale_after_secs() + 1);
        let stale_owner = LockRecord {
            locked_at: abandoned_at.timestamp(),
            locked_by: "alice".to_string(),
        };

        assert!(lock.acquire_at("alice", abandoned_at).expect("acquire"));
        assert!(lock.acquire_at("bob", now).expect("takeover"));
        assert!(!lock.release(&stale_owner).expect("stale owner release"));
        assert!(lock.is_held().expect("bob still holds it"));

        assert!(lock.force_release().expect("force"));
        assert!(lock.info().expect("info").is_none());
        assert!(!lock.force_release().expect("second force"));
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock = lock();
        {
            let guard = lock.guard("alice").expect("guard").expect("acquired");
            assert_eq!(guard.owner().locked_by, "alice");
            assert!(lock.guard("bob").expect("guard").is_none());
        }
        assert!(!lock.is_held().expect("released"));

        let guard = lock.guard("bob").expect("guard").expect("acquired");
        assert!(guard.release().expect("explicit release"));
        assert!(lock.info().expect("info").is_none());
    }
}
