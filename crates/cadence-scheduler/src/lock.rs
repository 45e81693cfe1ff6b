//! Cluster-wide exclusive locks with leases.
//!
//! Every mutating store operation runs while holding a lease on a named
//! resource. A lease that outlives its `expires_at` can be broken by any
//! other contender, which is how a crashed node's lock is reclaimed.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use cadence_core::Clock;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::{configure, init_lock_db};
use crate::error::{StoreError, StoreResult};

/// Guards triggers, jobs, calendars and fired records.
pub const TRIGGER_ACCESS: &str = "TRIGGER_ACCESS";
/// Guards scheduler heartbeat rows.
pub const STATE_ACCESS: &str = "STATE_ACCESS";

const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// A held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub resource: String,
    pub owner: String,
    /// Unique per acquisition; renew and release must present it.
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub trait ClusterLock: Send + Sync + fmt::Debug {
    /// Take the lock if it is free or its lease expired.
    fn try_acquire(
        &self,
        resource: &str,
        owner: &str,
        lease_for: Duration,
    ) -> StoreResult<Option<Lease>>;

    /// Extend a held lease. Fails with [`StoreError::LockLost`] when the
    /// lease expired and someone else took the lock.
    fn renew(&self, lease: &Lease, lease_for: Duration) -> StoreResult<Lease>;

    fn release(&self, lease: &Lease) -> StoreResult<()>;

    /// Retry [`try_acquire`](Self::try_acquire) with exponential backoff
    /// until `timeout`.
    fn obtain(
        &self,
        resource: &str,
        owner: &str,
        lease_for: Duration,
        timeout: Duration,
        retry_base: Duration,
    ) -> StoreResult<Lease> {
        let deadline = Instant::now() + timeout;
        let mut delay = retry_base.max(Duration::from_millis(1));
        loop {
            if let Some(lease) = self.try_acquire(resource, owner, lease_for)? {
                return Ok(lease);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::LockTimeout {
                    resource: resource.to_string(),
                });
            }
            let jitter = Duration::from_millis(fastrand::u64(0..=delay.as_millis() as u64 / 2));
            std::thread::sleep((delay + jitter).min(deadline - now));
            delay = (delay * 2).min(MAX_BACKOFF);
        }
    }
}

fn expiry(now: DateTime<Utc>, lease_for: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease_for).unwrap_or(chrono::Duration::MAX)
}

fn new_lease(resource: &str, owner: &str, expires_at: DateTime<Utc>) -> Lease {
    Lease {
        resource: resource.to_string(),
        owner: owner.to_string(),
        token: Uuid::new_v4().to_string(),
        expires_at,
    }
}

/// In-process lock table. Stores that share one `Arc<LocalLock>` exclude
/// each other exactly like cluster nodes sharing a database.
pub struct LocalLock {
    held: Mutex<HashMap<String, Lease>>,
    released: Condvar,
    clock: Arc<dyn Clock>,
}

impl LocalLock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            held: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            clock,
        }
    }

    fn table(&self) -> StoreResult<MutexGuard<'_, HashMap<String, Lease>>> {
        self.held.lock().map_err(|_| StoreError::Poisoned)
    }

    fn grab(
        &self,
        held: &mut HashMap<String, Lease>,
        resource: &str,
        owner: &str,
        lease_for: Duration,
    ) -> Option<Lease> {
        let now = self.clock.now();
        if let Some(current) = held.get(resource) {
            if current.expires_at > now {
                return None;
            }
            warn!(resource, stale_owner = %current.owner, "breaking expired lease");
        }
        let lease = new_lease(resource, owner, expiry(now, lease_for));
        held.insert(resource.to_string(), lease.clone());
        Some(lease)
    }
}

impl fmt::Debug for LocalLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalLock").finish_non_exhaustive()
    }
}

impl ClusterLock for LocalLock {
    fn try_acquire(
        &self,
        resource: &str,
        owner: &str,
        lease_for: Duration,
    ) -> StoreResult<Option<Lease>> {
        let mut held = self.table()?;
        Ok(self.grab(&mut held, resource, owner, lease_for))
    }

    fn renew(&self, lease: &Lease, lease_for: Duration) -> StoreResult<Lease> {
        let mut held = self.table()?;
        match held.get_mut(&lease.resource) {
            Some(current) if current.token == lease.token => {
                current.expires_at = expiry(self.clock.now(), lease_for);
                Ok(current.clone())
            }
            _ => Err(StoreError::LockLost {
                resource: lease.resource.clone(),
            }),
        }
    }

    fn release(&self, lease: &Lease) -> StoreResult<()> {
        let mut held = self.table()?;
        let ours = held
            .get(&lease.resource)
            .is_some_and(|current| current.token == lease.token);
        if !ours {
            return Err(StoreError::LockLost {
                resource: lease.resource.clone(),
            });
        }
        held.remove(&lease.resource);
        drop(held);
        self.released.notify_all();
        Ok(())
    }

    /// Waits on a condition variable instead of polling.
    fn obtain(
        &self,
        resource: &str,
        owner: &str,
        lease_for: Duration,
        timeout: Duration,
        retry_base: Duration,
    ) -> StoreResult<Lease> {
        let deadline = Instant::now() + timeout;
        let mut held = self.table()?;
        loop {
            if let Some(lease) = self.grab(&mut held, resource, owner, lease_for) {
                return Ok(lease);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::LockTimeout {
                    resource: resource.to_string(),
                });
            }
            // Bounded so an expiring lease is noticed without a release.
            let wait = (deadline - now).min(MAX_BACKOFF.max(retry_base));
            held = self
                .released
                .wait_timeout(held, wait)
                .map(|(guard, _)| guard)
                .map_err(|_| StoreError::Poisoned)?;
        }
    }
}

/// Lease rows in a SQLite database shared by every node of the cluster.
pub struct SqliteLock {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteLock {
    /// Open (or create) the lease database at `path`.
    pub fn open(path: &str, clock: Arc<dyn Clock>, busy_timeout_ms: u64) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        configure(&conn, busy_timeout_ms)?;
        init_lock_db(&conn)?;
        debug!(path, "lease database ready");
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    /// Lease database kept beside the data file at `db_path`.
    pub fn path_for(db_path: &str) -> String {
        format!("{db_path}.locks")
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl fmt::Debug for SqliteLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteLock").finish_non_exhaustive()
    }
}

impl ClusterLock for SqliteLock {
    fn try_acquire(
        &self,
        resource: &str,
        owner: &str,
        lease_for: Duration,
    ) -> StoreResult<Option<Lease>> {
        let now = self.clock.now();
        let lease = new_lease(resource, owner, expiry(now, lease_for));
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT INTO cluster_locks (resource, owner, token, expires_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (resource) DO UPDATE
                SET owner = excluded.owner,
                    token = excluded.token,
                    expires_ms = excluded.expires_ms
                WHERE cluster_locks.expires_ms <= ?5",
            params![
                resource,
                owner,
                lease.token,
                lease.expires_at.timestamp_millis(),
                now.timestamp_millis()
            ],
        );
        match changed {
            Ok(1) => Ok(Some(lease)),
            Ok(_) => Ok(None),
            Err(e) => {
                let e = StoreError::from(e);
                if e.is_transient() {
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }

    fn renew(&self, lease: &Lease, lease_for: Duration) -> StoreResult<Lease> {
        let now = self.clock.now();
        let expires_at = expiry(now, lease_for);
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE cluster_locks SET expires_ms = ?1 WHERE resource = ?2 AND token = ?3",
            params![
                expires_at.timestamp_millis(),
                lease.resource,
                lease.token
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::LockLost {
                resource: lease.resource.clone(),
            });
        }
        Ok(Lease {
            expires_at,
            ..lease.clone()
        })
    }

    fn release(&self, lease: &Lease) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM cluster_locks WHERE resource = ?1 AND token = ?2",
            params![lease.resource, lease.token],
        )?;
        if changed == 0 {
            return Err(StoreError::LockLost {
                resource: lease.resource.clone(),
            });
        }
        Ok(())
    }
}

impl SqliteLock {
    /// Current holder of `resource`, if any (expired or not).
    pub fn holder(&self, resource: &str) -> StoreResult<Option<String>> {
        let conn = self.conn()?;
        let owner = conn
            .query_row(
                "SELECT owner FROM cluster_locks WHERE resource = ?1",
                [resource],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::ManualClock;
    use chrono::TimeZone;

    const LEASE: Duration = Duration::from_secs(30);

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn local_lock_excludes_second_owner() {
        let lock = LocalLock::new(clock());
        let lease = lock.try_acquire(TRIGGER_ACCESS, "a", LEASE).unwrap().unwrap();
        assert!(lock.try_acquire(TRIGGER_ACCESS, "b", LEASE).unwrap().is_none());
        assert!(lock.try_acquire(STATE_ACCESS, "b", LEASE).unwrap().is_some());
        lock.release(&lease).unwrap();
        assert!(lock.try_acquire(TRIGGER_ACCESS, "b", LEASE).unwrap().is_some());
    }

    #[test]
    fn expired_lease_is_broken_and_old_holder_loses_it() {
        let clock = clock();
        let lock = LocalLock::new(clock.clone());
        let stale = lock.try_acquire(TRIGGER_ACCESS, "a", LEASE).unwrap().unwrap();
        clock.advance(chrono::Duration::seconds(31));
        let fresh = lock.try_acquire(TRIGGER_ACCESS, "b", LEASE).unwrap().unwrap();
        assert!(matches!(
            lock.renew(&stale, LEASE),
            Err(StoreError::LockLost { .. })
        ));
        assert!(lock.renew(&fresh, LEASE).is_ok());
    }

    #[test]
    fn obtain_times_out() {
        let lock = LocalLock::new(clock());
        let _held = lock.try_acquire(TRIGGER_ACCESS, "a", LEASE).unwrap().unwrap();
        let err = lock
            .obtain(
                TRIGGER_ACCESS,
                "b",
                LEASE,
                Duration::from_millis(30),
                Duration::from_millis(5),
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
        assert!(err.is_transient());
    }

    #[test]
    fn sqlite_lock_breaks_only_stale_leases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.db.locks");
        let clock = clock();
        let a = SqliteLock::open(path.to_str().unwrap(), clock.clone(), 1000).unwrap();
        let b = SqliteLock::open(path.to_str().unwrap(), clock.clone(), 1000).unwrap();

        let lease = a.try_acquire(TRIGGER_ACCESS, "a", LEASE).unwrap().unwrap();
        assert!(b.try_acquire(TRIGGER_ACCESS, "b", LEASE).unwrap().is_none());
        assert_eq!(b.holder(TRIGGER_ACCESS).unwrap().as_deref(), Some("a"));

        clock.advance(chrono::Duration::seconds(31));
        assert!(b.try_acquire(TRIGGER_ACCESS, "b", LEASE).unwrap().is_some());
        assert!(matches!(
            a.renew(&lease, LEASE),
            Err(StoreError::LockLost { .. })
        ));
        assert!(a.release(&lease).is_err());
    }
}
