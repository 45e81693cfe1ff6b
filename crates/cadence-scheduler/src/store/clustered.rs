use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use cadence_core::{CadenceConfig, Clock, JobKey, StoreKind, TriggerKey};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::backend::StoreBackend;
use super::ops::Ops;
use super::ram::RamBackend;
use super::sqlite::SqliteBackend;
use super::{JobStore, StoreEvent};
use crate::calendar::Calendar;
use crate::error::StoreResult;
use crate::job::JobDetail;
use crate::lock::{ClusterLock, LocalLock, SqliteLock, STATE_ACCESS, TRIGGER_ACCESS};
use crate::signaler::SchedulerSignaler;
use crate::trigger::{CustomScheduleRegistry, Trigger};
use crate::types::{
    CompletedExecutionInstruction, MisfireScan, RecoveryReport, TriggerFiredResult, TriggerState,
};

/// Store tuning, resolved from [`CadenceConfig`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub instance_id: String,
    pub clustered: bool,
    pub misfire_threshold: chrono::Duration,
    pub max_misfires_per_pass: usize,
    pub checkin_interval: Duration,
    pub lock_lease: Duration,
    pub lock_timeout: Duration,
    pub lock_retry_base: Duration,
    pub transient_retries: u32,
}

impl StoreOptions {
    pub fn from_config(config: &CadenceConfig, instance_id: impl Into<String>) -> Self {
        let scheduler = &config.scheduler;
        let store = &config.store;
        Self {
            instance_id: instance_id.into(),
            clustered: store.clustered,
            misfire_threshold: chrono::Duration::milliseconds(
                i64::try_from(scheduler.misfire_threshold_ms).unwrap_or(i64::MAX / 2),
            ),
            max_misfires_per_pass: scheduler.max_misfires_per_pass,
            checkin_interval: store.checkin_interval(),
            lock_lease: store.lock_lease(),
            lock_timeout: store.lock_timeout(),
            lock_retry_base: store.lock_retry_base(),
            transient_retries: store.transient_retries,
        }
    }
}

/// The one [`JobStore`] implementation, generic over where rows live.
///
/// Each operation takes the cluster lease for its resource, runs in one
/// backend transaction, renews the lease before committing and publishes
/// its events to the signaler after the commit. Transient failures (lock
/// contention, a lost lease, a busy database) are retried with backoff.
pub struct ClusteredStore<B: StoreBackend> {
    backend: B,
    lock: Arc<dyn ClusterLock>,
    options: StoreOptions,
    clock: Arc<dyn Clock>,
    custom: CustomScheduleRegistry,
    signaler: OnceLock<Arc<dyn SchedulerSignaler>>,
}

impl<B: StoreBackend> ClusteredStore<B> {
    pub fn new(
        backend: B,
        lock: Arc<dyn ClusterLock>,
        options: StoreOptions,
        clock: Arc<dyn Clock>,
        custom: CustomScheduleRegistry,
    ) -> Self {
        Self {
            backend,
            lock,
            options,
            clock,
            custom,
            signaler: OnceLock::new(),
        }
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    fn locked<T>(
        &self,
        resource: &'static str,
        op: impl FnMut(&mut Ops<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.run(Some(resource), op)
    }

    fn read<T>(&self, op: impl FnMut(&mut Ops<'_>) -> StoreResult<T>) -> StoreResult<T> {
        self.run(None, op)
    }

    fn run<T>(
        &self,
        resource: Option<&'static str>,
        mut op: impl FnMut(&mut Ops<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut attempt = 0u32;
        loop {
            match self.attempt(resource, &mut op) {
                Ok((value, events)) => {
                    self.publish(events);
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.options.transient_retries => {
                    attempt += 1;
                    let backoff = self.options.lock_retry_base.max(Duration::from_millis(1))
                        * 2u32.saturating_pow(attempt);
                    warn!(error = %e, attempt, "transient store failure, retrying");
                    std::thread::sleep(backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn attempt<T>(
        &self,
        resource: Option<&'static str>,
        op: &mut impl FnMut(&mut Ops<'_>) -> StoreResult<T>,
    ) -> StoreResult<(T, Vec<StoreEvent>)> {
        let lease = match resource {
            Some(resource) => Some(self.lock.obtain(
                resource,
                &self.options.instance_id,
                self.options.lock_lease,
                self.options.lock_timeout,
                self.options.lock_retry_base,
            )?),
            None => None,
        };
        let now = self.clock.now();
        let result = self.backend.transaction(&mut |tx| {
            let mut ops = Ops::new(tx, now, &self.options, &self.custom);
            let value = op(&mut ops)?;
            if let Some(lease) = &lease {
                // A lost lease means another node may have acted on the
                // same rows; abort rather than commit.
                self.lock.renew(lease, self.options.lock_lease)?;
            }
            Ok((value, ops.effects))
        });
        if let Some(lease) = &lease {
            if let Err(e) = self.lock.release(lease) {
                warn!(resource = %lease.resource, error = %e, "lease release failed");
            }
        }
        result
    }

    fn publish(&self, events: Vec<StoreEvent>) {
        let Some(signaler) = self.signaler.get() else {
            return;
        };
        for event in events {
            match event {
                StoreEvent::TriggerMisfired(trigger) => signaler.notify_trigger_misfired(&trigger),
                StoreEvent::TriggerFinalized(trigger) => {
                    signaler.notify_trigger_finalized(&trigger)
                }
                StoreEvent::JobDeleted(key) => signaler.notify_job_deleted(&key),
                StoreEvent::SchedulingChange(candidate) => {
                    signaler.signal_scheduling_change(candidate)
                }
            }
        }
    }

    fn cluster_check_in(&self, first: bool) -> StoreResult<RecoveryReport> {
        let failed = self.locked(STATE_ACCESS, |ops| ops.check_in_state(first))?;
        if failed.is_empty() {
            return Ok(RecoveryReport::default());
        }
        self.locked(TRIGGER_ACCESS, |ops| ops.cluster_recover(&failed))
    }
}

impl ClusteredStore<RamBackend> {
    /// Volatile, single-process store.
    pub fn in_memory(
        options: StoreOptions,
        clock: Arc<dyn Clock>,
        custom: CustomScheduleRegistry,
    ) -> Self {
        let lock = Arc::new(LocalLock::new(Arc::clone(&clock)));
        Self::new(RamBackend::new(), lock, options, clock, custom)
    }
}

impl ClusteredStore<SqliteBackend> {
    /// SQLite store at `path`. Clustered stores take their leases from a
    /// lease database next to the data file, shared by every node.
    pub fn open_sqlite(
        path: &str,
        options: StoreOptions,
        clock: Arc<dyn Clock>,
        custom: CustomScheduleRegistry,
    ) -> StoreResult<Self> {
        let busy_timeout_ms = options.lock_timeout.as_millis() as u64;
        let backend = SqliteBackend::open(path, busy_timeout_ms)?;
        let lock: Arc<dyn ClusterLock> = if options.clustered {
            Arc::new(SqliteLock::open(
                &SqliteLock::path_for(path),
                Arc::clone(&clock),
                busy_timeout_ms,
            )?)
        } else {
            Arc::new(LocalLock::new(Arc::clone(&clock)))
        };
        Ok(Self::new(backend, lock, options, clock, custom))
    }
}

/// Build the store selected by `config.store.kind`.
pub fn open_store(
    config: &CadenceConfig,
    instance_id: &str,
    clock: Arc<dyn Clock>,
    custom: CustomScheduleRegistry,
) -> StoreResult<Arc<dyn JobStore>> {
    let options = StoreOptions::from_config(config, instance_id);
    Ok(match config.store.kind {
        StoreKind::Memory => Arc::new(ClusteredStore::in_memory(options, clock, custom)),
        StoreKind::Sqlite => Arc::new(ClusteredStore::open_sqlite(
            &config.store.resolved_path(),
            options,
            clock,
            custom,
        )?),
    })
}

impl<B: StoreBackend> fmt::Debug for ClusteredStore<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusteredStore")
            .field("backend", &self.backend)
            .field("instance_id", &self.options.instance_id)
            .field("clustered", &self.options.clustered)
            .finish_non_exhaustive()
    }
}

impl<B: StoreBackend> JobStore for ClusteredStore<B> {
    fn instance_id(&self) -> &str {
        &self.options.instance_id
    }

    fn is_clustered(&self) -> bool {
        self.options.clustered
    }

    fn supports_persistence(&self) -> bool {
        self.backend.is_persistent()
    }

    fn set_signaler(&self, signaler: Arc<dyn SchedulerSignaler>) {
        if self.signaler.set(signaler).is_err() {
            warn!("job store signaler already set, ignoring");
        }
    }

    fn scheduler_started(&self) -> StoreResult<RecoveryReport> {
        let mut report = if self.options.clustered {
            self.cluster_check_in(true)?
        } else {
            self.locked(TRIGGER_ACCESS, |ops| ops.recover_jobs())?
        };
        if self.options.clustered {
            report.misfires = self.locked(TRIGGER_ACCESS, |ops| ops.recover_misfired_triggers(true))?;
        }
        info!(
            instance = %self.options.instance_id,
            clustered = self.options.clustered,
            "job store started"
        );
        Ok(report)
    }

    fn scheduler_paused(&self) {
        debug!(instance = %self.options.instance_id, "job store notified of standby");
    }

    fn scheduler_resumed(&self) {
        debug!(instance = %self.options.instance_id, "job store notified of resume");
    }

    fn shutdown(&self) -> StoreResult<()> {
        if self.options.clustered {
            self.locked(STATE_ACCESS, |ops| ops.remove_scheduler_state())?;
        }
        info!(instance = %self.options.instance_id, "job store shut down");
        Ok(())
    }

    fn store_job(&self, job: &JobDetail, replace: bool) -> StoreResult<()> {
        self.locked(TRIGGER_ACCESS, |ops| ops.store_job(job, replace))
    }

    fn store_job_and_trigger(
        &self,
        job: &JobDetail,
        trigger: &Trigger,
    ) -> StoreResult<DateTime<Utc>> {
        self.locked(TRIGGER_ACCESS, |ops| {
            ops.store_job(job, false)?;
            ops.store_trigger(trigger, false)
        })
    }

    fn store_trigger(&self, trigger: &Trigger, replace: bool) -> StoreResult<DateTime<Utc>> {
        self.locked(TRIGGER_ACCESS, |ops| ops.store_trigger(trigger, replace))
    }

    fn remove_job(&self, key: &JobKey) -> StoreResult<bool> {
        self.locked(TRIGGER_ACCESS, |ops| ops.remove_job(key))
    }

    fn remove_trigger(&self, key: &TriggerKey) -> StoreResult<bool> {
        self.locked(TRIGGER_ACCESS, |ops| ops.remove_trigger(key))
    }

    fn replace_trigger(&self, key: &TriggerKey, trigger: &Trigger) -> StoreResult<DateTime<Utc>> {
        self.locked(TRIGGER_ACCESS, |ops| ops.replace_trigger(key, trigger))
    }

    fn retrieve_job(&self, key: &JobKey) -> StoreResult<Option<JobDetail>> {
        self.read(|ops| ops.tx.job(key))
    }

    fn retrieve_trigger(&self, key: &TriggerKey) -> StoreResult<Option<Trigger>> {
        self.read(|ops| Ok(ops.tx.trigger(key)?.map(|st| st.trigger)))
    }

    fn trigger_state(&self, key: &TriggerKey) -> StoreResult<TriggerState> {
        self.read(|ops| {
            Ok(ops
                .tx
                .trigger(key)?
                .map_or(TriggerState::Deleted, |st| st.state))
        })
    }

    fn triggers_of_job(&self, key: &JobKey) -> StoreResult<Vec<Trigger>> {
        self.read(|ops| {
            Ok(ops
                .tx
                .triggers_for_job(key)?
                .into_iter()
                .map(|st| st.trigger)
                .collect())
        })
    }

    fn job_keys(&self, group: Option<&str>) -> StoreResult<Vec<JobKey>> {
        self.read(|ops| ops.tx.job_keys(group))
    }

    fn trigger_keys(&self, group: Option<&str>) -> StoreResult<Vec<TriggerKey>> {
        self.read(|ops| ops.tx.trigger_keys(group))
    }

    fn paused_trigger_groups(&self) -> StoreResult<Vec<String>> {
        self.read(|ops| ops.tx.paused_groups())
    }

    fn store_calendar(
        &self,
        name: &str,
        calendar: &Calendar,
        replace: bool,
        update_triggers: bool,
    ) -> StoreResult<()> {
        self.locked(TRIGGER_ACCESS, |ops| {
            ops.store_calendar(name, calendar, replace, update_triggers)
        })
    }

    fn remove_calendar(&self, name: &str) -> StoreResult<bool> {
        self.locked(TRIGGER_ACCESS, |ops| ops.remove_calendar(name))
    }

    fn retrieve_calendar(&self, name: &str) -> StoreResult<Option<Calendar>> {
        self.read(|ops| ops.tx.calendar(name))
    }

    fn calendar_names(&self) -> StoreResult<Vec<String>> {
        self.read(|ops| ops.tx.calendar_names())
    }

    fn pause_trigger(&self, key: &TriggerKey) -> StoreResult<()> {
        self.locked(TRIGGER_ACCESS, |ops| ops.pause_trigger(key))
    }

    fn pause_trigger_group(&self, group: &str) -> StoreResult<()> {
        self.locked(TRIGGER_ACCESS, |ops| ops.pause_trigger_group(group))
    }

    fn pause_job(&self, key: &JobKey) -> StoreResult<()> {
        self.locked(TRIGGER_ACCESS, |ops| ops.pause_job(key))
    }

    fn resume_trigger(&self, key: &TriggerKey) -> StoreResult<()> {
        self.locked(TRIGGER_ACCESS, |ops| ops.resume_trigger(key))
    }

    fn resume_trigger_group(&self, group: &str) -> StoreResult<()> {
        self.locked(TRIGGER_ACCESS, |ops| ops.resume_trigger_group(group))
    }

    fn resume_job(&self, key: &JobKey) -> StoreResult<()> {
        self.locked(TRIGGER_ACCESS, |ops| ops.resume_job(key))
    }

    fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: chrono::Duration,
    ) -> StoreResult<Vec<Trigger>> {
        self.locked(TRIGGER_ACCESS, |ops| {
            ops.acquire_next_triggers(no_later_than, max_count, time_window)
        })
    }

    fn release_acquired_trigger(&self, trigger: &Trigger) -> StoreResult<()> {
        self.locked(TRIGGER_ACCESS, |ops| ops.release_acquired_trigger(trigger))
    }

    fn triggers_fired(&self, triggers: &[Trigger]) -> StoreResult<Vec<TriggerFiredResult>> {
        self.locked(TRIGGER_ACCESS, |ops| ops.triggers_fired(triggers))
    }

    fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> StoreResult<()> {
        self.locked(TRIGGER_ACCESS, |ops| {
            ops.triggered_job_complete(trigger, job, instruction)
        })
    }

    fn recover_misfired_triggers(&self, recovering: bool) -> StoreResult<MisfireScan> {
        self.locked(TRIGGER_ACCESS, |ops| ops.recover_misfired_triggers(recovering))
    }

    fn check_in(&self) -> StoreResult<Vec<String>> {
        if !self.options.clustered {
            return Ok(Vec::new());
        }
        let failed = self.locked(STATE_ACCESS, |ops| ops.check_in_state(false))?;
        if !failed.is_empty() {
            self.locked(TRIGGER_ACCESS, |ops| ops.cluster_recover(&failed))?;
        }
        Ok(failed)
    }
}
