//! Job store: the only owner of persisted scheduling state.
//!
//! [`JobStore`] is the object-safe contract the firing loop and the
//! [`Scheduler`](crate::Scheduler) facade consume. [`ClusteredStore`]
//! implements it once, over any [`StoreBackend`], with the state-machine
//! rules, misfire handling, recovery and cluster locking; the backends only
//! move rows.

mod backend;
mod clustered;
mod firing;
mod ops;
mod ram;
mod recovery;
mod sqlite;

pub use backend::{StoreBackend, StoreTx};
pub use clustered::{open_store, ClusteredStore, StoreOptions};
pub use ram::RamBackend;
pub use sqlite::SqliteBackend;

use std::fmt;
use std::sync::Arc;

use cadence_core::{JobKey, TriggerKey};
use chrono::{DateTime, Duration, Utc};

use crate::calendar::Calendar;
use crate::error::{StoreError, StoreResult};
use crate::job::JobDetail;
use crate::signaler::SchedulerSignaler;
use crate::trigger::Trigger;
use crate::types::{
    CompletedExecutionInstruction, MisfireScan, RecoveryReport, TriggerFiredResult, TriggerState,
};

/// Grace added to a node's check-in interval before it is declared dead.
pub const CLUSTER_CHECKIN_GRACE_MS: i64 = 7_500;

/// Durable state holder shared by the firing loop and clients.
///
/// Every operation is atomic with respect to other nodes of the cluster.
/// Calls block (locks, disk); async callers go through [`run_blocking`].
pub trait JobStore: Send + Sync + fmt::Debug {
    fn instance_id(&self) -> &str;
    fn is_clustered(&self) -> bool;
    fn supports_persistence(&self) -> bool;
    /// Where misfire, finalization and scheduling-change events go.
    fn set_signaler(&self, signaler: Arc<dyn SchedulerSignaler>);

    /// Repair what a previous run of this instance left behind.
    fn scheduler_started(&self) -> StoreResult<RecoveryReport>;
    fn scheduler_paused(&self);
    fn scheduler_resumed(&self);
    fn shutdown(&self) -> StoreResult<()>;

    fn store_job(&self, job: &JobDetail, replace: bool) -> StoreResult<()>;
    /// Returns the trigger's first fire time.
    fn store_job_and_trigger(&self, job: &JobDetail, trigger: &Trigger)
        -> StoreResult<DateTime<Utc>>;
    /// Returns the trigger's first fire time.
    fn store_trigger(&self, trigger: &Trigger, replace: bool) -> StoreResult<DateTime<Utc>>;
    /// Removes the job and all its triggers.
    fn remove_job(&self, key: &JobKey) -> StoreResult<bool>;
    /// Removing the last trigger of a non-durable job removes the job too.
    fn remove_trigger(&self, key: &TriggerKey) -> StoreResult<bool>;
    fn replace_trigger(&self, key: &TriggerKey, trigger: &Trigger) -> StoreResult<DateTime<Utc>>;

    fn retrieve_job(&self, key: &JobKey) -> StoreResult<Option<JobDetail>>;
    fn retrieve_trigger(&self, key: &TriggerKey) -> StoreResult<Option<Trigger>>;
    /// [`TriggerState::Deleted`] for unknown keys.
    fn trigger_state(&self, key: &TriggerKey) -> StoreResult<TriggerState>;
    fn triggers_of_job(&self, key: &JobKey) -> StoreResult<Vec<Trigger>>;
    fn job_keys(&self, group: Option<&str>) -> StoreResult<Vec<JobKey>>;
    fn trigger_keys(&self, group: Option<&str>) -> StoreResult<Vec<TriggerKey>>;
    fn paused_trigger_groups(&self) -> StoreResult<Vec<String>>;

    /// With `update_triggers`, triggers referencing the calendar get their
    /// next fire time recomputed.
    fn store_calendar(
        &self,
        name: &str,
        calendar: &Calendar,
        replace: bool,
        update_triggers: bool,
    ) -> StoreResult<()>;
    /// Fails with [`StoreError::CalendarInUse`] while triggers reference it.
    fn remove_calendar(&self, name: &str) -> StoreResult<bool>;
    fn retrieve_calendar(&self, name: &str) -> StoreResult<Option<Calendar>>;
    fn calendar_names(&self) -> StoreResult<Vec<String>>;

    fn pause_trigger(&self, key: &TriggerKey) -> StoreResult<()>;
    fn pause_trigger_group(&self, group: &str) -> StoreResult<()>;
    fn pause_job(&self, key: &JobKey) -> StoreResult<()>;
    fn resume_trigger(&self, key: &TriggerKey) -> StoreResult<()>;
    fn resume_trigger_group(&self, group: &str) -> StoreResult<()>;
    fn resume_job(&self, key: &JobKey) -> StoreResult<()>;

    /// Claim up to `max_count` triggers due by `no_later_than` for this node.
    fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> StoreResult<Vec<Trigger>>;
    /// Give back an acquired trigger that will not be fired.
    fn release_acquired_trigger(&self, trigger: &Trigger) -> StoreResult<()>;
    fn triggers_fired(&self, triggers: &[Trigger]) -> StoreResult<Vec<TriggerFiredResult>>;
    /// A second call for the same fire is a no-op.
    fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> StoreResult<()>;

    /// One misfire pass; `recovering` lifts the per-pass bound.
    fn recover_misfired_triggers(&self, recovering: bool) -> StoreResult<MisfireScan>;
    /// Heartbeat; returns the ids of failed instances whose work was recovered.
    fn check_in(&self) -> StoreResult<Vec<String>>;
}

/// Run a store call on the blocking pool.
pub async fn run_blocking<T, F>(store: &Arc<dyn JobStore>, f: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn JobStore) -> StoreResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
}

/// Side effects of a committed store operation, delivered to the signaler
/// after the commit.
#[derive(Debug, Clone)]
pub(crate) enum StoreEvent {
    TriggerMisfired(Trigger),
    TriggerFinalized(Trigger),
    JobDeleted(JobKey),
    SchedulingChange(Option<DateTime<Utc>>),
}
