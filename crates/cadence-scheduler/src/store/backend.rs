use std::fmt::Debug;
use std::sync::Arc;

use cadence_core::{JobKey, TriggerKey};
use chrono::{DateTime, Utc};

use crate::calendar::Calendar;
use crate::error::StoreResult;
use crate::job::JobDetail;
use crate::types::{FiredTriggerRecord, SchedulerStateRecord, StoredTrigger, TriggerState};

/// Row-level access inside one backend transaction.
///
/// Nothing here enforces state-machine rules; that is the job of
/// [`ClusteredStore`](super::ClusteredStore).
pub trait StoreTx {
    fn job(&mut self, key: &JobKey) -> StoreResult<Option<JobDetail>>;
    fn put_job(&mut self, job: &JobDetail) -> StoreResult<()>;
    fn delete_job(&mut self, key: &JobKey) -> StoreResult<bool>;
    fn job_keys(&mut self, group: Option<&str>) -> StoreResult<Vec<JobKey>>;

    fn trigger(&mut self, key: &TriggerKey) -> StoreResult<Option<StoredTrigger>>;
    fn put_trigger(&mut self, trigger: &StoredTrigger) -> StoreResult<()>;
    fn delete_trigger(&mut self, key: &TriggerKey) -> StoreResult<bool>;
    fn trigger_keys(&mut self, group: Option<&str>) -> StoreResult<Vec<TriggerKey>>;
    fn triggers_for_job(&mut self, key: &JobKey) -> StoreResult<Vec<StoredTrigger>>;
    fn triggers_for_calendar(&mut self, name: &str) -> StoreResult<Vec<StoredTrigger>>;
    fn triggers_in_state(&mut self, state: TriggerState) -> StoreResult<Vec<StoredTrigger>>;
    /// `Waiting` triggers with a fire time at or before `no_later_than`,
    /// earliest first, higher priority first on ties.
    fn waiting_triggers_due(
        &mut self,
        no_later_than: DateTime<Utc>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<StoredTrigger>>;

    fn calendar(&mut self, name: &str) -> StoreResult<Option<Calendar>>;
    fn put_calendar(&mut self, name: &str, calendar: &Calendar) -> StoreResult<()>;
    fn delete_calendar(&mut self, name: &str) -> StoreResult<bool>;
    fn calendar_names(&mut self) -> StoreResult<Vec<String>>;

    fn paused_groups(&mut self) -> StoreResult<Vec<String>>;
    fn add_paused_group(&mut self, group: &str) -> StoreResult<()>;
    fn remove_paused_group(&mut self, group: &str) -> StoreResult<()>;

    fn fired(&mut self, entry_id: &str) -> StoreResult<Option<FiredTriggerRecord>>;
    fn put_fired(&mut self, record: &FiredTriggerRecord) -> StoreResult<()>;
    fn delete_fired(&mut self, entry_id: &str) -> StoreResult<bool>;
    /// Fired records of one instance, or of every instance.
    fn fired_records(&mut self, instance_id: Option<&str>) -> StoreResult<Vec<FiredTriggerRecord>>;
    fn fired_for_job(&mut self, key: &JobKey) -> StoreResult<Vec<FiredTriggerRecord>>;

    fn scheduler_states(&mut self) -> StoreResult<Vec<SchedulerStateRecord>>;
    fn put_scheduler_state(&mut self, record: &SchedulerStateRecord) -> StoreResult<()>;
    fn delete_scheduler_state(&mut self, instance_id: &str) -> StoreResult<bool>;
}

/// Durable (or not) home of the rows.
pub trait StoreBackend: Send + Sync + Debug + 'static {
    /// Run `f` atomically: everything it wrote is committed when it returns
    /// `Ok`, and nothing is when it returns `Err`.
    fn transaction<T>(
        &self,
        f: &mut dyn FnMut(&mut dyn StoreTx) -> StoreResult<T>,
    ) -> StoreResult<T>;

    fn is_persistent(&self) -> bool;
}

impl<B: StoreBackend> StoreBackend for Arc<B> {
    fn transaction<T>(
        &self,
        f: &mut dyn FnMut(&mut dyn StoreTx) -> StoreResult<T>,
    ) -> StoreResult<T> {
        (**self).transaction(f)
    }

    fn is_persistent(&self) -> bool {
        (**self).is_persistent()
    }
}
