use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use cadence_core::{JobKey, TriggerKey};
use chrono::{DateTime, Utc};

use super::backend::{StoreBackend, StoreTx};
use crate::calendar::Calendar;
use crate::error::{StoreError, StoreResult};
use crate::job::JobDetail;
use crate::types::{FiredTriggerRecord, SchedulerStateRecord, StoredTrigger, TriggerState};

#[derive(Debug, Clone, Default)]
struct RamState {
    jobs: BTreeMap<JobKey, JobDetail>,
    triggers: BTreeMap<TriggerKey, StoredTrigger>,
    calendars: BTreeMap<String, Calendar>,
    paused_groups: BTreeSet<String>,
    fired: BTreeMap<String, FiredTriggerRecord>,
    schedulers: BTreeMap<String, SchedulerStateRecord>,
}

/// Volatile rows in process memory.
///
/// A transaction works on a copy of the state and swaps it in on success,
/// so a failed operation leaves nothing half-written.
#[derive(Debug, Default)]
pub struct RamBackend {
    state: Mutex<RamState>,
}

impl RamBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreBackend for RamBackend {
    fn transaction<T>(
        &self,
        f: &mut dyn FnMut(&mut dyn StoreTx) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut committed = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        let mut working = committed.clone();
        let out = f(&mut working)?;
        *committed = working;
        Ok(out)
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

impl StoreTx for RamState {
    fn job(&mut self, key: &JobKey) -> StoreResult<Option<JobDetail>> {
        Ok(self.jobs.get(key).cloned())
    }

    fn put_job(&mut self, job: &JobDetail) -> StoreResult<()> {
        self.jobs.insert(job.key.clone(), job.clone());
        Ok(())
    }

    fn delete_job(&mut self, key: &JobKey) -> StoreResult<bool> {
        Ok(self.jobs.remove(key).is_some())
    }

    fn job_keys(&mut self, group: Option<&str>) -> StoreResult<Vec<JobKey>> {
        Ok(self
            .jobs
            .keys()
            .filter(|k| group.map_or(true, |g| k.group == g))
            .cloned()
            .collect())
    }

    fn trigger(&mut self, key: &TriggerKey) -> StoreResult<Option<StoredTrigger>> {
        Ok(self.triggers.get(key).cloned())
    }

    fn put_trigger(&mut self, trigger: &StoredTrigger) -> StoreResult<()> {
        self.triggers.insert(trigger.key().clone(), trigger.clone());
        Ok(())
    }

    fn delete_trigger(&mut self, key: &TriggerKey) -> StoreResult<bool> {
        Ok(self.triggers.remove(key).is_some())
    }

    fn trigger_keys(&mut self, group: Option<&str>) -> StoreResult<Vec<TriggerKey>> {
        Ok(self
            .triggers
            .keys()
            .filter(|k| group.map_or(true, |g| k.group == g))
            .cloned()
            .collect())
    }

    fn triggers_for_job(&mut self, key: &JobKey) -> StoreResult<Vec<StoredTrigger>> {
        Ok(self
            .triggers
            .values()
            .filter(|st| &st.trigger.job_key == key)
            .cloned()
            .collect())
    }

    fn triggers_for_calendar(&mut self, name: &str) -> StoreResult<Vec<StoredTrigger>> {
        Ok(self
            .triggers
            .values()
            .filter(|st| st.trigger.calendar_name.as_deref() == Some(name))
            .cloned()
            .collect())
    }

    fn triggers_in_state(&mut self, state: TriggerState) -> StoreResult<Vec<StoredTrigger>> {
        Ok(self
            .triggers
            .values()
            .filter(|st| st.state == state)
            .cloned()
            .collect())
    }

    fn waiting_triggers_due(
        &mut self,
        no_later_than: DateTime<Utc>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<StoredTrigger>> {
        let mut due: Vec<StoredTrigger> = self
            .triggers
            .values()
            .filter(|st| st.state == TriggerState::Waiting)
            .filter(|st| st.trigger.next_fire_time.is_some_and(|t| t <= no_later_than))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            let ka = (a.trigger.next_fire_time, Reverse(a.trigger.priority), a.key());
            let kb = (b.trigger.next_fire_time, Reverse(b.trigger.priority), b.key());
            ka.cmp(&kb)
        });
        if let Some(limit) = limit {
            due.truncate(limit);
        }
        Ok(due)
    }

    fn calendar(&mut self, name: &str) -> StoreResult<Option<Calendar>> {
        Ok(self.calendars.get(name).cloned())
    }

    fn put_calendar(&mut self, name: &str, calendar: &Calendar) -> StoreResult<()> {
        self.calendars.insert(name.to_string(), calendar.clone());
        Ok(())
    }

    fn delete_calendar(&mut self, name: &str) -> StoreResult<bool> {
        Ok(self.calendars.remove(name).is_some())
    }

    fn calendar_names(&mut self) -> StoreResult<Vec<String>> {
        Ok(self.calendars.keys().cloned().collect())
    }

    fn paused_groups(&mut self) -> StoreResult<Vec<String>> {
        Ok(self.paused_groups.iter().cloned().collect())
    }

    fn add_paused_group(&mut self, group: &str) -> StoreResult<()> {
        self.paused_groups.insert(group.to_string());
        Ok(())
    }

    fn remove_paused_group(&mut self, group: &str) -> StoreResult<()> {
        self.paused_groups.remove(group);
        Ok(())
    }

    fn fired(&mut self, entry_id: &str) -> StoreResult<Option<FiredTriggerRecord>> {
        Ok(self.fired.get(entry_id).cloned())
    }

    fn put_fired(&mut self, record: &FiredTriggerRecord) -> StoreResult<()> {
        self.fired.insert(record.entry_id.clone(), record.clone());
        Ok(())
    }

    fn delete_fired(&mut self, entry_id: &str) -> StoreResult<bool> {
        Ok(self.fired.remove(entry_id).is_some())
    }

    fn fired_records(&mut self, instance_id: Option<&str>) -> StoreResult<Vec<FiredTriggerRecord>> {
        Ok(self
            .fired
            .values()
            .filter(|r| instance_id.map_or(true, |id| r.instance_id == id))
            .cloned()
            .collect())
    }

    fn fired_for_job(&mut self, key: &JobKey) -> StoreResult<Vec<FiredTriggerRecord>> {
        Ok(self
            .fired
            .values()
            .filter(|r| &r.job_key == key)
            .cloned()
            .collect())
    }

    fn scheduler_states(&mut self) -> StoreResult<Vec<SchedulerStateRecord>> {
        Ok(self.schedulers.values().cloned().collect())
    }

    fn put_scheduler_state(&mut self, record: &SchedulerStateRecord) -> StoreResult<()> {
        self.schedulers
            .insert(record.instance_id.clone(), record.clone());
        Ok(())
    }

    fn delete_scheduler_state(&mut self, instance_id: &str) -> StoreResult<bool> {
        Ok(self.schedulers.remove(instance_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::{Schedule, Trigger};
    use chrono::TimeZone;

    fn stored(name: &str, at_secs: i64, priority: i32) -> StoredTrigger {
        let at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(at_secs);
        let mut trigger = Trigger::builder(TriggerKey::named(name), JobKey::named("j"), Schedule::Once)
            .start_at(at)
            .priority(priority)
            .build();
        trigger.next_fire_time = Some(at);
        StoredTrigger::new(trigger, TriggerState::Waiting)
    }

    #[test]
    fn failed_transaction_leaves_no_trace() {
        let backend = RamBackend::new();
        let result: StoreResult<()> = backend.transaction(&mut |tx| {
            tx.put_trigger(&stored("a", 0, 5))?;
            Err(StoreError::Invalid("boom".into()))
        });
        assert!(result.is_err());
        let keys = backend
            .transaction(&mut |tx| tx.trigger_keys(None))
            .unwrap();
        assert!(keys.is_empty());
    }

    #[test]
    fn due_triggers_ordered_by_time_then_priority() {
        let backend = RamBackend::new();
        backend
            .transaction(&mut |tx| {
                tx.put_trigger(&stored("late", 10, 9))?;
                tx.put_trigger(&stored("low", 0, 5))?;
                tx.put_trigger(&stored("high", 0, 10))?;
                tx.put_trigger(&stored("future", 100, 1))
            })
            .unwrap();
        let bound = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 30).unwrap();
        let due = backend
            .transaction(&mut |tx| tx.waiting_triggers_due(bound, None))
            .unwrap();
        let names: Vec<_> = due.iter().map(|st| st.key().name.as_str()).collect();
        assert_eq!(names, ["high", "low", "late"]);
    }
}
