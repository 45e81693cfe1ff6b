//! Store operations inside one locked transaction, plus the client-side
//! (define, pause, resume, query) operations.

use cadence_core::{JobKey, TriggerKey};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::backend::StoreTx;
use super::clustered::StoreOptions;
use super::StoreEvent;
use crate::calendar::Calendar;
use crate::error::{ScheduleError, StoreError, StoreResult};
use crate::job::JobDetail;
use crate::trigger::{CustomScheduleRegistry, MisfireInstruction, ScheduleContext, Trigger};
use crate::types::{StoredTrigger, TriggerState};

/// One attempt of a store operation: the open transaction, the instant it
/// runs at, and the events to publish if it commits.
pub(crate) struct Ops<'a> {
    pub(crate) tx: &'a mut dyn StoreTx,
    pub(crate) now: DateTime<Utc>,
    pub(crate) options: &'a StoreOptions,
    pub(crate) custom: &'a CustomScheduleRegistry,
    pub(crate) effects: Vec<StoreEvent>,
}

impl<'a> Ops<'a> {
    pub(crate) fn new(
        tx: &'a mut dyn StoreTx,
        now: DateTime<Utc>,
        options: &'a StoreOptions,
        custom: &'a CustomScheduleRegistry,
    ) -> Self {
        Self {
            tx,
            now,
            options,
            custom,
            effects: Vec::new(),
        }
    }

    // ── shared helpers ───────────────────────────────────────────────────

    pub(crate) fn emit(&mut self, event: StoreEvent) {
        self.effects.push(event);
    }

    pub(crate) fn calendar_of(&mut self, trigger: &Trigger) -> StoreResult<Option<Calendar>> {
        match &trigger.calendar_name {
            None => Ok(None),
            Some(name) => match self.tx.calendar(name)? {
                Some(calendar) => Ok(Some(calendar)),
                None => Err(StoreError::CalendarNotFound(name.clone())),
            },
        }
    }

    /// Late by more than the misfire threshold, and not exempt.
    pub(crate) fn is_misfired(&self, trigger: &Trigger) -> bool {
        if trigger.effective_misfire_instruction() == MisfireInstruction::IgnoreMisfires {
            return false;
        }
        trigger
            .next_fire_time
            .is_some_and(|next| next < self.now - self.options.misfire_threshold)
    }

    /// Apply the trigger's misfire instruction. The misfire is announced
    /// with the trigger as it was before the update.
    pub(crate) fn apply_misfire(&mut self, st: &mut StoredTrigger) -> StoreResult<()> {
        let calendar = self.calendar_of(&st.trigger)?;
        let custom = self.custom;
        warn!(
            trigger = %st.trigger.key,
            scheduled = ?st.trigger.next_fire_time,
            "trigger misfired"
        );
        self.emit(StoreEvent::TriggerMisfired(st.trigger.clone()));
        st.trigger
            .update_after_misfire(&ScheduleContext::new(calendar.as_ref(), custom), self.now);
        if st.trigger.next_fire_time.is_none() {
            self.finalize(st);
        }
        Ok(())
    }

    /// No fires left.
    pub(crate) fn finalize(&mut self, st: &mut StoredTrigger) {
        st.state = TriggerState::Complete;
        st.trigger.fire_instance_id = None;
        debug!(trigger = %st.trigger.key, "trigger complete");
        self.emit(StoreEvent::TriggerFinalized(st.trigger.clone()));
    }

    pub(crate) fn mark_error(&mut self, st: &mut StoredTrigger, reason: &str) -> StoreResult<()> {
        warn!(trigger = %st.trigger.key, reason, "trigger set to error state");
        st.state = TriggerState::Error;
        st.trigger.fire_instance_id = None;
        self.tx.put_trigger(st)
    }

    pub(crate) fn group_paused(&mut self, group: &str) -> StoreResult<bool> {
        Ok(self.tx.paused_groups()?.iter().any(|g| g == group))
    }

    /// A concurrency-restricted job with an instance in flight anywhere.
    pub(crate) fn job_blocked(&mut self, job: &JobDetail) -> StoreResult<bool> {
        Ok(job.concurrent_execution_disallowed && !self.tx.fired_for_job(&job.key)?.is_empty())
    }

    /// Block (or unblock) every other trigger of `job_key`.
    pub(crate) fn set_siblings_blocked(
        &mut self,
        job_key: &JobKey,
        except: Option<&TriggerKey>,
        blocked: bool,
    ) -> StoreResult<bool> {
        let mut changed = false;
        for mut sibling in self.tx.triggers_for_job(job_key)? {
            if Some(sibling.key()) == except {
                continue;
            }
            let next = match (sibling.state, blocked) {
                (TriggerState::Waiting, true) => TriggerState::Blocked,
                (TriggerState::Paused, true) => TriggerState::PausedBlocked,
                (TriggerState::Blocked, false) => TriggerState::Waiting,
                (TriggerState::PausedBlocked, false) => TriggerState::Paused,
                _ => continue,
            };
            sibling.state = next;
            self.tx.put_trigger(&sibling)?;
            changed = true;
        }
        Ok(changed)
    }

    /// Delete the row, then the job if it was non-durable and this was its
    /// last trigger.
    pub(crate) fn remove_trigger_row(&mut self, key: &TriggerKey, job_key: &JobKey) -> StoreResult<()> {
        self.tx.delete_trigger(key)?;
        self.delete_orphaned_job(job_key)
    }

    fn delete_orphaned_job(&mut self, job_key: &JobKey) -> StoreResult<()> {
        let Some(job) = self.tx.job(job_key)? else {
            return Ok(());
        };
        if job.durable || !self.tx.triggers_for_job(job_key)?.is_empty() {
            return Ok(());
        }
        self.tx.delete_job(job_key)?;
        debug!(job = %job_key, "non-durable job removed with its last trigger");
        self.emit(StoreEvent::JobDeleted(job_key.clone()));
        Ok(())
    }

    /// Initial state of a newly stored trigger.
    fn initial_state(&mut self, trigger: &Trigger, job: &JobDetail) -> StoreResult<TriggerState> {
        let paused = self.group_paused(&trigger.key.group)?;
        let blocked = self.job_blocked(job)?;
        Ok(match (paused, blocked) {
            (true, true) => TriggerState::PausedBlocked,
            (true, false) => TriggerState::Paused,
            (false, true) => TriggerState::Blocked,
            (false, false) => TriggerState::Waiting,
        })
    }

    // ── definitions ──────────────────────────────────────────────────────

    pub(crate) fn store_job(&mut self, job: &JobDetail, replace: bool) -> StoreResult<()> {
        if job.key.name.is_empty() || job.key.group.is_empty() {
            return Err(StoreError::Invalid("job name and group must not be empty".into()));
        }
        if !replace && self.tx.job(&job.key)?.is_some() {
            return Err(StoreError::ObjectAlreadyExists(format!("job {}", job.key)));
        }
        self.tx.put_job(job)
    }

    pub(crate) fn store_trigger(
        &mut self,
        trigger: &Trigger,
        replace: bool,
    ) -> StoreResult<DateTime<Utc>> {
        if !replace && self.tx.trigger(&trigger.key)?.is_some() {
            return Err(StoreError::ObjectAlreadyExists(format!("trigger {}", trigger.key)));
        }
        let job = self
            .tx
            .job(&trigger.job_key)?
            .ok_or_else(|| StoreError::JobNotFound(trigger.job_key.clone()))?;
        let calendar = self.calendar_of(trigger)?;
        let custom = self.custom;
        let cx = ScheduleContext::new(calendar.as_ref(), custom);
        trigger.validate(&cx)?;

        let mut trigger = trigger.clone();
        trigger.fire_instance_id = None;
        trigger.misfired_fire_time = None;
        let first = trigger
            .compute_first_fire_time(&cx)
            .ok_or_else(|| ScheduleError::NeverFires(trigger.key.clone()))?;

        let state = self.initial_state(&trigger, &job)?;
        self.tx.put_trigger(&StoredTrigger::new(trigger, state))?;
        self.emit(StoreEvent::SchedulingChange(Some(first)));
        Ok(first)
    }

    pub(crate) fn remove_trigger(&mut self, key: &TriggerKey) -> StoreResult<bool> {
        let Some(mut st) = self.tx.trigger(key)? else {
            return Ok(false);
        };
        if st.state.is_in_flight() {
            debug!(trigger = %key, "trigger in flight, deletion deferred");
            st.delete_pending = true;
            self.tx.put_trigger(&st)?;
        } else {
            let job_key = st.trigger.job_key.clone();
            self.remove_trigger_row(key, &job_key)?;
        }
        Ok(true)
    }

    pub(crate) fn remove_job(&mut self, key: &JobKey) -> StoreResult<bool> {
        for mut st in self.tx.triggers_for_job(key)? {
            if st.state.is_in_flight() {
                st.delete_pending = true;
                self.tx.put_trigger(&st)?;
            } else {
                self.tx.delete_trigger(st.key())?;
            }
        }
        let removed = self.tx.delete_job(key)?;
        if removed {
            self.emit(StoreEvent::JobDeleted(key.clone()));
        }
        Ok(removed)
    }

    pub(crate) fn replace_trigger(
        &mut self,
        key: &TriggerKey,
        trigger: &Trigger,
    ) -> StoreResult<DateTime<Utc>> {
        let old = self
            .tx
            .trigger(key)?
            .ok_or_else(|| StoreError::TriggerNotFound(key.clone()))?;
        if old.trigger.job_key != trigger.job_key {
            return Err(StoreError::Invalid(format!(
                "replacement for {key} belongs to job {}, not {}",
                trigger.job_key, old.trigger.job_key
            )));
        }
        if &trigger.key != key {
            if old.state.is_in_flight() {
                let mut old = old;
                old.delete_pending = true;
                self.tx.put_trigger(&old)?;
            } else {
                self.tx.delete_trigger(key)?;
            }
        }
        self.store_trigger(trigger, true)
    }

    pub(crate) fn store_calendar(
        &mut self,
        name: &str,
        calendar: &Calendar,
        replace: bool,
        update_triggers: bool,
    ) -> StoreResult<()> {
        calendar.validate()?;
        if !replace && self.tx.calendar(name)?.is_some() {
            return Err(StoreError::ObjectAlreadyExists(format!("calendar {name}")));
        }
        self.tx.put_calendar(name, calendar)?;
        if !update_triggers {
            return Ok(());
        }
        let custom = self.custom;
        let cx = ScheduleContext::new(Some(calendar), custom);
        for mut st in self.tx.triggers_for_calendar(name)? {
            if st.state.is_terminal() {
                continue;
            }
            st.trigger
                .update_with_new_calendar(&cx, self.options.misfire_threshold, self.now);
            if st.trigger.next_fire_time.is_none() && !st.state.is_in_flight() {
                self.finalize(&mut st);
            }
            self.tx.put_trigger(&st)?;
        }
        self.emit(StoreEvent::SchedulingChange(None));
        Ok(())
    }

    pub(crate) fn remove_calendar(&mut self, name: &str) -> StoreResult<bool> {
        if !self.tx.triggers_for_calendar(name)?.is_empty() {
            return Err(StoreError::CalendarInUse(name.to_string()));
        }
        self.tx.delete_calendar(name)
    }

    // ── pause / resume ───────────────────────────────────────────────────

    fn pause_stored(&mut self, mut st: StoredTrigger) -> StoreResult<()> {
        match st.state {
            // An acquired trigger's pending fire is rejected by triggers_fired.
            TriggerState::Waiting | TriggerState::Acquired => st.state = TriggerState::Paused,
            TriggerState::Blocked => st.state = TriggerState::PausedBlocked,
            TriggerState::Executing => st.pause_pending = true,
            _ => return Ok(()),
        }
        debug!(trigger = %st.trigger.key, "trigger paused");
        self.tx.put_trigger(&st)
    }

    fn resume_stored(&mut self, mut st: StoredTrigger) -> StoreResult<()> {
        match st.state {
            TriggerState::Paused | TriggerState::PausedBlocked => {
                let blocked = match self.tx.job(&st.trigger.job_key)? {
                    Some(job) => self.job_blocked(&job)?,
                    None => false,
                };
                st.state = if blocked {
                    TriggerState::Blocked
                } else {
                    TriggerState::Waiting
                };
                st.trigger.fire_instance_id = None;
                if self.is_misfired(&st.trigger) {
                    match self.apply_misfire(&mut st) {
                        Err(StoreError::CalendarNotFound(name)) => {
                            return self.mark_error(&mut st, &format!("calendar {name} missing"));
                        }
                        other => other?,
                    }
                }
            }
            TriggerState::Executing if st.pause_pending => st.pause_pending = false,
            _ => return Ok(()),
        }
        debug!(trigger = %st.trigger.key, state = %st.state, "trigger resumed");
        let next = st.trigger.next_fire_time;
        self.tx.put_trigger(&st)?;
        self.emit(StoreEvent::SchedulingChange(next));
        Ok(())
    }

    pub(crate) fn pause_trigger(&mut self, key: &TriggerKey) -> StoreResult<()> {
        match self.tx.trigger(key)? {
            Some(st) => self.pause_stored(st),
            None => Ok(()),
        }
    }

    pub(crate) fn pause_trigger_group(&mut self, group: &str) -> StoreResult<()> {
        self.tx.add_paused_group(group)?;
        for key in self.tx.trigger_keys(Some(group))? {
            self.pause_trigger(&key)?;
        }
        Ok(())
    }

    pub(crate) fn pause_job(&mut self, key: &JobKey) -> StoreResult<()> {
        for st in self.tx.triggers_for_job(key)? {
            self.pause_stored(st)?;
        }
        Ok(())
    }

    pub(crate) fn resume_trigger(&mut self, key: &TriggerKey) -> StoreResult<()> {
        match self.tx.trigger(key)? {
            Some(st) => self.resume_stored(st),
            None => Ok(()),
        }
    }

    pub(crate) fn resume_trigger_group(&mut self, group: &str) -> StoreResult<()> {
        self.tx.remove_paused_group(group)?;
        for key in self.tx.trigger_keys(Some(group))? {
            self.resume_trigger(&key)?;
        }
        Ok(())
    }

    pub(crate) fn resume_job(&mut self, key: &JobKey) -> StoreResult<()> {
        for st in self.tx.triggers_for_job(key)? {
            self.resume_stored(st)?;
        }
        Ok(())
    }
}
