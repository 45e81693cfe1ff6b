//! Acquire → fire → complete transitions.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::ops::Ops;
use super::StoreEvent;
use crate::error::{StoreError, StoreResult};
use crate::job::JobDetail;
use crate::trigger::{ScheduleContext, Trigger};
use crate::types::{
    CompletedExecutionInstruction, FiredState, FiredTriggerRecord, RejectReason, StoredTrigger,
    TriggerFiredBundle, TriggerFiredResult, TriggerState, RECOVERING_JOBS_GROUP,
};

/// Passes over the candidates when misfire handling moved some of them.
const MAX_ACQUIRE_ROUNDS: usize = 3;

impl Ops<'_> {
    pub(crate) fn acquire_next_triggers(
        &mut self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> StoreResult<Vec<Trigger>> {
        let mut acquired: Vec<Trigger> = Vec::new();
        if max_count == 0 {
            return Ok(acquired);
        }
        let mut batch_end = no_later_than;
        let mut restricted_in_batch = HashSet::new();

        for _ in 0..MAX_ACQUIRE_ROUNDS {
            let mut moved = false;
            for mut st in self
                .tx
                .waiting_triggers_due(no_later_than + time_window, None)?
            {
                if acquired.len() >= max_count {
                    break;
                }

                let mut changed = false;
                if self.is_misfired(&st.trigger) {
                    match self.apply_misfire(&mut st) {
                        Err(StoreError::CalendarNotFound(name)) => {
                            self.mark_error(&mut st, &format!("calendar {name} missing"))?;
                            continue;
                        }
                        other => other?,
                    }
                    if st.state == TriggerState::Complete {
                        self.tx.put_trigger(&st)?;
                        continue;
                    }
                    changed = true;
                    moved = true;
                }

                let Some(next) = st.trigger.next_fire_time else {
                    continue;
                };
                if next > batch_end {
                    if changed {
                        self.tx.put_trigger(&st)?;
                    }
                    continue;
                }

                let Some(job) = self.tx.job(&st.trigger.job_key)? else {
                    self.mark_error(&mut st, "job missing")?;
                    continue;
                };
                if job.concurrent_execution_disallowed {
                    if restricted_in_batch.contains(&job.key) || self.job_blocked(&job)? {
                        if changed {
                            self.tx.put_trigger(&st)?;
                        }
                        continue;
                    }
                    restricted_in_batch.insert(job.key.clone());
                }

                self.acquire(&mut st, &job, next)?;
                if acquired.is_empty() {
                    batch_end = next.max(self.now) + time_window;
                }
                acquired.push(st.trigger);
            }
            if !moved || acquired.len() >= max_count {
                break;
            }
        }

        acquired.sort_by(|a, b| {
            a.next_fire_time
                .cmp(&b.next_fire_time)
                .then(b.priority.cmp(&a.priority))
        });
        if !acquired.is_empty() {
            debug!(count = acquired.len(), batch_end = %batch_end, "triggers acquired");
        }
        Ok(acquired)
    }

    fn acquire(
        &mut self,
        st: &mut StoredTrigger,
        job: &JobDetail,
        scheduled: DateTime<Utc>,
    ) -> StoreResult<()> {
        let entry_id = Uuid::now_v7().to_string();
        st.state = TriggerState::Acquired;
        st.trigger.fire_instance_id = Some(entry_id.clone());
        self.tx.put_trigger(st)?;
        self.tx.put_fired(&FiredTriggerRecord {
            entry_id,
            trigger_key: st.trigger.key.clone(),
            job_key: job.key.clone(),
            instance_id: self.options.instance_id.clone(),
            fire_time: self.now,
            scheduled_fire_time: scheduled,
            priority: st.trigger.priority,
            state: FiredState::Acquired,
            requests_recovery: job.requests_recovery,
            concurrent_execution_disallowed: job.concurrent_execution_disallowed,
        })?;
        debug!(trigger = %st.trigger.key, scheduled = %scheduled, "trigger acquired");
        Ok(())
    }

    pub(crate) fn release_acquired_trigger(&mut self, trigger: &Trigger) -> StoreResult<()> {
        if let Some(entry_id) = &trigger.fire_instance_id {
            self.tx.delete_fired(entry_id)?;
        }
        let Some(mut st) = self.tx.trigger(&trigger.key)? else {
            return Ok(());
        };
        if st.state != TriggerState::Acquired
            || st.trigger.fire_instance_id != trigger.fire_instance_id
        {
            return Ok(());
        }
        if st.delete_pending {
            let job_key = st.trigger.job_key.clone();
            return self.remove_trigger_row(&trigger.key, &job_key);
        }
        st.state = TriggerState::Waiting;
        st.trigger.fire_instance_id = None;
        debug!(trigger = %trigger.key, "acquired trigger released");
        self.tx.put_trigger(&st)
    }

    pub(crate) fn triggers_fired(
        &mut self,
        triggers: &[Trigger],
    ) -> StoreResult<Vec<TriggerFiredResult>> {
        let mut results = Vec::with_capacity(triggers.len());
        for trigger in triggers {
            let result = match self.trigger_fired(trigger)? {
                Ok(bundle) => TriggerFiredResult::Fired(Box::new(bundle)),
                Err(reason) => {
                    if let Some(entry_id) = &trigger.fire_instance_id {
                        self.tx.delete_fired(entry_id)?;
                    }
                    debug!(trigger = %trigger.key, %reason, "fire rejected");
                    TriggerFiredResult::Rejected {
                        key: trigger.key.clone(),
                        reason,
                    }
                }
            };
            results.push(result);
        }
        Ok(results)
    }

    fn trigger_fired(
        &mut self,
        trigger: &Trigger,
    ) -> StoreResult<Result<TriggerFiredBundle, RejectReason>> {
        let Some(mut st) = self.tx.trigger(&trigger.key)? else {
            return Ok(Err(RejectReason::Deleted));
        };
        if st.state != TriggerState::Acquired {
            return Ok(Err(RejectReason::NotAcquired(st.state)));
        }
        let Some(entry_id) = trigger.fire_instance_id.clone() else {
            return Ok(Err(RejectReason::Stale));
        };
        if st.trigger.fire_instance_id.as_deref() != Some(entry_id.as_str()) {
            return Ok(Err(RejectReason::Stale));
        }
        if st.delete_pending {
            let job_key = st.trigger.job_key.clone();
            self.remove_trigger_row(&trigger.key, &job_key)?;
            return Ok(Err(RejectReason::Deleted));
        }
        let Some(job) = self.tx.job(&st.trigger.job_key)? else {
            self.mark_error(&mut st, "job missing")?;
            return Ok(Err(RejectReason::JobMissing));
        };
        let calendar = match self.calendar_of(&st.trigger) {
            Ok(calendar) => calendar,
            Err(StoreError::CalendarNotFound(name)) => {
                self.mark_error(&mut st, "calendar missing")?;
                return Ok(Err(RejectReason::CalendarMissing(name)));
            }
            Err(e) => return Err(e),
        };

        let previous_fire_time = st.trigger.previous_fire_time;
        let scheduled_fire_time = st
            .trigger
            .misfired_fire_time
            .or(st.trigger.next_fire_time)
            .unwrap_or(self.now);
        let custom = self.custom;
        st.trigger
            .triggered(&ScheduleContext::new(calendar.as_ref(), custom));
        st.state = TriggerState::Executing;
        self.tx.put_trigger(&st)?;

        if let Some(mut record) = self.tx.fired(&entry_id)? {
            record.state = FiredState::Executing;
            record.fire_time = self.now;
            self.tx.put_fired(&record)?;
        }
        if job.concurrent_execution_disallowed
            && self.set_siblings_blocked(&job.key, Some(&trigger.key), true)?
        {
            debug!(job = %job.key, "sibling triggers blocked");
        }

        Ok(Ok(TriggerFiredBundle {
            recovering: st.trigger.key.group == RECOVERING_JOBS_GROUP,
            next_fire_time: st.trigger.next_fire_time,
            trigger: st.trigger,
            job,
            fire_instance_id: entry_id,
            fire_time: self.now,
            scheduled_fire_time,
            previous_fire_time,
        }))
    }

    pub(crate) fn triggered_job_complete(
        &mut self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> StoreResult<()> {
        let Some(entry_id) = trigger.fire_instance_id.as_deref() else {
            return Err(StoreError::Invalid(format!(
                "trigger {} carries no fire instance",
                trigger.key
            )));
        };
        if !self.tx.delete_fired(entry_id)? {
            debug!(trigger = %trigger.key, fire = entry_id, "fire already completed");
            return Ok(());
        }

        if let Some(mut stored_job) = self.tx.job(&job.key)? {
            if stored_job.persist_job_data_after_execution && stored_job.data != job.data {
                stored_job.data = job.data.clone();
                self.tx.put_job(&stored_job)?;
            }
            if stored_job.concurrent_execution_disallowed
                && self.set_siblings_blocked(&job.key, Some(&trigger.key), false)?
            {
                self.emit(StoreEvent::SchedulingChange(None));
            }
        }

        match instruction {
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                return self.set_all_job_triggers(job, TriggerState::Complete);
            }
            CompletedExecutionInstruction::SetAllJobTriggersError => {
                return self.set_all_job_triggers(job, TriggerState::Error);
            }
            _ => {}
        }

        let Some(mut st) = self.tx.trigger(&trigger.key)? else {
            return Ok(());
        };
        if st.trigger.fire_instance_id.as_deref() != Some(entry_id) {
            // Replaced while the job ran; the new definition stands.
            return Ok(());
        }
        st.trigger.fire_instance_id = None;
        let pause_pending = std::mem::take(&mut st.pause_pending);
        if st.delete_pending {
            let job_key = st.trigger.job_key.clone();
            return self.remove_trigger_row(&trigger.key, &job_key);
        }

        match instruction {
            CompletedExecutionInstruction::DeleteTrigger if st.trigger.next_fire_time.is_none() => {
                let job_key = st.trigger.job_key.clone();
                self.emit(StoreEvent::TriggerFinalized(st.trigger.clone()));
                return self.remove_trigger_row(&trigger.key, &job_key);
            }
            CompletedExecutionInstruction::SetTriggerComplete => self.finalize(&mut st),
            CompletedExecutionInstruction::SetTriggerError => {
                warn!(trigger = %trigger.key, "trigger set to error state by its job");
                st.state = TriggerState::Error;
            }
            _ if st.trigger.next_fire_time.is_none() => self.finalize(&mut st),
            _ => {
                let paused = pause_pending || self.group_paused(&st.trigger.key.group)?;
                let blocked = match self.tx.job(&st.trigger.job_key)? {
                    Some(job) => self.job_blocked(&job)?,
                    None => false,
                };
                st.state = match (paused, blocked) {
                    (true, true) => TriggerState::PausedBlocked,
                    (true, false) => TriggerState::Paused,
                    (false, true) => TriggerState::Blocked,
                    (false, false) => TriggerState::Waiting,
                };
                self.emit(StoreEvent::SchedulingChange(st.trigger.next_fire_time));
            }
        }
        self.tx.put_trigger(&st)
    }

    fn set_all_job_triggers(&mut self, job: &JobDetail, state: TriggerState) -> StoreResult<()> {
        for mut st in self.tx.triggers_for_job(&job.key)? {
            st.trigger.fire_instance_id = None;
            st.pause_pending = false;
            if state == TriggerState::Complete {
                self.finalize(&mut st);
            } else {
                st.state = state;
            }
            self.tx.put_trigger(&st)?;
        }
        debug!(job = %job.key, %state, "all triggers of job updated");
        Ok(())
    }
}
