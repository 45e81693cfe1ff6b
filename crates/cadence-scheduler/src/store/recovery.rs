//! Misfire scans, start-up recovery and cluster fail-over.

use cadence_core::TriggerKey;
use chrono::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ops::Ops;
use super::{StoreEvent, CLUSTER_CHECKIN_GRACE_MS};
use crate::error::{StoreError, StoreResult};
use crate::trigger::{MisfireInstruction, Schedule, ScheduleContext, Trigger};
use crate::types::{
    FiredState, FiredTriggerRecord, MisfireScan, RecoveryReport, SchedulerStateRecord,
    StoredTrigger, TriggerState, RECOVERING_JOBS_GROUP, RECOVERY_FIRE_TIME_KEY,
    RECOVERY_SCHEDULED_FIRE_TIME_KEY, RECOVERY_TRIGGER_GROUP_KEY, RECOVERY_TRIGGER_NAME_KEY,
};

impl Ops<'_> {
    pub(crate) fn recover_misfired_triggers(&mut self, recovering: bool) -> StoreResult<MisfireScan> {
        let cutoff = self.now - self.options.misfire_threshold - Duration::milliseconds(1);
        let mut scan = MisfireScan::default();
        for mut st in self.tx.waiting_triggers_due(cutoff, None)? {
            if !self.is_misfired(&st.trigger) {
                continue;
            }
            if !recovering && scan.processed >= self.options.max_misfires_per_pass {
                scan.has_more = true;
                break;
            }
            match self.apply_misfire(&mut st) {
                Err(StoreError::CalendarNotFound(name)) => {
                    self.mark_error(&mut st, &format!("calendar {name} missing"))?;
                    continue;
                }
                other => other?,
            }
            if let Some(next) = st.trigger.next_fire_time {
                scan.earliest_new_time = Some(scan.earliest_new_time.map_or(next, |e| e.min(next)));
            }
            self.tx.put_trigger(&st)?;
            scan.processed += 1;
        }
        if scan.processed > 0 {
            info!(
                processed = scan.processed,
                has_more = scan.has_more,
                "misfired triggers handled"
            );
        }
        Ok(scan)
    }

    /// Start-up repair of a non-clustered store. Every fired record is a
    /// leftover of a previous run since nothing else shares the store.
    pub(crate) fn recover_jobs(&mut self) -> StoreResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for record in self.tx.fired_records(None)? {
            if self.recover_fired(&record)? {
                report.recovered_jobs += 1;
            }
            report.stale_records += 1;
        }

        for state in [
            TriggerState::Acquired,
            TriggerState::Executing,
            TriggerState::Blocked,
            TriggerState::PausedBlocked,
        ] {
            for st in self.tx.triggers_in_state(state)? {
                self.revert_trigger(st)?;
            }
        }

        for st in self.tx.triggers_in_state(TriggerState::Complete)? {
            let job_key = st.trigger.job_key.clone();
            self.remove_trigger_row(st.key(), &job_key)?;
            report.purged_complete += 1;
        }

        report.misfires = self.recover_misfired_triggers(true)?;
        info!(
            recovered = report.recovered_jobs,
            stale = report.stale_records,
            purged = report.purged_complete,
            misfired = report.misfires.processed,
            "job store recovery finished"
        );
        self.emit(StoreEvent::SchedulingChange(None));
        Ok(report)
    }

    /// Put an interrupted trigger back into rotation.
    fn revert_trigger(&mut self, mut st: StoredTrigger) -> StoreResult<()> {
        if st.delete_pending {
            let job_key = st.trigger.job_key.clone();
            let key = st.key().clone();
            return self.remove_trigger_row(&key, &job_key);
        }
        st.trigger.fire_instance_id = None;
        if st.trigger.next_fire_time.is_none() {
            // Fired its last time before the interruption.
            st.pause_pending = false;
            self.finalize(&mut st);
            return self.tx.put_trigger(&st);
        }
        let paused = std::mem::take(&mut st.pause_pending)
            || st.state == TriggerState::PausedBlocked
            || self.group_paused(&st.trigger.key.group)?;
        st.state = if paused {
            TriggerState::Paused
        } else {
            TriggerState::Waiting
        };
        st.trigger.fire_instance_id = None;
        debug!(trigger = %st.trigger.key, state = %st.state, "trigger reverted");
        self.tx.put_trigger(&st)
    }

    /// Discard one fired record, scheduling a recovery run when the job
    /// asked for it and was actually executing.
    fn recover_fired(&mut self, record: &FiredTriggerRecord) -> StoreResult<bool> {
        self.tx.delete_fired(&record.entry_id)?;
        if record.state != FiredState::Executing || !record.requests_recovery {
            return Ok(false);
        }
        if self.tx.job(&record.job_key)?.is_none() {
            warn!(job = %record.job_key, "job requesting recovery no longer exists");
            return Ok(false);
        }

        let key = TriggerKey::new(
            format!("recover_{}_{}", record.instance_id, Uuid::now_v7().simple()),
            RECOVERING_JOBS_GROUP,
        );
        let mut builder = Trigger::builder(key, record.job_key.clone(), Schedule::Once)
            .start_at(record.scheduled_fire_time)
            .misfire(MisfireInstruction::IgnoreMisfires)
            .priority(record.priority)
            .description(format!("recovery of {}", record.trigger_key));
        if let Some(original) = self.tx.trigger(&record.trigger_key)? {
            builder = builder.data_map(original.trigger.data);
        }
        let mut trigger = builder
            .data(RECOVERY_TRIGGER_NAME_KEY, record.trigger_key.name.clone())
            .data(RECOVERY_TRIGGER_GROUP_KEY, record.trigger_key.group.clone())
            .data(RECOVERY_FIRE_TIME_KEY, record.fire_time.timestamp_millis())
            .data(
                RECOVERY_SCHEDULED_FIRE_TIME_KEY,
                record.scheduled_fire_time.timestamp_millis(),
            )
            .build();
        trigger.compute_first_fire_time(&ScheduleContext::new(None, self.custom));

        info!(
            job = %record.job_key,
            trigger = %record.trigger_key,
            recovery = %trigger.key,
            "scheduling recovery run of interrupted job"
        );
        self.tx
            .put_trigger(&StoredTrigger::new(trigger, TriggerState::Waiting))?;
        Ok(true)
    }

    /// Heartbeat phase: record this node's check-in and report which nodes
    /// missed theirs. On the first check-in this node's own leftover record
    /// counts as failed.
    pub(crate) fn check_in_state(&mut self, first: bool) -> StoreResult<Vec<String>> {
        let me = self.options.instance_id.clone();
        let grace = Duration::milliseconds(CLUSTER_CHECKIN_GRACE_MS);
        let mut failed = Vec::new();
        for state in self.tx.scheduler_states()? {
            if state.instance_id == me {
                if first {
                    failed.push(state.instance_id);
                }
                continue;
            }
            let interval = Duration::milliseconds(
                i64::try_from(state.checkin_interval_ms).unwrap_or(i64::MAX / 2),
            );
            if state.last_checkin + interval + grace < self.now {
                warn!(instance = %state.instance_id, last_checkin = %state.last_checkin, "scheduler instance missed its check-in");
                failed.push(state.instance_id);
            }
        }
        self.tx.put_scheduler_state(&SchedulerStateRecord {
            instance_id: me,
            last_checkin: self.now,
            checkin_interval_ms: self.options.checkin_interval.as_millis() as u64,
        })?;
        Ok(failed)
    }

    /// Recovery phase: take over the in-flight work of failed nodes.
    pub(crate) fn cluster_recover(&mut self, failed: &[String]) -> StoreResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for instance in failed {
            for record in self.tx.fired_records(Some(instance))? {
                if let Some(st) = self.tx.trigger(&record.trigger_key)? {
                    let ours = st.trigger.fire_instance_id.as_deref() == Some(record.entry_id.as_str());
                    if ours && st.state.is_in_flight() {
                        self.revert_trigger(st)?;
                    }
                }
                if record.concurrent_execution_disallowed {
                    self.set_siblings_blocked(&record.job_key, None, false)?;
                }
                if self.recover_fired(&record)? {
                    report.recovered_jobs += 1;
                }
                report.stale_records += 1;
            }
            if instance != &self.options.instance_id {
                self.tx.delete_scheduler_state(instance)?;
            }
            info!(instance = %instance, "recovered work of failed scheduler instance");
        }
        if report.stale_records > 0 {
            self.emit(StoreEvent::SchedulingChange(None));
        }
        Ok(report)
    }

    pub(crate) fn remove_scheduler_state(&mut self) -> StoreResult<()> {
        let me = self.options.instance_id.clone();
        self.tx.delete_scheduler_state(&me)?;
        Ok(())
    }
}
