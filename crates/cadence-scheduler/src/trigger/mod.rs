//! Triggers: a schedule bound to one job, plus the mutable fire state the
//! store persists between fires.

mod misfire;
mod schedule;

pub use misfire::MisfireInstruction;
pub use schedule::{CustomSchedule, CustomScheduleRegistry, Schedule, ScheduleContext};

use cadence_core::{millis, JobKey, TriggerKey};
use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::CALENDAR_SEARCH_HORIZON_YEAR;
use crate::error::ScheduleError;
use crate::job::{JobDataMap, JobExecutionError};
use crate::types::CompletedExecutionInstruction;

pub const DEFAULT_PRIORITY: i32 = 5;
/// Repeating kinds give up after this many calendar-excluded occurrences in a row.
const MAX_EXCLUDED_OCCURRENCES: usize = 100_000;

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub key: TriggerKey,
    pub job_key: JobKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub schedule: Schedule,
    /// Higher fires first when fire times tie.
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub misfire_instruction: MisfireInstruction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_name: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_fire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub previous_fire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub times_triggered: u32,
    /// Merged over the job's data at execution.
    #[serde(default)]
    pub data: JobDataMap,
    /// The stale fire time a `FireNow` misfire replaced; reported as the
    /// execution's scheduled fire time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub misfired_fire_time: Option<DateTime<Utc>>,
    /// Identity of the current acquisition, set by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fire_instance_id: Option<String>,
}

impl Trigger {
    pub fn builder(key: TriggerKey, job_key: JobKey, schedule: Schedule) -> TriggerBuilder {
        TriggerBuilder {
            trigger: Trigger {
                key,
                job_key,
                description: None,
                schedule,
                priority: DEFAULT_PRIORITY,
                misfire_instruction: MisfireInstruction::Smart,
                calendar_name: None,
                start_time: DateTime::<Utc>::MIN_UTC,
                end_time: None,
                next_fire_time: None,
                previous_fire_time: None,
                times_triggered: 0,
                data: JobDataMap::new(),
                misfired_fire_time: None,
                fire_instance_id: None,
            },
            start_set: false,
        }
    }

    pub fn validate(&self, cx: &ScheduleContext<'_>) -> Result<(), ScheduleError> {
        if self.key.name.is_empty() || self.key.group.is_empty() {
            return Err(ScheduleError::InvalidSchedule(
                "trigger name and group must not be empty".into(),
            ));
        }
        if self.job_key.name.is_empty() {
            return Err(ScheduleError::InvalidSchedule(
                "trigger must reference a job".into(),
            ));
        }
        if self.end_time.is_some_and(|end| end < self.start_time) {
            return Err(ScheduleError::EndBeforeStart);
        }
        if !self.schedule.allows(self.misfire_instruction) {
            return Err(ScheduleError::IllegalMisfireInstruction {
                instruction: self.misfire_instruction,
                kind: self.schedule.kind_name(),
            });
        }
        self.schedule.validate(cx.custom)
    }

    /// The instruction actually applied on a misfire.
    pub fn effective_misfire_instruction(&self) -> MisfireInstruction {
        match self.misfire_instruction {
            MisfireInstruction::Smart => self.schedule.resolve_smart(),
            other => other,
        }
    }

    /// Next raw fire time strictly after `after`, honoring the end time but
    /// not the calendar.
    pub fn fire_time_after(
        &self,
        after: DateTime<Utc>,
        cx: &ScheduleContext<'_>,
    ) -> Option<DateTime<Utc>> {
        let t = self.schedule.fire_time_after(
            self.start_time,
            after,
            self.times_triggered,
            cx.custom,
        )?;
        match self.end_time {
            Some(end) if t > end => None,
            _ => Some(t),
        }
    }

    /// Last fire time, when it can be known without walking the schedule.
    pub fn final_fire_time(&self) -> Option<DateTime<Utc>> {
        let last = match &self.schedule {
            Schedule::Once => Some(self.start_time),
            Schedule::Interval {
                every_ms,
                repeat_count,
            } => {
                let every = (*every_ms).max(1) as i64;
                let by_count = repeat_count.map(|r| {
                    self.start_time + Duration::milliseconds(every.saturating_mul(r as i64))
                });
                let by_end = self.end_time.map(|end| {
                    let n = (end - self.start_time).num_milliseconds().max(0) / every;
                    self.start_time + Duration::milliseconds(n * every)
                });
                match (by_count, by_end) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            }
            _ => None,
        }?;
        match self.end_time {
            Some(end) if last > end => None,
            _ => Some(last),
        }
    }

    /// First fire, with the calendar applied; also stored as `next_fire_time`.
    pub fn compute_first_fire_time(&mut self, cx: &ScheduleContext<'_>) -> Option<DateTime<Utc>> {
        let first = self.fire_time_after(self.start_time - Duration::milliseconds(1), cx);
        self.next_fire_time = self.apply_calendar(first, cx);
        self.next_fire_time
    }

    /// Next fire after `previous_fire_time` (or the first fire when there is none).
    pub fn compute_next_fire_time(&self, cx: &ScheduleContext<'_>) -> Option<DateTime<Utc>> {
        let after = self
            .previous_fire_time
            .unwrap_or(self.start_time - Duration::milliseconds(1));
        self.apply_calendar(self.fire_time_after(after, cx), cx)
    }

    /// Advance after a fire.
    pub fn triggered(&mut self, cx: &ScheduleContext<'_>) {
        self.times_triggered = self.times_triggered.saturating_add(1);
        self.previous_fire_time = self.next_fire_time;
        self.misfired_fire_time = None;
        self.next_fire_time = match self.next_fire_time {
            Some(fired) => self.apply_calendar(self.fire_time_after(fired, cx), cx),
            None => None,
        };
    }

    /// Apply the misfire instruction against `now`.
    ///
    /// `IgnoreMisfires` leaves the trigger untouched; the store never treats
    /// such a trigger as misfired.
    pub fn update_after_misfire(&mut self, cx: &ScheduleContext<'_>, now: DateTime<Utc>) {
        let now = millis(now);
        let stale = self.next_fire_time;
        match self.effective_misfire_instruction() {
            MisfireInstruction::Smart | MisfireInstruction::IgnoreMisfires => {}

            MisfireInstruction::FireNow => {
                if self.end_time.is_some_and(|end| end < now) {
                    self.next_fire_time = None;
                } else {
                    self.misfired_fire_time = self.misfired_fire_time.or(stale);
                    self.next_fire_time = self.apply_calendar(Some(now), cx);
                }
            }

            MisfireInstruction::DoNothing | MisfireInstruction::RescheduleNextWithExistingCount => {
                self.next_fire_time = self.apply_calendar(self.fire_time_after(now, cx), cx);
            }

            MisfireInstruction::RescheduleNextValid => {
                let at_or_after = now - Duration::milliseconds(1);
                self.next_fire_time = self.apply_calendar(self.fire_time_after(at_or_after, cx), cx);
            }

            MisfireInstruction::RescheduleNextWithRemainingCount => {
                let next = self.apply_calendar(self.fire_time_after(now, cx), cx);
                if let (Some(stale), Some(next)) = (stale, next) {
                    let missed = self.schedule.fires_between(self.start_time, stale, next);
                    self.times_triggered = self.times_triggered.saturating_add(missed);
                }
                self.next_fire_time = next;
            }

            instruction @ (MisfireInstruction::RescheduleNowWithExistingCount
            | MisfireInstruction::RescheduleNowWithRemainingCount) => {
                if let Schedule::Interval {
                    every_ms,
                    repeat_count: Some(repeat),
                } = self.schedule
                {
                    let missed = match (instruction, stale) {
                        (MisfireInstruction::RescheduleNowWithRemainingCount, Some(stale)) => {
                            self.schedule.fires_between(self.start_time, stale, now)
                        }
                        _ => 0,
                    };
                    let remaining = repeat
                        .saturating_sub(self.times_triggered)
                        .saturating_sub(missed);
                    self.schedule = Schedule::Interval {
                        every_ms,
                        repeat_count: Some(remaining),
                    };
                    self.times_triggered = 0;
                }
                if self.end_time.is_some_and(|end| end < now) {
                    self.next_fire_time = None;
                } else {
                    self.start_time = now;
                    self.next_fire_time = self.apply_calendar(Some(now), cx);
                }
            }
        }
    }

    /// Recompute after the referenced calendar changed.
    ///
    /// Fires that would already be more than `misfire_threshold` late are
    /// skipped when the schedule has a later one.
    pub fn update_with_new_calendar(
        &mut self,
        cx: &ScheduleContext<'_>,
        misfire_threshold: Duration,
        now: DateTime<Utc>,
    ) {
        let mut next = self.compute_next_fire_time(cx);
        let mut guard = 0;
        while let Some(t) = next {
            if now - t < misfire_threshold || guard >= MAX_EXCLUDED_OCCURRENCES {
                break;
            }
            match self.apply_calendar(self.fire_time_after(t, cx), cx) {
                Some(later) => next = Some(later),
                None => break,
            }
            guard += 1;
        }
        self.next_fire_time = next;
    }

    /// Map a job outcome to what the store should do with this trigger.
    pub fn execution_complete(
        &self,
        result: Option<&JobExecutionError>,
    ) -> CompletedExecutionInstruction {
        if let Some(err) = result {
            if err.refire_immediately {
                return CompletedExecutionInstruction::ReExecuteJob;
            }
            if err.unschedule_firing_trigger {
                return CompletedExecutionInstruction::SetTriggerComplete;
            }
            if err.unschedule_all_triggers {
                return CompletedExecutionInstruction::SetAllJobTriggersComplete;
            }
        }
        if self.may_fire_again() {
            CompletedExecutionInstruction::NoInstruction
        } else {
            CompletedExecutionInstruction::DeleteTrigger
        }
    }

    pub fn may_fire_again(&self) -> bool {
        self.next_fire_time.is_some()
    }

    /// Move `candidate` out of calendar exclusions.
    ///
    /// One-shot and interval kinds are relocated to the next included instant;
    /// occurrence-based kinds skip to their next occurrence that is included.
    fn apply_calendar(
        &self,
        candidate: Option<DateTime<Utc>>,
        cx: &ScheduleContext<'_>,
    ) -> Option<DateTime<Utc>> {
        let Some(calendar) = cx.calendar else {
            return candidate;
        };
        let mut t = candidate?;
        let relocate = matches!(self.schedule, Schedule::Once | Schedule::Interval { .. });
        for _ in 0..MAX_EXCLUDED_OCCURRENCES {
            if t.year() > CALENDAR_SEARCH_HORIZON_YEAR {
                return None;
            }
            if calendar.is_included(t) {
                return Some(t);
            }
            if relocate {
                let moved = calendar.next_included_instant(t)?;
                return match self.end_time {
                    Some(end) if moved > end => None,
                    _ => Some(moved),
                };
            }
            t = self.fire_time_after(t, cx)?;
        }
        None
    }
}

pub struct TriggerBuilder {
    trigger: Trigger,
    start_set: bool,
}

impl TriggerBuilder {
    pub fn start_at(mut self, t: DateTime<Utc>) -> Self {
        self.trigger.start_time = millis(t);
        self.start_set = true;
        self
    }

    pub fn end_at(mut self, t: DateTime<Utc>) -> Self {
        self.trigger.end_time = Some(millis(t));
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.trigger.priority = priority;
        self
    }

    pub fn misfire(mut self, instruction: MisfireInstruction) -> Self {
        self.trigger.misfire_instruction = instruction;
        self
    }

    pub fn calendar(mut self, name: impl Into<String>) -> Self {
        self.trigger.calendar_name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.trigger.description = Some(description.into());
        self
    }

    pub fn data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.trigger.data.insert(key.into(), value.into());
        self
    }

    pub fn data_map(mut self, data: JobDataMap) -> Self {
        self.trigger.data.extend(data);
        self
    }

    /// Without [`start_at`](Self::start_at) the trigger starts now.
    pub fn build(mut self) -> Trigger {
        if !self.start_set {
            self.trigger.start_time = millis(Utc::now());
        }
        self.trigger
    }
}
