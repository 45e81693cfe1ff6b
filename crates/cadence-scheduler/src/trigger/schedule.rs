use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::calendar::Calendar;
use crate::cron_expr::CronExpr;
use crate::error::ScheduleError;
use crate::trigger::MisfireInstruction;

/// Defines when a trigger fires, relative to its `start_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// A single fire at the trigger's start time.
    Once,

    /// Fixed rate from the start time. `repeat_count` counts fires after the
    /// first; `None` repeats until the end time (if any).
    Interval {
        every_ms: u64,
        #[serde(default)]
        repeat_count: Option<u32>,
    },

    /// Every day at HH:MM UTC.
    Daily { hour: u8, minute: u8 },

    /// On a weekday (0 = Monday … 6 = Sunday) at HH:MM UTC.
    Weekly { day: u8, hour: u8, minute: u8 },

    Cron { expression: CronExpr },

    /// Resolved through a [`CustomScheduleRegistry`].
    Custom {
        /// The registered [`CustomSchedule::kind`].
        name: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

impl Schedule {
    pub fn interval(every: Duration) -> Self {
        Schedule::Interval {
            every_ms: every.num_milliseconds().max(0) as u64,
            repeat_count: None,
        }
    }

    pub fn interval_repeating(every: Duration, repeat_count: u32) -> Self {
        Schedule::Interval {
            every_ms: every.num_milliseconds().max(0) as u64,
            repeat_count: Some(repeat_count),
        }
    }

    pub fn cron(expression: &str) -> Result<Self, ScheduleError> {
        Ok(Schedule::Cron {
            expression: CronExpr::parse(expression)?,
        })
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Schedule::Once => "once",
            Schedule::Interval { .. } => "interval",
            Schedule::Daily { .. } => "daily",
            Schedule::Weekly { .. } => "weekly",
            Schedule::Cron { .. } => "cron",
            Schedule::Custom { .. } => "custom",
        }
    }

    /// Whether `instruction` is in this kind's legal subset.
    pub fn allows(&self, instruction: MisfireInstruction) -> bool {
        instruction.is_universal() || matches!(self, Schedule::Interval { .. })
    }

    /// The concrete instruction `Smart` stands for on this schedule.
    pub fn resolve_smart(&self) -> MisfireInstruction {
        match self {
            Schedule::Once => MisfireInstruction::FireNow,
            Schedule::Interval {
                repeat_count: Some(0),
                ..
            } => MisfireInstruction::FireNow,
            Schedule::Interval {
                repeat_count: None, ..
            } => MisfireInstruction::RescheduleNextWithRemainingCount,
            Schedule::Interval { .. } => MisfireInstruction::RescheduleNowWithExistingCount,
            _ => MisfireInstruction::FireNow,
        }
    }

    /// Fires again after one fire, ignoring end times and calendars.
    pub fn repeats(&self) -> bool {
        !matches!(
            self,
            Schedule::Once
                | Schedule::Interval {
                    repeat_count: Some(0),
                    ..
                }
        )
    }

    pub fn validate(&self, custom: &CustomScheduleRegistry) -> Result<(), ScheduleError> {
        match self {
            Schedule::Interval { every_ms: 0, .. } => Err(ScheduleError::InvalidSchedule(
                "interval must be at least 1ms".into(),
            )),
            Schedule::Interval { every_ms, .. } if *every_ms > i64::MAX as u64 => {
                Err(ScheduleError::InvalidSchedule(format!(
                    "interval of {every_ms}ms is too large"
                )))
            }
            Schedule::Daily { hour, minute } | Schedule::Weekly { hour, minute, .. }
                if *hour > 23 || *minute > 59 =>
            {
                Err(ScheduleError::InvalidSchedule(format!(
                    "no such time of day: {hour:02}:{minute:02}"
                )))
            }
            Schedule::Weekly { day, .. } if *day > 6 => Err(ScheduleError::InvalidSchedule(
                format!("weekday {day} out of range 0..=6"),
            )),
            Schedule::Custom { name, params } => {
                let schedule = custom
                    .get(name)
                    .ok_or_else(|| ScheduleError::UnknownCustomKind(name.clone()))?;
                schedule.validate(params)
            }
            _ => Ok(()),
        }
    }

    /// Raw next fire time strictly after `after`, never before `start`.
    ///
    /// Calendars and end times are applied by the trigger.
    pub(crate) fn fire_time_after(
        &self,
        start: DateTime<Utc>,
        after: DateTime<Utc>,
        times_triggered: u32,
        custom: &CustomScheduleRegistry,
    ) -> Option<DateTime<Utc>> {
        // Occurrence-based kinds may land exactly on `start`.
        let from = after.max(start - Duration::milliseconds(1));
        match self {
            Schedule::Once => (after < start).then_some(start),

            Schedule::Interval {
                every_ms,
                repeat_count,
            } => {
                if repeat_count.is_some_and(|r| times_triggered > r) {
                    return None;
                }
                if after < start {
                    return Some(start);
                }
                let every = (*every_ms).max(1) as i64;
                let n = (after - start).num_milliseconds() / every + 1;
                if repeat_count.is_some_and(|r| n > r as i64) {
                    return None;
                }
                start.checked_add_signed(Duration::milliseconds(n.checked_mul(every)?))
            }

            Schedule::Daily { hour, minute } => next_daily(from, *hour, *minute),

            Schedule::Weekly { day, hour, minute } => next_weekly(from, *day, *hour, *minute),

            Schedule::Cron { expression } => expression.next_after(from),

            Schedule::Custom { name, params } => custom.get(name)?.fire_time_after(params, start, after),
        }
    }

    /// Number of fires in `(from, to]` on the raw schedule.
    pub(crate) fn fires_between(
        &self,
        start: DateTime<Utc>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> u32 {
        match self {
            Schedule::Interval { every_ms, .. } if to > from => {
                let every = (*every_ms).max(1) as i64;
                let offset = (from - start).num_milliseconds().max(0);
                let span = (to - start).num_milliseconds().max(0);
                (span / every - offset / every).max(0) as u32
            }
            _ => 0,
        }
    }
}

fn at_hm(date: chrono::NaiveDate, hour: u8, minute: u8) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(
        date.year(),
        date.month(),
        date.day(),
        hour as u32,
        minute as u32,
        0,
    )
    .single()
}

fn next_daily(from: DateTime<Utc>, hour: u8, minute: u8) -> Option<DateTime<Utc>> {
    let candidate = at_hm(from.date_naive(), hour, minute)?;
    if candidate > from {
        Some(candidate)
    } else {
        // Today's slot has passed.
        Some(candidate + Duration::days(1))
    }
}

fn next_weekly(from: DateTime<Utc>, day: u8, hour: u8, minute: u8) -> Option<DateTime<Utc>> {
    // `day` uses chrono's `num_days_from_monday` numbering.
    let today = from.weekday().num_days_from_monday() as i64;
    let ahead = (day.min(6) as i64 - today).rem_euclid(7);
    let candidate = at_hm(from.date_naive() + Duration::days(ahead), hour, minute)?;
    if candidate > from {
        Some(candidate)
    } else {
        Some(candidate + Duration::days(7))
    }
}

/// User-supplied schedule kind.
///
/// Registered under [`kind`](Self::kind) and referenced by
/// [`Schedule::Custom`] with per-trigger `params`.
pub trait CustomSchedule: Send + Sync {
    fn kind(&self) -> &str;

    fn validate(&self, _params: &serde_json::Value) -> Result<(), ScheduleError> {
        Ok(())
    }

    /// First fire strictly after `after`, not before `start`. `None` when exhausted.
    fn fire_time_after(
        &self,
        params: &serde_json::Value,
        start: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>>;
}

#[derive(Clone, Default)]
pub struct CustomScheduleRegistry {
    schedules: BTreeMap<String, Arc<dyn CustomSchedule>>,
}

static NO_CUSTOM_SCHEDULES: CustomScheduleRegistry = CustomScheduleRegistry {
    schedules: BTreeMap::new(),
};

impl CustomScheduleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with nothing in it, for contexts that have no custom kinds.
    pub fn none() -> &'static CustomScheduleRegistry {
        &NO_CUSTOM_SCHEDULES
    }

    pub fn register(&mut self, schedule: Arc<dyn CustomSchedule>) {
        self.schedules.insert(schedule.kind().to_string(), schedule);
    }

    pub fn with(mut self, schedule: Arc<dyn CustomSchedule>) -> Self {
        self.register(schedule);
        self
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn CustomSchedule>> {
        self.schedules.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.schedules.keys().map(String::as_str)
    }
}

impl fmt::Debug for CustomScheduleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.schedules.keys()).finish()
    }
}

/// Everything outside the trigger itself that fire time computation consults.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleContext<'a> {
    pub calendar: Option<&'a Calendar>,
    pub custom: &'a CustomScheduleRegistry,
}

impl<'a> ScheduleContext<'a> {
    pub fn new(calendar: Option<&'a Calendar>, custom: &'a CustomScheduleRegistry) -> Self {
        Self { calendar, custom }
    }

    /// No calendar, no custom kinds.
    pub fn plain() -> ScheduleContext<'static> {
        ScheduleContext {
            calendar: None,
            custom: CustomScheduleRegistry::none(),
        }
    }

    pub fn with_calendar(calendar: &'a Calendar) -> Self {
        Self {
            calendar: Some(calendar),
            custom: CustomScheduleRegistry::none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn none() -> &'static CustomScheduleRegistry {
        CustomScheduleRegistry::none()
    }

    #[test]
    fn once_fires_only_at_start() {
        let start = ts(2030, 1, 1, 0, 0, 0);
        let s = Schedule::Once;
        assert_eq!(s.fire_time_after(start, start - Duration::seconds(1), 0, none()), Some(start));
        assert_eq!(s.fire_time_after(start, start, 0, none()), None);
    }

    #[test]
    fn interval_is_fixed_rate_from_start() {
        let start = ts(2030, 1, 1, 0, 0, 0);
        let s = Schedule::interval(Duration::seconds(10));
        let after = start + Duration::seconds(25);
        assert_eq!(
            s.fire_time_after(start, after, 2, none()),
            Some(start + Duration::seconds(30))
        );
        assert_eq!(
            s.fire_time_after(start, start, 0, none()),
            Some(start + Duration::seconds(10))
        );
    }

    #[test]
    fn interval_stops_after_repeat_count() {
        let start = ts(2030, 1, 1, 0, 0, 0);
        let s = Schedule::interval_repeating(Duration::seconds(10), 2);
        assert_eq!(
            s.fire_time_after(start, start + Duration::seconds(10), 2, none()),
            Some(start + Duration::seconds(20))
        );
        assert_eq!(s.fire_time_after(start, start + Duration::seconds(20), 3, none()), None);
    }

    #[test]
    fn daily_rolls_over() {
        let s = Schedule::Daily { hour: 9, minute: 30 };
        let start = ts(2030, 1, 1, 0, 0, 0);
        assert_eq!(
            s.fire_time_after(start, ts(2030, 1, 1, 8, 0, 0), 0, none()),
            Some(ts(2030, 1, 1, 9, 30, 0))
        );
        assert_eq!(
            s.fire_time_after(start, ts(2030, 1, 1, 9, 30, 0), 0, none()),
            Some(ts(2030, 1, 2, 9, 30, 0))
        );
    }

    #[test]
    fn weekly_targets_weekday() {
        // 2030-01-01 is a Tuesday; day 4 is Friday.
        let s = Schedule::Weekly {
            day: 4,
            hour: 18,
            minute: 0,
        };
        let start = ts(2030, 1, 1, 0, 0, 0);
        assert_eq!(
            s.fire_time_after(start, ts(2030, 1, 1, 12, 0, 0), 0, none()),
            Some(ts(2030, 1, 4, 18, 0, 0))
        );
        assert_eq!(
            s.fire_time_after(start, ts(2030, 1, 4, 18, 0, 0), 0, none()),
            Some(ts(2030, 1, 11, 18, 0, 0))
        );
    }

    #[test]
    fn cron_respects_start_time() {
        let s = Schedule::cron("0 * * * *").unwrap();
        let start = ts(2030, 1, 1, 5, 0, 0);
        assert_eq!(
            s.fire_time_after(start, ts(2029, 12, 31, 0, 0, 0), 0, none()),
            Some(start)
        );
    }

    #[test]
    fn smart_resolution_table() {
        assert_eq!(Schedule::Once.resolve_smart(), MisfireInstruction::FireNow);
        assert_eq!(
            Schedule::interval(Duration::seconds(1)).resolve_smart(),
            MisfireInstruction::RescheduleNextWithRemainingCount
        );
        assert_eq!(
            Schedule::interval_repeating(Duration::seconds(1), 3).resolve_smart(),
            MisfireInstruction::RescheduleNowWithExistingCount
        );
        assert_eq!(
            Schedule::interval_repeating(Duration::seconds(1), 0).resolve_smart(),
            MisfireInstruction::FireNow
        );
        assert_eq!(
            Schedule::cron("0 * * * *").unwrap().resolve_smart(),
            MisfireInstruction::FireNow
        );
    }

    #[test]
    fn interval_only_instructions() {
        let cron = Schedule::cron("0 * * * *").unwrap();
        assert!(!cron.allows(MisfireInstruction::RescheduleNowWithRemainingCount));
        assert!(cron.allows(MisfireInstruction::DoNothing));
        assert!(Schedule::interval(Duration::seconds(5))
            .allows(MisfireInstruction::RescheduleNowWithRemainingCount));
    }

    #[test]
    fn validate_rejects_bad_fields() {
        assert!(Schedule::Interval {
            every_ms: 0,
            repeat_count: None
        }
        .validate(none())
        .is_err());
        assert!(Schedule::Interval {
            every_ms: u64::MAX,
            repeat_count: None
        }
        .validate(none())
        .is_err());
        assert!(Schedule::Interval {
            every_ms: i64::MAX as u64,
            repeat_count: Some(1)
        }
        .validate(none())
        .is_ok());
        assert!(Schedule::Daily { hour: 24, minute: 0 }.validate(none()).is_err());
        assert!(Schedule::Weekly {
            day: 7,
            hour: 0,
            minute: 0
        }
        .validate(none())
        .is_err());
        assert_eq!(
            Schedule::Custom {
                name: "lunar".into(),
                params: serde_json::Value::Null
            }
            .validate(none()),
            Err(ScheduleError::UnknownCustomKind("lunar".into()))
        );
    }

    struct EveryOtherHour;

    impl CustomSchedule for EveryOtherHour {
        fn kind(&self) -> &str {
            "every_other_hour"
        }

        fn fire_time_after(
            &self,
            _params: &serde_json::Value,
            start: DateTime<Utc>,
            after: DateTime<Utc>,
        ) -> Option<DateTime<Utc>> {
            let mut t = start;
            while t <= after {
                t += Duration::hours(2);
            }
            Some(t)
        }
    }

    #[test]
    fn custom_kind_resolves_through_registry() {
        let registry = CustomScheduleRegistry::new().with(Arc::new(EveryOtherHour));
        let s = Schedule::Custom {
            name: "every_other_hour".into(),
            params: serde_json::Value::Null,
        };
        let start = ts(2030, 1, 1, 0, 0, 0);
        assert!(s.validate(&registry).is_ok());
        assert_eq!(
            s.fire_time_after(start, ts(2030, 1, 1, 3, 0, 0), 0, &registry),
            Some(ts(2030, 1, 1, 4, 0, 0))
        );
    }

    #[test]
    fn deserializes_from_tagged_json() {
        let s: Schedule =
            serde_json::from_str(r#"{"kind":"interval","every_ms":60000}"#).unwrap();
        assert_eq!(
            s,
            Schedule::Interval {
                every_ms: 60_000,
                repeat_count: None
            }
        );
        let c: Schedule =
            serde_json::from_str(r#"{"kind":"cron","expression":"*/5 * * * *"}"#).unwrap();
        assert_eq!(c.kind_name(), "cron");
    }
}
