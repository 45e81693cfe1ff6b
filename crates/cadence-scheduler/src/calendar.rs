//! Calendars: ordered chains of exclusion predicates over UTC instants.
//!
//! A calendar never decides when a trigger fires, only when it may not.
//! Attaching a base calendar appends the base's layers, so an instant is
//! excluded if any layer in the chain excludes it.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::cron_expr::CronExpr;
use crate::error::CalendarError;

/// Maximum number of layers in one calendar chain.
pub const MAX_CALENDAR_DEPTH: usize = 32;
/// Searches for an included instant give up past this year.
pub const CALENDAR_SEARCH_HORIZON_YEAR: i32 = 2299;
/// Upper bound on exclusion hops in one search; a cron layer hops a second at a time.
const MAX_SEARCH_STEPS: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonthDay {
    pub month: u32,
    pub day: u32,
}

impl MonthDay {
    pub fn new(month: u32, day: u32) -> Self {
        Self { month, day }
    }
}

/// One layer of exclusion. All arithmetic is UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Exclusion {
    /// The listed (month, day) pairs, every year.
    Annual { days: Vec<MonthDay> },
    /// The listed calendar dates.
    Holiday { dates: Vec<NaiveDate> },
    /// The listed weekdays, 0 = Monday … 6 = Sunday.
    Weekly { days: Vec<u8> },
    /// The time-of-day range `[start, end)`, or everything outside it when `inverted`.
    Daily {
        start: NaiveTime,
        end: NaiveTime,
        #[serde(default)]
        inverted: bool,
    },
    /// A fixed interval `[start, end)`.
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// Every second matched by the expression.
    Cron { expression: CronExpr },
}

impl Exclusion {
    pub fn annual(days: impl IntoIterator<Item = (u32, u32)>) -> Self {
        Exclusion::Annual {
            days: days.into_iter().map(|(m, d)| MonthDay::new(m, d)).collect(),
        }
    }

    pub fn weekly(days: impl IntoIterator<Item = u8>) -> Self {
        Exclusion::Weekly {
            days: days.into_iter().collect(),
        }
    }

    pub fn daily(start: NaiveTime, end: NaiveTime) -> Self {
        Exclusion::Daily {
            start,
            end,
            inverted: false,
        }
    }

    pub fn range(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Exclusion::Range { start, end }
    }

    pub fn validate(&self) -> Result<(), CalendarError> {
        match self {
            Exclusion::Annual { days } => {
                for md in days {
                    // 2000 is a leap year, so Feb 29 is accepted.
                    if NaiveDate::from_ymd_opt(2000, md.month, md.day).is_none() {
                        return Err(CalendarError::InvalidExclusion(format!(
                            "no such day of year: {}-{}",
                            md.month, md.day
                        )));
                    }
                }
                Ok(())
            }
            Exclusion::Weekly { days } => match days.iter().find(|d| **d > 6) {
                Some(d) => Err(CalendarError::InvalidExclusion(format!(
                    "weekday {d} out of range 0..=6"
                ))),
                None => Ok(()),
            },
            Exclusion::Daily { start, end, .. } if start >= end => Err(
                CalendarError::InvalidExclusion("daily range must start before it ends".into()),
            ),
            Exclusion::Range { start, end } if start >= end => Err(
                CalendarError::InvalidExclusion("range must start before it ends".into()),
            ),
            _ => Ok(()),
        }
    }

    pub fn excludes(&self, t: DateTime<Utc>) -> bool {
        match self {
            Exclusion::Annual { days } => {
                let md = MonthDay::new(t.month(), t.day());
                days.contains(&md)
            }
            Exclusion::Holiday { dates } => dates.contains(&t.date_naive()),
            Exclusion::Weekly { days } => {
                let dow = t.weekday().num_days_from_monday() as u8;
                days.contains(&dow)
            }
            Exclusion::Daily {
                start,
                end,
                inverted,
            } => {
                let time = t.time();
                let inside = time >= *start && time < *end;
                inside != *inverted
            }
            Exclusion::Range { start, end } => t >= *start && t < *end,
            Exclusion::Cron { expression } => expression.matches(t),
        }
    }

    /// An instant after `t` at which this layer may stop excluding.
    ///
    /// Only called when `t` is excluded. Never returns anything `<= t`.
    fn skip_from(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let next = match self {
            Exclusion::Annual { .. } | Exclusion::Holiday { .. } | Exclusion::Weekly { .. } => {
                next_midnight(t)
            }
            Exclusion::Daily {
                end,
                inverted: false,
                ..
            } => at_time(t.date_naive(), *end),
            Exclusion::Daily {
                start,
                inverted: true,
                ..
            } => {
                if t.time() < *start {
                    at_time(t.date_naive(), *start)
                } else {
                    at_time(t.date_naive() + Duration::days(1), *start)
                }
            }
            Exclusion::Range { end, .. } => *end,
            Exclusion::Cron { .. } => {
                let whole = t.with_nanosecond(0).unwrap_or(t);
                whole + Duration::seconds(1)
            }
        };
        next.max(t + Duration::milliseconds(1))
    }
}

fn at_time(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(time))
}

fn next_midnight(t: DateTime<Utc>) -> DateTime<Utc> {
    at_time(t.date_naive() + Duration::days(1), NaiveTime::MIN)
}

/// An ordered chain of exclusions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Calendar {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    layers: Vec<Exclusion>,
}

impl Calendar {
    /// A calendar that excludes nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(exclusion: Exclusion) -> Result<Self, CalendarError> {
        Self::from_layers(vec![exclusion])
    }

    pub fn from_layers(layers: Vec<Exclusion>) -> Result<Self, CalendarError> {
        check_depth(layers.len())?;
        for layer in &layers {
            layer.validate()?;
        }
        Ok(Self {
            description: None,
            layers,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Append `base`'s chain after this calendar's own layers.
    pub fn with_base(mut self, base: &Calendar) -> Result<Self, CalendarError> {
        check_depth(self.layers.len() + base.layers.len())?;
        self.layers.extend(base.layers.iter().cloned());
        Ok(self)
    }

    pub fn layers(&self) -> &[Exclusion] {
        &self.layers
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Re-check a calendar that did not come through a constructor (e.g. read
    /// back from storage).
    pub fn validate(&self) -> Result<(), CalendarError> {
        check_depth(self.layers.len())?;
        self.layers.iter().try_for_each(Exclusion::validate)
    }

    pub fn is_excluded(&self, t: DateTime<Utc>) -> bool {
        self.layers.iter().any(|layer| layer.excludes(t))
    }

    pub fn is_included(&self, t: DateTime<Utc>) -> bool {
        !self.is_excluded(t)
    }

    /// Smallest instant `>= t` that no layer excludes.
    ///
    /// `None` when the chain excludes everything up to the search horizon.
    pub fn next_included_instant(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = t;
        for _ in 0..MAX_SEARCH_STEPS {
            if t.year() > CALENDAR_SEARCH_HORIZON_YEAR {
                return None;
            }
            match self.layers.iter().find(|layer| layer.excludes(t)) {
                None => return Some(t),
                Some(layer) => t = layer.skip_from(t),
            }
        }
        None
    }
}

fn check_depth(depth: usize) -> Result<(), CalendarError> {
    if depth > MAX_CALENDAR_DEPTH {
        return Err(CalendarError::TooDeep {
            depth,
            max: MAX_CALENDAR_DEPTH,
        });
    }
    Ok(())
}
