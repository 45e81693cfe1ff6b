//! Parsed cron expressions shared by cron schedules and cron calendars.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::ScheduleError;

/// A cron expression, parsed once and kept alongside its source text.
///
/// Accepts the standard 5-field Unix form (minute resolution) as well as the
/// 6/7-field forms understood by the `cron` crate (seconds, optional year).
/// Serialized as the source string.
#[derive(Clone)]
pub struct CronExpr {
    source: String,
    schedule: cron::Schedule,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let normalized = normalize(expression);
        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            source: expression.trim().to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First matching instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Whether the second containing `t` matches the expression.
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.schedule.includes(t)
    }
}

/// The `cron` crate wants seconds first and an optional trailing year.
fn normalize(expression: &str) -> String {
    let expression = expression.trim();
    if expression.split_whitespace().count() == 5 {
        format!("0 {} *", expression)
    } else {
        expression.to_string()
    }
}

impl PartialEq for CronExpr {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for CronExpr {}

impl fmt::Debug for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronExpr").field(&self.source).finish()
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronExpr {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for CronExpr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for CronExpr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        CronExpr::parse(&source).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expression_gets_seconds() {
        let expr = CronExpr::parse("*/15 * * * *").expect("valid");
        let from = Utc.with_ymd_and_hms(2030, 3, 1, 10, 7, 30).unwrap();
        assert_eq!(
            expr.next_after(from),
            Some(Utc.with_ymd_and_hms(2030, 3, 1, 10, 15, 0).unwrap())
        );
    }

    #[test]
    fn six_field_expression_has_second_resolution() {
        let expr = CronExpr::parse("*/10 * * * * *").expect("valid");
        let from = Utc.with_ymd_and_hms(2030, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(
            expr.next_after(from),
            Some(Utc.with_ymd_and_hms(2030, 3, 1, 10, 0, 10).unwrap())
        );
        assert!(expr.matches(Utc.with_ymd_and_hms(2030, 3, 1, 10, 0, 20).unwrap()));
        assert!(!expr.matches(Utc.with_ymd_and_hms(2030, 3, 1, 10, 0, 21).unwrap()));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            CronExpr::parse("every tuesday"),
            Err(ScheduleError::InvalidCron { .. })
        ));
    }

    #[test]
    fn serializes_as_source_text() {
        let expr = CronExpr::parse("0 3 * * *").expect("valid");
        let json = serde_json::to_string(&expr).expect("serialize");
        assert_eq!(json, "\"0 3 * * *\"");
        let back: CronExpr = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, expr);
        assert!(serde_json::from_str::<CronExpr>("\"nope\"").is_err());
    }
}
