//! Daemon configuration: the core `[scheduler]`/`[store]` sections plus the
//! calendars and jobs declared in the same file.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context};
use cadence_core::{CadenceConfig, JobKey, TriggerKey, DEFAULT_GROUP};
use cadence_scheduler::job::JobDataMap;
use cadence_scheduler::trigger::ScheduleContext;
use cadence_scheduler::{
    Calendar, CustomScheduleRegistry, Exclusion, JobDetail, MisfireInstruction, Schedule, Trigger,
};
use chrono::{DateTime, Utc};
use figment::Figment;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    #[serde(flatten)]
    pub core: CadenceConfig,
    #[serde(default)]
    pub calendars: Vec<CalendarSpec>,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalendarSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// A calendar declared earlier in the file whose exclusions also apply.
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub exclusions: Vec<Exclusion>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default = "default_group")]
    pub group: String,
    pub job_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub disallow_concurrent_execution: bool,
    #[serde(default)]
    pub persist_job_data: bool,
    #[serde(default)]
    pub requests_recovery: bool,
    #[serde(default)]
    pub data: JobDataMap,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerSpec {
    pub name: String,
    /// Defaults to the job's group.
    #[serde(default)]
    pub group: Option<String>,
    pub schedule: Schedule,
    /// Defaults to the time the daemon starts.
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub misfire: MisfireInstruction,
    #[serde(default)]
    pub calendar: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub data: JobDataMap,
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

/// Everything the config file asks the daemon to schedule, checked.
#[derive(Debug)]
pub struct Declarations {
    pub calendars: Vec<(String, Calendar)>,
    pub jobs: Vec<(JobDetail, Vec<Trigger>)>,
}

impl DaemonConfig {
    /// Same sources as [`CadenceConfig::load`].
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        Self::from_figment(cadence_core::config::figment(config_path))
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: DaemonConfig = figment.extract().context("invalid configuration")?;
        config.core.validate()?;
        Ok(config)
    }

    /// Build the declared calendars and jobs. Triggers without a start time
    /// start at `now`.
    pub fn declarations(&self, now: DateTime<Utc>) -> anyhow::Result<Declarations> {
        let mut calendars: Vec<(String, Calendar)> = Vec::with_capacity(self.calendars.len());
        for spec in &self.calendars {
            if calendars.iter().any(|(n, _)| n == &spec.name) {
                bail!("calendar {} declared twice", spec.name);
            }
            let mut calendar = Calendar::from_layers(spec.exclusions.clone())
                .with_context(|| format!("calendar {}", spec.name))?;
            if let Some(base) = &spec.base {
                let (_, base) = calendars
                    .iter()
                    .find(|(n, _)| n == base)
                    .ok_or_else(|| anyhow!("calendar {}: base {base} is not declared before it", spec.name))?;
                calendar = calendar
                    .with_base(base)
                    .with_context(|| format!("calendar {}", spec.name))?;
            }
            if let Some(description) = &spec.description {
                calendar = calendar.with_description(description.clone());
            }
            calendars.push((spec.name.clone(), calendar));
        }

        let by_name: HashMap<&str, &Calendar> =
            calendars.iter().map(|(n, c)| (n.as_str(), c)).collect();
        let custom = CustomScheduleRegistry::new();
        let mut jobs = Vec::with_capacity(self.jobs.len());
        for spec in &self.jobs {
            let job = spec.job_detail();
            let mut triggers = Vec::with_capacity(spec.triggers.len());
            for t in &spec.triggers {
                let trigger = t.build(&job.key, now);
                let calendar = match &trigger.calendar_name {
                    Some(name) => Some(*by_name.get(name.as_str()).ok_or_else(|| {
                        anyhow!("trigger {} uses undeclared calendar {name}", trigger.key)
                    })?),
                    None => None,
                };
                let cx = ScheduleContext::new(calendar, &custom);
                trigger
                    .validate(&cx)
                    .with_context(|| format!("trigger {}", trigger.key))?;
                triggers.push(trigger);
            }
            if triggers.is_empty() && !job.durable {
                bail!("job {} has no triggers and is not durable", job.key);
            }
            jobs.push((job, triggers));
        }
        Ok(Declarations { calendars, jobs })
    }
}

impl JobSpec {
    fn job_detail(&self) -> JobDetail {
        let mut job = JobDetail::new(JobKey::new(&self.name, &self.group), &self.job_type)
            .durable(self.durable)
            .disallow_concurrent_execution(self.disallow_concurrent_execution)
            .persist_job_data(self.persist_job_data)
            .requests_recovery(self.requests_recovery);
        job.data = self.data.clone();
        if let Some(description) = &self.description {
            job = job.with_description(description.clone());
        }
        job
    }
}

impl TriggerSpec {
    fn build(&self, job_key: &JobKey, now: DateTime<Utc>) -> Trigger {
        let group = self.group.as_deref().unwrap_or(&job_key.group);
        let mut builder = Trigger::builder(
            TriggerKey::new(&self.name, group),
            job_key.clone(),
            self.schedule.clone(),
        )
        .start_at(self.start_at.unwrap_or(now))
        .misfire(self.misfire)
        .data_map(self.data.clone());
        if let Some(end) = self.end_at {
            builder = builder.end_at(end);
        }
        if let Some(priority) = self.priority {
            builder = builder.priority(priority);
        }
        if let Some(calendar) = &self.calendar {
            builder = builder.calendar(calendar.clone());
        }
        if let Some(description) = &self.description {
            builder = builder.description(description.clone());
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use figment::providers::{Format, Toml};

    fn parse(toml: &str) -> anyhow::Result<DaemonConfig> {
        DaemonConfig::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 3, 4, 5, 6, 0).unwrap()
    }

    const FULL: &str = r#"
        [scheduler]
        thread_count = 4
        idle_wait_ms = 5000

        [store]
        kind = "sqlite"
        path = "/tmp/cadence-test.db"

        [[calendars]]
        name = "weekends"
        [[calendars.exclusions]]
        kind = "weekly"
        days = [5, 6]

        [[calendars]]
        name = "quiet"
        base = "weekends"
        description = "weekends and nights"
        [[calendars.exclusions]]
        kind = "daily"
        start = "06:00:00"
        end = "22:00:00"
        inverted = true

        [[jobs]]
        name = "heartbeat"
        group = "ops"
        job_type = "log"
        data = { message = "still alive" }

        [[jobs.triggers]]
        name = "every-minute"
        schedule = { kind = "interval", every_ms = 60000 }
        priority = 8

        [[jobs.triggers]]
        name = "office-hours"
        schedule = { kind = "cron", expression = "0 0 9-17 * * *" }
        calendar = "quiet"
        misfire = "do_nothing"

        [[jobs]]
        name = "cleanup"
        job_type = "command"
        durable = true
        data = { command = "true" }
    "#;

    #[test]
    fn full_file_parses() {
        let config = parse(FULL).unwrap();
        assert_eq!(config.core.scheduler.thread_count, 4);
        assert_eq!(config.core.scheduler.idle_wait_ms, 5000);
        assert_eq!(config.calendars.len(), 2);
        assert_eq!(config.jobs.len(), 2);

        let declared = config.declarations(now()).unwrap();
        let (_, quiet) = &declared.calendars[1];
        assert_eq!(quiet.depth(), 2);
        assert_eq!(quiet.description.as_deref(), Some("weekends and nights"));

        let (job, triggers) = &declared.jobs[0];
        assert_eq!(job.key, JobKey::new("heartbeat", "ops"));
        assert_eq!(job.data.get("message"), Some(&serde_json::json!("still alive")));
        assert_eq!(triggers.len(), 2);
        assert_eq!(triggers[0].key, TriggerKey::new("every-minute", "ops"));
        assert_eq!(triggers[0].priority, 8);
        assert_eq!(triggers[0].start_time, now());
        assert!(matches!(
            triggers[0].schedule,
            Schedule::Interval { every_ms: 60_000, repeat_count: None }
        ));
        assert_eq!(triggers[1].calendar_name.as_deref(), Some("quiet"));
        assert_eq!(triggers[1].misfire_instruction, MisfireInstruction::DoNothing);

        let (cleanup, cleanup_triggers) = &declared.jobs[1];
        assert!(cleanup.durable);
        assert!(cleanup_triggers.is_empty());
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config = parse("").unwrap();
        assert!(config.jobs.is_empty());
        assert_eq!(config.core.scheduler.thread_count, 10);
    }

    #[test]
    fn undeclared_calendar_is_rejected() {
        let config = parse(
            r#"
            [[jobs]]
            name = "j"
            job_type = "log"
            [[jobs.triggers]]
            name = "t"
            schedule = { kind = "once" }
            calendar = "missing"
            "#,
        )
        .unwrap();
        let err = config.declarations(now()).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn non_durable_job_without_triggers_is_rejected() {
        let config = parse(
            r#"
            [[jobs]]
            name = "lonely"
            job_type = "log"
            "#,
        )
        .unwrap();
        assert!(config.declarations(now()).is_err());
    }

    #[test]
    fn illegal_misfire_instruction_is_rejected() {
        let config = parse(
            r#"
            [[jobs]]
            name = "j"
            job_type = "log"
            [[jobs.triggers]]
            name = "t"
            schedule = { kind = "daily", hour = 3, minute = 0 }
            misfire = "reschedule_now_with_existing_count"
            "#,
        )
        .unwrap();
        assert!(config.declarations(now()).is_err());
    }

    #[test]
    fn invalid_core_section_fails_load() {
        assert!(parse("[scheduler]\nthread_count = 0\n").is_err());
    }
}
