//! Job definitions, the executable `Job` trait and the registry that maps a
//! stored `job_type` to its implementation.

use async_trait::async_trait;
use cadence_core::{JobKey, TriggerKey};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::trigger::Trigger;
use crate::types::{
    TriggerFiredBundle, RECOVERY_FIRE_TIME_KEY, RECOVERY_SCHEDULED_FIRE_TIME_KEY,
    RECOVERY_TRIGGER_GROUP_KEY, RECOVERY_TRIGGER_NAME_KEY,
};

/// Opaque key → JSON bag passed to jobs.
pub type JobDataMap = serde_json::Map<String, serde_json::Value>;

/// A stored job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub key: JobKey,
    /// Name under which the implementation is registered in a [`JobRegistry`].
    pub job_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub data: JobDataMap,
    /// Kept when its last trigger goes away.
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub concurrent_execution_disallowed: bool,
    #[serde(default)]
    pub persist_job_data_after_execution: bool,
    /// Re-run after a crash that interrupted an execution.
    #[serde(default)]
    pub requests_recovery: bool,
}

impl JobDetail {
    pub fn new(key: JobKey, job_type: impl Into<String>) -> Self {
        Self {
            key,
            job_type: job_type.into(),
            description: None,
            data: JobDataMap::new(),
            durable: false,
            concurrent_execution_disallowed: false,
            persist_job_data_after_execution: false,
            requests_recovery: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn disallow_concurrent_execution(mut self, disallow: bool) -> Self {
        self.concurrent_execution_disallowed = disallow;
        self
    }

    pub fn persist_job_data(mut self, persist: bool) -> Self {
        self.persist_job_data_after_execution = persist;
        self
    }

    pub fn requests_recovery(mut self, requests: bool) -> Self {
        self.requests_recovery = requests;
        self
    }
}

/// A failed run, with what the scheduler should do about it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct JobExecutionError {
    pub message: String,
    pub refire_immediately: bool,
    pub unschedule_firing_trigger: bool,
    pub unschedule_all_triggers: bool,
}

impl JobExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            refire_immediately: false,
            unschedule_firing_trigger: false,
            unschedule_all_triggers: false,
        }
    }

    /// Run the job again right away.
    pub fn refire(mut self) -> Self {
        self.refire_immediately = true;
        self
    }

    /// Never fire the trigger that fired this run again.
    pub fn unschedule_trigger(mut self) -> Self {
        self.unschedule_firing_trigger = true;
        self
    }

    /// Never fire any trigger of this job again.
    pub fn unschedule_all(mut self) -> Self {
        self.unschedule_all_triggers = true;
        self
    }
}

impl From<anyhow::Error> for JobExecutionError {
    fn from(e: anyhow::Error) -> Self {
        JobExecutionError::new(format!("{e:#}"))
    }
}

/// Everything a running job can see about why it runs.
#[derive(Debug, Clone)]
pub struct JobExecutionContext {
    /// The job as stored. Changes to `job.data` are written back when the job
    /// has `persist_job_data_after_execution`.
    pub job: JobDetail,
    pub trigger: Trigger,
    /// Job data overlaid with the trigger's data.
    pub merged_data: JobDataMap,
    pub fire_instance_id: String,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: DateTime<Utc>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub recovering: bool,
    /// How many times this fire has been re-executed.
    pub refire_count: u32,
    /// Free-form value a job may leave for listeners.
    pub result: Option<serde_json::Value>,
    pub run_time: Duration,
}

impl JobExecutionContext {
    pub fn new(bundle: &TriggerFiredBundle) -> Self {
        let mut merged_data = bundle.job.data.clone();
        merged_data.extend(
            bundle
                .trigger
                .data
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        Self {
            job: bundle.job.clone(),
            trigger: bundle.trigger.clone(),
            merged_data,
            fire_instance_id: bundle.fire_instance_id.clone(),
            fire_time: bundle.fire_time,
            scheduled_fire_time: bundle.scheduled_fire_time,
            previous_fire_time: bundle.previous_fire_time,
            next_fire_time: bundle.next_fire_time,
            recovering: bundle.recovering,
            refire_count: 0,
            result: None,
            run_time: Duration::ZERO,
        }
    }

    pub fn job_key(&self) -> &JobKey {
        &self.job.key
    }

    pub fn trigger_key(&self) -> &TriggerKey {
        &self.trigger.key
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.merged_data.get(key).and_then(|v| v.as_str())
    }

    /// For a recovery run: the trigger whose fire was interrupted.
    pub fn recovering_trigger_key(&self) -> Option<TriggerKey> {
        if !self.recovering {
            return None;
        }
        let name = self.get_str(RECOVERY_TRIGGER_NAME_KEY)?;
        let group = self.get_str(RECOVERY_TRIGGER_GROUP_KEY)?;
        Some(TriggerKey::new(name, group))
    }

    /// For a recovery run: the interrupted (fire time, scheduled fire time).
    pub fn recovered_fire_times(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let millis = |key: &str| {
            self.merged_data
                .get(key)
                .and_then(|v| v.as_i64())
                .and_then(DateTime::<Utc>::from_timestamp_millis)
        };
        Some((
            millis(RECOVERY_FIRE_TIME_KEY)?,
            millis(RECOVERY_SCHEDULED_FIRE_TIME_KEY)?,
        ))
    }
}

/// Executable unit of work.
#[async_trait]
pub trait Job: Send + Sync {
    async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError>;
}

/// Maps `job_type` names to implementations.
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<String, Arc<dyn Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the implementation for `job_type`.
    pub fn register(&self, job_type: impl Into<String>, job: Arc<dyn Job>) {
        let job_type = job_type.into();
        tracing::debug!(job_type = %job_type, "job type registered");
        self.jobs.insert(job_type, job);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn Job>> {
        self.jobs.get(job_type).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.jobs.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.jobs.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::Schedule;
    use chrono::TimeZone;

    struct Noop;

    #[async_trait]
    impl Job for Noop {
        async fn execute(&self, _ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
            Ok(())
        }
    }

    fn bundle() -> TriggerFiredBundle {
        let at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let job = JobDetail::new(JobKey::named("report"), "noop")
            .with_data("format", "pdf")
            .with_data("pages", 3);
        let trigger = Trigger::builder(TriggerKey::named("t"), job.key.clone(), Schedule::Once)
            .start_at(at)
            .data("format", "csv")
            .build();
        TriggerFiredBundle {
            job,
            trigger,
            fire_instance_id: "f-1".into(),
            fire_time: at,
            scheduled_fire_time: at,
            previous_fire_time: None,
            next_fire_time: None,
            recovering: false,
        }
    }

    #[test]
    fn trigger_data_overrides_job_data() {
        let ctx = JobExecutionContext::new(&bundle());
        assert_eq!(ctx.get_str("format"), Some("csv"));
        assert_eq!(ctx.merged_data.get("pages"), Some(&serde_json::json!(3)));
        assert_eq!(ctx.job.data.get("format"), Some(&serde_json::json!("pdf")));
    }

    #[test]
    fn non_recovery_run_has_no_recovering_key() {
        let ctx = JobExecutionContext::new(&bundle());
        assert_eq!(ctx.recovering_trigger_key(), None);
    }

    #[test]
    fn registry_lookup() {
        let registry = JobRegistry::new();
        registry.register("noop", Arc::new(Noop));
        assert!(registry.contains("noop"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.job_types(), vec!["noop".to_string()]);
    }

    #[test]
    fn job_detail_roundtrips_with_defaults() {
        let json = r#"{"key":{"name":"n","group":"g"},"job_type":"noop"}"#;
        let job: JobDetail = serde_json::from_str(json).unwrap();
        assert!(!job.durable);
        assert!(job.data.is_empty());
    }
}
