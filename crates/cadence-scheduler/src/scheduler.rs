//! The client-facing scheduler: definitions in, lifecycle control, queries.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use cadence_core::{CadenceConfig, Clock, JobKey, SchedulerConfig, SystemClock, TriggerKey};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::calendar::Calendar;
use crate::engine::{Escalation, FiringLoop, LoopSettings};
use crate::error::{Result, SchedulerError, StoreError, StoreResult};
use crate::job::{JobDataMap, JobDetail, JobRegistry};
use crate::listener::ListenerRegistry;
use crate::maintenance::Maintenance;
use crate::pool::WorkerPool;
use crate::shell::RunShell;
use crate::signaler::{SchedulingSignal, Signaler};
use crate::store::{open_store, run_blocking, JobStore};
use crate::trigger::{CustomSchedule, CustomScheduleRegistry, Schedule, Trigger};
use crate::types::{RecoveryReport, SchedulerStatus, TriggerState, MANUAL_TRIGGER_GROUP};

pub struct SchedulerBuilder {
    config: CadenceConfig,
    clock: Arc<dyn Clock>,
    jobs: Arc<JobRegistry>,
    custom: CustomScheduleRegistry,
}

impl SchedulerBuilder {
    pub fn new(config: &CadenceConfig) -> Self {
        Self {
            config: config.clone(),
            clock: Arc::new(SystemClock),
            jobs: Arc::new(JobRegistry::new()),
            custom: CustomScheduleRegistry::new(),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn job_registry(mut self, jobs: Arc<JobRegistry>) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn custom_schedule(mut self, schedule: Arc<dyn CustomSchedule>) -> Self {
        self.custom.register(schedule);
        self
    }

    /// Open the store named by the configuration.
    pub fn build(self) -> Result<Scheduler> {
        self.config.validate()?;
        let instance_id = self.config.scheduler.resolve_instance_id();
        let store = open_store(
            &self.config,
            &instance_id,
            Arc::clone(&self.clock),
            self.custom.clone(),
        )?;
        self.build_with_store(store)
    }

    /// Use an already constructed store. Custom schedules must have been
    /// given to the store itself.
    pub fn build_with_store(self, store: Arc<dyn JobStore>) -> Result<Scheduler> {
        self.config.validate()?;
        let scheduler = &self.config.scheduler;
        let listeners = Arc::new(ListenerRegistry::new());
        let signal = Arc::new(SchedulingSignal::new());
        store.set_signaler(Arc::new(Signaler::new(
            Arc::clone(&listeners),
            Arc::clone(&signal),
        )));
        let (status, _) = watch::channel(SchedulerStatus::Starting);
        let (halt, _) = watch::channel(false);
        let (paused, _) = watch::channel(false);
        info!(
            instance = %store.instance_id(),
            name = %scheduler.instance_name,
            threads = scheduler.thread_count,
            clustered = store.is_clustered(),
            persistent = store.supports_persistence(),
            "scheduler created"
        );
        Ok(Scheduler {
            inner: Arc::new(Inner {
                pool: Arc::new(WorkerPool::new(scheduler.thread_count)),
                config: scheduler.clone(),
                checkin_interval: self.config.store.checkin_interval(),
                store,
                jobs: self.jobs,
                listeners,
                signal,
                clock: self.clock,
                status: Arc::new(status),
                halt: Arc::new(halt),
                paused,
                started: AtomicBool::new(false),
                executed: Arc::new(AtomicU64::new(0)),
                started_at: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

struct Inner {
    config: SchedulerConfig,
    checkin_interval: std::time::Duration,
    store: Arc<dyn JobStore>,
    jobs: Arc<JobRegistry>,
    listeners: Arc<ListenerRegistry>,
    signal: Arc<SchedulingSignal>,
    pool: Arc<WorkerPool>,
    clock: Arc<dyn Clock>,
    status: Arc<watch::Sender<SchedulerStatus>>,
    halt: Arc<watch::Sender<bool>>,
    paused: watch::Sender<bool>,
    started: AtomicBool,
    executed: Arc<AtomicU64>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Snapshot of what a scheduler is and has done.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerMetadata {
    pub instance_name: String,
    pub instance_id: String,
    pub status: SchedulerStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub jobs_executed: u64,
    pub running_jobs: usize,
    pub thread_count: usize,
    pub persistent: bool,
    pub clustered: bool,
}

/// Handle to a scheduler. Cheap to clone; all clones drive the same instance.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn builder(config: &CadenceConfig) -> SchedulerBuilder {
        SchedulerBuilder::new(config)
    }

    pub fn instance_id(&self) -> &str {
        self.inner.store.instance_id()
    }

    pub fn job_registry(&self) -> &Arc<JobRegistry> {
        &self.inner.jobs
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.inner.listeners
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    pub fn status(&self) -> SchedulerStatus {
        *self.inner.status.borrow()
    }

    /// Resolves once the scheduler reaches `target`, or a state it can no
    /// longer leave. Returns the state reached.
    pub async fn wait_for_status(&self, target: SchedulerStatus) -> SchedulerStatus {
        let mut rx = self.inner.status.subscribe();
        let reached = match rx
            .wait_for(|s| {
                *s == target || matches!(s, SchedulerStatus::Stopped | SchedulerStatus::Error)
            })
            .await
        {
            Ok(s) => *s,
            Err(_) => self.status(),
        };
        reached
    }

    pub fn metadata(&self) -> SchedulerMetadata {
        let inner = &self.inner;
        SchedulerMetadata {
            instance_name: inner.config.instance_name.clone(),
            instance_id: inner.store.instance_id().to_string(),
            status: self.status(),
            started_at: *inner.started_at.lock().unwrap_or_else(PoisonError::into_inner),
            jobs_executed: inner.executed.load(Ordering::Relaxed),
            running_jobs: inner.pool.in_flight(),
            thread_count: inner.pool.size(),
            persistent: inner.store.supports_persistence(),
            clustered: inner.store.is_clustered(),
        }
    }

    // ── lifecycle ────────────────────────────────────────────────────────

    /// Recover what a previous run left behind and start firing. Starting a
    /// scheduler in standby resumes it.
    pub async fn start(&self) -> Result<RecoveryReport> {
        let inner = &self.inner;
        match self.status() {
            SchedulerStatus::Stopping | SchedulerStatus::Stopped => {
                return Err(SchedulerError::Shutdown)
            }
            SchedulerStatus::Error => {
                return Err(SchedulerError::Invalid(
                    "scheduler stopped after a store failure".into(),
                ))
            }
            _ => {}
        }
        if inner.started.swap(true, Ordering::SeqCst) {
            self.resume();
            return Ok(RecoveryReport::default());
        }

        let report = match run_blocking(&inner.store, |store| store.scheduler_started()).await {
            Ok(report) => report,
            Err(e) => {
                inner.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let escalation = Escalation {
            status: Arc::clone(&inner.status),
            halt: Arc::clone(&inner.halt),
            listeners: Arc::clone(&inner.listeners),
        };
        let shell = RunShell {
            store: Arc::clone(&inner.store),
            jobs: Arc::clone(&inner.jobs),
            listeners: Arc::clone(&inner.listeners),
            halt: inner.halt.subscribe(),
            retry_interval: inner.config.store_retry_interval(),
            executed: Arc::clone(&inner.executed),
            escalation: escalation.clone(),
        };
        let firing = FiringLoop {
            store: Arc::clone(&inner.store),
            pool: Arc::clone(&inner.pool),
            signal: Arc::clone(&inner.signal),
            listeners: Arc::clone(&inner.listeners),
            clock: Arc::clone(&inner.clock),
            shell,
            settings: LoopSettings::from_config(&inner.config),
            halt: inner.halt.subscribe(),
            paused: inner.paused.subscribe(),
            escalation: escalation.clone(),
        };
        let maintenance = Maintenance {
            store: Arc::clone(&inner.store),
            signal: Arc::clone(&inner.signal),
            listeners: Arc::clone(&inner.listeners),
            halt: inner.halt.subscribe(),
            paused: inner.paused.subscribe(),
            escalation,
            misfire_threshold: inner.config.misfire_threshold(),
            checkin_interval: inner.checkin_interval,
            retry_interval: inner.config.store_retry_interval(),
        };

        *inner.started_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(inner.clock.now());
        inner.paused.send_replace(false);
        inner.status.send_replace(SchedulerStatus::Running);
        {
            let mut tasks = inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.push(tokio::spawn(firing.run()));
            if inner.store.is_clustered() {
                tasks.push(tokio::spawn(maintenance.clone().run_cluster_manager()));
            }
            tasks.push(tokio::spawn(maintenance.run_misfire_handler()));
        }
        info!(
            instance = %inner.store.instance_id(),
            recovered = report.recovered_jobs,
            misfired = report.misfires.processed,
            "scheduler started"
        );
        inner.listeners.scheduler_started();
        Ok(report)
    }

    /// Stop firing without shutting down. Running jobs continue.
    pub fn standby(&self) {
        let inner = &self.inner;
        if !matches!(self.status(), SchedulerStatus::Running | SchedulerStatus::Starting) {
            return;
        }
        inner.paused.send_replace(true);
        inner.store.scheduler_paused();
        if inner.started.load(Ordering::SeqCst) {
            inner.status.send_if_modified(|status| {
                let running = *status == SchedulerStatus::Running;
                if running {
                    *status = SchedulerStatus::Paused;
                }
                running
            });
        }
        info!(instance = %inner.store.instance_id(), "scheduler in standby");
        inner.listeners.scheduler_in_standby();
    }

    pub fn resume(&self) {
        let inner = &self.inner;
        if self.status() != SchedulerStatus::Paused {
            return;
        }
        inner.paused.send_replace(false);
        inner.store.scheduler_resumed();
        // A store failure may have landed meanwhile.
        let resumed = inner.status.send_if_modified(|status| {
            let paused = *status == SchedulerStatus::Paused;
            if paused {
                *status = SchedulerStatus::Running;
            }
            paused
        });
        if !resumed {
            return;
        }
        inner.signal.signal(None);
        info!(instance = %inner.store.instance_id(), "scheduler resumed");
        inner.listeners.scheduler_started();
    }

    /// Stop for good. With `wait_for_jobs`, returns after running jobs end.
    pub async fn shutdown(&self, wait_for_jobs: bool) -> Result<()> {
        let inner = &self.inner;
        if matches!(
            self.status(),
            SchedulerStatus::Stopping | SchedulerStatus::Stopped
        ) {
            return Ok(());
        }
        let failed = self.status() == SchedulerStatus::Error;
        inner.status.send_replace(SchedulerStatus::Stopping);
        info!(instance = %inner.store.instance_id(), wait_for_jobs, "scheduler shutting down");
        inner.halt.send_replace(true);
        inner.signal.signal(None);

        let tasks: Vec<_> =
            std::mem::take(&mut *inner.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "scheduler task ended abnormally");
            }
        }
        inner.pool.shutdown(wait_for_jobs).await;

        let result = run_blocking(&inner.store, |store| store.shutdown()).await;
        inner.status.send_replace(if failed {
            SchedulerStatus::Error
        } else {
            SchedulerStatus::Stopped
        });
        inner.listeners.scheduler_shutdown();
        info!(instance = %inner.store.instance_id(), "scheduler shut down");
        result.map_err(Into::into)
    }

    /// Shut down according to `wait_for_jobs_on_shutdown`.
    pub async fn shutdown_default(&self) -> Result<()> {
        self.shutdown(self.inner.config.wait_for_jobs_on_shutdown).await
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn JobStore) -> StoreResult<T> + Send + 'static,
    {
        if matches!(
            self.status(),
            SchedulerStatus::Stopping | SchedulerStatus::Stopped
        ) {
            return Err(SchedulerError::Shutdown);
        }
        Ok(run_blocking(&self.inner.store, f).await?)
    }

    // ── definitions ──────────────────────────────────────────────────────

    /// Store `job` with its first trigger. Returns the first fire time.
    pub async fn schedule_job(&self, job: JobDetail, trigger: Trigger) -> Result<DateTime<Utc>> {
        if trigger.job_key != job.key {
            return Err(SchedulerError::Invalid(format!(
                "trigger {} references job {}, not {}",
                trigger.key, trigger.job_key, job.key
            )));
        }
        if !self.inner.jobs.contains(&job.job_type) {
            warn!(job = %job.key, job_type = %job.job_type, "no implementation registered for job type yet");
        }
        let (j, key) = (job.clone(), trigger.key.clone());
        let (first, stored) = self
            .call(move |store| {
                let first = store.store_job_and_trigger(&j, &trigger)?;
                Ok((first, store.retrieve_trigger(&key)?))
            })
            .await?;
        debug!(job = %job.key, first_fire = %first, "job scheduled");
        self.inner.listeners.job_added(&job);
        if let Some(trigger) = stored {
            self.inner.listeners.job_scheduled(&trigger);
        }
        Ok(first)
    }

    /// Store `job` with all of `triggers`. With `replace`, existing
    /// definitions under the same keys are overwritten.
    pub async fn schedule_job_with_triggers(
        &self,
        job: JobDetail,
        triggers: Vec<Trigger>,
        replace: bool,
    ) -> Result<Vec<DateTime<Utc>>> {
        if triggers.is_empty() && !job.durable {
            return Err(SchedulerError::Invalid(format!(
                "job {} has no trigger and is not durable",
                job.key
            )));
        }
        if let Some(t) = triggers.iter().find(|t| t.job_key != job.key) {
            return Err(SchedulerError::Invalid(format!(
                "trigger {} references job {}, not {}",
                t.key, t.job_key, job.key
            )));
        }
        let j = job.clone();
        let (firsts, stored) = self
            .call(move |store| {
                store.store_job(&j, replace)?;
                let mut firsts = Vec::with_capacity(triggers.len());
                let mut stored = Vec::with_capacity(triggers.len());
                for trigger in &triggers {
                    firsts.push(store.store_trigger(trigger, replace)?);
                    stored.extend(store.retrieve_trigger(&trigger.key)?);
                }
                Ok((firsts, stored))
            })
            .await?;
        self.inner.listeners.job_added(&job);
        for trigger in &stored {
            self.inner.listeners.job_scheduled(trigger);
        }
        Ok(firsts)
    }

    /// Store a job without triggers. It must be durable.
    pub async fn add_job(&self, job: JobDetail, replace: bool) -> Result<()> {
        if !job.durable {
            return Err(SchedulerError::Invalid(format!(
                "job {} has no trigger and is not durable",
                job.key
            )));
        }
        let j = job.clone();
        self.call(move |store| store.store_job(&j, replace)).await?;
        self.inner.listeners.job_added(&job);
        Ok(())
    }

    /// Add a trigger for an already stored job.
    pub async fn schedule_trigger(&self, trigger: Trigger) -> Result<DateTime<Utc>> {
        let key = trigger.key.clone();
        let (first, stored) = self
            .call(move |store| {
                let first = store.store_trigger(&trigger, false)?;
                Ok((first, store.retrieve_trigger(&key)?))
            })
            .await?;
        if let Some(trigger) = stored {
            self.inner.listeners.job_scheduled(&trigger);
        }
        Ok(first)
    }

    /// Remove a trigger. A non-durable job loses itself with its last trigger.
    pub async fn unschedule_job(&self, key: &TriggerKey) -> Result<bool> {
        let k = key.clone();
        let removed = self.call(move |store| store.remove_trigger(&k)).await?;
        if removed {
            self.inner.listeners.job_unscheduled(key);
        }
        Ok(removed)
    }

    /// Swap the trigger at `key` for `trigger`. `None` when there was no
    /// such trigger.
    pub async fn reschedule_job(
        &self,
        key: &TriggerKey,
        trigger: Trigger,
    ) -> Result<Option<DateTime<Utc>>> {
        let (k, new_key) = (key.clone(), trigger.key.clone());
        let outcome = self
            .call(move |store| match store.replace_trigger(&k, &trigger) {
                Ok(first) => Ok(Some((first, store.retrieve_trigger(&new_key)?))),
                Err(StoreError::TriggerNotFound(_)) => Ok(None),
                Err(e) => Err(e),
            })
            .await?;
        let Some((first, stored)) = outcome else {
            return Ok(None);
        };
        self.inner.listeners.job_unscheduled(key);
        if let Some(trigger) = stored {
            self.inner.listeners.job_scheduled(&trigger);
        }
        Ok(Some(first))
    }

    /// Remove a job and all its triggers.
    pub async fn delete_job(&self, key: &JobKey) -> Result<bool> {
        let k = key.clone();
        let (triggers, removed) = self
            .call(move |store| {
                let triggers = store.triggers_of_job(&k)?;
                Ok((triggers, store.remove_job(&k)?))
            })
            .await?;
        for trigger in &triggers {
            self.inner.listeners.job_unscheduled(&trigger.key);
        }
        Ok(removed)
    }

    /// Fire a stored job now, once, through a trigger in the
    /// `MANUAL_TRIGGER` group.
    pub async fn trigger_job(&self, key: &JobKey, data: Option<JobDataMap>) -> Result<TriggerKey> {
        let now = self.inner.clock.now();
        let trigger_key = TriggerKey::new(
            format!("MT_{}", Uuid::now_v7().simple()),
            MANUAL_TRIGGER_GROUP,
        );
        let mut builder = Trigger::builder(trigger_key.clone(), key.clone(), Schedule::Once)
            .start_at(now)
            .description("manual fire");
        if let Some(data) = data {
            builder = builder.data_map(data);
        }
        self.schedule_trigger(builder.build()).await?;
        info!(job = %key, trigger = %trigger_key, "job triggered manually");
        Ok(trigger_key)
    }

    // ── pause / resume ───────────────────────────────────────────────────

    pub async fn pause_trigger(&self, key: &TriggerKey) -> Result<()> {
        let k = key.clone();
        self.call(move |store| store.pause_trigger(&k)).await
    }

    /// Also pauses triggers added to the group later.
    pub async fn pause_trigger_group(&self, group: &str) -> Result<()> {
        let g = group.to_string();
        self.call(move |store| store.pause_trigger_group(&g)).await
    }

    pub async fn pause_job(&self, key: &JobKey) -> Result<()> {
        let k = key.clone();
        self.call(move |store| store.pause_job(&k)).await
    }

    pub async fn resume_trigger(&self, key: &TriggerKey) -> Result<()> {
        let k = key.clone();
        self.call(move |store| store.resume_trigger(&k)).await
    }

    pub async fn resume_trigger_group(&self, group: &str) -> Result<()> {
        let g = group.to_string();
        self.call(move |store| store.resume_trigger_group(&g)).await
    }

    pub async fn resume_job(&self, key: &JobKey) -> Result<()> {
        let k = key.clone();
        self.call(move |store| store.resume_job(&k)).await
    }

    // ── calendars ────────────────────────────────────────────────────────

    pub async fn add_calendar(
        &self,
        name: &str,
        calendar: Calendar,
        replace: bool,
        update_triggers: bool,
    ) -> Result<()> {
        calendar.validate()?;
        let n = name.to_string();
        self.call(move |store| store.store_calendar(&n, &calendar, replace, update_triggers))
            .await
    }

    pub async fn remove_calendar(&self, name: &str) -> Result<bool> {
        let n = name.to_string();
        self.call(move |store| store.remove_calendar(&n)).await
    }

    pub async fn get_calendar(&self, name: &str) -> Result<Option<Calendar>> {
        let n = name.to_string();
        self.call(move |store| store.retrieve_calendar(&n)).await
    }

    pub async fn calendar_names(&self) -> Result<Vec<String>> {
        self.call(|store| store.calendar_names()).await
    }

    // ── queries ──────────────────────────────────────────────────────────

    pub async fn get_job(&self, key: &JobKey) -> Result<Option<JobDetail>> {
        let k = key.clone();
        self.call(move |store| store.retrieve_job(&k)).await
    }

    pub async fn get_trigger(&self, key: &TriggerKey) -> Result<Option<Trigger>> {
        let k = key.clone();
        self.call(move |store| store.retrieve_trigger(&k)).await
    }

    pub async fn trigger_state(&self, key: &TriggerKey) -> Result<TriggerState> {
        let k = key.clone();
        self.call(move |store| store.trigger_state(&k)).await
    }

    pub async fn triggers_of_job(&self, key: &JobKey) -> Result<Vec<Trigger>> {
        let k = key.clone();
        self.call(move |store| store.triggers_of_job(&k)).await
    }

    pub async fn job_keys(&self, group: Option<&str>) -> Result<Vec<JobKey>> {
        let g = group.map(str::to_string);
        self.call(move |store| store.job_keys(g.as_deref())).await
    }

    pub async fn trigger_keys(&self, group: Option<&str>) -> Result<Vec<TriggerKey>> {
        let g = group.map(str::to_string);
        self.call(move |store| store.trigger_keys(g.as_deref())).await
    }

    pub async fn paused_trigger_groups(&self) -> Result<Vec<String>> {
        self.call(|store| store.paused_trigger_groups()).await
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("instance_id", &self.instance_id())
            .field("status", &self.status())
            .finish()
    }
}
