//! Listener fan-out for job, trigger and scheduler events.
//!
//! Delivery is synchronous, in registration order, on a snapshot of the
//! registry. A panicking listener is logged and skipped; it never affects
//! scheduling or the other listeners.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use cadence_core::{JobKey, TriggerKey};
use tracing::{debug, error};

use crate::error::SchedulerError;
use crate::job::{JobDetail, JobExecutionContext, JobExecutionError};
use crate::trigger::Trigger;
use crate::types::CompletedExecutionInstruction;

pub trait JobListener: Send + Sync {
    fn name(&self) -> &str;
    fn job_to_be_executed(&self, ctx: &JobExecutionContext);
    /// A trigger listener vetoed the run.
    fn job_execution_vetoed(&self, ctx: &JobExecutionContext);
    fn job_was_executed(&self, ctx: &JobExecutionContext, error: Option<&JobExecutionError>);
}

pub trait TriggerListener: Send + Sync {
    fn name(&self) -> &str;
    fn trigger_fired(&self, trigger: &Trigger, ctx: &JobExecutionContext);
    /// Returning `true` cancels this run of the job.
    fn veto_job_execution(&self, trigger: &Trigger, ctx: &JobExecutionContext) -> bool;
    fn trigger_misfired(&self, trigger: &Trigger);
    fn trigger_complete(
        &self,
        trigger: &Trigger,
        ctx: &JobExecutionContext,
        instruction: CompletedExecutionInstruction,
    );
}

pub trait SchedulerListener: Send + Sync {
    fn job_scheduled(&self, trigger: &Trigger);
    fn job_unscheduled(&self, key: &TriggerKey);
    /// The trigger will never fire again.
    fn trigger_finalized(&self, trigger: &Trigger);
    fn job_added(&self, job: &JobDetail);
    fn job_deleted(&self, key: &JobKey);
    fn scheduler_error(&self, message: &str, error: Option<&SchedulerError>);
    fn scheduler_started(&self);
    fn scheduler_in_standby(&self);
    fn scheduler_shutdown(&self);
}

/// Which keys a job or trigger listener hears about.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeyMatcher {
    #[default]
    Everything,
    Group(String),
    Exact { group: String, name: String },
}

impl KeyMatcher {
    pub fn job(key: &JobKey) -> Self {
        KeyMatcher::Exact {
            group: key.group.clone(),
            name: key.name.clone(),
        }
    }

    pub fn trigger(key: &TriggerKey) -> Self {
        KeyMatcher::Exact {
            group: key.group.clone(),
            name: key.name.clone(),
        }
    }

    pub fn group(group: impl Into<String>) -> Self {
        KeyMatcher::Group(group.into())
    }

    pub fn matches(&self, group: &str, name: &str) -> bool {
        match self {
            KeyMatcher::Everything => true,
            KeyMatcher::Group(g) => g == group,
            KeyMatcher::Exact { group: g, name: n } => g == group && n == name,
        }
    }
}

type CtxFn = Box<dyn Fn(&JobExecutionContext) + Send + Sync>;
type TriggerCtxFn<R> = Box<dyn Fn(&Trigger, &JobExecutionContext) -> R + Send + Sync>;

/// A [`JobListener`] built from closures; events without one are ignored.
pub struct JobListenerAdapter {
    name: String,
    to_be_executed: Option<CtxFn>,
    vetoed: Option<CtxFn>,
    was_executed:
        Option<Box<dyn Fn(&JobExecutionContext, Option<&JobExecutionError>) + Send + Sync>>,
}

impl JobListenerAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            to_be_executed: None,
            vetoed: None,
            was_executed: None,
        }
    }

    pub fn on_to_be_executed(
        mut self,
        f: impl Fn(&JobExecutionContext) + Send + Sync + 'static,
    ) -> Self {
        self.to_be_executed = Some(Box::new(f));
        self
    }

    pub fn on_vetoed(mut self, f: impl Fn(&JobExecutionContext) + Send + Sync + 'static) -> Self {
        self.vetoed = Some(Box::new(f));
        self
    }

    pub fn on_was_executed(
        mut self,
        f: impl Fn(&JobExecutionContext, Option<&JobExecutionError>) + Send + Sync + 'static,
    ) -> Self {
        self.was_executed = Some(Box::new(f));
        self
    }
}

impl JobListener for JobListenerAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn job_to_be_executed(&self, ctx: &JobExecutionContext) {
        if let Some(f) = &self.to_be_executed {
            f(ctx);
        }
    }

    fn job_execution_vetoed(&self, ctx: &JobExecutionContext) {
        if let Some(f) = &self.vetoed {
            f(ctx);
        }
    }

    fn job_was_executed(&self, ctx: &JobExecutionContext, error: Option<&JobExecutionError>) {
        if let Some(f) = &self.was_executed {
            f(ctx, error);
        }
    }
}

/// A [`TriggerListener`] built from closures. Without a veto closure it
/// never vetoes.
pub struct TriggerListenerAdapter {
    name: String,
    fired: Option<TriggerCtxFn<()>>,
    veto: Option<TriggerCtxFn<bool>>,
    misfired: Option<Box<dyn Fn(&Trigger) + Send + Sync>>,
    complete: Option<
        Box<dyn Fn(&Trigger, &JobExecutionContext, CompletedExecutionInstruction) + Send + Sync>,
    >,
}

impl TriggerListenerAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fired: None,
            veto: None,
            misfired: None,
            complete: None,
        }
    }

    pub fn on_fired(
        mut self,
        f: impl Fn(&Trigger, &JobExecutionContext) + Send + Sync + 'static,
    ) -> Self {
        self.fired = Some(Box::new(f));
        self
    }

    pub fn on_veto(
        mut self,
        f: impl Fn(&Trigger, &JobExecutionContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.veto = Some(Box::new(f));
        self
    }

    pub fn on_misfired(mut self, f: impl Fn(&Trigger) + Send + Sync + 'static) -> Self {
        self.misfired = Some(Box::new(f));
        self
    }

    pub fn on_complete(
        mut self,
        f: impl Fn(&Trigger, &JobExecutionContext, CompletedExecutionInstruction)
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.complete = Some(Box::new(f));
        self
    }
}

impl TriggerListener for TriggerListenerAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn trigger_fired(&self, trigger: &Trigger, ctx: &JobExecutionContext) {
        if let Some(f) = &self.fired {
            f(trigger, ctx);
        }
    }

    fn veto_job_execution(&self, trigger: &Trigger, ctx: &JobExecutionContext) -> bool {
        self.veto.as_ref().is_some_and(|f| f(trigger, ctx))
    }

    fn trigger_misfired(&self, trigger: &Trigger) {
        if let Some(f) = &self.misfired {
            f(trigger);
        }
    }

    fn trigger_complete(
        &self,
        trigger: &Trigger,
        ctx: &JobExecutionContext,
        instruction: CompletedExecutionInstruction,
    ) {
        if let Some(f) = &self.complete {
            f(trigger, ctx, instruction);
        }
    }
}

/// A [`SchedulerListener`] built from closures.
#[derive(Default)]
pub struct SchedulerListenerAdapter {
    job_scheduled: Option<Box<dyn Fn(&Trigger) + Send + Sync>>,
    job_unscheduled: Option<Box<dyn Fn(&TriggerKey) + Send + Sync>>,
    trigger_finalized: Option<Box<dyn Fn(&Trigger) + Send + Sync>>,
    job_added: Option<Box<dyn Fn(&JobDetail) + Send + Sync>>,
    job_deleted: Option<Box<dyn Fn(&JobKey) + Send + Sync>>,
    scheduler_error: Option<Box<dyn Fn(&str, Option<&SchedulerError>) + Send + Sync>>,
    started: Option<Box<dyn Fn() + Send + Sync>>,
    in_standby: Option<Box<dyn Fn() + Send + Sync>>,
    shutdown: Option<Box<dyn Fn() + Send + Sync>>,
}

impl SchedulerListenerAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_job_scheduled(mut self, f: impl Fn(&Trigger) + Send + Sync + 'static) -> Self {
        self.job_scheduled = Some(Box::new(f));
        self
    }

    pub fn on_job_unscheduled(mut self, f: impl Fn(&TriggerKey) + Send + Sync + 'static) -> Self {
        self.job_unscheduled = Some(Box::new(f));
        self
    }

    pub fn on_trigger_finalized(mut self, f: impl Fn(&Trigger) + Send + Sync + 'static) -> Self {
        self.trigger_finalized = Some(Box::new(f));
        self
    }

    pub fn on_job_added(mut self, f: impl Fn(&JobDetail) + Send + Sync + 'static) -> Self {
        self.job_added = Some(Box::new(f));
        self
    }

    pub fn on_job_deleted(mut self, f: impl Fn(&JobKey) + Send + Sync + 'static) -> Self {
        self.job_deleted = Some(Box::new(f));
        self
    }

    pub fn on_scheduler_error(
        mut self,
        f: impl Fn(&str, Option<&SchedulerError>) + Send + Sync + 'static,
    ) -> Self {
        self.scheduler_error = Some(Box::new(f));
        self
    }

    pub fn on_started(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.started = Some(Box::new(f));
        self
    }

    pub fn on_standby(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.in_standby = Some(Box::new(f));
        self
    }

    pub fn on_shutdown(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.shutdown = Some(Box::new(f));
        self
    }
}

impl SchedulerListener for SchedulerListenerAdapter {
    fn job_scheduled(&self, trigger: &Trigger) {
        if let Some(f) = &self.job_scheduled {
            f(trigger);
        }
    }

    fn job_unscheduled(&self, key: &TriggerKey) {
        if let Some(f) = &self.job_unscheduled {
            f(key);
        }
    }

    fn trigger_finalized(&self, trigger: &Trigger) {
        if let Some(f) = &self.trigger_finalized {
            f(trigger);
        }
    }

    fn job_added(&self, job: &JobDetail) {
        if let Some(f) = &self.job_added {
            f(job);
        }
    }

    fn job_deleted(&self, key: &JobKey) {
        if let Some(f) = &self.job_deleted {
            f(key);
        }
    }

    fn scheduler_error(&self, message: &str, error: Option<&SchedulerError>) {
        if let Some(f) = &self.scheduler_error {
            f(message, error);
        }
    }

    fn scheduler_started(&self) {
        if let Some(f) = &self.started {
            f();
        }
    }

    fn scheduler_in_standby(&self) {
        if let Some(f) = &self.in_standby {
            f();
        }
    }

    fn scheduler_shutdown(&self) {
        if let Some(f) = &self.shutdown {
            f();
        }
    }
}

/// Run one listener callback, isolating a panic.
fn guarded<R>(listener: &str, event: &str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => Some(r),
        Err(_) => {
            error!(listener, event, "listener panicked, event skipped for it");
            None
        }
    }
}

/// Registered listeners and the dispatch of every event to them.
#[derive(Default)]
pub struct ListenerRegistry {
    job: RwLock<Vec<(Arc<dyn JobListener>, KeyMatcher)>>,
    trigger: RwLock<Vec<(Arc<dyn TriggerListener>, KeyMatcher)>>,
    scheduler: RwLock<Vec<Arc<dyn SchedulerListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace, by name) a job listener.
    pub fn add_job_listener(&self, listener: Arc<dyn JobListener>, matcher: KeyMatcher) {
        let mut job = self.job.write().unwrap_or_else(PoisonError::into_inner);
        job.retain(|(l, _)| l.name() != listener.name());
        debug!(name = %listener.name(), "job listener registered");
        job.push((listener, matcher));
    }

    pub fn remove_job_listener(&self, name: &str) -> bool {
        let mut job = self.job.write().unwrap_or_else(PoisonError::into_inner);
        let before = job.len();
        job.retain(|(l, _)| l.name() != name);
        job.len() < before
    }

    /// Register (or replace, by name) a trigger listener.
    pub fn add_trigger_listener(&self, listener: Arc<dyn TriggerListener>, matcher: KeyMatcher) {
        let mut trigger = self.trigger.write().unwrap_or_else(PoisonError::into_inner);
        trigger.retain(|(l, _)| l.name() != listener.name());
        debug!(name = %listener.name(), "trigger listener registered");
        trigger.push((listener, matcher));
    }

    pub fn remove_trigger_listener(&self, name: &str) -> bool {
        let mut trigger = self.trigger.write().unwrap_or_else(PoisonError::into_inner);
        let before = trigger.len();
        trigger.retain(|(l, _)| l.name() != name);
        trigger.len() < before
    }

    pub fn add_scheduler_listener(&self, listener: Arc<dyn SchedulerListener>) {
        self.scheduler
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn remove_scheduler_listener(&self, listener: &Arc<dyn SchedulerListener>) -> bool {
        let mut scheduler = self.scheduler.write().unwrap_or_else(PoisonError::into_inner);
        let before = scheduler.len();
        scheduler.retain(|l| !Arc::ptr_eq(l, listener));
        scheduler.len() < before
    }

    fn job_listeners(&self, key: &JobKey) -> Vec<Arc<dyn JobListener>> {
        self.job
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, m)| m.matches(&key.group, &key.name))
            .map(|(l, _)| Arc::clone(l))
            .collect()
    }

    fn trigger_listeners(&self, key: &TriggerKey) -> Vec<Arc<dyn TriggerListener>> {
        self.trigger
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, m)| m.matches(&key.group, &key.name))
            .map(|(l, _)| Arc::clone(l))
            .collect()
    }

    fn each_scheduler(&self, event: &str, f: impl Fn(&dyn SchedulerListener)) {
        let listeners: Vec<_> = self
            .scheduler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            guarded("scheduler listener", event, || f(listener.as_ref()));
        }
    }

    // ── job events ───────────────────────────────────────────────────────

    pub fn job_to_be_executed(&self, ctx: &JobExecutionContext) {
        for l in self.job_listeners(ctx.job_key()) {
            guarded(l.name(), "job_to_be_executed", || l.job_to_be_executed(ctx));
        }
    }

    pub fn job_execution_vetoed(&self, ctx: &JobExecutionContext) {
        for l in self.job_listeners(ctx.job_key()) {
            guarded(l.name(), "job_execution_vetoed", || l.job_execution_vetoed(ctx));
        }
    }

    pub fn job_was_executed(&self, ctx: &JobExecutionContext, error: Option<&JobExecutionError>) {
        for l in self.job_listeners(ctx.job_key()) {
            guarded(l.name(), "job_was_executed", || l.job_was_executed(ctx, error));
        }
    }

    // ── trigger events ───────────────────────────────────────────────────

    /// `trigger_fired` then `veto_job_execution` on every matching
    /// listener; `true` when any of them vetoed.
    pub fn trigger_fired(&self, trigger: &Trigger, ctx: &JobExecutionContext) -> bool {
        let mut vetoed = false;
        for l in self.trigger_listeners(&trigger.key) {
            guarded(l.name(), "trigger_fired", || l.trigger_fired(trigger, ctx));
            if guarded(l.name(), "veto_job_execution", || {
                l.veto_job_execution(trigger, ctx)
            })
            .unwrap_or(false)
            {
                debug!(listener = %l.name(), trigger = %trigger.key, "job execution vetoed");
                vetoed = true;
            }
        }
        vetoed
    }

    pub fn trigger_misfired(&self, trigger: &Trigger) {
        for l in self.trigger_listeners(&trigger.key) {
            guarded(l.name(), "trigger_misfired", || l.trigger_misfired(trigger));
        }
    }

    pub fn trigger_complete(
        &self,
        trigger: &Trigger,
        ctx: &JobExecutionContext,
        instruction: CompletedExecutionInstruction,
    ) {
        for l in self.trigger_listeners(&trigger.key) {
            guarded(l.name(), "trigger_complete", || {
                l.trigger_complete(trigger, ctx, instruction)
            });
        }
    }

    // ── scheduler events ─────────────────────────────────────────────────

    pub fn job_scheduled(&self, trigger: &Trigger) {
        self.each_scheduler("job_scheduled", |l| l.job_scheduled(trigger));
    }

    pub fn job_unscheduled(&self, key: &TriggerKey) {
        self.each_scheduler("job_unscheduled", |l| l.job_unscheduled(key));
    }

    pub fn trigger_finalized(&self, trigger: &Trigger) {
        self.each_scheduler("trigger_finalized", |l| l.trigger_finalized(trigger));
    }

    pub fn job_added(&self, job: &JobDetail) {
        self.each_scheduler("job_added", |l| l.job_added(job));
    }

    pub fn job_deleted(&self, key: &JobKey) {
        self.each_scheduler("job_deleted", |l| l.job_deleted(key));
    }

    pub fn scheduler_error(&self, message: &str, error: Option<&SchedulerError>) {
        match error {
            Some(e) => error!(code = e.code(), error = %e, "{message}"),
            None => error!("{message}"),
        }
        self.each_scheduler("scheduler_error", |l| l.scheduler_error(message, error));
    }

    pub fn scheduler_started(&self) {
        self.each_scheduler("scheduler_started", |l| l.scheduler_started());
    }

    pub fn scheduler_in_standby(&self) {
        self.each_scheduler("scheduler_in_standby", |l| l.scheduler_in_standby());
    }

    pub fn scheduler_shutdown(&self) {
        self.each_scheduler("scheduler_shutdown", |l| l.scheduler_shutdown());
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let job = self.job.read().unwrap_or_else(PoisonError::into_inner).len();
        let trigger = self.trigger.read().unwrap_or_else(PoisonError::into_inner).len();
        let scheduler = self.scheduler.read().unwrap_or_else(PoisonError::into_inner).len();
        f.debug_struct("ListenerRegistry")
            .field("job", &job)
            .field("trigger", &trigger)
            .field("scheduler", &scheduler)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::Schedule;
    use crate::types::TriggerFiredBundle;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx(group: &str) -> JobExecutionContext {
        let job = JobDetail::new(JobKey::new("j", group), "noop");
        let trigger = Trigger::builder(TriggerKey::new("t", group), job.key.clone(), Schedule::Once)
            .build();
        let now = Utc::now();
        JobExecutionContext::new(&TriggerFiredBundle {
            job,
            trigger,
            fire_instance_id: "f".into(),
            fire_time: now,
            scheduled_fire_time: now,
            previous_fire_time: None,
            next_fire_time: None,
            recovering: false,
        })
    }

    #[test]
    fn matcher_filters_by_group() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        registry.add_job_listener(
            Arc::new(JobListenerAdapter::new("reports-only").on_to_be_executed(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            KeyMatcher::group("reports"),
        );
        registry.job_to_be_executed(&ctx("reports"));
        registry.job_to_be_executed(&ctx("billing"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_listener_does_not_stop_the_others() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        registry.add_trigger_listener(
            Arc::new(TriggerListenerAdapter::new("bad").on_fired(|_, _| panic!("listener bug"))),
            KeyMatcher::Everything,
        );
        registry.add_trigger_listener(
            Arc::new(TriggerListenerAdapter::new("good").on_fired(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            KeyMatcher::Everything,
        );
        let ctx = ctx("DEFAULT");
        assert!(!registry.trigger_fired(&ctx.trigger, &ctx));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn any_veto_wins() {
        let registry = ListenerRegistry::new();
        registry.add_trigger_listener(
            Arc::new(TriggerListenerAdapter::new("allow")),
            KeyMatcher::Everything,
        );
        registry.add_trigger_listener(
            Arc::new(TriggerListenerAdapter::new("deny").on_veto(|_, _| true)),
            KeyMatcher::Everything,
        );
        let ctx = ctx("DEFAULT");
        assert!(registry.trigger_fired(&ctx.trigger, &ctx));
        assert!(registry.remove_trigger_listener("deny"));
        assert!(!registry.trigger_fired(&ctx.trigger, &ctx));
    }

    #[test]
    fn same_name_replaces_listener() {
        let registry = ListenerRegistry::new();
        registry.add_job_listener(Arc::new(JobListenerAdapter::new("a")), KeyMatcher::Everything);
        registry.add_job_listener(Arc::new(JobListenerAdapter::new("a")), KeyMatcher::Everything);
        assert!(registry.remove_job_listener("a"));
        assert!(!registry.remove_job_listener("a"));
    }
}
