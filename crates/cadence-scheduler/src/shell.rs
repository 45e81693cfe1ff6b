//! One job run: listeners, execution, refires and the completion report.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::engine::Escalation;
use crate::error::{SchedulerError, StoreError};
use crate::job::{JobDetail, JobExecutionContext, JobExecutionError, JobRegistry};
use crate::listener::ListenerRegistry;
use crate::store::{run_blocking, JobStore};
use crate::trigger::Trigger;
use crate::types::{CompletedExecutionInstruction, TriggerFiredBundle};

/// Everything a job task needs, cloned into each run.
#[derive(Clone)]
pub(crate) struct RunShell {
    pub store: Arc<dyn JobStore>,
    pub jobs: Arc<JobRegistry>,
    pub listeners: Arc<ListenerRegistry>,
    pub halt: watch::Receiver<bool>,
    pub retry_interval: Duration,
    pub executed: Arc<AtomicU64>,
    pub escalation: Escalation,
}

impl RunShell {
    pub(crate) async fn run(self, bundle: TriggerFiredBundle) {
        let trigger = bundle.trigger.clone();
        let mut ctx = JobExecutionContext::new(&bundle);

        let Some(job) = self.jobs.get(&bundle.job.job_type) else {
            let err = SchedulerError::UnknownJobType(bundle.job.job_type.clone());
            self.listeners.scheduler_error(
                &format!("job {} cannot be instantiated", bundle.job.key),
                Some(&err),
            );
            self.complete(
                &trigger,
                &bundle.job,
                CompletedExecutionInstruction::SetAllJobTriggersError,
            )
            .await;
            return;
        };

        if self.listeners.trigger_fired(&trigger, &ctx) {
            self.listeners.job_execution_vetoed(&ctx);
            info!(job = %ctx.job.key, trigger = %trigger.key, "job execution vetoed");
            let instruction = trigger.execution_complete(None);
            self.complete(&trigger, &ctx.job, instruction).await;
            return;
        }

        let instruction = loop {
            self.listeners.job_to_be_executed(&ctx);
            debug!(
                job = %ctx.job.key,
                trigger = %trigger.key,
                refire = ctx.refire_count,
                "job starting"
            );

            let started = Instant::now();
            let outcome = AssertUnwindSafe(job.execute(&mut ctx)).catch_unwind().await;
            ctx.run_time = started.elapsed();
            self.executed.fetch_add(1, Ordering::Relaxed);

            let (failure, instruction) = match outcome {
                Ok(Ok(())) => (None, trigger.execution_complete(None)),
                Ok(Err(e)) => {
                    let instruction = trigger.execution_complete(Some(&e));
                    (Some(e), instruction)
                }
                Err(_) => (
                    Some(JobExecutionError::new("job panicked")),
                    CompletedExecutionInstruction::SetTriggerError,
                ),
            };

            match &failure {
                Some(e) => {
                    warn!(job = %ctx.job.key, trigger = %trigger.key, error = %e, %instruction, "job failed");
                    self.listeners.scheduler_error(
                        &format!("job {} failed", ctx.job.key),
                        Some(&SchedulerError::JobExecution(e.clone())),
                    );
                }
                None => debug!(
                    job = %ctx.job.key,
                    elapsed_ms = ctx.run_time.as_millis() as u64,
                    "job finished"
                ),
            }
            self.listeners.job_was_executed(&ctx, failure.as_ref());
            self.listeners.trigger_complete(&trigger, &ctx, instruction);

            if instruction == CompletedExecutionInstruction::ReExecuteJob && !*self.halt.borrow() {
                ctx.refire_count += 1;
                ctx.result = None;
                continue;
            }
            break instruction;
        };

        self.complete(&trigger, &ctx.job, instruction).await;
    }

    /// Report the run to the store. Transient failures are retried every
    /// `retry_interval` until it succeeds or the scheduler halts; a fatal one
    /// stops the scheduler.
    async fn complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) {
        let mut halt = self.halt.clone();
        loop {
            let (t, j) = (trigger.clone(), job.clone());
            let result = run_blocking(&self.store, move |store| {
                store.triggered_job_complete(&t, &j, instruction)
            })
            .await;
            let err: StoreError = match result {
                Ok(()) => return,
                Err(e) => e,
            };

            if err.is_fatal() {
                self.escalation.store_failed(err);
                return;
            }
            let message = format!("could not record completion of trigger {}", trigger.key);
            if !err.is_transient() {
                error!(trigger = %trigger.key, error = %err, "{message}");
                self.listeners
                    .scheduler_error(&message, Some(&SchedulerError::Store(err)));
                return;
            }
            warn!(trigger = %trigger.key, error = %err, "{message}, retrying");
            self.listeners
                .scheduler_error(&message, Some(&SchedulerError::Store(err)));

            if *halt.borrow() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.retry_interval) => {}
                changed = halt.changed() => {
                    if changed.is_err() || *halt.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
