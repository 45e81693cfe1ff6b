use std::sync::Arc;
use std::time::Duration;

use cadence_core::{Clock, SchedulerConfig};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, StoreError};
use crate::listener::ListenerRegistry;
use crate::pool::WorkerPool;
use crate::shell::RunShell;
use crate::signaler::SchedulingSignal;
use crate::store::{run_blocking, JobStore};
use crate::trigger::Trigger;
use crate::types::{SchedulerStatus, TriggerFiredResult};

/// Firing loop tuning, resolved from [`SchedulerConfig`].
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub idle_wait: Duration,
    pub max_batch_size: usize,
    pub batch_time_window: chrono::Duration,
    pub store_retry_interval: Duration,
}

impl LoopSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            idle_wait: config.idle_wait(),
            max_batch_size: config.max_batch_size.max(1),
            batch_time_window: chrono::Duration::from_std(config.batch_time_window())
                .unwrap_or_else(|_| chrono::Duration::zero()),
            store_retry_interval: config.store_retry_interval(),
        }
    }

    /// Idle wait minus up to a fifth, so cluster nodes do not poll in step.
    fn randomized_idle_wait(&self) -> Duration {
        let ms = self.idle_wait.as_millis() as u64;
        let jitter = fastrand::u64(0..=ms / 5);
        Duration::from_millis(ms - jitter)
    }
}

/// Puts the scheduler into [`SchedulerStatus::Error`] and halts every
/// background task. Shared by the firing loop, job runs and maintenance.
#[derive(Clone)]
pub(crate) struct Escalation {
    pub status: Arc<watch::Sender<SchedulerStatus>>,
    pub halt: Arc<watch::Sender<bool>>,
    pub listeners: Arc<ListenerRegistry>,
}

impl Escalation {
    pub(crate) fn store_failed(&self, e: StoreError) {
        let first = self.status.send_if_modified(|status| match status {
            SchedulerStatus::Error | SchedulerStatus::Stopping | SchedulerStatus::Stopped => false,
            _ => {
                *status = SchedulerStatus::Error;
                true
            }
        });
        self.halt.send_replace(true);
        if !first {
            warn!(error = %e, "job store failed after the scheduler stopped");
            return;
        }
        error!(error = %e, "job store failed unrecoverably, scheduler stopped");
        self.listeners.scheduler_error(
            "job store failed unrecoverably",
            Some(&SchedulerError::Store(e)),
        );
    }
}

/// How a wait ended.
enum Wake {
    Fire,
    Release,
}

/// The control task: acquire due triggers, wait for their fire time, hand
/// them to the pool.
pub(crate) struct FiringLoop {
    pub store: Arc<dyn JobStore>,
    pub pool: Arc<WorkerPool>,
    pub signal: Arc<SchedulingSignal>,
    pub listeners: Arc<ListenerRegistry>,
    pub clock: Arc<dyn Clock>,
    pub shell: RunShell,
    pub settings: LoopSettings,
    pub halt: watch::Receiver<bool>,
    pub paused: watch::Receiver<bool>,
    pub escalation: Escalation,
}

impl FiringLoop {
    pub(crate) async fn run(mut self) {
        info!(instance = %self.store.instance_id(), "firing loop started");
        let mut acquire_failures = 0u32;

        loop {
            if self.halt.has_changed().is_err() || *self.halt.borrow_and_update() {
                break;
            }
            if *self.paused.borrow_and_update() {
                tokio::select! {
                    r = self.paused.changed() => if r.is_err() { break },
                    r = self.halt.changed() => if r.is_err() { break },
                }
                continue;
            }

            let available = self.pool.available();
            if available == 0 {
                tokio::select! {
                    _ = self.pool.wait_for_capacity() => {}
                    _ = tokio::time::sleep(self.settings.idle_wait) => {}
                    r = self.halt.changed() => if r.is_err() { break },
                    r = self.paused.changed() => if r.is_err() { break },
                }
                continue;
            }

            let now = self.clock.now();
            let no_later_than = now
                + chrono::Duration::from_std(self.settings.idle_wait)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
            let max_count = available.min(self.settings.max_batch_size);
            let window = self.settings.batch_time_window;
            self.signal.clear();

            let acquired = run_blocking(&self.store, move |store| {
                store.acquire_next_triggers(no_later_than, max_count, window)
            })
            .await;

            match acquired {
                Ok(triggers) => {
                    acquire_failures = 0;
                    if triggers.is_empty() {
                        self.idle().await;
                        continue;
                    }
                    if let Err(e) = self.fire_batch(triggers).await {
                        self.escalation.store_failed(e);
                        break;
                    }
                }
                Err(e) if e.is_fatal() => {
                    self.escalation.store_failed(e);
                    break;
                }
                Err(e) => {
                    warn!(error = %e, failures = acquire_failures + 1, "trigger acquisition failed");
                    if acquire_failures == 0 {
                        self.listeners.scheduler_error(
                            "could not acquire next triggers",
                            Some(&SchedulerError::Store(e)),
                        );
                    }
                    acquire_failures = acquire_failures.saturating_add(1);
                    self.back_off().await;
                }
            }
        }
        info!(instance = %self.store.instance_id(), "firing loop stopped");
    }

    /// Nothing due: sleep until the idle wait ends or something changes.
    async fn idle(&mut self) {
        let wait = self.settings.randomized_idle_wait();
        debug!(wait_ms = wait.as_millis() as u64, "no triggers due");
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = self.signal.wait() => {}
            _ = self.halt.changed() => {}
            _ = self.paused.changed() => {}
        }
    }

    async fn back_off(&mut self) {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.store_retry_interval) => {}
            _ = self.halt.changed() => {}
        }
    }

    /// Wait for the batch, then fire it. `Err` only for a fatal store error.
    async fn fire_batch(&mut self, triggers: Vec<Trigger>) -> Result<(), StoreError> {
        let first = triggers
            .first()
            .and_then(|t| t.next_fire_time)
            .unwrap_or_else(|| self.clock.now());
        if let Wake::Release = self.wait_to_fire(first).await {
            debug!(count = triggers.len(), "releasing acquired batch");
            return self.release(triggers).await;
        }

        let mut permits = Vec::with_capacity(triggers.len());
        let mut to_fire = Vec::with_capacity(triggers.len());
        let mut overflow = Vec::new();
        for trigger in triggers {
            match self.pool.try_reserve() {
                Some(permit) => {
                    permits.push(permit);
                    to_fire.push(trigger);
                }
                None => overflow.push(trigger),
            }
        }
        if !overflow.is_empty() {
            debug!(count = overflow.len(), "no worker free, releasing triggers");
            self.release(overflow).await?;
        }
        if to_fire.is_empty() {
            return Ok(());
        }

        let batch = to_fire.clone();
        let results = match run_blocking(&self.store, move |store| store.triggers_fired(&batch))
            .await
        {
            Ok(results) => results,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, "marking triggers fired failed, releasing them");
                self.listeners.scheduler_error(
                    "could not mark triggers fired",
                    Some(&SchedulerError::Store(e)),
                );
                return self.release(to_fire).await;
            }
        };

        for (result, permit) in results.into_iter().zip(permits) {
            match result {
                TriggerFiredResult::Fired(bundle) => {
                    debug!(trigger = %bundle.trigger.key, job = %bundle.job.key, "trigger fired");
                    self.pool.spawn(permit, self.shell.clone().run(*bundle));
                }
                TriggerFiredResult::Rejected { key, reason } => {
                    debug!(trigger = %key, %reason, "trigger not fired");
                }
            }
        }
        Ok(())
    }

    /// Sleep until `fire_at`, unless a significantly earlier trigger shows
    /// up or the scheduler pauses or halts.
    async fn wait_to_fire(&mut self, fire_at: DateTime<Utc>) -> Wake {
        let persistent = self.store.supports_persistence();
        loop {
            let now = self.clock.now();
            if fire_at <= now {
                return Wake::Fire;
            }
            if self.signal.peek().supersedes(fire_at, now, persistent) {
                return Wake::Release;
            }
            let remaining = (fire_at - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = self.signal.wait() => {}
                _ = self.halt.changed() => return Wake::Release,
                _ = self.paused.changed() => return Wake::Release,
            }
        }
    }

    /// Hand acquired triggers back to the store. `Err` only when fatal.
    async fn release(&self, triggers: Vec<Trigger>) -> Result<(), StoreError> {
        let result = run_blocking(&self.store, move |store| {
            for trigger in &triggers {
                store.release_acquired_trigger(trigger)?;
            }
            Ok(())
        })
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(error = %e, "releasing acquired triggers failed");
                self.listeners.scheduler_error(
                    "could not release acquired triggers",
                    Some(&SchedulerError::Store(e)),
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_wait_jitter_stays_within_a_fifth() {
        let settings = LoopSettings {
            idle_wait: Duration::from_millis(10_000),
            max_batch_size: 1,
            batch_time_window: chrono::Duration::zero(),
            store_retry_interval: Duration::from_millis(100),
        };
        for _ in 0..100 {
            let wait = settings.randomized_idle_wait();
            assert!(wait >= Duration::from_millis(8_000));
            assert!(wait <= Duration::from_millis(10_000));
        }
    }

    fn escalation() -> (Escalation, Arc<std::sync::atomic::AtomicUsize>) {
        use crate::listener::SchedulerListenerAdapter;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let errors = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&errors);
        let listeners = Arc::new(ListenerRegistry::new());
        listeners.add_scheduler_listener(Arc::new(SchedulerListenerAdapter::new().on_scheduler_error(
            move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        )));
        let (status, _) = watch::channel(SchedulerStatus::Running);
        let (halt, _) = watch::channel(false);
        let escalation = Escalation {
            status: Arc::new(status),
            halt: Arc::new(halt),
            listeners,
        };
        (escalation, errors)
    }

    #[test]
    fn store_failure_halts_and_reports_once() {
        let (escalation, errors) = escalation();
        let mut halted = escalation.halt.subscribe();
        escalation.store_failed(StoreError::Unavailable("disk gone".into()));
        escalation.store_failed(StoreError::Poisoned);
        assert_eq!(*escalation.status.borrow(), SchedulerStatus::Error);
        assert!(*halted.borrow_and_update());
        assert_eq!(errors.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn store_failure_during_shutdown_keeps_stopping() {
        let (escalation, errors) = escalation();
        escalation.status.send_replace(SchedulerStatus::Stopping);
        escalation.store_failed(StoreError::Poisoned);
        assert_eq!(*escalation.status.borrow(), SchedulerStatus::Stopping);
        assert_eq!(errors.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn zero_batch_size_is_raised_to_one() {
        let config = SchedulerConfig {
            max_batch_size: 0,
            ..SchedulerConfig::default()
        };
        assert_eq!(LoopSettings::from_config(&config).max_batch_size, 1);
    }
}
