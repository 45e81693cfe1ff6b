//! Background passes beside the firing loop: misfire scans and cluster
//! check-ins.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::engine::Escalation;
use crate::error::SchedulerError;
use crate::listener::ListenerRegistry;
use crate::signaler::SchedulingSignal;
use crate::store::{run_blocking, JobStore};

/// Pause between passes while a backlog of misfires remains.
const BACKLOG_PASS_DELAY: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub(crate) struct Maintenance {
    pub store: Arc<dyn JobStore>,
    pub signal: Arc<SchedulingSignal>,
    pub listeners: Arc<ListenerRegistry>,
    pub halt: watch::Receiver<bool>,
    pub paused: watch::Receiver<bool>,
    pub escalation: Escalation,
    pub misfire_threshold: Duration,
    pub checkin_interval: Duration,
    pub retry_interval: Duration,
}

impl Maintenance {
    /// Sleep `d`; `false` once the scheduler halts.
    async fn pause(halt: &mut watch::Receiver<bool>, d: Duration) -> bool {
        if *halt.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(d) => !*halt.borrow(),
            r = halt.changed() => r.is_ok() && !*halt.borrow(),
        }
    }

    /// Block while in standby; `false` once the scheduler halts.
    async fn wait_while_paused(
        halt: &mut watch::Receiver<bool>,
        paused: &mut watch::Receiver<bool>,
    ) -> bool {
        while *paused.borrow_and_update() {
            if *halt.borrow() {
                return false;
            }
            tokio::select! {
                r = paused.changed() => if r.is_err() { return false },
                r = halt.changed() => if r.is_err() { return false },
            }
        }
        !*halt.borrow()
    }

    /// Resolve misfired triggers that no acquisition pass has touched.
    /// Scans are suspended during standby.
    pub(crate) async fn run_misfire_handler(self) {
        let mut halt = self.halt.clone();
        let mut paused = self.paused.clone();
        let mut failures = 0u32;
        debug!("misfire handler started");
        loop {
            if !Self::wait_while_paused(&mut halt, &mut paused).await {
                break;
            }
            let started = Instant::now();
            let scan = run_blocking(&self.store, |store| store.recover_misfired_triggers(false)).await;
            let delay = match scan {
                Ok(scan) => {
                    failures = 0;
                    if scan.processed > 0 {
                        self.signal.signal(scan.earliest_new_time);
                    }
                    if scan.has_more {
                        BACKLOG_PASS_DELAY
                    } else {
                        self.misfire_threshold
                            .checked_sub(started.elapsed())
                            .filter(|d| !d.is_zero())
                            .unwrap_or(BACKLOG_PASS_DELAY)
                    }
                }
                Err(e) if e.is_fatal() => {
                    self.escalation.store_failed(e);
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "misfire scan failed");
                    if failures == 0 {
                        self.listeners.scheduler_error(
                            "misfire scan failed",
                            Some(&SchedulerError::Store(e)),
                        );
                    }
                    failures = failures.saturating_add(1);
                    self.retry_interval.max(self.misfire_threshold)
                }
            };
            if !Self::pause(&mut halt, delay).await {
                break;
            }
        }
        debug!("misfire handler stopped");
    }

    /// Periodic heartbeat; takes over the work of nodes that stopped
    /// checking in.
    pub(crate) async fn run_cluster_manager(self) {
        let mut halt = self.halt.clone();
        let mut failures = 0u32;
        debug!(interval_ms = self.checkin_interval.as_millis() as u64, "cluster manager started");
        loop {
            let started = Instant::now();
            let delay = match run_blocking(&self.store, |store| store.check_in()).await {
                Ok(failed) => {
                    failures = 0;
                    if !failed.is_empty() {
                        info!(instances = ?failed, "took over work of failed instances");
                        self.signal.signal(None);
                    }
                    self.checkin_interval.saturating_sub(started.elapsed())
                }
                Err(e) if e.is_fatal() => {
                    self.escalation.store_failed(e);
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "cluster check-in failed");
                    if failures == 0 {
                        self.listeners.scheduler_error(
                            "cluster check-in failed",
                            Some(&SchedulerError::Store(e)),
                        );
                    }
                    failures = failures.saturating_add(1);
                    self.retry_interval.min(self.checkin_interval)
                }
            };
            if !Self::pause(&mut halt, delay).await {
                break;
            }
        }
        debug!("cluster manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn standby_blocks_until_resume() {
        let (halt_tx, mut halt) = watch::channel(false);
        let (paused_tx, mut paused) = watch::channel(true);
        let resume = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            paused_tx.send_replace(false);
            paused_tx
        });
        let started = Instant::now();
        assert!(Maintenance::wait_while_paused(&mut halt, &mut paused).await);
        assert!(started.elapsed() >= Duration::from_millis(40));
        drop(resume.await.unwrap());
        drop(halt_tx);
    }

    #[tokio::test]
    async fn halt_ends_standby() {
        let (halt_tx, mut halt) = watch::channel(false);
        let (_paused_tx, mut paused) = watch::channel(true);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            halt_tx.send_replace(true);
        });
        assert!(!Maintenance::wait_while_paused(&mut halt, &mut paused).await);
    }
}
