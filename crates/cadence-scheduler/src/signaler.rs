//! Conduit from the job store back to the firing loop and out to listeners.

use std::sync::{Arc, Mutex, PoisonError};

use cadence_core::JobKey;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Notify;
use tracing::debug;

use crate::error::SchedulerError;
use crate::listener::ListenerRegistry;
use crate::trigger::Trigger;

/// Below this much remaining wait, a new candidate is not worth releasing
/// the batch for, when the store is persistent.
const PERSISTENT_REACQUIRE_COST_MS: i64 = 70;
/// Same, for an in-memory store.
const MEMORY_REACQUIRE_COST_MS: i64 = 7;

/// What the store tells the scheduler.
pub trait SchedulerSignaler: Send + Sync {
    /// Something that changes the next fire time happened. `None` means the
    /// new time is unknown.
    fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>);
    fn notify_trigger_misfired(&self, trigger: &Trigger);
    fn notify_trigger_finalized(&self, trigger: &Trigger);
    fn notify_job_deleted(&self, key: &JobKey);
    fn notify_scheduler_error(&self, message: &str, error: Option<&SchedulerError>);
}

/// A scheduling change not yet seen by the firing loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingChange {
    #[default]
    Nothing,
    /// Earliest candidate among the signals received.
    At(DateTime<Utc>),
    /// At least one signal carried no candidate.
    Unknown,
}

impl PendingChange {
    fn merge(self, candidate: Option<DateTime<Utc>>) -> Self {
        match (self, candidate) {
            (_, None) | (PendingChange::Unknown, _) => PendingChange::Unknown,
            (PendingChange::Nothing, Some(t)) => PendingChange::At(t),
            (PendingChange::At(a), Some(b)) => PendingChange::At(a.min(b)),
        }
    }

    /// Whether this change should interrupt a wait for `current` (the fire
    /// time of the held batch). A candidate only a few milliseconds earlier
    /// is not worth the release and re-acquire round trip.
    pub fn supersedes(self, current: DateTime<Utc>, now: DateTime<Utc>, persistent: bool) -> bool {
        match self {
            PendingChange::Nothing => false,
            PendingChange::Unknown => true,
            PendingChange::At(candidate) => {
                if candidate >= current {
                    return false;
                }
                let remaining = current - now;
                let cost = if persistent {
                    PERSISTENT_REACQUIRE_COST_MS
                } else {
                    MEMORY_REACQUIRE_COST_MS
                };
                remaining >= Duration::milliseconds(cost)
            }
        }
    }
}

/// Coalescing wake-up flag between the signaler and the firing loop.
#[derive(Debug, Default)]
pub struct SchedulingSignal {
    pending: Mutex<PendingChange>,
    notify: Notify,
}

impl SchedulingSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self, candidate: Option<DateTime<Utc>>) {
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            *pending = pending.merge(candidate);
        }
        self.notify.notify_one();
    }

    /// Consume the pending change.
    pub fn take(&self) -> PendingChange {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn peek(&self) -> PendingChange {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget changes an upcoming acquisition will observe anyway.
    pub fn clear(&self) {
        self.take();
    }

    /// Resolves on the next signal, or immediately if one arrived since the
    /// last wake-up.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// The [`SchedulerSignaler`] handed to the store: scheduling changes go to
/// the firing loop, everything else to the listeners.
#[derive(Debug)]
pub struct Signaler {
    listeners: Arc<ListenerRegistry>,
    signal: Arc<SchedulingSignal>,
}

impl Signaler {
    pub fn new(listeners: Arc<ListenerRegistry>, signal: Arc<SchedulingSignal>) -> Self {
        Self { listeners, signal }
    }
}

impl SchedulerSignaler for Signaler {
    fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>) {
        debug!(candidate = ?candidate, "scheduling change signalled");
        self.signal.signal(candidate);
    }

    fn notify_trigger_misfired(&self, trigger: &Trigger) {
        self.listeners.trigger_misfired(trigger);
    }

    fn notify_trigger_finalized(&self, trigger: &Trigger) {
        self.listeners.trigger_finalized(trigger);
    }

    fn notify_job_deleted(&self, key: &JobKey) {
        self.listeners.job_deleted(key);
    }

    fn notify_scheduler_error(&self, message: &str, error: Option<&SchedulerError>) {
        self.listeners.scheduler_error(message, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_900_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn earliest_candidate_wins() {
        let signal = SchedulingSignal::new();
        signal.signal(Some(t(30)));
        signal.signal(Some(t(10)));
        signal.signal(Some(t(20)));
        assert_eq!(signal.take(), PendingChange::At(t(10)));
        assert_eq!(signal.take(), PendingChange::Nothing);
    }

    #[test]
    fn unknown_candidate_dominates() {
        let signal = SchedulingSignal::new();
        signal.signal(Some(t(10)));
        signal.signal(None);
        signal.signal(Some(t(5)));
        assert_eq!(signal.take(), PendingChange::Unknown);
    }

    #[test]
    fn small_improvements_do_not_interrupt() {
        let now = t(0);
        let current = now + Duration::milliseconds(50);
        let earlier = PendingChange::At(now + Duration::milliseconds(10));
        assert!(!earlier.supersedes(current, now, true));
        assert!(earlier.supersedes(current, now, false));
        assert!(!PendingChange::At(t(5)).supersedes(t(1), now, false));
        assert!(PendingChange::Unknown.supersedes(current, now, true));
        assert!(!PendingChange::Nothing.supersedes(current, now, false));
    }

    #[tokio::test]
    async fn signal_before_wait_is_not_lost() {
        let signal = SchedulingSignal::new();
        signal.signal(Some(t(1)));
        tokio::time::timeout(std::time::Duration::from_secs(1), signal.wait())
            .await
            .expect("stored wake-up");
    }
}
