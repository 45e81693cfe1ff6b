//! Job store behaviour over the in-memory backend, driven by a manual clock.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use cadence_core::{Clock, JobKey, ManualClock, TriggerKey};
use cadence_scheduler::calendar::{Calendar, Exclusion};
use cadence_scheduler::error::SchedulerError;
use cadence_scheduler::job::JobDetail;
use cadence_scheduler::lock::LocalLock;
use cadence_scheduler::signaler::SchedulerSignaler;
use cadence_scheduler::store::{ClusteredStore, JobStore, RamBackend, StoreOptions};
use cadence_scheduler::trigger::{
    CustomScheduleRegistry, MisfireInstruction, Schedule, ScheduleContext, Trigger,
};
use cadence_scheduler::types::{
    CompletedExecutionInstruction, RejectReason, TriggerFiredBundle, TriggerFiredResult,
    TriggerState, RECOVERING_JOBS_GROUP, RECOVERY_TRIGGER_NAME_KEY,
};
use chrono::{DateTime, Duration, TimeZone, Utc};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
}

fn secs(n: i64) -> Duration {
    Duration::seconds(n)
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl SchedulerSignaler for Recorder {
    fn signal_scheduling_change(&self, _candidate: Option<DateTime<Utc>>) {
        self.push("change".into());
    }

    fn notify_trigger_misfired(&self, trigger: &Trigger) {
        self.push(format!("misfired:{}", trigger.key));
    }

    fn notify_trigger_finalized(&self, trigger: &Trigger) {
        self.push(format!("finalized:{}", trigger.key));
    }

    fn notify_job_deleted(&self, key: &JobKey) {
        self.push(format!("deleted:{key}"));
    }

    fn notify_scheduler_error(&self, message: &str, _error: Option<&SchedulerError>) {
        self.push(format!("error:{message}"));
    }
}

fn options(instance: &str, clustered: bool) -> StoreOptions {
    StoreOptions {
        instance_id: instance.to_string(),
        clustered,
        misfire_threshold: secs(5),
        max_misfires_per_pass: 20,
        checkin_interval: StdDuration::from_millis(7_500),
        lock_lease: StdDuration::from_secs(30),
        lock_timeout: StdDuration::from_secs(1),
        lock_retry_base: StdDuration::from_millis(1),
        transient_retries: 3,
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    backend: Arc<RamBackend>,
    store: ClusteredStore<Arc<RamBackend>>,
    events: Arc<Recorder>,
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let backend = Arc::new(RamBackend::new());
        let store = node(&clock, &backend, None, options("node-a", false));
        let events = Arc::new(Recorder::default());
        store.set_signaler(events.clone());
        Self {
            clock,
            backend,
            store,
            events,
        }
    }

    fn acquire(&self, max: usize) -> Vec<Trigger> {
        self.store
            .acquire_next_triggers(self.clock.now() + secs(30), max, Duration::zero())
            .unwrap()
    }

    fn fire(&self, triggers: &[Trigger]) -> Vec<TriggerFiredBundle> {
        self.store
            .triggers_fired(triggers)
            .unwrap()
            .into_iter()
            .map(|r| match r {
                TriggerFiredResult::Fired(bundle) => *bundle,
                TriggerFiredResult::Rejected { key, reason } => {
                    panic!("{key} rejected: {reason}")
                }
            })
            .collect()
    }

    fn complete(&self, bundle: &TriggerFiredBundle) {
        let instruction = bundle.trigger.execution_complete(None);
        self.store
            .triggered_job_complete(&bundle.trigger, &bundle.job, instruction)
            .unwrap();
    }

    fn state(&self, key: &TriggerKey) -> TriggerState {
        self.store.trigger_state(key).unwrap()
    }
}

fn node(
    clock: &Arc<ManualClock>,
    backend: &Arc<RamBackend>,
    lock: Option<Arc<LocalLock>>,
    options: StoreOptions,
) -> ClusteredStore<Arc<RamBackend>> {
    let clock: Arc<dyn Clock> = clock.clone();
    let lock = lock.unwrap_or_else(|| Arc::new(LocalLock::new(Arc::clone(&clock))));
    ClusteredStore::new(
        Arc::clone(backend),
        lock,
        options,
        clock,
        CustomScheduleRegistry::new(),
    )
}

fn job(name: &str) -> JobDetail {
    JobDetail::new(JobKey::named(name), "noop")
}

fn once(name: &str, job: &JobDetail, at: DateTime<Utc>) -> Trigger {
    Trigger::builder(TriggerKey::named(name), job.key.clone(), Schedule::Once)
        .start_at(at)
        .build()
}

fn every(name: &str, job: &JobDetail, secs_: i64) -> Trigger {
    Trigger::builder(
        TriggerKey::named(name),
        job.key.clone(),
        Schedule::interval(secs(secs_)),
    )
    .start_at(t0())
    .build()
}

#[test]
fn restricted_job_never_has_two_triggers_in_flight() {
    let h = Harness::new();
    let j = job("report").disallow_concurrent_execution(true).durable(true);
    h.store.store_job(&j, false).unwrap();
    h.store.store_trigger(&once("a", &j, t0()), false).unwrap();
    h.store.store_trigger(&once("b", &j, t0()), false).unwrap();

    let batch = h.acquire(10);
    assert_eq!(batch.len(), 1);
    let fired = h.fire(&batch);
    let other = if batch[0].key.name == "a" { "b" } else { "a" };
    assert_eq!(h.state(&TriggerKey::named(other)), TriggerState::Blocked);
    assert!(h.acquire(10).is_empty());

    h.complete(&fired[0]);
    assert_eq!(h.state(&TriggerKey::named(other)), TriggerState::Waiting);
    let next = h.acquire(10);
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].key.name, other);
}

#[test]
fn do_nothing_misfire_skips_to_strictly_after_now() {
    let h = Harness::new();
    let j = job("poll");
    let trigger = Trigger::builder(
        TriggerKey::named("t"),
        j.key.clone(),
        Schedule::interval(secs(10)),
    )
    .start_at(t0())
    .misfire(MisfireInstruction::DoNothing)
    .build();
    h.store.store_job_and_trigger(&j, &trigger).unwrap();

    h.clock.set(t0() + secs(60));
    let batch = h.acquire(1);
    assert_eq!(h.events.count("misfired:"), 1);
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].next_fire_time, Some(t0() + secs(70)));
    assert!(batch[0].next_fire_time.unwrap() > h.clock.now());
}

#[test]
fn fire_now_misfire_reports_the_stale_scheduled_time() {
    let h = Harness::new();
    let j = job("once");
    let trigger = Trigger::builder(TriggerKey::named("t"), j.key.clone(), Schedule::Once)
        .start_at(t0())
        .misfire(MisfireInstruction::FireNow)
        .build();
    h.store.store_job_and_trigger(&j, &trigger).unwrap();

    h.clock.set(t0() + secs(65));
    let batch = h.acquire(1);
    assert_eq!(batch[0].next_fire_time, Some(t0() + secs(65)));
    let fired = h.fire(&batch);
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].scheduled_fire_time, t0());
    assert_eq!(fired[0].fire_time, t0() + secs(65));
    assert_eq!(fired[0].next_fire_time, None);
    assert_eq!(h.events.count("misfired:"), 1);
}

#[test]
fn completing_the_same_fire_twice_is_a_noop() {
    let h = Harness::new();
    let j = job("tick");
    h.store.store_job_and_trigger(&j, &every("t", &j, 10)).unwrap();

    let fired = h.fire(&h.acquire(1));
    h.complete(&fired[0]);
    let after_first = h.store.retrieve_trigger(&TriggerKey::named("t")).unwrap().unwrap();
    assert_eq!(h.state(&TriggerKey::named("t")), TriggerState::Waiting);
    assert_eq!(after_first.next_fire_time, Some(t0() + secs(10)));

    h.complete(&fired[0]);
    let after_second = h.store.retrieve_trigger(&TriggerKey::named("t")).unwrap().unwrap();
    assert_eq!(after_first, after_second);
    assert_eq!(h.state(&TriggerKey::named("t")), TriggerState::Waiting);
}

#[test]
fn misfire_update_with_empty_calendar_matches_plain_recomputation() {
    let empty = Calendar::empty();
    for instruction in [
        MisfireInstruction::DoNothing,
        MisfireInstruction::RescheduleNextValid,
        MisfireInstruction::RescheduleNextWithRemainingCount,
        MisfireInstruction::FireNow,
    ] {
        let j = job("j");
        let mut plain = Trigger::builder(
            TriggerKey::named("t"),
            j.key.clone(),
            Schedule::interval(secs(7)),
        )
        .start_at(t0())
        .misfire(instruction)
        .build();
        plain.compute_first_fire_time(&ScheduleContext::plain());
        let mut with_calendar = plain.clone();

        let now = t0() + secs(123);
        plain.update_after_misfire(&ScheduleContext::plain(), now);
        with_calendar.update_after_misfire(&ScheduleContext::with_calendar(&empty), now);
        assert_eq!(plain, with_calendar, "{instruction}");
    }
}

#[test]
fn paused_interval_misfires_once_and_resumes_on_the_grid() {
    let h = Harness::new();
    let j = job("tick");
    h.store.store_job_and_trigger(&j, &every("t", &j, 10)).unwrap();
    let key = TriggerKey::named("t");

    let fired = h.fire(&h.acquire(1));
    h.complete(&fired[0]);

    h.clock.set(t0() + secs(5));
    h.store.pause_trigger(&key).unwrap();
    assert_eq!(h.state(&key), TriggerState::Paused);

    h.clock.set(t0() + secs(35));
    h.store.resume_trigger(&key).unwrap();
    assert_eq!(h.state(&key), TriggerState::Waiting);
    assert_eq!(h.events.count("misfired:"), 1);
    let trigger = h.store.retrieve_trigger(&key).unwrap().unwrap();
    assert_eq!(trigger.next_fire_time, Some(t0() + secs(40)));
}

#[test]
fn calendar_exclusion_relocates_first_fire() {
    let h = Harness::new();
    let calendar = Calendar::new(Exclusion::range(t0() + secs(10), t0() + secs(20))).unwrap();
    h.store
        .store_calendar("maintenance", &calendar, false, false)
        .unwrap();
    let j = job("backup");
    let trigger = Trigger::builder(TriggerKey::named("t"), j.key.clone(), Schedule::Once)
        .start_at(t0() + secs(12))
        .calendar("maintenance")
        .build();
    let first = h.store.store_job_and_trigger(&j, &trigger).unwrap();
    assert_eq!(first, t0() + secs(20));

    let err = h.store.remove_calendar("maintenance").unwrap_err();
    assert!(matches!(err, cadence_scheduler::StoreError::CalendarInUse(_)));
}

#[test]
fn higher_priority_wins_a_tie() {
    let h = Harness::new();
    let j = job("j").durable(true);
    h.store.store_job(&j, false).unwrap();
    let low = Trigger::builder(TriggerKey::named("low"), j.key.clone(), Schedule::Once)
        .start_at(t0())
        .priority(5)
        .build();
    let high = Trigger::builder(TriggerKey::named("high"), j.key.clone(), Schedule::Once)
        .start_at(t0())
        .priority(10)
        .build();
    h.store.store_trigger(&low, false).unwrap();
    h.store.store_trigger(&high, false).unwrap();

    let batch = h.acquire(1);
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].key.name, "high");
}

#[test]
fn trigger_in_paused_group_starts_paused() {
    let h = Harness::new();
    let j = job("j").durable(true);
    h.store.store_job(&j, false).unwrap();
    h.store.pause_trigger_group("DEFAULT").unwrap();
    h.store.store_trigger(&once("t", &j, t0()), false).unwrap();
    assert_eq!(h.state(&TriggerKey::named("t")), TriggerState::Paused);
    assert_eq!(h.store.paused_trigger_groups().unwrap(), vec!["DEFAULT".to_string()]);

    h.store.resume_trigger_group("DEFAULT").unwrap();
    assert_eq!(h.state(&TriggerKey::named("t")), TriggerState::Waiting);
}

#[test]
fn deleting_an_acquired_trigger_is_deferred_then_rejected() {
    let h = Harness::new();
    let j = job("j");
    h.store.store_job_and_trigger(&j, &once("t", &j, t0())).unwrap();
    let batch = h.acquire(1);

    assert!(h.store.remove_trigger(&TriggerKey::named("t")).unwrap());
    assert_eq!(h.state(&TriggerKey::named("t")), TriggerState::Acquired);

    let results = h.store.triggers_fired(&batch).unwrap();
    assert!(matches!(
        &results[0],
        TriggerFiredResult::Rejected { reason: RejectReason::Deleted, .. }
    ));
    assert_eq!(h.state(&TriggerKey::named("t")), TriggerState::Deleted);
    assert!(h.store.retrieve_job(&j.key).unwrap().is_none());
    assert_eq!(h.events.count("deleted:"), 1);
}

#[test]
fn pausing_an_acquired_trigger_rejects_its_fire() {
    let h = Harness::new();
    let j = job("j");
    h.store.store_job_and_trigger(&j, &every("t", &j, 10)).unwrap();
    let batch = h.acquire(1);
    h.store.pause_trigger(&TriggerKey::named("t")).unwrap();

    let results = h.store.triggers_fired(&batch).unwrap();
    assert!(matches!(
        &results[0],
        TriggerFiredResult::Rejected {
            reason: RejectReason::NotAcquired(TriggerState::Paused),
            ..
        }
    ));
}

#[test]
fn released_trigger_is_acquirable_again() {
    let h = Harness::new();
    let j = job("j");
    h.store.store_job_and_trigger(&j, &once("t", &j, t0())).unwrap();
    let batch = h.acquire(1);
    h.store.release_acquired_trigger(&batch[0]).unwrap();
    assert_eq!(h.state(&TriggerKey::named("t")), TriggerState::Waiting);
    assert_eq!(h.acquire(1).len(), 1);
}

#[test]
fn once_trigger_is_removed_after_its_only_fire() {
    let h = Harness::new();
    let j = job("j");
    h.store.store_job_and_trigger(&j, &once("t", &j, t0())).unwrap();
    let fired = h.fire(&h.acquire(1));
    assert_eq!(h.state(&TriggerKey::named("t")), TriggerState::Executing);

    h.complete(&fired[0]);
    assert_eq!(h.state(&TriggerKey::named("t")), TriggerState::Deleted);
    assert!(h.store.retrieve_job(&j.key).unwrap().is_none());
    assert_eq!(h.events.count("finalized:"), 1);
}

#[test]
fn job_data_is_persisted_when_requested() {
    let h = Harness::new();
    let j = job("counter").persist_job_data(true).with_data("runs", 0);
    h.store.store_job_and_trigger(&j, &every("t", &j, 10)).unwrap();
    let mut fired = h.fire(&h.acquire(1));
    fired[0].job.data.insert("runs".into(), serde_json::json!(1));
    h.complete(&fired[0]);

    let stored = h.store.retrieve_job(&j.key).unwrap().unwrap();
    assert_eq!(stored.data.get("runs"), Some(&serde_json::json!(1)));
}

#[test]
fn set_all_job_triggers_error_marks_every_trigger() {
    let h = Harness::new();
    let j = job("j").durable(true);
    h.store.store_job(&j, false).unwrap();
    h.store.store_trigger(&every("a", &j, 10), false).unwrap();
    h.store.store_trigger(&every("b", &j, 10), false).unwrap();
    let fired = h.fire(&h.acquire(1));
    h.store
        .triggered_job_complete(
            &fired[0].trigger,
            &fired[0].job,
            CompletedExecutionInstruction::SetAllJobTriggersError,
        )
        .unwrap();
    assert_eq!(h.state(&TriggerKey::named("a")), TriggerState::Error);
    assert_eq!(h.state(&TriggerKey::named("b")), TriggerState::Error);
}

#[test]
fn restart_recovers_only_jobs_that_request_it() {
    let h = Harness::new();
    let wanted = job("wanted").requests_recovery(true);
    let plain = job("plain");
    h.store
        .store_job_and_trigger(&wanted, &once("tw", &wanted, t0()))
        .unwrap();
    h.store
        .store_job_and_trigger(&plain, &once("tp", &plain, t0()))
        .unwrap();
    let fired = h.fire(&h.acquire(10));
    assert_eq!(fired.len(), 2);

    // The process dies here; a new store opens the same rows.
    let restarted = node(&h.clock, &h.backend, None, options("node-a", false));
    let report = restarted.scheduler_started().unwrap();
    assert_eq!(report.recovered_jobs, 1);
    assert_eq!(report.stale_records, 2);
    assert_eq!(report.purged_complete, 2);

    let recovery = restarted.trigger_keys(Some(RECOVERING_JOBS_GROUP)).unwrap();
    assert_eq!(recovery.len(), 1);
    let trigger = restarted.retrieve_trigger(&recovery[0]).unwrap().unwrap();
    assert_eq!(trigger.job_key, wanted.key);
    assert_eq!(
        trigger.data.get(RECOVERY_TRIGGER_NAME_KEY),
        Some(&serde_json::json!("tw"))
    );
    assert_eq!(trigger.next_fire_time, Some(t0()));
    assert!(restarted.retrieve_job(&plain.key).unwrap().is_none());

    let batch = restarted
        .acquire_next_triggers(t0() + secs(30), 10, Duration::zero())
        .unwrap();
    let results = restarted.triggers_fired(&batch).unwrap();
    match &results[0] {
        TriggerFiredResult::Fired(bundle) => assert!(bundle.recovering),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn cluster_node_takes_over_a_dead_peer() {
    let clock = Arc::new(ManualClock::new(t0()));
    let backend = Arc::new(RamBackend::new());
    let shared_clock: Arc<dyn Clock> = clock.clone();
    let lock = Arc::new(LocalLock::new(shared_clock));
    let a = node(&clock, &backend, Some(Arc::clone(&lock)), options("node-a", true));
    let b = node(&clock, &backend, Some(Arc::clone(&lock)), options("node-b", true));

    a.scheduler_started().unwrap();
    b.scheduler_started().unwrap();

    let j = job("billing").requests_recovery(true);
    a.store_job_and_trigger(&j, &once("t", &j, t0())).unwrap();
    let batch = a
        .acquire_next_triggers(t0() + secs(30), 1, Duration::zero())
        .unwrap();
    let in_flight = match a.triggers_fired(&batch).unwrap().remove(0) {
        TriggerFiredResult::Fired(bundle) => *bundle,
        other => panic!("unexpected {other:?}"),
    };
    assert!(b
        .acquire_next_triggers(t0() + secs(30), 1, Duration::zero())
        .unwrap()
        .is_empty());

    // node-a stops checking in.
    clock.advance(secs(20));
    assert_eq!(b.check_in().unwrap(), vec!["node-a".to_string()]);

    let recovered = b
        .acquire_next_triggers(clock.now() + secs(30), 1, Duration::zero())
        .unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].key.group, RECOVERING_JOBS_GROUP);
    assert_eq!(recovered[0].job_key, j.key);

    // A late completion from the dead node changes nothing.
    a.triggered_job_complete(
        &in_flight.trigger,
        &in_flight.job,
        CompletedExecutionInstruction::DeleteTrigger,
    )
    .unwrap();
    assert_eq!(b.trigger_state(&recovered[0].key).unwrap(), TriggerState::Acquired);
    assert!(b.retrieve_job(&j.key).unwrap().is_some());
}

#[test]
fn replacing_a_trigger_keeps_the_job() {
    let h = Harness::new();
    let j = job("j");
    h.store.store_job_and_trigger(&j, &once("t", &j, t0())).unwrap();
    let replacement = once("t2", &j, t0() + secs(60));
    let first = h
        .store
        .replace_trigger(&TriggerKey::named("t"), &replacement)
        .unwrap();
    assert_eq!(first, t0() + secs(60));
    assert!(h.store.retrieve_job(&j.key).unwrap().is_some());
    assert_eq!(h.state(&TriggerKey::named("t")), TriggerState::Deleted);
    assert_eq!(h.state(&TriggerKey::named("t2")), TriggerState::Waiting);
}
