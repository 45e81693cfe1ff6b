//! The SQLite store keeps its state across process restarts.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use cadence_core::{Clock, JobKey, ManualClock, TriggerKey};
use cadence_scheduler::calendar::{Calendar, Exclusion};
use cadence_scheduler::job::JobDetail;
use cadence_scheduler::store::{ClusteredStore, JobStore, SqliteBackend, StoreOptions};
use cadence_scheduler::trigger::{CustomScheduleRegistry, Schedule, Trigger};
use cadence_scheduler::types::{TriggerFiredResult, TriggerState, RECOVERING_JOBS_GROUP};
use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 6, 1, 12, 0, 0).unwrap()
}

fn options(instance: &str, clustered: bool) -> StoreOptions {
    StoreOptions {
        instance_id: instance.to_string(),
        clustered,
        misfire_threshold: Duration::seconds(5),
        max_misfires_per_pass: 20,
        checkin_interval: StdDuration::from_millis(7_500),
        lock_lease: StdDuration::from_secs(30),
        lock_timeout: StdDuration::from_secs(2),
        lock_retry_base: StdDuration::from_millis(5),
        transient_retries: 3,
    }
}

fn open(
    dir: &TempDir,
    clock: &Arc<ManualClock>,
    instance: &str,
    clustered: bool,
) -> ClusteredStore<SqliteBackend> {
    let path = dir.path().join("cadence.db");
    let clock: Arc<dyn Clock> = clock.clone();
    ClusteredStore::open_sqlite(
        path.to_str().unwrap(),
        options(instance, clustered),
        clock,
        CustomScheduleRegistry::new(),
    )
    .unwrap()
}

fn acquire(store: &dyn JobStore, now: DateTime<Utc>) -> Vec<Trigger> {
    store
        .acquire_next_triggers(now + Duration::seconds(30), 10, Duration::zero())
        .unwrap()
}

#[test]
fn definitions_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    {
        let store = open(&dir, &clock, "node-a", false);
        assert!(store.supports_persistence());
        let calendar = Calendar::new(Exclusion::weekly([0, 6])).unwrap();
        store.store_calendar("weekdays", &calendar, false, false).unwrap();
        let job = JobDetail::new(JobKey::new("nightly", "reports"), "report")
            .durable(true)
            .with_data("format", "pdf");
        store.store_job(&job, false).unwrap();
        let trigger = Trigger::builder(
            TriggerKey::new("nightly", "reports"),
            job.key.clone(),
            Schedule::interval(Duration::hours(1)),
        )
        .start_at(t0())
        .priority(7)
        .build();
        assert_eq!(store.store_trigger(&trigger, false).unwrap(), t0());
        store.pause_trigger_group("paused-group").unwrap();
    }

    let store = open(&dir, &clock, "node-a", false);
    let report = store.scheduler_started().unwrap();
    assert_eq!(report.stale_records, 0);

    let job = store
        .retrieve_job(&JobKey::new("nightly", "reports"))
        .unwrap()
        .unwrap();
    assert!(job.durable);
    assert_eq!(job.data.get("format"), Some(&serde_json::json!("pdf")));

    let key = TriggerKey::new("nightly", "reports");
    let trigger = store.retrieve_trigger(&key).unwrap().unwrap();
    assert_eq!(trigger.priority, 7);
    assert_eq!(trigger.next_fire_time, Some(t0()));
    assert_eq!(store.trigger_state(&key).unwrap(), TriggerState::Waiting);
    assert_eq!(store.calendar_names().unwrap(), vec!["weekdays".to_string()]);
    assert_eq!(
        store.paused_trigger_groups().unwrap(),
        vec!["paused-group".to_string()]
    );
}

#[test]
fn fire_state_and_recovery_after_restart() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let job = JobDetail::new(JobKey::named("import"), "import").requests_recovery(true);
    {
        let store = open(&dir, &clock, "node-a", false);
        let trigger = Trigger::builder(
            TriggerKey::named("hourly"),
            job.key.clone(),
            Schedule::interval(Duration::hours(1)),
        )
        .start_at(t0())
        .build();
        store.store_job_and_trigger(&job, &trigger).unwrap();
        let batch = acquire(&store, clock.now());
        let results = store.triggers_fired(&batch).unwrap();
        assert!(matches!(results[0], TriggerFiredResult::Fired(_)));
        assert_eq!(
            store.trigger_state(&TriggerKey::named("hourly")).unwrap(),
            TriggerState::Executing
        );
        // Dropped mid-run.
    }

    clock.advance(Duration::minutes(5));
    let store = open(&dir, &clock, "node-a", false);
    let report = store.scheduler_started().unwrap();
    assert_eq!(report.recovered_jobs, 1);
    assert_eq!(report.stale_records, 1);

    let hourly = TriggerKey::named("hourly");
    assert_eq!(store.trigger_state(&hourly).unwrap(), TriggerState::Waiting);
    assert_eq!(
        store.retrieve_trigger(&hourly).unwrap().unwrap().next_fire_time,
        Some(t0() + Duration::hours(1))
    );
    let recovery = store.trigger_keys(Some(RECOVERING_JOBS_GROUP)).unwrap();
    assert_eq!(recovery.len(), 1);

    let batch = acquire(&store, clock.now());
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].key, recovery[0]);
    match store.triggers_fired(&batch).unwrap().remove(0) {
        TriggerFiredResult::Fired(bundle) => {
            assert!(bundle.recovering);
            let instruction = bundle.trigger.execution_complete(None);
            store
                .triggered_job_complete(&bundle.trigger, &bundle.job, instruction)
                .unwrap();
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(store.trigger_keys(Some(RECOVERING_JOBS_GROUP)).unwrap().is_empty());
    assert!(store.retrieve_job(&job.key).unwrap().is_some());
}

#[test]
fn clustered_nodes_never_fire_the_same_trigger() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let a = open(&dir, &clock, "node-a", true);
    let b = open(&dir, &clock, "node-b", true);
    a.scheduler_started().unwrap();
    b.scheduler_started().unwrap();

    let job = JobDetail::new(JobKey::named("sync"), "sync");
    let trigger = Trigger::builder(TriggerKey::named("once"), job.key.clone(), Schedule::Once)
        .start_at(t0())
        .build();
    a.store_job_and_trigger(&job, &trigger).unwrap();

    let from_b = acquire(&b, clock.now());
    let from_a = acquire(&a, clock.now());
    assert_eq!(from_b.len() + from_a.len(), 1);
    let (winner, batch) = if from_a.is_empty() {
        (&b as &dyn JobStore, from_b)
    } else {
        (&a as &dyn JobStore, from_a)
    };
    assert!(matches!(
        winner.triggers_fired(&batch).unwrap()[0],
        TriggerFiredResult::Fired(_)
    ));
}
