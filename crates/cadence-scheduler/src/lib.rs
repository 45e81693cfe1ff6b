//! `cadence-scheduler`: trigger scheduling and firing engine.
//!
//! # Overview
//!
//! Jobs and their triggers live in a [`JobStore`]. One firing loop per
//! [`Scheduler`] acquires the triggers due next, waits for their fire time
//! and hands each run to a bounded [`WorkerPool`]; when the run ends the
//! store computes the trigger's next fire time. Several schedulers may share
//! one SQLite store as a cluster: acquisitions are serialized by a leased
//! lock and a node that stops checking in has its in-flight work recovered.
//!
//! # Schedule kinds
//!
//! | Variant    | Behaviour                                                  |
//! |------------|------------------------------------------------------------|
//! | `Once`     | Single fire at the trigger's start time                    |
//! | `Interval` | Fixed rate from the start time, optionally bounded repeats |
//! | `Daily`    | HH:MM UTC every day                                        |
//! | `Weekly`   | HH:MM UTC on one weekday                                   |
//! | `Cron`     | 5, 6 or 7 field cron expression                            |
//! | `Custom`   | A registered [`CustomSchedule`]                            |

pub mod calendar;
pub mod cron_expr;
pub mod db;
mod engine;
pub mod error;
pub mod job;
pub mod listener;
pub mod lock;
mod maintenance;
pub mod pool;
pub mod scheduler;
mod shell;
pub mod signaler;
pub mod store;
pub mod trigger;
pub mod types;

pub use calendar::{Calendar, Exclusion};
pub use engine::LoopSettings;
pub use error::{CalendarError, Result, ScheduleError, SchedulerError, StoreError, StoreResult};
pub use job::{Job, JobDataMap, JobDetail, JobExecutionContext, JobExecutionError, JobRegistry};
pub use listener::{
    JobListener, JobListenerAdapter, KeyMatcher, ListenerRegistry, SchedulerListener,
    SchedulerListenerAdapter, TriggerListener, TriggerListenerAdapter,
};
pub use pool::WorkerPool;
pub use scheduler::{Scheduler, SchedulerBuilder, SchedulerMetadata};
pub use store::{ClusteredStore, JobStore, StoreOptions};
pub use trigger::{CustomSchedule, CustomScheduleRegistry, MisfireInstruction, Schedule, Trigger};
pub use types::{CompletedExecutionInstruction, SchedulerStatus, TriggerState};
