use cadence_core::{CoreError, JobKey, TriggerKey};
use rusqlite::ErrorCode;
use thiserror::Error;

use crate::job::JobExecutionError;
use crate::trigger::MisfireInstruction;

/// Invalid calendar definitions. Reported when the calendar is built or
/// attached, never from the firing loop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CalendarError {
    #[error("calendar chain has {depth} layers, the limit is {max}")]
    TooDeep { depth: usize, max: usize },

    #[error("invalid exclusion: {0}")]
    InvalidExclusion(String),
}

/// Invalid trigger/schedule definitions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("misfire instruction {instruction} is not valid for {kind} schedules")]
    IllegalMisfireInstruction {
        instruction: MisfireInstruction,
        kind: &'static str,
    },

    #[error("no custom schedule registered for kind {0:?}")]
    UnknownCustomKind(String),

    #[error("end time is before start time")]
    EndBeforeStart,

    #[error("trigger {0} will never fire")]
    NeverFires(TriggerKey),
}

/// Errors raised by a [`JobStore`](crate::store::JobStore) or its backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A persisted row could not be decoded.
    #[error("unreadable row: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timed out acquiring lock {resource}")]
    LockTimeout { resource: String },

    #[error("lease on lock {resource} was lost")]
    LockLost { resource: String },

    #[error("store state poisoned by a panicking writer")]
    Poisoned,

    #[error("store corrupt: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("object already exists: {0}")]
    ObjectAlreadyExists(String),

    #[error("job not found: {0}")]
    JobNotFound(JobKey),

    #[error("trigger not found: {0}")]
    TriggerNotFound(TriggerKey),

    #[error("calendar not found: {0}")]
    CalendarNotFound(String),

    #[error("calendar {0} is referenced by triggers")]
    CalendarInUse(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Calendar(#[from] CalendarError),
}

impl StoreError {
    /// Worth retrying: contention or a lease that expired under us.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::LockTimeout { .. } | StoreError::LockLost { .. } => true,
            StoreError::Database(e) => matches!(
                e.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }

    /// The store cannot be used any more; the firing loop must stop.
    pub fn is_fatal(&self) -> bool {
        match self {
            StoreError::Poisoned
            | StoreError::Corrupt(_)
            | StoreError::Unavailable(_)
            | StoreError::Serialization(_) => true,
            StoreError::Database(e) => matches!(
                e.sqlite_error_code(),
                Some(
                    ErrorCode::DatabaseCorrupt
                        | ErrorCode::NotADatabase
                        | ErrorCode::CannotOpen
                        | ErrorCode::ReadOnly
                        | ErrorCode::DiskFull
                )
            ),
            _ => false,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the [`Scheduler`](crate::Scheduler) facade.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Calendar(#[from] CalendarError),

    #[error(transparent)]
    Config(#[from] CoreError),

    #[error("job execution failed: {0}")]
    JobExecution(#[from] JobExecutionError),

    #[error("no job registered for type {0:?}")]
    UnknownJobType(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("scheduler has been shut down")]
    Shutdown,
}

impl SchedulerError {
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Store(e) if e.is_fatal() => "STORE_FATAL",
            SchedulerError::Store(_) => "STORE_ERROR",
            SchedulerError::Schedule(_) => "INVALID_SCHEDULE",
            SchedulerError::Calendar(_) => "INVALID_CALENDAR",
            SchedulerError::Config(e) => e.code(),
            SchedulerError::JobExecution(_) => "JOB_FAILED",
            SchedulerError::UnknownJobType(_) => "UNKNOWN_JOB_TYPE",
            SchedulerError::Invalid(_) => "INVALID_REQUEST",
            SchedulerError::Shutdown => "SHUTDOWN",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
