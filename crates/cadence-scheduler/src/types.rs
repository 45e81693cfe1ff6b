use cadence_core::{JobKey, TriggerKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobDetail;
use crate::trigger::Trigger;

/// Group holding the one-shot triggers created to re-run crashed jobs.
pub const RECOVERING_JOBS_GROUP: &str = "RECOVERING_JOBS";
/// Group holding the one-shot triggers created by `Scheduler::trigger_job`.
pub const MANUAL_TRIGGER_GROUP: &str = "MANUAL_TRIGGER";

pub const RECOVERY_TRIGGER_NAME_KEY: &str = "cadence.recovery.trigger_name";
pub const RECOVERY_TRIGGER_GROUP_KEY: &str = "cadence.recovery.trigger_group";
pub const RECOVERY_FIRE_TIME_KEY: &str = "cadence.recovery.fire_time_ms";
pub const RECOVERY_SCHEDULED_FIRE_TIME_KEY: &str = "cadence.recovery.scheduled_fire_time_ms";

/// Lifecycle state of a stored trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    Waiting,
    Acquired,
    Executing,
    Paused,
    /// Sibling of a concurrency-restricted job whose instance is running.
    Blocked,
    PausedBlocked,
    Complete,
    Error,
    /// Reported for keys that are no longer stored.
    Deleted,
}

impl TriggerState {
    pub fn is_in_flight(self) -> bool {
        matches!(self, TriggerState::Acquired | TriggerState::Executing)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TriggerState::Complete | TriggerState::Error | TriggerState::Deleted
        )
    }
}

impl std::fmt::Display for TriggerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerState::Waiting => "waiting",
            TriggerState::Acquired => "acquired",
            TriggerState::Executing => "executing",
            TriggerState::Paused => "paused",
            TriggerState::Blocked => "blocked",
            TriggerState::PausedBlocked => "paused_blocked",
            TriggerState::Complete => "complete",
            TriggerState::Error => "error",
            TriggerState::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TriggerState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TriggerState::Waiting),
            "acquired" => Ok(TriggerState::Acquired),
            "executing" => Ok(TriggerState::Executing),
            "paused" => Ok(TriggerState::Paused),
            "blocked" => Ok(TriggerState::Blocked),
            "paused_blocked" => Ok(TriggerState::PausedBlocked),
            "complete" => Ok(TriggerState::Complete),
            "error" => Ok(TriggerState::Error),
            "deleted" => Ok(TriggerState::Deleted),
            other => Err(format!("unknown trigger state: {other}")),
        }
    }
}

/// A trigger row as the store keeps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTrigger {
    pub trigger: Trigger,
    pub state: TriggerState,
    /// Deleted while in flight; discarded when the fire completes or is rejected.
    #[serde(default)]
    pub delete_pending: bool,
    /// Paused while executing; becomes `Paused` on completion.
    #[serde(default)]
    pub pause_pending: bool,
}

impl StoredTrigger {
    pub fn new(trigger: Trigger, state: TriggerState) -> Self {
        Self {
            trigger,
            state,
            delete_pending: false,
            pause_pending: false,
        }
    }

    pub fn key(&self) -> &TriggerKey {
        &self.trigger.key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FiredState {
    Acquired,
    Executing,
}

impl std::fmt::Display for FiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FiredState::Acquired => write!(f, "acquired"),
            FiredState::Executing => write!(f, "executing"),
        }
    }
}

/// Snapshot of one in-flight fire, kept until the fire completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredTriggerRecord {
    pub entry_id: String,
    pub trigger_key: TriggerKey,
    pub job_key: JobKey,
    pub instance_id: String,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: DateTime<Utc>,
    pub priority: i32,
    pub state: FiredState,
    pub requests_recovery: bool,
    pub concurrent_execution_disallowed: bool,
}

/// Heartbeat row of one scheduler instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStateRecord {
    pub instance_id: String,
    pub last_checkin: DateTime<Utc>,
    pub checkin_interval_ms: u64,
}

/// What the store does with a trigger once its job run is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletedExecutionInstruction {
    /// Reschedule normally.
    NoInstruction,
    ReExecuteJob,
    DeleteTrigger,
    SetTriggerComplete,
    SetTriggerError,
    SetAllJobTriggersComplete,
    SetAllJobTriggersError,
}

impl std::fmt::Display for CompletedExecutionInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompletedExecutionInstruction::NoInstruction => "no_instruction",
            CompletedExecutionInstruction::ReExecuteJob => "re_execute_job",
            CompletedExecutionInstruction::DeleteTrigger => "delete_trigger",
            CompletedExecutionInstruction::SetTriggerComplete => "set_trigger_complete",
            CompletedExecutionInstruction::SetTriggerError => "set_trigger_error",
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                "set_all_job_triggers_complete"
            }
            CompletedExecutionInstruction::SetAllJobTriggersError => "set_all_job_triggers_error",
        };
        write!(f, "{s}")
    }
}

/// Everything a job run needs, handed out by `triggers_fired`.
#[derive(Debug, Clone)]
pub struct TriggerFiredBundle {
    pub job: JobDetail,
    /// The trigger after it was advanced past this fire.
    pub trigger: Trigger,
    pub fire_instance_id: String,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: DateTime<Utc>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub recovering: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// No longer `Acquired` (paused, re-acquired elsewhere, or recovered).
    NotAcquired(TriggerState),
    /// Acquisition identity changed since this node acquired it.
    Stale,
    Deleted,
    JobMissing,
    CalendarMissing(String),
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::NotAcquired(state) => write!(f, "trigger is {state}, not acquired"),
            RejectReason::Stale => write!(f, "acquisition superseded"),
            RejectReason::Deleted => write!(f, "trigger deleted"),
            RejectReason::JobMissing => write!(f, "job missing"),
            RejectReason::CalendarMissing(name) => write!(f, "calendar {name} missing"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TriggerFiredResult {
    Fired(Box<TriggerFiredBundle>),
    Rejected { key: TriggerKey, reason: RejectReason },
}

/// Outcome of one misfire scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MisfireScan {
    pub processed: usize,
    /// More misfired triggers are waiting than one pass handles.
    pub has_more: bool,
    pub earliest_new_time: Option<DateTime<Utc>>,
}

/// What `scheduler_started` found and repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Recovery triggers created for interrupted jobs that asked for it.
    pub recovered_jobs: usize,
    /// Fired records discarded.
    pub stale_records: usize,
    pub purged_complete: usize,
    pub misfires: MisfireScan,
}

/// Lifecycle of the scheduler as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerStatus {
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    /// The store failed unrecoverably; needs a restart.
    Error,
}

impl std::fmt::Display for SchedulerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SchedulerStatus::Starting => "starting",
            SchedulerStatus::Running => "running",
            SchedulerStatus::Paused => "paused",
            SchedulerStatus::Stopping => "stopping",
            SchedulerStatus::Stopped => "stopped",
            SchedulerStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}
