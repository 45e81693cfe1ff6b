//! Built-in job kinds the daemon can run from configuration alone.
//!
//! | `job_type` | Data keys                                         |
//! |------------|---------------------------------------------------|
//! | `log`      | `message`                                         |
//! | `command`  | `command`, `args`, `cwd`, `timeout_ms`, `refire_on_failure` |

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_scheduler::{Job, JobExecutionContext, JobExecutionError, JobRegistry};
use tracing::{info, warn};

pub const LOG_JOB: &str = "log";
pub const COMMAND_JOB: &str = "command";

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);
/// Characters of stdout/stderr kept in the job result.
const MAX_OUTPUT_CHARS: usize = 4_000;

pub fn register_builtin(registry: &JobRegistry) {
    registry.register(LOG_JOB, Arc::new(LogJob));
    registry.register(COMMAND_JOB, Arc::new(CommandJob));
}

/// Writes its `message` to the log.
pub struct LogJob;

#[async_trait]
impl Job for LogJob {
    async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
        let message = ctx.get_str("message").unwrap_or("fired").to_string();
        info!(
            job = %ctx.job_key(),
            trigger = %ctx.trigger_key(),
            scheduled = %ctx.scheduled_fire_time,
            recovering = ctx.recovering,
            "{message}"
        );
        ctx.result = Some(serde_json::Value::String(message));
        Ok(())
    }
}

/// Runs a program (no shell) and fails when it exits non-zero.
pub struct CommandJob;

#[async_trait]
impl Job for CommandJob {
    async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
        let program = ctx
            .get_str("command")
            .ok_or_else(|| JobExecutionError::new("missing `command` in job data").unschedule_trigger())?
            .to_string();
        let args: Vec<String> = match ctx.merged_data.get("args") {
            None => Vec::new(),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                JobExecutionError::new(format!("`args` must be a list of strings: {e}"))
                    .unschedule_trigger()
            })?,
        };
        let timeout = ctx
            .merged_data
            .get("timeout_ms")
            .and_then(|v| v.as_u64())
            .map_or(DEFAULT_COMMAND_TIMEOUT, Duration::from_millis);
        let refire_on_failure = ctx
            .merged_data
            .get("refire_on_failure")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let mut command = tokio::process::Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = ctx.get_str("cwd") {
            command.current_dir(cwd);
        }

        let child = command
            .spawn()
            .map_err(|e| JobExecutionError::new(format!("spawn {program} failed: {e}")))?;
        // Dropping the child on timeout kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| JobExecutionError::new(format!("{program}: {e}")))?,
            Err(_) => {
                warn!(job = %ctx.job_key(), %program, timeout_ms = timeout.as_millis() as u64, "command timed out");
                return Err(JobExecutionError::new(format!(
                    "{program} timed out after {}ms",
                    timeout.as_millis()
                )));
            }
        };

        let code = output.status.code();
        ctx.result = Some(serde_json::json!({
            "exit_code": code,
            "stdout": truncate(&String::from_utf8_lossy(&output.stdout)),
            "stderr": truncate(&String::from_utf8_lossy(&output.stderr)),
        }));
        if output.status.success() {
            info!(job = %ctx.job_key(), %program, "command finished");
            return Ok(());
        }

        let err = JobExecutionError::new(format!(
            "{program} exited with {}",
            code.map_or_else(|| "a signal".to_string(), |c| format!("status {c}"))
        ));
        // One retry per fire.
        if refire_on_failure && ctx.refire_count == 0 {
            return Err(err.refire());
        }
        Err(err)
    }
}

fn truncate(s: &str) -> String {
    let s = s.trim();
    match s.char_indices().nth(MAX_OUTPUT_CHARS) {
        None => s.to_string(),
        Some((cut, _)) => format!("{}…", &s[..cut]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{JobKey, TriggerKey};
    use cadence_scheduler::types::TriggerFiredBundle;
    use cadence_scheduler::{JobDetail, Schedule, Trigger};
    use chrono::Utc;

    fn ctx(job_type: &str, data: serde_json::Value) -> JobExecutionContext {
        let mut job = JobDetail::new(JobKey::named("j"), job_type);
        if let serde_json::Value::Object(map) = data {
            job.data = map;
        }
        let now = Utc::now();
        let trigger = Trigger::builder(TriggerKey::named("t"), job.key.clone(), Schedule::Once)
            .start_at(now)
            .build();
        JobExecutionContext::new(&TriggerFiredBundle {
            job,
            trigger,
            fire_instance_id: "fire-1".into(),
            fire_time: now,
            scheduled_fire_time: now,
            previous_fire_time: None,
            next_fire_time: None,
            recovering: false,
        })
    }

    #[test]
    fn builtins_are_registered() {
        let registry = JobRegistry::new();
        register_builtin(&registry);
        assert!(registry.contains(LOG_JOB));
        assert!(registry.contains(COMMAND_JOB));
    }

    #[tokio::test]
    async fn log_job_records_its_message() {
        let mut ctx = ctx(LOG_JOB, serde_json::json!({ "message": "hello" }));
        LogJob.execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.result, Some(serde_json::json!("hello")));
    }

    #[tokio::test]
    async fn command_without_program_unschedules() {
        let mut ctx = ctx(COMMAND_JOB, serde_json::json!({}));
        let err = CommandJob.execute(&mut ctx).await.unwrap_err();
        assert!(err.unschedule_firing_trigger);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_output_is_captured() {
        let mut ctx = ctx(
            COMMAND_JOB,
            serde_json::json!({ "command": "sh", "args": ["-c", "echo hi; echo oops >&2"] }),
        );
        CommandJob.execute(&mut ctx).await.unwrap();
        let result = ctx.result.unwrap();
        assert_eq!(result["exit_code"], 0);
        assert_eq!(result["stdout"], "hi");
        assert_eq!(result["stderr"], "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_can_ask_for_one_refire() {
        let mut ctx = ctx(
            COMMAND_JOB,
            serde_json::json!({ "command": "false", "refire_on_failure": true }),
        );
        let err = CommandJob.execute(&mut ctx).await.unwrap_err();
        assert!(err.refire_immediately);

        ctx.refire_count = 1;
        let err = CommandJob.execute(&mut ctx).await.unwrap_err();
        assert!(!err.refire_immediately);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_command_times_out() {
        let mut ctx = ctx(
            COMMAND_JOB,
            serde_json::json!({ "command": "sleep", "args": ["5"], "timeout_ms": 100 }),
        );
        let err = CommandJob.execute(&mut ctx).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn long_output_is_cut() {
        let long = "x".repeat(MAX_OUTPUT_CHARS + 10);
        assert_eq!(truncate(&long).chars().count(), MAX_OUTPUT_CHARS + 1);
        assert_eq!(truncate("  short \n"), "short");
    }
}
