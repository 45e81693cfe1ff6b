use std::sync::Arc;

use anyhow::bail;
use cadence_core::config::StoreKind;
use cadence_scheduler::{JobRegistry, Scheduler, SchedulerStatus};
use chrono::Utc;
use clap::Parser;
use tracing::{info, warn};

mod config;
mod jobs;

use config::DaemonConfig;

#[derive(Parser, Debug)]
#[command(name = "cadence", about = "Cadence job scheduler daemon", version)]
struct Args {
    /// Config file (default: ~/.cadence/cadence.toml)
    #[arg(long, short, env = "CADENCE_CONFIG")]
    config: Option<String>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence=info,cadence_scheduler=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = DaemonConfig::load(args.config.as_deref())?;
    let declared = config.declarations(Utc::now())?;

    if args.check {
        let triggers: usize = declared.jobs.iter().map(|(_, t)| t.len()).sum();
        println!(
            "configuration ok: {} calendar(s), {} job(s), {} trigger(s)",
            declared.calendars.len(),
            declared.jobs.len(),
            triggers
        );
        return Ok(());
    }

    let jobs = Arc::new(JobRegistry::new());
    jobs::register_builtin(&jobs);
    for (job, _) in &declared.jobs {
        if !jobs.contains(&job.job_type) {
            bail!("job {} has unknown job_type {}", job.key, job.job_type);
        }
    }

    if config.core.store.kind == StoreKind::Sqlite {
        let path = config.core.store.resolved_path();
        ensure_parent_dir(&path);
        info!(path = %path, clustered = config.core.store.clustered, "using SQLite job store");
    }

    let scheduler = Scheduler::builder(&config.core)
        .job_registry(Arc::clone(&jobs))
        .build()?;

    for (name, calendar) in declared.calendars {
        scheduler.add_calendar(&name, calendar, true, true).await?;
    }
    for (job, triggers) in declared.jobs {
        let key = job.key.clone();
        let fire_times = scheduler
            .schedule_job_with_triggers(job, triggers, true)
            .await?;
        info!(job = %key, triggers = fire_times.len(), "job declared");
    }

    let report = scheduler.start().await?;
    info!(
        instance = %scheduler.instance_id(),
        recovered_jobs = report.recovered_jobs,
        stale_records = report.stale_records,
        misfires = report.misfires.processed,
        job_types = ?jobs.job_types(),
        "cadence running"
    );

    let failed = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
            false
        }
        status = scheduler.wait_for_status(SchedulerStatus::Error) => {
            status == SchedulerStatus::Error
        }
    };

    scheduler.shutdown_default().await?;
    let metadata = scheduler.metadata();
    info!(jobs_executed = metadata.jobs_executed, "cadence stopped");
    if failed {
        bail!("scheduler stopped after an unrecoverable store error");
    }
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
