//! Cron-driven background jobs.

pub mod scheduler;

use log::info;
use std::sync::Arc;

use crate::core::shared::state::AppState;
use crate::tickets::{reconcile, worklog_import};

pub use scheduler::{job_handler, JobError, JobHandler, ScheduledJob, SchedulerError, TaskScheduler};

/// Schedules reconciliation and worklog import from the configured cron
/// expressions and starts the tick loop.
pub async fn start_portal_jobs(state: Arc<AppState>) -> Result<TaskScheduler, SchedulerError> {
    let schedule = state.config.schedule.clone();
    let scheduler = TaskScheduler::new(state);
    scheduler
        .schedule(reconcile::JOB_NAME, &schedule.reconciliation)
        .await?;
    scheduler
        .schedule(worklog_import::JOB_NAME, &schedule.worklog_import)
        .await?;
    scheduler.start().await;
    info!("Background jobs scheduled");
    Ok(scheduler)
}
