use crate::core::shared::state::AppState;
use chrono::{DateTime, Utc};
use cron::Schedule;

use log::{error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::tickets::{reconcile, worklog_import};

pub type JobError = Box<dyn std::error::Error + Send + Sync>;

type JobFuture = Pin<Box<dyn Future<Output = Result<String, JobError>> + Send>>;

/// A job body. Returns a one-line summary of the run.
pub type JobHandler = Arc<dyn Fn(Arc<AppState>) -> JobFuture + Send + Sync>;

pub fn job_handler<F, Fut>(f: F) -> JobHandler
where
    F: Fn(Arc<AppState>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, JobError>> + Send + 'static,
{
    Arc::new(move |state| Box::pin(f(state)) as JobFuture)
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },
    #[error("no handler registered for job {0:?}")]
    UnknownJob(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub name: String,
    pub cron_expression: String,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
}

fn next_after(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

fn parse_schedule(expression: &str) -> Result<Schedule, SchedulerError> {
    Schedule::from_str(expression).map_err(|e| SchedulerError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Clone)]
pub struct TaskScheduler {
    state: Arc<AppState>,
    tick: Duration,
    running_jobs: Arc<RwLock<HashMap<String, tokio::task::JoinHandle<()>>>>,
    job_registry: Arc<RwLock<HashMap<String, JobHandler>>>,
    scheduled_jobs: Arc<RwLock<Vec<ScheduledJob>>>,
}

impl TaskScheduler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            tick: Duration::from_secs(30),
            running_jobs: Arc::new(RwLock::new(HashMap::new())),
            job_registry: Arc::new(RwLock::new(default_handlers())),
            scheduled_jobs: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub async fn register_handler(&self, name: impl Into<String>, handler: JobHandler) {
        let mut registry = self.job_registry.write().await;
        registry.insert(name.into(), handler);
    }

    /// Schedules a registered job. Re-scheduling a name replaces its cron
    /// expression.
    pub async fn schedule(
        &self,
        name: &str,
        cron_expression: &str,
    ) -> Result<ScheduledJob, SchedulerError> {
        if !self.job_registry.read().await.contains_key(name) {
            return Err(SchedulerError::UnknownJob(name.to_string()));
        }
        let schedule = parse_schedule(cron_expression)?;
        let next_run = next_after(&schedule, Utc::now()).ok_or_else(|| {
            SchedulerError::InvalidCron {
                expression: cron_expression.to_string(),
                reason: "schedule never fires".to_string(),
            }
        })?;

        let job = ScheduledJob {
            name: name.to_string(),
            cron_expression: cron_expression.to_string(),
            enabled: true,
            last_run: None,
            next_run,
        };

        let mut jobs = self.scheduled_jobs.write().await;
        jobs.retain(|j| j.name != name);
        jobs.push(job.clone());

        info!("Scheduled job {} ({}), next run at {}", job.name, job.cron_expression, job.next_run);
        Ok(job)
    }

    pub async fn start(&self) {
        info!("Starting task scheduler");
        let scheduler = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(scheduler.tick);

            loop {
                interval.tick().await;
                scheduler.check_and_run_jobs(Utc::now()).await;
            }
        });
    }

    /// Starts every enabled job due at `now`. A job still running from an
    /// earlier tick is skipped until it finishes.
    pub async fn check_and_run_jobs(&self, now: DateTime<Utc>) -> Vec<String> {
        let due = self.take_due_jobs(now).await;
        for name in &due {
            self.spawn_job(name.clone()).await;
        }
        due
    }

    async fn take_due_jobs(&self, now: DateTime<Utc>) -> Vec<String> {
        let running = self.running_jobs.read().await;
        let mut jobs = self.scheduled_jobs.write().await;
        let mut due = Vec::new();

        for job in jobs.iter_mut().filter(|j| j.enabled && j.next_run <= now) {
            if running.get(&job.name).is_some_and(|h| !h.is_finished()) {
                warn!("Job {} is still running, skipping this slot", job.name);
            } else {
                job.last_run = Some(now);
                due.push(job.name.clone());
            }
            match parse_schedule(&job.cron_expression)
                .ok()
                .and_then(|s| next_after(&s, now))
            {
                Some(next) => job.next_run = next,
                None => {
                    error!("Job {} has no upcoming run, disabling", job.name);
                    job.enabled = false;
                }
            }
        }
        due
    }

    async fn spawn_job(&self, name: String) {
        let scheduler = self.clone();
        let job_name = name.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = scheduler.run_now(&job_name).await {
                error!("Job {} failed: {}", job_name, e);
            }
        });

        let mut running = self.running_jobs.write().await;
        running.insert(name, handle);
    }

    /// Runs a registered job immediately on the current task.
    pub async fn run_now(&self, name: &str) -> Result<String, JobError> {
        let handler = self
            .job_registry
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;

        let started_at = Utc::now();
        info!("Running job {}", name);
        let result = handler(Arc::clone(&self.state)).await;
        let duration_ms = (Utc::now() - started_at).num_milliseconds();
        match &result {
            Ok(summary) => info!("Job {} completed in {}ms: {}", name, duration_ms, summary),
            Err(e) => warn!("Job {} ended after {}ms: {}", name, duration_ms, e),
        }
        result
    }

    pub async fn list_scheduled_jobs(&self) -> Vec<ScheduledJob> {
        self.scheduled_jobs.read().await.clone()
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), SchedulerError> {
        let mut jobs = self.scheduled_jobs.write().await;
        let job = jobs
            .iter_mut()
            .find(|j| j.name == name)
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        job.enabled = enabled;
        Ok(())
    }

    /// Aborts in-flight runs. Their job locks are released as the runs drop.
    pub async fn stop(&self) {
        let mut running = self.running_jobs.write().await;
        for (name, handle) in running.drain() {
            if !handle.is_finished() {
                handle.abort();
                info!("Stopped job {}", name);
            }
        }
    }
}

fn default_handlers() -> HashMap<String, JobHandler> {
    let mut handlers: HashMap<String, JobHandler> = HashMap::new();

    handlers.insert(
        reconcile::JOB_NAME.to_string(),
        job_handler(|state: Arc<AppState>| async move {
            let report = state.reconciliation_job().run().await;
            if report.aborted() {
                Err(JobError::from(report.to_string()))
            } else {
                Ok(report.to_string())
            }
        }),
    );

    handlers.insert(
        worklog_import::JOB_NAME.to_string(),
        job_handler(|state: Arc<AppState>| async move {
            let report = state.worklog_importer().run().await;
            if report.aborted() {
                Err(JobError::from(report.to_string()))
            } else {
                Ok(report.to_string())
            }
        }),
    );

    handlers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::AppConfig;
    use crate::email::{EmailQueue, RecordingMailer};
    use crate::tickets::memory_store::MemoryStore;
    use crate::tickets::remote::{
        RemoteError, RemoteTicketRecord, RemoteTicketing, RemoteWorklog, WorklogChannel,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EmptyRemote;

    #[async_trait]
    impl RemoteTicketing for EmptyRemote {
        async fn fetch_all(&self) -> Result<Vec<RemoteTicketRecord>, RemoteError> {
            Ok(Vec::new())
        }

        async fn fetch_worklogs(&self, _: &str) -> Result<Vec<RemoteWorklog>, RemoteError> {
            Ok(Vec::new())
        }

        async fn submit_interaction(&self, _: &str, _: &str, _: WorklogChannel, _: &str) -> bool {
            true
        }
    }

    fn scheduler() -> TaskScheduler {
        let mailer = Arc::new(RecordingMailer::new());
        let state = AppState::new(
            AppConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(EmptyRemote),
            mailer.clone(),
            Arc::new(EmailQueue::inline(mailer)),
        );
        TaskScheduler::new(Arc::new(state))
    }

    #[tokio::test]
    async fn test_default_jobs_are_registered() {
        let scheduler = scheduler();
        let summary = scheduler.run_now(reconcile::JOB_NAME).await.unwrap();
        assert!(summary.contains("fetched=0"));
        assert!(scheduler.run_now(worklog_import::JOB_NAME).await.is_ok());
    }

    #[tokio::test]
    async fn test_schedule_rejects_bad_input() {
        let scheduler = scheduler();
        assert!(matches!(
            scheduler.schedule(reconcile::JOB_NAME, "every five minutes").await,
            Err(SchedulerError::InvalidCron { .. })
        ));
        assert!(matches!(
            scheduler.schedule("cleanup", "0 * * * * *").await,
            Err(SchedulerError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn test_due_jobs_run_once_per_slot() {
        let scheduler = scheduler();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        scheduler
            .register_handler(
                "count",
                job_handler(move |_state: Arc<AppState>| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, JobError>("counted".to_string())
                    }
                }),
            )
            .await;
        let job = scheduler.schedule("count", "0 0 * * * *").await.unwrap();

        assert!(scheduler.check_and_run_jobs(job.next_run - chrono::Duration::seconds(1)).await.is_empty());
        assert_eq!(scheduler.check_and_run_jobs(job.next_run).await, vec!["count".to_string()]);
        assert!(scheduler.check_and_run_jobs(job.next_run).await.is_empty());

        let jobs = scheduler.list_scheduled_jobs().await;
        assert_eq!(jobs[0].last_run, Some(job.next_run));
        assert!(jobs[0].next_run > job.next_run);

        for _ in 0..50 {
            if runs.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_job_is_not_started() {
        let scheduler = scheduler();
        let job = scheduler.schedule(worklog_import::JOB_NAME, "0 0 * * * *").await.unwrap();
        scheduler.set_enabled(worklog_import::JOB_NAME, false).await.unwrap();
        assert!(scheduler.check_and_run_jobs(job.next_run).await.is_empty());
    }
}
