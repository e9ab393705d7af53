use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, SchedulerConfig};
use crate::metrics::MetricsStore;
use crate::notifications::registry::ServiceRegistry;
use crate::notifications::service::ServiceContext;
use crate::notifications::url::ServiceUrl;
use crate::scheduler::error::{SchedulerError, SchedulerResult};
use crate::scheduler::executor::{JobExecutor, UrlDispatcher};
use crate::scheduler::job::{JobStatus, NewJob, ScheduledJob};
use crate::scheduler::store::JobStore;
use crate::storage::SqliteStore;

/// What one [`SchedulerService::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub retrying: usize,
    pub failed: usize,
    pub exhausted: usize,
}

impl TickReport {
    fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::Pending => self.retrying += 1,
            JobStatus::Exhausted => self.exhausted += 1,
            JobStatus::Failed | JobStatus::Running => self.failed += 1,
        }
    }
}

#[derive(Clone)]
pub struct SchedulerService {
    store: JobStore,
    executor: JobExecutor,
    config: SchedulerConfig,
    semaphore: Arc<Semaphore>,
}

impl SchedulerService {
    pub fn new(store: JobStore, executor: JobExecutor, config: SchedulerConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs()));
        Self {
            store,
            executor,
            config,
            semaphore,
        }
    }

    /// Wire a scheduler from configuration: jobs and metrics share one
    /// database, and jobs dispatch through `registry`.
    pub fn from_config(
        config: &Config,
        registry: Arc<ServiceRegistry>,
        context: ServiceContext,
    ) -> SchedulerResult<Self> {
        let scheduler = config.scheduler();
        let database = match scheduler.database_path() {
            Some(path) => SqliteStore::new(path),
            None => SqliteStore::default_location(),
        };
        database.touch()?;
        let store = JobStore::new(database.clone());
        let dispatcher = UrlDispatcher::new(registry, context).with_policy(config.attachments().policy());
        let executor = JobExecutor::new(store.clone(), Arc::new(dispatcher), &scheduler)
            .with_sink(Arc::new(MetricsStore::new(database)));
        Ok(Self::new(store, executor, scheduler))
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled()
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Persist a new job. It runs on the first tick at or after its
    /// `scheduled_for`, which defaults to now.
    pub async fn schedule(&self, new_job: NewJob) -> SchedulerResult<ScheduledJob> {
        if !self.enabled() {
            return Err(SchedulerError::Disabled);
        }
        let urls: Vec<String> = new_job
            .destination_urls
            .iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        if urls.is_empty() {
            return Err(SchedulerError::InvalidJob(
                "at least one destination URL is required".to_string(),
            ));
        }
        for url in &urls {
            ServiceUrl::parse(url).map_err(|err| SchedulerError::InvalidJob(err.to_string()))?;
        }
        let max_attempts = new_job
            .max_attempts
            .unwrap_or_else(|| self.config.default_max_attempts());
        if max_attempts == 0 {
            return Err(SchedulerError::InvalidJob(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let now = Utc::now();
        let job = ScheduledJob {
            id: uuid::Uuid::new_v4().to_string(),
            request: new_job.request,
            destination_urls: urls,
            created_at: now,
            scheduled_for: new_job.scheduled_for.unwrap_or(now),
            attempts: 0,
            max_attempts,
            retry_policy: new_job
                .retry_policy
                .unwrap_or_else(|| self.config.retry_policy()),
            status: JobStatus::Pending,
            last_error: None,
            claim_id: None,
            claim_expires_at: None,
            updated_at: now,
        };
        let stored = job.clone();
        self.blocking(move |store| store.insert(&stored)).await?;
        tracing::info!(
            event = "job_scheduled",
            job_id = %job.id,
            scheduled_for = %job.scheduled_for,
            destinations = job.destination_urls.len(),
            max_attempts = job.max_attempts,
            "notification scheduled"
        );
        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> SchedulerResult<ScheduledJob> {
        let id = id.to_string();
        let lookup = id.clone();
        self.blocking(move |store| store.get_job(&lookup))
            .await?
            .ok_or(SchedulerError::NotFound(id))
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>) -> SchedulerResult<Vec<ScheduledJob>> {
        self.blocking(move |store| store.list_jobs(status)).await
    }

    /// Stop a job. A pending job is marked failed with `cancelled`; a running
    /// one has its in-flight dispatch cancelled. Returns false when the job
    /// already finished.
    pub async fn cancel_job(&self, id: &str) -> SchedulerResult<bool> {
        if self.executor.cancel_job(id) {
            tracing::info!(event = "job_cancel_requested", job_id = %id, "cancelling running job");
            return Ok(true);
        }
        let target = id.to_string();
        let cancelled = self
            .blocking(move |store| store.cancel_pending(&target, Utc::now()))
            .await?;
        if cancelled {
            tracing::info!(event = "job_cancelled", job_id = %id, "pending job cancelled");
            return Ok(true);
        }
        // Distinguish "already done" from "never existed".
        self.get_job(id).await.map(|_| false)
    }

    /// Claim due jobs and run them, at most `max_concurrent_jobs` at a time.
    /// Returns once every claimed job has been written back.
    pub async fn tick(&self) -> SchedulerResult<TickReport> {
        if !self.enabled() {
            return Err(SchedulerError::Disabled);
        }
        let mut report = TickReport::default();
        let limit = self.semaphore.available_permits();
        if limit == 0 {
            return Ok(report);
        }
        let claim_id = uuid::Uuid::new_v4().to_string();
        let lease_secs = self.config.claim_lease_secs();
        let jobs = {
            let claim_id = claim_id.clone();
            self.blocking(move |store| store.claim_due_jobs(Utc::now(), limit, &claim_id, lease_secs))
                .await?
        };
        report.claimed = jobs.len();
        if jobs.is_empty() {
            return Ok(report);
        }
        tracing::debug!(event = "jobs_claimed", claim_id = %claim_id, count = jobs.len(), "claimed due jobs");

        let mut running = JoinSet::new();
        for job in jobs {
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let executor = self.executor.clone();
            running.spawn(async move {
                let _permit = permit;
                executor.execute(job).await
            });
        }
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(status) => report.record(status),
                Err(err) => {
                    // The claim lease expires and a later tick picks the job up again.
                    tracing::error!(event = "job_task_failed", error = %err, "scheduled job task aborted");
                }
            }
        }
        Ok(report)
    }

    /// Tick every `tick_interval_secs` until `shutdown` fires.
    pub async fn run_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.tick_interval_secs()));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            event = "scheduler_started",
            tick_interval_secs = self.config.tick_interval_secs(),
            max_concurrent_jobs = self.config.max_concurrent_jobs(),
            "scheduler loop started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if !self.enabled() {
                continue;
            }
            match self.tick().await {
                Ok(report) if report.claimed > 0 => tracing::info!(
                    event = "scheduler_tick",
                    claimed = report.claimed,
                    succeeded = report.succeeded,
                    retrying = report.retrying,
                    failed = report.failed,
                    exhausted = report.exhausted,
                    "scheduler tick finished"
                ),
                Ok(_) => {}
                Err(err) => tracing::error!(event = "scheduler_tick_failed", error = %err, "scheduler tick failed"),
            }
        }
        tracing::info!(event = "scheduler_stopped", "scheduler loop stopped");
    }

    async fn blocking<T, F>(&self, work: F) -> SchedulerResult<T>
    where
        F: FnOnce(JobStore) -> SchedulerResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || work(store))
            .await
            .map_err(|err| SchedulerError::Store(format!("store task failed: {err}")))?
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    use super::*;
    use crate::notifications::dispatcher::{DispatchBatch, Response};
    use crate::notifications::error::NotifyResult;
    use crate::notifications::types::NotifyType;
    use crate::scheduler::executor::JobDispatcher;
    use crate::scheduler::job::RequestSnapshot;

    struct AlwaysDelivers;

    #[async_trait]
    impl JobDispatcher for AlwaysDelivers {
        async fn dispatch(
            &self,
            job: &ScheduledJob,
            _cancel: CancellationToken,
            _timeout: Duration,
        ) -> NotifyResult<DispatchBatch> {
            Ok(DispatchBatch {
                id: Uuid::new_v4().to_string(),
                scheduled_job_id: None,
                attempt: 1,
                notify_type: job.request.notify_type,
                title: job.request.title.clone(),
                tags: job.request.tags.clone(),
                responses: job
                    .destination_urls
                    .iter()
                    .map(|url| Response {
                        service_id: "json".to_string(),
                        service_url: url.clone(),
                        success: true,
                        error: None,
                        duration: Duration::from_millis(1),
                    })
                    .collect(),
            })
        }
    }

    fn service(config: SchedulerConfig) -> (SchedulerService, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("herald-sched-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let database = SqliteStore::new(dir.join("herald.db").to_string_lossy().to_string());
        database.touch().unwrap();
        let store = JobStore::new(database);
        let executor = JobExecutor::new(store.clone(), Arc::new(AlwaysDelivers), &config);
        (SchedulerService::new(store, executor, config), dir)
    }

    fn snapshot() -> RequestSnapshot {
        RequestSnapshot::new("deploy", "v2 is live", NotifyType::Success)
    }

    #[tokio::test]
    async fn schedule_validates_input() {
        let (scheduler, dir) = service(SchedulerConfig::default());
        assert!(matches!(
            scheduler.schedule(NewJob::new(snapshot(), ["  "])).await,
            Err(SchedulerError::InvalidJob(_))
        ));
        assert!(matches!(
            scheduler
                .schedule(NewJob::new(snapshot(), ["json://localhost/hook"]).max_attempts(0))
                .await,
            Err(SchedulerError::InvalidJob(_))
        ));
        assert!(matches!(
            scheduler.schedule(NewJob::new(snapshot(), ["not a url"])).await,
            Err(SchedulerError::InvalidJob(_))
        ));
        let job = scheduler
            .schedule(NewJob::new(snapshot(), ["json://localhost/hook"]))
            .await
            .unwrap();
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.status, JobStatus::Pending);
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn disabled_scheduler_refuses_work() {
        let config = SchedulerConfig {
            enabled: Some(false),
            ..SchedulerConfig::default()
        };
        let (scheduler, dir) = service(config);
        assert!(matches!(
            scheduler.schedule(NewJob::new(snapshot(), ["json://localhost/hook"])).await,
            Err(SchedulerError::Disabled)
        ));
        assert!(matches!(scheduler.tick().await, Err(SchedulerError::Disabled)));
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn tick_runs_only_due_jobs() {
        let (scheduler, dir) = service(SchedulerConfig::default());
        let due = scheduler
            .schedule(NewJob::new(snapshot(), ["json://localhost/hook"]))
            .await
            .unwrap();
        let later = scheduler
            .schedule(NewJob::new(snapshot(), ["json://localhost/hook"]).at(Utc::now() + ChronoDuration::hours(1)))
            .await
            .unwrap();

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(scheduler.get_job(&due.id).await.unwrap().status, JobStatus::Succeeded);
        assert_eq!(scheduler.get_job(&later.id).await.unwrap().status, JobStatus::Pending);
        assert_eq!(scheduler.tick().await.unwrap(), TickReport::default());
        assert_eq!(scheduler.list_jobs(Some(JobStatus::Pending)).await.unwrap().len(), 1);
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn cancel_pending_and_unknown_jobs() {
        let (scheduler, dir) = service(SchedulerConfig::default());
        let job = scheduler
            .schedule(NewJob::new(snapshot(), ["json://localhost/hook"]).at(Utc::now() + ChronoDuration::hours(1)))
            .await
            .unwrap();
        assert!(scheduler.cancel_job(&job.id).await.unwrap());
        let cancelled = scheduler.get_job(&job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert_eq!(cancelled.last_error.as_deref(), Some("cancelled"));
        assert!(!scheduler.cancel_job(&job.id).await.unwrap());
        assert!(matches!(
            scheduler.cancel_job("missing").await,
            Err(SchedulerError::NotFound(_))
        ));
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown() {
        let config = SchedulerConfig {
            tick_interval_secs: Some(1),
            ..SchedulerConfig::default()
        };
        let (scheduler, dir) = service(config);
        let job = scheduler
            .schedule(NewJob::new(snapshot(), ["json://localhost/hook"]))
            .await
            .unwrap();
        let shutdown = CancellationToken::new();
        let handle = {
            let scheduler = scheduler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run_loop(shutdown).await })
        };
        // The first interval tick fires immediately.
        for _ in 0..100 {
            if scheduler.get_job(&job.id).await.unwrap().status == JobStatus::Succeeded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(scheduler.get_job(&job.id).await.unwrap().status, JobStatus::Succeeded);
        shutdown.cancel();
        handle.await.unwrap();
        fs::remove_dir_all(&dir).ok();
    }
}
