use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::attachments::AttachmentPolicy;
use crate::config::SchedulerConfig;
use crate::notifications::body::truncate;
use crate::notifications::dispatcher::{DispatchBatch, Dispatcher, NotifyOptions, Response, ResultSink};
use crate::notifications::error::{NotifyError, NotifyResult};
use crate::notifications::registry::ServiceRegistry;
use crate::notifications::service::ServiceContext;
use crate::notifications::url::redact;
use crate::scheduler::job::{JobStatus, ScheduledJob};
use crate::scheduler::store::JobStore;

const MAX_ERROR_LEN: usize = 512;
const SETTLE_GRACE: Duration = Duration::from_secs(5);

/// The one thing the scheduler needs from the dispatch engine.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Send the job's request to its destination URLs. The batch holds one
    /// response per URL, in URL order.
    async fn dispatch(
        &self,
        job: &ScheduledJob,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> NotifyResult<DispatchBatch>;
}

/// Builds a fresh [`Dispatcher`] for every job from its stored URLs.
#[derive(Clone)]
pub struct UrlDispatcher {
    registry: Arc<ServiceRegistry>,
    context: ServiceContext,
    policy: AttachmentPolicy,
}

impl UrlDispatcher {
    pub fn new(registry: Arc<ServiceRegistry>, context: ServiceContext) -> Self {
        Self {
            registry,
            context,
            policy: AttachmentPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: AttachmentPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl Default for UrlDispatcher {
    fn default() -> Self {
        Self::new(ServiceRegistry::global(), ServiceContext::default())
    }
}

#[async_trait]
impl JobDispatcher for UrlDispatcher {
    async fn dispatch(
        &self,
        job: &ScheduledJob,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> NotifyResult<DispatchBatch> {
        let snapshot = &job.request;
        let mut dispatcher = Dispatcher::with_registry(Arc::clone(&self.registry), self.context.clone());
        dispatcher.attachments().set_max_size(self.policy.max_size);
        dispatcher.attachments().set_fetch_timeout(self.policy.fetch_timeout);
        for stored in &snapshot.attachments {
            stored.restore(dispatcher.attachments()).await?;
        }

        // A URL that no longer parses fails only its own slot.
        let mut rejected: Vec<Option<Response>> = Vec::with_capacity(job.destination_urls.len());
        for url in &job.destination_urls {
            match dispatcher.add(url, snapshot.tags.iter().cloned()) {
                Ok(()) => rejected.push(None),
                Err(err) => {
                    tracing::warn!(
                        event = "scheduled_url_rejected",
                        job_id = %job.id,
                        url = %redact(url),
                        error = %err,
                        "stored destination URL could not be configured"
                    );
                    rejected.push(Some(rejected_response(url, err)));
                }
            }
        }

        let mut options = NotifyOptions::new()
            .tags(snapshot.tags.iter().cloned())
            .cancel_token(cancel)
            .timeout(timeout);
        if let Some(format) = snapshot.body_format {
            options = options.body_format(format);
        }
        if let Some(url) = &snapshot.url {
            options = options.url(url.clone());
        }
        let mut batch = dispatcher
            .notify_batch(&snapshot.title, &snapshot.body, snapshot.notify_type, options)
            .await;

        let mut delivered = std::mem::take(&mut batch.responses).into_iter();
        batch.responses = rejected
            .into_iter()
            .filter_map(|slot| slot.or_else(|| delivered.next()))
            .collect();
        Ok(batch)
    }
}

fn rejected_response(url: &str, err: NotifyError) -> Response {
    let service_id = url
        .split_once("://")
        .map(|(scheme, _)| scheme.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    Response {
        service_id,
        service_url: redact(url),
        success: false,
        error: Some(err),
        duration: Duration::ZERO,
    }
}

#[derive(Clone)]
pub struct JobExecutor {
    store: JobStore,
    dispatcher: Arc<dyn JobDispatcher>,
    sink: Option<Arc<dyn ResultSink>>,
    job_timeout: Duration,
    running: Arc<DashMap<String, CancellationToken>>,
}

impl JobExecutor {
    pub fn new(store: JobStore, dispatcher: Arc<dyn JobDispatcher>, config: &SchedulerConfig) -> Self {
        Self {
            store,
            dispatcher,
            sink: None,
            job_timeout: Duration::from_secs(config.job_timeout_secs()),
            running: Arc::new(DashMap::new()),
        }
    }

    /// Where per-destination outcomes are recorded.
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.running.contains_key(job_id)
    }

    pub fn cancel_job(&self, job_id: &str) -> bool {
        if let Some(entry) = self.running.get(job_id) {
            entry.cancel();
            true
        } else {
            false
        }
    }

    /// Run one claimed job and write back its new state. Returns the status
    /// the job was left in.
    pub async fn execute(&self, mut job: ScheduledJob) -> JobStatus {
        let claim_id = job.claim_id.clone().unwrap_or_default();
        let attempt = job.attempts.saturating_add(1);
        tracing::info!(
            event = "job_started",
            job_id = %job.id,
            attempt,
            max_attempts = job.max_attempts,
            destinations = job.destination_urls.len(),
            "running scheduled notification"
        );

        let outcome = if job.destination_urls.is_empty() {
            ExecutionOutcome::Unroutable
        } else {
            self.run(&job, attempt).await
        };

        let now = Utc::now();
        match outcome {
            ExecutionOutcome::Dispatched(batch) => match failure_summary(&batch) {
                None => {
                    job.attempts = attempt;
                    job.status = JobStatus::Succeeded;
                    job.last_error = None;
                }
                Some(error) => retry_or_exhaust(&mut job, attempt, error, now),
            },
            ExecutionOutcome::Failed { error } => retry_or_exhaust(&mut job, attempt, error, now),
            ExecutionOutcome::Timeout => retry_or_exhaust(
                &mut job,
                attempt,
                format!("job timed out after {}s", self.job_timeout.as_secs_f64()),
                now,
            ),
            ExecutionOutcome::Cancelled => {
                job.attempts = attempt;
                job.status = JobStatus::Failed;
                job.last_error = Some("cancelled".to_string());
            }
            ExecutionOutcome::Unroutable => {
                job.status = JobStatus::Failed;
                job.last_error = Some("job has no destination URLs".to_string());
            }
        }
        job.claim_id = None;
        job.claim_expires_at = None;
        job.updated_at = now;

        match job.status {
            JobStatus::Succeeded => {
                tracing::info!(event = "job_succeeded", job_id = %job.id, attempt, "scheduled notification delivered")
            }
            JobStatus::Pending => tracing::warn!(
                event = "job_retry_scheduled",
                job_id = %job.id,
                attempt,
                retry_at = %job.scheduled_for,
                error = job.last_error.as_deref().unwrap_or_default(),
                "scheduled notification failed; retrying later"
            ),
            status => tracing::warn!(
                event = "job_finished",
                job_id = %job.id,
                attempt,
                status = %status,
                error = job.last_error.as_deref().unwrap_or_default(),
                "scheduled notification gave up"
            ),
        }

        let status = job.status;
        self.persist(job, claim_id).await;
        status
    }

    async fn run(&self, job: &ScheduledJob, attempt: u32) -> ExecutionOutcome {
        let token = CancellationToken::new();
        self.running.insert(job.id.clone(), token.clone());

        // The dispatcher enforces the job timeout itself; the outer limit only
        // catches a dispatcher that never returns.
        let hard_limit = self.job_timeout + self.job_timeout.min(SETTLE_GRACE);
        let result = tokio::time::timeout(
            hard_limit,
            self.dispatcher.dispatch(job, token.clone(), self.job_timeout),
        )
        .await;
        self.running.remove(&job.id);

        match result {
            Err(_) => ExecutionOutcome::Timeout,
            Ok(Err(err)) => ExecutionOutcome::Failed {
                error: truncate(&err.to_string(), MAX_ERROR_LEN),
            },
            Ok(Ok(mut batch)) => {
                batch.scheduled_job_id = Some(job.id.clone());
                batch.attempt = attempt;
                if let Some(sink) = &self.sink {
                    sink.record(&batch).await;
                }
                if token.is_cancelled() {
                    ExecutionOutcome::Cancelled
                } else {
                    ExecutionOutcome::Dispatched(batch)
                }
            }
        }
    }

    async fn persist(&self, job: ScheduledJob, claim_id: String) {
        let store = self.store.clone();
        let job_id = job.id.clone();
        let result = tokio::task::spawn_blocking(move || store.update_claimed(&job, &claim_id)).await;
        match result {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => tracing::warn!(
                event = "job_claim_lost",
                job_id = %job_id,
                "job was reclaimed by another worker; result not written"
            ),
            Ok(Err(err)) => tracing::error!(
                event = "job_update_failed",
                job_id = %job_id,
                error = %err,
                "failed to persist job state"
            ),
            Err(err) => tracing::error!(
                event = "job_update_failed",
                job_id = %job_id,
                error = %err,
                "job store task failed"
            ),
        }
    }
}

#[derive(Debug)]
enum ExecutionOutcome {
    Dispatched(DispatchBatch),
    Failed { error: String },
    Timeout,
    Cancelled,
    Unroutable,
}

/// `None` when every destination succeeded.
fn failure_summary(batch: &DispatchBatch) -> Option<String> {
    if batch.responses.is_empty() {
        return Some("no destination accepted the notification".to_string());
    }
    let failures: Vec<String> = batch
        .responses
        .iter()
        .filter(|response| !response.success)
        .map(|response| match &response.error {
            Some(err) => format!("{}: {err}", response.service_id),
            None => format!("{}: failed", response.service_id),
        })
        .collect();
    if failures.is_empty() {
        None
    } else {
        Some(truncate(&failures.join("; "), MAX_ERROR_LEN))
    }
}

fn retry_or_exhaust(job: &mut ScheduledJob, attempt: u32, error: String, now: chrono::DateTime<Utc>) {
    job.attempts = attempt;
    job.last_error = Some(error);
    if attempt < job.max_attempts {
        let delay = job.retry_policy.backoff(attempt);
        job.status = JobStatus::Pending;
        job.scheduled_for = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
    } else {
        job.status = JobStatus::Exhausted;
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Mutex;

    use uuid::Uuid;

    use super::*;
    use crate::http::HttpPools;
    use crate::notifications::registry::ServiceEntry;
    use crate::notifications::service::NotificationService;
    use crate::notifications::types::{NotificationRequest, NotifyType};
    use crate::notifications::url::ServiceUrl;
    use crate::scheduler::job::{RequestSnapshot, RetryPolicy};
    use crate::storage::SqliteStore;

    /// Succeeds unless told to fail, optionally after a delay.
    struct ScriptedDispatcher {
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl JobDispatcher for ScriptedDispatcher {
        async fn dispatch(
            &self,
            job: &ScheduledJob,
            cancel: CancellationToken,
            _timeout: Duration,
        ) -> NotifyResult<DispatchBatch> {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.delay) => {}
            }
            let responses = job
                .destination_urls
                .iter()
                .map(|url| Response {
                    service_id: "json".to_string(),
                    service_url: url.clone(),
                    success: !self.fail,
                    error: self.fail.then(|| NotifyError::Provider {
                        status: 503,
                        body: "down".to_string(),
                    }),
                    duration: Duration::from_millis(3),
                })
                .collect();
            Ok(DispatchBatch {
                id: Uuid::new_v4().to_string(),
                scheduled_job_id: None,
                attempt: 1,
                notify_type: job.request.notify_type,
                title: job.request.title.clone(),
                tags: job.request.tags.clone(),
                responses,
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<DispatchBatch>>,
    }

    #[async_trait]
    impl ResultSink for RecordingSink {
        async fn record(&self, batch: &DispatchBatch) {
            if let Ok(mut batches) = self.batches.lock() {
                batches.push(batch.clone());
            }
        }
    }

    fn temp_store() -> (JobStore, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("herald-exec-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let store = SqliteStore::new(dir.join("herald.db").to_string_lossy().to_string());
        store.touch().unwrap();
        (JobStore::new(store), dir)
    }

    fn claimed(store: &JobStore, urls: Vec<String>, max_attempts: u32) -> ScheduledJob {
        let now = Utc::now();
        let job = ScheduledJob {
            id: Uuid::new_v4().to_string(),
            request: RequestSnapshot::new("backup", "nightly backup failed", NotifyType::Error),
            destination_urls: urls,
            created_at: now,
            scheduled_for: now,
            attempts: 0,
            max_attempts,
            retry_policy: RetryPolicy {
                base_delay_secs: 60,
                max_delay_secs: 600,
            },
            status: JobStatus::Pending,
            last_error: None,
            claim_id: None,
            claim_expires_at: None,
            updated_at: now,
        };
        store.insert(&job).unwrap();
        let mut jobs = store.claim_due_jobs(now, 10, "claim", 60).unwrap();
        jobs.retain(|claimed| claimed.id == job.id);
        jobs.remove(0)
    }

    fn executor(store: &JobStore, fail: bool, delay: Duration) -> (JobExecutor, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let executor = JobExecutor::new(
            store.clone(),
            Arc::new(ScriptedDispatcher { fail, delay }),
            &SchedulerConfig::default(),
        )
        .with_sink(sink.clone());
        (executor, sink)
    }

    #[tokio::test]
    async fn success_records_metrics_and_finishes() {
        let (store, dir) = temp_store();
        let (executor, sink) = executor(&store, false, Duration::ZERO);
        let job = claimed(&store, vec!["json://a/hook".into(), "json://b/hook".into()], 3);
        assert_eq!(executor.execute(job.clone()).await, JobStatus::Succeeded);

        let stored = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(stored.attempts, 1);
        assert!(stored.claim_id.is_none());
        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].scheduled_job_id.as_deref(), Some(job.id.as_str()));
        assert_eq!(batches[0].attempt, 1);
        assert_eq!(batches[0].responses.len(), 2);
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn failures_back_off_then_exhaust() {
        let (store, dir) = temp_store();
        let (executor, _) = executor(&store, true, Duration::ZERO);
        let job = claimed(&store, vec!["json://a/hook".into()], 2);
        let before = Utc::now();
        assert_eq!(executor.execute(job.clone()).await, JobStatus::Pending);
        let retried = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(retried.attempts, 1);
        assert!(retried.scheduled_for >= before + chrono::Duration::seconds(60));
        assert!(retried.scheduled_for <= Utc::now() + chrono::Duration::seconds(90));
        assert!(retried.last_error.as_ref().unwrap().contains("503"));

        let mut again = retried.clone();
        again.status = JobStatus::Running;
        again.claim_id = Some("claim-2".to_string());
        store.insert(&again).unwrap();
        assert_eq!(executor.execute(again).await, JobStatus::Exhausted);
        assert_eq!(store.get_job(&job.id).unwrap().unwrap().attempts, 2);
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn job_without_urls_fails_outright() {
        let (store, dir) = temp_store();
        let (executor, sink) = executor(&store, false, Duration::ZERO);
        let job = claimed(&store, Vec::new(), 3);
        assert_eq!(executor.execute(job.clone()).await, JobStatus::Failed);
        assert_eq!(store.get_job(&job.id).unwrap().unwrap().attempts, 0);
        assert!(sink.batches.lock().unwrap().is_empty());
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn running_job_can_be_cancelled() {
        let (store, dir) = temp_store();
        let (executor, _) = executor(&store, false, Duration::from_secs(30));
        let job = claimed(&store, vec!["json://a/hook".into()], 3);
        let handle = {
            let executor = executor.clone();
            let job = job.clone();
            tokio::spawn(async move { executor.execute(job).await })
        };
        while !executor.is_running(&job.id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(executor.cancel_job(&job.id));
        assert_eq!(handle.await.unwrap(), JobStatus::Failed);
        let stored = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(stored.last_error.as_deref(), Some("cancelled"));
        assert!(!executor.cancel_job(&job.id));
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn stuck_dispatcher_times_out() {
        let (store, dir) = temp_store();
        let (executor, _) = executor(&store, false, Duration::from_secs(30));
        let executor = executor.with_job_timeout(Duration::from_millis(50));
        let job = claimed(&store, vec!["json://a/hook".into()], 1);
        assert_eq!(executor.execute(job.clone()).await, JobStatus::Exhausted);
        let stored = store.get_job(&job.id).unwrap().unwrap();
        assert!(stored.last_error.unwrap().contains("timed out"));
        fs::remove_dir_all(&dir).ok();
    }

    struct EchoService;

    #[async_trait]
    impl NotificationService for EchoService {
        fn id(&self) -> &'static str {
            "echo"
        }

        fn parse_url(&mut self, _url: &ServiceUrl) -> NotifyResult<()> {
            Ok(())
        }

        async fn send(&self, _request: &NotificationRequest) -> NotifyResult<()> {
            Ok(())
        }

        fn to_url(&self) -> String {
            "echo://x".to_string()
        }
    }

    #[tokio::test]
    async fn url_dispatcher_keeps_rejected_urls_in_order() {
        let registry = ServiceRegistry::new();
        registry
            .register(ServiceEntry::new("Echo", &["echo"], |_| Box::new(EchoService)))
            .unwrap();
        let dispatcher = UrlDispatcher::new(
            Arc::new(registry),
            ServiceContext::new(Arc::new(HttpPools::new())),
        );
        let (store, dir) = temp_store();
        let mut job = claimed(
            &store,
            vec!["echo://one".into(), "nope://two".into(), "echo://three".into()],
            1,
        );
        job.request.tags.insert("ops".to_string());
        let batch = dispatcher
            .dispatch(&job, CancellationToken::new(), Duration::from_secs(5))
            .await
            .unwrap();
        let outcomes: Vec<(&str, bool)> = batch
            .responses
            .iter()
            .map(|response| (response.service_id.as_str(), response.success))
            .collect();
        assert_eq!(outcomes, vec![("echo", true), ("nope", false), ("echo", true)]);
        assert!(matches!(batch.responses[1].error, Some(NotifyError::UnknownScheme(_))));
        fs::remove_dir_all(&dir).ok();
    }
}
