use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use herald::config::Config;
use herald::http::HttpPools;
use herald::metrics::{MetricStatus, MetricsReporter, MetricsStore};
use herald::notifications::{NotifyType, ServiceContext, ServiceRegistry};
use herald::scheduler::{AttachmentRef, JobStatus, NewJob, RequestSnapshot, SchedulerService};
use herald::storage::SqliteStore;

#[derive(Clone, Default)]
struct Hook {
    calls: Arc<AtomicUsize>,
    bodies: Arc<std::sync::Mutex<Vec<Value>>>,
}

/// Fails the first call, accepts the rest.
async fn flaky(State(hook): State<Hook>, Json(body): Json<Value>) -> StatusCode {
    let call = hook.calls.fetch_add(1, Ordering::SeqCst);
    hook.bodies.lock().unwrap().push(body);
    if call == 0 {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

async fn broken(State(hook): State<Hook>) -> StatusCode {
    hook.calls.fetch_add(1, Ordering::SeqCst);
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn serve(router: Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

struct Harness {
    scheduler: SchedulerService,
    database: SqliteStore,
    dir: std::path::PathBuf,
}

impl Drop for Harness {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.dir).ok();
    }
}

fn harness() -> Harness {
    let dir = std::env::temp_dir().join(format!("herald-lifecycle-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("herald.db");
    let raw = format!(
        r#"
[scheduler]
database_path = "{}"
tick_interval_secs = 1
job_timeout_secs = 5
retry_base_secs = 0
retry_max_secs = 0
"#,
        path.display()
    );
    let config = Config::from_toml_str(&raw).unwrap();
    let scheduler = SchedulerService::from_config(
        &config,
        Arc::new(ServiceRegistry::builtin()),
        ServiceContext::new(Arc::new(HttpPools::new())),
    )
    .unwrap();
    Harness {
        scheduler,
        database: SqliteStore::new(path.display().to_string()),
        dir,
    }
}

#[tokio::test]
async fn retries_then_succeeds_or_exhausts_and_records_metrics() {
    let flaky_hook = Hook::default();
    let broken_hook = Hook::default();
    let router = Router::new()
        .route("/flaky", post(flaky).with_state(flaky_hook.clone()))
        .route("/broken", post(broken).with_state(broken_hook.clone()));
    let addr = serve(router).await;
    let harness = harness();
    let started = Utc::now();

    let mut request = RequestSnapshot::new("Nightly", "backup report", NotifyType::Success);
    request.attachments.push(AttachmentRef::Inline {
        name: "report.txt".to_string(),
        mime: "text/plain".to_string(),
        data: "b2s=".to_string(),
    });
    let recovering = harness
        .scheduler
        .schedule(NewJob::new(request, [format!("json://{addr}/flaky")]).max_attempts(3))
        .await
        .unwrap();
    let failing = harness
        .scheduler
        .schedule(
            NewJob::new(
                RequestSnapshot::new("Nightly", "backup report", NotifyType::Error),
                [format!("json://{addr}/broken")],
            )
            .max_attempts(2),
        )
        .await
        .unwrap();

    let first = harness.scheduler.tick().await.unwrap();
    assert_eq!(first.claimed, 2);
    assert_eq!(first.retrying, 2);

    let second = harness.scheduler.tick().await.unwrap();
    assert_eq!(second.claimed, 2);
    assert_eq!(second.succeeded, 1);
    assert_eq!(second.exhausted, 1);

    let third = harness.scheduler.tick().await.unwrap();
    assert_eq!(third.claimed, 0);

    let recovered = harness.scheduler.get_job(&recovering.id).await.unwrap();
    assert_eq!(recovered.status, JobStatus::Succeeded);
    assert_eq!(recovered.attempts, 2);
    assert!(recovered.claim_id.is_none());

    let exhausted = harness.scheduler.get_job(&failing.id).await.unwrap();
    assert_eq!(exhausted.status, JobStatus::Exhausted);
    assert_eq!(exhausted.attempts, 2);
    assert!(exhausted.last_error.as_deref().unwrap_or_default().contains("500"));
    assert_eq!(broken_hook.calls.load(Ordering::SeqCst), 2);

    let bodies = flaky_hook.bodies.lock().unwrap().clone();
    assert_eq!(bodies.len(), 2);
    for body in &bodies {
        assert_eq!(body["type"], "success");
        assert_eq!(body["attachments"][0]["filename"], "report.txt");
        assert_eq!(body["attachments"][0]["base64"], "b2s=");
    }

    let metrics = MetricsStore::new(harness.database.clone());
    let history = metrics.for_scheduled_job(&recovering.id).unwrap();
    assert_eq!(history.len(), 2);
    let statuses: Vec<MetricStatus> = history.iter().map(|metric| metric.status).collect();
    assert!(statuses.contains(&MetricStatus::Failed));
    assert!(statuses.contains(&MetricStatus::Success));

    let report = MetricsReporter::new(harness.database.clone())
        .report(started - chrono::Duration::minutes(1), Utc::now() + chrono::Duration::minutes(1), 5)
        .unwrap();
    assert_eq!(report.total, 4);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 3);
    assert!((report.success_rate - 25.0).abs() < 1e-9);
    assert_eq!(report.services.len(), 1);
    assert_eq!(report.services[0].service_id, "json");
    assert!(!report.top_errors.is_empty());
}

#[tokio::test]
async fn future_jobs_wait_and_can_be_cancelled() {
    let harness = harness();
    let later = harness
        .scheduler
        .schedule(
            NewJob::new(
                RequestSnapshot::new("Later", "not yet", NotifyType::Info),
                ["json://127.0.0.1:9/unused"],
            )
            .at(Utc::now() + chrono::Duration::hours(1)),
        )
        .await
        .unwrap();

    let report = harness.scheduler.tick().await.unwrap();
    assert_eq!(report.claimed, 0);
    assert_eq!(
        harness.scheduler.list_jobs(Some(JobStatus::Pending)).await.unwrap().len(),
        1
    );

    assert!(harness.scheduler.cancel_job(&later.id).await.unwrap());
    let cancelled = harness.scheduler.get_job(&later.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Failed);
    assert_eq!(cancelled.last_error.as_deref(), Some("cancelled"));
    assert!(!harness.scheduler.cancel_job(&later.id).await.unwrap());
}

#[tokio::test]
async fn run_loop_delivers_due_jobs() {
    let hook = Hook::default();
    let router = Router::new().route(
        "/ok",
        post(|State(hook): State<Hook>| async move {
            hook.calls.fetch_add(1, Ordering::SeqCst);
            StatusCode::OK
        })
        .with_state(hook.clone()),
    );
    let addr = serve(router).await;
    let harness = harness();
    let job = harness
        .scheduler
        .schedule(NewJob::new(
            RequestSnapshot::new("Now", "deliver me", NotifyType::Info),
            [format!("json://{addr}/ok")],
        ))
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let scheduler = harness.scheduler.clone();
    let loop_token = shutdown.clone();
    let handle = tokio::spawn(async move { scheduler.run_loop(loop_token).await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = harness.scheduler.get_job(&job.id).await.unwrap();
        if current.status == JobStatus::Succeeded {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never ran");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
}
