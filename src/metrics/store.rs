use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::notifications::body::truncate;
use crate::notifications::dispatcher::{DispatchBatch, ResultSink};
use crate::notifications::types::NotifyType;
use crate::storage::time::{format_timestamp, parse_timestamp};
use crate::storage::{SqliteStore, StoreError, StoreResult};

const MAX_ERROR_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricStatus {
    Success,
    Failed,
}

impl MetricStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricStatus::Success => "success",
            MetricStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> StoreResult<Self> {
        match value {
            "success" => Ok(MetricStatus::Success),
            "failed" => Ok(MetricStatus::Failed),
            other => Err(StoreError::QueryFailed(format!("invalid metric status '{other}'"))),
        }
    }
}

/// One destination outcome. Rows are append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMetric {
    pub id: String,
    /// The dispatch batch this outcome belongs to.
    pub job_id: Option<String>,
    pub scheduled_job_id: Option<String>,
    pub service_id: String,
    /// Always redacted.
    pub service_url: String,
    pub notification_type: NotifyType,
    pub status: MetricStatus,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl NotificationMetric {
    /// One metric per response in `batch`.
    pub fn from_batch(batch: &DispatchBatch) -> Vec<Self> {
        let now = Utc::now();
        let metadata = json!({
            "title_length": batch.title.chars().count(),
            "tags": batch.tags,
            "attempt": batch.attempt,
        });
        batch
            .responses
            .iter()
            .map(|response| NotificationMetric {
                id: uuid::Uuid::new_v4().to_string(),
                job_id: Some(batch.id.clone()),
                scheduled_job_id: batch.scheduled_job_id.clone(),
                service_id: response.service_id.clone(),
                service_url: response.service_url.clone(),
                notification_type: batch.notify_type,
                status: if response.success {
                    MetricStatus::Success
                } else {
                    MetricStatus::Failed
                },
                duration_ms: response.duration.as_millis() as u64,
                error_message: response
                    .error
                    .as_ref()
                    .map(|err| truncate(&err.to_string(), MAX_ERROR_LEN)),
                metadata: Some(metadata.clone()),
                timestamp: now,
            })
            .collect()
    }
}

/// Persistence for `notification_metrics`.
#[derive(Debug, Clone)]
pub struct MetricsStore {
    store: SqliteStore,
}

impl MetricsStore {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn insert(&self, metric: &NotificationMetric) -> StoreResult<()> {
        self.store.with_connection(|conn| insert_metric(conn, metric))
    }

    /// Insert every metric in one transaction.
    pub fn insert_all(&self, metrics: &[NotificationMetric]) -> StoreResult<()> {
        if metrics.is_empty() {
            return Ok(());
        }
        self.store.with_connection(|conn| {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            for metric in metrics {
                if let Err(err) = insert_metric(conn, metric) {
                    conn.execute_batch("ROLLBACK").ok();
                    return Err(err);
                }
            }
            conn.execute_batch("COMMIT")?;
            Ok(())
        })
    }

    /// Metrics recorded for one scheduled job, oldest first.
    pub fn for_scheduled_job(&self, scheduled_job_id: &str) -> StoreResult<Vec<NotificationMetric>> {
        self.store.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, job_id, scheduled_job_id, service_id, service_url, notification_type,
                        status, duration_ms, error_message, metadata, timestamp
                 FROM notification_metrics
                 WHERE scheduled_job_id = ?1
                 ORDER BY julianday(timestamp) ASC, rowid ASC",
            )?;
            let mut rows = stmt.query(params![scheduled_job_id])?;
            let mut metrics = Vec::new();
            while let Some(row) = rows.next()? {
                let notification_type: i64 = row.get(5)?;
                let status: String = row.get(6)?;
                let metadata: Option<String> = row.get(9)?;
                let timestamp: String = row.get(10)?;
                metrics.push(NotificationMetric {
                    id: row.get(0)?,
                    job_id: row.get(1)?,
                    scheduled_job_id: row.get(2)?,
                    service_id: row.get(3)?,
                    service_url: row.get(4)?,
                    notification_type: NotifyType::from_code(notification_type).unwrap_or_default(),
                    status: MetricStatus::parse(&status)?,
                    duration_ms: row.get::<_, i64>(7)?.max(0) as u64,
                    error_message: row.get(8)?,
                    metadata: metadata.map(|raw| serde_json::from_str(&raw)).transpose()?,
                    timestamp: parse_timestamp(&timestamp),
                });
            }
            Ok(metrics)
        })
    }
}

fn insert_metric(conn: &Connection, metric: &NotificationMetric) -> StoreResult<()> {
    let metadata = metric.metadata.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO notification_metrics
         (id, job_id, scheduled_job_id, service_id, service_url, notification_type, status,
          duration_ms, error_message, metadata, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            metric.id,
            metric.job_id,
            metric.scheduled_job_id,
            metric.service_id,
            metric.service_url,
            metric.notification_type.code(),
            metric.status.as_str(),
            metric.duration_ms as i64,
            metric.error_message,
            metadata,
            format_timestamp(metric.timestamp),
        ],
    )?;
    Ok(())
}

#[async_trait]
impl ResultSink for MetricsStore {
    async fn record(&self, batch: &DispatchBatch) {
        let metrics = NotificationMetric::from_batch(batch);
        if metrics.is_empty() {
            return;
        }
        let store = self.clone();
        let count = metrics.len();
        let batch_id = batch.id.clone();
        match tokio::task::spawn_blocking(move || store.insert_all(&metrics)).await {
            Ok(Ok(())) => tracing::debug!(event = "metrics_recorded", batch_id = %batch_id, count, "recorded notification metrics"),
            Ok(Err(err)) => tracing::warn!(
                event = "metrics_record_failed",
                batch_id = %batch_id,
                error = %err,
                "failed to record notification metrics"
            ),
            Err(err) => tracing::warn!(
                event = "metrics_record_failed",
                batch_id = %batch_id,
                error = %err,
                "metrics task failed"
            ),
        }
    }
}
