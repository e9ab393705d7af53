use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::scheduler::error::SchedulerResult;
use crate::scheduler::job::{JobStatus, ScheduledJob};
use crate::storage::time::{format_timestamp, parse_optional, parse_timestamp};
use crate::storage::{SqliteStore, StoreError, StoreResult};

const JOB_COLUMNS: &str = "id, request_json, destination_urls_json, created_at, scheduled_for,
    attempts, max_attempts, retry_policy_json, status, last_error, claim_id, claim_expires_at,
    updated_at";

/// Persistence for `notification_jobs`.
#[derive(Debug, Clone)]
pub struct JobStore {
    store: SqliteStore,
}

impl JobStore {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn insert(&self, job: &ScheduledJob) -> SchedulerResult<()> {
        self.store.with_connection(|conn| write_job(conn, job))?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> SchedulerResult<Option<ScheduledJob>> {
        Ok(self.store.with_connection(|conn| load_job(conn, id))?)
    }

    /// Newest first.
    pub fn list_jobs(&self, status: Option<JobStatus>) -> SchedulerResult<Vec<ScheduledJob>> {
        let jobs = self.store.with_connection(|conn| {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM notification_jobs
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY created_at DESC, id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![status.map(|status| status.as_str())])?;
            let mut jobs = Vec::new();
            while let Some(row) = rows.next()? {
                jobs.push(job_from_row(row)?);
            }
            Ok(jobs)
        })?;
        Ok(jobs)
    }

    /// Claim up to `limit` jobs that are due, or whose previous claim lease
    /// ran out, and mark them running under `claim_id`.
    pub fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claim_id: &str,
        lease_secs: u64,
    ) -> SchedulerResult<Vec<ScheduledJob>> {
        let now_value = format_timestamp(now);
        let expires_at = format_timestamp(now + chrono::Duration::seconds(lease_secs as i64));
        let jobs = self.store.with_connection(|conn| {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let claimed = claim_rows(conn, &now_value, &expires_at, limit, claim_id);
            match claimed {
                Ok(ids) => {
                    conn.execute_batch("COMMIT")?;
                    let mut jobs = Vec::with_capacity(ids.len());
                    for id in ids {
                        if let Some(job) = load_job(conn, &id)? {
                            jobs.push(job);
                        }
                    }
                    Ok(jobs)
                }
                Err(err) => {
                    conn.execute_batch("ROLLBACK").ok();
                    Err(err)
                }
            }
        })?;
        Ok(jobs)
    }

    /// Write back a job this worker still holds. Returns false when the claim
    /// was lost to another worker and nothing was written.
    pub fn update_claimed(&self, job: &ScheduledJob, claim_id: &str) -> SchedulerResult<bool> {
        let updated = self.store.with_connection(|conn| {
            let changed = conn.execute(
                "UPDATE notification_jobs
                 SET attempts = ?1, status = ?2, scheduled_for = ?3, last_error = ?4,
                     claim_id = ?5, claim_expires_at = ?6, updated_at = ?7
                 WHERE id = ?8 AND claim_id = ?9",
                params![
                    job.attempts as i64,
                    job.status.as_str(),
                    format_timestamp(job.scheduled_for),
                    job.last_error,
                    job.claim_id,
                    job.claim_expires_at.map(format_timestamp),
                    format_timestamp(job.updated_at),
                    job.id,
                    claim_id,
                ],
            )?;
            Ok(changed == 1)
        })?;
        Ok(updated)
    }

    /// Mark a pending job failed with `last_error = "cancelled"`. Returns
    /// false if the job does not exist or is no longer pending.
    pub fn cancel_pending(&self, id: &str, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let cancelled = self.store.with_connection(|conn| {
            let changed = conn.execute(
                "UPDATE notification_jobs
                 SET status = 'failed', last_error = 'cancelled', claim_id = NULL,
                     claim_expires_at = NULL, updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![format_timestamp(now), id],
            )?;
            Ok(changed == 1)
        })?;
        Ok(cancelled)
    }
}

fn claim_rows(
    conn: &Connection,
    now: &str,
    expires_at: &str,
    limit: usize,
    claim_id: &str,
) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM notification_jobs
         WHERE (status = 'pending' AND julianday(scheduled_for) <= julianday(?1))
            OR (status = 'running'
                AND (claim_expires_at IS NULL OR julianday(claim_expires_at) <= julianday(?1)))
         ORDER BY julianday(scheduled_for) ASC, id ASC
         LIMIT ?2",
    )?;
    let ids = stmt
        .query_map(params![now, limit as i64], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut claimed = Vec::with_capacity(ids.len());
    for id in ids {
        let updated = conn.execute(
            "UPDATE notification_jobs
             SET status = 'running', claim_id = ?1, claim_expires_at = ?2, updated_at = ?3
             WHERE id = ?4",
            params![claim_id, expires_at, now, id],
        )?;
        if updated == 1 {
            claimed.push(id);
        }
    }
    Ok(claimed)
}

fn write_job(conn: &Connection, job: &ScheduledJob) -> StoreResult<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO notification_jobs ({JOB_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ),
        params![
            job.id,
            serde_json::to_string(&job.request)?,
            serde_json::to_string(&job.destination_urls)?,
            format_timestamp(job.created_at),
            format_timestamp(job.scheduled_for),
            job.attempts as i64,
            job.max_attempts as i64,
            serde_json::to_string(&job.retry_policy)?,
            job.status.as_str(),
            job.last_error,
            job.claim_id,
            job.claim_expires_at.map(format_timestamp),
            format_timestamp(job.updated_at),
        ],
    )?;
    Ok(())
}

fn load_job(conn: &Connection, id: &str) -> StoreResult<Option<ScheduledJob>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM notification_jobs WHERE id = ?1");
    let raw = conn
        .query_row(&sql, params![id], |row| Ok(RawJob::read(row)))
        .optional()?;
    raw.transpose()?.map(RawJob::into_job).transpose()
}

fn job_from_row(row: &Row<'_>) -> StoreResult<ScheduledJob> {
    RawJob::read(row)?.into_job()
}

/// Column values before JSON and timestamp decoding.
struct RawJob {
    id: String,
    request_json: String,
    destination_urls_json: String,
    created_at: String,
    scheduled_for: String,
    attempts: i64,
    max_attempts: i64,
    retry_policy_json: String,
    status: String,
    last_error: Option<String>,
    claim_id: Option<String>,
    claim_expires_at: Option<String>,
    updated_at: String,
}

impl RawJob {
    fn read(row: &Row<'_>) -> StoreResult<Self> {
        Ok(Self {
            id: row.get(0)?,
            request_json: row.get(1)?,
            destination_urls_json: row.get(2)?,
            created_at: row.get(3)?,
            scheduled_for: row.get(4)?,
            attempts: row.get(5)?,
            max_attempts: row.get(6)?,
            retry_policy_json: row.get(7)?,
            status: row.get(8)?,
            last_error: row.get(9)?,
            claim_id: row.get(10)?,
            claim_expires_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_job(self) -> StoreResult<ScheduledJob> {
        let status = self
            .status
            .parse::<JobStatus>()
            .map_err(StoreError::QueryFailed)?;
        Ok(ScheduledJob {
            id: self.id,
            request: serde_json::from_str(&self.request_json)?,
            destination_urls: serde_json::from_str(&self.destination_urls_json)?,
            created_at: parse_timestamp(&self.created_at),
            scheduled_for: parse_timestamp(&self.scheduled_for),
            attempts: self.attempts.max(0) as u32,
            max_attempts: self.max_attempts.max(0) as u32,
            retry_policy: serde_json::from_str(&self.retry_policy_json)?,
            status,
            last_error: self.last_error,
            claim_id: self.claim_id,
            claim_expires_at: parse_optional(self.claim_expires_at),
            updated_at: parse_timestamp(&self.updated_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::Duration;
    use uuid::Uuid;

    use super::*;
    use crate::notifications::types::NotifyType;
    use crate::scheduler::job::{RequestSnapshot, RetryPolicy};

    fn temp_store() -> (JobStore, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("herald-jobs-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("herald.db");
        let store = SqliteStore::new(path.to_string_lossy().to_string());
        store.touch().unwrap();
        (JobStore::new(store), dir)
    }

    fn job(id: &str, scheduled_for: DateTime<Utc>) -> ScheduledJob {
        let now = Utc::now();
        ScheduledJob {
            id: id.to_string(),
            request: RequestSnapshot::new("disk", "almost full", NotifyType::Warning),
            destination_urls: vec!["json://localhost/hook".to_string()],
            created_at: now,
            scheduled_for,
            attempts: 0,
            max_attempts: 3,
            retry_policy: RetryPolicy::default(),
            status: JobStatus::Pending,
            last_error: None,
            claim_id: None,
            claim_expires_at: None,
            updated_at: now,
        }
    }

    #[test]
    fn insert_and_load_round_trip() {
        let (store, dir) = temp_store();
        let original = job("a", Utc::now());
        store.insert(&original).unwrap();
        let loaded = store.get_job("a").unwrap().unwrap();
        assert_eq!(loaded.request, original.request);
        assert_eq!(loaded.destination_urls, original.destination_urls);
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.scheduled_for.timestamp_millis(), original.scheduled_for.timestamp_millis());
        assert!(store.get_job("missing").unwrap().is_none());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn claims_only_due_jobs_once() {
        let (store, dir) = temp_store();
        let now = Utc::now();
        store.insert(&job("due", now - Duration::seconds(5))).unwrap();
        store.insert(&job("later", now + Duration::hours(1))).unwrap();

        let first = store.claim_due_jobs(now, 10, "claim-1", 60).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, "due");
        assert_eq!(first[0].status, JobStatus::Running);
        assert_eq!(first[0].claim_id.as_deref(), Some("claim-1"));

        let second = store.claim_due_jobs(now, 10, "claim-2", 60).unwrap();
        assert!(second.is_empty());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn expired_lease_can_be_reclaimed() {
        let (store, dir) = temp_store();
        let now = Utc::now();
        store.insert(&job("stuck", now - Duration::seconds(5))).unwrap();
        let first = store.claim_due_jobs(now, 10, "claim-1", 30).unwrap();
        assert_eq!(first.len(), 1);

        let later = now + Duration::seconds(31);
        let reclaimed = store.claim_due_jobs(later, 10, "claim-2", 30).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].claim_id.as_deref(), Some("claim-2"));

        // The first worker lost its claim and cannot write back.
        let mut stale = first[0].clone();
        stale.status = JobStatus::Succeeded;
        assert!(!store.update_claimed(&stale, "claim-1").unwrap());
        let mut current = reclaimed[0].clone();
        current.status = JobStatus::Succeeded;
        current.claim_id = None;
        assert!(store.update_claimed(&current, "claim-2").unwrap());
        assert_eq!(store.get_job("stuck").unwrap().unwrap().status, JobStatus::Succeeded);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn concurrent_claims_never_share_a_job() {
        let (store, dir) = temp_store();
        let now = Utc::now();
        for index in 0..20 {
            store.insert(&job(&format!("job-{index:02}"), now - Duration::seconds(1))).unwrap();
        }
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .claim_due_jobs(now, 20, &format!("worker-{worker}"), 60)
                        .unwrap()
                        .into_iter()
                        .map(|job| job.id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut claimed: Vec<String> = handles.into_iter().flat_map(|handle| handle.join().unwrap()).collect();
        let total = claimed.len();
        claimed.sort();
        claimed.dedup();
        assert_eq!(total, 20);
        assert_eq!(claimed.len(), 20);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn cancel_only_touches_pending_jobs() {
        let (store, dir) = temp_store();
        let now = Utc::now();
        store.insert(&job("p", now + Duration::hours(1))).unwrap();
        let mut done = job("d", now);
        done.status = JobStatus::Succeeded;
        store.insert(&done).unwrap();

        assert!(store.cancel_pending("p", now).unwrap());
        let cancelled = store.get_job("p").unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Failed);
        assert_eq!(cancelled.last_error.as_deref(), Some("cancelled"));
        assert!(!store.cancel_pending("d", now).unwrap());
        assert!(!store.cancel_pending("nope", now).unwrap());

        assert_eq!(store.list_jobs(Some(JobStatus::Failed)).unwrap().len(), 1);
        assert_eq!(store.list_jobs(None).unwrap().len(), 2);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn sql_formatted_timestamps_are_still_due() {
        let (store, dir) = temp_store();
        store.insert(&job("legacy", Utc::now())).unwrap();
        store
            .store()
            .with_connection(|conn| {
                conn.execute(
                    "UPDATE notification_jobs SET scheduled_for = '2020-01-01 00:00:00' WHERE id = 'legacy'",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        let claimed = store.claim_due_jobs(Utc::now(), 5, "c", 60).unwrap();
        assert_eq!(claimed.len(), 1);
        fs::remove_dir_all(&dir).ok();
    }
}
