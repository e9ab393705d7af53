use std::fs;
use std::path::Path;
use std::sync::Arc;

use rusqlite::{Connection, OpenFlags};

use crate::storage::error::{StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: Arc<String>,
}

impl SqliteStore {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: Arc::new(path.into()),
        }
    }

    /// Store under the platform data directory, e.g. `~/.local/share/herald/herald.db`.
    pub fn default_location() -> Self {
        let base = dirs::data_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        Self::new(base.join("herald").join("herald.db").to_string_lossy().to_string())
    }

    pub fn path(&self) -> &str {
        self.path.as_str()
    }

    pub fn ensure_parent_dir(&self) -> StoreResult<()> {
        if let Some(parent) = Path::new(self.path.as_str()).parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| StoreError::OpenFailed(err.to_string()))?;
        }
        Ok(())
    }

    pub fn open(&self) -> StoreResult<Connection> {
        self.ensure_parent_dir()?;
        let conn = Connection::open_with_flags(
            self.path.as_str(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .map_err(|err| StoreError::OpenFailed(err.to_string()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(|err| StoreError::OpenFailed(err.to_string()))?;
        Ok(conn)
    }

    pub fn migrate(&self, conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS notification_jobs (
                id TEXT PRIMARY KEY,
                request_json TEXT NOT NULL,
                destination_urls_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                scheduled_for TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 1,
                retry_policy_json TEXT NOT NULL,
                status TEXT NOT NULL CHECK(status IN ('pending', 'running', 'succeeded', 'failed', 'exhausted')),
                last_error TEXT,
                claim_id TEXT,
                claim_expires_at TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notification_jobs_due ON notification_jobs(status, scheduled_for);
            CREATE INDEX IF NOT EXISTS idx_notification_jobs_claim ON notification_jobs(claim_id);
            CREATE TABLE IF NOT EXISTS notification_metrics (
                id TEXT PRIMARY KEY,
                job_id TEXT,
                scheduled_job_id TEXT,
                service_id TEXT NOT NULL,
                service_url TEXT NOT NULL,
                notification_type INTEGER NOT NULL,
                status TEXT NOT NULL CHECK(status IN ('success', 'failed')),
                duration_ms INTEGER NOT NULL,
                error_message TEXT,
                metadata TEXT,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notification_metrics_timestamp ON notification_metrics(timestamp);
            CREATE INDEX IF NOT EXISTS idx_notification_metrics_service ON notification_metrics(service_id);
            CREATE INDEX IF NOT EXISTS idx_notification_metrics_job ON notification_metrics(scheduled_job_id);",
        )
        .map_err(|err| StoreError::MigrationFailed(err.to_string()))?;
        Ok(())
    }

    pub fn touch(&self) -> StoreResult<()> {
        let conn = self.open()?;
        self.migrate(&conn)?;
        Ok(())
    }

    pub fn with_connection<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        let conn = self.open()?;
        self.migrate(&conn)?;
        f(&conn)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::SqliteStore;
    use uuid::Uuid;

    #[test]
    fn sqlite_store_creates_schema() {
        let dir = std::env::temp_dir().join(format!("herald-test-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("herald.db");
        let store = SqliteStore::new(path.to_string_lossy().to_string());
        let conn = store.open().unwrap();
        store.migrate(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('notification_jobs', 'notification_metrics')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
        // Migration is idempotent.
        store.migrate(&conn).unwrap();
        fs::remove_dir_all(&dir).ok();
    }
}
