#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database open failed: {0}")]
    OpenFailed(String),
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),
    #[error("Database query failed: {0}")]
    QueryFailed(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::QueryFailed(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::QueryFailed(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
