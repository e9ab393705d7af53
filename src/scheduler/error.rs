use crate::storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Store error: {0}")]
    Store(String),
    #[error("Job not found: {0}")]
    NotFound(String),
    #[error("Invalid job: {0}")]
    InvalidJob(String),
    #[error("Scheduler disabled")]
    Disabled,
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        SchedulerError::Store(err.to_string())
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
