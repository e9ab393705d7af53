//! Persistent, retrying notification jobs.

pub mod error;
pub mod executor;
pub mod job;
pub mod service;
pub mod store;

pub use error::{SchedulerError, SchedulerResult};
pub use executor::{JobDispatcher, JobExecutor, UrlDispatcher};
pub use job::{AttachmentRef, JobStatus, NewJob, RequestSnapshot, RetryPolicy, ScheduledJob};
pub use service::{SchedulerService, TickReport};
pub use store::JobStore;
