pub mod attachments;
pub mod config;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod notifications;
pub mod scheduler;
pub mod services;
pub mod storage;
