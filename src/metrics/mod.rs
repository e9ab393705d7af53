pub mod report;
pub mod store;

pub use report::{ErrorCount, HourlyBucket, MetricsReport, MetricsReporter, ServiceBreakdown, TypeCount};
pub use store::{MetricStatus, MetricsStore, NotificationMetric};
