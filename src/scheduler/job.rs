use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::attachments::{Attachment, AttachmentError, AttachmentKind, AttachmentManager, AttachmentResult};
use crate::notifications::types::{BodyFormat, NotificationRequest, NotifyType};
use crate::scheduler::error::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    /// Could not be dispatched at all, or cancelled before running.
    Failed,
    /// Every allowed attempt failed.
    Exhausted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Exhausted => "exhausted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Exhausted)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "exhausted" => Ok(JobStatus::Exhausted),
            other => Err(format!("invalid job status '{other}'")),
        }
    }
}

/// Exponential backoff between attempts of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 30,
            max_delay_secs: 3600,
        }
    }
}

impl RetryPolicy {
    /// `min(cap, base * 2^(attempt - 1))` for the attempt that just failed.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self.base_delay_secs.saturating_mul(1u64 << exponent);
        Duration::from_secs(delay.min(self.max_delay_secs))
    }

    /// [`base_delay`](Self::base_delay) plus up to half the base delay of
    /// jitter, never beyond the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let half_base_ms = self.base_delay_secs.saturating_mul(1000) / 2;
        let jitter = if half_base_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..half_base_ms))
        };
        (base + jitter).min(Duration::from_secs(self.max_delay_secs))
    }
}

/// An attachment as it is persisted with a job. Files and URLs are
/// re-opened when the job runs; inline data travels base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AttachmentRef {
    File {
        path: String,
    },
    Url {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Inline {
        name: String,
        mime: String,
        data: String,
    },
}

impl AttachmentRef {
    pub async fn capture(attachment: &Attachment) -> AttachmentResult<Self> {
        Ok(match (attachment.kind(), attachment.location()) {
            (AttachmentKind::File, Some(path)) => AttachmentRef::File {
                path: path.to_string(),
            },
            (AttachmentKind::Http, Some(url)) => AttachmentRef::Url {
                url: url.to_string(),
                name: Some(attachment.name().to_string()),
            },
            _ => AttachmentRef::Inline {
                name: attachment.name().to_string(),
                mime: attachment.mime_type().await?,
                data: BASE64.encode(attachment.read().await?),
            },
        })
    }

    /// Re-open through `manager`, which applies its size policy again.
    pub async fn restore(&self, manager: &AttachmentManager) -> AttachmentResult<Attachment> {
        match self {
            AttachmentRef::File { path } => manager.add(path).await,
            AttachmentRef::Url { url, name } => manager.add_from_url(url, name.as_deref()),
            AttachmentRef::Inline { name, mime, data } => {
                let bytes = BASE64
                    .decode(data)
                    .map_err(|err| AttachmentError::Io(format!("stored attachment '{name}': {err}")))?;
                manager.add_data(bytes, name, mime)
            }
        }
    }
}

/// The parts of a [`NotificationRequest`] that survive persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub title: String,
    pub body: String,
    pub notify_type: NotifyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_format: Option<BodyFormat>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

impl RequestSnapshot {
    pub fn new(title: impl Into<String>, body: impl Into<String>, notify_type: NotifyType) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            notify_type,
            body_format: None,
            tags: BTreeSet::new(),
            url: None,
            attachments: Vec::new(),
        }
    }

    /// Capture a live request, reading inline attachment bytes.
    pub async fn capture(request: &NotificationRequest) -> SchedulerResult<Self> {
        let mut attachments = Vec::with_capacity(request.attachments.len());
        for attachment in &request.attachments {
            let stored = AttachmentRef::capture(attachment)
                .await
                .map_err(|err| SchedulerError::InvalidJob(err.to_string()))?;
            attachments.push(stored);
        }
        Ok(Self {
            title: request.title.clone(),
            body: request.body.clone(),
            notify_type: request.notify_type,
            body_format: request.body_format,
            tags: request.tags.clone(),
            url: request.url.clone(),
            attachments,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub request: RequestSnapshot,
    pub destination_urls: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub retry_policy: RetryPolicy,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub claim_id: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn attempts_left(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

/// A job to persist. Unset fields take the scheduler's defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub request: RequestSnapshot,
    pub destination_urls: Vec<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
    pub retry_policy: Option<RetryPolicy>,
}

impl NewJob {
    pub fn new<I, S>(request: RequestSnapshot, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            request,
            destination_urls: urls.into_iter().map(Into::into).collect(),
            scheduled_for: None,
            max_attempts: None,
            retry_policy: None,
        }
    }

    pub fn at(mut self, when: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(when);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_doubles_up_to_cap() {
        let policy = RetryPolicy {
            base_delay_secs: 10,
            max_delay_secs: 100,
        };
        assert_eq!(policy.base_delay(1), Duration::from_secs(10));
        assert_eq!(policy.base_delay(2), Duration::from_secs(20));
        assert_eq!(policy.base_delay(4), Duration::from_secs(80));
        assert_eq!(policy.base_delay(5), Duration::from_secs(100));
        assert_eq!(policy.base_delay(60), Duration::from_secs(100));
    }

    #[test]
    fn jitter_stays_within_half_base_and_cap() {
        let policy = RetryPolicy {
            base_delay_secs: 10,
            max_delay_secs: 100,
        };
        for _ in 0..200 {
            let delay = policy.backoff(2);
            assert!(delay >= Duration::from_secs(20));
            assert!(delay < Duration::from_secs(25));
            assert!(policy.backoff(9) <= Duration::from_secs(100));
        }
        let zero = RetryPolicy {
            base_delay_secs: 0,
            max_delay_secs: 0,
        };
        assert_eq!(zero.backoff(3), Duration::ZERO);
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Exhausted,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
        assert!(JobStatus::Exhausted.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[tokio::test]
    async fn capture_keeps_every_attachment_kind() {
        let mut request = NotificationRequest::new("t", "b", NotifyType::Warning);
        request.tags.insert("ops".to_string());
        request.attachments.push(Attachment::from_path("/var/log/app.log", 0));
        request.attachments.push(Attachment::from_bytes(b"abc".to_vec(), "x.txt", "text/plain"));
        let snapshot = RequestSnapshot::capture(&request).await.unwrap();
        assert_eq!(
            snapshot.attachments[0],
            AttachmentRef::File {
                path: "/var/log/app.log".to_string()
            }
        );
        assert_eq!(
            snapshot.attachments[1],
            AttachmentRef::Inline {
                name: "x.txt".to_string(),
                mime: "text/plain".to_string(),
                data: "YWJj".to_string(),
            }
        );
        assert!(snapshot.tags.contains("ops"));

        let json = serde_json::to_value(&snapshot.attachments[1]).unwrap();
        assert_eq!(json["kind"], "inline");
    }

    #[tokio::test]
    async fn inline_data_restores_through_manager() {
        let manager = AttachmentManager::new(std::sync::Arc::new(crate::http::pool::HttpPools::new()));
        let stored = AttachmentRef::Inline {
            name: "x.txt".to_string(),
            mime: "text/plain".to_string(),
            data: "YWJj".to_string(),
        };
        let attachment = stored.restore(&manager).await.unwrap();
        assert_eq!(attachment.read().await.unwrap().as_ref(), b"abc");
        assert_eq!(manager.count(), 1);

        let broken = AttachmentRef::Inline {
            name: "x.txt".to_string(),
            mime: "text/plain".to_string(),
            data: "***".to_string(),
        };
        assert!(matches!(broken.restore(&manager).await, Err(AttachmentError::Io(_))));
        let missing = AttachmentRef::File {
            path: "/definitely/not/here.txt".to_string(),
        };
        assert!(matches!(missing.restore(&manager).await, Err(AttachmentError::NotFound(_))));
    }
}
