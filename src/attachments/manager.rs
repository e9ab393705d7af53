use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;

use super::error::{AttachmentError, AttachmentResult};
use super::source::{Attachment, is_remote};
use crate::http::pool::{ClientClass, HttpPools};

pub const DEFAULT_MAX_SIZE: u64 = 25 * 1024 * 1024;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentPolicy {
    /// Per-attachment byte limit; 0 disables the check.
    pub max_size: u64,
    pub fetch_timeout: Duration,
}

impl Default for AttachmentPolicy {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

/// The attachment list a dispatcher sends with every notification unless a
/// call supplies its own.
#[derive(Debug, Clone)]
pub struct AttachmentManager {
    items: Arc<Mutex<Vec<Attachment>>>,
    policy: Arc<Mutex<AttachmentPolicy>>,
    pools: Arc<HttpPools>,
}

impl AttachmentManager {
    pub fn new(pools: Arc<HttpPools>) -> Self {
        Self::with_policy(pools, AttachmentPolicy::default())
    }

    pub fn with_policy(pools: Arc<HttpPools>, policy: AttachmentPolicy) -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
            policy: Arc::new(Mutex::new(policy)),
            pools,
        }
    }

    pub fn policy(&self) -> AttachmentPolicy {
        *self.policy_guard()
    }

    pub fn max_size(&self) -> u64 {
        self.policy().max_size
    }

    pub fn set_max_size(&self, max_size: u64) {
        self.policy_guard().max_size = max_size;
    }

    pub fn fetch_timeout(&self) -> Duration {
        self.policy().fetch_timeout
    }

    pub fn set_fetch_timeout(&self, timeout: Duration) {
        self.policy_guard().fetch_timeout = timeout;
    }

    /// Add a local file. Missing files and files over the size limit are rejected.
    pub async fn add(&self, path: impl Into<PathBuf>) -> AttachmentResult<Attachment> {
        let path = path.into();
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| AttachmentError::NotFound(path.display().to_string()))?;
        if !meta.is_file() {
            return Err(AttachmentError::NotFound(path.display().to_string()));
        }
        let max_size = self.max_size();
        if max_size > 0 && meta.len() > max_size {
            return Err(AttachmentError::TooLarge {
                size: meta.len(),
                max: max_size,
            });
        }
        Ok(self.push(Attachment::from_path(path, max_size)))
    }

    /// Add remote content. Nothing is fetched until a service reads it.
    pub fn add_from_url(&self, url: &str, name: Option<&str>) -> AttachmentResult<Attachment> {
        if !is_remote(url) {
            return Err(AttachmentError::Fetch(format!("not an http(s) URL: {url}")));
        }
        let client = self
            .pools
            .client(ClientClass::Default, "attachments")
            .map_err(|err| AttachmentError::Fetch(err.to_string()))?;
        let policy = self.policy();
        Ok(self.push(Attachment::from_url(
            url.trim(),
            name,
            client,
            policy.max_size,
            policy.fetch_timeout,
        )))
    }

    pub fn add_data(&self, bytes: impl Into<Bytes>, name: &str, mime: &str) -> AttachmentResult<Attachment> {
        let bytes = bytes.into();
        let max_size = self.max_size();
        if max_size > 0 && bytes.len() as u64 > max_size {
            return Err(AttachmentError::TooLarge {
                size: bytes.len() as u64,
                max: max_size,
            });
        }
        Ok(self.push(Attachment::from_bytes(bytes, name, mime)))
    }

    /// Add a path or an http(s) URL, whichever `location` is.
    pub async fn add_location(&self, location: &str) -> AttachmentResult<Attachment> {
        if is_remote(location) {
            self.add_from_url(location, None)
        } else {
            self.add(location).await
        }
    }

    pub fn all(&self) -> Vec<Attachment> {
        self.items_guard().clone()
    }

    pub fn count(&self) -> usize {
        self.items_guard().len()
    }

    pub fn clear(&self) {
        self.items_guard().clear();
    }

    // Neither lock guards a multi-step update, so a poisoned value is still whole.
    fn items_guard(&self) -> MutexGuard<'_, Vec<Attachment>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn policy_guard(&self) -> MutexGuard<'_, AttachmentPolicy> {
        self.policy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, attachment: Attachment) -> Attachment {
        self.items_guard().push(attachment.clone());
        tracing::debug!(
            event = "attachment_added",
            name = %attachment.name(),
            kind = ?attachment.kind(),
            "attachment added"
        );
        attachment
    }
}
