use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::http::pool::{ClientClass, HttpPools};
use crate::notifications::error::NotifyResult;
use crate::notifications::types::NotificationRequest;
use crate::notifications::url::{ServiceUrl, redact};

/// What a service does with the attachments of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentSupport {
    /// Attachments are ignored.
    None,
    /// Names, types and locations are listed in the message; bytes are not sent.
    Metadata,
    /// Content is uploaded to the provider.
    Content,
}

/// Shared resources handed to service factories.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub pools: Arc<HttpPools>,
}

impl ServiceContext {
    pub fn new(pools: Arc<HttpPools>) -> Self {
        Self { pools }
    }

    pub fn client(&self, class: ClientClass, key: &str) -> NotifyResult<reqwest::Client> {
        self.pools.client(class, key)
    }
}

impl Default for ServiceContext {
    fn default() -> Self {
        Self::new(HttpPools::global())
    }
}

/// One notification backend, configured from a destination URL.
///
/// A service is configured exactly once through [`parse_url`](Self::parse_url)
/// and is shared read-only afterwards; concurrent `send` calls on one
/// instance must be safe. Cancellation is dropping the `send` future.
#[async_trait]
pub trait NotificationService: Send + Sync {
    /// Canonical scheme.
    fn id(&self) -> &'static str;

    fn default_port(&self) -> Option<u16> {
        None
    }

    /// Read configuration from `url`. Unknown query parameters are ignored.
    fn parse_url(&mut self, url: &ServiceUrl) -> NotifyResult<()>;

    async fn send(&self, request: &NotificationRequest) -> NotifyResult<()>;

    fn attachment_support(&self) -> AttachmentSupport {
        AttachmentSupport::None
    }

    fn supports_attachments(&self) -> bool {
        self.attachment_support() != AttachmentSupport::None
    }

    /// Provider body limit in characters; 0 is unlimited.
    fn max_body_length(&self) -> usize {
        0
    }

    /// Serialise the configuration so that parsing the result yields the same service.
    fn to_url(&self) -> String;

    fn redacted_url(&self) -> String {
        redact(&self.to_url())
    }
}

impl fmt::Debug for dyn NotificationService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationService")
            .field("id", &self.id())
            .field("url", &self.redacted_url())
            .finish()
    }
}

/// Attachment listing appended to bodies by [`AttachmentSupport::Metadata`] services.
pub async fn attachment_summary(request: &NotificationRequest) -> Option<String> {
    if request.attachments.is_empty() {
        return None;
    }
    let mut lines = vec!["Attachments:".to_string()];
    for attachment in &request.attachments {
        let mime = attachment
            .mime_type()
            .await
            .unwrap_or_else(|_| crate::attachments::mime::OCTET_STREAM.to_string());
        let line = match attachment.location() {
            Some(location) if crate::attachments::source::is_remote(location) => {
                format!("- {} ({mime}) {location}", attachment.name())
            }
            _ => format!("- {} ({mime})", attachment.name()),
        };
        lines.push(line);
    }
    Some(lines.join("\n"))
}
