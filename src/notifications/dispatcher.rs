//! Fan-out of one notification to every registered destination.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::attachments::{Attachment, AttachmentManager};
use crate::notifications::error::{NotifyError, NotifyResult};
use crate::notifications::registry::ServiceRegistry;
use crate::notifications::service::{NotificationService, ServiceContext};
use crate::notifications::types::{BodyFormat, NotificationRequest, NotifyType};
use crate::notifications::url::ServiceUrl;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A configured service and the tags it was registered with.
#[derive(Debug, Clone)]
pub struct Destination {
    pub service: Arc<dyn NotificationService>,
    pub tags: BTreeSet<String>,
    pub url: String,
}

impl Destination {
    fn matches(&self, wanted: &BTreeSet<String>) -> bool {
        wanted.is_empty() || !self.tags.is_disjoint(wanted)
    }
}

/// Outcome for one destination of one `notify` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub service_id: String,
    /// Redacted destination URL.
    pub service_url: String,
    pub success: bool,
    pub error: Option<NotifyError>,
    pub duration: Duration,
}

/// Per-call options. Anything left unset falls back to the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct NotifyOptions {
    tags: BTreeSet<String>,
    body_format: Option<BodyFormat>,
    url: Option<String>,
    attachments: Option<Vec<Attachment>>,
    cancel_token: Option<CancellationToken>,
    timeout: Option<Duration>,
}

impl NotifyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only send to destinations sharing at least one of these tags.
    /// No tags means every destination.
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(normalize_tags(tags));
        self
    }

    pub fn body_format(mut self, format: BodyFormat) -> Self {
        self.body_format = Some(format);
        self
    }

    /// A link services may render alongside the message.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Replace the dispatcher's attachments for this call.
    pub fn attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = Some(attachments);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Everything one `notify` call produced, handed to a [`ResultSink`].
#[derive(Debug, Clone)]
pub struct DispatchBatch {
    pub id: String,
    pub scheduled_job_id: Option<String>,
    pub attempt: u32,
    pub notify_type: NotifyType,
    pub title: String,
    pub tags: BTreeSet<String>,
    pub responses: Vec<Response>,
}

/// Receives every completed batch, e.g. to persist metrics.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn record(&self, batch: &DispatchBatch);
}

pub struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    context: ServiceContext,
    destinations: Vec<Destination>,
    attachments: AttachmentManager,
    timeout: Duration,
    sink: Option<Arc<dyn ResultSink>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// A dispatcher over the process-wide registry and HTTP pools.
    pub fn new() -> Self {
        Self::with_registry(ServiceRegistry::global(), ServiceContext::default())
    }

    pub fn with_registry(registry: Arc<ServiceRegistry>, context: ServiceContext) -> Self {
        let attachments = AttachmentManager::new(Arc::clone(&context.pools));
        Self {
            registry,
            context,
            destinations: Vec::new(),
            attachments,
            timeout: DEFAULT_TIMEOUT,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Parse `url`, build its service and append it. On error nothing is added.
    pub fn add<I, S>(&mut self, url: &str, tags: I) -> NotifyResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let parsed = ServiceUrl::parse(url)?;
        let mut service = self.registry.instantiate(&parsed.scheme, &self.context)?;
        service.parse_url(&parsed)?;
        let service: Arc<dyn NotificationService> = Arc::from(service);
        tracing::debug!(
            event = "destination_added",
            service_id = %service.id(),
            url = %service.redacted_url(),
            "destination registered"
        );
        self.destinations.push(Destination {
            service,
            tags: normalize_tags(tags).collect(),
            url: url.trim().to_string(),
        });
        Ok(())
    }

    pub fn clear(&mut self) {
        self.destinations.clear();
    }

    pub fn count(&self) -> usize {
        self.destinations.len()
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    /// Service ids in registration order.
    pub fn services(&self) -> Vec<&'static str> {
        self.destinations.iter().map(|d| d.service.id()).collect()
    }

    /// Redacted destination URLs in registration order.
    pub fn urls(&self) -> Vec<String> {
        self.destinations
            .iter()
            .map(|d| d.service.redacted_url())
            .collect()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn attachments(&self) -> &AttachmentManager {
        &self.attachments
    }

    /// Send to every matching destination concurrently and report one
    /// [`Response`] per destination, in registration order.
    pub async fn notify(
        &self,
        title: &str,
        body: &str,
        notify_type: NotifyType,
        options: NotifyOptions,
    ) -> Vec<Response> {
        self.notify_batch(title, body, notify_type, options)
            .await
            .responses
    }

    /// [`notify`](Self::notify), returning the whole batch.
    pub async fn notify_batch(
        &self,
        title: &str,
        body: &str,
        notify_type: NotifyType,
        options: NotifyOptions,
    ) -> DispatchBatch {
        let NotifyOptions {
            tags,
            body_format,
            url,
            attachments,
            cancel_token,
            timeout,
        } = options;
        let request = Arc::new(NotificationRequest {
            title: title.to_string(),
            body: body.to_string(),
            notify_type,
            body_format,
            tags: tags.clone(),
            url,
            attachments: attachments.unwrap_or_else(|| self.attachments.all()),
        });
        let selected: Vec<&Destination> = self
            .destinations
            .iter()
            .filter(|destination| destination.matches(&tags))
            .collect();

        let batch_id = uuid::Uuid::new_v4().to_string();
        let responses = if selected.is_empty() {
            Vec::new()
        } else {
            let timeout = timeout.unwrap_or(self.timeout);
            let token = cancel_token.unwrap_or_default();
            fan_out(&batch_id, &selected, request, timeout, token).await
        };

        let batch = DispatchBatch {
            id: batch_id,
            scheduled_job_id: None,
            attempt: 1,
            notify_type,
            title: title.to_string(),
            tags,
            responses,
        };
        if let Some(sink) = &self.sink {
            sink.record(&batch).await;
        }
        batch
    }
}

async fn fan_out(
    batch_id: &str,
    selected: &[&Destination],
    request: Arc<NotificationRequest>,
    timeout: Duration,
    token: CancellationToken,
) -> Vec<Response> {
    let started = tokio::time::Instant::now();
    let deadline = started + timeout;
    // Dropping the set aborts every send still in flight.
    let mut tasks = JoinSet::new();
    let mut positions = HashMap::with_capacity(selected.len());
    for (index, destination) in selected.iter().enumerate() {
        let service = Arc::clone(&destination.service);
        let request = Arc::clone(&request);
        let token = token.clone();
        let handle = tasks.spawn(async move {
            let begun = tokio::time::Instant::now();
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(NotifyError::Canceled),
                outcome = tokio::time::timeout_at(deadline, service.send(&request)) => {
                    outcome.unwrap_or(Err(NotifyError::DeadlineExceeded(timeout)))
                }
            };
            (result, begun.elapsed())
        });
        positions.insert(handle.id(), index);
    }

    let mut slots: Vec<Option<Response>> = vec![None; selected.len()];
    while let Some(joined) = tasks.join_next_with_id().await {
        let (id, (result, duration)) = match joined {
            Ok((id, outcome)) => (id, outcome),
            Err(err) => (err.id(), (Err(join_error(err)), started.elapsed())),
        };
        let Some(&index) = positions.get(&id) else {
            continue;
        };
        let destination = selected[index];
        let response = Response {
            service_id: destination.service.id().to_string(),
            service_url: destination.service.redacted_url(),
            success: result.is_ok(),
            error: result.err(),
            duration,
        };
        match &response.error {
            None => tracing::debug!(
                event = "notification_sent",
                batch_id = %batch_id,
                service_id = %response.service_id,
                duration_ms = response.duration.as_millis() as u64,
                "notification delivered"
            ),
            Some(err) => tracing::warn!(
                event = "notification_failed",
                batch_id = %batch_id,
                service_id = %response.service_id,
                url = %response.service_url,
                duration_ms = response.duration.as_millis() as u64,
                error = %err,
                "notification delivery failed"
            ),
        }
        slots[index] = Some(response);
    }
    slots.into_iter().flatten().collect()
}

fn join_error(err: JoinError) -> NotifyError {
    if !err.is_panic() {
        return NotifyError::Canceled;
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    NotifyError::Panicked(message)
}

fn normalize_tags<I, S>(tags: I) -> impl Iterator<Item = String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    tags.into_iter()
        .map(Into::into)
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
}
