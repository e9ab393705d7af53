//! ntfy, hosted (ntfy.sh) or self-hosted.
//!
//! `ntfy://{topic}` publishes to ntfy.sh.
//! `ntfy[s]://[user:password@]{host}[:port]/{topic}[/{topic}...][?priority=high&token=tk_...]`

use async_trait::async_trait;
use serde::Serialize;

use crate::http::pool::ClientClass;
use crate::http::response::send_with_retry;
use crate::notifications::body::truncate;
use crate::notifications::error::{NotifyError, NotifyResult};
use crate::notifications::service::{AttachmentSupport, NotificationService, ServiceContext, attachment_summary};
use crate::notifications::types::{BodyFormat, NotificationRequest, NotifyType};
use crate::notifications::url::{ServiceUrl, UrlBuilder};
use crate::services::{deliver_each, effective_format, url_format};

const HOSTED: &str = "ntfy.sh";
const MAX_BODY: usize = 4096;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NtfyConfig {
    pub secure: bool,
    /// `None` publishes to ntfy.sh.
    pub host: Option<String>,
    pub port: Option<u16>,
    pub topics: Vec<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub priority: Option<u8>,
    pub click: Option<String>,
    pub attach: Option<String>,
    pub format: Option<BodyFormat>,
}

pub struct Ntfy {
    ctx: ServiceContext,
    config: NtfyConfig,
}

#[derive(Debug, Serialize)]
pub(crate) struct PublishPayload {
    topic: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<u8>,
    tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    click: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    attach: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    markdown: bool,
}

fn parse_priority(value: &str) -> NotifyResult<u8> {
    let priority = match value.trim().to_ascii_lowercase().as_str() {
        "min" | "1" => 1,
        "low" | "2" => 2,
        "default" | "3" => 3,
        "high" | "4" => 4,
        "max" | "urgent" | "5" => 5,
        other => return Err(NotifyError::url(format!("invalid ntfy priority '{other}'"))),
    };
    Ok(priority)
}

/// ntfy renders these tag names as emoji.
fn type_tag(notify_type: NotifyType) -> &'static str {
    match notify_type {
        NotifyType::Info => "information_source",
        NotifyType::Success => "white_check_mark",
        NotifyType::Warning => "warning",
        NotifyType::Error => "rotating_light",
    }
}

impl Ntfy {
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            ctx,
            config: NtfyConfig::default(),
        }
    }

    pub fn config(&self) -> &NtfyConfig {
        &self.config
    }

    pub(crate) fn endpoint(&self) -> String {
        let config = &self.config;
        match &config.host {
            None => format!("https://{HOSTED}"),
            Some(host) => {
                let scheme = if config.secure { "https" } else { "http" };
                match config.port {
                    Some(port) => format!("{scheme}://{host}:{port}"),
                    None => format!("{scheme}://{host}"),
                }
            }
        }
    }

    pub(crate) fn build_payload(&self, request: &NotificationRequest, topic: &str, summary: Option<&str>) -> PublishPayload {
        let mut message = request.body.clone();
        if let Some(summary) = summary {
            message.push_str("\n\n");
            message.push_str(summary);
        }
        let mut tags = vec![type_tag(request.notify_type).to_string()];
        tags.extend(request.tags.iter().cloned());
        PublishPayload {
            topic: topic.to_string(),
            message: truncate(&message, MAX_BODY),
            title: (!request.title.trim().is_empty()).then(|| request.title.clone()),
            priority: self.config.priority,
            tags,
            click: request.url.clone().or_else(|| self.config.click.clone()),
            attach: self.config.attach.clone(),
            markdown: effective_format(request, self.config.format) == BodyFormat::Markdown,
        }
    }
}

#[async_trait]
impl NotificationService for Ntfy {
    fn id(&self) -> &'static str {
        "ntfy"
    }

    fn parse_url(&mut self, url: &ServiceUrl) -> NotifyResult<()> {
        let host = url.require_host()?;
        let secure = url.secure_variant("ntfy");
        // A bare `ntfy://topic` with no path means the hosted service.
        let hosted = url.path.is_empty() && url.port.is_none() && url.user.is_none() && !host.contains('.');
        let (host, mut topics) = if hosted {
            (None, vec![host.to_string()])
        } else {
            (Some(host.to_string()), url.path.clone())
        };
        topics.extend(url.param_list("to"));
        if topics.is_empty() {
            return Err(NotifyError::url("ntfy needs at least one topic"));
        }
        self.config = NtfyConfig {
            secure: secure || host.is_none(),
            host,
            port: url.port,
            topics,
            user: url.user.clone(),
            password: url.password.clone(),
            token: url.param("token").map(str::to_string),
            priority: url.param("priority").map(parse_priority).transpose()?,
            click: url.param("click").map(str::to_string),
            attach: url.param("attach").map(str::to_string),
            format: url_format(url)?,
        };
        Ok(())
    }

    async fn send(&self, request: &NotificationRequest) -> NotifyResult<()> {
        let client = self.ctx.client(ClientClass::Webhook, self.id())?;
        let summary = attachment_summary(request).await;
        let endpoint = self.endpoint();
        deliver_each(self.id(), &self.config.topics, |topic| {
            let payload = self.build_payload(request, topic, summary.as_deref());
            let client = client.clone();
            let endpoint = endpoint.clone();
            async move {
                send_with_retry(self.id(), || {
                    let mut builder = client.post(&endpoint).json(&payload);
                    if let Some(token) = &self.config.token {
                        builder = builder.bearer_auth(token);
                    } else if let Some(user) = &self.config.user {
                        builder = builder.basic_auth(user, self.config.password.as_ref());
                    }
                    Ok(builder)
                })
                .await?;
                Ok(())
            }
        })
        .await
    }

    fn attachment_support(&self) -> AttachmentSupport {
        AttachmentSupport::Metadata
    }

    fn max_body_length(&self) -> usize {
        MAX_BODY
    }

    fn to_url(&self) -> String {
        let config = &self.config;
        let builder = match &config.host {
            None => UrlBuilder::new("ntfy").host(&config.topics[0]).segments(&config.topics[1..]),
            Some(host) => UrlBuilder::new(if config.secure { "ntfys" } else { "ntfy" })
                .user(config.user.as_deref())
                .password(config.password.as_deref())
                .host(host)
                .port(config.port)
                .segments(&config.topics),
        };
        builder
            .param_opt("token", config.token.as_ref())
            .param_opt("priority", config.priority)
            .param_opt("click", config.click.as_ref())
            .param_opt("attach", config.attach.as_ref())
            .param_opt("format", config.format)
            .build()
    }
}
