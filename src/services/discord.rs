//! Discord webhooks.
//!
//! `discord://{webhook_id}/{webhook_token}[?username=..&avatar_url=..&tts=yes&format=markdown]`
//!
//! Messages go out as a single embed coloured by notification type. With
//! `format=markdown` the text is sent as plain `content` so Discord renders
//! it. Attachments are uploaded with the message as multipart form data.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde_json::{Value, json};

use crate::http::pool::ClientClass;
use crate::http::response::send_with_retry;
use crate::notifications::body::truncate;
use crate::notifications::error::NotifyResult;
use crate::notifications::service::{AttachmentSupport, NotificationService, ServiceContext};
use crate::notifications::types::{BodyFormat, NotificationRequest};
use crate::notifications::url::{ServiceUrl, UrlBuilder, redact_secrets};
use crate::services::{effective_format, required, url_format};

const API_BASE: &str = "https://discord.com/api/webhooks";
const MAX_BODY: usize = 2000;
const MAX_TITLE: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscordConfig {
    pub webhook_id: String,
    pub webhook_token: String,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub tts: bool,
    pub format: Option<BodyFormat>,
}

pub struct Discord {
    ctx: ServiceContext,
    config: DiscordConfig,
}

impl Discord {
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            ctx,
            config: DiscordConfig::default(),
        }
    }

    pub fn config(&self) -> &DiscordConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{API_BASE}/{}/{}", self.config.webhook_id, self.config.webhook_token)
    }

    pub(crate) fn build_payload(&self, request: &NotificationRequest) -> Value {
        let mut payload = match effective_format(request, self.config.format) {
            BodyFormat::Markdown => {
                let text = if request.title.trim().is_empty() {
                    request.body.clone()
                } else {
                    format!("**{}**\n{}", request.title, request.body)
                };
                json!({ "content": truncate(&text, MAX_BODY) })
            }
            _ => {
                let mut embed = json!({
                    "description": truncate(&request.body, MAX_BODY),
                    "color": request.notify_type.color().as_u32(),
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                    "footer": { "text": format!("{} {}", request.notify_type.emoji(), request.notify_type) },
                });
                if !request.title.trim().is_empty() {
                    embed["title"] = json!(truncate(&request.title, MAX_TITLE));
                }
                if let Some(url) = &request.url {
                    embed["url"] = json!(url);
                }
                json!({ "embeds": [embed] })
            }
        };
        if let Some(username) = &self.config.username {
            payload["username"] = json!(username);
        }
        if let Some(avatar_url) = &self.config.avatar_url {
            payload["avatar_url"] = json!(avatar_url);
        }
        if self.config.tts {
            payload["tts"] = json!(true);
        }
        payload
    }
}

struct Upload {
    name: String,
    mime: String,
    bytes: Bytes,
}

#[async_trait]
impl NotificationService for Discord {
    fn id(&self) -> &'static str {
        "discord"
    }

    fn parse_url(&mut self, url: &ServiceUrl) -> NotifyResult<()> {
        let webhook_id = required(Some(url.host.as_str()), "webhook id", "discord")?;
        let webhook_token = required(url.path.first().map(String::as_str), "webhook token", "discord")?;
        self.config = DiscordConfig {
            webhook_id: webhook_id.to_string(),
            webhook_token: webhook_token.to_string(),
            username: url.param("username").or(url.user.as_deref()).map(str::to_string),
            avatar_url: url.param("avatar_url").map(str::to_string),
            tts: url.param_bool("tts")?.unwrap_or(false),
            format: url_format(url)?,
        };
        Ok(())
    }

    async fn send(&self, request: &NotificationRequest) -> NotifyResult<()> {
        let client = self.ctx.client(ClientClass::Webhook, self.id())?;
        let payload = self.build_payload(request);
        let endpoint = self.endpoint();

        let mut uploads = Vec::with_capacity(request.attachments.len());
        for attachment in &request.attachments {
            uploads.push(Upload {
                name: attachment.name().to_string(),
                mime: attachment.mime_type().await?,
                bytes: attachment.read().await?,
            });
        }

        send_with_retry(self.id(), || {
            if uploads.is_empty() {
                return Ok(client.post(&endpoint).json(&payload));
            }
            let mut form = Form::new().text("payload_json", payload.to_string());
            for (index, upload) in uploads.iter().enumerate() {
                let part = Part::stream(upload.bytes.clone())
                    .file_name(upload.name.clone())
                    .mime_str(&upload.mime)?;
                form = form.part(format!("files[{index}]"), part);
            }
            Ok(client.post(&endpoint).multipart(form))
        })
        .await?;
        Ok(())
    }

    fn attachment_support(&self) -> AttachmentSupport {
        AttachmentSupport::Content
    }

    fn max_body_length(&self) -> usize {
        MAX_BODY
    }

    fn to_url(&self) -> String {
        let config = &self.config;
        UrlBuilder::new("discord")
            .host(&config.webhook_id)
            .segment(&config.webhook_token)
            .param_opt("username", config.username.as_ref())
            .param_opt("avatar_url", config.avatar_url.as_ref())
            .param_opt("tts", config.tts.then_some("yes"))
            .param_opt("format", config.format)
            .build()
    }

    fn redacted_url(&self) -> String {
        redact_secrets(&self.to_url(), &[self.config.webhook_token.as_str()])
    }
}
