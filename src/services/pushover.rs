//! Pushover.
//!
//! `pushover://{app_token}@{user_key}[/{device}...][?priority=high&sound=siren&retry=60&expire=3600]`
//!
//! Emergency priority (2) makes Pushover repeat the alert until acknowledged,
//! so it needs `retry` (>= 30 s) and `expire` (<= 10800 s).

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use crate::http::pool::ClientClass;
use crate::http::response::{self, send_with_retry};
use crate::notifications::body::truncate;
use crate::notifications::error::{NotifyError, NotifyResult};
use crate::notifications::service::{AttachmentSupport, NotificationService, ServiceContext};
use crate::notifications::types::{BodyFormat, NotificationRequest, NotifyType};
use crate::notifications::url::{ServiceUrl, UrlBuilder, redact_secrets};
use crate::services::{effective_format, required, url_format};

const ENDPOINT: &str = "https://api.pushover.net/1/messages.json";
const MAX_BODY: usize = 1024;
const MAX_TITLE: usize = 250;
const MAX_IMAGE: u64 = 2_500_000;
const MIN_RETRY: u32 = 30;
const MAX_EXPIRE: u32 = 10800;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushoverConfig {
    pub user_key: String,
    pub token: String,
    pub devices: Vec<String>,
    /// Explicit priority; otherwise derived from the notification type.
    pub priority: Option<i8>,
    pub sound: Option<String>,
    pub retry: Option<u32>,
    pub expire: Option<u32>,
    pub format: Option<BodyFormat>,
}

pub struct Pushover {
    ctx: ServiceContext,
    config: PushoverConfig,
}

#[derive(Debug, Deserialize)]
struct Reply {
    status: i64,
    #[serde(default)]
    errors: Vec<String>,
}

fn parse_priority(value: &str) -> NotifyResult<i8> {
    let priority = match value.trim().to_ascii_lowercase().as_str() {
        "lowest" | "-2" => -2,
        "low" | "-1" => -1,
        "normal" | "0" => 0,
        "high" | "1" => 1,
        "emergency" | "2" => 2,
        other => return Err(NotifyError::url(format!("invalid pushover priority '{other}'"))),
    };
    Ok(priority)
}

impl Pushover {
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            ctx,
            config: PushoverConfig::default(),
        }
    }

    pub fn config(&self) -> &PushoverConfig {
        &self.config
    }

    fn priority_for(&self, notify_type: NotifyType) -> i8 {
        self.config.priority.unwrap_or(match notify_type {
            NotifyType::Warning => 1,
            NotifyType::Error => 1,
            _ => 0,
        })
    }

    /// Form fields for one message, body clamped to Pushover's limit.
    pub(crate) fn form_fields(&self, request: &NotificationRequest) -> Vec<(&'static str, String)> {
        let config = &self.config;
        let mut fields = vec![
            ("token", config.token.clone()),
            ("user", config.user_key.clone()),
            ("message", truncate(&request.body, MAX_BODY)),
        ];
        if !request.title.trim().is_empty() {
            fields.push(("title", truncate(&request.title, MAX_TITLE)));
        }
        let priority = self.priority_for(request.notify_type);
        fields.push(("priority", priority.to_string()));
        if priority == 2 {
            fields.push(("retry", config.retry.unwrap_or(MIN_RETRY).to_string()));
            fields.push(("expire", config.expire.unwrap_or(MAX_EXPIRE).to_string()));
        }
        if !config.devices.is_empty() {
            fields.push(("device", config.devices.join(",")));
        }
        if let Some(sound) = &config.sound {
            fields.push(("sound", sound.clone()));
        }
        if let Some(url) = &request.url {
            fields.push(("url", url.clone()));
        }
        if effective_format(request, config.format) == BodyFormat::Html {
            fields.push(("html", "1".to_string()));
        }
        fields
    }
}

#[async_trait]
impl NotificationService for Pushover {
    fn id(&self) -> &'static str {
        "pushover"
    }

    fn parse_url(&mut self, url: &ServiceUrl) -> NotifyResult<()> {
        let token = required(url.user.as_deref(), "application token", "pushover")?;
        let user_key = required(Some(url.host.as_str()), "user key", "pushover")?;
        let priority = url.param("priority").map(parse_priority).transpose()?;
        let retry: Option<u32> = url.param_parsed("retry")?;
        let expire: Option<u32> = url.param_parsed("expire")?;
        if priority == Some(2) {
            match (retry, expire) {
                (Some(retry), Some(expire)) if retry >= MIN_RETRY && expire <= MAX_EXPIRE => {}
                _ => {
                    return Err(NotifyError::config(format!(
                        "emergency priority needs retry >= {MIN_RETRY} and expire <= {MAX_EXPIRE}"
                    )));
                }
            }
        }
        let mut devices = url.path.clone();
        devices.extend(url.param_list("to"));
        self.config = PushoverConfig {
            user_key: user_key.to_string(),
            token: token.to_string(),
            devices,
            priority,
            sound: url.param("sound").map(str::to_string),
            retry,
            expire,
            format: url_format(url)?,
        };
        Ok(())
    }

    async fn send(&self, request: &NotificationRequest) -> NotifyResult<()> {
        let client = self.ctx.client(ClientClass::Default, self.id())?;
        let fields = self.form_fields(request);

        let mut image = None;
        for attachment in &request.attachments {
            let mime = attachment.mime_type().await?;
            if mime.starts_with("image/") && attachment.size().await? <= MAX_IMAGE {
                image = Some((attachment.name().to_string(), mime, attachment.read().await?));
                break;
            }
        }

        let reply = send_with_retry(self.id(), || {
            let Some((name, mime, bytes)) = &image else {
                return Ok(client.post(ENDPOINT).form(&fields));
            };
            let mut form = Form::new();
            for (key, value) in &fields {
                form = form.text(*key, value.clone());
            }
            let part = Part::stream(bytes.clone()).file_name(name.clone()).mime_str(mime)?;
            Ok(client.post(ENDPOINT).multipart(form.part("attachment", part)))
        })
        .await?;
        let reply: Reply = response::json(reply).await?;
        if reply.status != 1 {
            return Err(NotifyError::Provider {
                status: 200,
                body: reply.errors.join("; "),
            });
        }
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
        UrlBuilder::new("pushover")
            .user(Some(&config.token))
            .host(&config.user_key)
            .segments(&config.devices)
            .param_opt("priority", config.priority)
            .param_opt("sound", config.sound.as_ref())
            .param_opt("retry", config.retry)
            .param_opt("expire", config.expire)
            .param_opt("format", config.format)
            .build()
    }

    fn redacted_url(&self) -> String {
        redact_secrets(&self.to_url(), &[self.config.token.as_str()])
    }
}
