//! Generic JSON webhook.
//!
//! `json://[user[:password]@]host[:port][/path][?method=PUT&+X-Header=value]`
//!
//! `jsons://` and `webhooks://` use HTTPS. Attachments are embedded as
//! base64 in the JSON body.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Method;
use serde::Serialize;

use crate::http::pool::ClientClass;
use crate::http::response::ensure_success;
use crate::notifications::error::{NotifyError, NotifyResult};
use crate::notifications::service::{AttachmentSupport, NotificationService, ServiceContext};
use crate::notifications::types::{BodyFormat, NotificationRequest};
use crate::notifications::url::{ServiceUrl, UrlBuilder};
use crate::services::{effective_format, url_format};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookConfig {
    pub secure: bool,
    pub host: String,
    pub port: Option<u16>,
    pub path: Vec<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub format: Option<BodyFormat>,
}

pub struct JsonWebhook {
    ctx: ServiceContext,
    scheme: &'static str,
    config: WebhookConfig,
}

#[derive(Debug, Serialize)]
pub(crate) struct WebhookPayload {
    version: &'static str,
    title: String,
    message: String,
    #[serde(rename = "type")]
    notify_type: String,
    format: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<WebhookAttachment>,
}

#[derive(Debug, Serialize)]
pub(crate) struct WebhookAttachment {
    filename: String,
    mimetype: String,
    base64: String,
}

impl JsonWebhook {
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            ctx,
            scheme: "json",
            config: WebhookConfig {
                method: "POST".to_string(),
                ..WebhookConfig::default()
            },
        }
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    pub(crate) fn endpoint(&self) -> String {
        let config = &self.config;
        let scheme = if config.secure { "https" } else { "http" };
        let mut endpoint = format!("{scheme}://{}", config.host);
        if let Some(port) = config.port {
            endpoint.push_str(&format!(":{port}"));
        }
        endpoint.push('/');
        endpoint.push_str(
            &config
                .path
                .iter()
                .map(|segment| urlencoding::encode(segment).into_owned())
                .collect::<Vec<_>>()
                .join("/"),
        );
        endpoint
    }

    pub(crate) async fn build_payload(&self, request: &NotificationRequest) -> NotifyResult<WebhookPayload> {
        let mut attachments = Vec::with_capacity(request.attachments.len());
        for attachment in &request.attachments {
            attachments.push(WebhookAttachment {
                filename: attachment.name().to_string(),
                mimetype: attachment.mime_type().await?,
                base64: BASE64.encode(attachment.read().await?),
            });
        }
        Ok(WebhookPayload {
            version: "1.0",
            title: request.title.clone(),
            message: request.body.clone(),
            notify_type: request.notify_type.to_string(),
            format: effective_format(request, self.config.format).to_string(),
            tags: request.tags.iter().cloned().collect(),
            url: request.url.clone(),
            attachments,
        })
    }
}

#[async_trait]
impl NotificationService for JsonWebhook {
    fn id(&self) -> &'static str {
        "json"
    }

    fn parse_url(&mut self, url: &ServiceUrl) -> NotifyResult<()> {
        let host = url.require_host()?;
        let method = url.param("method").unwrap_or("POST").to_ascii_uppercase();
        if !matches!(method.as_str(), "POST" | "PUT" | "PATCH") {
            return Err(NotifyError::url(format!("unsupported webhook method '{method}'")));
        }
        self.scheme = match url.scheme.as_str() {
            "jsons" => "jsons",
            "webhook" => "webhook",
            "webhooks" => "webhooks",
            _ => "json",
        };
        self.config = WebhookConfig {
            secure: url.scheme.ends_with('s'),
            host: host.to_string(),
            port: url.port,
            path: url.path.clone(),
            user: url.user.clone(),
            password: url.password.clone(),
            method,
            headers: url.headers.clone(),
            format: url_format(url)?,
        };
        Ok(())
    }

    async fn send(&self, request: &NotificationRequest) -> NotifyResult<()> {
        let client = self.ctx.client(ClientClass::Webhook, self.id())?;
        let payload = self.build_payload(request).await?;
        let method = Method::from_bytes(self.config.method.as_bytes())
            .map_err(|err| NotifyError::config(err.to_string()))?;
        let mut builder = client.request(method, self.endpoint()).json(&payload);
        if let Some(user) = &self.config.user {
            builder = builder.basic_auth(user, self.config.password.as_ref());
        }
        for (name, value) in &self.config.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        ensure_success(builder.send().await?).await
    }

    fn attachment_support(&self) -> AttachmentSupport {
        AttachmentSupport::Content
    }

    fn to_url(&self) -> String {
        let config = &self.config;
        let mut builder = UrlBuilder::new(self.scheme)
            .user(config.user.as_deref())
            .password(config.password.as_deref())
            .host(&config.host)
            .port(config.port)
            .segments(&config.path)
            .param_opt("method", (config.method != "POST").then_some(&config.method))
            .param_opt("format", config.format);
        for (name, value) in &config.headers {
            builder = builder.param(&format!("+{name}"), value);
        }
        builder.build()
    }
}
