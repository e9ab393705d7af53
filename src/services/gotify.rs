//! Gotify.
//!
//! `gotify[s]://{host}[:port][/{path}...]/{app_token}[?priority=8]`

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::http::pool::ClientClass;
use crate::http::response::send_with_retry;
use crate::notifications::error::{NotifyError, NotifyResult};
use crate::notifications::service::{NotificationService, ServiceContext};
use crate::notifications::types::{BodyFormat, NotificationRequest, NotifyType};
use crate::notifications::url::{ServiceUrl, UrlBuilder, redact_secrets};
use crate::services::{effective_format, url_format};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GotifyConfig {
    pub secure: bool,
    pub host: String,
    pub port: Option<u16>,
    /// Prefix for Gotify served below the web root.
    pub path: Vec<String>,
    pub token: String,
    pub priority: Option<i64>,
    pub format: Option<BodyFormat>,
}

pub struct Gotify {
    ctx: ServiceContext,
    config: GotifyConfig,
}

/// Gotify priorities run 0-10; clients alert from 4 and up.
fn default_priority(notify_type: NotifyType) -> i64 {
    i64::from(notify_type.priority_hint()) * 2 - 2
}

impl Gotify {
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            ctx,
            config: GotifyConfig::default(),
        }
    }

    pub fn config(&self) -> &GotifyConfig {
        &self.config
    }

    pub(crate) fn endpoint(&self) -> String {
        let config = &self.config;
        let scheme = if config.secure { "https" } else { "http" };
        let mut endpoint = match config.port {
            Some(port) => format!("{scheme}://{}:{port}", config.host),
            None => format!("{scheme}://{}", config.host),
        };
        for segment in &config.path {
            endpoint.push('/');
            endpoint.push_str(&urlencoding::encode(segment));
        }
        endpoint.push_str("/message");
        endpoint
    }

    pub(crate) fn build_payload(&self, request: &NotificationRequest) -> Value {
        let mut payload = json!({
            "title": if request.title.trim().is_empty() { request.notify_type.to_string() } else { request.title.clone() },
            "message": request.body,
            "priority": self.config.priority.unwrap_or_else(|| default_priority(request.notify_type)),
        });
        let mut extras = serde_json::Map::new();
        if effective_format(request, self.config.format) == BodyFormat::Markdown {
            extras.insert("client::display".to_string(), json!({ "contentType": "text/markdown" }));
        }
        if let Some(url) = &request.url {
            extras.insert("client::notification".to_string(), json!({ "click": { "url": url } }));
        }
        if !extras.is_empty() {
            payload["extras"] = Value::Object(extras);
        }
        payload
    }
}

#[async_trait]
impl NotificationService for Gotify {
    fn id(&self) -> &'static str {
        "gotify"
    }

    fn parse_url(&mut self, url: &ServiceUrl) -> NotifyResult<()> {
        let host = url.require_host()?;
        let Some((token, path)) = url.path.split_last() else {
            return Err(NotifyError::url("gotify needs an application token as the last path segment"));
        };
        self.config = GotifyConfig {
            secure: url.secure_variant("gotify"),
            host: host.to_string(),
            port: url.port,
            path: path.to_vec(),
            token: token.clone(),
            priority: url.param_parsed("priority")?,
            format: url_format(url)?,
        };
        Ok(())
    }

    async fn send(&self, request: &NotificationRequest) -> NotifyResult<()> {
        let client = self.ctx.client(ClientClass::Webhook, self.id())?;
        let payload = self.build_payload(request);
        let endpoint = self.endpoint();
        send_with_retry(self.id(), || {
            Ok(client
                .post(&endpoint)
                .header("X-Gotify-Key", &self.config.token)
                .json(&payload))
        })
        .await?;
        Ok(())
    }

    fn to_url(&self) -> String {
        let config = &self.config;
        UrlBuilder::new(if config.secure { "gotifys" } else { "gotify" })
            .host(&config.host)
            .port(config.port)
            .segments(&config.path)
            .segment(&config.token)
            .param_opt("priority", config.priority)
            .param_opt("format", config.format)
            .build()
    }

    fn redacted_url(&self) -> String {
        redact_secrets(&self.to_url(), &[self.config.token.as_str()])
    }
}
