//! Office 365 mail through Microsoft Graph.
//!
//! `o365://{client_id}:{client_secret}@{tenant}/{from@domain}[/{to@domain}...][?cc=&bcc=]`
//!
//! `login=` and `graph=` replace the Microsoft identity and Graph base URLs,
//! for national clouds or a local stand-in.
//!
//! Uses the client-credentials grant; the app registration needs the
//! `Mail.Send` application permission.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::http::oauth::{IssuedToken, TokenCache};
use crate::http::pool::ClientClass;
use crate::http::proxy::ProxyConfig;
use crate::http::response::{self, send_with_retry};
use crate::notifications::error::{NotifyError, NotifyResult};
use crate::notifications::service::{AttachmentSupport, NotificationService, ServiceContext};
use crate::notifications::types::{BodyFormat, NotificationRequest};
use crate::notifications::url::{ServiceUrl, UrlBuilder};
use crate::services::{effective_format, required, url_format};

const LOGIN_BASE: &str = "https://login.microsoftonline.com";
const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Office365Config {
    pub client_id: String,
    pub client_secret: String,
    pub tenant: String,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub format: Option<BodyFormat>,
    pub proxy: Option<ProxyConfig>,
    pub login_base: Option<String>,
    pub graph_base: Option<String>,
}

pub struct Office365 {
    ctx: ServiceContext,
    config: Office365Config,
    tokens: TokenCache,
}

#[derive(Debug, Deserialize)]
struct TokenReply {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

fn is_email(value: &str) -> bool {
    match value.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    }
}

fn base_override(url: &ServiceUrl, key: &str) -> NotifyResult<Option<String>> {
    let Some(value) = url.param(key) else {
        return Ok(None);
    };
    let parsed = url::Url::parse(value)
        .map_err(|err| NotifyError::url(format!("o365: invalid {key} URL '{value}': {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(NotifyError::url(format!("o365: {key} URL must be http(s), got '{value}'")));
    }
    Ok(Some(value.trim_end_matches('/').to_string()))
}

fn recipients(addresses: &[String]) -> Value {
    Value::Array(
        addresses
            .iter()
            .map(|address| json!({ "emailAddress": { "address": address } }))
            .collect(),
    )
}

impl Office365 {
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            ctx,
            config: Office365Config::default(),
            tokens: TokenCache::default(),
        }
    }

    pub fn config(&self) -> &Office365Config {
        &self.config
    }

    pub(crate) async fn build_message(&self, request: &NotificationRequest) -> NotifyResult<Value> {
        let config = &self.config;
        let content_type = match effective_format(request, config.format) {
            BodyFormat::Html => "HTML",
            _ => "Text",
        };
        let mut message = json!({
            "subject": if request.title.trim().is_empty() {
                format!("{} notification", request.notify_type)
            } else {
                request.title.clone()
            },
            "body": { "contentType": content_type, "content": request.body },
            "toRecipients": recipients(&config.to),
        });
        if !config.cc.is_empty() {
            message["ccRecipients"] = recipients(&config.cc);
        }
        if !config.bcc.is_empty() {
            message["bccRecipients"] = recipients(&config.bcc);
        }
        if !request.attachments.is_empty() {
            let mut attachments = Vec::with_capacity(request.attachments.len());
            for attachment in &request.attachments {
                attachments.push(json!({
                    "@odata.type": "#microsoft.graph.fileAttachment",
                    "name": attachment.name(),
                    "contentType": attachment.mime_type().await?,
                    "contentBytes": BASE64.encode(attachment.read().await?),
                }));
            }
            message["attachments"] = Value::Array(attachments);
        }
        Ok(json!({ "message": message, "saveToSentItems": false }))
    }

    async fn fetch_token(&self, client: &reqwest::Client) -> NotifyResult<IssuedToken> {
        let config = &self.config;
        let login = config.login_base.as_deref().unwrap_or(LOGIN_BASE);
        let endpoint = format!("{login}/{}/oauth2/v2.0/token", config.tenant);
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
            ("scope", GRAPH_SCOPE),
        ];
        let reply = send_with_retry(self.id(), || Ok(client.post(&endpoint).form(&form))).await?;
        let reply: TokenReply = response::json(reply).await?;
        Ok(IssuedToken {
            token: reply.access_token,
            expires_in: reply.expires_in.map(Duration::from_secs),
        })
    }

    async fn post_mail(&self, client: &reqwest::Client, payload: &Value) -> NotifyResult<()> {
        let token = self.tokens.token(|| self.fetch_token(client)).await?;
        let graph = self.config.graph_base.as_deref().unwrap_or(GRAPH_BASE);
        let endpoint = format!("{graph}/users/{}/sendMail", urlencoding::encode(&self.config.from));
        send_with_retry(self.id(), || Ok(client.post(&endpoint).bearer_auth(&token).json(payload))).await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationService for Office365 {
    fn id(&self) -> &'static str {
        "o365"
    }

    fn parse_url(&mut self, url: &ServiceUrl) -> NotifyResult<()> {
        let client_id = required(url.user.as_deref(), "client id", "o365")?;
        let client_secret = required(url.password.as_deref(), "client secret", "o365")?;
        let tenant = url.require_host()?;
        let Some((from, rest)) = url.path.split_first() else {
            return Err(NotifyError::url("o365 needs a sender address as the first path segment"));
        };
        let mut to = rest.to_vec();
        to.extend(url.param_list("to"));
        if to.is_empty() {
            to.push(from.clone());
        }
        let config = Office365Config {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            tenant: tenant.to_string(),
            from: from.clone(),
            to,
            cc: url.param_list("cc"),
            bcc: url.param_list("bcc"),
            format: url_format(url)?,
            proxy: ProxyConfig::from_service_url(url)?,
            login_base: base_override(url, "login")?,
            graph_base: base_override(url, "graph")?,
        };
        for address in std::iter::once(&config.from).chain(&config.to).chain(&config.cc).chain(&config.bcc) {
            if !is_email(address) {
                return Err(NotifyError::config(format!("o365: '{address}' is not an email address")));
            }
        }
        self.tokens = TokenCache::default();
        self.config = config;
        Ok(())
    }

    async fn send(&self, request: &NotificationRequest) -> NotifyResult<()> {
        let client = self.ctx.client(ClientClass::Cloud, self.id())?;
        let payload = self.build_message(request).await?;

        if let Some(proxy) = &self.config.proxy {
            let envelope = proxy.envelope(
                self.id(),
                json!({
                    "tenant": self.config.tenant,
                    "client_id": self.config.client_id,
                    "client_secret": self.config.client_secret,
                }),
                json!({ "from": self.config.from, "mail": payload }),
            );
            return proxy.send(&client, &envelope).await;
        }

        match self.post_mail(&client, &payload).await {
            Err(err) if err.is_auth() => {
                tracing::debug!(event = "token_rejected", service_id = %self.id(), "graph rejected the access token; refreshing");
                self.tokens.invalidate();
                self.post_mail(&client, &payload).await
            }
            other => other,
        }
    }

    fn attachment_support(&self) -> AttachmentSupport {
        AttachmentSupport::Content
    }

    fn to_url(&self) -> String {
        let config = &self.config;
        let list = |items: &[String]| (!items.is_empty()).then(|| items.join(","));
        let builder = UrlBuilder::new("o365")
            .user(Some(&config.client_id))
            .password(Some(&config.client_secret))
            .host(&config.tenant)
            .segment(&config.from)
            .segments(&config.to)
            .param_opt("cc", list(&config.cc))
            .param_opt("bcc", list(&config.bcc))
            .param_opt("format", config.format)
            .param_opt("login", config.login_base.as_ref())
            .param_opt("graph", config.graph_base.as_ref());
        match &config.proxy {
            Some(proxy) => proxy.append_to(builder).build(),
            None => builder.build(),
        }
    }
}
