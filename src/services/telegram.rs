//! Telegram Bot API.
//!
//! `tgram://{bot_token}/{chat_id}[/{chat_id}...][?format=html&silent=yes&preview=no&topic=42]`
//!
//! Long bodies are split into several messages rather than cut. Attachments
//! are uploaded with `sendDocument`, one per chat.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::{Value, json};

use crate::http::limiter::TokenBucket;
use crate::http::pool::ClientClass;
use crate::http::response::send_with_retry;
use crate::notifications::body::split;
use crate::notifications::error::{NotifyError, NotifyResult};
use crate::notifications::service::{AttachmentSupport, NotificationService, ServiceContext};
use crate::notifications::types::{BodyFormat, NotificationRequest};
use crate::notifications::url::{ServiceUrl, UrlBuilder, redact_secrets};
use crate::services::{deliver_each, effective_format, escape_html, url_format};

const API_BASE: &str = "https://api.telegram.org";
const MAX_BODY: usize = 4096;
/// Telegram's documented global bot limit.
const REQUESTS_PER_SECOND: f64 = 30.0;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_ids: Vec<String>,
    pub silent: bool,
    pub preview: bool,
    pub topic: Option<i64>,
    pub format: Option<BodyFormat>,
}

pub struct Telegram {
    ctx: ServiceContext,
    config: TelegramConfig,
    bucket: TokenBucket,
}

impl Telegram {
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            ctx,
            config: TelegramConfig::default(),
            bucket: TokenBucket::new(REQUESTS_PER_SECOND, REQUESTS_PER_SECOND as u32),
        }
    }

    pub fn config(&self) -> &TelegramConfig {
        &self.config
    }

    fn method_url(&self, method: &str) -> String {
        format!("{API_BASE}/bot{}/{method}", self.config.bot_token)
    }

    /// Message texts for one chat, split to the provider limit.
    pub(crate) fn render_messages(&self, request: &NotificationRequest) -> (Vec<String>, Option<&'static str>) {
        let format = effective_format(request, self.config.format);
        let title = request.title.trim();
        let (text, parse_mode) = match format {
            BodyFormat::Html => {
                let text = if title.is_empty() {
                    request.body.clone()
                } else {
                    format!("<b>{}</b>\n{}", escape_html(title), request.body)
                };
                (text, Some("HTML"))
            }
            BodyFormat::Markdown => {
                let text = if title.is_empty() {
                    request.body.clone()
                } else {
                    format!("*{title}*\n{}", request.body)
                };
                (text, Some("Markdown"))
            }
            BodyFormat::Text => (
                format!("{} {}", request.notify_type.emoji(), request.title_and_body()),
                None,
            ),
        };
        (split(&text, MAX_BODY), parse_mode)
    }

    fn message_payload(&self, chat_id: &str, text: &str, parse_mode: Option<&str>) -> Value {
        let mut payload = json!({
            "chat_id": chat_id,
            "text": text,
            "disable_notification": self.config.silent,
            "disable_web_page_preview": !self.config.preview,
        });
        if let Some(mode) = parse_mode {
            payload["parse_mode"] = json!(mode);
        }
        if let Some(topic) = self.config.topic {
            payload["message_thread_id"] = json!(topic);
        }
        payload
    }

    async fn send_to_chat(&self, client: &reqwest::Client, chat_id: &str, request: &NotificationRequest) -> NotifyResult<()> {
        let (messages, parse_mode) = self.render_messages(request);
        let endpoint = self.method_url("sendMessage");
        for text in &messages {
            let payload = self.message_payload(chat_id, text, parse_mode);
            self.bucket.acquire().await;
            send_with_retry(self.id(), || Ok(client.post(&endpoint).json(&payload))).await?;
        }

        let endpoint = self.method_url("sendDocument");
        for attachment in &request.attachments {
            let bytes = attachment.read().await?;
            let mime = attachment.mime_type().await?;
            let name = attachment.name().to_string();
            self.bucket.acquire().await;
            send_with_retry(self.id(), || {
                let document = Part::stream(bytes.clone())
                    .file_name(name.clone())
                    .mime_str(&mime)?;
                let mut form = Form::new()
                    .text("chat_id", chat_id.to_string())
                    .text("disable_notification", self.config.silent.to_string())
                    .part("document", document);
                if let Some(topic) = self.config.topic {
                    form = form.text("message_thread_id", topic.to_string());
                }
                Ok(client.post(&endpoint).multipart(form))
            })
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationService for Telegram {
    fn id(&self) -> &'static str {
        "tgram"
    }

    fn parse_url(&mut self, url: &ServiceUrl) -> NotifyResult<()> {
        let bot_token = url.require_host()?;
        if !bot_token.contains(':') {
            return Err(NotifyError::url("telegram bot token must look like 123456:ABC..."));
        }
        let mut chat_ids = url.path.clone();
        chat_ids.extend(url.param_list("to"));
        if chat_ids.is_empty() {
            return Err(NotifyError::url("telegram needs at least one chat id"));
        }
        self.config = TelegramConfig {
            bot_token: bot_token.to_string(),
            chat_ids,
            silent: url.param_bool("silent")?.unwrap_or(false),
            preview: url.param_bool("preview")?.unwrap_or(false),
            topic: url.param_parsed("topic")?,
            format: url_format(url)?,
        };
        Ok(())
    }

    async fn send(&self, request: &NotificationRequest) -> NotifyResult<()> {
        let client = self.ctx.client(ClientClass::Webhook, self.id())?;
        deliver_each(self.id(), &self.config.chat_ids, |chat_id| {
            let client = client.clone();
            async move { self.send_to_chat(&client, chat_id, request).await }
        })
        .await
    }

    fn attachment_support(&self) -> AttachmentSupport {
        AttachmentSupport::Content
    }

    fn max_body_length(&self) -> usize {
        MAX_BODY
    }

    fn to_url(&self) -> String {
        let config = &self.config;
        UrlBuilder::new("tgram")
            .host(&config.bot_token)
            .segments(&config.chat_ids)
            .param_opt("silent", config.silent.then_some("yes"))
            .param_opt("preview", config.preview.then_some("yes"))
            .param_opt("topic", config.topic)
            .param_opt("format", config.format)
            .build()
    }

    fn redacted_url(&self) -> String {
        redact_secrets(&self.to_url(), &[self.config.bot_token.as_str()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::types::NotifyType;
    use crate::services::testing::{configure, context, try_configure};

    #[test]
    fn parses_token_and_chats() {
        let service = configure(
            Telegram::new(context()),
            "telegram://123456789:AAEx-Abc_def/-1001234567/@channel?silent=yes&topic=7",
        );
        let config = service.config();
        assert_eq!(config.bot_token, "123456789:AAEx-Abc_def");
        assert_eq!(config.chat_ids, vec!["-1001234567", "@channel"]);
        assert!(config.silent);
        assert_eq!(config.topic, Some(7));
        let again = configure(Telegram::new(context()), &service.to_url());
        assert_eq!(again.config(), config);
        assert_eq!(
            service.method_url("sendMessage"),
            "https://api.telegram.org/bot123456789:AAEx-Abc_def/sendMessage"
        );
    }

    #[test]
    fn rejects_missing_chat_or_malformed_token() {
        assert!(try_configure(Telegram::new(context()), "tgram://123:abc").is_err());
        assert!(try_configure(Telegram::new(context()), "tgram://nocolon/42").is_err());
    }

    #[test]
    fn long_bodies_are_split() {
        let service = configure(Telegram::new(context()), "tgram://1:a/42");
        let request = NotificationRequest::new("T", "word ".repeat(2000), NotifyType::Info);
        let (messages, parse_mode) = service.render_messages(&request);
        assert_eq!(parse_mode, None);
        assert!(messages.len() >= 3);
        assert!(messages.iter().all(|m| m.chars().count() <= MAX_BODY));
    }

    #[test]
    fn html_titles_are_escaped() {
        let service = configure(Telegram::new(context()), "tgram://1:a/42?format=html");
        let request = NotificationRequest::new("a<b", "<i>x</i>", NotifyType::Info);
        let (messages, parse_mode) = service.render_messages(&request);
        assert_eq!(parse_mode, Some("HTML"));
        assert_eq!(messages[0], "<b>a&lt;b</b>\n<i>x</i>");
        let payload = service.message_payload("42", &messages[0], parse_mode);
        assert_eq!(payload["parse_mode"], "HTML");
        assert_eq!(payload["disable_web_page_preview"], true);
    }

    #[test]
    fn redaction_hides_bot_token() {
        let service = configure(Telegram::new(context()), "tgram://123456789:AAEx-Abc_def/-1001234567");
        let redacted = service.redacted_url();
        assert!(!redacted.contains("AAEx-Abc_def"));
        assert!(redacted.ends_with("/-1001234567"));
    }
}
