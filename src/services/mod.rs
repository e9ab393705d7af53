//! Built-in notification services.
//!
//! Every service owns its parsed configuration in a plain `*Config` struct so
//! that `parse_url(to_url())` can be checked for equality, and borrows HTTP
//! clients from the shared pools at send time.

use std::future::Future;

use crate::notifications::error::{NotifyError, NotifyResult};
use crate::notifications::registry::ServiceEntry;
use crate::notifications::types::{BodyFormat, NotificationRequest};
use crate::notifications::url::ServiceUrl;

pub mod discord;
pub mod email;
pub mod gotify;
pub mod matrix;
pub mod ntfy;
pub mod office365;
pub mod pushover;
pub mod slack;
pub mod sns;
pub mod telegram;
pub mod twilio;
pub mod webhook;

pub fn builtin_entries() -> Vec<ServiceEntry> {
    vec![
        ServiceEntry::new("Discord", &["discord"], |ctx| {
            Box::new(discord::Discord::new(ctx.clone()))
        }),
        ServiceEntry::new("Slack", &["slack"], |ctx| Box::new(slack::Slack::new(ctx.clone()))),
        ServiceEntry::new("Telegram", &["tgram", "telegram"], |ctx| {
            Box::new(telegram::Telegram::new(ctx.clone()))
        }),
        ServiceEntry::new("JSON webhook", &["json", "jsons", "webhook", "webhooks"], |ctx| {
            Box::new(webhook::JsonWebhook::new(ctx.clone()))
        }),
        ServiceEntry::new("Email", &["mailto", "mailtos"], |_| Box::new(email::Email::new())),
        ServiceEntry::new("Pushover", &["pushover"], |ctx| {
            Box::new(pushover::Pushover::new(ctx.clone()))
        }),
        ServiceEntry::new("ntfy", &["ntfy", "ntfys"], |ctx| Box::new(ntfy::Ntfy::new(ctx.clone()))),
        ServiceEntry::new("Gotify", &["gotify", "gotifys"], |ctx| {
            Box::new(gotify::Gotify::new(ctx.clone()))
        }),
        ServiceEntry::new("Matrix", &["matrix", "matrixs"], |ctx| {
            Box::new(matrix::Matrix::new(ctx.clone()))
        }),
        ServiceEntry::new("AWS SNS SMS", &["aws-sns-sms", "sns"], |ctx| {
            Box::new(sns::Sns::new(ctx.clone()))
        }),
        ServiceEntry::new("Office 365", &["o365", "outlook365"], |ctx| {
            Box::new(office365::Office365::new(ctx.clone()))
        }),
        ServiceEntry::new("Twilio", &["twilio"], |ctx| Box::new(twilio::Twilio::new(ctx.clone()))),
    ]
}

/// `format=` from the URL, if any.
pub(crate) fn url_format(url: &ServiceUrl) -> NotifyResult<Option<BodyFormat>> {
    match url.param("format") {
        None => Ok(None),
        Some(value) => value
            .parse::<BodyFormat>()
            .map(Some)
            .map_err(NotifyError::url),
    }
}

/// The request's format, else the destination default, else plain text.
pub(crate) fn effective_format(request: &NotificationRequest, configured: Option<BodyFormat>) -> BodyFormat {
    request.body_format.or(configured).unwrap_or(BodyFormat::Text)
}

pub(crate) fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Run `send` for every recipient. Every recipient is attempted; the result
/// is the first failure, if any.
pub(crate) async fn deliver_each<'a, T, F, Fut>(service_id: &str, recipients: &'a [T], mut send: F) -> NotifyResult<()>
where
    T: std::fmt::Display + 'a,
    F: FnMut(&'a T) -> Fut,
    Fut: Future<Output = NotifyResult<()>>,
{
    let mut first_error = None;
    let mut failed = 0usize;
    for recipient in recipients {
        if let Err(err) = send(recipient).await {
            failed += 1;
            tracing::warn!(
                event = "recipient_failed",
                service_id = %service_id,
                recipient = %recipient,
                error = %err,
                "delivery to recipient failed"
            );
            first_error.get_or_insert(err);
        }
    }
    match first_error {
        None => Ok(()),
        Some(err) => {
            tracing::debug!(
                event = "partial_delivery",
                service_id = %service_id,
                failed,
                total = recipients.len(),
                "not every recipient received the notification"
            );
            Err(err)
        }
    }
}

/// Credentials that must be present for a service to be usable.
pub(crate) fn required<'a>(value: Option<&'a str>, what: &str, service: &str) -> NotifyResult<&'a str> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| NotifyError::url(format!("{service}: missing {what}")))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use crate::http::HttpPools;
    use crate::notifications::error::NotifyResult;
    use crate::notifications::service::{NotificationService, ServiceContext};
    use crate::notifications::url::ServiceUrl;

    pub fn context() -> ServiceContext {
        ServiceContext::new(Arc::new(HttpPools::new()))
    }

    pub fn try_configure<S: NotificationService>(mut service: S, url: &str) -> NotifyResult<S> {
        service.parse_url(&ServiceUrl::parse(url)?)?;
        Ok(service)
    }

    pub fn configure<S: NotificationService>(service: S, url: &str) -> S {
        match try_configure(service, url) {
            Ok(service) => service,
            Err(err) => panic!("failed to configure from {url}: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[tokio::test]
    async fn deliver_each_attempts_everyone_and_keeps_first_error() {
        let seen = Mutex::new(Vec::new());
        let recipients = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let result = deliver_each("test", &recipients, |recipient| {
            seen.lock().unwrap().push(recipient.clone());
            let recipient = recipient.clone();
            async move {
                match recipient.as_str() {
                    "a" => Err(NotifyError::Transport("first".to_string())),
                    "b" => Err(NotifyError::Transport("second".to_string())),
                    _ => Ok(()),
                }
            }
        })
        .await;
        assert_eq!(result, Err(NotifyError::Transport("first".to_string())));
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn format_precedence() {
        let url = ServiceUrl::parse("json://host/?format=html").unwrap();
        let configured = url_format(&url).unwrap();
        let mut request = NotificationRequest::default();
        assert_eq!(effective_format(&request, configured), BodyFormat::Html);
        request.body_format = Some(BodyFormat::Markdown);
        assert_eq!(effective_format(&request, configured), BodyFormat::Markdown);
        assert_eq!(effective_format(&NotificationRequest::default(), None), BodyFormat::Text);
        let bad = ServiceUrl::parse("json://host/?format=rtf").unwrap();
        assert!(url_format(&bad).is_err());
    }

    #[test]
    fn escapes_html() {
        assert_eq!(escape_html("<b>&\"</b>"), "&lt;b&gt;&amp;&quot;&lt;/b&gt;");
    }
}
