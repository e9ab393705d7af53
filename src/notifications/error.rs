use std::time::Duration;

use crate::attachments::AttachmentError;

/// Longest provider response body kept in an error.
pub const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("unknown scheme '{0}'")]
    UnknownScheme(String),
    #[error("invalid URL: {0}")]
    UrlParse(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("authentication failed ({status}): {body}")]
    Auth { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider returned {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("notification canceled")]
    Canceled,
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
    #[error(transparent)]
    Attachment(#[from] AttachmentError),
    #[error("service panicked: {0}")]
    Panicked(String),
}

impl NotifyError {
    pub fn url(message: impl Into<String>) -> Self {
        NotifyError::UrlParse(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        NotifyError::Configuration(message.into())
    }

    /// Classify a non-success HTTP status with its (truncated) body.
    pub fn from_status(status: u16, body: &str) -> Self {
        let body = crate::notifications::body::truncate(body.trim(), MAX_ERROR_BODY);
        match status {
            401 | 403 => NotifyError::Auth { status, body },
            _ => NotifyError::Provider { status, body },
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, NotifyError::Auth { .. })
    }

    /// Errors raised while registering a destination rather than sending to it.
    pub fn is_registration_error(&self) -> bool {
        matches!(
            self,
            NotifyError::UnknownScheme(_) | NotifyError::UrlParse(_) | NotifyError::Configuration(_)
        )
    }
}

impl From<reqwest::Error> for NotifyError {
    fn from(err: reqwest::Error) -> Self {
        // Several services carry their credentials in the request path.
        let err = err.without_url();
        if let Some(status) = err.status() {
            return NotifyError::from_status(status.as_u16(), &err.to_string());
        }
        NotifyError::Transport(describe_transport_error(&err))
    }
}

fn describe_transport_error(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

pub type NotifyResult<T> = Result<T, NotifyError>;

#[cfg(test)]
mod tests {
    use super::NotifyError;

    #[test]
    fn status_classification() {
        assert!(NotifyError::from_status(401, "nope").is_auth());
        assert!(NotifyError::from_status(403, "nope").is_auth());
        match NotifyError::from_status(500, "boom") {
            NotifyError::Provider { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn provider_body_is_truncated() {
        let body = "x".repeat(2000);
        match NotifyError::from_status(502, &body) {
            NotifyError::Provider { body, .. } => assert!(body.chars().count() <= super::MAX_ERROR_BODY),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_errors_drop_the_request_url() {
        let err = reqwest::Client::new()
            .get("http://127.0.0.1:1/api/webhooks/42/SECRETWEBHOOKTOKEN")
            .send()
            .await
            .unwrap_err();
        let converted = NotifyError::from(err);
        assert!(matches!(converted, NotifyError::Transport(_)));
        assert!(!converted.to_string().contains("SECRETWEBHOOKTOKEN"));
    }
}
