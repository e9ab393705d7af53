//! Turning HTTP responses into [`NotifyError`]s.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};

use crate::notifications::error::{NotifyError, NotifyResult};

/// Attempts made for one request when the provider keeps answering 429.
pub const MAX_RATE_LIMIT_ATTEMPTS: u32 = 3;

/// Longest `Retry-After` honoured inside a single send.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Pass successful responses through; map everything else to an error
/// carrying the status and a truncated body.
pub async fn check(response: Response) -> NotifyResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(NotifyError::from_status(status.as_u16(), &body))
}

/// [`check`], discarding the body.
pub async fn ensure_success(response: Response) -> NotifyResult<()> {
    check(response).await.map(|_| ())
}

/// `Retry-After` (seconds, possibly fractional) or Discord's
/// `X-RateLimit-Reset-After`.
pub fn retry_after(response: &Response) -> Option<Duration> {
    ["retry-after", "x-ratelimit-reset-after"]
        .iter()
        .filter_map(|name| response.headers().get(*name))
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.trim().parse::<f64>().ok())
        .find(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| Duration::from_secs_f64(secs).min(MAX_RETRY_AFTER))
}

/// Send the request built by `build`, retrying on 429 up to
/// [`MAX_RATE_LIMIT_ATTEMPTS`] times and sleeping for the advertised delay.
///
/// Bodies that cannot be cloned (streams) must be rebuilt each attempt, hence
/// the builder closure.
pub async fn send_with_retry<F>(service_id: &str, mut build: F) -> NotifyResult<Response>
where
    F: FnMut() -> NotifyResult<RequestBuilder>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let response = build()?.send().await?;
        if response.status() != StatusCode::TOO_MANY_REQUESTS || attempt >= MAX_RATE_LIMIT_ATTEMPTS {
            return check(response).await;
        }
        let wait = retry_after(&response).unwrap_or(Duration::from_secs(1));
        tracing::debug!(
            event = "rate_limited",
            service_id = %service_id,
            attempt,
            wait_ms = wait.as_millis() as u64,
            "provider rate limited the request; retrying"
        );
        tokio::time::sleep(wait).await;
    }
}

/// Parse a JSON response body, mapping decode failures to a provider error.
pub async fn json<T: serde::de::DeserializeOwned>(response: Response) -> NotifyResult<T> {
    let status = response.status().as_u16();
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|err| NotifyError::Provider {
        status,
        body: format!("unexpected response ({err}): {}", crate::notifications::body::truncate(&body, 200)),
    })
}
