//! Request plumbing shared by the reqwest clients: deadlines, status
//! classification and retry with exponential backoff.

use crate::config::Platform;
use crate::error::{ApiError, ApiErrorKind};
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &Platform) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: Duration::from_millis(cfg.retry_base_ms),
            max_delay: Duration::from_secs(60),
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// base * 2^attempt, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn delay_for(&self, err: &ApiError, attempt: u32) -> Duration {
        match err.kind {
            ApiErrorKind::RateLimited {
                retry_after: Some(wait),
            } => wait.min(self.max_delay),
            _ => self.backoff(attempt),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the retry
/// budget is spent. A 429 waits for the server's `Retry-After` when given.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay_for(&err, attempt);
                warn!(what, attempt, delay_ms = delay.as_millis() as u64, %err, "retrying remote call");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Send a request under a deadline and turn non-success statuses into errors.
pub async fn send(request: RequestBuilder, timeout: Duration, what: &str) -> Result<Response, ApiError> {
    let response = match tokio::time::timeout(timeout, request.send()).await {
        Ok(result) => result.map_err(ApiError::from_reqwest)?,
        Err(_) => return Err(ApiError::timeout(what, timeout)),
    };
    check_response(response).await
}

pub async fn send_json<T: DeserializeOwned>(
    request: RequestBuilder,
    timeout: Duration,
    what: &str,
) -> Result<T, ApiError> {
    let response = send(request, timeout, what).await?;
    let text = response.text().await.map_err(ApiError::from_reqwest)?;
    if text.trim().is_empty() {
        // Empty success bodies decode as JSON null.
        return serde_json::from_value(serde_json::Value::Null)
            .map_err(|e| ApiError::decode(format!("{what}: empty body: {e}")));
    }
    serde_json::from_str(&text).map_err(|e| ApiError::decode(format!("{what}: {e}")))
}

pub async fn check_response(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::from_status(status, retry_after, &body))
}

/// `Retry-After` in delta-seconds form.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Total from a `Content-Range` value such as `0-999/12345` or `*/0`.
pub fn parse_content_range(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderValue, RETRY_AFTER};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[test]
    fn content_range_totals() {
        assert_eq!(parse_content_range("0-999/12345"), Some(12345));
        assert_eq!(parse_content_range("*/0"), Some(0));
        assert_eq!(parse_content_range("0-9/*"), None);
        assert_eq!(parse_content_range("garbage"), None);
    }

    #[test]
    fn retry_after_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(p.backoff(0), Duration::from_secs(1));
        assert_eq!(p.backoff(1), Duration::from_secs(2));
        assert_eq!(p.backoff(2), Duration::from_secs(4));
        assert_eq!(p.backoff(3), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let res: Result<(), ApiError> = with_retry(&fast(3), "call", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::new(ApiErrorKind::Server(503), "busy"))
            }
        })
        .await;
        assert_eq!(res.unwrap_err().kind, ApiErrorKind::Server(503));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn client_errors_pass_through() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let res: Result<(), ApiError> = with_retry(&fast(3), "call", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(ApiError::new(ApiErrorKind::Client(400), "bad"))
            }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limited_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let res = with_retry(&fast(2), "call", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ApiError::new(
                        ApiErrorKind::RateLimited {
                            retry_after: Some(Duration::ZERO),
                        },
                        "slow down",
                    ))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(res.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
