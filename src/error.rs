//! Error types shared by the remote clients and the pipelines.
//!
//! Remote failures are classified from the HTTP status and headers when the
//! response is received, so callers branch on [`ApiErrorKind`] instead of
//! inspecting message text.

use reqwest::StatusCode;
use std::fmt;
use std::time::Duration;

/// Category of a failed remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// The call did not complete within its deadline.
    Timeout,
    /// HTTP 429, with the server-provided wait when present.
    RateLimited { retry_after: Option<Duration> },
    /// HTTP 5xx.
    Server(u16),
    NotFound,
    Conflict,
    /// Any other 4xx. Covers malformed statements rejected by the migration endpoint.
    Client(u16),
    /// Connection reset, DNS failure and similar.
    Transport,
    /// The response body could not be decoded.
    Decode,
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiErrorKind::Timeout => f.write_str("timeout"),
            ApiErrorKind::RateLimited { .. } => f.write_str("rate limited (429)"),
            ApiErrorKind::Server(code) => write!(f, "server error ({code})"),
            ApiErrorKind::NotFound => f.write_str("not found (404)"),
            ApiErrorKind::Conflict => f.write_str("conflict (409)"),
            ApiErrorKind::Client(code) => write!(f, "client error ({code})"),
            ApiErrorKind::Transport => f.write_str("transport error"),
            ApiErrorKind::Decode => f.write_str("decode error"),
        }
    }
}

/// Error raised by a call to the control plane, an instance or blob storage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> Self {
        let kind = match status.as_u16() {
            429 => ApiErrorKind::RateLimited { retry_after },
            404 => ApiErrorKind::NotFound,
            409 => ApiErrorKind::Conflict,
            code @ 500..=599 => ApiErrorKind::Server(code),
            code => ApiErrorKind::Client(code),
        };
        Self::new(kind, truncate(body, 500))
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ApiErrorKind::Timeout
        } else if err.is_decode() {
            ApiErrorKind::Decode
        } else if let Some(status) = err.status() {
            return Self::from_status(status, None, &err.to_string());
        } else {
            ApiErrorKind::Transport
        };
        Self::new(kind, err.to_string())
    }

    pub fn timeout(what: &str, after: Duration) -> Self {
        Self::new(
            ApiErrorKind::Timeout,
            format!("{what} timed out after {}s", after.as_secs()),
        )
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Decode, message)
    }

    /// Transient failures are worth retrying after a delay.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ApiErrorKind::Timeout
                | ApiErrorKind::RateLimited { .. }
                | ApiErrorKind::Server(_)
                | ApiErrorKind::Transport
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ApiErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == ApiErrorKind::Conflict
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

/// Outcome of a pipeline that did not complete.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The operation was cancelled at a phase boundary.
    #[error("operation cancelled")]
    Cancelled,
    /// The process is shutting down. The ledger row is left resumable.
    #[error("operation interrupted by shutdown")]
    Interrupted,
    /// An unrecoverable failure attributed to one phase.
    #[error("{phase}: {message}")]
    Fatal { phase: String, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RunError {
    pub fn fatal(phase: impl Into<String>, message: impl Into<String>) -> Self {
        RunError::Fatal {
            phase: phase.into(),
            message: message.into(),
        }
    }

    /// Phase tag recorded alongside the failure.
    pub fn phase(&self) -> Option<&str> {
        match self {
            RunError::Fatal { phase, .. } => Some(phase),
            _ => None,
        }
    }
}

impl From<ApiError> for RunError {
    fn from(err: ApiError) -> Self {
        RunError::Other(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_statuses() {
        let e = ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3)), "");
        assert_eq!(
            e.kind,
            ApiErrorKind::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        assert!(e.is_transient());

        let e = ApiError::from_status(StatusCode::BAD_GATEWAY, None, "upstream");
        assert_eq!(e.kind, ApiErrorKind::Server(502));
        assert!(e.is_transient());

        let e = ApiError::from_status(StatusCode::BAD_REQUEST, None, "syntax error at or near");
        assert_eq!(e.kind, ApiErrorKind::Client(400));
        assert!(!e.is_transient());

        assert!(ApiError::from_status(StatusCode::NOT_FOUND, None, "").is_not_found());
        assert!(ApiError::from_status(StatusCode::CONFLICT, None, "").is_conflict());
        assert!(ApiError::timeout("migration", Duration::from_secs(30)).is_transient());
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "é".repeat(400);
        let e = ApiError::from_status(StatusCode::BAD_REQUEST, None, &body);
        assert!(e.message.len() <= 504);
        assert!(e.message.ends_with('…'));
    }

    #[test]
    fn run_error_phase() {
        let e = RunError::fatal("tables", "no tables created");
        assert_eq!(e.phase(), Some("tables"));
        assert_eq!(e.to_string(), "tables: no tables created");
        assert!(RunError::Cancelled.phase().is_none());
        assert!(RunError::Interrupted.phase().is_none());
    }
}
