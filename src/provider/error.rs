use std::fmt;

/// Classified upstream failure — tells the retry layer *why* the completion
/// call failed so its classifier can decide whether another attempt makes
/// sense.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// 401/403 — bad API key or permissions.
    Auth,
    /// 402 — billing/quota exhausted.
    Billing,
    /// 429 — provider-side rate limit.
    RateLimit,
    /// 404 or "model not found" — bad model name.
    NotFound,
    /// 400/422 — the request itself is malformed; retrying cannot help.
    BadRequest,
    /// 408 or the HTTP client timed out.
    Timeout,
    /// Connection refused, DNS failure, reset, etc.
    Network,
    /// 500/502/503/504 — provider-side outage.
    ServerError,
    /// Response arrived but did not have the expected completion shape.
    Malformed,
    /// Anything else.
    Unknown,
}

impl ProviderError {
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            400 | 422 => ProviderErrorKind::BadRequest,
            401 | 403 => ProviderErrorKind::Auth,
            402 => ProviderErrorKind::Billing,
            404 => ProviderErrorKind::NotFound,
            408 => ProviderErrorKind::Timeout,
            429 => ProviderErrorKind::RateLimit,
            500 | 502 | 503 | 504 => ProviderErrorKind::ServerError,
            _ => ProviderErrorKind::Unknown,
        };
        Self {
            kind,
            status: Some(status),
            message: truncate_body(body),
        }
    }

    pub fn network(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ProviderErrorKind::Timeout
        } else {
            ProviderErrorKind::Network
        };
        Self {
            kind,
            status: None,
            message: err.to_string(),
        }
    }

    /// The response body parsed, but the completion content was missing.
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Malformed,
            status: None,
            message: detail.into(),
        }
    }

    /// Whether a fresh attempt at the same request can plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::RateLimit
                | ProviderErrorKind::Timeout
                | ProviderErrorKind::Network
                | ProviderErrorKind::ServerError
        )
    }

    /// First `max` characters of the error text, for user-facing apologies.
    /// Never exposes more than that of provider internals.
    pub fn excerpt(&self, max: usize) -> String {
        let mut end = self.message.len().min(max);
        while end > 0 && !self.message.is_char_boundary(end) {
            end -= 1;
        }
        self.message[..end].to_string()
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(status) = self.status {
            write!(f, "upstream error ({}, {:?}): {}", status, self.kind, self.message)
        } else {
            write!(f, "upstream error ({:?}): {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for ProviderError {}

fn truncate_body(body: &str) -> String {
    if body.len() > 300 {
        let mut end = 300;
        while end > 0 && !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    } else {
        body.to_string()
    }
}
