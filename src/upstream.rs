use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::provider::{ModelProvider, ProviderError};

/// Bounded exponential backoff: `base * 2^(n-2)` before attempt `n`,
/// capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep before attempt `attempt` (numbered from 1; attempt 1
    /// has no delay). Defaults give 2s before attempt 2 and 4s before
    /// attempt 3.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let doublings = attempt.saturating_sub(2).min(32);
        let delay = self.base_delay.saturating_mul(1u32 << doublings);
        delay.min(self.max_delay)
    }
}

/// Decides whether a failed attempt is worth repeating.
///
/// Supplied by the caller so the retry loop stays policy-free. The shipped
/// default is [`RetryTransient`]; [`RetryEverything`] reproduces the blunt
/// retry-on-any-error behaviour some deployments still want, at the cost of
/// burning attempts on requests that can never succeed.
pub trait RetryClassifier: Send + Sync {
    fn is_retryable(&self, err: &ProviderError) -> bool;
}

/// Retry only failures that can plausibly clear up on their own: timeouts,
/// network errors, provider rate limits and 5xx outages.
pub struct RetryTransient;

impl RetryClassifier for RetryTransient {
    fn is_retryable(&self, err: &ProviderError) -> bool {
        err.is_transient()
    }
}

/// Retry every failure indiscriminately. Kept as an explicit, documented
/// fallback (`provider.retry_all_errors = true`); not the default because it
/// wastes attempts on malformed requests and auth failures.
pub struct RetryEverything;

impl RetryClassifier for RetryEverything {
    fn is_retryable(&self, _err: &ProviderError) -> bool {
        true
    }
}

/// Terminal upstream failure, surfaced after the retry budget is spent.
#[derive(Debug, Clone)]
pub struct UpstreamError {
    pub attempts: u32,
    pub cause: ProviderError,
}

impl UpstreamError {
    /// Generic apology with a bounded excerpt of the underlying error.
    /// Never exposes more than 100 characters of provider internals.
    pub fn user_message(&self) -> String {
        crate::templates::upstream_error(&self.cause.excerpt(100))
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upstream failed after {} attempt(s): {}", self.attempts, self.cause)
    }
}

impl std::error::Error for UpstreamError {}

/// Wraps a [`ModelProvider`] with bounded retry. Every call runs the full
/// attempt sequence independently; there is no circuit breaker and no
/// cross-request backoff sharing.
pub struct RetryingUpstreamClient {
    provider: Arc<dyn ModelProvider>,
    policy: RetryPolicy,
    classifier: Arc<dyn RetryClassifier>,
    temperature: f32,
}

impl RetryingUpstreamClient {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        policy: RetryPolicy,
        classifier: Arc<dyn RetryClassifier>,
        temperature: f32,
    ) -> Self {
        Self {
            provider,
            policy,
            classifier,
            temperature,
        }
    }

    pub async fn complete(&self, model: &str, messages: &[Value]) -> Result<String, UpstreamError> {
        let mut attempt = 1u32;
        loop {
            match self
                .provider
                .complete(model, messages, self.temperature)
                .await
            {
                Ok(text) => return Ok(text),
                Err(cause) => {
                    let exhausted = attempt >= self.policy.max_attempts;
                    if exhausted || !self.classifier.is_retryable(&cause) {
                        return Err(UpstreamError { attempts: attempt, cause });
                    }
                    let delay = self.policy.delay_before(attempt + 1);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Upstream attempt failed, retrying: {}",
                        cause
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Provider stub that fails `failures` times, then succeeds.
    struct FlakyProvider {
        calls: AtomicU32,
        failures: u32,
        error: ProviderError,
    }

    impl FlakyProvider {
        fn new(failures: u32, error: ProviderError) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                error,
            }
        }
    }

    #[async_trait]
    impl ModelProvider for FlakyProvider {
        async fn complete(
            &self,
            _model: &str,
            _messages: &[Value],
            _temperature: f32,
        ) -> Result<String, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.error.clone())
            } else {
                Ok("ok".to_string())
            }
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    fn transient_error() -> ProviderError {
        ProviderError::from_status(503, "unavailable")
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let provider = Arc::new(FlakyProvider::new(2, transient_error()));
        let client = RetryingUpstreamClient::new(
            provider.clone(),
            fast_policy(),
            Arc::new(RetryTransient),
            0.7,
        );

        let out = client.complete("m", &[]).await.unwrap();
        assert_eq!(out, "ok");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_reports_cause() {
        let provider = Arc::new(FlakyProvider::new(10, transient_error()));
        let client = RetryingUpstreamClient::new(
            provider.clone(),
            fast_policy(),
            Arc::new(RetryTransient),
            0.7,
        );

        let err = client.complete("m", &[]).await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.cause.status, Some(503));
    }

    #[tokio::test]
    async fn non_retryable_fails_on_first_attempt() {
        let auth_error = ProviderError::from_status(401, "bad key");
        let provider = Arc::new(FlakyProvider::new(10, auth_error));
        let client = RetryingUpstreamClient::new(
            provider.clone(),
            fast_policy(),
            Arc::new(RetryTransient),
            0.7,
        );

        let err = client.complete("m", &[]).await.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_everything_burns_the_full_budget() {
        let auth_error = ProviderError::from_status(401, "bad key");
        let provider = Arc::new(FlakyProvider::new(10, auth_error));
        let client = RetryingUpstreamClient::new(
            provider.clone(),
            fast_policy(),
            Arc::new(RetryEverything),
            0.7,
        );

        let err = client.complete("m", &[]).await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_secs(2));
        assert_eq!(policy.delay_before(3), Duration::from_secs(4));
        // Hypothetical longer sequences stay capped and non-decreasing.
        assert_eq!(policy.delay_before(4), Duration::from_secs(8));
        assert_eq!(policy.delay_before(5), Duration::from_secs(10));
        assert_eq!(policy.delay_before(9), Duration::from_secs(10));
    }

    #[test]
    fn user_message_truncates_internals() {
        let err = UpstreamError {
            attempts: 3,
            cause: ProviderError::malformed("x".repeat(500)),
        };
        let msg = err.user_message();
        // 100 chars of cause plus the apology wrapper, nothing more.
        assert!(msg.len() < 200, "message too long: {}", msg.len());
    }
}
