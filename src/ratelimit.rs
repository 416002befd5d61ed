use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

/// Sliding window for the burst gate.
const BURST_WINDOW: Duration = Duration::from_secs(60);

/// Why a request was turned away at the gate.
///
/// Both variants are user-facing and retryable by the user after the stated
/// delay; the gateway itself never retries past a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    /// Requests spaced closer than the cooldown. Retry after `remaining_secs`.
    Cooldown { remaining_secs: u64 },
    /// More than `max_per_minute` requests in the trailing 60 seconds.
    Burst { max_per_minute: usize },
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::Cooldown { remaining_secs } => {
                write!(f, "cooldown: retry in {}s", remaining_secs)
            }
            DenialReason::Burst { max_per_minute } => {
                write!(f, "burst limit: max {}/minute", max_per_minute)
            }
        }
    }
}

impl DenialReason {
    /// Message suitable for sending straight back to the user.
    pub fn user_message(&self) -> String {
        match self {
            DenialReason::Cooldown { remaining_secs } => {
                crate::templates::rate_limit_cooldown(*remaining_secs)
            }
            DenialReason::Burst { max_per_minute } => {
                crate::templates::rate_limit_burst(*max_per_minute)
            }
        }
    }
}

#[derive(Debug, Default)]
struct RateWindow {
    last_request: Option<Instant>,
    /// Timestamps within the trailing 60s. Pruned lazily on every check,
    /// never by a background sweep.
    recent: Vec<Instant>,
}

/// Per-user dual-window rate limiter.
///
/// State is in-memory only; a process restart resets all quotas. The single
/// mutex serialises the prune-check-record sequence so two concurrent
/// requests for the same user cannot both slip under the burst limit.
pub struct RateLimiter {
    windows: Mutex<HashMap<u64, RateWindow>>,
    cooldown: Duration,
    max_per_minute: usize,
}

impl RateLimiter {
    pub fn new(cooldown: Duration, max_per_minute: usize) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            cooldown,
            max_per_minute,
        }
    }

    /// Gate a request. Returns `Some(reason)` on denial, recording nothing;
    /// on pass the request is recorded against both windows atomically.
    pub async fn check(&self, user_id: u64) -> Option<DenialReason> {
        self.check_at(user_id, Instant::now()).await
    }

    /// Time-injectable variant of [`check`](Self::check) used by tests.
    pub async fn check_at(&self, user_id: u64, now: Instant) -> Option<DenialReason> {
        let mut windows = self.windows.lock().await;
        let window = windows.entry(user_id).or_default();

        // Cooldown gate: minimum spacing since the last accepted request.
        if let Some(last) = window.last_request {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.cooldown {
                let remaining_secs = (self.cooldown - elapsed).as_secs_f64().ceil() as u64;
                debug!(user_id, remaining_secs, "Rate limit: cooldown");
                return Some(DenialReason::Cooldown { remaining_secs });
            }
        }

        // Burst gate: prune the window first, then count.
        window
            .recent
            .retain(|t| now.saturating_duration_since(*t) < BURST_WINDOW);
        if window.recent.len() >= self.max_per_minute {
            debug!(user_id, max = self.max_per_minute, "Rate limit: burst");
            return Some(DenialReason::Burst {
                max_per_minute: self.max_per_minute,
            });
        }

        // Both gates passed: record against both windows.
        window.last_request = Some(now);
        window.recent.push(now);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(cooldown_secs: u64, max_per_minute: usize) -> RateLimiter {
        RateLimiter::new(Duration::from_secs(cooldown_secs), max_per_minute)
    }

    #[tokio::test]
    async fn first_request_passes() {
        let rl = limiter(3, 20);
        assert_eq!(rl.check_at(1, Instant::now()).await, None);
    }

    #[tokio::test]
    async fn cooldown_denies_with_ceiled_remaining() {
        let rl = limiter(3, 20);
        let base = Instant::now();

        assert_eq!(rl.check_at(1, base).await, None);

        // 1.2s elapsed of a 3s cooldown: ceil(1.8) = 2.
        let denied = rl.check_at(1, base + Duration::from_millis(1200)).await;
        assert_eq!(denied, Some(DenialReason::Cooldown { remaining_secs: 2 }));

        // Past the cooldown the request goes through.
        assert_eq!(rl.check_at(1, base + Duration::from_secs(3)).await, None);
    }

    #[tokio::test]
    async fn burst_denies_request_over_the_minute_cap() {
        let rl = limiter(0, 5);
        let base = Instant::now();

        for i in 0..5 {
            let now = base + Duration::from_secs(i);
            assert_eq!(rl.check_at(1, now).await, None, "request {} should pass", i);
        }

        let denied = rl.check_at(1, base + Duration::from_secs(5)).await;
        assert_eq!(denied, Some(DenialReason::Burst { max_per_minute: 5 }));
    }

    #[tokio::test]
    async fn burst_window_slides() {
        let rl = limiter(0, 2);
        let base = Instant::now();

        assert_eq!(rl.check_at(1, base).await, None);
        assert_eq!(rl.check_at(1, base + Duration::from_secs(1)).await, None);
        assert!(rl.check_at(1, base + Duration::from_secs(2)).await.is_some());

        // 61s after the first request it has left the window.
        assert_eq!(rl.check_at(1, base + Duration::from_secs(61)).await, None);
    }

    #[tokio::test]
    async fn denial_does_not_mutate_state() {
        let rl = limiter(10, 20);
        let base = Instant::now();

        assert_eq!(rl.check_at(1, base).await, None);

        // Repeated denied checks must not push the cooldown forward: the
        // remaining time keeps shrinking relative to the one recorded request.
        let d1 = rl.check_at(1, base + Duration::from_secs(2)).await;
        assert_eq!(d1, Some(DenialReason::Cooldown { remaining_secs: 8 }));
        let d2 = rl.check_at(1, base + Duration::from_secs(6)).await;
        assert_eq!(d2, Some(DenialReason::Cooldown { remaining_secs: 4 }));
        assert_eq!(rl.check_at(1, base + Duration::from_secs(10)).await, None);
    }

    #[tokio::test]
    async fn burst_denial_does_not_count_against_the_window() {
        let rl = limiter(0, 3);
        let base = Instant::now();

        for i in 0..3 {
            assert_eq!(rl.check_at(1, base + Duration::from_secs(i)).await, None);
        }
        // Hammering the limit does not extend it.
        for i in 3..10 {
            assert!(rl.check_at(1, base + Duration::from_secs(i)).await.is_some());
        }
        // Exactly the original 3 requests age out; nothing else was recorded.
        assert_eq!(rl.check_at(1, base + Duration::from_secs(62)).await, None);
    }

    #[tokio::test]
    async fn users_are_isolated() {
        let rl = limiter(5, 20);
        let base = Instant::now();

        assert_eq!(rl.check_at(1, base).await, None);
        assert_eq!(rl.check_at(2, base).await, None);
        assert!(rl.check_at(1, base + Duration::from_secs(1)).await.is_some());
        assert_eq!(rl.check_at(3, base + Duration::from_secs(1)).await, None);
    }
}
