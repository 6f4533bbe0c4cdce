//! Retry Policy
//!
//! Error classification and exponential backoff shared by one-shot fetches,
//! stream reconnection and fallback polling.
//!
//! # Backoff
//!
//! `next_delay(attempt, base) = base * 2^attempt`, saturating at
//! `Duration::MAX`. Delays are deterministic (no jitter); callers bound
//! `attempt` themselves.
//!
//! # Classification
//!
//! | Error | Category |
//! |-------|----------|
//! | HTTP 429 / 418, codes -1003 / -1015 | `RateLimited` |
//! | HTTP 5xx / 408, network and transport failures | `Retryable` |
//! | Other HTTP 4xx, malformed data, invalid topic | `NonRetryable` |

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::application::ports::Clock;
use crate::error::FeedError;

/// Upstream error codes signalling request-weight or order-rate limits.
pub const RATE_LIMIT_CODES: [i64; 2] = [-1003, -1015];

/// Error categories for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Error is retryable (transient failure).
    Retryable,
    /// Error is not retryable (permanent failure).
    NonRetryable,
    /// Rate limited - honour Retry-After if available.
    RateLimited,
}

/// Check a free-form error message for rate-limit indicators.
fn message_signals_rate_limit(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429")
}

/// Categorize an HTTP status for retry decisions.
#[must_use]
pub const fn categorize_status(status: u16) -> ErrorCategory {
    match status {
        429 | 418 => ErrorCategory::RateLimited,
        408 | 500..=599 => ErrorCategory::Retryable,
        _ => ErrorCategory::NonRetryable,
    }
}

/// Classify an error for retry decisions.
#[must_use]
pub fn classify(error: &FeedError) -> ErrorCategory {
    match error {
        FeedError::Http {
            status,
            code,
            message,
            ..
        } => {
            if code.is_some_and(|c| RATE_LIMIT_CODES.contains(&c)) {
                return ErrorCategory::RateLimited;
            }
            match categorize_status(*status) {
                ErrorCategory::NonRetryable if code.is_none() && message_signals_rate_limit(message) => {
                    ErrorCategory::RateLimited
                }
                category => category,
            }
        }
        FeedError::Network(message) | FeedError::Transport(message) => {
            if message_signals_rate_limit(message) {
                ErrorCategory::RateLimited
            } else {
                ErrorCategory::Retryable
            }
        }
        FeedError::Malformed(_) | FeedError::InvalidTopic(_) | FeedError::QueueClosed => {
            ErrorCategory::NonRetryable
        }
    }
}

/// Whether an error signals upstream rate limiting.
#[must_use]
pub fn is_rate_limited(error: &FeedError) -> bool {
    classify(error) == ErrorCategory::RateLimited
}

/// Exponential backoff delay: `base * 2^attempt`, saturating.
#[must_use]
pub fn next_delay(attempt: u32, base: Duration) -> Duration {
    1u32.checked_shl(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .unwrap_or(Duration::MAX)
}

/// Retry settings for one-shot operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    /// Maximum number of attempts (including the first).
    pub max_retries: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
        }
    }
}

/// Retries fallible async operations with exponential backoff.
#[derive(Clone)]
pub struct RetryPolicy {
    settings: RetrySettings,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Create a policy sleeping on `clock`.
    #[must_use]
    pub fn new(settings: RetrySettings, clock: Arc<dyn Clock>) -> Self {
        Self { settings, clock }
    }

    /// Policy settings.
    #[must_use]
    pub const fn settings(&self) -> RetrySettings {
        self.settings
    }

    /// Run `call` until it succeeds, fails permanently or attempts run out.
    ///
    /// Rate-limited and transient errors are retried after
    /// `next_delay(attempt, initial_delay)` or the server's `Retry-After`,
    /// whichever is longer.
    ///
    /// # Errors
    ///
    /// Returns non-retryable errors immediately and the last error once
    /// `max_retries` attempts have failed.
    pub async fn retry_with_backoff<T, F, Fut>(&self, mut call: F) -> Result<T, FeedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FeedError>>,
    {
        let max_attempts = self.settings.max_retries.max(1);
        let mut attempt = 0;

        loop {
            let error = match call().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let category = classify(&error);
            attempt += 1;

            if category == ErrorCategory::NonRetryable {
                return Err(error);
            }
            if attempt >= max_attempts {
                tracing::warn!(attempts = attempt, error = %error, "Retries exhausted");
                return Err(error);
            }

            let backoff = next_delay(attempt - 1, self.settings.initial_delay);
            let delay = error.retry_after().map_or(backoff, |hint| hint.max(backoff));
            tracing::warn!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                rate_limited = category == ErrorCategory::RateLimited,
                error = %error,
                "Retrying after failure"
            );
            self.clock.sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;
    use crate::infrastructure::clock::TokioClock;

    fn rate_limited() -> FeedError {
        FeedError::Http {
            status: 429,
            code: Some(-1003),
            message: "Too many requests".to_string(),
            retry_after: None,
        }
    }

    #[test_case(FeedError::http(429, "slow down"), ErrorCategory::RateLimited ; "status 429")]
    #[test_case(FeedError::http(418, "banned"), ErrorCategory::RateLimited ; "status 418")]
    #[test_case(FeedError::Http { status: 400, code: Some(-1015), message: "Too many new orders".into(), retry_after: None }, ErrorCategory::RateLimited ; "code 1015")]
    #[test_case(FeedError::http(403, "rate limit exceeded"), ErrorCategory::RateLimited ; "message heuristic")]
    #[test_case(FeedError::http(503, "unavailable"), ErrorCategory::Retryable ; "server error")]
    #[test_case(FeedError::Network("connection reset".into()), ErrorCategory::Retryable ; "network")]
    #[test_case(FeedError::Http { status: 400, code: Some(-1121), message: "Invalid symbol.".into(), retry_after: None }, ErrorCategory::NonRetryable ; "invalid symbol")]
    #[test_case(FeedError::Malformed("eof".into()), ErrorCategory::NonRetryable ; "malformed")]
    fn classification(error: FeedError, expected: ErrorCategory) {
        assert_eq!(classify(&error), expected);
    }

    #[test]
    fn next_delay_doubles() {
        let base = Duration::from_secs(1);
        let delays: Vec<_> = (0..5).map(|a| next_delay(a, base)).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec()
        );
    }

    #[test]
    fn next_delay_saturates() {
        assert_eq!(next_delay(40, Duration::from_secs(1)), Duration::MAX);
        assert_eq!(next_delay(31, Duration::from_secs(u64::MAX / 2)), Duration::MAX);
    }

    proptest! {
        #[test]
        fn next_delay_is_monotonic(attempt in 0u32..64, base_ms in 1u64..100_000) {
            let base = Duration::from_millis(base_ms);
            prop_assert!(next_delay(attempt + 1, base) >= next_delay(attempt, base));
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            RetrySettings {
                max_retries,
                initial_delay: Duration::from_secs(1),
            },
            Arc::new(TokioClock),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limited_until_success() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let result = policy(3)
            .retry_with_backoff(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err(rate_limited()) } else { Ok(n) } }
            })
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of backoff
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(5)
            .retry_with_backoff(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FeedError::http(400, "bad request")) }
            })
            .await;

        assert_eq!(result, Err(FeedError::http(400, "bad request")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(3)
            .retry_with_backoff(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(FeedError::Network(format!("attempt {n}"))) }
            })
            .await;

        assert_eq!(result, Err(FeedError::Network("attempt 2".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_extends_backoff() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let result = policy(2)
            .retry_with_backoff(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(FeedError::Http {
                            status: 429,
                            code: None,
                            message: "slow down".to_string(),
                            retry_after: Some(Duration::from_secs(7)),
                        })
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }
}
