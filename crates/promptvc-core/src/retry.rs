//! Provider calls with timeout and bounded exponential backoff.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::budget::RequestBudget;
use crate::capability::ProviderFailure;
use crate::domain::{CaseErrorKind, ConfigError};
use crate::metrics::METRICS;

/// Retry policy for a single provider call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = run once).
    pub max_retries: u32,
    /// First backoff delay; doubles on every further retry.
    pub backoff_base_ms: u64,
    /// Upper bound for a single backoff delay.
    pub backoff_max_ms: u64,
    /// Wall-clock limit for one attempt.
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            timeout_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::NotPositive {
                field: "retry.timeout_ms".into(),
                value: 0.0,
            });
        }
        Ok(())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

/// Result of a retried call plus how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, ProviderFailure>,
    pub attempts: u32,
}

/// Map a final provider failure to the case error it produces.
pub fn case_error_kind(failure: &ProviderFailure) -> CaseErrorKind {
    match failure {
        ProviderFailure::Transient(_) => CaseErrorKind::Provider,
        ProviderFailure::Timeout { .. } => CaseErrorKind::Timeout,
        ProviderFailure::Rejected(_) => CaseErrorKind::ProviderRejected,
    }
}

/// Run `op` under `policy`, holding one `budget` slot per attempt.
///
/// Transient failures and timeouts are retried; rejections return at once.
/// The budget slot is released before sleeping so backoff never holds
/// capacity other cases could use.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    budget: &RequestBudget,
    mut op: F,
) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderFailure>>,
{
    let max_attempts = policy.max_attempts();
    let timeout = Duration::from_millis(policy.timeout_ms);
    let mut attempt = 1;

    loop {
        let outcome = {
            let _permit = budget.acquire().await;
            METRICS.inc_provider_calls();
            match tokio::time::timeout(timeout, op()).await {
                Ok(result) => result,
                Err(_elapsed) => Err(ProviderFailure::Timeout {
                    after_ms: policy.timeout_ms,
                }),
            }
        };

        match outcome {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(failure) if !failure.is_retriable() || attempt >= max_attempts => {
                return Attempted {
                    result: Err(failure),
                    attempts: attempt,
                }
            }
            Err(failure) => {
                let delay = policy.backoff(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %failure, "retrying provider call");
                METRICS.inc_provider_retries();
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            timeout_ms: 1_000,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = RetryPolicy {
            backoff_base_ms: 500,
            backoff_max_ms: 3_000,
            ..RetryPolicy::default()
        };
        assert_eq!(p.backoff(1), Duration::from_millis(500));
        assert_eq!(p.backoff(2), Duration::from_millis(1_000));
        assert_eq!(p.backoff(3), Duration::from_millis(2_000));
        assert_eq!(p.backoff(4), Duration::from_millis(3_000));
        assert_eq!(p.backoff(200), Duration::from_millis(3_000));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let p = RetryPolicy {
            timeout_ms: 0,
            ..RetryPolicy::default()
        };
        assert!(p.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let budget = RequestBudget::new(1);
        let start = tokio::time::Instant::now();

        let out = call_with_retry(&fast_policy(2), &budget, || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProviderFailure::Transient("429".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(out.result, Ok("done"));
        assert_eq!(out.attempts, 3);
        assert!(start.elapsed() >= Duration::from_millis(1_500));
        assert_eq!(budget.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let out: Attempted<()> = call_with_retry(&fast_policy(5), &RequestBudget::new(1), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderFailure::Rejected("content policy".into()))
            }
        })
        .await;

        assert_eq!(out.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            case_error_kind(&out.result.unwrap_err()),
            CaseErrorKind::ProviderRejected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_exhausts_retries() {
        let out: Attempted<()> = call_with_retry(&fast_policy(1), &RequestBudget::new(1), || async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await;

        assert_eq!(out.attempts, 2);
        assert_eq!(
            out.result,
            Err(ProviderFailure::Timeout { after_ms: 1_000 })
        );
    }
}
