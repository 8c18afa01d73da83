use crate::constants::RETRYABLE_STATUS_CODES;
use crate::types::{ObservedError, RelayError, Result};
use std::future::Future;
use std::time::Duration;

/// Exponential backoff with ±25% jitter, applied only while opening the
/// upstream stream. Once bytes flow, failures end the turn instead.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
        }
    }

    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match operation().await {
                Ok(val) => return Ok(val),
                Err(e) if attempts < self.max_attempts && is_retryable(&e) => {
                    let delay = self.backoff(attempts);
                    tracing::warn!(
                        "Upstream request failed (attempt {}): {}. Retrying in {:?} (jittered)...",
                        attempts,
                        e.inner,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let base_delay = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempts.saturating_sub(1)));
        let jitter_range = base_delay / 4;
        let jitter = if jitter_range > 0 {
            fastrand::i64(-(jitter_range as i64)..jitter_range as i64)
        } else {
            0
        };
        Duration::from_millis((base_delay as i64 + jitter).max(1) as u64)
    }
}

pub fn is_retryable(err: &ObservedError) -> bool {
    match &err.inner {
        RelayError::Network(_) | RelayError::Io(_) => true,
        RelayError::Upstream(status, _) => RETRYABLE_STATUS_CODES.contains(&status.as_u16()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_retry_policy_success() {
        let policy = RetryPolicy::new(3, 1);
        let mut attempts = 0;

        let result: Result<i32> = policy
            .execute_with_retry(|| {
                attempts += 1;
                async move { Ok(42) }
            })
            .await;

        match result {
            Ok(val) => assert_eq!(val, 42),
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_policy_eventual_success() {
        let policy = RetryPolicy::new(3, 1);
        let mut attempts = 0;

        let result: Result<i32> = policy
            .execute_with_retry(|| {
                attempts += 1;
                let a = attempts;
                async move {
                    if a < 3 {
                        Err(RelayError::Upstream(StatusCode::SERVICE_UNAVAILABLE, "busy".into()).into())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        match result {
            Ok(val) => assert_eq!(val, 42),
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let policy = RetryPolicy::new(5, 1);
        let mut attempts = 0;

        let result: Result<i32> = policy
            .execute_with_retry(|| {
                attempts += 1;
                async move {
                    Err(RelayError::Upstream(StatusCode::UNAUTHORIZED, "bad key".into()).into())
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
}
