//! Exponential-backoff retries for arbitrary async operations.

use std::{collections::HashMap, future::Future, time::Duration};

use parking_lot::Mutex;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, bon::Builder)]
pub struct RetryConfig {
    /// Total attempts per call, including the first.
    #[builder(default = 3)]
    pub max_retries: u32,
    #[builder(default = Duration::from_millis(1_000))]
    pub initial_delay: Duration,
    #[builder(default = Duration::from_millis(30_000))]
    pub max_delay: Duration,
    #[builder(default = 2.0)]
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryConfig {
    /// Preset for backend reads and writes.
    pub fn database_operation() -> Self {
        Self::builder()
            .max_retries(3)
            .initial_delay(Duration::from_secs(1))
            .build()
    }
}

/// `min(initial_delay * backoff_factor^(attempt - 1), max_delay)`.
///
/// `attempt` is 1-based; 0 is treated as 1.
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let millis = config.initial_delay.as_millis() as f64 * config.backoff_factor.powi(exponent);
    let capped = millis.min(config.max_delay.as_millis() as f64);

    if capped.is_finite() && capped >= 0.0 {
        Duration::from_millis(capped as u64)
    } else {
        config.max_delay
    }
}

/// Runs operations with retries, tracking attempts per context string.
///
/// A context's attempt counter is cleared when an operation succeeds and is
/// otherwise kept across calls: two unrelated operations that share a
/// context share a budget. Every call still makes at least one attempt.
#[derive(Default)]
pub struct RetryService {
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn handle_retry<T, F, Fut>(
        &self,
        mut operation: F,
        context: &str,
        config: &RetryConfig,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            let attempt = {
                let mut attempts = self.attempts.lock();
                let count = attempts.entry(context.to_owned()).or_insert(0);
                *count += 1;
                *count
            };

            match operation().await {
                Ok(value) => {
                    self.attempts.lock().remove(context);
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= config.max_retries => {
                    tracing::warn!(context, attempt, error = %e, "retries exhausted");
                    return Err(e);
                }
                Err(e) => {
                    let delay = calculate_delay(attempt, config);
                    tracing::debug!(context, attempt, ?delay, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub fn attempts(&self, context: &str) -> u32 {
        self.attempts.lock().get(context).copied().unwrap_or(0)
    }

    pub fn reset(&self, context: &str) {
        self.attempts.lock().remove(context);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::Error;

    #[test]
    fn delay_is_monotonic_and_capped() {
        let config = RetryConfig::default();
        let mut previous = Duration::ZERO;
        for attempt in 1..=40 {
            let delay = calculate_delay(attempt, &config);
            assert!(delay >= previous);
            assert!(delay <= config.max_delay);
            previous = delay;
        }
        assert_eq!(calculate_delay(1, &config), Duration::from_secs(1));
        assert_eq!(calculate_delay(3, &config), Duration::from_secs(4));
        assert_eq!(calculate_delay(10, &config), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success_and_clears_context() {
        let service = RetryService::new();
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let value = service
            .handle_retry(
                move || async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::backend("insert", "t", "flaky"))
                    } else {
                        Ok(7)
                    }
                },
                "ctx",
                &RetryConfig::default(),
            )
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(service.attempts("ctx"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_error_after_budget() {
        let service = RetryService::new();
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let err = service
            .handle_retry(
                move || async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::backend("insert", "t", format!("failure {n}")))
                },
                "ctx",
                &RetryConfig::builder().max_retries(4).build(),
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(err.to_string().ends_with("failure 3"));
        assert_eq!(service.attempts("ctx"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_short_circuit() {
        let service = RetryService::new();
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result = service
            .handle_retry(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::validation("bad"))
                },
                "ctx",
                &RetryConfig::default(),
            )
            .await;

        assert!(matches!(result, Err(Error::Validation { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
