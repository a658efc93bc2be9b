// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Exponential backoff for transient transport failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::transport::TransportError;

/// Backoff configuration shared by uploads, submissions and retrievals.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay that is randomized, 0.0..=1.0.
    pub jitter: f64,
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            initial,
            max,
            max_retries,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let base = self.initial.as_millis() as f64 * exp;
        let capped = base.min(self.max.as_millis() as f64);
        Duration::from_millis(jittered(capped, self.jitter).max(0.0).round() as u64)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent.
    ///
    /// `op` receives the attempt number starting at 0. Returns the final
    /// result and the number of retries that were used.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> (Result<T, TransportError>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut retries = 0;
        loop {
            match op(retries).await {
                Ok(value) => return (Ok(value), retries),
                Err(e) if e.is_retryable() && retries < self.max_retries => {
                    retries += 1;
                    let delay = self.delay(retries);
                    warn!(
                        operation = what,
                        retry = retries,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient transport failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return (Err(e), retries),
            }
        }
    }
}

/// Spread `value` uniformly by `ratio` in both directions.
pub fn jittered(value: f64, ratio: f64) -> f64 {
    if ratio <= 0.0 || value <= 0.0 {
        return value;
    }
    let spread = value * ratio.min(1.0);
    value + rand::thread_rng().gen_range(-spread..=spread)
}

/// Apply [`jittered`] to a duration.
pub fn jittered_duration(value: Duration, ratio: f64) -> Duration {
    Duration::from_secs_f64(jittered(value.as_secs_f64(), ratio).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(max_retries: u32) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(350),
            multiplier: 2.0,
            jitter: 0.0,
            max_retries,
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = no_jitter(5);
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(350));
        assert_eq!(policy.delay(10), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        for _ in 0..100 {
            let v = jittered(10.0, 0.2);
            assert!((8.0..=12.0).contains(&v));
        }
        assert_eq!(jittered(10.0, 0.0), 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_within_budget() {
        let policy = no_jitter(3);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let (result, retries) = policy
            .retry("upload", |_| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(TransportError::Connection("reset".into()))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(retries, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_budget() {
        let policy = no_jitter(3);
        let (result, retries) = policy
            .retry("upload", |_| async {
                Err::<(), _>(TransportError::Connection("reset".into()))
            })
            .await;

        assert!(matches!(result, Err(TransportError::Connection(_))));
        assert_eq!(retries, 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let policy = no_jitter(3);
        let (result, retries) = policy
            .retry("open", |_| async {
                Err::<(), _>(TransportError::Authentication("denied".into()))
            })
            .await;

        assert!(matches!(result, Err(TransportError::Authentication(_))));
        assert_eq!(retries, 0);
    }
}
