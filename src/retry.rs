//! Bounded exponential backoff for node requests.

use std::{future::Future, time::Duration};

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::TransportError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// retries after the first attempt; 0 means try once
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// up to this fraction of the backoff is added at random
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
            jitter: 0.0,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO, 1.0)
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        Duration::from_secs_f64(
            (current.as_secs_f64() * self.backoff_multiplier).min(self.max_backoff.as_secs_f64()),
        )
    }

    fn jittered(&self, backoff: Duration) -> Duration {
        if self.jitter <= 0.0 || backoff.is_zero() {
            return backoff;
        }
        let extra = rand::thread_rng().gen_range(0.0..self.jitter);
        backoff.mul_f64(1.0 + extra)
    }

    /// Runs `operation` until it succeeds, fails with a non-transient error, or
    /// the retry budget is spent. Returns the last error in the latter cases.
    pub async fn execute<F, Fut, T>(&self, what: &str, mut operation: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempts = 0;
        let mut backoff = self.initial_backoff;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempts > 0 {
                        debug!(target: "vault_ingest::retry", "{what} succeeded after {} attempt(s)", attempts + 1);
                    }
                    return Ok(result);
                }
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => {
                    attempts += 1;
                    if attempts > self.max_retries {
                        warn!(target: "vault_ingest::retry", "{what} failed after {attempts} attempts: {err}");
                        return Err(err);
                    }

                    let wait = self.jittered(backoff);
                    debug!(
                        target: "vault_ingest::retry",
                        "{what} failed (attempt {}/{}): {err}, retrying in {:?}",
                        attempts,
                        self.max_attempts(),
                        wait
                    );
                    sleep(wait).await;
                    backoff = self.next_backoff(backoff);
                }
            }
        }
    }
}
