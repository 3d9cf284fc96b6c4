//! Bounded retries with exponential backoff for idempotent graph reads.
//!
//! Only [`GraphError::Unavailable`] is retried. Writes never go through here.

use std::future::Future;
use std::time::Duration;

use relgate_config::RetryConfig;
use relgate_core::GraphError;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    /// Spread delays by ±25% so concurrent callers do not retry in lockstep.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay_ms: cfg.base_delay_ms,
            backoff_factor: cfg.backoff_factor.max(1.0),
            max_delay_ms: cfg.max_delay_ms,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exp = self.backoff_factor.powi(retry.saturating_sub(1) as i32);
        let ms = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64) as u64;
        let ms = if self.jitter { jittered(ms) } else { ms };
        Duration::from_millis(ms)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T, GraphError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GraphError>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Err(GraphError::Unavailable(reason)) if attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        op,
                        attempt,
                        max = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Graph read failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(op, attempt, error = %e, "Graph read gave up");
                    return Err(e);
                }
                Ok(value) => return Ok(value),
            }
        }
    }
}

/// ±25% around `ms`, from a process-wide xorshift state.
fn jittered(ms: u64) -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static STATE: AtomicU64 = AtomicU64::new(0x9e37_79b9_7f4a_7c15);

    let spread = ms / 4;
    if spread == 0 {
        return ms;
    }
    let mut x = STATE.load(Ordering::Relaxed);
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    STATE.store(x, Ordering::Relaxed);
    ms - spread + x % (spread * 2 + 1)
}
