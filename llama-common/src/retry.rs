//! Retry with exponential backoff for operations that touch the network

use crate::error::LlamaError;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first failure
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Add up to 25% random jitter to each delay
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            use_jitter: true,
        }
    }
}

/// Errors that can tell the retry loop whether another attempt makes sense
pub trait RetryableError: std::error::Error + Send + Sync {
    fn is_retriable(&self) -> bool;

    fn custom_retry_delay(&self, _attempt: u32) -> Option<Duration> {
        None
    }

    fn should_stop_retrying(&self, _attempt: u32) -> bool {
        false
    }
}

impl<T: LlamaError> RetryableError for T {
    fn is_retriable(&self) -> bool {
        LlamaError::is_retriable(self)
    }

    fn custom_retry_delay(&self, attempt: u32) -> Option<Duration> {
        LlamaError::custom_retry_delay(self, attempt)
    }

    fn should_stop_retrying(&self, attempt: u32) -> bool {
        LlamaError::should_stop_retrying(self, attempt)
    }
}

/// Runs async operations until they succeed or the retry budget is spent
pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    pub fn new() -> Self {
        Self {
            config: RetryConfig::default(),
        }
    }

    pub fn with_config(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Execute `operation`, retrying retriable failures with backoff
    pub async fn retry<F, T, E, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: RetryableError + std::fmt::Display,
    {
        let mut attempt = 0;
        let mut delay = self.config.initial_delay;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        info!("'{}' succeeded after {} retries", operation_name, attempt);
                    }
                    return Ok(result);
                }
                Err(error) => {
                    attempt += 1;

                    if !error.is_retriable()
                        || attempt > self.config.max_retries
                        || error.should_stop_retrying(attempt)
                    {
                        warn!(
                            "'{}' giving up after {} attempt(s): {}",
                            operation_name, attempt, error
                        );
                        return Err(error);
                    }

                    let actual_delay = error
                        .custom_retry_delay(attempt)
                        .unwrap_or_else(|| self.jittered(delay));

                    warn!(
                        "'{}' attempt {} failed: {}. Retrying in {:?}",
                        operation_name, attempt, error, actual_delay
                    );

                    sleep(actual_delay).await;
                    delay = self.next_delay(delay);
                }
            }
        }
    }

    fn jittered(&self, base_delay: Duration) -> Duration {
        let mut delay = base_delay;
        if self.config.use_jitter {
            let jitter_ms = (delay.as_millis() as f64 * 0.25 * pseudo_random()) as u64;
            delay += Duration::from_millis(jitter_ms);
        }
        delay.min(self.config.max_delay)
    }

    fn next_delay(&self, current_delay: Duration) -> Duration {
        let next_delay_ms =
            (current_delay.as_millis() as f64 * self.config.backoff_multiplier) as u64;
        Duration::from_millis(next_delay_ms).min(self.config.max_delay)
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new()
    }
}

/// LCG in 0.0..1.0, good enough for jitter
fn pseudo_random() -> f64 {
    use std::sync::atomic::{AtomicU64, Ordering};

    static SEED: AtomicU64 = AtomicU64::new(0x2545_F491_4F6C_DD1D);

    let prev = SEED.load(Ordering::Relaxed);
    let next = prev.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    SEED.store(next, Ordering::Relaxed);

    (next >> 11) as f64 / (1u64 << 53) as f64
}
