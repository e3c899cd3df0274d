//! Bounded retry
//!
//! Retries an async operation a fixed number of times, waiting between
//! attempts through an injectable [`Sleeper`] so tests can observe the
//! waits without spending wall-clock time. Delays are fixed by default and
//! may grow exponentially with optional jitter.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

/// Waits between attempts
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Sleeper that returns immediately and records every requested wait
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().map(|w| w.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut waits) = self.waits.lock() {
            waits.push(duration);
        }
        tokio::task::yield_now().await;
    }
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Cap on the delay between attempts
    pub max_delay: Duration,
    /// Delay multiplier per attempt (1.0 = fixed delay)
    pub multiplier: f64,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::fixed(3, Duration::from_millis(500))
    }
}

impl RetryConfig {
    /// `attempts` tries with a constant `delay` between them
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Exponential backoff, suited to database round-trips
    pub fn database() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay after the given failed attempt (1-indexed)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter > 0.0 {
            let range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-range..=range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }
}

/// Outcome of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    /// Attempts made (1 = succeeded or gave up on the first try)
    pub attempts: u32,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// Runs operations under a [`RetryConfig`]
pub struct Retry<'a> {
    config: RetryConfig,
    sleeper: &'a dyn Sleeper,
}

impl<'a> Retry<'a> {
    pub fn new(config: RetryConfig, sleeper: &'a dyn Sleeper) -> Self {
        Self { config, sleeper }
    }

    /// Run `operation` until it succeeds, `should_retry` rejects its error,
    /// or the attempt ceiling is reached. `on_attempt` is called with the
    /// 1-indexed attempt number before each try.
    pub async fn run<F, Fut, T, E, P, A>(
        &self,
        mut operation: F,
        should_retry: P,
        mut on_attempt: A,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        A: FnMut(u32),
        E: std::fmt::Display,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;
            on_attempt(attempts);

            match operation().await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                    }
                }
                Err(e) => {
                    if attempts >= self.config.max_attempts || !should_retry(&e) {
                        return RetryOutcome {
                            result: Err(e),
                            attempts,
                        };
                    }

                    let delay = self.config.delay_after(attempts);
                    tracing::debug!(
                        attempt = attempts,
                        max_attempts = self.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after failure"
                    );
                    self.sleeper.sleep(delay).await;
                }
            }
        }
    }
}

/// Whether a database error is likely transient
pub fn is_retryable_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) => true,
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::PoolClosed => false,
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().unwrap_or_default();
            // serialization failure, deadlock, connection exception, operator intervention
            code == "40001" || code == "40P01" || code.starts_with("08") || code.starts_with("57")
        }
        _ => false,
    }
}
