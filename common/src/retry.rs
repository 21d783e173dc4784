// Per-step retry policy with pluggable backoff
//
// Decisions are pure functions of (attempt count, error); the mutable
// per-attempt bookkeeping lives in RetryState, owned by the run.

use crate::errors::StepError;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default maximum number of retries after the first failure
pub const MAX_RETRIES: u32 = 10;

/// Backoff trait for calculating the delay before a retry
pub trait Backoff: Send + Sync {
    /// Delay before retrying after the `attempt`-th consecutive failure (1-based)
    fn delay(&self, attempt: u32) -> Duration;
}

/// Fixed delay backoff
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Backoff for FixedDelay {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Exponential backoff with jitter
/// Sequence: base, base*3, base*9, ... capped at max_delay
/// Jitter: random value added to prevent thundering herd
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Base delay in seconds (default: 1)
    base_delay_secs: u64,
    /// Maximum delay in seconds (default: 300)
    max_delay_secs: u64,
    /// Jitter factor (0.0 to 1.0, default: 0.1 = 10%)
    jitter_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay_secs: 1,
            max_delay_secs: 300,
            jitter_factor: 0.1,
        }
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(base_delay_secs: u64, max_delay_secs: u64, jitter_factor: f64) -> Self {
        Self {
            base_delay_secs,
            max_delay_secs,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Exponential delay without jitter, in seconds
    fn calculate_base_delay(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1);
        let factor = 3_u64.checked_pow(exponent).unwrap_or(u64::MAX);
        self.base_delay_secs
            .saturating_mul(factor)
            .min(self.max_delay_secs)
    }

    /// Add random jitter, returns milliseconds
    fn add_jitter_ms(&self, base_delay_secs: u64) -> u64 {
        let base_delay_ms = base_delay_secs.saturating_mul(1000);
        if self.jitter_factor == 0.0 {
            return base_delay_ms;
        }

        let jitter_range_ms = (base_delay_ms as f64 * self.jitter_factor) as u64;
        let jitter_ms = if jitter_range_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_range_ms)
        } else {
            0
        };

        base_delay_ms.saturating_add(jitter_ms)
    }
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let base_delay_secs = self.calculate_base_delay(attempt);
        Duration::from_millis(self.add_jitter_ms(base_delay_secs))
    }
}

/// Predicate deciding whether a step error may be retried
pub type RetriablePredicate = Arc<dyn Fn(&StepError) -> bool + Send + Sync>;

/// Outcome of a retry decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    pub fn give_up() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// Retry policy applied to every step of a run
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Arc<dyn Backoff>,
    is_retriable: RetriablePredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    /// Ten retries, one second apart, default error classification
    fn default() -> Self {
        Self::new(MAX_RETRIES, Arc::new(FixedDelay::new(Duration::from_secs(1))))
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Arc<dyn Backoff>) -> Self {
        Self {
            max_retries,
            backoff,
            is_retriable: Arc::new(StepError::is_retriable),
        }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self::new(0, Arc::new(FixedDelay::new(Duration::ZERO)))
    }

    /// Replace the retriable-error classification
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&StepError) -> bool + Send + Sync + 'static,
    {
        self.is_retriable = Arc::new(predicate);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn is_retriable(&self, error: &StepError) -> bool {
        (self.is_retriable)(error)
    }

    /// Decide whether to retry after the `attempt_count`-th consecutive failure.
    ///
    /// Retries while `attempt_count <= max_retries`; non-retriable errors
    /// fail immediately regardless of the count.
    pub fn should_retry(&self, attempt_count: u32, error: &StepError) -> RetryDecision {
        if !self.is_retriable(error) {
            return RetryDecision::give_up();
        }
        if attempt_count == 0 || attempt_count > self.max_retries {
            return RetryDecision::give_up();
        }
        RetryDecision {
            retry: true,
            delay: self.backoff.delay(attempt_count),
        }
    }
}

/// Retry bookkeeping for one step within one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub step_id: String,
    pub attempt_count: u32,
    pub last_error: Option<StepError>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl RetryState {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            attempt_count: 0,
            last_error: None,
            next_retry_at: None,
        }
    }

    /// Record a failure and consult the policy
    pub fn record_failure(&mut self, policy: &RetryPolicy, error: StepError) -> RetryDecision {
        self.attempt_count += 1;
        let decision = policy.should_retry(self.attempt_count, &error);
        self.last_error = Some(error);
        self.next_retry_at = if decision.retry {
            chrono::Duration::from_std(decision.delay)
                .ok()
                .map(|delay| Utc::now() + delay)
        } else {
            None
        };
        decision
    }

    /// Failed attempts recorded so far
    pub fn attempts(&self) -> u32 {
        self.attempt_count
    }
}
