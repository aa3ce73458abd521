//! Resilience utilities: retry with backoff and sliding-window rate limiting.
//!
//! - [`RetryPolicy`] + [`retry_with_backoff`]: bounded retries with a pluggable
//!   backoff function and a retryable-error predicate
//! - [`RateLimiter`]: sliding-window admission control shared by every
//!   outbound origin call
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use mirror_sync::resilience::RateLimiter;
//! use std::time::Duration;
//!
//! // At most 5 origin calls in any rolling second
//! let limiter = RateLimiter::new(5, Duration::from_secs(1));
//! limiter.acquire().await; // Blocks if over limit
//! # }
//! ```

use crate::config::RateLimitConfig;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

// =============================================================================
// Retry
// =============================================================================

/// How long to wait after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Same delay after every attempt.
    Fixed(Duration),
    /// Attempt `n` waits `n * step`.
    Linear(Duration),
    /// `initial * factor^(n-1)`, capped at `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        factor: f64,
    },
}

/// Bounded retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(30),
                factor: 2.0,
            },
        }
    }
}

impl RetryPolicy {
    /// Full table scans: fixed delay between attempts.
    ///
    /// ```text
    /// Attempt  Delay after failure
    /// -------  -------------------
    /// 1        1s
    /// 2        1s
    /// 3        (give up)
    /// ```
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(delay),
        }
    }

    /// Subscription creation: attempt number times `step`.
    ///
    /// ```text
    /// Attempt  Delay after failure
    /// -------  -------------------
    /// 1        1s
    /// 2        2s
    /// 3        (give up)
    /// ```
    pub fn linear(max_attempts: usize, step: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Linear(step),
        }
    }

    /// Queued mirror updates: doubling delay from `initial`, capped at `max`.
    ///
    /// ```text
    /// Attempt  Delay after failure (2s initial, 1m max)
    /// -------  ----------------------------------------
    /// 1        2s
    /// 2        4s
    /// 3        8s
    /// 4        16s
    /// 5        (give up)
    /// ```
    pub fn exponential(max_attempts: usize, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                initial,
                max,
                factor: 2.0,
            },
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Fixed(Duration::from_millis(1)),
        }
    }

    /// Calculate the delay after a failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let attempt = attempt.max(1);
        match &self.backoff {
            Backoff::Fixed(delay) => *delay,
            Backoff::Linear(step) => step.saturating_mul(attempt.min(u32::MAX as usize) as u32),
            Backoff::Exponential { initial, max, factor } => {
                let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
                let secs = initial.as_secs_f64() * factor.powi(exponent);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }
}

/// The last error from an operation that never succeeded.
#[derive(Debug)]
pub struct RetryFailure<E> {
    /// Attempts actually made.
    pub attempts: usize,
    pub error: E,
}

/// Run `op` until it succeeds, the error is not retryable, or attempts run out.
///
/// `op` receives the 1-indexed attempt number. Non-retryable errors return
/// immediately without sleeping.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    operation_name: &str,
    policy: &RetryPolicy,
    is_retryable: P,
    mut op: F,
) -> std::result::Result<T, RetryFailure<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt < max_attempts && is_retryable(&e) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                crate::metrics::record_retry(operation_name);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(RetryFailure { attempts: attempt, error: e });
            }
        }
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Outcome of a non-blocking admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    /// The admitted request took the final slot in the current window.
    pub is_last_slot_before_limit: bool,
}

/// Sliding-window rate limiter.
///
/// Admits at most `max_requests` in any rolling `window`. Timestamps of
/// admitted requests older than the window are pruned on every check.
/// One instance is shared by every caller that spends the same API budget.
///
/// Uses `tokio::time::Instant`, so paused-clock tests drive it directly.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            admitted: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, config.window_duration())
    }

    /// Admit or deny at `now`; on denial return how long to wait.
    fn check(&self, now: Instant) -> (Admission, Option<Duration>) {
        let mut admitted = self
            .admitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        while let Some(oldest) = admitted.front() {
            if now.duration_since(*oldest) >= self.window {
                admitted.pop_front();
            } else {
                break;
            }
        }

        if admitted.len() >= self.max_requests {
            let wait = admitted
                .front()
                .map(|oldest| {
                    self.window
                        .saturating_sub(now.duration_since(*oldest))
                        + Duration::from_millis(1)
                })
                .unwrap_or(Duration::from_millis(1));
            let denied = Admission {
                allowed: false,
                is_last_slot_before_limit: false,
            };
            return (denied, Some(wait));
        }

        admitted.push_back(now);
        let admission = Admission {
            allowed: true,
            is_last_slot_before_limit: admitted.len() == self.max_requests,
        };
        (admission, None)
    }

    /// Try to acquire a slot without blocking.
    pub fn try_acquire(&self) -> Admission {
        self.check(Instant::now()).0
    }

    /// Acquire a slot, sleeping until the oldest admitted request leaves the window.
    ///
    /// Cancel-safe: a dropped future never holds a slot.
    pub async fn acquire(&self) {
        let mut waited = Duration::ZERO;
        loop {
            match self.check(Instant::now()) {
                (_, None) => break,
                (_, Some(wait)) => {
                    waited += wait;
                    tokio::time::sleep(wait).await;
                }
            }
        }
        if !waited.is_zero() {
            crate::metrics::record_rate_limit_wait(waited);
        }
    }

    /// Slots currently used within the window.
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        let admitted = self
            .admitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        admitted
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count()
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}
