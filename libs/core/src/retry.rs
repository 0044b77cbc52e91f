//! Retry policies consulted when a transport disconnect interrupts cloud-to-device delivery.
//!
//! A policy answers two questions: whether a given error is worth another
//! attempt, and how long to wait before that attempt.

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;

use crate::errors::{ErrorKind, TransportError};

pub trait RetryPolicy: Send + Sync {
    /// Returns `true` when `error` should be retried.
    fn should_retry(&self, error: &TransportError) -> bool;

    /// Delay before retry number `retry_count` (0-based).
    fn next_retry_timeout(&self, retry_count: u32, throttled: bool) -> Duration;
}

/// Decides retryability by error kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFilter {
    retryable: HashSet<ErrorKind>,
}

impl ErrorFilter {
    pub fn new(kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        Self {
            retryable: kinds.into_iter().collect(),
        }
    }

    pub fn with(mut self, kind: ErrorKind) -> Self {
        self.retryable.insert(kind);
        self
    }

    pub fn without(mut self, kind: ErrorKind) -> Self {
        self.retryable.remove(&kind);
        self
    }

    pub fn allows(&self, kind: ErrorKind) -> bool {
        self.retryable.contains(&kind)
    }
}

impl Default for ErrorFilter {
    fn default() -> Self {
        Self::new([
            ErrorKind::Timeout,
            ErrorKind::Throttling,
            ErrorKind::ServiceUnavailable,
            ErrorKind::InternalServerError,
            ErrorKind::NotConnected,
        ])
    }
}

/// Backoff curve constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffParameters {
    pub c: Duration,
    pub c_min: Duration,
    pub c_max: Duration,
    /// Upper jitter factor.
    pub ju: f64,
    /// Lower jitter factor.
    pub jd: f64,
}

impl BackoffParameters {
    pub const NORMAL: Self = Self {
        c: Duration::from_millis(100),
        c_min: Duration::from_millis(100),
        c_max: Duration::from_millis(10_000),
        ju: 0.25,
        jd: 0.5,
    };

    pub const THROTTLED: Self = Self {
        c: Duration::from_millis(5_000),
        c_min: Duration::from_millis(10_000),
        c_max: Duration::from_millis(60_000),
        ju: 0.25,
        jd: 0.5,
    };

    fn jitter_bounds_ms(&self) -> (f64, f64) {
        let c = self.c.as_millis() as f64;
        let low = c * (1.0 - self.jd);
        let high = c * (1.0 - self.ju);
        if low <= high { (low, high) } else { (high, low) }
    }
}

/// Exponential backoff with randomized jitter:
/// `min(c_min + (2^(n-1) - 1) * U[c*(1-jd), c*(1-ju)], c_max)`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffWithJitter {
    pub immediate_first_retry: bool,
    pub error_filter: ErrorFilter,
    pub normal: BackoffParameters,
    pub throttled: BackoffParameters,
}

impl Default for ExponentialBackoffWithJitter {
    fn default() -> Self {
        Self {
            immediate_first_retry: true,
            error_filter: ErrorFilter::default(),
            normal: BackoffParameters::NORMAL,
            throttled: BackoffParameters::THROTTLED,
        }
    }
}

impl ExponentialBackoffWithJitter {
    pub fn new(immediate_first_retry: bool) -> Self {
        Self {
            immediate_first_retry,
            ..Default::default()
        }
    }

    pub fn with_error_filter(mut self, filter: ErrorFilter) -> Self {
        self.error_filter = filter;
        self
    }

    /// Computes the delay using a caller-supplied jitter sample in `[0, 1]`.
    pub fn timeout_with_jitter(&self, retry_count: u32, throttled: bool, sample: f64) -> Duration {
        if self.immediate_first_retry && retry_count == 0 && !throttled {
            return Duration::ZERO;
        }
        let params = if throttled {
            &self.throttled
        } else {
            &self.normal
        };
        let (low, high) = params.jitter_bounds_ms();
        let jitter = low + (high - low) * sample.clamp(0.0, 1.0);
        let exponent = retry_count.min(30) as i32 - 1;
        let growth = (2f64.powi(exponent) - 1.0).max(0.0);
        let min_ms = params.c_min.as_millis() as f64;
        let max_ms = params.c_max.as_millis() as f64;
        let delay_ms = (min_ms + growth * jitter).min(max_ms);
        Duration::from_millis(delay_ms as u64)
    }
}

impl RetryPolicy for ExponentialBackoffWithJitter {
    fn should_retry(&self, error: &TransportError) -> bool {
        self.error_filter.allows(error.kind())
    }

    fn next_retry_timeout(&self, retry_count: u32, throttled: bool) -> Duration {
        let sample: f64 = rand::rng().random_range(0.0..=1.0);
        self.timeout_with_jitter(retry_count, throttled, sample)
    }
}

/// Never retries; every disconnect escalates immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn should_retry(&self, _error: &TransportError) -> bool {
        false
    }

    fn next_retry_timeout(&self, _retry_count: u32, _throttled: bool) -> Duration {
        Duration::ZERO
    }
}
