//! Error types for resilience policies and configuration validation.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Unified error type for retry, circuit breaker and per-attempt timeouts.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// A single attempt exceeded its time bound
    Timeout { elapsed: Duration, timeout: Duration },
    /// The circuit breaker is open; the wrapped operation was not invoked
    CircuitOpen { failure_count: usize, open_duration: Duration },
    /// All retry attempts were exhausted
    RetryExhausted {
        attempts: usize,
        /// Backoff delays slept between attempts, in order.
        delays: Arc<[Duration]>,
        elapsed: Duration,
        /// Failure of the final attempt.
        last: Box<ResilienceError<E>>,
    },
    /// The underlying operation failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "attempt timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::CircuitOpen { failure_count, open_duration } => {
                write!(
                    f,
                    "circuit breaker open ({} failures, open for {:?})",
                    failure_count, open_duration
                )
            }
            Self::RetryExhausted { attempts, elapsed, last, .. } => {
                write!(
                    f,
                    "retry exhausted after {} attempts in {:?}; last error: {}",
                    attempts, elapsed, last
                )
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Build a `RetryExhausted` from the final failure and the call's delay history.
    pub fn retry_exhausted(
        attempts: usize,
        delays: Vec<Duration>,
        elapsed: Duration,
        last: ResilienceError<E>,
    ) -> Self {
        ResilienceError::RetryExhausted {
            attempts,
            delays: delays.into(),
            elapsed,
            last: Box::new(last),
        }
    }

    /// Check if this error is due to a per-attempt timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is due to circuit breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error is due to retry exhaustion
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the underlying operation error, looking through `RetryExhausted`.
    pub fn root_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { last, .. } => last.root_inner(),
            _ => None,
        }
    }

    /// Access retry exhaustion info as (attempts, delay history).
    pub fn retry_exhausted_info(&self) -> Option<(usize, &[Duration])> {
        match self {
            Self::RetryExhausted { attempts, delays, .. } => Some((*attempts, delays)),
            _ => None,
        }
    }

    /// Access circuit-open duration if present.
    pub fn circuit_open_duration(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { open_duration, .. } => Some(*open_duration),
            _ => None,
        }
    }

    /// Access timeout details as (elapsed, limit).
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }
}

/// Validation failures raised when configuration is constructed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_attempts must be >= 1 (got {0})")]
    InvalidMaxAttempts(usize),
    #[error("max_delay ({max:?}) must be >= base_delay ({base:?})")]
    MaxDelayBelowBase { base: Duration, max: Duration },
    #[error("backoff_factor must be finite and > 0 (got {0})")]
    InvalidBackoffFactor(f64),
    #[error("exponential backoff_factor must be >= 1 (got {0})")]
    ShrinkingExponentialFactor(f64),
    #[error("jitter_factor must lie in [0, 1] (got {0})")]
    InvalidJitterFactor(f64),
    #[error("timeout_per_attempt must be greater than zero")]
    ZeroAttemptTimeout,
    #[error("failure_threshold must be >= 1 (got {0})")]
    InvalidFailureThreshold(usize),
    #[error("success_threshold must be >= 1 (got {0})")]
    InvalidSuccessThreshold(usize),
    #[error("recovery_timeout must be greater than zero")]
    ZeroRecoveryTimeout,
    #[error("half_open_max_calls must be >= 1 (got {0})")]
    InvalidHalfOpenLimit(usize),
    #[error("failure_rate_threshold must lie in (0, 1] (got {0})")]
    InvalidFailureRate(f64),
    #[error("minimum_requests must be >= 1 (got {0})")]
    InvalidMinimumRequests(usize),
    #[error("sliding_window_size must be >= 1 (got {0})")]
    InvalidSlidingWindow(usize),
    #[error("minimum_requests ({minimum}) exceeds sliding_window_size ({window})")]
    MinimumRequestsExceedWindow { minimum: usize, window: usize },
    #[error("time_window_days must be >= 1 (got {0})")]
    InvalidTimeWindow(u32),
    #[error("cache_ttl_minutes must be >= 1 when caching is enabled (got {0})")]
    InvalidCacheTtl(u32),
    #[error("strategy_timeout must be greater than zero")]
    ZeroStrategyTimeout,
    #[error("base TTL must be greater than zero")]
    ZeroBaseTtl,
    #[error("TTL multiplier for {operation} must be >= 1 (got {multiplier})")]
    InvalidTtlMultiplier { operation: &'static str, multiplier: u32 },
    #[error("unknown {field} value '{value}'")]
    UnknownVariant { field: &'static str, value: String },
    #[error("invalid settings document: {0}")]
    Parse(String),
}
