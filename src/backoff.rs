//! Backoff strategies for retry policies.
//!
//! Four strategies map a retry attempt number to a wait before the next attempt:
//!
//! | strategy      | delay for attempt `n` (1-based)            |
//! |---------------|--------------------------------------------|
//! | `Fixed`       | `base`                                     |
//! | `Linear`      | `base * n`                                 |
//! | `Exponential` | `base * factor^(n - 1)`                    |
//! | `Random`      | uniform in `[0, base * n]`                 |
//!
//! Attempt `0` represents the initial call and never waits. Jitter (see [`crate::Jitter`]) is
//! applied to the strategy output and the result is then capped at `max`. Computations that
//! would overflow saturate to [`MAX_BACKOFF`].
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use issuepulse::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(2))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO); // initial call
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(6), Duration::from_secs(2)); // capped
//! ```

use crate::error::ConfigError;
use crate::jitter::Jitter;
use rand::Rng;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// How the delay grows with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
    Random,
}

impl BackoffStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffStrategy::Fixed => "fixed",
            BackoffStrategy::Linear => "linear",
            BackoffStrategy::Exponential => "exponential",
            BackoffStrategy::Random => "random",
        }
    }
}

impl std::str::FromStr for BackoffStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(BackoffStrategy::Fixed),
            "linear" => Ok(BackoffStrategy::Linear),
            "exponential" => Ok(BackoffStrategy::Exponential),
            "random" => Ok(BackoffStrategy::Random),
            other => Err(ConfigError::UnknownVariant {
                field: "backoff_strategy",
                value: other.to_string(),
            }),
        }
    }
}

/// Validated backoff schedule: strategy, base delay, cap and growth factor.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    strategy: BackoffStrategy,
    base: Duration,
    max: Duration,
    factor: f64,
}

impl Backoff {
    /// Default exponential growth factor.
    pub const DEFAULT_FACTOR: f64 = 2.0;

    fn with_strategy(strategy: BackoffStrategy, base: Duration) -> Self {
        Self { strategy, base, max: MAX_BACKOFF.max(base), factor: Self::DEFAULT_FACTOR }
    }

    /// Always wait `base`.
    pub fn fixed(base: Duration) -> Self {
        Self::with_strategy(BackoffStrategy::Fixed, base)
    }

    /// Wait `base * attempt`.
    pub fn linear(base: Duration) -> Self {
        Self::with_strategy(BackoffStrategy::Linear, base)
    }

    /// Wait `base * factor^(attempt - 1)`; the factor defaults to 2.
    pub fn exponential(base: Duration) -> Self {
        Self::with_strategy(BackoffStrategy::Exponential, base)
    }

    /// Wait a uniformly random duration in `[0, base * attempt]`.
    pub fn random(base: Duration) -> Self {
        Self::with_strategy(BackoffStrategy::Random, base)
    }

    /// Build from a strategy tag, e.g. one read from settings.
    pub fn from_strategy(strategy: BackoffStrategy, base: Duration) -> Self {
        Self::with_strategy(strategy, base)
    }

    /// Cap every delay at `max`. Errors if `max` is below the base delay; a zero cap is only
    /// valid over a zero base.
    pub fn with_max(mut self, max: Duration) -> Result<Self, ConfigError> {
        if max < self.base {
            return Err(ConfigError::MaxDelayBelowBase { base: self.base, max });
        }
        self.max = max;
        Ok(self)
    }

    /// Set the growth factor. Must be finite and positive; exponential schedules additionally
    /// require `factor >= 1` so successive delays never shrink.
    pub fn with_factor(mut self, factor: f64) -> Result<Self, ConfigError> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(ConfigError::InvalidBackoffFactor(factor));
        }
        if self.strategy == BackoffStrategy::Exponential && factor < 1.0 {
            return Err(ConfigError::ShrinkingExponentialFactor(factor));
        }
        self.factor = factor;
        Ok(self)
    }

    /// Cap used by built-in defaults whose bounds are known to hold.
    pub(crate) fn capped_at(mut self, max: Duration) -> Self {
        self.max = max.max(self.base);
        self
    }

    pub fn strategy(&self) -> BackoffStrategy {
        self.strategy
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Un-jittered, capped delay using the thread-local RNG for the `Random` strategy.
    pub fn delay(&self, attempt: usize) -> Duration {
        self.delay_with_rng(attempt, &Jitter::None, &mut rand::rng())
    }

    /// Full calculation: strategy delay, then jitter, then the `max` cap.
    pub fn delay_with_rng<R: Rng>(
        &self,
        attempt: usize,
        jitter: &Jitter,
        rng: &mut R,
    ) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let raw = self.strategy_delay(attempt, rng);
        jitter.apply_with_rng(raw, rng).min(self.max)
    }

    fn strategy_delay<R: Rng>(&self, attempt: usize, rng: &mut R) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.base.min(MAX_BACKOFF),
            BackoffStrategy::Linear => self.linear_delay(attempt),
            BackoffStrategy::Exponential => self.exponential_delay(attempt),
            BackoffStrategy::Random => {
                let upper = saturating_nanos(self.linear_delay(attempt));
                if upper == 0 {
                    return Duration::ZERO;
                }
                Duration::from_nanos(rng.random_range(0..=upper))
            }
        }
    }

    fn linear_delay(&self, attempt: usize) -> Duration {
        let attempt = attempt.min(u32::MAX as usize) as u128; // clamp to prevent overflow
        let nanos = self.base.as_nanos().saturating_mul(attempt);
        Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64)
    }

    fn exponential_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let nanos = self.base.as_nanos() as f64 * self.factor.powi(exponent);
        let cap = MAX_BACKOFF.as_nanos() as f64;
        if !nanos.is_finite() || nanos >= cap {
            return MAX_BACKOFF;
        }
        Duration::from_nanos(nanos.round() as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1))
    }
}

fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
