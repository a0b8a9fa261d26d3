//! Jitter applied on top of a backoff delay to avoid synchronized retries.
//!
//! - `None`: deterministic delays, useful for tests and tightly controlled workflows.
//! - `Proportional(f)`: adds a uniform offset in `[-delay * f, +delay * f]`, floored at zero.
//!
//! Notes:
//! - RNG: [`Jitter::apply`] uses `rand`'s thread-local RNG; deterministic RNGs can be injected via
//!   [`Jitter::apply_with_rng`].
//! - The result may exceed the input delay; the backoff schedule applies its `max` cap afterwards.

use crate::error::ConfigError;
use rand::Rng;
use std::time::Duration;

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    #[default]
    None,
    /// Symmetric jitter proportional to the delay; factor lies in `[0, 1]`.
    Proportional(f64),
}

impl Jitter {
    /// Create proportional jitter, rejecting factors outside `[0, 1]`.
    pub fn proportional(factor: f64) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&factor) {
            return Err(ConfigError::InvalidJitterFactor(factor));
        }
        Ok(Jitter::Proportional(factor))
    }

    /// Translate the flat `jitter` / `jitter_factor` config pair.
    pub fn from_flags(enabled: bool, factor: f64) -> Result<Self, ConfigError> {
        let jitter = Self::proportional(factor)?;
        Ok(if enabled { jitter } else { Jitter::None })
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Jitter::Proportional(f) if *f > 0.0)
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match *self {
            Jitter::None => delay,
            Jitter::Proportional(factor) => {
                let nanos = delay.as_nanos() as f64;
                let spread = nanos * factor;
                if spread <= 0.0 {
                    return delay;
                }
                let offset = rng.random_range(-spread..=spread);
                let jittered = (nanos + offset).max(0.0).round();
                if jittered >= u64::MAX as f64 {
                    return Duration::from_nanos(u64::MAX);
                }
                Duration::from_nanos(jittered as u64)
            }
        }
    }
}
