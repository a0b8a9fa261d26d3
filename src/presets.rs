//! Ready-made retry and circuit breaker settings for the dependencies an issue dashboard talks to.
//!
//! ## Retry presets
//!
//! | preset             | attempts | backoff                      |
//! |--------------------|----------|------------------------------|
//! | [`default_retry`]  | 3        | exponential, 1s → 10s        |
//! | [`aggressive_retry`] | 5      | exponential ×2, 2s → 30s     |
//! | [`quick_retry`]    | 2        | exponential, 1s → 5s         |
//! | [`api_retry`]      | 3        | exponential ×2, 2s → 20s     |
//!
//! ## Breaker presets
//!
//! `trials` is both the half-open concurrency cap and the number of successes needed to close.
//!
//! | preset               | failures | recovery | trials |
//! |----------------------|----------|----------|--------|
//! | [`github_api`]       | 5        | 120s     | 3      |
//! | [`ai_api`]           | 3        | 60s      | 2      |
//! | [`database`]         | 10       | 30s      | 5      |
//! | [`external_service`] | 5        | 60s      | 3      |
//!
//! ```rust
//! use issuepulse::{presets, CircuitBreakerRegistry};
//!
//! let registry = CircuitBreakerRegistry::default();
//! let stack = presets::github_stack::<std::io::Error>(&registry);
//! assert_eq!(stack.retry().config().max_attempts(), 3);
//! assert!(registry.get(presets::GITHUB_BREAKER).is_some());
//! ```

use std::time::Duration;

use crate::backoff::Backoff;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::stack::ResilienceStack;

/// Registry name used by [`github_stack`].
pub const GITHUB_BREAKER: &str = "github_api";
/// Registry name used by [`ai_stack`].
pub const AI_BREAKER: &str = "ai_api";

fn exponential(attempts: usize, base_secs: u64, max_secs: u64) -> RetryConfig {
    RetryConfig::preset(
        attempts,
        Backoff::exponential(Duration::from_secs(base_secs)).capped_at(Duration::from_secs(max_secs)),
    )
}

/// 3 attempts, exponential backoff from 1s capped at 10s.
pub fn default_retry() -> RetryConfig {
    exponential(3, 1, 10)
}

/// 5 attempts, exponential backoff from 2s capped at 30s.
pub fn aggressive_retry() -> RetryConfig {
    exponential(5, 2, 30)
}

/// 2 attempts, exponential backoff from 1s capped at 5s.
pub fn quick_retry() -> RetryConfig {
    exponential(2, 1, 5)
}

/// 3 attempts, exponential backoff from 2s capped at 20s.
pub fn api_retry() -> RetryConfig {
    exponential(3, 2, 20)
}

pub fn github_api() -> CircuitBreakerConfig {
    CircuitBreakerConfig::preset(5, Duration::from_secs(120), 3)
}

/// AI calls are slow and expensive, so the breaker trips sooner.
pub fn ai_api() -> CircuitBreakerConfig {
    CircuitBreakerConfig::preset(3, Duration::from_secs(60), 2)
}

pub fn database() -> CircuitBreakerConfig {
    CircuitBreakerConfig::preset(10, Duration::from_secs(30), 5)
}

pub fn external_service() -> CircuitBreakerConfig {
    CircuitBreakerConfig::preset(5, Duration::from_secs(60), 3)
}

/// API retry in front of the registry's shared GitHub breaker.
pub fn github_stack<E>(registry: &CircuitBreakerRegistry) -> ResilienceStack<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    ResilienceStack::builder()
        .retry(RetryPolicy::from_config(api_retry()))
        .circuit_breaker(registry.get_or_create_with(GITHUB_BREAKER, github_api))
        .build()
}

/// Quick retry in front of the registry's shared AI breaker.
pub fn ai_stack<E>(registry: &CircuitBreakerRegistry) -> ResilienceStack<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    ResilienceStack::builder()
        .retry(RetryPolicy::from_config(quick_retry()))
        .circuit_breaker(registry.get_or_create_with(AI_BREAKER, ai_api))
        .build()
}
