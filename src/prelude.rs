//! Convenient re-exports for common issuepulse types.
pub use crate::{
    analytics::{
        AnalysisKind, AnalysisResult, AnalyticsConfiguration, AnalyticsContext,
        AnalyticsOrchestrator, Record, Strategy, StrategyError, Summary,
    },
    backoff::{Backoff, BackoffStrategy},
    cache::{CacheKey, TtlCache},
    circuit_breaker::{CircuitBreakerConfig, CircuitBreakerLayer, CircuitBreakerPolicy, CircuitState},
    circuit_breaker_registry::CircuitBreakerRegistry,
    error::{ConfigError, ResilienceError},
    jitter::Jitter,
    repository::{CachedRepository, Repository, TtlPolicy},
    retry::{RetryConfig, RetryLayer, RetryPolicy},
    stack::{with_circuit_breaker, with_retry, ResilienceStack},
    telemetry::{MetricsCollector, PolicyEvent, TelemetrySink},
};
