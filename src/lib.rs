#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # issuepulse
//!
//! Resilience and orchestration core for issue-analytics dashboards.
//!
//! ## Features
//!
//! - **Retry** with fixed, linear, exponential or random backoff, proportional jitter and
//!   per-attempt timeouts
//! - **Circuit breakers** with half-open trial calls, a trial concurrency cap and a named registry
//! - **Composition** of both as `retry(breaker(op))`, as closures or as tower layers
//! - **TTL cache** with substring invalidation and a cache-aside repository decorator
//! - **Analytics orchestration**: concurrent strategy fan-out with per-strategy result caching
//!   and partial-failure isolation
//! - **Telemetry**: retry, breaker and cache events delivered to an injected sink such as
//!   [`MetricsCollector`]
//!
//! Nothing here is global. Registries, caches and orchestrators are constructed by the caller and
//! passed to whoever needs them.
//!
//! ## Quick Start
//!
//! ```rust
//! use issuepulse::{Backoff, Jitter, ResilienceError, RetryPolicy};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let policy = RetryPolicy::<std::io::Error>::builder()
//!         .max_attempts(3)
//!         .backoff(Backoff::exponential(Duration::from_millis(10)))
//!         .with_jitter(Jitter::None)
//!         .build()
//!         .unwrap();
//!
//!     let result = policy
//!         .execute(|| async { Ok::<_, ResilienceError<std::io::Error>>(42) })
//!         .await;
//!     assert_eq!(result.unwrap(), 42);
//! }
//! ```

pub mod analytics;
pub mod backoff;
pub mod cache;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod error;
pub mod jitter;
pub mod prelude;
pub mod presets;
pub mod repository;
pub mod retry;
#[cfg(feature = "serde")]
pub mod settings;
pub mod sleeper;
pub mod stack;
pub mod telemetry;

// Re-exports
pub use analytics::{
    AnalysisKind, AnalysisResult, AnalyticsConfiguration, AnalyticsContext, AnalyticsOrchestrator,
    CacheKeyMode, HealthTier, Record, Strategy, StrategyError, Summary,
};
pub use backoff::{Backoff, BackoffStrategy, MAX_BACKOFF};
pub use cache::{CacheEntry, CacheKey, CacheStats, TtlCache};
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerLayer, CircuitBreakerPolicy, CircuitBreakerService,
    CircuitBreakerStats, CircuitState,
};
pub use circuit_breaker_registry::{CircuitBreakerRegistry, RegistryError};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{ConfigError, ResilienceError};
pub use jitter::Jitter;
pub use repository::{CachedRepository, KeyFragment, RepoOperation, Repository, TtlPolicy};
pub use retry::{RetryConfig, RetryConfigBuilder, RetryLayer, RetryPolicy, RetryPolicyBuilder, RetryService};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use stack::{with_circuit_breaker, with_retry, ResilienceStack, ResilienceStackBuilder};
pub use telemetry::{
    LogSink, MemorySink, MetricsCollector, MulticastSink, NullSink, PolicyEvent, TelemetrySink,
};
