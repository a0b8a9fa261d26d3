//! Retry executor for fallible async operations.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - `ResilienceError::Inner(E)` is retried unless it matches an `exclude` predicate, or
//!   `retry_on` predicates were registered and none of them match. Such errors return
//!   immediately, unwrapped.
//! - Per-attempt timeouts (`timeout_per_attempt`) surface as `ResilienceError::Timeout` and are
//!   retryable unless disabled with `retry_timeouts(false)`.
//! - `CircuitOpen` and nested `RetryExhausted` errors are never retried, so an open breaker fails
//!   fast without burning attempts.
//! - When the final attempt fails the caller gets `RetryExhausted`, carrying the attempt count,
//!   every delay slept, the elapsed time and the last failure.
//!
//! Invariants:
//! - Attempts never exceed `max_attempts`.
//! - The sleeper is invoked exactly `attempts - 1` times for an exhausted call.
//! - Each call owns its own attempt state; a policy can be shared freely across tasks.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use issuepulse::{Backoff, InstantSleeper, ResilienceError, RetryPolicy};
//!
//! #[derive(Debug)]
//! struct MyErr;
//! impl std::fmt::Display for MyErr { fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "oops") } }
//! impl std::error::Error for MyErr {}
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let policy = RetryPolicy::<MyErr>::builder()
//!     .max_attempts(3) // total attempts
//!     .backoff(Backoff::exponential(Duration::from_millis(100)))
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//! let result: Result<(), ResilienceError<MyErr>> =
//!     policy.execute(|| async { Err(ResilienceError::Inner(MyErr)) }).await;
//! assert!(result.unwrap_err().is_retry_exhausted());
//! # });
//! ```

use crate::backoff::{Backoff, BackoffStrategy};
use crate::error::{ConfigError, ResilienceError};
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{NullSink, PolicyEvent, RetryEvent, TelemetrySink};
use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tower_layer::Layer;
use tower_service::Service;

type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type RetryCallback<E> = Arc<dyn Fn(usize, &ResilienceError<E>) + Send + Sync>;

/// Validated retry parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    timeout_per_attempt: Option<Duration>,
}

impl RetryConfig {
    /// Build a config from already-constructed parts, validating every bound.
    pub fn new(
        max_attempts: usize,
        backoff: Backoff,
        jitter: Jitter,
        timeout_per_attempt: Option<Duration>,
    ) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(max_attempts));
        }
        if let Jitter::Proportional(factor) = jitter {
            Jitter::proportional(factor)?;
        }
        if timeout_per_attempt.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ZeroAttemptTimeout);
        }
        Ok(Self { max_attempts, backoff, jitter, timeout_per_attempt })
    }

    /// Constructor for built-in presets whose bounds are known to hold.
    pub(crate) fn preset(max_attempts: usize, backoff: Backoff) -> Self {
        Self { max_attempts: max_attempts.max(1), backoff, jitter: Jitter::None, timeout_per_attempt: None }
    }

    /// Builder over the flat field set (`base_delay`, `backoff_factor`, `jitter_factor`, ...).
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    pub fn timeout_per_attempt(&self) -> Option<Duration> {
        self.timeout_per_attempt
    }
}

impl Default for RetryConfig {
    /// 3 attempts, exponential from 1s capped at 60s, 10% jitter, no per-attempt timeout.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_secs(1)).capped_at(Duration::from_secs(60)),
            jitter: Jitter::Proportional(0.1),
            timeout_per_attempt: None,
        }
    }
}

/// Flat builder mirroring the settings file layout.
#[derive(Debug, Clone)]
pub struct RetryConfigBuilder {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
    strategy: BackoffStrategy,
    backoff_factor: f64,
    jitter: bool,
    jitter_factor: f64,
    timeout_per_attempt: Option<Duration>,
}

impl Default for RetryConfigBuilder {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            backoff_factor: Backoff::DEFAULT_FACTOR,
            jitter: true,
            jitter_factor: 0.1,
            timeout_per_attempt: None,
        }
    }
}

impl RetryConfigBuilder {
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    pub fn timeout_per_attempt(mut self, timeout: Duration) -> Self {
        self.timeout_per_attempt = Some(timeout);
        self
    }

    pub fn build(self) -> Result<RetryConfig, ConfigError> {
        let backoff = Backoff::from_strategy(self.strategy, self.base_delay)
            .with_factor(self.backoff_factor)?
            .with_max(self.max_delay)?;
        let jitter = Jitter::from_flags(self.jitter, self.jitter_factor)?;
        RetryConfig::new(self.max_attempts, backoff, jitter, self.timeout_per_attempt)
    }
}

/// Scratch state for one in-flight call.
#[derive(Debug)]
struct RetryState {
    attempt: usize,
    started: Instant,
    delays: Vec<Duration>,
}

impl RetryState {
    fn new() -> Self {
        Self { attempt: 0, started: Instant::now(), delays: Vec::new() }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Retry policy combining a validated config, error classification, and a sleeper.
pub struct RetryPolicy<E> {
    config: RetryConfig,
    retry_on: Vec<Predicate<E>>,
    exclude: Vec<Predicate<E>>,
    retry_timeouts: bool,
    sleeper: Arc<dyn Sleeper>,
    rng: Option<Arc<Mutex<StdRng>>>,
    sink: Arc<dyn TelemetrySink>,
    on_retry: Option<RetryCallback<E>>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            retry_on: self.retry_on.clone(),
            exclude: self.exclude.clone(),
            retry_timeouts: self.retry_timeouts,
            sleeper: self.sleeper.clone(),
            rng: self.rng.clone(),
            sink: self.sink.clone(),
            on_retry: self.on_retry.clone(),
        }
    }
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("retry_on", &self.retry_on.len())
            .field("exclude", &self.exclude.len())
            .field("retry_timeouts", &self.retry_timeouts)
            .field("sleeper", &self.sleeper)
            .field("seeded", &self.rng.is_some())
            .field("sink", &self.sink)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    /// Policy that retries every `Inner` error using `config`.
    pub fn from_config(config: RetryConfig) -> Self {
        Self {
            config,
            retry_on: Vec::new(),
            exclude: Vec::new(),
            retry_timeouts: true,
            sleeper: Arc::new(TokioSleeper),
            rng: None,
            sink: Arc::new(NullSink),
            on_retry: None,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute an async operation with retry semantics.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let max_attempts = self.config.max_attempts;
        let mut state = RetryState::new();

        loop {
            state.attempt += 1;
            let err = match self.run_attempt(&mut operation).await {
                Ok(value) => {
                    if state.attempt > 1 {
                        tracing::info!(
                            attempts = state.attempt,
                            elapsed_ms = state.elapsed().as_millis() as u64,
                            "operation succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !self.is_retryable(&err) {
                tracing::debug!(attempt = state.attempt, error = %err, "non-retryable error");
                return Err(err);
            }

            if state.attempt >= max_attempts {
                let elapsed = state.elapsed();
                tracing::error!(
                    attempts = state.attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %err,
                    "retry attempts exhausted"
                );
                self.sink.emit(&PolicyEvent::Retry(RetryEvent::Exhausted {
                    total_attempts: state.attempt,
                    total_duration: elapsed,
                }));
                return Err(ResilienceError::retry_exhausted(
                    state.attempt,
                    state.delays,
                    elapsed,
                    err,
                ));
            }

            let delay = self.next_delay(state.attempt);
            tracing::warn!(
                attempt = state.attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed; retrying"
            );
            if let Some(callback) = &self.on_retry {
                callback(state.attempt, &err);
            }
            self.sink.emit(&PolicyEvent::Retry(RetryEvent::Attempt { attempt: state.attempt, delay }));
            state.delays.push(delay);
            self.sleeper.sleep(delay).await;
        }
    }

    async fn run_attempt<T, Fut, Op>(&self, operation: &mut Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnMut() -> Fut,
    {
        let Some(limit) = self.config.timeout_per_attempt else {
            return operation().await;
        };
        let started = Instant::now();
        match tokio::time::timeout(limit, operation()).await {
            Ok(result) => result,
            Err(_) => Err(ResilienceError::Timeout { elapsed: started.elapsed(), timeout: limit }),
        }
    }

    fn is_retryable(&self, err: &ResilienceError<E>) -> bool {
        match err {
            ResilienceError::Inner(e) => {
                if self.exclude.iter().any(|p| p(e)) {
                    return false;
                }
                self.retry_on.is_empty() || self.retry_on.iter().any(|p| p(e))
            }
            ResilienceError::Timeout { .. } => self.retry_timeouts,
            ResilienceError::CircuitOpen { .. } | ResilienceError::RetryExhausted { .. } => false,
        }
    }

    fn next_delay(&self, attempt: usize) -> Duration {
        let backoff = &self.config.backoff;
        let jitter = &self.config.jitter;
        match &self.rng {
            Some(rng) => {
                let mut rng = rng.lock().unwrap_or_else(PoisonError::into_inner);
                backoff.delay_with_rng(attempt, jitter, &mut *rng)
            }
            None => backoff.delay_with_rng(attempt, jitter, &mut rand::rng()),
        }
    }
}

/// Builder for `RetryPolicy`.
pub struct RetryPolicyBuilder<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    timeout_per_attempt: Option<Duration>,
    retry_on: Vec<Predicate<E>>,
    exclude: Vec<Predicate<E>>,
    retry_timeouts: bool,
    sleeper: Arc<dyn Sleeper>,
    seed: Option<u64>,
    sink: Arc<dyn TelemetrySink>,
    on_retry: Option<RetryCallback<E>>,
}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Create a builder seeded from `RetryConfig::default()`.
    pub fn new() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            backoff: defaults.backoff,
            jitter: defaults.jitter,
            timeout_per_attempt: defaults.timeout_per_attempt,
            retry_on: Vec::new(),
            exclude: Vec::new(),
            retry_timeouts: true,
            sleeper: Arc::new(TokioSleeper),
            seed: None,
            sink: Arc::new(NullSink),
            on_retry: None,
        }
    }

    /// Replace attempts, backoff, jitter and timeout with a validated config.
    pub fn config(mut self, config: RetryConfig) -> Self {
        self.max_attempts = config.max_attempts;
        self.backoff = config.backoff;
        self.jitter = config.jitter;
        self.timeout_per_attempt = config.timeout_per_attempt;
        self
    }

    /// Set total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Bound each attempt individually.
    pub fn timeout_per_attempt(mut self, timeout: Duration) -> Self {
        self.timeout_per_attempt = Some(timeout);
        self
    }

    /// Add an error class worth retrying. Once any is registered, unmatched errors are fatal.
    pub fn retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retry_on.push(Arc::new(predicate));
        self
    }

    /// Add an error class that is returned on first occurrence. Exclusion wins over `retry_on`.
    pub fn exclude<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.exclude.push(Arc::new(predicate));
        self
    }

    /// Whether per-attempt timeouts are retried (default: true).
    pub fn retry_timeouts(mut self, retry: bool) -> Self {
        self.retry_timeouts = retry;
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Pin the RNG used for random backoff and jitter.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Report `Attempt` and `Exhausted` events to `sink`.
    pub fn with_sink<S: TelemetrySink + 'static>(mut self, sink: S) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Run `callback` with the attempt number and its error before each backoff sleep.
    pub fn on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize, &ResilienceError<E>) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    /// Build the retry policy, validating inputs.
    pub fn build(self) -> Result<RetryPolicy<E>, ConfigError> {
        let config = RetryConfig::new(
            self.max_attempts,
            self.backoff,
            self.jitter,
            self.timeout_per_attempt,
        )?;
        Ok(RetryPolicy {
            config,
            retry_on: self.retry_on,
            exclude: self.exclude,
            retry_timeouts: self.retry_timeouts,
            sleeper: self.sleeper,
            rng: self.seed.map(|seed| Arc::new(Mutex::new(StdRng::seed_from_u64(seed)))),
            sink: self.sink,
            on_retry: self.on_retry,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Tower layer applying a [`RetryPolicy`] to every request. Requests must be `Clone`.
pub struct RetryLayer<E> {
    policy: RetryPolicy<E>,
}

impl<E> Clone for RetryLayer<E> {
    fn clone(&self) -> Self {
        Self { policy: self.policy.clone() }
    }
}

impl<E> RetryLayer<E> {
    pub fn new(policy: RetryPolicy<E>) -> Self {
        Self { policy }
    }
}

impl<S, E> Layer<S> for RetryLayer<E> {
    type Service = RetryService<S, E>;

    fn layer(&self, service: S) -> Self::Service {
        RetryService { inner: service, policy: self.policy.clone() }
    }
}

/// Retry service produced by `RetryLayer`.
pub struct RetryService<S, E> {
    inner: S,
    policy: RetryPolicy<E>,
}

impl<S: Clone, E> Clone for RetryService<S, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), policy: self.policy.clone() }
    }
}

impl<S, E, Request> Service<Request> for RetryService<S, E>
where
    Request: Clone + Send + 'static,
    S: Service<Request> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Error: Into<E>,
    S::Future: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<E>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(|e| ResilienceError::Inner(e.into()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let policy = self.policy.clone();
        // The readied service handles the first attempt; retries ready a fresh clone.
        let inner = self.inner.clone();
        let ready = std::mem::replace(&mut self.inner, inner.clone());
        Box::pin(async move {
            let mut first = Some(ready);
            policy
                .execute(move || {
                    let req = req.clone();
                    let ready = first.take();
                    let fresh = inner.clone();
                    async move {
                        let mut svc = match ready {
                            Some(svc) => svc,
                            None => {
                                let mut svc = fresh;
                                futures::future::poll_fn(|cx| svc.poll_ready(cx))
                                    .await
                                    .map_err(|e| ResilienceError::Inner(e.into()))?;
                                svc
                            }
                        };
                        svc.call(req).await.map_err(|e| ResilienceError::Inner(e.into()))
                    }
                })
                .await
        })
    }
}
