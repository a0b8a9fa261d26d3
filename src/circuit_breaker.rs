//! Circuit breaker guarding calls to a failing dependency.
//!
//! Three phases:
//! - **Closed**: calls pass through. Consecutive failures are counted; reaching
//!   `failure_threshold` opens the circuit. Any success resets the count. Optionally the circuit
//!   also opens once the failure rate over the last `sliding_window_size` calls reaches
//!   `failure_rate_threshold`, provided the window holds at least `minimum_requests` calls.
//! - **Open**: calls are rejected with `ResilienceError::CircuitOpen` without invoking the
//!   operation. Once `recovery_timeout` has elapsed since the last failure the next caller moves
//!   the breaker to half-open.
//! - **HalfOpen**: calls run as trials (optionally capped by `half_open_max_calls`). A single
//!   failure re-opens; `success_threshold` successes close.
//!
//! All bookkeeping for one breaker lives behind a single mutex that is held only while checking
//! or transitioning state, never across the wrapped call. Telemetry events are emitted after the
//! mutex is released.

use crate::clock::{span_millis, Clock, MonotonicClock};
use crate::error::{ConfigError, ResilienceError};
use crate::telemetry::{CircuitBreakerEvent, NullSink, PolicyEvent, TelemetrySink};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until recovery timeout elapses.
    Open,
    /// Trial mode testing whether the dependency recovered.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    success_threshold: usize,
    recovery_timeout: Duration,
    half_open_max_calls: Option<usize>,
    failure_rate_threshold: Option<f64>,
    minimum_requests: usize,
    sliding_window_size: usize,
}

impl CircuitBreakerConfig {
    const DEFAULT_MINIMUM_REQUESTS: usize = 10;
    const DEFAULT_WINDOW: usize = 100;

    fn counting(
        failure_threshold: usize,
        success_threshold: usize,
        recovery_timeout: Duration,
        half_open_max_calls: Option<usize>,
    ) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            recovery_timeout,
            half_open_max_calls,
            failure_rate_threshold: None,
            minimum_requests: Self::DEFAULT_MINIMUM_REQUESTS,
            sliding_window_size: Self::DEFAULT_WINDOW,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a config with validation. Half-open trial calls are unlimited until
    /// [`with_half_open_limit`](Self::with_half_open_limit) is called.
    pub fn new(
        failure_threshold: usize,
        success_threshold: usize,
        recovery_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold(failure_threshold));
        }
        if success_threshold == 0 {
            return Err(ConfigError::InvalidSuccessThreshold(success_threshold));
        }
        if recovery_timeout.is_zero() {
            return Err(ConfigError::ZeroRecoveryTimeout);
        }
        Ok(Self::counting(failure_threshold, success_threshold, recovery_timeout, None))
    }

    /// Cap concurrent half-open trial calls; must be > 0.
    pub fn with_half_open_limit(mut self, limit: usize) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::InvalidHalfOpenLimit(limit));
        }
        self.half_open_max_calls = Some(limit);
        Ok(self)
    }

    /// Also open a closed circuit when at least `threshold` of the calls in the sliding window
    /// failed, once the window holds `minimum_requests` calls. `threshold` lies in `(0, 1]`.
    pub fn with_failure_rate(
        mut self,
        threshold: f64,
        minimum_requests: usize,
    ) -> Result<Self, ConfigError> {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::InvalidFailureRate(threshold));
        }
        if minimum_requests == 0 {
            return Err(ConfigError::InvalidMinimumRequests(minimum_requests));
        }
        if minimum_requests > self.sliding_window_size {
            return Err(ConfigError::MinimumRequestsExceedWindow {
                minimum: minimum_requests,
                window: self.sliding_window_size,
            });
        }
        self.failure_rate_threshold = Some(threshold);
        self.minimum_requests = minimum_requests;
        Ok(self)
    }

    /// Number of recent closed-state outcomes the failure rate is computed over (default 100).
    pub fn with_sliding_window(mut self, size: usize) -> Result<Self, ConfigError> {
        if size == 0 {
            return Err(ConfigError::InvalidSlidingWindow(size));
        }
        if self.failure_rate_threshold.is_some() && self.minimum_requests > size {
            return Err(ConfigError::MinimumRequestsExceedWindow {
                minimum: self.minimum_requests,
                window: size,
            });
        }
        self.sliding_window_size = size;
        Ok(self)
    }

    /// Constructor for built-in presets: `trials` calls run concurrently and must all
    /// succeed to close.
    pub(crate) fn preset(failure_threshold: usize, recovery_timeout: Duration, trials: usize) -> Self {
        Self::counting(failure_threshold.max(1), trials.max(1), recovery_timeout, Some(trials.max(1)))
    }

    /// Breaker that never opens.
    pub fn disabled() -> Self {
        Self::counting(usize::MAX, 1, Duration::MAX, None)
    }

    /// Consecutive failures that open a closed circuit.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    /// Half-open successes required to close.
    pub fn success_threshold(&self) -> usize {
        self.success_threshold
    }

    /// Time to stay open, measured from the last failure.
    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    pub fn half_open_max_calls(&self) -> Option<usize> {
        self.half_open_max_calls
    }

    /// `None` unless rate-based tripping was enabled.
    pub fn failure_rate_threshold(&self) -> Option<f64> {
        self.failure_rate_threshold
    }

    pub fn minimum_requests(&self) -> usize {
        self.minimum_requests
    }

    pub fn sliding_window_size(&self) -> usize {
        self.sliding_window_size
    }
}

impl Default for CircuitBreakerConfig {
    /// 5 failures to open, one success to close, 60s recovery.
    fn default() -> Self {
        Self::counting(5, 1, Duration::from_secs(60), None)
    }
}

/// Point-in-time view of a breaker, for health endpoints and logs.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: usize,
    pub success_count: usize,
    /// Failed share of the closed-state calls in the sliding window; 0 when it is empty.
    pub failure_rate: f64,
    /// `1 - failure_rate`.
    pub success_rate: f64,
    /// Calls currently in the sliding window.
    pub window_calls: usize,
    pub half_open_in_flight: usize,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    /// Clock reading (ms) of the most recent counted failure.
    pub last_failure_at_millis: Option<u64>,
    /// Clock reading (ms) of the most recent phase change.
    pub last_transition_at_millis: u64,
}

#[derive(Debug)]
struct BreakerState {
    phase: CircuitState,
    failure_count: usize,
    success_count: usize,
    half_open_in_flight: usize,
    /// Bumped on every transition so stale trial permits can't touch a newer half-open window.
    generation: u64,
    /// Recent closed-state outcomes, `true` for a failure.
    window: VecDeque<bool>,
    window_failures: usize,
    last_failure_at: Option<u64>,
    last_transition_at: u64,
    total_calls: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl BreakerState {
    fn new(now: u64) -> Self {
        Self {
            phase: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_in_flight: 0,
            generation: 0,
            window: VecDeque::new(),
            window_failures: 0,
            last_failure_at: None,
            last_transition_at: now,
            total_calls: 0,
            total_failures: 0,
            total_rejections: 0,
        }
    }

    fn transition(&mut self, to: CircuitState, now: u64) {
        self.phase = to;
        self.generation = self.generation.wrapping_add(1);
        self.half_open_in_flight = 0;
        self.success_count = 0;
        self.last_transition_at = now;
        if to == CircuitState::Closed {
            self.failure_count = 0;
            self.window.clear();
            self.window_failures = 0;
        }
    }

    fn observe(&mut self, failed: bool, capacity: usize) {
        if self.window.len() >= capacity && self.window.pop_front() == Some(true) {
            self.window_failures -= 1;
        }
        self.window.push_back(failed);
        if failed {
            self.window_failures += 1;
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.window_failures as f64 / self.window.len() as f64
        }
    }
}

enum Outcome {
    Success,
    Failure,
    Ignored,
}

/// Admission ticket for one call. Releases its half-open slot on drop so a panicking trial can't
/// wedge the breaker.
struct Permit<'a> {
    shared: &'a Mutex<BreakerState>,
    trial_generation: Option<u64>,
}

impl Permit<'_> {
    fn release(&mut self, state: &mut BreakerState) {
        if let Some(generation) = self.trial_generation.take() {
            if state.generation == generation {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
            }
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial_generation.is_some() {
            let shared = self.shared;
            let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
            self.release(&mut state);
        }
    }
}

/// Circuit breaker policy guarding async operations.
///
/// Clones share the same underlying state via `Arc`, so all handles observe and affect the same
/// circuit lifecycle.
#[derive(Debug, Clone)]
pub struct CircuitBreakerPolicy {
    state: Arc<Mutex<BreakerState>>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn TelemetrySink>,
}

impl CircuitBreakerPolicy {
    /// Create a breaker with `success_threshold = 1`.
    ///
    /// # Examples
    /// ```
    /// use issuepulse::CircuitBreakerPolicy;
    /// use std::time::Duration;
    /// let breaker = CircuitBreakerPolicy::new(5, Duration::from_secs(30)).unwrap();
    /// ```
    pub fn new(failure_threshold: usize, recovery_timeout: Duration) -> Result<Self, ConfigError> {
        let config = CircuitBreakerConfig::new(failure_threshold, 1, recovery_timeout)?;
        Ok(Self::with_config(config))
    }

    /// Create a breaker from a validated config.
    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self::with_shared_clock(config, Arc::new(MonotonicClock::default()))
    }

    pub(crate) fn with_shared_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        Self {
            state: Arc::new(Mutex::new(BreakerState::new(now))),
            config,
            clock,
            sink: Arc::new(NullSink),
        }
    }

    /// Override the clock (useful for deterministic tests). Resets the breaker.
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        Self::with_shared_clock(self.config, Arc::new(clock)).with_shared_sink(self.sink)
    }

    /// Report state changes and rejections to `sink`. Handles cloned before this call keep their
    /// old sink.
    pub fn with_sink<S: TelemetrySink + 'static>(self, sink: S) -> Self {
        self.with_shared_sink(Arc::new(sink))
    }

    pub(crate) fn with_shared_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Whether two handles drive the same circuit.
    pub fn shares_state_with(&self, other: &CircuitBreakerPolicy) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current phase. An open breaker whose timeout elapsed still reports `Open` until the next
    /// call moves it to half-open.
    pub fn state(&self) -> CircuitState {
        self.lock().phase
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.lock();
        CircuitBreakerStats {
            state: state.phase,
            failure_count: state.failure_count,
            success_count: state.success_count,
            failure_rate: state.failure_rate(),
            success_rate: 1.0 - state.failure_rate(),
            window_calls: state.window.len(),
            half_open_in_flight: state.half_open_in_flight,
            total_calls: state.total_calls,
            total_failures: state.total_failures,
            total_rejections: state.total_rejections,
            last_failure_at_millis: state.last_failure_at,
            last_transition_at_millis: state.last_transition_at,
        }
    }

    /// Force the breaker back to a fresh closed state, clearing counters and totals.
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        let previous = {
            let mut state = self.lock();
            let previous = state.phase;
            let generation = state.generation.wrapping_add(1);
            *state = BreakerState::new(now);
            state.generation = generation;
            previous
        };
        tracing::info!("circuit breaker reset");
        if previous != CircuitState::Closed {
            self.emit(CircuitBreakerEvent::Closed);
        }
    }

    /// Execute `operation` under breaker protection. Every `Inner` error counts as a failure.
    ///
    /// # Errors
    /// Returns `ResilienceError::CircuitOpen` if the circuit is open or half-open capacity is
    /// exceeded; otherwise the operation's own error.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: Send,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        self.execute_classified(operation, |_: &E| true).await
    }

    /// Like [`execute`](Self::execute), but `is_failure` decides which `Inner` errors count
    /// against the breaker. Ignored errors count as neither failure nor success.
    pub async fn execute_classified<T, E, Fut, Op, C>(
        &self,
        operation: Op,
        is_failure: C,
    ) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: Send,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
        C: Fn(&E) -> bool + Send,
    {
        let mut permit = self.admit()?;
        let result = operation().await;

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(ResilienceError::Inner(e)) if is_failure(e) => Outcome::Failure,
            Err(ResilienceError::Inner(_)) | Err(ResilienceError::CircuitOpen { .. }) => {
                Outcome::Ignored
            }
            Err(ResilienceError::Timeout { .. }) | Err(ResilienceError::RetryExhausted { .. }) => {
                Outcome::Failure
            }
        };
        self.record(&mut permit, outcome);
        result
    }

    fn admit<E>(&self) -> Result<Permit<'_>, ResilienceError<E>> {
        let mut half_opened = false;
        let admitted = self.try_admit(&mut half_opened);
        if half_opened {
            self.emit(CircuitBreakerEvent::HalfOpen);
        }
        if admitted.is_err() {
            self.emit(CircuitBreakerEvent::Rejected);
        }
        admitted
    }

    fn try_admit<E>(&self, half_opened: &mut bool) -> Result<Permit<'_>, ResilienceError<E>> {
        let now = self.clock.now_millis();
        let mut state = self.lock();

        if state.phase == CircuitState::Open {
            let since_failure =
                now.saturating_sub(state.last_failure_at.unwrap_or(state.last_transition_at));
            if since_failure >= span_millis(self.config.recovery_timeout) {
                state.transition(CircuitState::HalfOpen, now);
                *half_opened = true;
                tracing::info!(
                    open_ms = since_failure,
                    "circuit breaker half-open; allowing trial calls"
                );
            } else {
                state.total_rejections += 1;
                tracing::debug!(open_ms = since_failure, "circuit breaker open; call rejected");
                return Err(ResilienceError::CircuitOpen {
                    failure_count: state.failure_count,
                    open_duration: Duration::from_millis(since_failure),
                });
            }
        }

        let mut trial_generation = None;
        if state.phase == CircuitState::HalfOpen {
            if let Some(limit) = self.config.half_open_max_calls {
                if state.half_open_in_flight >= limit {
                    state.total_rejections += 1;
                    tracing::debug!(in_flight = state.half_open_in_flight, limit, "half-open trial rejected");
                    return Err(ResilienceError::CircuitOpen {
                        failure_count: state.failure_count,
                        open_duration: Duration::from_millis(
                            now.saturating_sub(state.last_transition_at),
                        ),
                    });
                }
            }
            state.half_open_in_flight += 1;
            trial_generation = Some(state.generation);
        }

        state.total_calls += 1;
        Ok(Permit { shared: &self.state, trial_generation })
    }

    fn record(&self, permit: &mut Permit<'_>, outcome: Outcome) {
        let now = self.clock.now_millis();
        let event = {
            let mut state = self.lock();
            permit.release(&mut state);
            self.apply(&mut state, outcome, now)
        };
        if let Some(event) = event {
            self.emit(event);
        }
    }

    fn apply(&self, state: &mut BreakerState, outcome: Outcome, now: u64) -> Option<CircuitBreakerEvent> {
        match outcome {
            Outcome::Ignored => None,
            Outcome::Success => match state.phase {
                CircuitState::Closed => {
                    state.failure_count = 0;
                    state.observe(false, self.config.sliding_window_size);
                    None
                }
                CircuitState::HalfOpen => {
                    state.success_count += 1;
                    if state.success_count < self.config.success_threshold {
                        return None;
                    }
                    state.transition(CircuitState::Closed, now);
                    tracing::info!("circuit breaker closed");
                    Some(CircuitBreakerEvent::Closed)
                }
                CircuitState::Open => None,
            },
            Outcome::Failure => {
                state.total_failures += 1;
                match state.phase {
                    CircuitState::Closed => {
                        state.failure_count += 1;
                        state.last_failure_at = Some(now);
                        state.observe(true, self.config.sliding_window_size);
                        let failure_rate = state.failure_rate();
                        let rate_tripped = self.config.failure_rate_threshold.is_some_and(|limit| {
                            state.window.len() >= self.config.minimum_requests && failure_rate >= limit
                        });
                        if state.failure_count < self.config.failure_threshold && !rate_tripped {
                            return None;
                        }
                        state.transition(CircuitState::Open, now);
                        tracing::error!(
                            failures = state.failure_count,
                            threshold = self.config.failure_threshold,
                            failure_rate,
                            "circuit breaker opened"
                        );
                        Some(CircuitBreakerEvent::Opened { failure_count: state.failure_count, failure_rate })
                    }
                    CircuitState::HalfOpen => {
                        state.failure_count += 1;
                        state.last_failure_at = Some(now);
                        state.transition(CircuitState::Open, now);
                        tracing::warn!(
                            failures = state.failure_count,
                            "circuit breaker trial call failed; reopened"
                        );
                        Some(CircuitBreakerEvent::Opened {
                            failure_count: state.failure_count,
                            failure_rate: state.failure_rate(),
                        })
                    }
                    // A call admitted before the circuit opened; the open window stays anchored
                    // at the failure that tripped it.
                    CircuitState::Open => None,
                }
            }
        }
    }

    fn emit(&self, event: CircuitBreakerEvent) {
        self.sink.emit(&PolicyEvent::CircuitBreaker(event));
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Tower layer putting a shared [`CircuitBreakerPolicy`] in front of a service.
#[derive(Debug, Clone)]
pub struct CircuitBreakerLayer {
    breaker: CircuitBreakerPolicy,
}

impl CircuitBreakerLayer {
    pub fn new(breaker: CircuitBreakerPolicy) -> Self {
        Self { breaker }
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, service: S) -> Self::Service {
        CircuitBreakerService { inner: service, breaker: self.breaker.clone() }
    }
}

/// Service produced by [`CircuitBreakerLayer`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerService<S> {
    inner: S,
    breaker: CircuitBreakerPolicy,
}

impl<S, Request> Service<Request> for CircuitBreakerService<S>
where
    Request: Send + 'static,
    S: Service<Request> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let breaker = self.breaker.clone();
        let clone = self.inner.clone();
        let mut ready = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            breaker
                .execute(move || async move { ready.call(req).await.map_err(ResilienceError::Inner) })
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::telemetry::{MemorySink, MetricsCollector};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn breaker_with_clock(
        failures: usize,
        successes: usize,
        timeout_ms: u64,
    ) -> (CircuitBreakerPolicy, ManualClock) {
        let clock = ManualClock::new();
        let config =
            CircuitBreakerConfig::new(failures, successes, Duration::from_millis(timeout_ms))
                .expect("valid config");
        (CircuitBreakerPolicy::with_config(config).with_clock(clock.clone()), clock)
    }

    async fn fail(breaker: &CircuitBreakerPolicy) -> Result<(), ResilienceError<TestError>> {
        breaker.execute(|| async { Err(ResilienceError::Inner(TestError("fail".into()))) }).await
    }

    async fn succeed(breaker: &CircuitBreakerPolicy) -> Result<(), ResilienceError<TestError>> {
        breaker.execute(|| async { Ok(()) }).await
    }

    #[test]
    fn config_rejects_invalid_bounds() {
        assert_eq!(
            CircuitBreakerConfig::new(0, 1, Duration::from_secs(1)).unwrap_err(),
            ConfigError::InvalidFailureThreshold(0)
        );
        assert_eq!(
            CircuitBreakerConfig::new(1, 0, Duration::from_secs(1)).unwrap_err(),
            ConfigError::InvalidSuccessThreshold(0)
        );
        assert_eq!(
            CircuitBreakerConfig::new(1, 1, Duration::ZERO).unwrap_err(),
            ConfigError::ZeroRecoveryTimeout
        );
        assert_eq!(
            CircuitBreakerConfig::default().with_half_open_limit(0).unwrap_err(),
            ConfigError::InvalidHalfOpenLimit(0)
        );
    }

    #[tokio::test]
    async fn third_failure_opens_and_fourth_call_is_rejected() {
        let (breaker, _clock) = breaker_with_clock(3, 1, 1_000);
        for _ in 0..2 {
            assert!(fail(&breaker).await.unwrap_err().is_inner());
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        assert!(fail(&breaker).await.unwrap_err().is_inner());
        assert_eq!(breaker.state(), CircuitState::Open);

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let result = breaker
            .execute(|| async move {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ResilienceError<TestError>>(())
            })
            .await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(counter.load(Ordering::SeqCst), 0, "open circuit must not invoke the call");
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let (breaker, clock) = breaker_with_clock(3, 2, 1_000);
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        clock.advance(Duration::from_millis(1_000));

        assert!(fail(&breaker).await.unwrap_err().is_inner(), "trial call runs");
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(succeed(&breaker).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn success_threshold_closes_from_half_open() {
        let (breaker, clock) = breaker_with_clock(3, 2, 500);
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        clock.advance(Duration::from_millis(600));

        succeed(&breaker).await.expect("first trial");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.expect("second trial");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().failure_count, 0);
    }

    #[tokio::test]
    async fn open_window_is_measured_from_last_failure() {
        let (breaker, clock) = breaker_with_clock(1, 1, 1_000);
        let _ = fail(&breaker).await;
        clock.advance(Duration::from_millis(999));
        match succeed(&breaker).await.unwrap_err() {
            ResilienceError::CircuitOpen { failure_count, open_duration } => {
                assert_eq!(failure_count, 1);
                assert_eq!(open_duration, Duration::from_millis(999));
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
        clock.advance(Duration::from_millis(1));
        assert!(succeed(&breaker).await.is_ok());
    }

    #[tokio::test]
    async fn late_failures_while_open_do_not_extend_the_window() {
        let (breaker, clock) = breaker_with_clock(1, 1, 1_000);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let slow_breaker = breaker.clone();
        let slow = tokio::spawn(async move {
            slow_breaker
                .execute(|| async move {
                    let _ = release_rx.await;
                    Err::<(), _>(ResilienceError::Inner(TestError("late".into())))
                })
                .await
        });
        while breaker.stats().total_calls == 0 {
            tokio::task::yield_now().await;
        }

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        clock.advance(Duration::from_millis(600));
        release_tx.send(()).unwrap();
        assert!(slow.await.unwrap().unwrap_err().is_inner());

        let stats = breaker.stats();
        assert_eq!(stats.total_failures, 2);
        assert_eq!(stats.last_failure_at_millis, Some(0));
        clock.advance(Duration::from_millis(400));
        assert!(succeed(&breaker).await.is_ok(), "window counts from the tripping failure");
    }

    #[tokio::test]
    async fn successes_in_closed_state_reset_failure_count() {
        let (breaker, _clock) = breaker_with_clock(3, 1, 1_000);
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        succeed(&breaker).await.unwrap();
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().failure_count, 2);
    }

    #[tokio::test]
    async fn classified_errors_can_be_ignored() {
        let (breaker, _clock) = breaker_with_clock(1, 1, 1_000);
        for _ in 0..5 {
            let result = breaker
                .execute_classified(
                    || async { Err::<(), _>(ResilienceError::Inner(TestError("404".into()))) },
                    |e: &TestError| e.0 != "404",
                )
                .await;
            assert!(result.unwrap_err().is_inner());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().total_failures, 0);

        let _ = breaker
            .execute_classified(
                || async { Err::<(), _>(ResilienceError::Inner(TestError("500".into()))) },
                |e: &TestError| e.0 != "404",
            )
            .await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_limit_rejects_extra_trials() {
        let clock = ManualClock::new();
        let config = CircuitBreakerConfig::new(1, 1, Duration::from_millis(100))
            .unwrap()
            .with_half_open_limit(1)
            .unwrap();
        let breaker = CircuitBreakerPolicy::with_config(config).with_clock(clock.clone());
        let _ = fail(&breaker).await;
        clock.advance(Duration::from_millis(150));

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_breaker = breaker.clone();
        let trial = tokio::spawn(async move {
            trial_breaker
                .execute(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, ResilienceError<TestError>>(1)
                })
                .await
        });
        while breaker.stats().half_open_in_flight == 0 {
            tokio::task::yield_now().await;
        }

        assert!(succeed(&breaker).await.unwrap_err().is_circuit_open());
        release_tx.send(()).unwrap();
        assert_eq!(trial.await.unwrap().unwrap(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().total_rejections, 1);
    }

    #[tokio::test]
    async fn half_open_slot_released_on_panic() {
        let clock = ManualClock::new();
        let config = CircuitBreakerConfig::new(1, 1, Duration::from_millis(10))
            .unwrap()
            .with_half_open_limit(1)
            .unwrap();
        let breaker = CircuitBreakerPolicy::with_config(config).with_clock(clock.clone());
        let _ = fail(&breaker).await;
        clock.advance(Duration::from_millis(20));

        let result: Result<Result<(), ResilienceError<TestError>>, _> =
            std::panic::AssertUnwindSafe(async {
                breaker.execute(|| async { panic!("boom") }).await
            })
            .catch_unwind()
            .await;
        assert!(result.is_err());
        assert_eq!(breaker.stats().half_open_in_flight, 0);
        assert!(succeed(&breaker).await.is_ok());
    }

    #[tokio::test]
    async fn disabled_breaker_never_opens() {
        let breaker = CircuitBreakerPolicy::with_config(CircuitBreakerConfig::disabled());
        for _ in 0..1000 {
            assert!(fail(&breaker).await.unwrap_err().is_inner());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().total_calls, 1000);
    }

    #[tokio::test]
    async fn reset_returns_to_closed() {
        let (breaker, _clock) = breaker_with_clock(1, 1, 60_000);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.reset();
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.total_failures, 0);
        assert!(succeed(&breaker).await.is_ok());
    }

    #[tokio::test]
    async fn stats_track_totals() {
        let (breaker, clock) = breaker_with_clock(2, 1, 1_000);
        clock.set_millis(42);
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        let _ = succeed(&breaker).await;
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.total_calls, 2);
        assert_eq!(stats.total_failures, 2);
        assert_eq!(stats.total_rejections, 1);
        assert_eq!(stats.last_failure_at_millis, Some(42));
        assert_eq!(stats.last_transition_at_millis, 42);
    }

    #[tokio::test]
    async fn concurrent_failures_are_all_counted() {
        let breaker = CircuitBreakerPolicy::new(1_000, Duration::from_secs(60)).unwrap();
        let tasks = 200;
        let barrier = Arc::new(tokio::sync::Barrier::new(tasks));
        let mut handles = vec![];
        for _ in 0..tasks {
            let b = breaker.clone();
            let g = barrier.clone();
            handles.push(tokio::spawn(async move {
                g.wait().await;
                let _ = fail(&b).await;
            }));
        }
        futures::future::join_all(handles).await;
        assert_eq!(breaker.stats().failure_count, tasks);
    }

    fn rate_breaker(window: usize, rate: f64, minimum: usize) -> (CircuitBreakerPolicy, ManualClock) {
        let clock = ManualClock::new();
        let config = CircuitBreakerConfig::new(100, 1, Duration::from_secs(30))
            .unwrap()
            .with_sliding_window(window)
            .unwrap()
            .with_failure_rate(rate, minimum)
            .unwrap();
        (CircuitBreakerPolicy::with_config(config).with_clock(clock.clone()), clock)
    }

    #[test]
    fn failure_rate_is_off_by_default() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_rate_threshold(), None);
        assert_eq!(config.minimum_requests(), 10);
        assert_eq!(config.sliding_window_size(), 100);
    }

    #[test]
    fn failure_rate_bounds_are_checked() {
        let base = CircuitBreakerConfig::default();
        assert_eq!(base.clone().with_failure_rate(0.0, 5).unwrap_err(), ConfigError::InvalidFailureRate(0.0));
        assert_eq!(base.clone().with_failure_rate(1.5, 5).unwrap_err(), ConfigError::InvalidFailureRate(1.5));
        assert!(base.clone().with_failure_rate(f64::NAN, 5).is_err());
        assert_eq!(
            base.clone().with_failure_rate(0.5, 0).unwrap_err(),
            ConfigError::InvalidMinimumRequests(0)
        );
        assert_eq!(base.clone().with_sliding_window(0).unwrap_err(), ConfigError::InvalidSlidingWindow(0));
        assert_eq!(
            base.clone().with_sliding_window(4).unwrap().with_failure_rate(0.5, 5).unwrap_err(),
            ConfigError::MinimumRequestsExceedWindow { minimum: 5, window: 4 }
        );
        assert_eq!(
            base.with_failure_rate(0.5, 8).unwrap().with_sliding_window(6).unwrap_err(),
            ConfigError::MinimumRequestsExceedWindow { minimum: 8, window: 6 }
        );
    }

    #[tokio::test]
    async fn consecutive_failures_trip_without_rate_config() {
        let (breaker, _clock) = breaker_with_clock(3, 1, 1_000);
        for _ in 0..10 {
            let _ = succeed(&breaker).await;
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed, "alternating failures never reach 3 in a row");
        let stats = breaker.stats();
        assert_eq!(stats.window_calls, 20);
        assert!((stats.failure_rate - 0.5).abs() < f64::EPSILON);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn failure_rate_trips_once_minimum_requests_seen() {
        let (breaker, _clock) = rate_breaker(10, 0.5, 4);
        let _ = fail(&breaker).await;
        let _ = succeed(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed, "three calls are below the minimum");

        let _ = succeed(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed, "only failures can trip");
        let _ = fail(&breaker).await;
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert!((stats.failure_rate - 0.6).abs() < 1e-9);
        assert!(succeed(&breaker).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn failure_rate_window_forgets_old_outcomes() {
        let (breaker, _clock) = rate_breaker(4, 0.75, 4);
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        for _ in 0..4 {
            let _ = succeed(&breaker).await;
        }
        let stats = breaker.stats();
        assert_eq!(stats.window_calls, 4);
        assert_eq!(stats.failure_rate, 0.0);

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed, "2 of the last 4 failed");
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open, "3 of the last 4 failed");
    }

    #[tokio::test]
    async fn closing_clears_the_failure_window() {
        let (breaker, clock) = rate_breaker(10, 0.5, 2);
        let _ = succeed(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(31));
        succeed(&breaker).await.expect("trial call");
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.window_calls, 0);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed, "one call is below the minimum again");
    }

    #[tokio::test]
    async fn sub_millisecond_recovery_timeout_still_waits() {
        let clock = ManualClock::new();
        let config = CircuitBreakerConfig::new(1, 1, Duration::from_micros(500)).unwrap();
        let breaker = CircuitBreakerPolicy::with_config(config).with_clock(clock.clone());
        let _ = fail(&breaker).await;
        assert!(succeed(&breaker).await.unwrap_err().is_circuit_open());
        clock.advance(Duration::from_millis(1));
        assert!(succeed(&breaker).await.is_ok());
    }

    #[tokio::test]
    async fn sink_sees_every_state_change() {
        let sink = MemorySink::new();
        let (breaker, clock) = breaker_with_clock(2, 1, 1_000);
        let breaker = breaker.with_sink(sink.clone());
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        let _ = succeed(&breaker).await;
        clock.advance(Duration::from_secs(2));
        let _ = succeed(&breaker).await;
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        breaker.reset();

        let events: Vec<String> = sink.events().iter().map(ToString::to_string).collect();
        assert_eq!(
            events,
            vec![
                "CircuitBreaker::Opened(failures=2, rate=1.00)",
                "CircuitBreaker::Rejected",
                "CircuitBreaker::HalfOpen",
                "CircuitBreaker::Closed",
                "CircuitBreaker::Opened(failures=2, rate=1.00)",
                "CircuitBreaker::Closed",
            ]
        );
    }

    #[tokio::test]
    async fn metrics_collector_counts_breaker_events() {
        let metrics = MetricsCollector::new();
        let (breaker, _clock) = breaker_with_clock(1, 1, 60_000);
        let breaker = breaker.with_sink(metrics.clone());
        let _ = fail(&breaker).await;
        let _ = succeed(&breaker).await;
        let _ = succeed(&breaker).await;
        assert_eq!(metrics.counter("circuit_breaker.opened"), 1);
        assert_eq!(metrics.counter("circuit_breaker.rejected"), 2);
        assert_eq!(metrics.counter("circuit_breaker.closed"), 0);
    }
}
