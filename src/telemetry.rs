//! Policy events and the sinks that consume them.
//!
//! Retry policies, circuit breakers and TTL caches emit a [`PolicyEvent`] at each interesting
//! point. Events go to an injected [`TelemetrySink`]; every policy defaults to [`NullSink`], so
//! nothing is recorded until a caller opts in.
//!
//! - **Retry**: `Attempt` before each backoff sleep, `Exhausted` when attempts run out.
//! - **Circuit breaker**: `Opened`, `HalfOpen`, `Closed`, `Rejected`.
//! - **Cache**: `Hit`, `Miss`, `Expired`.
//!
//! Sinks are synchronous and must not block: breakers and caches emit right after releasing their
//! lock, on the caller's task.
//!
//! ```rust
//! use std::time::Duration;
//! use issuepulse::telemetry::{CacheEvent, MetricsCollector, PolicyEvent};
//! use issuepulse::TtlCache;
//!
//! let metrics = MetricsCollector::new();
//! let cache = TtlCache::new(Duration::from_secs(60)).with_sink(metrics.clone());
//! cache.set("issues:open", 3u32);
//! let _ = cache.get("issues:open");
//! let _ = cache.get("issues:closed");
//! assert_eq!(metrics.counter("cache.hits"), 1);
//! assert_eq!(metrics.counter("cache.misses"), 1);
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Consumer of policy events.
pub trait TelemetrySink: Send + Sync + fmt::Debug {
    fn emit(&self, event: &PolicyEvent);
}

impl<S: TelemetrySink + ?Sized> TelemetrySink for Arc<S> {
    fn emit(&self, event: &PolicyEvent) {
        (**self).emit(event);
    }
}

/// Events emitted during policy execution.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    Retry(RetryEvent),
    CircuitBreaker(CircuitBreakerEvent),
    Cache(CacheEvent),
}

/// Events emitted by retry policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// Attempt `attempt` (1-indexed) failed; the next one runs after `delay`.
    Attempt { attempt: usize, delay: Duration },
    /// The final attempt failed.
    Exhausted { total_attempts: usize, total_duration: Duration },
}

/// Events emitted by circuit breakers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitBreakerEvent {
    /// Closed or half-open circuit tripped.
    Opened { failure_count: usize, failure_rate: f64 },
    /// Recovery timeout elapsed; trial calls are allowed.
    HalfOpen,
    Closed,
    /// A call was refused without running.
    Rejected,
}

/// Events emitted by TTL caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    Hit,
    Miss,
    /// A lookup found an expired entry and evicted it. Also counted as a miss.
    Expired,
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::Retry(e) => write!(f, "Retry::{}", e),
            PolicyEvent::CircuitBreaker(e) => write!(f, "CircuitBreaker::{}", e),
            PolicyEvent::Cache(e) => write!(f, "Cache::{}", e),
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { attempt, delay } => {
                write!(f, "Attempt(#{}, delay={:?})", attempt, delay)
            }
            RetryEvent::Exhausted { total_attempts, total_duration } => {
                write!(f, "Exhausted(attempts={}, duration={:?})", total_attempts, total_duration)
            }
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { failure_count, failure_rate } => {
                write!(f, "Opened(failures={}, rate={:.2})", failure_count, failure_rate)
            }
            CircuitBreakerEvent::HalfOpen => write!(f, "HalfOpen"),
            CircuitBreakerEvent::Closed => write!(f, "Closed"),
            CircuitBreakerEvent::Rejected => write!(f, "Rejected"),
        }
    }
}

impl fmt::Display for CacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheEvent::Hit => write!(f, "Hit"),
            CacheEvent::Miss => write!(f, "Miss"),
            CacheEvent::Expired => write!(f, "Expired"),
        }
    }
}

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&self, _event: &PolicyEvent) {}
}

/// Logs every event through `tracing` at INFO.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn emit(&self, event: &PolicyEvent) {
        tracing::info!(event = %event, "policy_event");
    }
}

/// Keeps the most recent events in memory, evicting the oldest past `capacity`.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<PolicyEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Bounded at 10,000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot, oldest first.
    pub fn events(&self) -> Vec<PolicyEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PolicyEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&self, event: &PolicyEvent) {
        let mut events = self.lock();
        if events.len() >= self.capacity {
            events.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event.clone());
    }
}

/// Forwards each event to two sinks.
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    first: A,
    second: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A: TelemetrySink, B: TelemetrySink> TelemetrySink for MulticastSink<A, B> {
    fn emit(&self, event: &PolicyEvent) {
        self.first.emit(event);
        self.second.emit(event);
    }
}

/// Execution-time summary for one named operation, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TimingStats {
    pub count: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub total_ms: f64,
}

/// Everything a [`MetricsCollector`] holds, sorted by name.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MetricsSnapshot {
    pub timings: BTreeMap<String, TimingStats>,
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
}

#[derive(Debug, Default)]
struct Metrics {
    timings: BTreeMap<String, Vec<f64>>,
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
}

/// Counters, gauges and execution timings, shared by cloning.
///
/// As a [`TelemetrySink`] it turns events into counters:
///
/// | event                         | counter                          |
/// |-------------------------------|----------------------------------|
/// | `Retry::Attempt`              | `retry.attempts`                 |
/// | `Retry::Exhausted`            | `retry.exhausted`                |
/// | `CircuitBreaker::Opened`      | `circuit_breaker.opened`         |
/// | `CircuitBreaker::HalfOpen`    | `circuit_breaker.half_open`      |
/// | `CircuitBreaker::Closed`      | `circuit_breaker.closed`         |
/// | `CircuitBreaker::Rejected`    | `circuit_breaker.rejected`       |
/// | `Cache::Hit`                  | `cache.hits`                     |
/// | `Cache::Miss`                 | `cache.misses`                   |
/// | `Cache::Expired`              | `cache.expired`                  |
///
/// `Retry::Attempt` also records its delay as the `retry.backoff` timing.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<Metrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_execution_time(&self, operation: &str, duration: Duration) {
        let millis = duration.as_secs_f64() * 1_000.0;
        self.lock().timings.entry(operation.to_string()).or_default().push(millis);
        tracing::debug!(operation, duration_ms = millis, "recorded execution time");
    }

    pub fn increment_counter(&self, counter: &str, by: u64) {
        let mut metrics = self.lock();
        let value = metrics.counters.entry(counter.to_string()).or_default();
        *value = value.saturating_add(by);
    }

    pub fn set_gauge(&self, gauge: &str, value: f64) {
        self.lock().gauges.insert(gauge.to_string(), value);
    }

    /// Counter value; 0 for counters never incremented.
    pub fn counter(&self, counter: &str) -> u64 {
        self.lock().counters.get(counter).copied().unwrap_or(0)
    }

    pub fn gauge(&self, gauge: &str) -> Option<f64> {
        self.lock().gauges.get(gauge).copied()
    }

    /// Timing summary, or `None` when nothing was recorded for `operation`.
    pub fn timing(&self, operation: &str) -> Option<TimingStats> {
        self.lock().timings.get(operation).and_then(|samples| summarize(samples))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let metrics = self.lock();
        MetricsSnapshot {
            timings: metrics
                .timings
                .iter()
                .filter_map(|(name, samples)| Some((name.clone(), summarize(samples)?)))
                .collect(),
            counters: metrics.counters.clone(),
            gauges: metrics.gauges.clone(),
        }
    }

    pub fn reset(&self) {
        *self.lock() = Metrics::default();
        tracing::info!("metrics reset");
    }

    /// Await `future` and record how long it took under `operation`, whatever it returned.
    pub async fn time<F: Future>(&self, operation: &str, future: F) -> F::Output {
        let started = tokio::time::Instant::now();
        let output = future.await;
        self.record_execution_time(operation, started.elapsed());
        output
    }

    fn lock(&self) -> MutexGuard<'_, Metrics> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn summarize(samples: &[f64]) -> Option<TimingStats> {
    if samples.is_empty() {
        return None;
    }
    let total_ms: f64 = samples.iter().sum();
    Some(TimingStats {
        count: samples.len(),
        min_ms: samples.iter().copied().fold(f64::INFINITY, f64::min),
        max_ms: samples.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        avg_ms: total_ms / samples.len() as f64,
        total_ms,
    })
}

impl TelemetrySink for MetricsCollector {
    fn emit(&self, event: &PolicyEvent) {
        let counter = match event {
            PolicyEvent::Retry(RetryEvent::Attempt { delay, .. }) => {
                self.record_execution_time("retry.backoff", *delay);
                "retry.attempts"
            }
            PolicyEvent::Retry(RetryEvent::Exhausted { .. }) => "retry.exhausted",
            PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Opened { .. }) => "circuit_breaker.opened",
            PolicyEvent::CircuitBreaker(CircuitBreakerEvent::HalfOpen) => "circuit_breaker.half_open",
            PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Closed) => "circuit_breaker.closed",
            PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Rejected) => "circuit_breaker.rejected",
            PolicyEvent::Cache(CacheEvent::Hit) => "cache.hits",
            PolicyEvent::Cache(CacheEvent::Miss) => "cache.misses",
            PolicyEvent::Cache(CacheEvent::Expired) => "cache.expired",
        };
        self.increment_counter(counter, 1);
    }
}
