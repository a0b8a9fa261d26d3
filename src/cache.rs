//! In-process TTL cache with substring invalidation.
//!
//! Entries live until `now > expires_at`; expired entries are evicted lazily on lookup or in bulk
//! via [`TtlCache::cleanup_expired`]. Handles are cheap to clone and share one store.
//!
//! Concurrency: each operation takes a short-lived mutex. There is no single-flight
//! de-duplication, so concurrent misses for the same key may all run their loader; the last
//! write wins.
//!
//! ```rust
//! use std::time::Duration;
//! use issuepulse::TtlCache;
//!
//! let cache = TtlCache::new(Duration::from_secs(300));
//! cache.set("issues:open", vec![1, 2, 3]);
//! assert_eq!(cache.get("issues:open"), Some(vec![1, 2, 3]));
//! assert_eq!(cache.invalidate(Some("issues:")), 1);
//! ```

use crate::clock::{span_millis, Clock, MonotonicClock};
use crate::telemetry::{CacheEvent, NullSink, PolicyEvent, TelemetrySink};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A cached value with its lifetime, in clock milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at_millis: u64,
    pub expires_at_millis: u64,
}

impl<V> CacheEntry<V> {
    fn new(value: V, now: u64, ttl: Duration) -> Self {
        Self { value, created_at_millis: now, expires_at_millis: now.saturating_add(span_millis(ttl)) }
    }

    pub fn is_expired(&self, now_millis: u64) -> bool {
        now_millis > self.expires_at_millis
    }
}

/// Size and hit/miss counters. `hit_rate` is a fraction in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Debug)]
struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    hits: u64,
    misses: u64,
}

/// Key/value store with per-entry expiry.
#[derive(Debug)]
pub struct TtlCache<V> {
    inner: Arc<Mutex<CacheInner<V>>>,
    default_ttl: Duration,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn TelemetrySink>,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            default_ttl: self.default_ttl,
            clock: self.clock.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<V: Clone> TtlCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self::with_clock(default_ttl, MonotonicClock::default())
    }

    /// Cache driven by a custom clock (tests use `ManualClock`).
    pub fn with_clock<C: Clock + 'static>(default_ttl: Duration, clock: C) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner { entries: HashMap::new(), hits: 0, misses: 0 })),
            default_ttl,
            clock: Arc::new(clock),
            sink: Arc::new(NullSink),
        }
    }

    /// Report hits, misses and expirations to `sink`. Only this handle and later clones of it
    /// report.
    pub fn with_sink<S: TelemetrySink + 'static>(mut self, sink: S) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Live value for `key`. Absent or expired keys count as a miss; expired ones are evicted.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now_millis();
        let (value, expired) = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            match inner.entries.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    inner.hits += 1;
                    (Some(entry.value.clone()), false)
                }
                Some(_) => {
                    inner.entries.remove(key);
                    inner.misses += 1;
                    (None, true)
                }
                None => {
                    inner.misses += 1;
                    (None, false)
                }
            }
        };
        if expired {
            tracing::debug!(key, "cache entry expired");
            self.sink.emit(&PolicyEvent::Cache(CacheEvent::Expired));
        }
        if value.is_some() {
            tracing::debug!(key, "cache hit");
            self.sink.emit(&PolicyEvent::Cache(CacheEvent::Hit));
        } else {
            tracing::debug!(key, "cache miss");
            self.sink.emit(&PolicyEvent::Cache(CacheEvent::Miss));
        }
        value
    }

    /// Store with the default TTL.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let now = self.clock.now_millis();
        self.lock().entries.insert(key.into(), CacheEntry::new(value, now, ttl));
    }

    /// Drop one key; returns whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    /// Remove every key containing `pattern`, or everything when `pattern` is `None`.
    /// Returns the number of entries removed.
    pub fn invalidate(&self, pattern: Option<&str>) -> usize {
        let Some(pattern) = pattern else {
            return self.clear();
        };
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key.contains(pattern));
        let removed = before - inner.entries.len();
        tracing::info!(pattern, removed, "cache invalidated");
        removed
    }

    /// Remove every entry and reset hit/miss counters. Returns the number of entries removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let removed = inner.entries.len();
        inner.entries.clear();
        inner.hits = 0;
        inner.misses = 0;
        tracing::info!(removed, "cache cleared");
        removed
    }

    /// Purge expired entries without touching hit/miss counters.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - inner.entries.len();
        if removed > 0 {
            tracing::info!(removed, "expired cache entries cleaned up");
        }
        removed
    }

    /// Stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let lookups = inner.hits + inner.misses;
        let hit_rate = if lookups == 0 { 0.0 } else { inner.hits as f64 / lookups as f64 };
        CacheStats { size: inner.entries.len(), hits: inner.hits, misses: inner.misses, hit_rate }
    }

    /// Cache-aside lookup: return the cached value or run `loader` and store its output.
    pub async fn get_or_load<F, Fut>(&self, key: &str, ttl: Option<Duration>, loader: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        if let Some(hit) = self.get(key) {
            return hit;
        }
        let value = loader().await;
        self.set_with_ttl(key, value.clone(), ttl.unwrap_or(self.default_ttl));
        value
    }

    /// Fallible cache-aside lookup. Errors are returned as-is and never cached.
    pub async fn get_or_try_load<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        loader: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        let value = loader().await?;
        self.set_with_ttl(key, value.clone(), ttl.unwrap_or(self.default_ttl));
        Ok(value)
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deterministic cache key: operation name, positional args, then named params sorted by name.
///
/// `:`, `&`, `=` and `\` inside any part are backslash-escaped, so distinct inputs never
/// build the same key.
///
/// ```rust
/// use issuepulse::CacheKey;
///
/// assert_eq!(CacheKey::new("issue").arg(123).build(), "issue:123");
/// assert_eq!(
///     CacheKey::new("issues").param("state", "open").param("labels", "bug").build(),
///     "issues:labels=bug&state=open"
/// );
/// ```
#[derive(Debug, Clone, Default)]
pub struct CacheKey {
    operation: String,
    args: Vec<String>,
    params: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new(operation: impl Into<String>) -> Self {
        Self { operation: operation.into(), ..Self::default() }
    }

    pub fn arg(mut self, value: impl Display) -> Self {
        self.args.push(value.to_string());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Display) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    /// Add a param only when a value is present.
    pub fn param_opt<T: Display>(self, name: impl Into<String>, value: Option<T>) -> Self {
        match value {
            Some(value) => self.param(name, value),
            None => self,
        }
    }

    pub fn build(&self) -> String {
        let mut key = String::with_capacity(self.operation.len() + 16);
        push_escaped(&mut key, &self.operation);
        for arg in &self.args {
            key.push(':');
            push_escaped(&mut key, arg);
        }
        for (i, (name, value)) in self.params.iter().enumerate() {
            key.push(if i == 0 { ':' } else { '&' });
            push_escaped(&mut key, name);
            key.push('=');
            push_escaped(&mut key, value);
        }
        key
    }
}

fn push_escaped(key: &mut String, part: &str) {
    for c in part.chars() {
        if matches!(c, ':' | '&' | '=' | '\\') {
            key.push('\\');
        }
        key.push(c);
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.build())
    }
}
