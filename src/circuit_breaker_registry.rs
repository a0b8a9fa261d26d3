//! Registry of named circuit breakers.
//!
//! One breaker per protected dependency (`"github"`, `"ai"`, ...). The registry is constructed
//! explicitly and passed to whoever needs it; there is no process-global instance.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitBreakerStats};
use crate::clock::{Clock, MonotonicClock};
use crate::telemetry::{NullSink, TelemetrySink};
use tracing::warn;

/// Errors from breaker registries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("circuit breaker '{name}' not found")]
    NotFound { name: String },
}

/// Named breakers sharing one default config, clock and telemetry sink.
#[derive(Clone, Debug)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<RwLock<HashMap<String, CircuitBreakerPolicy>>>,
    default_config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn TelemetrySink>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    /// Registry whose lazily created breakers use `default_config`.
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::default(),
            default_config,
            clock: Arc::new(MonotonicClock::default()),
            sink: Arc::new(NullSink),
        }
    }

    /// Sink handed to breakers created by this registry from now on.
    pub fn with_sink<S: TelemetrySink + 'static>(mut self, sink: S) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Clock handed to breakers created by this registry from now on.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Fetch the breaker for `name`, creating it with the default config on first use.
    pub fn get_or_create(&self, name: &str) -> CircuitBreakerPolicy {
        self.get_or_create_with(name, || self.default_config.clone())
    }

    /// Fetch the breaker for `name`, creating it from `config` on first use. An existing breaker
    /// keeps its original config.
    pub fn get_or_create_with<F>(&self, name: &str, config: F) -> CircuitBreakerPolicy
    where
        F: FnOnce() -> CircuitBreakerConfig,
    {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        let mut map = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(name.to_string())
            .or_insert_with(|| {
                CircuitBreakerPolicy::with_shared_clock(config(), self.clock.clone())
                    .with_shared_sink(self.sink.clone())
            })
            .clone()
    }

    /// Register a breaker under `name`, replacing any existing one.
    ///
    /// When multiple services share a name the last registration wins; state is replaced, not
    /// merged.
    pub fn register(&self, name: impl Into<String>, breaker: CircuitBreakerPolicy) {
        let name = name.into();
        let mut map = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&name) {
            warn!(name = %name, "circuit breaker name replaced; last registration wins");
        }
        map.insert(name, breaker);
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreakerPolicy> {
        let map = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        map.get(name).cloned()
    }

    /// Reset one breaker, erroring if it was never registered.
    pub fn reset(&self, name: &str) -> Result<(), RegistryError> {
        let map = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        match map.get(name) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(RegistryError::NotFound { name: name.to_string() }),
        }
    }

    pub fn reset_all(&self) {
        let map = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        for breaker in map.values() {
            breaker.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Breaker stats sorted by name.
    pub fn snapshot(&self) -> Vec<(String, CircuitBreakerStats)> {
        let map = self.breakers.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<(String, CircuitBreakerStats)> =
            map.iter().map(|(k, v)| (k.clone(), v.stats())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
