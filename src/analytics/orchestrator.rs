use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use super::config::{AnalyticsConfiguration, CacheKeyMode};
use super::strategy::{Strategy, StrategyError};
use super::summary::Summary;
use super::types::{in_window, AnalysisKind, AnalysisResult, AnalyticsContext, Record};
use crate::cache::{CacheKey, CacheStats, TtlCache};
use crate::clock::Clock;
use crate::telemetry::TelemetrySink;

type StrategyMap<R> = BTreeMap<AnalysisKind, Arc<dyn Strategy<R>>>;

/// Strategy registry plus a result cache, both living as long as the orchestrator.
///
/// ```rust
/// use issuepulse::analytics::{
///     AnalysisKind, AnalysisResult, AnalyticsContext, AnalyticsOrchestrator, Record, Strategy,
///     StrategyError,
/// };
/// use chrono::{DateTime, Utc};
///
/// struct Issue(DateTime<Utc>);
/// impl Record for Issue {
///     fn created_at(&self) -> Option<DateTime<Utc>> {
///         Some(self.0)
///     }
/// }
///
/// struct Count;
/// #[async_trait::async_trait]
/// impl Strategy<Issue> for Count {
///     async fn analyze(
///         &self,
///         records: &[&Issue],
///         _ctx: &AnalyticsContext,
///     ) -> Result<AnalysisResult, StrategyError> {
///         Ok(AnalysisResult::new(AnalysisKind::Productivity).with_metric("count", records.len() as f64))
///     }
/// }
///
/// # tokio_test_runtime(async {
/// let orchestrator = AnalyticsOrchestrator::new(Default::default());
/// orchestrator.register(AnalysisKind::Productivity, Count);
/// let issues: Vec<Issue> = (0..6).map(|_| Issue(Utc::now())).collect();
/// let results = orchestrator.analyze(&issues, "octo/repo", None).await;
/// assert_eq!(results[&AnalysisKind::Productivity].metrics["count"], 6.0);
/// # });
/// # fn tokio_test_runtime<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
pub struct AnalyticsOrchestrator<R: Record> {
    strategies: RwLock<StrategyMap<R>>,
    config: AnalyticsConfiguration,
    cache: TtlCache<Arc<AnalysisResult>>,
}

impl<R: Record + 'static> AnalyticsOrchestrator<R> {
    pub fn new(config: AnalyticsConfiguration) -> Self {
        let cache = TtlCache::new(config.cache_ttl());
        Self { strategies: RwLock::default(), config, cache }
    }

    /// Result cache driven by `clock` instead of the monotonic clock.
    pub fn with_clock<C: Clock + 'static>(config: AnalyticsConfiguration, clock: C) -> Self {
        let cache = TtlCache::with_clock(config.cache_ttl(), clock);
        Self { strategies: RwLock::default(), config, cache }
    }

    /// Report result-cache hits and misses to `sink`.
    pub fn with_sink<S: TelemetrySink + 'static>(mut self, sink: S) -> Self {
        self.cache = self.cache.with_sink(sink);
        self
    }

    pub fn configuration(&self) -> &AnalyticsConfiguration {
        &self.config
    }

    /// Register `strategy` for `kind`. Returns `true` when an earlier registration was replaced.
    pub fn register<S>(&self, kind: AnalysisKind, strategy: S) -> bool
    where
        S: Strategy<R> + 'static,
    {
        self.register_shared(kind, Arc::new(strategy))
    }

    pub fn register_shared(&self, kind: AnalysisKind, strategy: Arc<dyn Strategy<R>>) -> bool {
        let replaced = self.write_registry().insert(kind, strategy).is_some();
        info!(kind = %kind, replaced, "registered analysis strategy");
        replaced
    }

    pub fn unregister(&self, kind: AnalysisKind) -> bool {
        let removed = self.write_registry().remove(&kind).is_some();
        if removed {
            info!(kind = %kind, "unregistered analysis strategy");
        }
        removed
    }

    pub fn registered_kinds(&self) -> Vec<AnalysisKind> {
        self.strategies.read().unwrap_or_else(PoisonError::into_inner).keys().copied().collect()
    }

    /// Run every enabled, registered strategy over `records` and collect the successes.
    ///
    /// `config` overrides the orchestrator's own configuration for this call. The map is empty
    /// when there are fewer records than the configured minimum or none inside the time window.
    /// Failed strategies are logged and omitted.
    pub async fn analyze(
        &self,
        records: &[R],
        subject_id: &str,
        config: Option<&AnalyticsConfiguration>,
    ) -> BTreeMap<AnalysisKind, Arc<AnalysisResult>> {
        let config = config.unwrap_or(&self.config);
        let mut results = BTreeMap::new();

        if records.len() < config.minimum_records_for_analysis() {
            warn!(
                subject_id,
                records = records.len(),
                minimum = config.minimum_records_for_analysis(),
                "insufficient records for analysis"
            );
            return results;
        }

        let context = AnalyticsContext::capture(records, subject_id, config, Utc::now());
        let window_start = context.window_start();
        let windowed: Vec<&R> = records.iter().filter(|r| in_window(*r, window_start)).collect();
        if windowed.is_empty() {
            warn!(subject_id, window_days = config.time_window_days(), "no records inside the analysis window");
            return results;
        }

        let fingerprint = match config.cache_key_mode() {
            CacheKeyMode::RecordCount => None,
            CacheKeyMode::ContentHash => Some(content_hash(&windowed)),
        };

        // Clone the handles out so the lock is not held across the fan-out.
        let registry = self.strategies.read().unwrap_or_else(PoisonError::into_inner).clone();
        let mut pending = Vec::new();
        for &kind in config.enabled_analyses() {
            let Some(strategy) = registry.get(&kind).cloned() else {
                warn!(kind = %kind, "no strategy registered for analysis kind");
                continue;
            };
            let key = cache_key(kind, &context, fingerprint);
            if config.cache_results() {
                if let Some(hit) = self.cache.get(&key) {
                    debug!(kind = %kind, "reusing cached analysis result");
                    results.insert(kind, hit);
                    continue;
                }
            }
            pending.push((kind, key, strategy));
        }

        let windowed = windowed.as_slice();
        let context = &context;
        let runs = pending.into_iter().map(|(kind, key, strategy)| async move {
            let outcome = run_strategy(strategy.as_ref(), windowed, context, config.strategy_timeout()).await;
            (kind, key, outcome)
        });

        for (kind, key, outcome) in join_all(runs).await {
            match outcome {
                Ok(result) => {
                    let result = Arc::new(result);
                    if config.cache_results() {
                        self.cache.set_with_ttl(key, result.clone(), config.cache_ttl());
                    }
                    results.insert(kind, result);
                }
                Err(err) => error!(kind = %kind, subject_id, error = %err, "analysis strategy failed"),
            }
        }

        info!(subject_id, succeeded = results.len(), "analysis run completed");
        results
    }

    pub fn summarize(&self, results: &BTreeMap<AnalysisKind, Arc<AnalysisResult>>) -> Summary {
        Summary::from_results(results)
    }

    /// Drop every cached result; returns how many were removed.
    pub fn clear_cache(&self) -> usize {
        let removed = self.cache.clear();
        info!(removed, "analytics cache cleared");
        removed
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, StrategyMap<R>> {
        self.strategies.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<R: Record + 'static> Default for AnalyticsOrchestrator<R> {
    fn default() -> Self {
        Self::new(AnalyticsConfiguration::default())
    }
}

impl<R: Record> std::fmt::Debug for AnalyticsOrchestrator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<AnalysisKind> =
            self.strategies.read().unwrap_or_else(PoisonError::into_inner).keys().copied().collect();
        f.debug_struct("AnalyticsOrchestrator")
            .field("strategies", &kinds)
            .field("config", &self.config)
            .finish()
    }
}

fn cache_key(kind: AnalysisKind, context: &AnalyticsContext, fingerprint: Option<u64>) -> String {
    let key = CacheKey::new(kind.as_str())
        .arg(&context.subject_id)
        .arg(context.records_in_window)
        .arg(context.configuration.time_window_days());
    match fingerprint {
        Some(hash) => key.arg(format!("{hash:016x}")).build(),
        None => key.build(),
    }
}

/// Order-independent hash over the windowed records.
fn content_hash<R: Record>(records: &[&R]) -> u64 {
    let mut fingerprints: Vec<u64> = records.iter().map(|r| r.cache_fingerprint()).collect();
    fingerprints.sort_unstable();
    let mut hasher = DefaultHasher::new();
    fingerprints.hash(&mut hasher);
    hasher.finish()
}

async fn run_strategy<R: Record>(
    strategy: &dyn Strategy<R>,
    records: &[&R],
    context: &AnalyticsContext,
    timeout: Option<Duration>,
) -> Result<AnalysisResult, StrategyError> {
    let guarded = AssertUnwindSafe(strategy.analyze(records, context)).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(StrategyError::TimedOut(limit)),
        },
        None => guarded.await,
    };
    outcome.unwrap_or_else(|payload| Err(StrategyError::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
