//! JSON settings document and its conversion into validated runtime configs.
//!
//! The document uses plain numbers (milliseconds, minutes, days) and strings for enums. Every
//! section converts with `TryFrom`, so a bad value is reported when the file is loaded rather than
//! on first use. Missing fields take the same defaults as the corresponding builders.
//!
//! ```rust
//! use issuepulse::settings::Settings;
//!
//! let settings = Settings::from_json(r#"{
//!     "retry": { "max_attempts": 4, "backoff_strategy": "linear" },
//!     "circuit_breakers": { "github_api": { "failure_threshold": 5, "recovery_timeout_ms": 120000 } }
//! }"#).unwrap();
//! let resolved = settings.resolve().unwrap();
//! assert_eq!(resolved.retry.max_attempts(), 4);
//! assert!(resolved.breakers.get("github_api").is_some());
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analytics::{AnalysisKind, AnalyticsConfiguration, CacheKeyMode};
use crate::backoff::{Backoff, BackoffStrategy};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy};
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::error::ConfigError;
use crate::repository::TtlPolicy;
use crate::retry::RetryConfig;

/// Whole settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub retry: RetrySettings,
    /// Named breakers, registered under their key.
    pub circuit_breakers: BTreeMap<String, CircuitBreakerSettings>,
    pub analytics: AnalyticsSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_strategy: String,
    pub backoff_factor: f64,
    pub jitter: bool,
    pub jitter_factor: f64,
    pub timeout_per_attempt_ms: Option<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_strategy: BackoffStrategy::Exponential.as_str().to_string(),
            backoff_factor: Backoff::DEFAULT_FACTOR,
            jitter: true,
            jitter_factor: 0.1,
            timeout_per_attempt_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: usize,
    pub success_threshold: usize,
    pub recovery_timeout_ms: u64,
    pub half_open_max_calls: Option<usize>,
    /// Enables rate-based tripping when set.
    pub failure_rate_threshold: Option<f64>,
    pub minimum_requests: usize,
    pub sliding_window_size: usize,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout_ms: 60_000,
            half_open_max_calls: None,
            failure_rate_threshold: None,
            minimum_requests: defaults.minimum_requests(),
            sliding_window_size: defaults.sliding_window_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyticsSettings {
    pub enabled_analyses: Vec<String>,
    pub time_window_days: u32,
    pub minimum_records_for_analysis: usize,
    pub cache_results: bool,
    pub cache_ttl_minutes: u32,
    pub strategy_timeout_ms: Option<u64>,
    pub cache_key_mode: String,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        let defaults = AnalyticsConfiguration::default();
        Self {
            enabled_analyses: defaults.enabled_analyses().iter().map(|k| k.as_str().to_string()).collect(),
            time_window_days: defaults.time_window_days(),
            minimum_records_for_analysis: defaults.minimum_records_for_analysis(),
            cache_results: defaults.cache_results(),
            cache_ttl_minutes: defaults.cache_ttl_minutes(),
            strategy_timeout_ms: None,
            cache_key_mode: "record_count".to_string(),
        }
    }
}

/// Repository cache TTLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    pub base_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { base_ttl_secs: 3_600 }
    }
}

/// Validated runtime configuration produced by [`Settings::resolve`].
#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub retry: RetryConfig,
    pub breakers: CircuitBreakerRegistry,
    pub analytics: AnalyticsConfiguration,
    pub ttl_policy: TtlPolicy,
}

impl Settings {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Convert every section, failing on the first invalid value.
    pub fn resolve(&self) -> Result<ResolvedSettings, ConfigError> {
        let breakers = CircuitBreakerRegistry::default();
        for (name, section) in &self.circuit_breakers {
            let config = CircuitBreakerConfig::try_from(section)?;
            breakers.register(name.clone(), CircuitBreakerPolicy::with_config(config));
        }
        Ok(ResolvedSettings {
            retry: RetryConfig::try_from(&self.retry)?,
            breakers,
            analytics: AnalyticsConfiguration::try_from(&self.analytics)?,
            ttl_policy: TtlPolicy::new(Duration::from_secs(self.cache.base_ttl_secs))?,
        })
    }
}

impl TryFrom<&RetrySettings> for RetryConfig {
    type Error = ConfigError;

    fn try_from(s: &RetrySettings) -> Result<Self, Self::Error> {
        let mut builder = RetryConfig::builder()
            .max_attempts(s.max_attempts)
            .base_delay(Duration::from_millis(s.base_delay_ms))
            .max_delay(Duration::from_millis(s.max_delay_ms))
            .strategy(s.backoff_strategy.parse()?)
            .backoff_factor(s.backoff_factor)
            .jitter(s.jitter)
            .jitter_factor(s.jitter_factor);
        if let Some(ms) = s.timeout_per_attempt_ms {
            builder = builder.timeout_per_attempt(Duration::from_millis(ms));
        }
        builder.build()
    }
}

impl TryFrom<&CircuitBreakerSettings> for CircuitBreakerConfig {
    type Error = ConfigError;

    fn try_from(s: &CircuitBreakerSettings) -> Result<Self, Self::Error> {
        let config = CircuitBreakerConfig::new(
            s.failure_threshold,
            s.success_threshold,
            Duration::from_millis(s.recovery_timeout_ms),
        )?
        .with_sliding_window(s.sliding_window_size)?;
        let config = match s.half_open_max_calls {
            Some(limit) => config.with_half_open_limit(limit)?,
            None => config,
        };
        match s.failure_rate_threshold {
            Some(rate) => config.with_failure_rate(rate, s.minimum_requests),
            None => Ok(config),
        }
    }
}

impl TryFrom<&AnalyticsSettings> for AnalyticsConfiguration {
    type Error = ConfigError;

    fn try_from(s: &AnalyticsSettings) -> Result<Self, Self::Error> {
        let kinds = s
            .enabled_analyses
            .iter()
            .map(|name| name.parse::<AnalysisKind>())
            .collect::<Result<Vec<_>, _>>()?;
        let mode = match s.cache_key_mode.as_str() {
            "record_count" => CacheKeyMode::RecordCount,
            "content_hash" => CacheKeyMode::ContentHash,
            other => {
                return Err(ConfigError::UnknownVariant { field: "cache_key_mode", value: other.to_string() })
            }
        };
        let mut builder = AnalyticsConfiguration::builder()
            .enabled_analyses(kinds)
            .time_window_days(s.time_window_days)
            .minimum_records_for_analysis(s.minimum_records_for_analysis)
            .cache_results(s.cache_results)
            .cache_ttl_minutes(s.cache_ttl_minutes)
            .cache_key_mode(mode);
        if let Some(ms) = s.strategy_timeout_ms {
            builder = builder.strategy_timeout(Duration::from_millis(ms));
        }
        builder.build()
    }
}
