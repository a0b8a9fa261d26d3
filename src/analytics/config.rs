use std::collections::BTreeSet;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::types::AnalysisKind;
use crate::error::ConfigError;

/// How the per-run result cache key identifies the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "snake_case"))]
pub enum CacheKeyMode {
    /// `kind:subject_id:records_in_window:time_window_days`. Two datasets with the same count
    /// inside the same window share a key.
    #[default]
    RecordCount,
    /// The record-count key plus a hash over every windowed record's fingerprint.
    ContentHash,
}

/// Settings for one orchestrator or one `analyze` call.
///
/// Deserialising runs [`validate`](Self::validate), so an out-of-range document is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "RawConfiguration"))]
pub struct AnalyticsConfiguration {
    enabled_analyses: BTreeSet<AnalysisKind>,
    time_window_days: u32,
    minimum_records_for_analysis: usize,
    cache_results: bool,
    cache_ttl_minutes: u32,
    strategy_timeout: Option<Duration>,
    cache_key_mode: CacheKeyMode,
}

impl AnalyticsConfiguration {
    pub fn builder() -> AnalyticsConfigurationBuilder {
        AnalyticsConfigurationBuilder::new()
    }

    pub fn enabled_analyses(&self) -> &BTreeSet<AnalysisKind> {
        &self.enabled_analyses
    }

    pub fn is_enabled(&self, kind: AnalysisKind) -> bool {
        self.enabled_analyses.contains(&kind)
    }

    pub fn time_window_days(&self) -> u32 {
        self.time_window_days
    }

    pub fn minimum_records_for_analysis(&self) -> usize {
        self.minimum_records_for_analysis
    }

    pub fn cache_results(&self) -> bool {
        self.cache_results
    }

    pub fn cache_ttl_minutes(&self) -> u32 {
        self.cache_ttl_minutes
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.cache_ttl_minutes) * 60)
    }

    pub fn strategy_timeout(&self) -> Option<Duration> {
        self.strategy_timeout
    }

    pub fn cache_key_mode(&self) -> CacheKeyMode {
        self.cache_key_mode
    }

    /// Re-check bounds, e.g. after deserialising.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.time_window_days == 0 {
            return Err(ConfigError::InvalidTimeWindow(self.time_window_days));
        }
        if self.cache_results && self.cache_ttl_minutes == 0 {
            return Err(ConfigError::InvalidCacheTtl(self.cache_ttl_minutes));
        }
        if self.strategy_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ZeroStrategyTimeout);
        }
        Ok(())
    }
}

/// Unchecked wire form of [`AnalyticsConfiguration`].
#[cfg(feature = "serde")]
#[derive(Deserialize)]
struct RawConfiguration {
    enabled_analyses: BTreeSet<AnalysisKind>,
    time_window_days: u32,
    minimum_records_for_analysis: usize,
    cache_results: bool,
    cache_ttl_minutes: u32,
    strategy_timeout: Option<Duration>,
    cache_key_mode: CacheKeyMode,
}

#[cfg(feature = "serde")]
impl TryFrom<RawConfiguration> for AnalyticsConfiguration {
    type Error = ConfigError;

    fn try_from(raw: RawConfiguration) -> Result<Self, Self::Error> {
        let config = Self {
            enabled_analyses: raw.enabled_analyses,
            time_window_days: raw.time_window_days,
            minimum_records_for_analysis: raw.minimum_records_for_analysis,
            cache_results: raw.cache_results,
            cache_ttl_minutes: raw.cache_ttl_minutes,
            strategy_timeout: raw.strategy_timeout,
            cache_key_mode: raw.cache_key_mode,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for AnalyticsConfiguration {
    /// Productivity, velocity, burndown and quality over 90 days; at least 5 records; results
    /// cached for 30 minutes.
    fn default() -> Self {
        Self {
            enabled_analyses: [
                AnalysisKind::Productivity,
                AnalysisKind::Velocity,
                AnalysisKind::Burndown,
                AnalysisKind::Quality,
            ]
            .into_iter()
            .collect(),
            time_window_days: 90,
            minimum_records_for_analysis: 5,
            cache_results: true,
            cache_ttl_minutes: 30,
            strategy_timeout: None,
            cache_key_mode: CacheKeyMode::RecordCount,
        }
    }
}

/// Builder starting from [`AnalyticsConfiguration::default`].
#[derive(Debug, Clone, Default)]
pub struct AnalyticsConfigurationBuilder {
    config: AnalyticsConfiguration,
}

impl AnalyticsConfigurationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the enabled set.
    pub fn enabled_analyses(mut self, kinds: impl IntoIterator<Item = AnalysisKind>) -> Self {
        self.config.enabled_analyses = kinds.into_iter().collect();
        self
    }

    pub fn enable(mut self, kind: AnalysisKind) -> Self {
        self.config.enabled_analyses.insert(kind);
        self
    }

    pub fn disable(mut self, kind: AnalysisKind) -> Self {
        self.config.enabled_analyses.remove(&kind);
        self
    }

    pub fn time_window_days(mut self, days: u32) -> Self {
        self.config.time_window_days = days;
        self
    }

    pub fn minimum_records_for_analysis(mut self, minimum: usize) -> Self {
        self.config.minimum_records_for_analysis = minimum;
        self
    }

    pub fn cache_results(mut self, enabled: bool) -> Self {
        self.config.cache_results = enabled;
        self
    }

    pub fn cache_ttl_minutes(mut self, minutes: u32) -> Self {
        self.config.cache_ttl_minutes = minutes;
        self
    }

    pub fn strategy_timeout(mut self, timeout: Duration) -> Self {
        self.config.strategy_timeout = Some(timeout);
        self
    }

    pub fn cache_key_mode(mut self, mode: CacheKeyMode) -> Self {
        self.config.cache_key_mode = mode;
        self
    }

    pub fn build(self) -> Result<AnalyticsConfiguration, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
