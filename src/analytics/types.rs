use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::config::AnalyticsConfiguration;
use crate::error::ConfigError;

/// Closed set of analyses the orchestrator knows how to schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "snake_case"))]
pub enum AnalysisKind {
    Productivity,
    Velocity,
    Burndown,
    CycleTime,
    LeadTime,
    Throughput,
    Quality,
    Workload,
}

impl AnalysisKind {
    pub const ALL: [AnalysisKind; 8] = [
        AnalysisKind::Productivity,
        AnalysisKind::Velocity,
        AnalysisKind::Burndown,
        AnalysisKind::CycleTime,
        AnalysisKind::LeadTime,
        AnalysisKind::Throughput,
        AnalysisKind::Quality,
        AnalysisKind::Workload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisKind::Productivity => "productivity",
            AnalysisKind::Velocity => "velocity",
            AnalysisKind::Burndown => "burndown",
            AnalysisKind::CycleTime => "cycle_time",
            AnalysisKind::LeadTime => "lead_time",
            AnalysisKind::Throughput => "throughput",
            AnalysisKind::Quality => "quality",
            AnalysisKind::Workload => "workload",
        }
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AnalysisKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AnalysisKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownVariant { field: "analysis_kind", value: s.to_string() })
    }
}

/// Anything the orchestrator can analyze. Records without a creation time never fall inside the
/// time window.
pub trait Record: Send + Sync {
    fn created_at(&self) -> Option<DateTime<Utc>>;

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Content fingerprint used by [`CacheKeyMode::ContentHash`](super::CacheKeyMode::ContentHash).
    ///
    /// The default hashes both timestamps, so an edit that bumps `updated_at` changes the key.
    fn cache_fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.created_at().map(|t| t.timestamp_millis()).hash(&mut hasher);
        self.updated_at().map(|t| t.timestamp_millis()).hash(&mut hasher);
        hasher.finish()
    }
}

/// Output of one strategy run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AnalysisResult {
    pub kind: AnalysisKind,
    pub timestamp: DateTime<Utc>,
    pub metrics: BTreeMap<String, f64>,
    pub summary: String,
    pub recommendations: Vec<String>,
    /// Normalised health score, `0.0..=1.0` by convention.
    pub score: Option<f64>,
}

impl AnalysisResult {
    pub fn new(kind: AnalysisKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            metrics: BTreeMap::new(),
            summary: String::new(),
            recommendations: Vec::new(),
            score: None,
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_recommendation(mut self, recommendation: impl Into<String>) -> Self {
        self.recommendations.push(recommendation.into());
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }
}

/// Read-only snapshot shared by every strategy in one `analyze` run.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsContext {
    pub subject_id: String,
    pub run_timestamp: DateTime<Utc>,
    /// Latest `updated_at` across all records; the run timestamp when none carry one.
    pub data_freshness: DateTime<Utc>,
    pub total_records: usize,
    pub records_in_window: usize,
    pub configuration: AnalyticsConfiguration,
    /// Run annotations: crate version, scheduled analyses and whether caching is on.
    pub metadata: BTreeMap<String, String>,
}

impl AnalyticsContext {
    pub(crate) fn capture<R: Record>(
        records: &[R],
        subject_id: &str,
        configuration: &AnalyticsConfiguration,
        now: DateTime<Utc>,
    ) -> Self {
        let window_start = window_start(now, configuration.time_window_days());
        let records_in_window = records.iter().filter(|r| in_window(*r, window_start)).count();
        let data_freshness = records.iter().filter_map(Record::updated_at).max().unwrap_or(now);
        let analyses: Vec<&str> =
            configuration.enabled_analyses().iter().map(AnalysisKind::as_str).collect();
        let metadata = BTreeMap::from([
            ("engine_version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
            ("analysis_strategies".to_string(), analyses.join(",")),
            ("cache_enabled".to_string(), configuration.cache_results().to_string()),
        ]);
        Self {
            subject_id: subject_id.to_string(),
            run_timestamp: now,
            data_freshness,
            total_records: records.len(),
            records_in_window,
            configuration: configuration.clone(),
            metadata,
        }
    }

    /// Oldest creation time still inside the analysis window.
    pub fn window_start(&self) -> DateTime<Utc> {
        window_start(self.run_timestamp, self.configuration.time_window_days())
    }
}

/// Windows reaching past the earliest representable instant start there instead.
pub(crate) fn window_start(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    ChronoDuration::try_days(i64::from(days))
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn in_window<R: Record>(record: &R, window_start: DateTime<Utc>) -> bool {
    record.created_at().is_some_and(|created| created >= window_start)
}
