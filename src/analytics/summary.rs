use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::types::{AnalysisKind, AnalysisResult};

/// Scores below this raise an alert.
pub const ALERT_THRESHOLD: f64 = 0.5;

/// Overall health derived from the average score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "snake_case"))]
pub enum HealthTier {
    Excellent,
    Good,
    Fair,
    NeedsAttention,
    /// No result carried a score.
    Unknown,
}

impl HealthTier {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            HealthTier::Excellent
        } else if score >= 0.6 {
            HealthTier::Good
        } else if score >= 0.4 {
            HealthTier::Fair
        } else {
            HealthTier::NeedsAttention
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthTier::Excellent => "excellent",
            HealthTier::Good => "good",
            HealthTier::Fair => "fair",
            HealthTier::NeedsAttention => "needs_attention",
            HealthTier::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Roll-up of one result map.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Summary {
    pub overall_health: HealthTier,
    pub average_score: Option<f64>,
    pub key_metrics: BTreeMap<AnalysisKind, BTreeMap<String, f64>>,
    pub recommendations: Vec<String>,
    pub alerts: Vec<String>,
}

impl Summary {
    pub fn from_results(results: &BTreeMap<AnalysisKind, Arc<AnalysisResult>>) -> Self {
        let mut key_metrics = BTreeMap::new();
        let mut recommendations = Vec::new();
        let mut alerts = Vec::new();
        let mut total = 0.0;
        let mut scored = 0usize;

        for (kind, result) in results {
            if !result.metrics.is_empty() {
                key_metrics.insert(*kind, result.metrics.clone());
            }
            recommendations.extend(result.recommendations.iter().cloned());
            if let Some(score) = result.score {
                total += score;
                scored += 1;
                if score < ALERT_THRESHOLD {
                    alerts.push(format!("Low performance in {kind}: {score:.2}"));
                }
            }
        }

        let average_score = (scored > 0).then(|| total / scored as f64);
        Self {
            overall_health: average_score.map_or(HealthTier::Unknown, HealthTier::from_score),
            average_score,
            key_metrics,
            recommendations,
            alerts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(entries: Vec<AnalysisResult>) -> BTreeMap<AnalysisKind, Arc<AnalysisResult>> {
        entries.into_iter().map(|r| (r.kind, Arc::new(r))).collect()
    }

    #[test]
    fn tiers_follow_thresholds() {
        assert_eq!(HealthTier::from_score(0.8), HealthTier::Excellent);
        assert_eq!(HealthTier::from_score(0.79), HealthTier::Good);
        assert_eq!(HealthTier::from_score(0.6), HealthTier::Good);
        assert_eq!(HealthTier::from_score(0.4), HealthTier::Fair);
        assert_eq!(HealthTier::from_score(0.39), HealthTier::NeedsAttention);
    }

    #[test]
    fn averages_scores_and_flags_low_ones() {
        let summary = Summary::from_results(&results(vec![
            AnalysisResult::new(AnalysisKind::Velocity)
                .with_score(0.75)
                .with_metric("issues_per_week", 12.0)
                .with_recommendation("keep the sprint cadence"),
            AnalysisResult::new(AnalysisKind::Quality)
                .with_score(0.25)
                .with_recommendation("add regression tests"),
            AnalysisResult::new(AnalysisKind::Burndown),
        ]));

        assert_eq!(summary.average_score, Some(0.5));
        assert_eq!(summary.overall_health, HealthTier::Fair);
        assert_eq!(summary.alerts, vec!["Low performance in quality: 0.25".to_string()]);
        assert_eq!(summary.recommendations.len(), 2);
        assert_eq!(summary.key_metrics.len(), 1);
        assert_eq!(summary.key_metrics[&AnalysisKind::Velocity]["issues_per_week"], 12.0);
    }

    #[test]
    fn no_scores_means_unknown_health() {
        let summary = Summary::from_results(&BTreeMap::new());
        assert_eq!(summary.overall_health, HealthTier::Unknown);
        assert_eq!(summary.average_score, None);
        assert!(summary.alerts.is_empty());
    }
}
