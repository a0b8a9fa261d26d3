use std::time::Duration;

use async_trait::async_trait;

use super::types::{AnalysisResult, AnalyticsContext, Record};

/// Why a strategy produced no result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StrategyError {
    #[error("insufficient data: need {required} records, got {actual}")]
    InsufficientData { required: usize, actual: usize },
    #[error("analysis failed: {0}")]
    Failed(String),
    #[error("strategy panicked: {0}")]
    Panicked(String),
    #[error("strategy timed out after {0:?}")]
    TimedOut(Duration),
}

impl StrategyError {
    pub fn failed(reason: impl Into<String>) -> Self {
        StrategyError::Failed(reason.into())
    }
}

/// One pluggable analysis.
///
/// `records` holds only the records inside the run's time window. Both arguments are shared with
/// sibling strategies running concurrently and must be treated as read-only.
#[async_trait]
pub trait Strategy<R: Record>: Send + Sync {
    async fn analyze(
        &self,
        records: &[&R],
        context: &AnalyticsContext,
    ) -> Result<AnalysisResult, StrategyError>;
}
