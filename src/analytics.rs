//! Concurrent analysis fan-out over a record set.
//!
//! An [`AnalyticsOrchestrator`] owns a registry of [`Strategy`] implementations keyed by
//! [`AnalysisKind`]. Each `analyze` call filters the records to the configured time window, reuses
//! cached results where possible, runs the remaining strategies concurrently and returns whatever
//! succeeded. A failing, panicking or timed-out strategy is logged and left out of the map; its
//! siblings are unaffected.

/// Run configuration and its builder.
pub mod config;
/// Registry, fan-out and result cache.
pub mod orchestrator;
/// Strategy trait and strategy failures.
pub mod strategy;
/// Health roll-up of a result map.
pub mod summary;
/// Kinds, records, results and the per-run context.
pub mod types;

pub use config::{AnalyticsConfiguration, AnalyticsConfigurationBuilder, CacheKeyMode};
pub use orchestrator::AnalyticsOrchestrator;
pub use strategy::{Strategy, StrategyError};
pub use summary::{HealthTier, Summary};
pub use types::{AnalysisKind, AnalysisResult, AnalyticsContext, Record};
