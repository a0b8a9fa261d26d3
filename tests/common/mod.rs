#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use issuepulse::analytics::{
    AnalysisKind, AnalysisResult, AnalyticsContext, Record, Strategy, StrategyError,
};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError(pub &'static str);

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TestError {}

/// Captures formatted log output for assertions.
#[derive(Clone, Default)]
pub struct SharedWriter(pub Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

pub struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Install a thread-local subscriber writing into the returned buffer.
pub fn capture_logs() -> (SharedWriter, tracing::subscriber::DefaultGuard) {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(writer.clone())
        .with_ansi(false)
        .without_time()
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (writer, guard)
}

#[derive(Debug, Clone)]
pub struct Issue {
    pub number: u64,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Record for Issue {
    fn created_at(&self) -> Option<DateTime<Utc>> {
        Some(self.created)
    }
    fn updated_at(&self) -> Option<DateTime<Utc>> {
        Some(self.updated)
    }
}

/// `n` issues opened over the last `n` days.
pub fn recent_issues(n: usize) -> Vec<Issue> {
    let now = Utc::now();
    (0..n)
        .map(|i| Issue {
            number: i as u64 + 1,
            created: now - ChronoDuration::days(i as i64),
            updated: now - ChronoDuration::hours(i as i64),
        })
        .collect()
}

/// Strategy returning a fixed score and counting its invocations.
pub struct FixedScore {
    kind: AnalysisKind,
    score: f64,
    pub calls: Arc<AtomicUsize>,
}

impl FixedScore {
    pub fn new(kind: AnalysisKind, score: f64) -> Self {
        Self { kind, score, calls: Arc::new(AtomicUsize::new(0)) }
    }
}

#[async_trait]
impl Strategy<Issue> for FixedScore {
    async fn analyze(
        &self,
        records: &[&Issue],
        context: &AnalyticsContext,
    ) -> Result<AnalysisResult, StrategyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(AnalysisResult::new(self.kind)
            .with_score(self.score)
            .with_metric("records", records.len() as f64)
            .with_metric("records_in_window", context.records_in_window as f64)
            .with_summary(format!("{} over {}", self.kind, context.subject_id)))
    }
}

/// Strategy that always errors.
pub struct AlwaysFails {
    pub calls: Arc<AtomicUsize>,
}

impl AlwaysFails {
    pub fn new() -> Self {
        Self { calls: Arc::new(AtomicUsize::new(0)) }
    }
}

#[async_trait]
impl Strategy<Issue> for AlwaysFails {
    async fn analyze(
        &self,
        _records: &[&Issue],
        _context: &AnalyticsContext,
    ) -> Result<AnalysisResult, StrategyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StrategyError::failed("division by zero in burndown"))
    }
}

/// Strategy that waits on the tokio clock before scoring.
pub struct Sleepy {
    kind: AnalysisKind,
    delay: std::time::Duration,
}

impl Sleepy {
    pub fn new(kind: AnalysisKind, delay: std::time::Duration) -> Self {
        Self { kind, delay }
    }
}

#[async_trait]
impl Strategy<Issue> for Sleepy {
    async fn analyze(
        &self,
        _records: &[&Issue],
        _context: &AnalyticsContext,
    ) -> Result<AnalysisResult, StrategyError> {
        tokio::time::sleep(self.delay).await;
        Ok(AnalysisResult::new(self.kind).with_score(0.5))
    }
}
