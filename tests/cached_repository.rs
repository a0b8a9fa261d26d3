mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::TestError;
use issuepulse::{
    CacheKey, CachedRepository, KeyFragment, ManualClock, MetricsCollector, RepoOperation,
    Repository, TtlPolicy,
};

#[derive(Debug, Clone, PartialEq)]
struct Issue {
    number: u64,
    title: String,
}

#[derive(Debug, Clone, Default)]
struct IssueQuery {
    state: Option<&'static str>,
    label: Option<&'static str>,
}

impl KeyFragment for IssueQuery {
    fn append_to(&self, key: CacheKey) -> CacheKey {
        key.param_opt("state", self.state).param_opt("label", self.label)
    }
}

#[derive(Default)]
struct Counters {
    list: AtomicUsize,
    get: AtomicUsize,
    metadata: AtomicUsize,
    timeline: AtomicUsize,
}

#[derive(Clone, Default)]
struct FakeGithub {
    counters: Arc<Counters>,
    fail_lists: bool,
}

#[async_trait]
impl Repository for FakeGithub {
    type Record = Issue;
    type Metadata = String;
    type TimelineEvent = String;
    type Query = IssueQuery;
    type Error = TestError;

    async fn list_records(&self, query: &IssueQuery) -> Result<Vec<Issue>, TestError> {
        self.counters.list.fetch_add(1, Ordering::SeqCst);
        if self.fail_lists {
            return Err(TestError("secondary rate limit"));
        }
        let title = query.state.unwrap_or("all").to_string();
        Ok(vec![Issue { number: 1, title }])
    }

    async fn get_record(&self, id: u64) -> Result<Option<Issue>, TestError> {
        self.counters.get.fetch_add(1, Ordering::SeqCst);
        Ok((id < 100).then(|| Issue { number: id, title: format!("issue {id}") }))
    }

    async fn get_metadata(&self) -> Result<String, TestError> {
        self.counters.metadata.fetch_add(1, Ordering::SeqCst);
        Ok("octo/repo".to_string())
    }

    async fn get_timeline(&self, id: u64) -> Result<Vec<String>, TestError> {
        self.counters.timeline.fetch_add(1, Ordering::SeqCst);
        Ok(vec![format!("opened #{id}"), format!("labeled #{id}")])
    }
}

fn repo(clock: &ManualClock) -> (CachedRepository<FakeGithub>, Arc<Counters>) {
    let inner = FakeGithub::default();
    let counters = inner.counters.clone();
    let policy = TtlPolicy::new(Duration::from_secs(60)).unwrap();
    (CachedRepository::with_clock(inner, policy, clock.clone()), counters)
}

#[tokio::test]
async fn repeated_reads_hit_the_cache() {
    let clock = ManualClock::new();
    let (repo, counters) = repo(&clock);
    let open = IssueQuery { state: Some("open"), label: None };

    repo.list_records(&open).await.unwrap();
    repo.list_records(&open).await.unwrap();
    repo.get_record(7).await.unwrap();
    repo.get_record(7).await.unwrap();

    assert_eq!(counters.list.load(Ordering::SeqCst), 1);
    assert_eq!(counters.get.load(Ordering::SeqCst), 1);
    let stats = repo.stats();
    assert_eq!((stats.hits, stats.misses, stats.size), (2, 2, 2));
    assert_eq!(stats.hit_rate, 0.5);
}

#[tokio::test]
async fn distinct_queries_get_distinct_entries() {
    let clock = ManualClock::new();
    let (repo, counters) = repo(&clock);

    let open = repo.list_records(&IssueQuery { state: Some("open"), label: None }).await.unwrap();
    let closed = repo.list_records(&IssueQuery { state: Some("closed"), label: None }).await.unwrap();

    assert_eq!(open[0].title, "open");
    assert_eq!(closed[0].title, "closed");
    assert_eq!(counters.list.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn ttl_follows_operation_multiplier() {
    let clock = ManualClock::new();
    let (repo, counters) = repo(&clock);
    assert_eq!(repo.ttl_policy().ttl_for(RepoOperation::GetMetadata), Duration::from_secs(360));

    repo.list_records(&IssueQuery::default()).await.unwrap();
    repo.get_metadata().await.unwrap();
    repo.get_timeline(3).await.unwrap();

    clock.advance(Duration::from_secs(61));
    repo.list_records(&IssueQuery::default()).await.unwrap();
    repo.get_metadata().await.unwrap();
    repo.get_timeline(3).await.unwrap();
    assert_eq!(counters.list.load(Ordering::SeqCst), 2, "list TTL is 1x base");
    assert_eq!(counters.metadata.load(Ordering::SeqCst), 1);
    assert_eq!(counters.timeline.load(Ordering::SeqCst), 1);

    clock.advance(Duration::from_secs(60));
    repo.get_timeline(3).await.unwrap();
    assert_eq!(counters.timeline.load(Ordering::SeqCst), 2, "timeline TTL is 2x base");
}

#[tokio::test]
async fn missing_records_are_not_cached() {
    let clock = ManualClock::new();
    let (repo, counters) = repo(&clock);

    assert_eq!(repo.get_record(404).await.unwrap(), None);
    assert_eq!(repo.get_record(404).await.unwrap(), None);
    assert_eq!(counters.get.load(Ordering::SeqCst), 2);
    assert_eq!(repo.stats().size, 0);
}

#[tokio::test]
async fn errors_pass_through_uncached() {
    let inner = FakeGithub { fail_lists: true, ..FakeGithub::default() };
    let counters = inner.counters.clone();
    let repo = CachedRepository::new(inner, TtlPolicy::default());

    assert!(repo.list_records(&IssueQuery::default()).await.is_err());
    assert!(repo.list_records(&IssueQuery::default()).await.is_err());
    assert_eq!(counters.list.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn invalidate_by_pattern() {
    let clock = ManualClock::new();
    let (repo, counters) = repo(&clock);
    repo.list_records(&IssueQuery { state: Some("open"), label: None }).await.unwrap();
    repo.list_records(&IssueQuery { state: Some("closed"), label: Some("bug") }).await.unwrap();
    repo.get_record(1).await.unwrap();
    repo.get_metadata().await.unwrap();

    assert_eq!(repo.invalidate(Some("records:")), 2);
    repo.get_record(1).await.unwrap();
    assert_eq!(counters.get.load(Ordering::SeqCst), 1, "record entry survived");

    assert_eq!(repo.clear(), 2);
    assert_eq!(repo.clear(), 0, "second clear is a no-op");
}

#[tokio::test]
async fn cache_events_reach_the_metrics_collector() {
    let clock = ManualClock::new();
    let metrics = MetricsCollector::new();
    let policy = TtlPolicy::new(Duration::from_secs(60)).unwrap();
    let repo = CachedRepository::with_clock(FakeGithub::default(), policy, clock.clone())
        .with_sink(metrics.clone());

    repo.get_metadata().await.unwrap();
    repo.get_metadata().await.unwrap();
    repo.get_timeline(9).await.unwrap();
    clock.advance(Duration::from_secs(121));
    repo.get_timeline(9).await.unwrap();

    assert_eq!(metrics.counter("cache.hits"), 1);
    assert_eq!(metrics.counter("cache.misses"), 3);
    assert_eq!(metrics.counter("cache.expired"), 1);
}
