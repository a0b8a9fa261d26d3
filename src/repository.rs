//! Cache-aside decorator for a record repository.
//!
//! [`CachedRepository`] wraps any [`Repository`] and memoizes its reads in per-operation
//! [`TtlCache`]s. TTLs are multiples of one base TTL ([`TtlPolicy`]): metadata changes rarely and
//! lives longest, list reads are volatile and expire first.

use crate::cache::{CacheKey, CacheStats, TtlCache};
use crate::clock::Clock;
use crate::error::ConfigError;
use crate::telemetry::TelemetrySink;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Read side of an issue/record store.
#[async_trait]
pub trait Repository: Send + Sync {
    type Record: Clone + Send + Sync + 'static;
    type Metadata: Clone + Send + Sync + 'static;
    type TimelineEvent: Clone + Send + Sync + 'static;
    type Query: KeyFragment + Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn list_records(&self, query: &Self::Query) -> Result<Vec<Self::Record>, Self::Error>;

    /// `Ok(None)` when the record does not exist.
    async fn get_record(&self, id: u64) -> Result<Option<Self::Record>, Self::Error>;

    async fn get_metadata(&self) -> Result<Self::Metadata, Self::Error>;

    async fn get_timeline(&self, id: u64) -> Result<Vec<Self::TimelineEvent>, Self::Error>;
}

/// Contributes a query's fields to a cache key. Implementations must be deterministic.
pub trait KeyFragment {
    fn append_to(&self, key: CacheKey) -> CacheKey;
}

impl KeyFragment for () {
    fn append_to(&self, key: CacheKey) -> CacheKey {
        key
    }
}

/// Repository reads with their own TTL multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepoOperation {
    ListRecords,
    GetRecord,
    GetMetadata,
    GetTimeline,
}

impl RepoOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoOperation::ListRecords => "records",
            RepoOperation::GetRecord => "record",
            RepoOperation::GetMetadata => "metadata",
            RepoOperation::GetTimeline => "timeline",
        }
    }
}

/// Per-operation TTLs derived from one base TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    base: Duration,
    list_records: u32,
    get_record: u32,
    get_metadata: u32,
    get_timeline: u32,
}

impl TtlPolicy {
    /// Default multipliers: list 1×, record 1×, metadata 6×, timeline 2×.
    pub fn new(base: Duration) -> Result<Self, ConfigError> {
        if base.is_zero() {
            return Err(ConfigError::ZeroBaseTtl);
        }
        Ok(Self { base, list_records: 1, get_record: 1, get_metadata: 6, get_timeline: 2 })
    }

    pub fn with_multiplier(mut self, op: RepoOperation, multiplier: u32) -> Result<Self, ConfigError> {
        if multiplier == 0 {
            return Err(ConfigError::InvalidTtlMultiplier { operation: op.as_str(), multiplier });
        }
        *self.slot(op) = multiplier;
        Ok(self)
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn multiplier(&self, op: RepoOperation) -> u32 {
        match op {
            RepoOperation::ListRecords => self.list_records,
            RepoOperation::GetRecord => self.get_record,
            RepoOperation::GetMetadata => self.get_metadata,
            RepoOperation::GetTimeline => self.get_timeline,
        }
    }

    pub fn ttl_for(&self, op: RepoOperation) -> Duration {
        self.base.checked_mul(self.multiplier(op)).unwrap_or(Duration::MAX)
    }

    fn slot(&mut self, op: RepoOperation) -> &mut u32 {
        match op {
            RepoOperation::ListRecords => &mut self.list_records,
            RepoOperation::GetRecord => &mut self.get_record,
            RepoOperation::GetMetadata => &mut self.get_metadata,
            RepoOperation::GetTimeline => &mut self.get_timeline,
        }
    }
}

impl Default for TtlPolicy {
    /// One hour base TTL.
    fn default() -> Self {
        Self {
            base: Duration::from_secs(3600),
            list_records: 1,
            get_record: 1,
            get_metadata: 6,
            get_timeline: 2,
        }
    }
}

/// Cache-aside wrapper: look up, on miss call through and store with the operation's TTL.
pub struct CachedRepository<R: Repository> {
    inner: R,
    ttl: TtlPolicy,
    lists: TtlCache<Vec<R::Record>>,
    records: TtlCache<R::Record>,
    metadata: TtlCache<R::Metadata>,
    timelines: TtlCache<Vec<R::TimelineEvent>>,
}

impl<R: Repository> CachedRepository<R> {
    pub fn new(inner: R, ttl: TtlPolicy) -> Self {
        Self {
            lists: TtlCache::new(ttl.ttl_for(RepoOperation::ListRecords)),
            records: TtlCache::new(ttl.ttl_for(RepoOperation::GetRecord)),
            metadata: TtlCache::new(ttl.ttl_for(RepoOperation::GetMetadata)),
            timelines: TtlCache::new(ttl.ttl_for(RepoOperation::GetTimeline)),
            inner,
            ttl,
        }
    }

    /// Same as [`new`](Self::new) but every cache reads time from `clock`.
    pub fn with_clock<C: Clock + Clone + 'static>(inner: R, ttl: TtlPolicy, clock: C) -> Self {
        Self {
            lists: TtlCache::with_clock(ttl.ttl_for(RepoOperation::ListRecords), clock.clone()),
            records: TtlCache::with_clock(ttl.ttl_for(RepoOperation::GetRecord), clock.clone()),
            metadata: TtlCache::with_clock(ttl.ttl_for(RepoOperation::GetMetadata), clock.clone()),
            timelines: TtlCache::with_clock(ttl.ttl_for(RepoOperation::GetTimeline), clock),
            inner,
            ttl,
        }
    }

    /// Report cache events from every operation cache to `sink`.
    pub fn with_sink<S: TelemetrySink + Clone + 'static>(self, sink: S) -> Self {
        Self {
            lists: self.lists.with_sink(sink.clone()),
            records: self.records.with_sink(sink.clone()),
            metadata: self.metadata.with_sink(sink.clone()),
            timelines: self.timelines.with_sink(sink),
            inner: self.inner,
            ttl: self.ttl,
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.ttl
    }

    /// Drop cached entries whose key contains `pattern` (all entries for `None`).
    pub fn invalidate(&self, pattern: Option<&str>) -> usize {
        self.lists.invalidate(pattern)
            + self.records.invalidate(pattern)
            + self.metadata.invalidate(pattern)
            + self.timelines.invalidate(pattern)
    }

    pub fn clear(&self) -> usize {
        self.invalidate(None)
    }

    /// Counters summed over every operation cache.
    pub fn stats(&self) -> CacheStats {
        let parts = [self.lists.stats(), self.records.stats(), self.metadata.stats(), self.timelines.stats()];
        let size = parts.iter().map(|s| s.size).sum();
        let hits: u64 = parts.iter().map(|s| s.hits).sum();
        let misses: u64 = parts.iter().map(|s| s.misses).sum();
        let lookups = hits + misses;
        let hit_rate = if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 };
        CacheStats { size, hits, misses, hit_rate }
    }

    fn key(op: RepoOperation) -> CacheKey {
        CacheKey::new(op.as_str())
    }
}

#[async_trait]
impl<R: Repository> Repository for CachedRepository<R> {
    type Record = R::Record;
    type Metadata = R::Metadata;
    type TimelineEvent = R::TimelineEvent;
    type Query = R::Query;
    type Error = R::Error;

    async fn list_records(&self, query: &Self::Query) -> Result<Vec<Self::Record>, Self::Error> {
        let key = query.append_to(Self::key(RepoOperation::ListRecords)).build();
        self.lists.get_or_try_load(&key, None, || self.inner.list_records(query)).await
    }

    async fn get_record(&self, id: u64) -> Result<Option<Self::Record>, Self::Error> {
        let key = Self::key(RepoOperation::GetRecord).arg(id).build();
        if let Some(hit) = self.records.get(&key) {
            return Ok(Some(hit));
        }
        let record = self.inner.get_record(id).await?;
        if let Some(record) = &record {
            self.records.set(key, record.clone());
        }
        Ok(record)
    }

    async fn get_metadata(&self) -> Result<Self::Metadata, Self::Error> {
        let key = Self::key(RepoOperation::GetMetadata).build();
        self.metadata.get_or_try_load(&key, None, || self.inner.get_metadata()).await
    }

    async fn get_timeline(&self, id: u64) -> Result<Vec<Self::TimelineEvent>, Self::Error> {
        let key = Self::key(RepoOperation::GetTimeline).arg(id).build();
        self.timelines.get_or_try_load(&key, None, || self.inner.get_timeline(id)).await
    }
}

impl<R: Repository> std::fmt::Debug for CachedRepository<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedRepository").field("ttl", &self.ttl).field("stats", &self.stats()).finish()
    }
}

/// Shared handles delegate to the wrapped repository.
#[async_trait]
impl<R: Repository> Repository for Arc<R> {
    type Record = R::Record;
    type Metadata = R::Metadata;
    type TimelineEvent = R::TimelineEvent;
    type Query = R::Query;
    type Error = R::Error;

    async fn list_records(&self, query: &Self::Query) -> Result<Vec<Self::Record>, Self::Error> {
        (**self).list_records(query).await
    }

    async fn get_record(&self, id: u64) -> Result<Option<Self::Record>, Self::Error> {
        (**self).get_record(id).await
    }

    async fn get_metadata(&self) -> Result<Self::Metadata, Self::Error> {
        (**self).get_metadata().await
    }

    async fn get_timeline(&self, id: u64) -> Result<Vec<Self::TimelineEvent>, Self::Error> {
        (**self).get_timeline(id).await
    }
}
