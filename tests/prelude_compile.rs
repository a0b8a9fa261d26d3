//! Compile-time prelude coverage test.
use issuepulse::prelude::*;
use std::time::Duration;
use tower::service_fn;
use tower_layer::Layer;
use tower_service::Service;

#[tokio::test]
async fn prelude_reexports_core_types() {
    let _backoff = Backoff::from_strategy(BackoffStrategy::Linear, Duration::from_millis(100));
    let _jitter = Jitter::None;
    let _cache: TtlCache<String> = TtlCache::new(Duration::from_secs(60));
    let _key = CacheKey::new("issues").param("state", "open").build();
    let _config = AnalyticsConfiguration::default();

    let breaker = CircuitBreakerPolicy::with_config(CircuitBreakerConfig::default());
    let layer = CircuitBreakerLayer::new(breaker.clone());
    let mut svc = layer.layer(service_fn(|_req: ()| async { Ok::<_, std::io::Error>(()) }));
    svc.call(()).await.expect("service call failed");
    assert_eq!(breaker.state(), CircuitState::Closed);

    let stack: ResilienceStack<std::io::Error> = ResilienceStack::builder()
        .retry(RetryPolicy::from_config(RetryConfig::default()))
        .circuit_breaker(breaker)
        .build();
    let value = stack.execute(|| async { Ok::<_, ResilienceError<std::io::Error>>(7) }).await;
    assert_eq!(value.unwrap(), 7);
}
