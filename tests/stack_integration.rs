mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::TestError;
use issuepulse::{
    presets, with_circuit_breaker, with_retry, Backoff, CircuitBreakerConfig, CircuitBreakerPolicy,
    CircuitBreakerRegistry, CircuitState, InstantSleeper, Jitter, ManualClock, ResilienceError,
    ResilienceStack, RetryPolicy, TrackingSleeper,
};

fn retry(attempts: usize) -> RetryPolicy<TestError> {
    RetryPolicy::builder()
        .max_attempts(attempts)
        .backoff(Backoff::exponential(Duration::from_millis(100)))
        .with_jitter(Jitter::None)
        .with_sleeper(InstantSleeper)
        .build()
        .unwrap()
}

#[tokio::test]
async fn always_failing_call_runs_exactly_max_attempts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();

    let err = retry(4)
        .execute(move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ResilienceError::Inner(TestError("flaky upstream")))
            }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    let (attempts, delays) = err.retry_exhausted_info().unwrap();
    assert_eq!(attempts, 4);
    assert_eq!(
        delays,
        &[Duration::from_millis(100), Duration::from_millis(200), Duration::from_millis(400)]
    );
    assert_eq!(err.root_inner(), Some(&TestError("flaky upstream")));
}

#[tokio::test]
async fn excluded_error_is_attempted_once() {
    let policy: RetryPolicy<TestError> = RetryPolicy::builder()
        .max_attempts(5)
        .backoff(Backoff::fixed(Duration::from_millis(10)))
        .with_jitter(Jitter::None)
        .exclude(|e: &TestError| e.0 == "unauthorized")
        .with_sleeper(InstantSleeper)
        .build()
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();

    let err = policy
        .execute(move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ResilienceError::Inner(TestError("unauthorized")))
            }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(err.as_inner(), Some(&TestError("unauthorized")));
}

#[tokio::test]
async fn sleeper_sees_capped_schedule() {
    let sleeper = TrackingSleeper::new();
    let policy: RetryPolicy<TestError> = RetryPolicy::builder()
        .max_attempts(5)
        .backoff(Backoff::exponential(Duration::from_millis(100)).with_max(Duration::from_millis(250)).unwrap())
        .with_jitter(Jitter::None)
        .with_sleeper(sleeper.clone())
        .build()
        .unwrap();

    let _ = policy
        .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError("down"))) })
        .await;

    assert_eq!(
        sleeper.delays(),
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(250),
            Duration::from_millis(250)
        ]
    );
}

#[tokio::test]
async fn breaker_recovers_through_half_open() {
    let clock = ManualClock::new();
    let breaker = CircuitBreakerPolicy::with_config(
        CircuitBreakerConfig::new(3, 2, Duration::from_secs(30)).unwrap(),
    )
    .with_clock(clock.clone());
    let stack = ResilienceStack::builder().retry(retry(1)).circuit_breaker(breaker.clone()).build();

    for _ in 0..3 {
        let _ = stack
            .execute(|| async { Err::<(), _>(ResilienceError::Inner(TestError("500"))) })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let invoked = Arc::new(AtomicUsize::new(0));
    let invoked_clone = invoked.clone();
    let rejected = stack
        .execute(move || {
            let invoked = invoked_clone.clone();
            async move {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ResilienceError<TestError>>(())
            }
        })
        .await;
    assert!(rejected.unwrap_err().is_circuit_open());
    assert_eq!(invoked.load(Ordering::SeqCst), 0, "open circuit never invokes the operation");

    clock.advance(Duration::from_secs(30));
    stack.execute(|| async { Ok::<_, ResilienceError<TestError>>(()) }).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    stack.execute(|| async { Ok::<_, ResilienceError<TestError>>(()) }).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn wrappers_share_registry_breaker() {
    let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::new(2, 1, Duration::from_secs(60)).unwrap());
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();
    let fetch_issues = move || {
        let calls = calls_clone.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<Vec<u64>, _>(ResilienceError::Inner(TestError("rate limited")))
        }
    };

    let guarded = with_retry(retry(5), with_circuit_breaker(registry.get_or_create("github"), fetch_issues));
    let err = guarded().await.unwrap_err();

    assert!(err.is_circuit_open(), "retry stops once the shared breaker opens: {err}");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].1.state, CircuitState::Open);
    assert_eq!(snapshot[0].1.total_rejections, 1);
}

#[tokio::test]
async fn preset_stack_uses_named_breaker() {
    let registry = CircuitBreakerRegistry::default();
    let stack = presets::github_stack::<TestError>(&registry);
    assert_eq!(stack.circuit_breaker().config().failure_threshold(), 5);
    assert!(registry.get(presets::GITHUB_BREAKER).unwrap().shares_state_with(stack.circuit_breaker()));
}
