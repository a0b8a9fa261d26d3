//! Composition of retry and circuit breaker around an external call.
//!
//! Retry is the outer layer and the breaker the inner one: every attempt passes through the
//! breaker, so each underlying call is counted once, and an open circuit ends the retry loop
//! immediately with `CircuitOpen`.

use crate::circuit_breaker::CircuitBreakerPolicy;
use crate::error::ResilienceError;
use crate::retry::{RetryConfig, RetryPolicy};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

/// Retry wrapped around a circuit breaker.
pub struct ResilienceStack<E> {
    pub(crate) retry: RetryPolicy<E>,
    pub(crate) circuit_breaker: CircuitBreakerPolicy,
}

impl<E> Clone for ResilienceStack<E> {
    fn clone(&self) -> Self {
        Self { retry: self.retry.clone(), circuit_breaker: self.circuit_breaker.clone() }
    }
}

impl<E> std::fmt::Debug for ResilienceStack<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceStack")
            .field("retry", &self.retry)
            .field("circuit_breaker", &self.circuit_breaker)
            .finish()
    }
}

impl<E> ResilienceStack<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> ResilienceStackBuilder<E> {
        ResilienceStackBuilder::new()
    }

    pub fn retry(&self) -> &RetryPolicy<E> {
        &self.retry
    }

    pub fn circuit_breaker(&self) -> &CircuitBreakerPolicy {
        &self.circuit_breaker
    }

    /// Run `operation` as `retry(breaker(operation))`.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        // The breaker needs an FnOnce per attempt; share the caller's FnMut across attempts.
        let op_cell = Arc::new(Mutex::new(operation));

        self.retry
            .execute(|| {
                let op = op_cell.clone();
                let circuit_breaker = self.circuit_breaker.clone();
                async move {
                    circuit_breaker
                        .execute(move || {
                            let mut op = op.lock().unwrap_or_else(PoisonError::into_inner);
                            op()
                        })
                        .await
                }
            })
            .await
    }
}

impl<E> Default for ResilienceStack<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        ResilienceStackBuilder::new().build()
    }
}

pub struct ResilienceStackBuilder<E> {
    retry: Option<RetryPolicy<E>>,
    circuit_breaker: Option<CircuitBreakerPolicy>,
}

impl<E> ResilienceStackBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { retry: None, circuit_breaker: None }
    }

    pub fn retry(mut self, policy: RetryPolicy<E>) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Share an existing breaker (e.g. one from a registry).
    pub fn circuit_breaker(mut self, breaker: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    /// Missing layers default to `RetryConfig::default()` and `CircuitBreakerConfig::default()`.
    pub fn build(self) -> ResilienceStack<E> {
        ResilienceStack {
            retry: self.retry.unwrap_or_else(|| RetryPolicy::from_config(RetryConfig::default())),
            circuit_breaker: self
                .circuit_breaker
                .unwrap_or_else(|| CircuitBreakerPolicy::with_config(Default::default())),
        }
    }
}

impl<E> Default for ResilienceStackBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap `operation` so every invocation goes through `breaker`.
///
/// The result is itself an operation, so it can be handed to [`with_retry`].
pub fn with_circuit_breaker<T, E, Fut, Op>(
    breaker: CircuitBreakerPolicy,
    operation: Op,
) -> impl Fn() -> BoxFuture<'static, Result<T, ResilienceError<E>>> + Clone + Send + Sync
where
    T: Send + 'static,
    E: Send + 'static,
    Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
    Op: Fn() -> Fut + Clone + Send + Sync + 'static,
{
    move || {
        let breaker = breaker.clone();
        let operation = operation.clone();
        Box::pin(async move { breaker.execute(operation).await })
    }
}

/// Wrap `operation` so every invocation runs under `policy`.
pub fn with_retry<T, E, Fut, Op>(
    policy: RetryPolicy<E>,
    operation: Op,
) -> impl Fn() -> BoxFuture<'static, Result<T, ResilienceError<E>>> + Clone + Send + Sync
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ResilienceError<E>>> + Send + 'static,
    Op: Fn() -> Fut + Clone + Send + Sync + 'static,
{
    move || {
        let policy = policy.clone();
        let operation = operation.clone();
        Box::pin(async move { policy.execute(|| operation()).await })
    }
}
