//! Retry with exponential backoff and jitter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::context::WorkflowContext;
use crate::error::{Error, Result};
use crate::observability::{emit, observed, WorkflowEvent, WorkflowEventType};
use crate::primitive::{Primitive, SharedPrimitive};

/// Configuration for [`Retry`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first (>= 1)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Multiplier applied per retry (>= 1.0)
    pub backoff_factor: f64,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Jitter fraction in [0, 1]; each delay is scaled by `1 ± jitter`
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::validation("retry max_attempts must be >= 1"));
        }
        if self.backoff_factor < 1.0 {
            return Err(Error::validation("retry backoff_factor must be >= 1.0"));
        }
        Ok(())
    }

    /// Backoff before retrying after the given 1-based failed attempt,
    /// without jitter applied.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    pub(crate) fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((base.as_secs_f64() * (1.0 + spread)).max(0.0))
    }
}

type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Retries the wrapped primitive on retriable failures.
///
/// All attempts run under one logical span; each retry emits a per-attempt
/// event carrying the attempt index and the delay taken. After exhaustion
/// the last error propagates unchanged.
pub struct Retry<I, O> {
    inner: SharedPrimitive<I, O>,
    config: RetryConfig,
    retry_on: RetryPredicate,
    name: String,
}

impl<I, O> Retry<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    pub fn new<P>(inner: P, config: RetryConfig) -> Self
    where
        P: Primitive<I, O> + 'static,
    {
        let name = format!("Retry({})", inner.name());
        Self {
            inner: Arc::new(inner),
            config,
            retry_on: Arc::new(Error::is_retriable),
            name,
        }
    }

    /// Replace the retriability predicate.
    pub fn retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Arc::new(predicate);
        self
    }

    /// Set a custom name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub(crate) async fn execute_with_config(
        inner: &SharedPrimitive<I, O>,
        config: &RetryConfig,
        retry_on: &RetryPredicate,
        name: &str,
        input: I,
        ctx: &WorkflowContext,
    ) -> Result<O> {
        config.validate()?;

        let mut attempt = 1u32;
        loop {
            match inner.execute(input.clone(), ctx).await {
                Ok(output) => return Ok(output),
                Err(error) => {
                    if attempt >= config.max_attempts || !(retry_on)(&error) {
                        if attempt >= config.max_attempts {
                            tracing::warn!(
                                primitive = name,
                                attempts = attempt,
                                error = %error,
                                "retries exhausted",
                            );
                            emit(
                                WorkflowEvent::new(WorkflowEventType::RetryExhausted, name, ctx)
                                    .with_metadata("attempts", attempt),
                            );
                        }
                        return Err(error);
                    }

                    let delay = config.jittered_delay(attempt);
                    tracing::info!(
                        primitive = name,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after failure",
                    );
                    emit(WorkflowEvent::retry_attempt(
                        name,
                        ctx,
                        attempt,
                        delay.as_millis() as u64,
                    ));
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl<I, O> Primitive<I, O> for Retry<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    async fn execute(&self, input: I, ctx: &WorkflowContext) -> Result<O> {
        observed(
            "Retry",
            &self.name,
            ctx,
            Self::execute_with_config(&self.inner, &self.config, &self.retry_on, &self.name, input, ctx),
        )
        .await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::Lambda;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn flaky(fail_first: u32) -> (Lambda<impl Fn(i32, WorkflowContext) -> futures::future::Ready<Result<i32>> + Send + Sync>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let p = Lambda::new("flaky", move |x: i32, _ctx| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= fail_first {
                futures::future::ready(Err(Error::transient("not yet")))
            } else {
                futures::future::ready(Ok(x))
            }
        });
        (p, calls)
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let (p, calls) = flaky(2);
        let retry = Retry::new(
            p,
            RetryConfig::new()
                .with_max_attempts(3)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(0.0),
        );
        let ctx = WorkflowContext::new();
        assert_eq!(retry.execute(7, &ctx).await.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_preserves_last_error_and_attempt_count() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let always_down = Lambda::new("down", move |_: i32, _ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Err::<i32, _>(Error::transient("503")))
        });

        let retry = Retry::new(
            always_down,
            RetryConfig::new()
                .with_max_attempts(3)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(0.0),
        );
        let ctx = WorkflowContext::new();
        let err = retry.execute(0, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::Transient { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retriable_error_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let broken = Lambda::new("broken", move |_: i32, _ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Err::<i32, _>(Error::permanent("404")))
        });

        let retry = Retry::new(broken, RetryConfig::new().with_max_attempts(5));
        let ctx = WorkflowContext::new();
        let err = retry.execute(0, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::Permanent { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backoff_grows_exponentially() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_millis(10))
            .with_backoff_factor(2.0)
            .with_max_delay(Duration::from_millis(25));

        assert_eq!(config.base_delay(1), Duration::from_millis(10));
        assert_eq!(config.base_delay(2), Duration::from_millis(20));
        // Third retry is capped by max_delay.
        assert_eq!(config.base_delay(3), Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_observed_gaps_match_backoff() {
        let (p, _) = flaky(2);
        let retry = Retry::new(
            p,
            RetryConfig::new()
                .with_max_attempts(3)
                .with_initial_delay(Duration::from_millis(10))
                .with_backoff_factor(2.0)
                .with_jitter(0.0),
        );
        let ctx = WorkflowContext::new();
        let started = Instant::now();
        retry.execute(1, &ctx).await.unwrap();
        // 10ms + 20ms of backoff between the three attempts.
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    proptest::proptest! {
        #[test]
        fn prop_base_delay_monotone_and_capped(
            initial_ms in 1u64..1000,
            factor in 1.0f64..4.0,
            max_ms in 1u64..60_000,
            attempt in 1u32..12,
        ) {
            let config = RetryConfig::new()
                .with_initial_delay(Duration::from_millis(initial_ms))
                .with_backoff_factor(factor)
                .with_max_delay(Duration::from_millis(max_ms));

            let delay = config.base_delay(attempt);
            let next = config.base_delay(attempt + 1);
            proptest::prop_assert!(delay <= next);
            proptest::prop_assert!(delay <= Duration::from_millis(max_ms));
        }
    }

    #[tokio::test]
    async fn test_zero_attempts_is_validation_error() {
        let (p, _) = flaky(0);
        let retry = Retry::new(p, RetryConfig::new().with_max_attempts(0));
        let ctx = WorkflowContext::new();
        assert!(matches!(
            retry.execute(1, &ctx).await.unwrap_err(),
            Error::Validation(_)
        ));
    }
}
