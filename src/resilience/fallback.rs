//! Ordered fallback chains.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::context::WorkflowContext;
use crate::error::{Error, Result};
use crate::observability::{emit, metrics_collector, observed, WorkflowEvent, WorkflowEventType};
use crate::primitive::{Primitive, SharedPrimitive};

/// Tries the primary, then each named fallback in configured order.
///
/// The first success wins; when everything fails the last error propagates.
/// Each attempt's latency and outcome are recorded against the specific
/// fallback name.
pub struct Fallback<I, O> {
    primary: SharedPrimitive<I, O>,
    fallbacks: Vec<(String, SharedPrimitive<I, O>)>,
    per_fallback_timeout: Option<Duration>,
    name: String,
}

impl<I, O> Fallback<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    pub fn new<P>(primary: P) -> Self
    where
        P: Primitive<I, O> + 'static,
    {
        let name = format!("Fallback({})", primary.name());
        Self {
            primary: Arc::new(primary),
            fallbacks: Vec::new(),
            per_fallback_timeout: None,
            name,
        }
    }

    /// Append a named fallback; order of calls is the order of attempts.
    pub fn fallback<P>(mut self, name: impl Into<String>, primitive: P) -> Self
    where
        P: Primitive<I, O> + 'static,
    {
        self.fallbacks.push((name.into(), Arc::new(primitive)));
        self
    }

    /// Bound each individual fallback attempt.
    pub fn with_per_fallback_timeout(mut self, timeout: Duration) -> Self {
        self.per_fallback_timeout = Some(timeout);
        self
    }

    /// Set a custom name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Configured fallback names, in attempt order.
    pub fn fallback_names(&self) -> Vec<&str> {
        self.fallbacks.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub(crate) async fn execute_in_order(
        primary: &SharedPrimitive<I, O>,
        fallbacks: &[(String, SharedPrimitive<I, O>)],
        order: &[String],
        per_fallback_timeout: Option<Duration>,
        name: &str,
        input: I,
        ctx: &WorkflowContext,
    ) -> Result<O> {
        let primary_start = Instant::now();
        let primary_error = match primary.execute(input.clone(), ctx).await {
            Ok(output) => {
                metrics_collector().record_execution(
                    &format!("{name}.primary"),
                    primary_start.elapsed().as_secs_f64() * 1000.0,
                    true,
                );
                return Ok(output);
            }
            Err(error) => {
                metrics_collector().record_execution(
                    &format!("{name}.primary"),
                    primary_start.elapsed().as_secs_f64() * 1000.0,
                    false,
                );
                tracing::warn!(
                    primitive = name,
                    error = %error,
                    correlation_id = %ctx.correlation_id,
                    "primary failed, trying fallbacks",
                );
                error
            }
        };

        let mut last_error = primary_error;
        for wanted in order {
            let Some((fb_name, fallback)) = fallbacks.iter().find(|(n, _)| n == wanted) else {
                tracing::warn!(primitive = name, fallback = %wanted, "unknown fallback in order, skipping");
                continue;
            };

            emit(WorkflowEvent::fallback_attempt(name, ctx, fb_name));
            let attempt_start = Instant::now();
            let attempt = match per_fallback_timeout {
                Some(bound) => match tokio::time::timeout(bound, fallback.execute(input.clone(), ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(bound.as_millis() as u64)),
                },
                None => fallback.execute(input.clone(), ctx).await,
            };
            let latency_ms = attempt_start.elapsed().as_secs_f64() * 1000.0;

            match attempt {
                Ok(output) => {
                    metrics_collector().record_execution(&format!("{name}.{fb_name}"), latency_ms, true);
                    tracing::info!(
                        primitive = name,
                        fallback = %fb_name,
                        latency_ms = latency_ms,
                        "fallback succeeded",
                    );
                    emit(
                        WorkflowEvent::new(WorkflowEventType::FallbackSuccess, name, ctx)
                            .with_metadata("fallback", fb_name.as_str())
                            .with_metadata("latency_ms", latency_ms),
                    );
                    return Ok(output);
                }
                Err(error) => {
                    metrics_collector().record_execution(&format!("{name}.{fb_name}"), latency_ms, false);
                    tracing::warn!(
                        primitive = name,
                        fallback = %fb_name,
                        error = %error,
                        "fallback failed, trying next",
                    );
                    last_error = error;
                }
            }
        }

        tracing::error!(
            primitive = name,
            error = %last_error,
            correlation_id = %ctx.correlation_id,
            "primary and all fallbacks failed",
        );
        Err(last_error)
    }
}

#[async_trait]
impl<I, O> Primitive<I, O> for Fallback<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    async fn execute(&self, input: I, ctx: &WorkflowContext) -> Result<O> {
        let order: Vec<String> = self.fallbacks.iter().map(|(n, _)| n.clone()).collect();
        observed(
            "Fallback",
            &self.name,
            ctx,
            Self::execute_in_order(
                &self.primary,
                &self.fallbacks,
                &order,
                self.per_fallback_timeout,
                &self.name,
                input,
                ctx,
            ),
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

    fn always_down(label: &'static str, calls: Arc<AtomicU32>) -> Lambda<impl Fn(i32, WorkflowContext) -> futures::future::Ready<Result<i32>> + Send + Sync>
    {
        Lambda::new(label, move |_: i32, _ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Err(Error::transient(label)))
        })
    }

    #[tokio::test]
    async fn test_primary_success_skips_fallbacks() {
        let fb_calls = Arc::new(AtomicU32::new(0));
        let fallback = Fallback::new(Lambda::new("primary", |x: i32, _ctx| {
            futures::future::ready(Ok(x * 10))
        }))
        .fallback("backup", always_down("backup", fb_calls.clone()));

        let ctx = WorkflowContext::new();
        assert_eq!(fallback.execute(4, &ctx).await.unwrap(), 40);
        assert_eq!(fb_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_successful_fallback_wins() {
        let primary_calls = Arc::new(AtomicU32::new(0));
        let fallback = Fallback::new(always_down("primary", primary_calls.clone()))
            .fallback("a", Lambda::new("a", |x: i32, _ctx| {
                futures::future::ready(Ok(x + 1))
            }))
            .fallback("b", Lambda::new("b", |x: i32, _ctx| {
                futures::future::ready(Ok(x + 2))
            }));

        let ctx = WorkflowContext::new();
        assert_eq!(fallback.execute(0, &ctx).await.unwrap(), 1);
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_failed_returns_last_error() {
        let c1 = Arc::new(AtomicU32::new(0));
        let c2 = Arc::new(AtomicU32::new(0));
        let fallback = Fallback::new(always_down("primary", Arc::new(AtomicU32::new(0))))
            .fallback("a", always_down("fallback_a", c1.clone()))
            .fallback("b", always_down("fallback_b", c2.clone()));

        let ctx = WorkflowContext::new();
        let err = fallback.execute(0, &ctx).await.unwrap_err();
        match err {
            Error::Transient { message, .. } => assert_eq!(message, "fallback_b"),
            other => panic!("expected transient, got {other}"),
        }
        assert_eq!(c1.load(Ordering::SeqCst), 1);
        assert_eq!(c2.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_per_fallback_timeout_bounds_attempts() {
        let fallback = Fallback::new(always_down("primary", Arc::new(AtomicU32::new(0))))
            .fallback(
                "slow",
                Lambda::new("slow", |x: i32, _ctx| async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(x)
                }),
            )
            .fallback("fast", Lambda::new("fast", |x: i32, _ctx| {
                futures::future::ready(Ok(x + 5))
            }))
            .with_per_fallback_timeout(Duration::from_millis(30));

        let ctx = WorkflowContext::new();
        assert_eq!(fallback.execute(1, &ctx).await.unwrap(), 6);
    }
}
