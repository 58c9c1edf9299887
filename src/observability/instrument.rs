//! Span, event, and metric wrapping around primitive execution.

use std::future::Future;
use std::time::Instant;

use async_trait::async_trait;
use tracing::Instrument;

use super::events::{emit, WorkflowEvent};
use super::metrics::metrics_collector;
use crate::context::WorkflowContext;
use crate::error::Result;
use crate::primitive::Primitive;

/// Span for one primitive execution, named `<primitive_class>.execute`.
///
/// `tracing` span names must be literals, so the known primitive kinds
/// each get their own arm; anything else lands on the generic name.
fn execute_span(kind: &'static str, primitive: &str, ctx: &WorkflowContext) -> tracing::Span {
    macro_rules! span {
        ($name:literal) => {
            tracing::info_span!(
                $name,
                primitive = primitive,
                correlation_id = %ctx.correlation_id,
                trace_id = %ctx.trace_id,
                span_id = %ctx.span_id,
            )
        };
    }
    match kind {
        "Lambda" => span!("Lambda.execute"),
        "Sequential" => span!("Sequential.execute"),
        "Parallel" => span!("Parallel.execute"),
        "Router" => span!("Router.execute"),
        "Conditional" => span!("Conditional.execute"),
        "Retry" => span!("Retry.execute"),
        "Timeout" => span!("Timeout.execute"),
        "Cache" => span!("Cache.execute"),
        "Fallback" => span!("Fallback.execute"),
        "CircuitBreaker" => span!("CircuitBreaker.execute"),
        "Saga" => span!("Saga.execute"),
        "AdaptiveRetry" => span!("AdaptiveRetry.execute"),
        "AdaptiveCache" => span!("AdaptiveCache.execute"),
        "AdaptiveTimeout" => span!("AdaptiveTimeout.execute"),
        "AdaptiveFallback" => span!("AdaptiveFallback.execute"),
        "Instrumented" => span!("Instrumented.execute"),
        _ => span!("Primitive.execute"),
    }
}

/// Run `fut` wrapped in the standard observability envelope.
///
/// Starts a `<kind>.execute` span with trace attributes from the context,
/// emits `EXECUTE_START` / `EXECUTE_SUCCESS` / `EXECUTE_FAILED` events, and
/// records one metric per execution. The error, if any, propagates
/// unchanged.
pub async fn observed<T, Fut>(
    kind: &'static str,
    primitive: &str,
    ctx: &WorkflowContext,
    fut: Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let span = execute_span(kind, primitive, ctx);

    emit(WorkflowEvent::execute_start(primitive, ctx));
    let start = Instant::now();

    let result = fut.instrument(span).await;
    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

    match &result {
        Ok(_) => {
            metrics_collector().record_execution(primitive, duration_ms, true);
            emit(WorkflowEvent::execute_success(primitive, ctx, duration_ms));
        }
        Err(e) => {
            metrics_collector().record_execution(primitive, duration_ms, false);
            tracing::warn!(
                primitive = primitive,
                correlation_id = %ctx.correlation_id,
                error = %e,
                error_kind = e.kind(),
                duration_ms = duration_ms,
                "primitive execution failed",
            );
            emit(WorkflowEvent::execute_failed(primitive, ctx, &e.to_string()));
        }
    }

    result
}

/// Wrapper adding the observability envelope to a primitive that does not
/// instrument itself, such as host-implemented leaves.
pub struct Instrumented<P> {
    inner: P,
    name: String,
}

impl<P> Instrumented<P> {
    pub fn new(inner: P, name: impl Into<String>) -> Self {
        Self {
            inner,
            name: name.into(),
        }
    }
}

#[async_trait]
impl<I, O, P> Primitive<I, O> for Instrumented<P>
where
    I: Send + 'static,
    O: Send + 'static,
    P: Primitive<I, O>,
{
    async fn execute(&self, input: I, ctx: &WorkflowContext) -> Result<O> {
        observed("Instrumented", &self.name, ctx, self.inner.execute(input, ctx)).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::observability::events::{CollectingSink, WorkflowEventType};
    use crate::primitive::Lambda;

    #[tokio::test]
    async fn test_observed_emits_start_and_success() {
        let sink = CollectingSink::install();
        let ctx = WorkflowContext::new();

        let out: Result<i32> =
            observed("TestPrim", "TestPrim", &ctx, async { Ok(41 + 1) }).await;
        assert_eq!(out.unwrap(), 42);

        let events = sink.events_for(&ctx.correlation_id);
        assert_eq!(events[0].event_type, WorkflowEventType::ExecuteStart);
        assert_eq!(events[1].event_type, WorkflowEventType::ExecuteSuccess);
        assert!(events[1].get_metadata("duration_ms").is_some());
    }

    #[tokio::test]
    async fn test_observed_emits_failure_and_propagates() {
        let sink = CollectingSink::install();
        let ctx = WorkflowContext::new();

        let out: Result<i32> =
            observed("TestPrim", "TestPrim", &ctx, async { Err(Error::transient("boom")) }).await;
        assert!(matches!(out, Err(Error::Transient { .. })));

        let events = sink.events_for(&ctx.correlation_id);
        assert_eq!(events.last().unwrap().event_type, WorkflowEventType::ExecuteFailed);
    }

    #[tokio::test]
    async fn test_instrumented_wrapper_delegates() {
        let sink = CollectingSink::install();
        let ctx = WorkflowContext::new();
        let double = Instrumented::new(
            Lambda::new("double", |x: i32, _ctx| async move { Ok(x * 2) }),
            "WrappedDouble",
        );

        let out = double.execute(21, &ctx).await.unwrap();
        assert_eq!(out, 42);

        let names: Vec<String> = sink
            .events_for(&ctx.correlation_id)
            .into_iter()
            .map(|e| e.primitive)
            .collect();
        assert!(names.contains(&"WrappedDouble".to_string()));
    }
}
