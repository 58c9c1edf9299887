//! Sequential composition: output of the first step feeds the second.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Primitive, SharedPrimitive};
use crate::context::WorkflowContext;
use crate::error::Result;
use crate::observability::observed;

/// A sequence of two primitives with the intermediate type threaded through.
///
/// Longer pipelines nest: `a.then(b).then(c)`. Both steps execute on the
/// caller's context so their spans share one parent; on any step failure the
/// sequence aborts and the error propagates unchanged, with no partial
/// result.
pub struct Sequential<I, M, O> {
    first: SharedPrimitive<I, M>,
    second: SharedPrimitive<M, O>,
    name: String,
}

impl<I, M, O> Sequential<I, M, O>
where
    I: Send + 'static,
    M: Send + 'static,
    O: Send + 'static,
{
    pub fn new<P1, P2>(first: P1, second: P2) -> Self
    where
        P1: Primitive<I, M> + 'static,
        P2: Primitive<M, O> + 'static,
    {
        let name = format!("Sequential({} -> {})", first.name(), second.name());
        Self {
            first: Arc::new(first),
            second: Arc::new(second),
            name,
        }
    }

    /// Set a custom name for this sequence.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl<I, M, O> Primitive<I, O> for Sequential<I, M, O>
where
    I: Send + 'static,
    M: Send + 'static,
    O: Send + 'static,
{
    async fn execute(&self, input: I, ctx: &WorkflowContext) -> Result<O> {
        observed("Sequential", &self.name, ctx, async {
            let intermediate = self.first.execute(input, ctx).await?;
            self.second.execute(intermediate, ctx).await
        })
        .await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::observability::{CollectingSink, WorkflowEventType};
    use crate::primitive::{Lambda, PrimitiveExt};

    #[tokio::test]
    async fn test_threads_output_to_input() {
        let parse = Lambda::new("parse", |s: String, _ctx| async move {
            s.parse::<i64>().map_err(|e| Error::validation(e.to_string()))
        });
        let double = Lambda::new("double", |x: i64, _ctx| async move { Ok(x * 2) });

        let pipeline = parse.then(double);
        let ctx = WorkflowContext::new();
        assert_eq!(pipeline.execute("21".into(), &ctx).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_aborts_on_failure_without_running_later_steps() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let second_ran = Arc::new(AtomicU32::new(0));
        let counter = second_ran.clone();

        let boom = Lambda::new("boom", |_: i64, _ctx| async move {
            Err::<i64, _>(Error::permanent("down"))
        });
        let second = Lambda::new("second", move |x: i64, _ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(x))
        });

        let pipeline = boom.then(second);
        let ctx = WorkflowContext::new();
        let err = pipeline.execute(1, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::Permanent { .. }));
        assert_eq!(second_ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_events_in_step_order() {
        let sink = CollectingSink::install();
        let a = Lambda::new("step_a", |x: i64, _ctx| async move { Ok(x) });
        let b = Lambda::new("step_b", |x: i64, _ctx| async move { Ok(x) });
        let c = Lambda::new("step_c", |x: i64, _ctx| async move { Ok(x) });

        let pipeline = a.then(b).then(c);
        let ctx = WorkflowContext::new();
        pipeline.execute(0, &ctx).await.unwrap();

        let starts: Vec<String> = sink
            .events_for(&ctx.correlation_id)
            .into_iter()
            .filter(|e| e.event_type == WorkflowEventType::ExecuteStart)
            .map(|e| e.primitive)
            .filter(|name| name.starts_with("step_"))
            .collect();
        assert_eq!(starts, vec!["step_a", "step_b", "step_c"]);
    }

    #[tokio::test]
    async fn test_steps_share_parent_context() {
        let record = Lambda::new("record", |_: (), ctx: WorkflowContext| async move {
            Ok(ctx.span_id.clone())
        });
        let record2 = Lambda::new("record2", |first_span: String, ctx: WorkflowContext| async move {
            Ok((first_span, ctx.span_id.clone()))
        });

        let ctx = WorkflowContext::new();
        let (s1, s2) = record.then(record2).execute((), &ctx).await.unwrap();
        assert_eq!(s1, s2);
        assert_eq!(s1, ctx.span_id);
    }
}
