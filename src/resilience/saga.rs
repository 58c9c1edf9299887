//! Saga: paired forward/compensation execution.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::WorkflowContext;
use crate::error::Result;
use crate::observability::{emit, observed, WorkflowEvent, WorkflowEventType};
use crate::primitive::{Primitive, SharedPrimitive};

/// Runs a forward primitive and, only when it fails, a compensation on the
/// same input and context.
///
/// The caller always observes the forward error; a compensation failure is
/// logged and attached to the event stream but never masks it. The saga is
/// observed as three segments (`.workflow`, `.forward`, `.compensation`),
/// each with its own metric record.
pub struct Saga<I, O, C> {
    forward: SharedPrimitive<I, O>,
    compensation: SharedPrimitive<I, C>,
    workflow_name: String,
    forward_name: String,
    compensation_name: String,
}

impl<I, O, C> Saga<I, O, C>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
    C: Send + 'static,
{
    pub fn new<F, P>(forward: F, compensation: P) -> Self
    where
        F: Primitive<I, O> + 'static,
        P: Primitive<I, C> + 'static,
    {
        Self {
            forward: Arc::new(forward),
            compensation: Arc::new(compensation),
            workflow_name: "Saga.workflow".to_string(),
            forward_name: "Saga.forward".to_string(),
            compensation_name: "Saga.compensation".to_string(),
        }
    }

    /// Rename the saga; segment names follow as `<name>.forward` etc.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let base = name.into();
        self.workflow_name = format!("{base}.workflow");
        self.forward_name = format!("{base}.forward");
        self.compensation_name = format!("{base}.compensation");
        self
    }
}

#[async_trait]
impl<I, O, C> Primitive<I, O> for Saga<I, O, C>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
    C: Send + 'static,
{
    async fn execute(&self, input: I, ctx: &WorkflowContext) -> Result<O> {
        observed("Saga", &self.workflow_name, ctx, async {
            ctx.checkpoint("saga.start");

            let forward_result = observed("Saga", &self.forward_name, ctx, async {
                ctx.checkpoint("saga.forward.start");
                let result = self.forward.execute(input.clone(), ctx).await;
                ctx.checkpoint("saga.forward.end");
                result
            })
            .await;

            let forward_error = match forward_result {
                Ok(output) => {
                    ctx.checkpoint("saga.end");
                    return Ok(output);
                }
                Err(error) => error,
            };

            tracing::warn!(
                primitive = %self.workflow_name,
                forward_error = %forward_error,
                correlation_id = %ctx.correlation_id,
                "forward failed, compensating",
            );
            emit(
                WorkflowEvent::new(WorkflowEventType::SagaCompensationTriggered, &self.workflow_name, ctx)
                    .with_metadata("forward_error", forward_error.to_string()),
            );

            let compensation_result = observed("Saga", &self.compensation_name, ctx, async {
                ctx.checkpoint("saga.compensation.start");
                let result = self.compensation.execute(input, ctx).await;
                ctx.checkpoint("saga.compensation.end");
                result
            })
            .await;

            match compensation_result {
                Ok(_) => {
                    emit(WorkflowEvent::new(
                        WorkflowEventType::SagaCompensationSuccess,
                        &self.workflow_name,
                        ctx,
                    ));
                }
                Err(compensation_error) => {
                    tracing::error!(
                        primitive = %self.workflow_name,
                        forward_error = %forward_error,
                        compensation_error = %compensation_error,
                        correlation_id = %ctx.correlation_id,
                        "compensation failed after forward failure",
                    );
                    emit(
                        WorkflowEvent::new(
                            WorkflowEventType::SagaCompensationFailed,
                            &self.workflow_name,
                            ctx,
                        )
                        .with_metadata("compensation_error", compensation_error.to_string()),
                    );
                }
            }

            ctx.checkpoint("saga.end");
            Err(forward_error)
        })
        .await
    }

    fn name(&self) -> &str {
        &self.workflow_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::observability::CollectingSink;
    use crate::primitive::Lambda;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_forward_success_skips_compensation() {
        let comp_calls = Arc::new(AtomicU32::new(0));
        let cc = comp_calls.clone();
        let saga = Saga::new(
            Lambda::new("commit", |x: i32, _ctx| futures::future::ready(Ok(x + 1))),
            Lambda::new("rollback", move |_: i32, _ctx| {
                cc.fetch_add(1, Ordering::SeqCst);
                futures::future::ready(Ok(()))
            }),
        );

        let ctx = WorkflowContext::new();
        assert_eq!(saga.execute(1, &ctx).await.unwrap(), 2);
        assert_eq!(comp_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_forward_failure_compensates_once_and_rethrows() {
        let sink = CollectingSink::install();
        let comp_calls = Arc::new(AtomicU32::new(0));
        let cc = comp_calls.clone();
        let saga = Saga::new(
            Lambda::new("commit", |_: i32, _ctx| {
                futures::future::ready(Err::<i32, _>(Error::permanent("boom")))
            }),
            Lambda::new("rollback", move |_: i32, _ctx| {
                cc.fetch_add(1, Ordering::SeqCst);
                futures::future::ready(Ok(()))
            }),
        );

        let ctx = WorkflowContext::new();
        let err = saga.execute(1, &ctx).await.unwrap_err();
        match err {
            Error::Permanent { message, .. } => assert_eq!(message, "boom"),
            other => panic!("expected forward error, got {other}"),
        }
        assert_eq!(comp_calls.load(Ordering::SeqCst), 1);

        let types: Vec<_> = sink
            .events_for(&ctx.correlation_id)
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert!(types.contains(&WorkflowEventType::SagaCompensationTriggered));
        assert!(types.contains(&WorkflowEventType::SagaCompensationSuccess));
    }

    #[tokio::test]
    async fn test_compensation_failure_never_masks_forward_error() {
        let saga = Saga::new(
            Lambda::new("commit", |_: i32, _ctx| {
                futures::future::ready(Err::<i32, _>(Error::permanent("forward down")))
            }),
            Lambda::new("rollback", |_: i32, _ctx| {
                futures::future::ready(Err::<(), _>(Error::transient("rollback down")))
            }),
        );

        let ctx = WorkflowContext::new();
        match saga.execute(1, &ctx).await.unwrap_err() {
            Error::Permanent { message, .. } => assert_eq!(message, "forward down"),
            other => panic!("compensation error leaked: {other}"),
        }
    }

    #[tokio::test]
    async fn test_checkpoints_cover_all_segments() {
        let saga = Saga::new(
            Lambda::new("commit", |_: i32, _ctx| {
                futures::future::ready(Err::<i32, _>(Error::permanent("x")))
            }),
            Lambda::new("rollback", |_: i32, _ctx| futures::future::ready(Ok(()))),
        );

        let ctx = WorkflowContext::new();
        let _ = saga.execute(1, &ctx).await;
        let names: Vec<String> = ctx.checkpoints().into_iter().map(|c| c.name).collect();
        assert_eq!(
            names,
            vec![
                "saga.start",
                "saga.forward.start",
                "saga.forward.end",
                "saga.compensation.start",
                "saga.compensation.end",
                "saga.end",
            ]
        );
    }
}
