//! Time-bounded execution.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::WorkflowContext;
use crate::error::{Error, Result};
use crate::observability::observed;
use crate::primitive::{Primitive, SharedPrimitive};

/// Races the wrapped primitive against a timer.
///
/// On expiry the caller gets [`Error::Timeout`] and the in-flight child
/// future is dropped, which is the runtime's cooperative cancellation.
/// Nested timeouts compose naturally: the innermost bound fires first.
pub struct Timeout<I, O> {
    inner: SharedPrimitive<I, O>,
    duration: Duration,
    name: String,
}

impl<I, O> Timeout<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new<P>(inner: P, duration: Duration) -> Self
    where
        P: Primitive<I, O> + 'static,
    {
        let name = format!("Timeout({})", inner.name());
        Self {
            inner: Arc::new(inner),
            duration,
            name,
        }
    }

    /// Set a custom name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The configured bound.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub(crate) async fn execute_with_duration(
        inner: &SharedPrimitive<I, O>,
        duration: Duration,
        name: &str,
        input: I,
        ctx: &WorkflowContext,
    ) -> Result<O> {
        if duration.is_zero() {
            return Err(Error::validation("timeout duration must be non-zero"));
        }
        match tokio::time::timeout(duration, inner.execute(input, ctx)).await {
            Ok(result) => result,
            Err(_) => {
                let duration_ms = duration.as_millis() as u64;
                tracing::warn!(
                    primitive = name,
                    timeout_ms = duration_ms,
                    correlation_id = %ctx.correlation_id,
                    "execution exceeded timeout, cancelling",
                );
                Err(Error::timeout(duration_ms))
            }
        }
    }
}

#[async_trait]
impl<I, O> Primitive<I, O> for Timeout<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    async fn execute(&self, input: I, ctx: &WorkflowContext) -> Result<O> {
        observed(
            "Timeout",
            &self.name,
            ctx,
            Self::execute_with_duration(&self.inner, self.duration, &self.name, input, ctx),
        )
        .await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
