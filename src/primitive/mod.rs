//! The primitive abstraction and composition algebra.
//!
//! A primitive is a single async unit: `execute(input, &ctx) -> Result<O>`.
//! Primitives compose into trees with [`PrimitiveExt::then`] (sequence) and
//! [`PrimitiveExt::par`] (parallel fan-out); [`Sequential`], [`Parallel`],
//! [`Router`], and [`Conditional`] are the composition nodes.
//!
//! # Example
//!
//! ```ignore
//! use workflow_core::{Lambda, PrimitiveExt, WorkflowContext};
//!
//! let double = Lambda::new("double", |x: i64, _ctx| async move { Ok(x * 2) });
//! let add_one = Lambda::new("add_one", |x: i64, _ctx| async move { Ok(x + 1) });
//!
//! let pipeline = double.then(add_one);
//! let ctx = WorkflowContext::new();
//! assert_eq!(pipeline.execute(20, &ctx).await?, 41);
//! ```

mod conditional;
mod parallel;
mod router;
mod sequential;

pub use conditional::Conditional;
pub use parallel::Parallel;
pub use router::Router;
pub use sequential::Sequential;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::WorkflowContext;
use crate::error::Result;
use crate::observability::observed;

/// A composable asynchronous unit of work.
///
/// Implementations must be thread-safe (`Send + Sync`) so trees can be
/// shared across async tasks. Inputs and outputs are opaque to the runtime;
/// composition nodes enforce the chaining types.
#[async_trait]
pub trait Primitive<I, O>: Send + Sync
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Execute the primitive. Errors propagate unchanged unless a resilience
    /// wrapper handles them.
    async fn execute(&self, input: I, ctx: &WorkflowContext) -> Result<O>;

    /// Name used in spans, events, and metrics.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A shareable, type-erased primitive.
pub type SharedPrimitive<I, O> = Arc<dyn Primitive<I, O>>;

#[async_trait]
impl<I, O, P> Primitive<I, O> for Arc<P>
where
    I: Send + 'static,
    O: Send + 'static,
    P: Primitive<I, O> + ?Sized,
{
    async fn execute(&self, input: I, ctx: &WorkflowContext) -> Result<O> {
        (**self).execute(input, ctx).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Primitive wrapping an async closure.
pub struct Lambda<F> {
    func: F,
    name: String,
}

impl<F> Lambda<F> {
    /// Wrap `func` under the given name. The closure receives the input and
    /// a clone of the executing context.
    pub fn new<I, O, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(I, WorkflowContext) -> Fut,
        Fut: Future<Output = Result<O>>,
    {
        Self {
            func,
            name: name.into(),
        }
    }
}

#[async_trait]
impl<I, O, F, Fut> Primitive<I, O> for Lambda<F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I, WorkflowContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O>> + Send,
{
    async fn execute(&self, input: I, ctx: &WorkflowContext) -> Result<O> {
        observed("Lambda", &self.name, ctx, (self.func)(input, ctx.clone())).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Composition sugar over any primitive.
///
/// `a.then(b)` is the sequence operator: `b` receives `a`'s output.
/// `a.par(b)` is the parallel operator: both receive the same input and the
/// result is an ordered pair of outputs collected into a `Vec`.
pub trait PrimitiveExt<I, O>: Primitive<I, O> + Sized + 'static
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Sequence this primitive with `next`.
    fn then<O2, P>(self, next: P) -> Sequential<I, O, O2>
    where
        O2: Send + 'static,
        P: Primitive<O, O2> + 'static,
    {
        Sequential::new(self, next)
    }

    /// Run this primitive in parallel with `other` on the same input.
    fn par<P>(self, other: P) -> Parallel<I, O>
    where
        I: Clone + Sync,
        P: Primitive<I, O> + 'static,
    {
        Parallel::new(vec![Arc::new(self) as SharedPrimitive<I, O>, Arc::new(other)])
    }

    /// Erase the concrete type for heterogeneous composition lists.
    fn shared(self) -> SharedPrimitive<I, O> {
        Arc::new(self)
    }
}

impl<T, I, O> PrimitiveExt<I, O> for T
where
    T: Primitive<I, O> + Sized + 'static,
    I: Send + 'static,
    O: Send + 'static,
{
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lambda_executes() {
        let upper = Lambda::new("upper", |s: String, _ctx| async move {
            Ok(s.to_uppercase())
        });
        let ctx = WorkflowContext::new();
        assert_eq!(upper.execute("abc".into(), &ctx).await.unwrap(), "ABC");
    }

    #[tokio::test]
    async fn test_lambda_sees_context() {
        let env = Lambda::new("env", |_: (), ctx: WorkflowContext| async move {
            Ok(ctx.metadata.environment_key().to_string())
        });
        let ctx = WorkflowContext::new().with_environment("staging");
        assert_eq!(env.execute((), &ctx).await.unwrap(), "staging");
    }

    #[tokio::test]
    async fn test_shared_erases_type() {
        let p: SharedPrimitive<i32, i32> =
            Lambda::new("inc", |x: i32, _ctx| async move { Ok(x + 1) }).shared();
        let ctx = WorkflowContext::new();
        assert_eq!(p.execute(1, &ctx).await.unwrap(), 2);
        assert_eq!(p.name(), "inc");
    }

    #[tokio::test]
    async fn test_full_tree_composes_resilience_and_fan_out() {
        use crate::resilience::{Retry, RetryConfig, Timeout};
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::time::Duration;

        // Flaky parser healed by retry, then a fan-out of two analyses.
        let parse_calls = Arc::new(AtomicU32::new(0));
        let counter = parse_calls.clone();
        let parse = Lambda::new("parse", move |s: String, _ctx| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(if n == 0 {
                Err(crate::error::Error::transient("cold parser"))
            } else {
                s.parse::<i64>()
                    .map_err(|e| crate::error::Error::validation(e.to_string()))
            })
        });
        let resilient_parse = Retry::new(
            parse,
            RetryConfig::new()
                .with_max_attempts(3)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(0.0),
        );

        let double = Lambda::new("double", |x: i64, _ctx| async move { Ok(x * 2) });
        let square = Lambda::new("square", |x: i64, _ctx| async move { Ok(x * x) });
        let fan = Parallel::new(vec![double.shared(), square.shared()]);
        let bounded_fan = Timeout::new(fan, Duration::from_millis(500));

        let tree = resilient_parse.then(bounded_fan);
        let ctx = WorkflowContext::new();
        assert_eq!(tree.execute("6".into(), &ctx).await.unwrap(), vec![12, 36]);
        assert_eq!(parse_calls.load(Ordering::SeqCst), 2);
    }
}
