//! Parallel composition: fan the same input out to every child.

use async_trait::async_trait;

use super::{Primitive, SharedPrimitive};
use crate::context::WorkflowContext;
use crate::error::Result;
use crate::observability::observed;

/// Fan-out over a list of children, joined fail-fast.
///
/// Every child receives a clone of the input and an independent child
/// context. Results are collected into a `Vec` ordered by construction
/// index, not completion. The first child failure cancels still-pending
/// siblings (their futures are dropped) and propagates.
pub struct Parallel<I, O> {
    children: Vec<SharedPrimitive<I, O>>,
    name: String,
}

impl<I, O> Parallel<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    pub fn new(children: Vec<SharedPrimitive<I, O>>) -> Self {
        let name = format!("Parallel({})", children.len());
        Self { children, name }
    }

    /// Append another child to the fan-out.
    pub fn push<P>(mut self, child: P) -> Self
    where
        P: Primitive<I, O> + 'static,
    {
        self.children.push(std::sync::Arc::new(child));
        self.name = format!("Parallel({})", self.children.len());
        self
    }

    /// Set a custom name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of children.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

#[async_trait]
impl<I, O> Primitive<I, Vec<O>> for Parallel<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    async fn execute(&self, input: I, ctx: &WorkflowContext) -> Result<Vec<O>> {
        observed("Parallel", &self.name, ctx, async {
            let futures: Vec<_> = self
                .children
                .iter()
                .map(|child| {
                    let input = input.clone();
                    let child_ctx = ctx.child();
                    async move { child.execute(input, &child_ctx).await }
                })
                .collect();

            futures::future::try_join_all(futures).await
        })
        .await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
