//! Runtime branching on a predicate.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Primitive, SharedPrimitive};
use crate::context::WorkflowContext;
use crate::error::Result;
use crate::observability::observed;

type Predicate<I> = Arc<dyn Fn(&I, &WorkflowContext) -> bool + Send + Sync>;

/// Executes exactly one of two branches depending on the predicate.
pub struct Conditional<I, O> {
    predicate: Predicate<I>,
    if_true: SharedPrimitive<I, O>,
    if_false: SharedPrimitive<I, O>,
    name: String,
}

impl<I, O> Conditional<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new<F, PT, PF>(predicate: F, if_true: PT, if_false: PF) -> Self
    where
        F: Fn(&I, &WorkflowContext) -> bool + Send + Sync + 'static,
        PT: Primitive<I, O> + 'static,
        PF: Primitive<I, O> + 'static,
    {
        let name = format!("Conditional({} | {})", if_true.name(), if_false.name());
        Self {
            predicate: Arc::new(predicate),
            if_true: Arc::new(if_true),
            if_false: Arc::new(if_false),
            name,
        }
    }

    /// Set a custom name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl<I, O> Primitive<I, O> for Conditional<I, O>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
{
    async fn execute(&self, input: I, ctx: &WorkflowContext) -> Result<O> {
        observed("Conditional", &self.name, ctx, async {
            let branch = if (self.predicate)(&input, ctx) {
                &self.if_true
            } else {
                &self.if_false
            };
            branch.execute(input, ctx).await
        })
        .await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
