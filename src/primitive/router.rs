//! Keyed routing: a selector picks which child handles the input.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Primitive, SharedPrimitive};
use crate::context::WorkflowContext;
use crate::error::{Error, Result};
use crate::observability::observed;

type Selector<I> = Arc<dyn Fn(&I, &WorkflowContext) -> String + Send + Sync>;

/// Delegates to the route whose key the selector returns.
///
/// An unknown key falls through to the default route when one is
/// configured, and fails with a routing error otherwise.
pub struct Router<I, O> {
    selector: Selector<I>,
    routes: HashMap<String, SharedPrimitive<I, O>>,
    default: Option<SharedPrimitive<I, O>>,
    name: String,
}

impl<I, O> Router<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new<F>(selector: F) -> Self
    where
        F: Fn(&I, &WorkflowContext) -> String + Send + Sync + 'static,
    {
        Self {
            selector: Arc::new(selector),
            routes: HashMap::new(),
            default: None,
            name: "Router".to_string(),
        }
    }

    /// Register a route for a key.
    pub fn route<P>(mut self, key: impl Into<String>, primitive: P) -> Self
    where
        P: Primitive<I, O> + 'static,
    {
        self.routes.insert(key.into(), Arc::new(primitive));
        self
    }

    /// Register the default route for unmatched keys.
    pub fn default_route<P>(mut self, primitive: P) -> Self
    where
        P: Primitive<I, O> + 'static,
    {
        self.default = Some(Arc::new(primitive));
        self
    }

    /// Set a custom name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Registered route keys.
    pub fn keys(&self) -> Vec<&str> {
        self.routes.keys().map(String::as_str).collect()
    }
}

#[async_trait]
impl<I, O> Primitive<I, O> for Router<I, O>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
{
    async fn execute(&self, input: I, ctx: &WorkflowContext) -> Result<O> {
        observed("Router", &self.name, ctx, async {
            let key = (self.selector)(&input, ctx);
            let target = self
                .routes
                .get(&key)
                .or(self.default.as_ref())
                .ok_or_else(|| Error::routing(&key))?;
            tracing::debug!(
                router = %self.name,
                key = %key,
                target = target.name(),
                "routing input",
            );
            target.execute(input, ctx).await
        })
        .await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
