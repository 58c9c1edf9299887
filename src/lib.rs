//! # workflow-core
//!
//! A composable, observable, fail-tolerant execution core for AI/LLM
//! workflow pipelines.
//!
//! ## Core Components
//!
//! - **Context**: per-request envelope with correlation, trace propagation,
//!   baggage, and timing checkpoints
//! - **Primitive**: single async unit `execute(input, &ctx)`, composed with
//!   `then` (sequence) and `par` (parallel fan-out)
//! - **Resilience**: retry, timeout, cache, fallback, circuit breaker, saga
//! - **Adaptive**: primitives that learn per-context strategy parameters
//!   from execution telemetry
//! - **Store**: optional durability bridge persisting learned strategies
//!
//! ## Example
//!
//! ```rust,ignore
//! use workflow_core::{
//!     Lambda, PrimitiveExt, Retry, RetryConfig, WorkflowContext,
//! };
//!
//! let fetch = Lambda::new("fetch", |url: String, _ctx| async move {
//!     call_backend(&url).await
//! });
//! let resilient = Retry::new(fetch, RetryConfig::default());
//!
//! let ctx = WorkflowContext::new().with_environment("production");
//! let body = resilient.execute("https://example".into(), &ctx).await?;
//! ```

pub mod adaptive;
pub mod context;
pub mod error;
pub mod observability;
pub mod primitive;
pub mod resilience;
pub mod store;

// Re-exports for convenience
pub use adaptive::{
    AdaptiveCache, AdaptiveCacheStats, AdaptiveConfig, AdaptiveFallback, AdaptiveRetry,
    AdaptiveStats, AdaptiveTimeout, ContextRollup, FallbackRouteStats, FallbackStats,
    LearningMode, LearningStrategy, RetryStats, ScoreWeights, StrategyEngine, StrategyMetrics,
    TimeoutContextStats, TimeoutStats,
};
pub use context::{Checkpoint, ContextMeta, WorkflowContext};
pub use error::{Error, Result};
pub use observability::{
    emit, export_events, metrics_collector, set_event_sink, set_metrics_collector, CollectingSink,
    EventSink, ExportFormat, InMemoryMetricsCollector, Instrumented, MetricsCollector,
    NoopMetricsCollector, PrimitiveMetrics, WorkflowEvent, WorkflowEventType,
};
pub use primitive::{
    Conditional, Lambda, Parallel, Primitive, PrimitiveExt, Router, Sequential, SharedPrimitive,
};
pub use resilience::{
    content_key, Cache, CacheConfig, CacheKeyFn, CacheStats, CircuitBreaker,
    CircuitBreakerConfig, CircuitState, Fallback, Retry, RetryConfig, Saga, Timeout,
};
#[cfg(feature = "sqlite-store")]
pub use store::SqliteStrategyStore;
pub use store::{JournalEntry, StrategyStore};
