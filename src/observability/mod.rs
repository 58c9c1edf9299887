//! Observability: structured events, metrics rollups, span instrumentation.

mod events;
mod instrument;
mod metrics;

pub use events::{
    emit, export_events, set_event_sink, CollectingSink, EventSink, ExportFormat, WorkflowEvent,
    WorkflowEventType,
};
pub use instrument::{observed, Instrumented};
pub use metrics::{
    metrics_collector, set_metrics_collector, InMemoryMetricsCollector, MetricsCollector,
    NoopMetricsCollector, PrimitiveMetrics,
};
