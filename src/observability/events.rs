//! Structured event types for observable workflow execution.
//!
//! Every primitive emits events around its execute call; resilience
//! primitives add their own (retry attempts, cache hits, circuit
//! transitions, compensation outcomes). Events can be rendered as logs,
//! exported for replay, or collected in tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, RwLock};

use crate::context::WorkflowContext;

/// Types of events emitted during workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowEventType {
    /// A primitive began executing
    ExecuteStart,
    /// A primitive finished successfully
    ExecuteSuccess,
    /// A primitive failed
    ExecuteFailed,
    /// A retry attempt is about to run
    RetryAttempt,
    /// All retry attempts were consumed
    RetryExhausted,
    /// Cache lookup hit
    CacheHit,
    /// Cache lookup missed
    CacheMiss,
    /// A fallback is being attempted
    FallbackAttempt,
    /// A fallback produced the result
    FallbackSuccess,
    /// Circuit breaker transitioned to open
    CircuitOpened,
    /// Circuit breaker allows a probe
    CircuitHalfOpen,
    /// Circuit breaker closed again
    CircuitClosed,
    /// Saga compensation was triggered by a forward failure
    SagaCompensationTriggered,
    /// Saga compensation completed
    SagaCompensationSuccess,
    /// Saga compensation itself failed
    SagaCompensationFailed,
    /// A learned strategy was adopted into the registry
    StrategyAdopted,
    /// A learned strategy was demoted after underperforming
    StrategyDemoted,
}

impl std::fmt::Display for WorkflowEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ExecuteStart => "EXECUTE_START",
            Self::ExecuteSuccess => "EXECUTE_SUCCESS",
            Self::ExecuteFailed => "EXECUTE_FAILED",
            Self::RetryAttempt => "RETRY_ATTEMPT",
            Self::RetryExhausted => "RETRY_EXHAUSTED",
            Self::CacheHit => "CACHE_HIT",
            Self::CacheMiss => "CACHE_MISS",
            Self::FallbackAttempt => "FALLBACK_ATTEMPT",
            Self::FallbackSuccess => "FALLBACK_SUCCESS",
            Self::CircuitOpened => "CIRCUIT_OPENED",
            Self::CircuitHalfOpen => "CIRCUIT_HALF_OPEN",
            Self::CircuitClosed => "CIRCUIT_CLOSED",
            Self::SagaCompensationTriggered => "SAGA_COMPENSATION_TRIGGERED",
            Self::SagaCompensationSuccess => "SAGA_COMPENSATION_SUCCESS",
            Self::SagaCompensationFailed => "SAGA_COMPENSATION_FAILED",
            Self::StrategyAdopted => "STRATEGY_ADOPTED",
            Self::StrategyDemoted => "STRATEGY_DEMOTED",
        };
        write!(f, "{}", s)
    }
}

/// An event emitted during workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Type of the event
    pub event_type: WorkflowEventType,
    /// Name of the primitive that emitted the event
    pub primitive: String,
    /// Correlation ID of the request being handled
    pub correlation_id: String,
    /// Workflow ID, if assigned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Event-specific metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
}

impl WorkflowEvent {
    /// Create a new event for the given primitive and context.
    pub fn new(
        event_type: WorkflowEventType,
        primitive: impl Into<String>,
        ctx: &WorkflowContext,
    ) -> Self {
        Self {
            event_type,
            primitive: primitive.into(),
            correlation_id: ctx.correlation_id.clone(),
            workflow_id: ctx.workflow_id.clone(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    /// Add a metadata entry to the event.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Get a metadata value.
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref()?.get(key)
    }

    // Convenience constructors for common event types

    pub fn execute_start(primitive: &str, ctx: &WorkflowContext) -> Self {
        Self::new(WorkflowEventType::ExecuteStart, primitive, ctx)
    }

    pub fn execute_success(primitive: &str, ctx: &WorkflowContext, duration_ms: f64) -> Self {
        Self::new(WorkflowEventType::ExecuteSuccess, primitive, ctx)
            .with_metadata("duration_ms", duration_ms)
    }

    pub fn execute_failed(primitive: &str, ctx: &WorkflowContext, error: &str) -> Self {
        Self::new(WorkflowEventType::ExecuteFailed, primitive, ctx).with_metadata("error", error)
    }

    pub fn retry_attempt(primitive: &str, ctx: &WorkflowContext, attempt: u32, delay_ms: u64) -> Self {
        Self::new(WorkflowEventType::RetryAttempt, primitive, ctx)
            .with_metadata("attempt", attempt)
            .with_metadata("delay_ms", delay_ms as i64)
    }

    pub fn cache_hit(primitive: &str, ctx: &WorkflowContext, key: &str) -> Self {
        Self::new(WorkflowEventType::CacheHit, primitive, ctx).with_metadata("key", key)
    }

    pub fn cache_miss(primitive: &str, ctx: &WorkflowContext, key: &str) -> Self {
        Self::new(WorkflowEventType::CacheMiss, primitive, ctx).with_metadata("key", key)
    }

    pub fn fallback_attempt(primitive: &str, ctx: &WorkflowContext, fallback: &str) -> Self {
        Self::new(WorkflowEventType::FallbackAttempt, primitive, ctx)
            .with_metadata("fallback", fallback)
    }

    /// Format as a single-line log entry.
    pub fn as_log_line(&self) -> String {
        format!(
            "[{}] {} {} corr={}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.event_type,
            self.primitive,
            &self.correlation_id[..self.correlation_id.len().min(8)],
        )
    }
}

/// Export format for event data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// JSON Lines format (one event per line)
    JsonLines,
    /// Pretty-printed JSON array
    JsonPretty,
    /// Markdown summary
    Markdown,
}

/// Serialize a list of events to the specified format.
pub fn export_events(events: &[WorkflowEvent], format: ExportFormat) -> String {
    match format {
        ExportFormat::JsonLines => events
            .iter()
            .filter_map(|e| serde_json::to_string(e).ok())
            .collect::<Vec<_>>()
            .join("\n"),
        ExportFormat::JsonPretty => {
            serde_json::to_string_pretty(events).unwrap_or_else(|_| "[]".to_string())
        }
        ExportFormat::Markdown => {
            let mut md = String::from("# Workflow events\n\n");
            for event in events {
                md.push_str(&format!(
                    "- **{}** `{}` at {}\n",
                    event.event_type, event.primitive, event.timestamp
                ));
            }
            md
        }
    }
}

/// Sink receiving every emitted event.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: WorkflowEvent);
}

/// Sink that keeps events in memory, for tests and post-hoc analysis.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl CollectingSink {
    /// Install a process-wide collecting sink, returning the shared handle.
    ///
    /// Repeated calls return the same sink, so concurrent tests can filter
    /// the shared stream by correlation ID.
    pub fn install() -> &'static CollectingSink {
        static SHARED: OnceLock<&'static CollectingSink> = OnceLock::new();
        SHARED.get_or_init(|| {
            let sink: &'static CollectingSink = Box::leak(Box::new(CollectingSink::default()));
            set_event_sink(sink);
            sink
        })
    }

    /// All events collected so far.
    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events for one request, in emission order.
    pub fn events_for(&self, correlation_id: &str) -> Vec<WorkflowEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.correlation_id == correlation_id)
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: WorkflowEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

static EVENT_SINK: RwLock<Option<&'static dyn EventSink>> = RwLock::new(None);

/// Install a process-wide event sink. Absent a sink, events degrade to
/// `tracing` output only.
pub fn set_event_sink(sink: &'static dyn EventSink) {
    if let Ok(mut slot) = EVENT_SINK.write() {
        *slot = Some(sink);
    }
}

/// Emit an event to the installed sink (if any) and to `tracing`.
pub fn emit(event: WorkflowEvent) {
    tracing::debug!(
        event = %event.event_type,
        primitive = %event.primitive,
        correlation_id = %event.correlation_id,
        "workflow event",
    );
    if let Ok(slot) = EVENT_SINK.read() {
        if let Some(sink) = *slot {
            sink.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let ctx = WorkflowContext::new().with_workflow_id("wf-1");
        let event = WorkflowEvent::execute_start("Retry", &ctx);
        assert_eq!(event.event_type, WorkflowEventType::ExecuteStart);
        assert_eq!(event.primitive, "Retry");
        assert_eq!(event.correlation_id, ctx.correlation_id);
        assert_eq!(event.workflow_id.as_deref(), Some("wf-1"));
    }

    #[test]
    fn test_event_metadata() {
        let ctx = WorkflowContext::new();
        let event = WorkflowEvent::retry_attempt("Retry", &ctx, 2, 20);
        assert_eq!(event.get_metadata("attempt"), Some(&Value::from(2)));
        assert_eq!(event.get_metadata("delay_ms"), Some(&Value::from(20)));
    }

    #[test]
    fn test_export_json_lines() {
        let ctx = WorkflowContext::new();
        let events = vec![
            WorkflowEvent::execute_start("A", &ctx),
            WorkflowEvent::execute_success("A", &ctx, 1.5),
        ];
        let exported = export_events(&events, ExportFormat::JsonLines);
        assert_eq!(exported.lines().count(), 2);
    }

    #[test]
    fn test_collecting_sink_filters_by_correlation() {
        let sink = CollectingSink::default();
        let a = WorkflowContext::new();
        let b = WorkflowContext::new();
        sink.emit(WorkflowEvent::execute_start("P", &a));
        sink.emit(WorkflowEvent::execute_start("P", &b));
        sink.emit(WorkflowEvent::execute_success("P", &a, 1.0));

        let for_a = sink.events_for(&a.correlation_id);
        assert_eq!(for_a.len(), 2);
        assert_eq!(for_a[0].event_type, WorkflowEventType::ExecuteStart);
        assert_eq!(for_a[1].event_type, WorkflowEventType::ExecuteSuccess);
    }

    #[test]
    fn test_log_line_format() {
        let ctx = WorkflowContext::new();
        let event = WorkflowEvent::cache_hit("Cache", &ctx, "k1");
        let line = event.as_log_line();
        assert!(line.contains("CACHE_HIT"));
        assert!(line.contains("Cache"));
    }
}
