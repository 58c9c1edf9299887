//! Workflow context: correlation, tracing, baggage, and timing.
//!
//! A [`WorkflowContext`] is created at request entry and flows through every
//! primitive handling that request. Cloning is cheap; the mutable state bag
//! and checkpoint list are shared between clones, while [`WorkflowContext::child`]
//! produces an independent context for nested work.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Typed metadata recognised by the adaptive layer, plus a free-form bag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextMeta {
    /// Deployment environment, the adaptive strategy selection key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// Request priority hint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// Whether the request is latency-sensitive
    #[serde(default)]
    pub time_sensitive: bool,
    /// Anything else, propagated verbatim
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl ContextMeta {
    /// The strategy selection key; `"default"` when no environment is set.
    pub fn environment_key(&self) -> &str {
        self.environment.as_deref().unwrap_or("default")
    }
}

/// A named timing checkpoint recorded against a context.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub name: String,
    /// Offset from context creation, in milliseconds.
    pub offset_ms: f64,
}

/// Context passed through workflow execution.
///
/// Carries correlation/causation IDs, W3C trace context fields, baggage and
/// tags for cross-service propagation, a per-request state bag, and timing
/// checkpoints.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    /// Workflow identifier, if the host assigns one
    pub workflow_id: Option<String>,
    /// Session identifier
    pub session_id: Option<String>,
    /// Player/user identifier
    pub player_id: Option<String>,

    /// Unique per top-level request
    pub correlation_id: String,
    /// Correlation of the upstream event that caused this request
    pub causation_id: Option<String>,

    /// W3C trace ID (32 hex chars)
    pub trace_id: String,
    /// Current span ID (16 hex chars)
    pub span_id: String,
    /// Parent span ID
    pub parent_span_id: Option<String>,
    /// W3C trace flags (sampled = 1)
    pub trace_flags: u8,

    /// Cross-service baggage, propagated to children
    pub baggage: HashMap<String, String>,
    /// Tags for filtering and grouping
    pub tags: HashMap<String, String>,
    /// Typed metadata used for adaptive strategy selection
    pub metadata: ContextMeta,

    state: Arc<RwLock<HashMap<String, Value>>>,
    start_time: Instant,
    checkpoints: Arc<Mutex<Vec<(String, Instant)>>>,
}

impl WorkflowContext {
    /// Create a fresh root context with generated correlation and trace IDs.
    pub fn new() -> Self {
        let trace = Uuid::new_v4().simple().to_string();
        Self {
            workflow_id: None,
            session_id: None,
            player_id: None,
            correlation_id: Uuid::new_v4().to_string(),
            causation_id: None,
            span_id: trace[..16].to_string(),
            trace_id: trace,
            parent_span_id: None,
            trace_flags: 1,
            baggage: HashMap::new(),
            tags: HashMap::new(),
            metadata: ContextMeta::default(),
            state: Arc::new(RwLock::new(HashMap::new())),
            start_time: Instant::now(),
            checkpoints: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Set the workflow ID.
    pub fn with_workflow_id(mut self, id: impl Into<String>) -> Self {
        self.workflow_id = Some(id.into());
        self
    }

    /// Set the session ID.
    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// Set the environment used as the adaptive selection key.
    pub fn with_environment(mut self, env: impl Into<String>) -> Self {
        self.metadata.environment = Some(env.into());
        self
    }

    /// Add a baggage entry.
    pub fn with_baggage(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.baggage.insert(key.into(), value.into());
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Create a child context for nested work.
    ///
    /// Inherits trace and correlation IDs; the current span becomes the
    /// parent span and the correlation becomes the child's causation.
    /// Baggage, tags, metadata, and state are deep-copied so mutations in
    /// the child never leak back.
    pub fn child(&self) -> Self {
        let state_copy = self
            .state
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();
        Self {
            workflow_id: self.workflow_id.clone(),
            session_id: self.session_id.clone(),
            player_id: self.player_id.clone(),
            correlation_id: self.correlation_id.clone(),
            causation_id: Some(self.correlation_id.clone()),
            trace_id: self.trace_id.clone(),
            span_id: Uuid::new_v4().simple().to_string()[..16].to_string(),
            parent_span_id: Some(self.span_id.clone()),
            trace_flags: self.trace_flags,
            baggage: self.baggage.clone(),
            tags: self.tags.clone(),
            metadata: self.metadata.clone(),
            state: Arc::new(RwLock::new(state_copy)),
            start_time: self.start_time,
            checkpoints: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Record a named timing checkpoint.
    ///
    /// The checkpoint is also emitted as an event on the span active at the
    /// call site, so trace backends see primitive-recorded checkpoints.
    pub fn checkpoint(&self, name: impl Into<String>) {
        let name = name.into();
        let now = Instant::now();
        tracing::debug!(
            checkpoint = %name,
            offset_ms = now.duration_since(self.start_time).as_secs_f64() * 1000.0,
            correlation_id = %self.correlation_id,
            "checkpoint recorded",
        );
        if let Ok(mut cps) = self.checkpoints.lock() {
            cps.push((name, now));
        }
    }

    /// Checkpoints recorded so far, as offsets from context creation.
    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints
            .lock()
            .map(|cps| {
                cps.iter()
                    .map(|(name, at)| Checkpoint {
                        name: name.clone(),
                        offset_ms: at.duration_since(self.start_time).as_secs_f64() * 1000.0,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Elapsed time since context creation in milliseconds.
    pub fn elapsed_ms(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64() * 1000.0
    }

    /// Write a value into the per-request state bag.
    pub fn set_state(&self, key: impl Into<String>, value: impl Into<Value>) {
        if let Ok(mut state) = self.state.write() {
            state.insert(key.into(), value.into());
        }
    }

    /// Read a value from the per-request state bag.
    pub fn get_state(&self, key: &str) -> Option<Value> {
        self.state.read().ok()?.get(key).cloned()
    }

    /// Attributes suitable for tagging observability spans.
    pub fn to_trace_attrs(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        attrs.insert(
            "workflow.id".to_string(),
            self.workflow_id.clone().unwrap_or_else(|| "unknown".into()),
        );
        attrs.insert(
            "workflow.session_id".to_string(),
            self.session_id.clone().unwrap_or_else(|| "unknown".into()),
        );
        attrs.insert(
            "workflow.correlation_id".to_string(),
            self.correlation_id.clone(),
        );
        attrs.insert("trace.id".to_string(), self.trace_id.clone());
        attrs.insert("span.id".to_string(), self.span_id.clone());
        if let Some(parent) = &self.parent_span_id {
            attrs.insert("span.parent_id".to_string(), parent.clone());
        }
        attrs.insert(
            "workflow.elapsed_ms".to_string(),
            format!("{:.1}", self.elapsed_ms()),
        );
        attrs
    }
}

impl Default for WorkflowContext {
    fn default() -> Self {
        Self::new()
    }
}
