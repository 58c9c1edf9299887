//! Circuit breaker over repeated failures.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::context::WorkflowContext;
use crate::error::{Error, Result};
use crate::observability::{emit, observed, WorkflowEvent, WorkflowEventType};
use crate::primitive::{Primitive, SharedPrimitive};

/// Configuration for [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Consecutive probe successes before a half-open circuit closes
    pub success_threshold: u32,
    /// How long the circuit stays open before allowing a probe
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            open_duration: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }
}

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Traffic flows normally
    Closed,
    /// Traffic is rejected without calling the child
    Open,
    /// A single probe is allowed through
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Rejects traffic fast after repeated child failures.
///
/// Closed -> Open at `failure_threshold` consecutive failures; Open ->
/// HalfOpen after `open_duration`; HalfOpen -> Closed on probe success and
/// back to Open on probe failure. While open, callers get
/// [`Error::CircuitOpen`] without the child being invoked.
pub struct CircuitBreaker<I, O> {
    inner: SharedPrimitive<I, O>,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    name: String,
}

impl<I, O> CircuitBreaker<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new<P>(inner: P, config: CircuitBreakerConfig) -> Self
    where
        P: Primitive<I, O> + 'static,
    {
        let name = format!("CircuitBreaker({})", inner.name());
        Self {
            inner: Arc::new(inner),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            name,
        }
    }

    /// Set a custom name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Current state snapshot.
    pub fn state(&self) -> CircuitState {
        self.state.lock().map(|s| s.state).unwrap_or(CircuitState::Closed)
    }

    /// Decide whether this call may proceed; transitions Open -> HalfOpen
    /// when the open window has elapsed.
    fn admit(&self, ctx: &WorkflowContext) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Internal("circuit breaker lock poisoned".into()))?;

        match state.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.open_duration {
                    state.state = CircuitState::HalfOpen;
                    state.probe_in_flight = true;
                    tracing::info!(primitive = %self.name, "circuit half-open, probing");
                    emit(WorkflowEvent::new(
                        WorkflowEventType::CircuitHalfOpen,
                        &self.name,
                        ctx,
                    ));
                    Ok(())
                } else {
                    let retry_after = self.config.open_duration - elapsed;
                    Err(Error::CircuitOpen {
                        consecutive_failures: state.consecutive_failures,
                        retry_after_ms: retry_after.as_millis() as u64,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    Err(Error::CircuitOpen {
                        consecutive_failures: state.consecutive_failures,
                        retry_after_ms: 0,
                    })
                } else {
                    state.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn record(&self, success: bool, ctx: &WorkflowContext) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.probe_in_flight = false;

        if success {
            state.consecutive_failures = 0;
            state.consecutive_successes += 1;
            if state.state == CircuitState::HalfOpen
                && state.consecutive_successes >= self.config.success_threshold
            {
                state.state = CircuitState::Closed;
                state.opened_at = None;
                tracing::info!(primitive = %self.name, "circuit closed");
                emit(WorkflowEvent::new(
                    WorkflowEventType::CircuitClosed,
                    &self.name,
                    ctx,
                ));
            }
        } else {
            state.consecutive_successes = 0;
            state.consecutive_failures += 1;
            let should_open = state.state == CircuitState::HalfOpen
                || (state.state == CircuitState::Closed
                    && state.consecutive_failures >= self.config.failure_threshold);
            if should_open {
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                tracing::warn!(
                    primitive = %self.name,
                    consecutive_failures = state.consecutive_failures,
                    "circuit opened",
                );
                emit(
                    WorkflowEvent::new(WorkflowEventType::CircuitOpened, &self.name, ctx)
                        .with_metadata("consecutive_failures", state.consecutive_failures),
                );
            }
        }
    }
}

#[async_trait]
impl<I, O> Primitive<I, O> for CircuitBreaker<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    async fn execute(&self, input: I, ctx: &WorkflowContext) -> Result<O> {
        observed("CircuitBreaker", &self.name, ctx, async {
            self.admit(ctx)?;
            let result = self.inner.execute(input, ctx).await;
            self.record(result.is_ok(), ctx);
            result
        })
        .await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
