//! Adaptive timeout: learns per-context bounds from successful latencies.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{percentile, AdaptiveConfig, AdaptiveStats, LearningStrategy, StrategyEngine};
use crate::context::WorkflowContext;
use crate::error::{Error, Result};
use crate::observability::observed;
use crate::primitive::{Primitive, SharedPrimitive};
use crate::store::StrategyStore;

const LATENCY_SAMPLE_CAP: usize = 256;
const MIN_TIMEOUT_MS: f64 = 10.0;

/// Per-context latency digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutContextStats {
    pub samples: usize,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    /// Timeout the current strategy applies for this context
    pub effective_timeout_ms: f64,
}

/// Read-only statistics for [`AdaptiveTimeout`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutStats {
    pub contexts: HashMap<String, TimeoutContextStats>,
    pub adaptive: AdaptiveStats,
}

/// Timeout whose bound is learned per context.
///
/// Successful-latency samples feed a percentile estimate; the learned bound
/// is that percentile times a buffer factor.
pub struct AdaptiveTimeout<I, O> {
    inner: SharedPrimitive<I, O>,
    engine: StrategyEngine,
    samples: Mutex<HashMap<String, VecDeque<f64>>>,
    name: String,
}

impl<I, O> AdaptiveTimeout<I, O>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
{
    pub fn new<P>(inner: P, config: AdaptiveConfig) -> Self
    where
        P: Primitive<I, O> + 'static,
    {
        Self::with_baseline(inner, Duration::from_secs(5), 95.0, 1.5, config)
    }

    /// Build with explicit baseline timeout, percentile target, and buffer.
    pub fn with_baseline<P>(
        inner: P,
        baseline_timeout: Duration,
        percentile_target: f64,
        buffer_factor: f64,
        config: AdaptiveConfig,
    ) -> Self
    where
        P: Primitive<I, O> + 'static,
    {
        let mut params = HashMap::new();
        params.insert(
            "timeout_ms".to_string(),
            Value::from(baseline_timeout.as_secs_f64() * 1000.0),
        );
        params.insert(
            "percentile_target".to_string(),
            Value::from(percentile_target),
        );
        params.insert("buffer_factor".to_string(), Value::from(buffer_factor));
        let baseline_strategy =
            LearningStrategy::new("baseline", "Conservative timeout bound", "", params);

        Self {
            inner: Arc::new(inner),
            engine: StrategyEngine::new("AdaptiveTimeout", baseline_strategy, config),
            samples: Mutex::new(HashMap::new()),
            name: "AdaptiveTimeout".to_string(),
        }
    }

    /// Attach a durability bridge.
    pub fn with_store(mut self, store: Arc<dyn StrategyStore>) -> Self {
        self.engine = self.engine.with_store(store);
        self
    }

    /// Load persisted strategies.
    pub async fn hydrate(&self) -> Result<usize> {
        self.engine.hydrate().await
    }

    pub fn stats(&self) -> AdaptiveStats {
        self.engine.stats()
    }

    /// Statistics surface.
    pub fn timeout_stats(&self) -> TimeoutStats {
        let contexts = self
            .samples
            .lock()
            .map(|samples| {
                samples
                    .iter()
                    .filter_map(|(key, window)| {
                        let p50 = percentile(window.iter().copied(), 50.0)?;
                        let p95 = percentile(window.iter().copied(), 95.0)?;
                        let p99 = percentile(window.iter().copied(), 99.0)?;
                        let strategy = self.engine.incumbent(key);
                        Some((
                            key.clone(),
                            TimeoutContextStats {
                                samples: window.len(),
                                p50_ms: p50,
                                p95_ms: p95,
                                p99_ms: p99,
                                effective_timeout_ms: strategy.param_f64("timeout_ms", 5000.0),
                            },
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();

        TimeoutStats {
            contexts,
            adaptive: self.engine.stats(),
        }
    }

    fn note_latency(&self, context_key: &str, latency_ms: f64) {
        if let Ok(mut samples) = self.samples.lock() {
            let window = samples.entry(context_key.to_string()).or_default();
            window.push_back(latency_ms);
            while window.len() > LATENCY_SAMPLE_CAP {
                window.pop_front();
            }
        }
    }

    fn consider_new_strategy(
        &self,
        context_key: &str,
        current: &LearningStrategy,
    ) -> Option<LearningStrategy> {
        let target = current.param_f64("percentile_target", 95.0);
        let buffer = current.param_f64("buffer_factor", 1.5);

        let observed_percentile = {
            let samples = self.samples.lock().ok()?;
            percentile(samples.get(context_key)?.iter().copied(), target)?
        };

        let learned_timeout = (observed_percentile * buffer).max(MIN_TIMEOUT_MS);
        let current_timeout = current.param_f64("timeout_ms", 5000.0);
        if (learned_timeout - current_timeout).abs() / current_timeout.max(1.0) < 0.1 {
            return None;
        }

        let mut params = current.parameters.clone();
        params.insert("timeout_ms".to_string(), Value::from(learned_timeout));

        let name = format!(
            "{context_key}_optimized_v{}",
            self.engine.strategy_count() + 1
        );
        Some(LearningStrategy::new(
            name,
            format!("Learned p{target:.0} x {buffer} timeout for {context_key}"),
            context_key,
            params,
        ))
    }
}

#[async_trait]
impl<I, O> Primitive<I, O> for AdaptiveTimeout<I, O>
where
    I: Send + Sync + 'static,
    O: Send + 'static,
{
    async fn execute(&self, input: I, ctx: &WorkflowContext) -> Result<O> {
        observed("AdaptiveTimeout", &self.name, ctx, async {
            let context_key = ctx.metadata.environment_key().to_string();
            let strategy = self.engine.select(&context_key);
            let timeout_ms = strategy.param_f64("timeout_ms", 5000.0).max(MIN_TIMEOUT_MS);
            let bound = Duration::from_secs_f64(timeout_ms / 1000.0);

            let started = Instant::now();
            let outcome = match tokio::time::timeout(bound, self.inner.execute(input, ctx)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(
                        primitive = %self.name,
                        strategy = %strategy.name,
                        timeout_ms = timeout_ms,
                        context = %context_key,
                        "adaptive timeout exceeded",
                    );
                    Err(Error::timeout(timeout_ms as u64))
                }
            };
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            if outcome.is_ok() {
                self.note_latency(&context_key, latency_ms);
            }
            self.engine
                .record_outcome(&strategy.name, &context_key, outcome.is_ok(), latency_ms, ctx)
                .await;

            if self.engine.should_learn() {
                let incumbent = self.engine.incumbent(&context_key);
                if let Some(candidate) = self.consider_new_strategy(&context_key, &incumbent) {
                    self.engine
                        .propose(
                            candidate,
                            &context_key,
                            Some("derived from successful-latency percentiles".to_string()),
                            ctx,
                        )
                        .await;
                }
            }

            outcome
        })
        .await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
