//! Adaptive fallback: learns which fallback order works per context.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AdaptiveConfig, AdaptiveStats, LearningStrategy, StrategyEngine};
use crate::context::WorkflowContext;
use crate::error::Result;
use crate::observability::{emit, observed, WorkflowEvent, WorkflowEventType};
use crate::primitive::{Primitive, SharedPrimitive};
use crate::store::StrategyStore;

const LATENCY_SAMPLE_CAP: usize = 128;
const SUCCESS_WEIGHT: f64 = 0.7;
const LATENCY_WEIGHT: f64 = 0.3;
/// Minimum estimated success-rate gain before a reorder becomes a strategy.
const MIN_IMPROVEMENT: f64 = 0.05;

#[derive(Debug, Default)]
struct RouteTelemetry {
    attempts: u64,
    successes: u64,
    latencies_ms: VecDeque<f64>,
}

impl RouteTelemetry {
    fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    fn avg_latency_ms(&self) -> Option<f64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        Some(self.latencies_ms.iter().sum::<f64>() / self.latencies_ms.len() as f64)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ContextFallbackStats {
    primary_attempts: u64,
    primary_failures: u64,
    fallback_usage: HashMap<String, u64>,
    fallback_successes: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct FallbackTelemetry {
    primary_attempts: u64,
    primary_failures: u64,
    routes: HashMap<String, RouteTelemetry>,
    contexts: HashMap<String, ContextFallbackStats>,
}

/// Per-route statistics exposed by [`AdaptiveFallback::fallback_stats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackRouteStats {
    pub attempts: u64,
    pub successes: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
}

/// Read-only statistics for [`AdaptiveFallback`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackStats {
    pub primary_attempts: u64,
    pub primary_failures: u64,
    pub primary_failure_rate: f64,
    pub fallbacks: HashMap<String, FallbackRouteStats>,
    /// Routes ranked by observed success and latency, best first
    pub best_fallback_order: Vec<String>,
    pub adaptive: AdaptiveStats,
}

/// Fallback chain whose order is learned per context.
///
/// Each route's success rate and latency feed a score (70 % success, 30 %
/// inverse latency); a reorder is proposed as a new strategy when its
/// estimated success rate beats the current order's by at least 5 %.
pub struct AdaptiveFallback<I, O> {
    primary: SharedPrimitive<I, O>,
    fallbacks: Vec<(String, SharedPrimitive<I, O>)>,
    engine: StrategyEngine,
    telemetry: Mutex<FallbackTelemetry>,
    name: String,
}

impl<I, O> AdaptiveFallback<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    pub fn new<P>(primary: P, config: AdaptiveConfig) -> Self
    where
        P: Primitive<I, O> + 'static,
    {
        let mut params = HashMap::new();
        params.insert("fallback_order".to_string(), Value::Array(Vec::new()));
        params.insert("primary_timeout_ms".to_string(), Value::from(5000.0));
        params.insert("fallback_timeout_ms".to_string(), Value::from(10_000.0));
        let baseline = LearningStrategy::new("baseline", "Default fallback order", "", params);

        Self {
            primary: Arc::new(primary),
            fallbacks: Vec::new(),
            engine: StrategyEngine::new("AdaptiveFallback", baseline, config),
            telemetry: Mutex::new(FallbackTelemetry::default()),
            name: "AdaptiveFallback".to_string(),
        }
    }

    /// Register a named fallback. The baseline order is alphabetical unless
    /// [`Self::with_baseline_order`] overrides it.
    pub fn fallback<P>(mut self, name: impl Into<String>, primitive: P) -> Self
    where
        P: Primitive<I, O> + 'static,
    {
        self.fallbacks.push((name.into(), Arc::new(primitive)));
        let mut order: Vec<String> = self.fallbacks.iter().map(|(n, _)| n.clone()).collect();
        order.sort();
        self.set_baseline_order(order);
        self
    }

    /// Override the baseline fallback order.
    pub fn with_baseline_order(mut self, order: Vec<String>) -> Self {
        self.set_baseline_order(order);
        self
    }

    fn set_baseline_order(&mut self, order: Vec<String>) {
        if let Some(mut baseline) = self.engine.strategy("baseline") {
            baseline
                .parameters
                .insert("fallback_order".to_string(), Value::from(order));
            self.engine.replace_baseline(baseline);
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

    /// Statistics surface, including the currently best-scoring order.
    pub fn fallback_stats(&self) -> FallbackStats {
        let telemetry = self.telemetry.lock();
        let (primary_attempts, primary_failures, routes) = match &telemetry {
            Ok(t) => (
                t.primary_attempts,
                t.primary_failures,
                t.routes
                    .iter()
                    .map(|(name, route)| {
                        (
                            name.clone(),
                            FallbackRouteStats {
                                attempts: route.attempts,
                                successes: route.successes,
                                success_rate: route.success_rate(),
                                avg_latency_ms: route.avg_latency_ms().unwrap_or(0.0),
                            },
                        )
                    })
                    .collect::<HashMap<_, _>>(),
            ),
            Err(_) => (0, 0, HashMap::new()),
        };
        drop(telemetry);

        let mut scored: Vec<(f64, String)> = self
            .fallbacks
            .iter()
            .map(|(name, _)| {
                let stats = routes.get(name);
                let success_rate = stats.map(|s| s.success_rate).unwrap_or(0.0);
                let avg_latency = stats.map(|s| s.avg_latency_ms).unwrap_or(0.0);
                let latency_score = if avg_latency > 0.0 {
                    1.0 / (1.0 + avg_latency / 1000.0)
                } else {
                    1.0
                };
                (
                    success_rate * SUCCESS_WEIGHT + latency_score * LATENCY_WEIGHT,
                    name.clone(),
                )
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });

        FallbackStats {
            primary_attempts,
            primary_failures,
            primary_failure_rate: if primary_attempts == 0 {
                0.0
            } else {
                primary_failures as f64 / primary_attempts as f64
            },
            fallbacks: routes,
            best_fallback_order: scored.into_iter().map(|(_, name)| name).collect(),
            adaptive: self.engine.stats(),
        }
    }

    fn default_order(&self) -> Vec<String> {
        let mut order: Vec<String> = self.fallbacks.iter().map(|(n, _)| n.clone()).collect();
        order.sort();
        order
    }

    /// Estimated success rate of an order: position-weighted average of
    /// per-route success rates, earlier routes weighing more.
    fn estimate_order(&self, order: &[String], rates: &HashMap<String, f64>) -> f64 {
        let mut estimate = 0.0;
        let mut weight_sum = 0.0;
        for (i, name) in order.iter().enumerate() {
            let weight = 1.0 / (i + 1) as f64;
            estimate += rates.get(name).copied().unwrap_or(0.0) * weight;
            weight_sum += weight;
        }
        if weight_sum > 0.0 {
            estimate / weight_sum
        } else {
            0.0
        }
    }

    fn consider_new_strategy(
        &self,
        context_key: &str,
        current: &LearningStrategy,
    ) -> Option<LearningStrategy> {
        let telemetry = self.telemetry.lock().ok()?;

        let mut rates = HashMap::new();
        let mut latencies = HashMap::new();
        for (name, _) in &self.fallbacks {
            let route = telemetry.routes.get(name);
            rates.insert(name.clone(), route.map(|r| r.success_rate()).unwrap_or(0.0));
            latencies.insert(name.clone(), route.and_then(|r| r.avg_latency_ms()));
        }
        let primary_attempts = telemetry.primary_attempts;
        drop(telemetry);

        let mut scored: Vec<(f64, String)> = self
            .fallbacks
            .iter()
            .map(|(name, _)| {
                let success_rate = rates.get(name).copied().unwrap_or(0.0);
                let latency_score = match latencies.get(name).copied().flatten() {
                    Some(avg) => 1.0 / (1.0 + avg / 1000.0),
                    None => 0.0,
                };
                (
                    success_rate * SUCCESS_WEIGHT + latency_score * LATENCY_WEIGHT,
                    name.clone(),
                )
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });
        let optimal_order: Vec<String> = scored.into_iter().map(|(_, name)| name).collect();

        let current_order = current
            .param_str_list("fallback_order")
            .filter(|order| !order.is_empty())
            .unwrap_or_else(|| self.default_order());
        if optimal_order == current_order {
            return None;
        }

        let improvement =
            self.estimate_order(&optimal_order, &rates) - self.estimate_order(&current_order, &rates);
        if improvement < MIN_IMPROVEMENT {
            return None;
        }

        let name = format!(
            "{context_key}_optimized_v{}",
            self.engine.strategy_count() + 1
        );
        tracing::info!(
            primitive = %self.name,
            strategy = %name,
            context = context_key,
            ?optimal_order,
            improvement = improvement,
            "proposing reordered fallback chain",
        );

        let mut params = current.parameters.clone();
        params.insert(
            "fallback_order".to_string(),
            Value::from(optimal_order.clone()),
        );
        Some(LearningStrategy::new(
            name,
            format!(
                "Learned fallback order for {context_key} from {primary_attempts} observations"
            ),
            context_key,
            params,
        ))
    }

    fn note_primary(&self, context_key: &str, failed: bool) {
        if let Ok(mut telemetry) = self.telemetry.lock() {
            telemetry.primary_attempts += 1;
            let ctx_stats = telemetry.contexts.entry(context_key.to_string()).or_default();
            ctx_stats.primary_attempts += 1;
            if failed {
                telemetry.primary_failures += 1;
                if let Some(stats) = telemetry.contexts.get_mut(context_key) {
                    stats.primary_failures += 1;
                }
            }
        }
    }

    fn note_fallback(&self, context_key: &str, fallback: &str, success: bool, latency_ms: f64) {
        if let Ok(mut telemetry) = self.telemetry.lock() {
            let route = telemetry.routes.entry(fallback.to_string()).or_default();
            route.attempts += 1;
            if success {
                route.successes += 1;
                route.latencies_ms.push_back(latency_ms);
                while route.latencies_ms.len() > LATENCY_SAMPLE_CAP {
                    route.latencies_ms.pop_front();
                }
            }
            let ctx_stats = telemetry.contexts.entry(context_key.to_string()).or_default();
            *ctx_stats.fallback_usage.entry(fallback.to_string()).or_default() += 1;
            if success {
                *ctx_stats
                    .fallback_successes
                    .entry(fallback.to_string())
                    .or_default() += 1;
            }
        }
    }
}

#[async_trait]
impl<I, O> Primitive<I, O> for AdaptiveFallback<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    async fn execute(&self, input: I, ctx: &WorkflowContext) -> Result<O> {
        observed("AdaptiveFallback", &self.name, ctx, async {
            let context_key = ctx.metadata.environment_key().to_string();
            let strategy = self.engine.select(&context_key);
            let order = strategy
                .param_str_list("fallback_order")
                .filter(|order| !order.is_empty())
                .unwrap_or_else(|| self.default_order());

            let started = Instant::now();
            let outcome = 'exec: {
                match self.primary.execute(input.clone(), ctx).await {
                    Ok(output) => {
                        self.note_primary(&context_key, false);
                        break 'exec Ok(output);
                    }
                    Err(primary_error) => {
                        self.note_primary(&context_key, true);
                        tracing::warn!(
                            primitive = %self.name,
                            strategy = %strategy.name,
                            context = %context_key,
                            error = %primary_error,
                            "primary failed, walking fallback order",
                        );

                        let mut last_error = primary_error;
                        for wanted in &order {
                            let Some((fb_name, fallback)) =
                                self.fallbacks.iter().find(|(n, _)| n == wanted)
                            else {
                                tracing::warn!(
                                    primitive = %self.name,
                                    fallback = %wanted,
                                    "unknown fallback in learned order, skipping",
                                );
                                continue;
                            };

                            emit(WorkflowEvent::fallback_attempt(&self.name, ctx, fb_name));
                            let attempt_start = Instant::now();
                            match fallback.execute(input.clone(), ctx).await {
                                Ok(output) => {
                                    let latency_ms =
                                        attempt_start.elapsed().as_secs_f64() * 1000.0;
                                    self.note_fallback(&context_key, fb_name, true, latency_ms);
                                    emit(
                                        WorkflowEvent::new(
                                            WorkflowEventType::FallbackSuccess,
                                            &self.name,
                                            ctx,
                                        )
                                        .with_metadata("fallback", fb_name.as_str()),
                                    );
                                    break 'exec Ok(output);
                                }
                                Err(error) => {
                                    let latency_ms =
                                        attempt_start.elapsed().as_secs_f64() * 1000.0;
                                    self.note_fallback(&context_key, fb_name, false, latency_ms);
                                    tracing::warn!(
                                        primitive = %self.name,
                                        fallback = %fb_name,
                                        error = %error,
                                        "fallback failed, trying next",
                                    );
                                    last_error = error;
                                }
                            }
                        }
                        break 'exec Err(last_error);
                    }
                }
            };
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

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
                            Some("derived from per-fallback success rates".to_string()),
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
