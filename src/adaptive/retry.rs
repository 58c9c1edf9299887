//! Adaptive retry: learns per-context retry parameters.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{median, AdaptiveConfig, AdaptiveStats, LearningStrategy, StrategyEngine};
use crate::context::WorkflowContext;
use crate::error::Result;
use crate::observability::{emit, observed, WorkflowEvent};
use crate::primitive::{Primitive, SharedPrimitive};
use crate::resilience::RetryConfig;
use crate::store::StrategyStore;

const GAP_SAMPLE_CAP: usize = 128;
/// Share of successes the learned attempt budget must cover.
const ATTEMPT_COVERAGE: f64 = 0.95;
const MIN_DELAY_MS: f64 = 50.0;
const MAX_DELAY_MS: f64 = 5000.0;
const MIN_BACKOFF_FACTOR: f64 = 1.0;
const MAX_BACKOFF_FACTOR: f64 = 4.0;

#[derive(Debug, Default)]
struct RetryTelemetry {
    /// Successful executions bucketed by the attempt that succeeded
    success_by_attempt: HashMap<u32, u64>,
    total_successes: u64,
    last_failure_at: Option<Instant>,
    inter_failure_gaps_ms: VecDeque<f64>,
}

/// Read-only statistics for [`AdaptiveRetry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStats {
    pub success_by_attempt: HashMap<u32, u64>,
    pub adaptive: AdaptiveStats,
}

/// Retry whose parameters are learned per context.
///
/// Telemetry drives three signals: the empirical success-by-attempt curve
/// sets the attempt budget, the gaps between failures tune the initial
/// delay, and the growth of those gaps tunes the backoff factor.
pub struct AdaptiveRetry<I, O> {
    inner: SharedPrimitive<I, O>,
    engine: StrategyEngine,
    telemetry: Mutex<RetryTelemetry>,
    name: String,
}

impl<I, O> AdaptiveRetry<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    pub fn new<P>(inner: P, config: AdaptiveConfig) -> Self
    where
        P: Primitive<I, O> + 'static,
    {
        Self::with_baseline(inner, RetryConfig::default(), config)
    }

    /// Build with explicit baseline retry parameters.
    pub fn with_baseline<P>(inner: P, baseline: RetryConfig, config: AdaptiveConfig) -> Self
    where
        P: Primitive<I, O> + 'static,
    {
        let mut params = HashMap::new();
        params.insert(
            "max_attempts".to_string(),
            Value::from(baseline.max_attempts as u64),
        );
        params.insert(
            "initial_delay_ms".to_string(),
            Value::from(baseline.initial_delay.as_secs_f64() * 1000.0),
        );
        params.insert(
            "backoff_factor".to_string(),
            Value::from(baseline.backoff_factor),
        );
        params.insert(
            "max_delay_ms".to_string(),
            Value::from(baseline.max_delay.as_secs_f64() * 1000.0),
        );
        params.insert("jitter".to_string(), Value::from(baseline.jitter));
        let baseline_strategy =
            LearningStrategy::new("baseline", "Conservative retry defaults", "", params);

        Self {
            inner: Arc::new(inner),
            engine: StrategyEngine::new("AdaptiveRetry", baseline_strategy, config),
            telemetry: Mutex::new(RetryTelemetry::default()),
            name: "AdaptiveRetry".to_string(),
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

    /// Statistics surface.
    pub fn retry_stats(&self) -> RetryStats {
        let success_by_attempt = self
            .telemetry
            .lock()
            .map(|t| t.success_by_attempt.clone())
            .unwrap_or_default();
        RetryStats {
            success_by_attempt,
            adaptive: self.engine.stats(),
        }
    }

    pub fn stats(&self) -> AdaptiveStats {
        self.engine.stats()
    }

    fn retry_config_for(strategy: &LearningStrategy) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(strategy.param_u64("max_attempts", 3) as u32)
            .with_initial_delay(Duration::from_secs_f64(
                strategy.param_f64("initial_delay_ms", 100.0) / 1000.0,
            ))
            .with_backoff_factor(strategy.param_f64("backoff_factor", 2.0))
            .with_max_delay(Duration::from_secs_f64(
                strategy.param_f64("max_delay_ms", 30_000.0) / 1000.0,
            ))
            .with_jitter(strategy.param_f64("jitter", 0.1))
    }

    fn note_failure(&self) {
        if let Ok(mut telemetry) = self.telemetry.lock() {
            let now = Instant::now();
            if let Some(last) = telemetry.last_failure_at {
                let gap = now.duration_since(last).as_secs_f64() * 1000.0;
                telemetry.inter_failure_gaps_ms.push_back(gap);
                while telemetry.inter_failure_gaps_ms.len() > GAP_SAMPLE_CAP {
                    telemetry.inter_failure_gaps_ms.pop_front();
                }
            }
            telemetry.last_failure_at = Some(now);
        }
    }

    fn note_success(&self, attempt: u32) {
        if let Ok(mut telemetry) = self.telemetry.lock() {
            *telemetry.success_by_attempt.entry(attempt).or_default() += 1;
            telemetry.total_successes += 1;
        }
    }

    /// Derive a candidate strategy from the success-by-attempt curve and
    /// inter-failure gaps.
    fn consider_new_strategy(
        &self,
        context_key: &str,
        current: &LearningStrategy,
    ) -> Option<LearningStrategy> {
        let telemetry = self.telemetry.lock().ok()?;
        if telemetry.total_successes == 0 {
            return None;
        }

        // Smallest attempt budget covering most observed successes.
        let mut attempts: Vec<(u32, u64)> = telemetry
            .success_by_attempt
            .iter()
            .map(|(a, n)| (*a, *n))
            .collect();
        attempts.sort_by_key(|(a, _)| *a);
        let needed = (telemetry.total_successes as f64 * ATTEMPT_COVERAGE).ceil() as u64;
        let mut cumulative = 0u64;
        let mut learned_attempts = attempts.last().map(|(a, _)| *a).unwrap_or(1);
        for (attempt, count) in &attempts {
            cumulative += count;
            if cumulative >= needed {
                learned_attempts = *attempt;
                break;
            }
        }
        let learned_attempts = learned_attempts.max(1);

        let current_attempts = current.param_u64("max_attempts", 3) as u32;
        let current_delay = current.param_f64("initial_delay_ms", 100.0);
        let current_factor = current.param_f64("backoff_factor", 2.0);

        let learned_delay = median(telemetry.inter_failure_gaps_ms.iter().copied())
            .map(|gap| gap.clamp(MIN_DELAY_MS, MAX_DELAY_MS))
            .unwrap_or(current_delay);

        // How fast the gaps between failures grow suggests how steeply the
        // backoff should ramp.
        let gap_ratios: Vec<f64> = telemetry
            .inter_failure_gaps_ms
            .iter()
            .zip(telemetry.inter_failure_gaps_ms.iter().skip(1))
            .filter(|(prev, _)| **prev > 0.0)
            .map(|(prev, next)| *next / *prev)
            .collect();
        let learned_factor = median(gap_ratios)
            .map(|ratio| ratio.clamp(MIN_BACKOFF_FACTOR, MAX_BACKOFF_FACTOR))
            .unwrap_or(current_factor);

        let attempts_changed = learned_attempts != current_attempts;
        let delay_changed = (learned_delay - current_delay).abs() / current_delay.max(1.0) > 0.25;
        let factor_changed =
            (learned_factor - current_factor).abs() / current_factor.max(1.0) > 0.25;
        if !attempts_changed && !delay_changed && !factor_changed {
            return None;
        }

        let mut params = current.parameters.clone();
        params.insert(
            "max_attempts".to_string(),
            Value::from(learned_attempts as u64),
        );
        params.insert("initial_delay_ms".to_string(), Value::from(learned_delay));
        params.insert("backoff_factor".to_string(), Value::from(learned_factor));

        let name = format!(
            "{context_key}_optimized_v{}",
            self.engine.strategy_count() + 1
        );
        Some(LearningStrategy::new(
            name,
            format!(
                "Learned retry budget for {context_key} from {} successes",
                telemetry.total_successes
            ),
            context_key,
            params,
        ))
    }
}

#[async_trait]
impl<I, O> Primitive<I, O> for AdaptiveRetry<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    async fn execute(&self, input: I, ctx: &WorkflowContext) -> Result<O> {
        observed("AdaptiveRetry", &self.name, ctx, async {
            let context_key = ctx.metadata.environment_key().to_string();
            let strategy = self.engine.select(&context_key);
            let config = Self::retry_config_for(&strategy);
            tracing::debug!(
                primitive = %self.name,
                strategy = %strategy.name,
                context = %context_key,
                max_attempts = config.max_attempts,
                "executing under strategy",
            );

            let started = Instant::now();
            let mut attempt = 1u32;
            let outcome = loop {
                match self.inner.execute(input.clone(), ctx).await {
                    Ok(output) => {
                        self.note_success(attempt);
                        break Ok(output);
                    }
                    Err(error) => {
                        self.note_failure();
                        if attempt >= config.max_attempts.max(1) || !error.is_retriable() {
                            break Err(error);
                        }
                        let delay = config.jittered_delay(attempt);
                        emit(WorkflowEvent::retry_attempt(
                            &self.name,
                            ctx,
                            attempt,
                            delay.as_millis() as u64,
                        ));
                        tokio::time::sleep(delay).await;
                        attempt += 1;
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
                            Some("derived from success-by-attempt curve".to_string()),
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
