//! Adaptive primitives: strategy learning over execution telemetry.
//!
//! An adaptive primitive wraps a target behaviour (retry, cache, timeout,
//! fallback), keeps a registry of candidate parameterisations
//! ("strategies"), selects one per execution based on observed performance,
//! and, depending on the learning mode, creates and promotes new strategies
//! derived from telemetry.
//!
//! The registry always contains a baseline strategy with conservative
//! defaults. The baseline is never evicted, never demoted, and is the
//! fallback whenever selection has no better candidate.

mod cache;
mod engine;
mod fallback;
mod retry;
mod timeout;

pub use cache::{AdaptiveCache, AdaptiveCacheStats};
pub use engine::{AdaptiveStats, ContextRollup, StrategyEngine};
pub use fallback::{AdaptiveFallback, FallbackRouteStats, FallbackStats};
pub use retry::{AdaptiveRetry, RetryStats};
pub use timeout::{AdaptiveTimeout, TimeoutContextStats, TimeoutStats};

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Controls whether an adaptive primitive creates and uses new strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LearningMode {
    /// Baseline only; no telemetry-driven behaviour at all
    Disabled,
    /// Record telemetry but never create or use new strategies
    Observe,
    /// Create candidates, shadow-validate them, promote on a clear win
    Validate,
    /// Promote candidates immediately after the observation window
    Active,
}

/// Bound on the latency sample buffer kept per strategy.
const LATENCY_SAMPLE_CAP: usize = 256;

/// Rolling performance metrics for one strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyMetrics {
    pub total_executions: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Running mean latency over all executions
    pub avg_latency_ms: f64,
    /// Bounded sample window for percentile estimates
    #[serde(default)]
    latency_samples: VecDeque<f64>,
    /// Context keys this strategy has served
    #[serde(default)]
    pub contexts_seen: HashSet<String>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl StrategyMetrics {
    /// Record one execution outcome.
    pub fn record(&mut self, success: bool, latency_ms: f64, context_key: &str) {
        self.total_executions += 1;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        let n = self.total_executions as f64;
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / n;

        self.latency_samples.push_back(latency_ms);
        while self.latency_samples.len() > LATENCY_SAMPLE_CAP {
            self.latency_samples.pop_front();
        }
        self.contexts_seen.insert(context_key.to_string());
        self.last_used_at = Some(Utc::now());
    }

    /// Success ratio; 0 when nothing was recorded.
    pub fn success_rate(&self) -> f64 {
        if self.total_executions == 0 {
            0.0
        } else {
            self.success_count as f64 / self.total_executions as f64
        }
    }

    /// Latency percentile over the sample window (p in 0..=100).
    pub fn latency_percentile(&self, p: f64) -> Option<f64> {
        percentile(self.latency_samples.iter().copied(), p)
    }
}

/// Nearest-rank percentile over a sample set.
pub(crate) fn percentile(samples: impl IntoIterator<Item = f64>, p: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = samples.into_iter().collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

pub(crate) fn median(samples: impl IntoIterator<Item = f64>) -> Option<f64> {
    percentile(samples, 50.0)
}

/// A named parameter set for an adaptive primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningStrategy {
    /// Unique within one adaptive primitive
    pub name: String,
    pub description: String,
    /// Context key this strategy targets; empty matches every context
    pub context_pattern: String,
    /// Primitive-specific knobs
    pub parameters: HashMap<String, Value>,
    #[serde(default)]
    pub metrics: StrategyMetrics,
}

impl LearningStrategy {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        context_pattern: impl Into<String>,
        parameters: HashMap<String, Value>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            context_pattern: context_pattern.into(),
            parameters,
            metrics: StrategyMetrics::default(),
        }
    }

    /// Whether this strategy applies to the given context key.
    pub fn matches(&self, context_key: &str) -> bool {
        self.context_pattern.is_empty() || self.context_pattern == context_key
    }

    /// Read a numeric parameter, falling back when absent or mistyped.
    pub fn param_f64(&self, key: &str, default: f64) -> f64 {
        self.parameters
            .get(key)
            .and_then(Value::as_f64)
            .unwrap_or(default)
    }

    /// Read an integer parameter.
    pub fn param_u64(&self, key: &str, default: u64) -> u64 {
        self.parameters
            .get(key)
            .and_then(Value::as_u64)
            .unwrap_or(default)
    }

    /// Read a string-list parameter.
    pub fn param_str_list(&self, key: &str) -> Option<Vec<String>> {
        let list = self.parameters.get(key)?.as_array()?;
        Some(
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        )
    }
}

/// Weights for strategy ranking.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub success: f64,
    pub latency: f64,
    /// Subtracted while a strategy sits in demotion cooldown
    pub demotion_penalty: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            success: 0.7,
            latency: 0.3,
            demotion_penalty: 0.5,
        }
    }
}

impl ScoreWeights {
    /// Rank score for a strategy: weighted success rate plus inverse
    /// latency, minus the demotion penalty when applicable.
    pub fn score(&self, metrics: &StrategyMetrics, demoted: bool) -> f64 {
        let latency_score = 1.0 / (1.0 + metrics.avg_latency_ms / 1000.0);
        let mut score = self.success * metrics.success_rate() + self.latency * latency_score;
        if demoted {
            score -= self.demotion_penalty;
        }
        score
    }
}

/// Shared configuration for adaptive primitives.
#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub learning_mode: LearningMode,
    /// Registry capacity; lowest-scoring non-baseline is evicted beyond it
    pub max_strategies: usize,
    /// Shadow executions a candidate gets before promotion is decided
    pub validation_window: u32,
    /// Executions required before the learner may propose anything
    pub min_observations_before_learning: u64,
    /// Fraction of selections routed to candidates under validation
    pub shadow_fraction: f64,
    /// Success-rate gap below baseline that triggers demotion
    pub demotion_delta: f64,
    /// Trailing outcomes inspected for demotion
    pub demotion_window: u32,
    /// Executions a demoted strategy sits out
    pub demotion_cooldown: u64,
    /// Score margin a validated candidate must clear to be promoted
    pub promotion_margin: f64,
    pub weights: ScoreWeights,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            learning_mode: LearningMode::Validate,
            max_strategies: 10,
            validation_window: 20,
            min_observations_before_learning: 10,
            shadow_fraction: 0.2,
            demotion_delta: 0.1,
            demotion_window: 10,
            demotion_cooldown: 50,
            promotion_margin: 0.05,
            weights: ScoreWeights::default(),
        }
    }
}

impl AdaptiveConfig {
    pub fn new(learning_mode: LearningMode) -> Self {
        Self {
            learning_mode,
            ..Self::default()
        }
    }

    pub fn with_max_strategies(mut self, max: usize) -> Self {
        self.max_strategies = max.max(1);
        self
    }

    pub fn with_validation_window(mut self, window: u32) -> Self {
        self.validation_window = window;
        self
    }

    pub fn with_min_observations(mut self, min: u64) -> Self {
        self.min_observations_before_learning = min;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_metrics_running_mean_and_rate() {
        let mut m = StrategyMetrics::default();
        m.record(true, 100.0, "production");
        m.record(true, 200.0, "production");
        m.record(false, 300.0, "staging");

        assert_eq!(m.total_executions, 3);
        assert!((m.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert!((m.avg_latency_ms - 200.0).abs() < 1e-9);
        assert_eq!(m.contexts_seen.len(), 2);
        assert!(m.last_used_at.is_some());
    }

    #[test]
    fn test_latency_samples_are_bounded() {
        let mut m = StrategyMetrics::default();
        for i in 0..500 {
            m.record(true, i as f64, "default");
        }
        assert!(m.latency_samples.len() <= LATENCY_SAMPLE_CAP);
        // Only the newest samples remain.
        assert!(m.latency_percentile(0.0).unwrap() >= (500 - LATENCY_SAMPLE_CAP) as f64);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let samples = vec![100.0, 110.0, 120.0, 130.0, 140.0];
        assert_eq!(percentile(samples.clone(), 50.0), Some(120.0));
        assert_eq!(percentile(samples.clone(), 95.0), Some(140.0));
        assert_eq!(percentile(samples, 1.0), Some(100.0));
        assert_eq!(percentile(Vec::<f64>::new(), 50.0), None);
    }

    #[test]
    fn test_strategy_pattern_matching() {
        let wildcard = LearningStrategy::new("baseline", "default", "", HashMap::new());
        assert!(wildcard.matches("production"));
        assert!(wildcard.matches("default"));

        let scoped = LearningStrategy::new("prod_v2", "tuned", "production", HashMap::new());
        assert!(scoped.matches("production"));
        assert!(!scoped.matches("staging"));
    }

    #[test]
    fn test_param_accessors() {
        let mut params = HashMap::new();
        params.insert("ttl_seconds".to_string(), Value::from(120.5));
        params.insert("max_attempts".to_string(), Value::from(4u64));
        params.insert(
            "fallback_order".to_string(),
            Value::from(vec!["b", "a"]),
        );
        let s = LearningStrategy::new("s", "", "", params);

        assert_eq!(s.param_f64("ttl_seconds", 0.0), 120.5);
        assert_eq!(s.param_u64("max_attempts", 1), 4);
        assert_eq!(s.param_f64("missing", 9.0), 9.0);
        assert_eq!(
            s.param_str_list("fallback_order"),
            Some(vec!["b".to_string(), "a".to_string()])
        );
    }

    #[test]
    fn test_score_prefers_success_then_latency() {
        let weights = ScoreWeights::default();

        let mut fast_flaky = StrategyMetrics::default();
        for _ in 0..5 {
            fast_flaky.record(true, 10.0, "d");
            fast_flaky.record(false, 10.0, "d");
        }

        let mut slow_solid = StrategyMetrics::default();
        for _ in 0..10 {
            slow_solid.record(true, 800.0, "d");
        }

        assert!(weights.score(&slow_solid, false) > weights.score(&fast_flaky, false));
        // The demotion penalty drags a strategy below a healthy peer.
        assert!(weights.score(&slow_solid, true) < weights.score(&fast_flaky, false));
    }

    proptest::proptest! {
        #[test]
        fn prop_percentile_stays_within_sample_bounds(
            samples in proptest::collection::vec(0.0f64..10_000.0, 1..64),
            p in 0.0f64..=100.0,
        ) {
            let value = percentile(samples.iter().copied(), p).unwrap();
            let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            proptest::prop_assert!(value >= min && value <= max);
        }
    }

    #[test]
    fn test_strategy_round_trips_through_json() {
        let mut params = HashMap::new();
        params.insert("timeout_ms".to_string(), Value::from(250.0));
        let mut s = LearningStrategy::new("prod_v1", "learned", "production", params);
        s.metrics.record(true, 42.0, "production");

        let json = serde_json::to_string(&s).unwrap();
        let back: LearningStrategy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
