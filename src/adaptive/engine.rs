//! Strategy registry and lifecycle shared by all adaptive primitives.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{AdaptiveConfig, LearningMode, LearningStrategy, StrategyMetrics};
use crate::context::WorkflowContext;
use crate::error::{Error, Result};
use crate::observability::{emit, WorkflowEvent, WorkflowEventType};
use crate::store::{JournalEntry, StrategyStore};

/// Per-context execution rollup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextRollup {
    pub executions: u64,
    pub successes: u64,
    pub avg_latency_ms: f64,
}

impl ContextRollup {
    fn record(&mut self, success: bool, latency_ms: f64) {
        self.executions += 1;
        if success {
            self.successes += 1;
        }
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / self.executions as f64;
    }

    pub fn success_rate(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.successes as f64 / self.executions as f64
        }
    }
}

/// Read-only statistics view over an adaptive primitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveStats {
    pub learning_mode: LearningMode,
    pub total_executions: u64,
    pub total_adaptations: u64,
    pub baseline: String,
    /// Per-strategy metrics snapshot
    pub strategies: HashMap<String, StrategyMetrics>,
    /// Strategy names with current scores, best first
    pub ranking: Vec<(String, f64)>,
    /// Per-context rollups
    pub contexts: HashMap<String, ContextRollup>,
    /// Strategies currently under validation
    pub validating: Vec<String>,
    /// Strategies sitting out a demotion cooldown
    pub demoted: Vec<String>,
}

#[derive(Debug)]
struct ValidationState {
    executions: u32,
}

#[derive(Debug)]
struct EngineState {
    strategies: HashMap<String, LearningStrategy>,
    validating: HashMap<String, ValidationState>,
    /// Demoted name -> total-execution count at which it becomes eligible again
    demoted: HashMap<String, u64>,
    recent_outcomes: HashMap<String, VecDeque<bool>>,
    contexts: HashMap<String, ContextRollup>,
    total_executions: u64,
    total_adaptations: u64,
}

enum Effect {
    Save {
        strategy: LearningStrategy,
        context_key: String,
        notes: Option<String>,
    },
    Journal {
        event: String,
        note: String,
    },
}

/// Registry, selection, and lifecycle management for learned strategies.
///
/// Selection is a read over a locked snapshot; telemetry updates and
/// strategy creation serialise on the same lock, so at most one learning
/// consideration mutates the registry at a time. Store writes happen after
/// the lock is released and never fail the execution path.
pub struct StrategyEngine {
    primitive_type: String,
    baseline_name: String,
    config: AdaptiveConfig,
    state: Mutex<EngineState>,
    store: Option<Arc<dyn StrategyStore>>,
}

impl StrategyEngine {
    pub fn new(
        primitive_type: impl Into<String>,
        baseline: LearningStrategy,
        config: AdaptiveConfig,
    ) -> Self {
        let baseline_name = baseline.name.clone();
        let mut strategies = HashMap::new();
        strategies.insert(baseline_name.clone(), baseline);
        Self {
            primitive_type: primitive_type.into(),
            baseline_name,
            config,
            state: Mutex::new(EngineState {
                strategies,
                validating: HashMap::new(),
                demoted: HashMap::new(),
                recent_outcomes: HashMap::new(),
                contexts: HashMap::new(),
                total_executions: 0,
                total_adaptations: 0,
            }),
            store: None,
        }
    }

    /// Attach a durability bridge; adoptions and demotions are persisted.
    pub fn with_store(mut self, store: Arc<dyn StrategyStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Swap the baseline parameter set in place. Intended for builder-time
    /// reconfiguration, before any traffic has been recorded.
    pub(crate) fn replace_baseline(&self, mut baseline: LearningStrategy) {
        baseline.name = self.baseline_name.clone();
        match self.lock() {
            Ok(mut state) => {
                state.strategies.insert(self.baseline_name.clone(), baseline);
            }
            Err(error) => {
                tracing::warn!(
                    primitive = %self.primitive_type,
                    error = %error,
                    error_kind = error.kind(),
                    "baseline replacement skipped, registry unavailable",
                );
            }
        }
    }

    pub fn learning_mode(&self) -> LearningMode {
        self.config.learning_mode
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    pub fn primitive_type(&self) -> &str {
        &self.primitive_type
    }

    /// Load persisted strategies from the store. The baseline is never
    /// overwritten, and capacity is respected.
    pub async fn hydrate(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let persisted = store.list_strategies(&self.primitive_type).await?;

        let mut loaded = 0usize;
        {
            let mut state = self.lock()?;
            for strategy in persisted {
                if strategy.name == self.baseline_name
                    || state.strategies.contains_key(&strategy.name)
                {
                    continue;
                }
                if state.strategies.len() >= self.config.max_strategies {
                    break;
                }
                state.strategies.insert(strategy.name.clone(), strategy);
                loaded += 1;
            }
        }
        if loaded > 0 {
            tracing::info!(
                primitive = %self.primitive_type,
                loaded = loaded,
                "hydrated strategies from store",
            );
            self.flush(vec![Effect::Journal {
                event: "hydrated".to_string(),
                note: format!("{loaded} strategies loaded from store"),
            }])
            .await;
        }
        Ok(loaded)
    }

    /// Pick the strategy for this execution.
    ///
    /// Candidates are strategies whose pattern equals the context key plus
    /// wildcards; demoted strategies are skipped and candidates under
    /// validation receive a shadow fraction of traffic. Ties break by name.
    pub fn select(&self, context_key: &str) -> LearningStrategy {
        let mut state = match self.lock() {
            Ok(state) => state,
            Err(error) => {
                tracing::warn!(
                    primitive = %self.primitive_type,
                    error = %error,
                    error_kind = error.kind(),
                    "strategy selection unavailable, using baseline defaults",
                );
                return self.fallback_baseline();
            }
        };

        if self.config.learning_mode == LearningMode::Disabled {
            return state
                .strategies
                .get(&self.baseline_name)
                .cloned()
                .unwrap_or_else(|| self.fallback_baseline());
        }

        let total = state.total_executions;
        state.demoted.retain(|_, until| *until > total);

        // Shadow-route a slice of traffic to candidates still validating.
        if self.config.learning_mode == LearningMode::Validate {
            let mut shadows: Vec<&String> = state
                .validating
                .keys()
                .filter(|name| {
                    state
                        .strategies
                        .get(*name)
                        .is_some_and(|s| s.matches(context_key))
                })
                .collect();
            shadows.sort();
            if let Some(name) = shadows.first() {
                if rand::thread_rng().gen::<f64>() < self.config.shadow_fraction {
                    if let Some(strategy) = state.strategies.get(*name) {
                        return strategy.clone();
                    }
                }
            }
        }

        self.best_in(&state, context_key)
            .unwrap_or_else(|| self.fallback_baseline())
    }

    /// The current non-shadow choice for a context, as selection would rank it.
    pub fn incumbent(&self, context_key: &str) -> LearningStrategy {
        match self.lock() {
            Ok(state) => self
                .best_in(&state, context_key)
                .unwrap_or_else(|| self.fallback_baseline()),
            Err(error) => {
                tracing::warn!(
                    primitive = %self.primitive_type,
                    error = %error,
                    error_kind = error.kind(),
                    "strategy lookup unavailable, using baseline defaults",
                );
                self.fallback_baseline()
            }
        }
    }

    fn best_in(&self, state: &EngineState, context_key: &str) -> Option<LearningStrategy> {
        let mut eligible: Vec<&LearningStrategy> = state
            .strategies
            .values()
            .filter(|s| s.matches(context_key))
            .filter(|s| !state.validating.contains_key(&s.name))
            .filter(|s| !state.demoted.contains_key(&s.name) || s.name == self.baseline_name)
            .collect();

        if eligible.is_empty() {
            return state.strategies.get(&self.baseline_name).cloned();
        }

        eligible.sort_by(|a, b| {
            let score_a = self.config.weights.score(&a.metrics, false);
            let score_b = self.config.weights.score(&b.metrics, false);
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        Some(eligible[0].clone())
    }

    /// Record an execution outcome against the strategy that served it.
    ///
    /// Drives validation windows and the bad-strategy breaker: a learned
    /// strategy whose trailing success rate falls `demotion_delta` below
    /// baseline is benched for `demotion_cooldown` executions.
    pub async fn record_outcome(
        &self,
        strategy_name: &str,
        context_key: &str,
        success: bool,
        latency_ms: f64,
        ctx: &WorkflowContext,
    ) {
        let mut effects = Vec::new();
        let mut events = Vec::new();

        {
            let mut state = match self.lock() {
                Ok(state) => state,
                Err(error) => {
                    tracing::warn!(
                        primitive = %self.primitive_type,
                        strategy = strategy_name,
                        error = %error,
                        error_kind = error.kind(),
                        "dropping outcome, registry unavailable",
                    );
                    return;
                }
            };
            state.total_executions += 1;
            state
                .contexts
                .entry(context_key.to_string())
                .or_default()
                .record(success, latency_ms);

            if let Some(strategy) = state.strategies.get_mut(strategy_name) {
                strategy.metrics.record(success, latency_ms, context_key);
            }

            let window = self.config.demotion_window as usize;
            let recent = state
                .recent_outcomes
                .entry(strategy_name.to_string())
                .or_default();
            recent.push_back(success);
            while recent.len() > window {
                recent.pop_front();
            }
            let recent_full = recent.len() >= window;
            let recent_rate =
                recent.iter().filter(|s| **s).count() as f64 / recent.len().max(1) as f64;

            // Bad-strategy breaker; the baseline is exempt.
            if strategy_name != self.baseline_name
                && recent_full
                && !state.demoted.contains_key(strategy_name)
                && !state.validating.contains_key(strategy_name)
            {
                let baseline_rate = state
                    .strategies
                    .get(&self.baseline_name)
                    .map(|b| b.metrics.success_rate())
                    .unwrap_or(0.0);
                if recent_rate < baseline_rate - self.config.demotion_delta {
                    let until = state.total_executions + self.config.demotion_cooldown;
                    state.demoted.insert(strategy_name.to_string(), until);
                    state.recent_outcomes.remove(strategy_name);
                    tracing::warn!(
                        primitive = %self.primitive_type,
                        strategy = strategy_name,
                        recent_rate = recent_rate,
                        baseline_rate = baseline_rate,
                        "strategy demoted for underperforming baseline",
                    );
                    events.push(
                        WorkflowEvent::new(WorkflowEventType::StrategyDemoted, &self.primitive_type, ctx)
                            .with_metadata("strategy", strategy_name)
                            .with_metadata("recent_rate", recent_rate),
                    );
                    effects.push(Effect::Journal {
                        event: "demoted".to_string(),
                        note: format!(
                            "{strategy_name}: recent success rate {recent_rate:.2} below baseline {baseline_rate:.2}"
                        ),
                    });
                }
            }

            // Advance the validation window for candidates in trial.
            let window_complete = match state.validating.get_mut(strategy_name) {
                Some(validation) => {
                    validation.executions += 1;
                    validation.executions >= self.config.validation_window
                }
                None => false,
            };
            if window_complete {
                let (resolved_effects, resolved_events) =
                    self.resolve_validation(&mut state, strategy_name, context_key, ctx);
                effects.extend(resolved_effects);
                events.extend(resolved_events);
            }
        }

        for event in events {
            emit(event);
        }
        self.flush(effects).await;
    }

    fn resolve_validation(
        &self,
        state: &mut EngineState,
        strategy_name: &str,
        context_key: &str,
        ctx: &WorkflowContext,
    ) -> (Vec<Effect>, Vec<WorkflowEvent>) {
        let Some(candidate) = state.strategies.get(strategy_name).cloned() else {
            state.validating.remove(strategy_name);
            return (Vec::new(), Vec::new());
        };

        // Score the incumbent while the candidate is still excluded from
        // ranking, then release the candidate from validation.
        let candidate_score = self.config.weights.score(&candidate.metrics, false);
        let incumbent_score = self
            .best_in(state, context_key)
            .map(|s| self.config.weights.score(&s.metrics, false))
            .unwrap_or(0.0);
        state.validating.remove(strategy_name);

        if candidate_score >= incumbent_score + self.config.promotion_margin {
            state.total_adaptations += 1;
            tracing::info!(
                primitive = %self.primitive_type,
                strategy = strategy_name,
                candidate_score = candidate_score,
                incumbent_score = incumbent_score,
                "strategy promoted after validation",
            );
            let event = WorkflowEvent::new(
                WorkflowEventType::StrategyAdopted,
                &self.primitive_type,
                ctx,
            )
            .with_metadata("strategy", strategy_name)
            .with_metadata("score", candidate_score);
            (
                vec![
                    Effect::Save {
                        strategy: candidate,
                        context_key: context_key.to_string(),
                        notes: Some(format!(
                            "promoted after validation: score {candidate_score:.3} vs incumbent {incumbent_score:.3}"
                        )),
                    },
                    Effect::Journal {
                        event: "promoted".to_string(),
                        note: format!("{strategy_name} beat incumbent by {:.3}", candidate_score - incumbent_score),
                    },
                ],
                vec![event],
            )
        } else {
            state.strategies.remove(strategy_name);
            tracing::info!(
                primitive = %self.primitive_type,
                strategy = strategy_name,
                "validation candidate discarded",
            );
            (
                vec![Effect::Journal {
                    event: "validation_failed".to_string(),
                    note: format!(
                        "{strategy_name}: score {candidate_score:.3} did not clear incumbent {incumbent_score:.3}"
                    ),
                }],
                Vec::new(),
            )
        }
    }

    /// Whether the learner should be consulted after this execution.
    pub fn should_learn(&self) -> bool {
        if !matches!(
            self.config.learning_mode,
            LearningMode::Validate | LearningMode::Active
        ) {
            return false;
        }
        let observed = self
            .lock()
            .map(|state| state.total_executions)
            .unwrap_or(0);
        observed >= self.config.min_observations_before_learning
    }

    /// Register a learner-proposed strategy.
    ///
    /// In `Active` mode the strategy is adopted immediately; in `Validate`
    /// it enters the shadow-validation window. Registry capacity evicts the
    /// lowest-scoring non-baseline strategy.
    pub async fn propose(
        &self,
        candidate: LearningStrategy,
        context_key: &str,
        notes: Option<String>,
        ctx: &WorkflowContext,
    ) {
        let mode = self.config.learning_mode;
        if !matches!(mode, LearningMode::Validate | LearningMode::Active) {
            return;
        }

        let name = candidate.name.clone();
        let mut effects = Vec::new();
        let mut events = Vec::new();

        {
            let mut state = match self.lock() {
                Ok(state) => state,
                Err(error) => {
                    tracing::warn!(
                        primitive = %self.primitive_type,
                        strategy = %name,
                        error = %error,
                        error_kind = error.kind(),
                        "dropping proposed strategy, registry unavailable",
                    );
                    return;
                }
            };
            if state.strategies.contains_key(&name) {
                return;
            }

            while state.strategies.len() >= self.config.max_strategies {
                let victim = state
                    .strategies
                    .values()
                    .filter(|s| s.name != self.baseline_name)
                    .min_by(|a, b| {
                        let score_a = self.config.weights.score(&a.metrics, false);
                        let score_b = self.config.weights.score(&b.metrics, false);
                        score_a
                            .partial_cmp(&score_b)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|s| s.name.clone());
                match victim {
                    Some(victim_name) => {
                        state.strategies.remove(&victim_name);
                        state.validating.remove(&victim_name);
                        state.demoted.remove(&victim_name);
                        effects.push(Effect::Journal {
                            event: "evicted".to_string(),
                            note: format!("{victim_name} evicted at capacity"),
                        });
                    }
                    None => break,
                }
            }

            state.strategies.insert(name.clone(), candidate.clone());
            match mode {
                LearningMode::Active => {
                    state.total_adaptations += 1;
                    tracing::info!(
                        primitive = %self.primitive_type,
                        strategy = %name,
                        context = context_key,
                        "strategy adopted",
                    );
                    events.push(
                        WorkflowEvent::new(WorkflowEventType::StrategyAdopted, &self.primitive_type, ctx)
                            .with_metadata("strategy", name.as_str())
                            .with_metadata("context", context_key),
                    );
                    effects.push(Effect::Save {
                        strategy: candidate,
                        context_key: context_key.to_string(),
                        notes,
                    });
                    effects.push(Effect::Journal {
                        event: "adopted".to_string(),
                        note: format!("{name} adopted for context '{context_key}'"),
                    });
                }
                LearningMode::Validate => {
                    state
                        .validating
                        .insert(name.clone(), ValidationState { executions: 0 });
                    tracing::info!(
                        primitive = %self.primitive_type,
                        strategy = %name,
                        window = self.config.validation_window,
                        "strategy entering validation",
                    );
                    effects.push(Effect::Journal {
                        event: "validation_started".to_string(),
                        note: format!("{name} shadow-routed for validation"),
                    });
                }
                _ => {}
            }
        }

        for event in events {
            emit(event);
        }
        self.flush(effects).await;
    }

    /// Number of registered strategies, baseline included.
    pub fn strategy_count(&self) -> usize {
        self.lock().map(|state| state.strategies.len()).unwrap_or(0)
    }

    /// Snapshot of one strategy.
    pub fn strategy(&self, name: &str) -> Option<LearningStrategy> {
        self.lock().ok()?.strategies.get(name).cloned()
    }

    /// Snapshot of every registered strategy.
    pub fn strategies(&self) -> Vec<LearningStrategy> {
        self.lock()
            .map(|state| state.strategies.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn total_executions(&self) -> u64 {
        self.lock().map(|state| state.total_executions).unwrap_or(0)
    }

    /// Read-only statistics view.
    pub fn stats(&self) -> AdaptiveStats {
        let state = match self.lock() {
            Ok(state) => state,
            Err(_) => {
                return AdaptiveStats {
                    learning_mode: self.config.learning_mode,
                    total_executions: 0,
                    total_adaptations: 0,
                    baseline: self.baseline_name.clone(),
                    strategies: HashMap::new(),
                    ranking: Vec::new(),
                    contexts: HashMap::new(),
                    validating: Vec::new(),
                    demoted: Vec::new(),
                }
            }
        };

        let mut ranking: Vec<(String, f64)> = state
            .strategies
            .values()
            .map(|s| {
                let demoted = state.demoted.contains_key(&s.name);
                (s.name.clone(), self.config.weights.score(&s.metrics, demoted))
            })
            .collect();
        ranking.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        AdaptiveStats {
            learning_mode: self.config.learning_mode,
            total_executions: state.total_executions,
            total_adaptations: state.total_adaptations,
            baseline: self.baseline_name.clone(),
            strategies: state
                .strategies
                .iter()
                .map(|(name, s)| (name.clone(), s.metrics.clone()))
                .collect(),
            ranking,
            contexts: state.contexts.clone(),
            validating: state.validating.keys().cloned().collect(),
            demoted: state.demoted.keys().cloned().collect(),
        }
    }

    fn fallback_baseline(&self) -> LearningStrategy {
        LearningStrategy::new(self.baseline_name.clone(), "baseline", "", HashMap::new())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, EngineState>> {
        self.state
            .lock()
            .map_err(|_| Error::strategy("adaptive registry lock poisoned"))
    }

    async fn flush(&self, effects: Vec<Effect>) {
        let Some(store) = &self.store else {
            return;
        };
        for effect in effects {
            let outcome = match effect {
                Effect::Save {
                    strategy,
                    context_key,
                    notes,
                } => {
                    store
                        .save_strategy(
                            &self.primitive_type,
                            &strategy,
                            &context_key,
                            notes.as_deref(),
                        )
                        .await
                }
                Effect::Journal { event, note } => {
                    store
                        .append_journal(&JournalEntry {
                            timestamp: Utc::now(),
                            primitive_type: self.primitive_type.clone(),
                            event,
                            note,
                        })
                        .await
                }
            };
            if let Err(error) = outcome {
                tracing::warn!(
                    primitive = %self.primitive_type,
                    error = %error,
                    "strategy persistence failed",
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn baseline() -> LearningStrategy {
        LearningStrategy::new("baseline", "conservative defaults", "", HashMap::new())
    }

    fn engine(mode: LearningMode) -> StrategyEngine {
        StrategyEngine::new("AdaptiveTest", baseline(), AdaptiveConfig::new(mode))
    }

    fn learned(name: &str, pattern: &str) -> LearningStrategy {
        let mut params = HashMap::new();
        params.insert("knob".to_string(), Value::from(1));
        LearningStrategy::new(name, "learned", pattern, params)
    }

    #[tokio::test]
    async fn test_baseline_selected_when_registry_is_bare() {
        let engine = engine(LearningMode::Active);
        assert_eq!(engine.select("production").name, "baseline");
    }

    #[tokio::test]
    async fn test_active_mode_adopts_immediately() {
        let engine = engine(LearningMode::Active);
        let ctx = WorkflowContext::new();
        engine
            .propose(learned("prod_v1", "production"), "production", None, &ctx)
            .await;

        assert_eq!(engine.strategy_count(), 2);
        assert_eq!(engine.stats().total_adaptations, 1);
    }

    #[tokio::test]
    async fn test_observe_mode_never_adds_strategies() {
        let engine = engine(LearningMode::Observe);
        let ctx = WorkflowContext::new();
        engine
            .propose(learned("prod_v1", "production"), "production", None, &ctx)
            .await;
        assert_eq!(engine.strategy_count(), 1);
        assert!(!engine.should_learn());
    }

    #[tokio::test]
    async fn test_selection_ranks_by_score() {
        let engine = engine(LearningMode::Active);
        let ctx = WorkflowContext::new();
        engine
            .propose(learned("prod_good", "production"), "production", None, &ctx)
            .await;
        engine
            .propose(learned("prod_bad", "production"), "production", None, &ctx)
            .await;

        for _ in 0..10 {
            engine
                .record_outcome("prod_good", "production", true, 50.0, &ctx)
                .await;
            engine
                .record_outcome("prod_bad", "production", false, 50.0, &ctx)
                .await;
        }

        assert_eq!(engine.select("production").name, "prod_good");
        // Strategies scoped to production never serve staging.
        assert_eq!(engine.select("staging").name, "baseline");
    }

    #[tokio::test]
    async fn test_demotion_benches_underperformer_but_never_baseline() {
        let engine = engine(LearningMode::Active);
        let ctx = WorkflowContext::new();
        engine
            .propose(learned("prod_v1", "production"), "production", None, &ctx)
            .await;

        // Healthy baseline history.
        for _ in 0..20 {
            engine
                .record_outcome("baseline", "production", true, 50.0, &ctx)
                .await;
        }
        // The learned strategy collapses.
        for _ in 0..10 {
            engine
                .record_outcome("prod_v1", "production", false, 50.0, &ctx)
                .await;
        }

        let stats = engine.stats();
        assert!(stats.demoted.contains(&"prod_v1".to_string()));
        assert_eq!(engine.select("production").name, "baseline");

        // Baseline takes the same punishment without demotion.
        for _ in 0..10 {
            engine
                .record_outcome("baseline", "production", false, 50.0, &ctx)
                .await;
        }
        assert!(!engine.stats().demoted.contains(&"baseline".to_string()));
    }

    #[tokio::test]
    async fn test_demotion_cooldown_expires() {
        let mut config = AdaptiveConfig::new(LearningMode::Active);
        config.demotion_cooldown = 5;
        config.demotion_window = 4;
        let engine = StrategyEngine::new("AdaptiveTest", baseline(), config);
        let ctx = WorkflowContext::new();
        engine
            .propose(learned("prod_v1", "production"), "production", None, &ctx)
            .await;

        for _ in 0..8 {
            engine
                .record_outcome("baseline", "production", true, 10.0, &ctx)
                .await;
        }
        for _ in 0..4 {
            engine
                .record_outcome("prod_v1", "production", false, 10.0, &ctx)
                .await;
        }
        assert!(engine.stats().demoted.contains(&"prod_v1".to_string()));

        // Enough healthy traffic for the cooldown to lapse.
        for _ in 0..6 {
            engine
                .record_outcome("baseline", "production", true, 10.0, &ctx)
                .await;
        }
        let _ = engine.select("production");
        assert!(!engine.stats().demoted.contains(&"prod_v1".to_string()));
    }

    #[tokio::test]
    async fn test_capacity_evicts_lowest_scoring_non_baseline() {
        let config = AdaptiveConfig::new(LearningMode::Active).with_max_strategies(3);
        let engine = StrategyEngine::new("AdaptiveTest", baseline(), config);
        let ctx = WorkflowContext::new();

        engine.propose(learned("a", "production"), "production", None, &ctx).await;
        engine.propose(learned("b", "production"), "production", None, &ctx).await;
        for _ in 0..5 {
            engine.record_outcome("a", "production", true, 10.0, &ctx).await;
            engine.record_outcome("b", "production", false, 10.0, &ctx).await;
        }

        engine.propose(learned("c", "production"), "production", None, &ctx).await;

        let names: Vec<String> = engine.strategies().into_iter().map(|s| s.name).collect();
        assert_eq!(names.len(), 3);
        assert!(names.contains(&"baseline".to_string()));
        assert!(names.contains(&"a".to_string()));
        assert!(!names.contains(&"b".to_string()));
    }

    #[tokio::test]
    async fn test_validate_mode_promotes_winner() {
        let mut config = AdaptiveConfig::new(LearningMode::Validate);
        config.validation_window = 5;
        let engine = StrategyEngine::new("AdaptiveTest", baseline(), config);
        let ctx = WorkflowContext::new();

        // A mediocre incumbent record.
        for _ in 0..10 {
            engine.record_outcome("baseline", "production", false, 100.0, &ctx).await;
        }

        engine
            .propose(learned("prod_v1", "production"), "production", None, &ctx)
            .await;
        assert!(engine.stats().validating.contains(&"prod_v1".to_string()));
        // Under validation the candidate is not the ranked pick.
        assert_eq!(engine.incumbent("production").name, "baseline");

        for _ in 0..5 {
            engine.record_outcome("prod_v1", "production", true, 10.0, &ctx).await;
        }

        let stats = engine.stats();
        assert!(stats.validating.is_empty());
        assert!(stats.strategies.contains_key("prod_v1"));
        assert_eq!(stats.total_adaptations, 1);
        assert_eq!(engine.select("production").name, "prod_v1");
    }

    #[tokio::test]
    async fn test_validate_mode_discards_loser() {
        let mut config = AdaptiveConfig::new(LearningMode::Validate);
        config.validation_window = 5;
        let engine = StrategyEngine::new("AdaptiveTest", baseline(), config);
        let ctx = WorkflowContext::new();

        for _ in 0..10 {
            engine.record_outcome("baseline", "production", true, 10.0, &ctx).await;
        }

        engine
            .propose(learned("prod_v1", "production"), "production", None, &ctx)
            .await;
        for _ in 0..5 {
            engine.record_outcome("prod_v1", "production", false, 10.0, &ctx).await;
        }

        let stats = engine.stats();
        assert!(!stats.strategies.contains_key("prod_v1"));
        assert_eq!(stats.total_adaptations, 0);
    }

    #[tokio::test]
    async fn test_stats_surface_shape() {
        let engine = engine(LearningMode::Active);
        let ctx = WorkflowContext::new();
        engine.record_outcome("baseline", "production", true, 25.0, &ctx).await;
        engine.record_outcome("baseline", "staging", false, 75.0, &ctx).await;

        let stats = engine.stats();
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.baseline, "baseline");
        assert_eq!(stats.contexts.len(), 2);
        assert_eq!(stats.ranking[0].0, "baseline");
        assert!((stats.contexts["production"].success_rate() - 1.0).abs() < 1e-9);
    }
}
