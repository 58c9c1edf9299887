//! Adaptive cache: learns per-context TTL from observed reuse intervals.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use super::{median, AdaptiveConfig, AdaptiveStats, LearningStrategy, StrategyEngine};
use crate::context::WorkflowContext;
use crate::error::Result;
use crate::observability::{emit, observed, WorkflowEvent};
use crate::primitive::{Primitive, SharedPrimitive};
use crate::resilience::{CacheConfig, CacheKeyFn};
use crate::store::StrategyStore;

const REUSE_SAMPLE_CAP: usize = 128;
/// Learned TTL headroom over the typical reuse interval.
const REUSE_HEADROOM: f64 = 2.0;

#[derive(Debug, Clone)]
struct CacheEntry<O> {
    value: O,
    inserted_at: Instant,
    last_access: Instant,
}

#[derive(Debug, Default)]
struct ReuseTelemetry {
    /// Miss-to-hit gaps per context key
    intervals_ms: HashMap<String, VecDeque<f64>>,
}

/// Read-only statistics for [`AdaptiveCache`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub entry_count: usize,
    /// Median observed reuse interval per context
    pub reuse_median_ms: HashMap<String, f64>,
    pub adaptive: AdaptiveStats,
}

/// Cache whose TTL and capacity are learned per context.
///
/// The reuse signal is the gap between a key's computation and its next
/// hit; the learned TTL is the median gap with headroom, clamped to the
/// configured bounds.
pub struct AdaptiveCache<I, O> {
    inner: SharedPrimitive<I, O>,
    key_fn: CacheKeyFn<I>,
    engine: StrategyEngine,
    entries: RwLock<HashMap<String, CacheEntry<O>>>,
    reuse: Mutex<ReuseTelemetry>,
    hits: Mutex<u64>,
    misses: Mutex<u64>,
    min_ttl: Duration,
    max_ttl: Duration,
    name: String,
}

impl<I, O> AdaptiveCache<I, O>
where
    I: Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    pub fn new<P, F>(inner: P, key_fn: F, config: AdaptiveConfig) -> Self
    where
        P: Primitive<I, O> + 'static,
        F: Fn(&I, &WorkflowContext) -> String + Send + Sync + 'static,
    {
        Self::with_baseline(inner, key_fn, CacheConfig::default(), config)
    }

    /// Build with explicit baseline cache parameters.
    pub fn with_baseline<P, F>(
        inner: P,
        key_fn: F,
        baseline: CacheConfig,
        config: AdaptiveConfig,
    ) -> Self
    where
        P: Primitive<I, O> + 'static,
        F: Fn(&I, &WorkflowContext) -> String + Send + Sync + 'static,
    {
        let mut params = HashMap::new();
        params.insert(
            "ttl_seconds".to_string(),
            Value::from(baseline.ttl.as_secs_f64()),
        );
        params.insert(
            "max_cache_size".to_string(),
            Value::from(baseline.max_size as u64),
        );
        let baseline_strategy =
            LearningStrategy::new("baseline", "Default cache lifetime", "", params);

        Self {
            inner: Arc::new(inner),
            key_fn: Arc::new(key_fn),
            engine: StrategyEngine::new("AdaptiveCache", baseline_strategy, config),
            entries: RwLock::new(HashMap::new()),
            reuse: Mutex::new(ReuseTelemetry::default()),
            hits: Mutex::new(0),
            misses: Mutex::new(0),
            min_ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(86_400),
            name: "AdaptiveCache".to_string(),
        }
    }

    /// Bounds for the learned TTL.
    pub fn with_ttl_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.min_ttl = min;
        self.max_ttl = max.max(min);
        self
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
    pub async fn cache_stats(&self) -> AdaptiveCacheStats {
        let hits = self.hits.lock().map(|h| *h).unwrap_or(0);
        let misses = self.misses.lock().map(|m| *m).unwrap_or(0);
        let total = hits + misses;
        let reuse_median_ms = self
            .reuse
            .lock()
            .map(|telemetry| {
                telemetry
                    .intervals_ms
                    .iter()
                    .filter_map(|(key, samples)| {
                        median(samples.iter().copied()).map(|m| (key.clone(), m))
                    })
                    .collect()
            })
            .unwrap_or_default();

        AdaptiveCacheStats {
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            entry_count: self.entries.read().await.len(),
            reuse_median_ms,
            adaptive: self.engine.stats(),
        }
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Drop entries older than the current strategy's TTL.
    pub async fn evict_expired(&self, ctx: &WorkflowContext) {
        let strategy = self.engine.incumbent(ctx.metadata.environment_key());
        let ttl = Duration::from_secs_f64(strategy.param_f64("ttl_seconds", 3600.0));
        self.entries
            .write()
            .await
            .retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
    }

    fn note_reuse(&self, context_key: &str, interval_ms: f64) {
        if let Ok(mut telemetry) = self.reuse.lock() {
            let samples = telemetry
                .intervals_ms
                .entry(context_key.to_string())
                .or_default();
            samples.push_back(interval_ms);
            while samples.len() > REUSE_SAMPLE_CAP {
                samples.pop_front();
            }
        }
    }

    fn consider_new_strategy(
        &self,
        context_key: &str,
        current: &LearningStrategy,
    ) -> Option<LearningStrategy> {
        let reuse_median = {
            let telemetry = self.reuse.lock().ok()?;
            median(telemetry.intervals_ms.get(context_key)?.iter().copied())?
        };

        let learned_ttl = (reuse_median / 1000.0 * REUSE_HEADROOM)
            .clamp(self.min_ttl.as_secs_f64(), self.max_ttl.as_secs_f64());
        let current_ttl = current.param_f64("ttl_seconds", 3600.0);
        if (learned_ttl - current_ttl).abs() / current_ttl.max(1.0) < 0.1 {
            return None;
        }

        let mut params = current.parameters.clone();
        params.insert("ttl_seconds".to_string(), Value::from(learned_ttl));

        let name = format!(
            "{context_key}_optimized_v{}",
            self.engine.strategy_count() + 1
        );
        Some(LearningStrategy::new(
            name,
            format!("Learned TTL for {context_key} from reuse intervals"),
            context_key,
            params,
        ))
    }

    async fn store_value(&self, key: String, value: O, max_size: usize) {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                last_access: now,
            },
        );
        while entries.len() > max_size.max(1) {
            let victim = entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    entries.remove(&k);
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl<I, O> Primitive<I, O> for AdaptiveCache<I, O>
where
    I: Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    async fn execute(&self, input: I, ctx: &WorkflowContext) -> Result<O> {
        observed("AdaptiveCache", &self.name, ctx, async {
            let context_key = ctx.metadata.environment_key().to_string();
            let strategy = self.engine.select(&context_key);
            let ttl = Duration::from_secs_f64(strategy.param_f64("ttl_seconds", 3600.0));
            let max_size = strategy.param_u64("max_cache_size", 1000) as usize;

            let key = (self.key_fn)(&input, ctx);
            let started = Instant::now();

            let cached = {
                let mut entries = self.entries.write().await;
                match entries.get_mut(&key) {
                    Some(entry) if entry.inserted_at.elapsed() <= ttl => {
                        entry.last_access = Instant::now();
                        Some((
                            entry.value.clone(),
                            entry.inserted_at.elapsed().as_secs_f64() * 1000.0,
                        ))
                    }
                    _ => None,
                }
            };

            let outcome = if let Some((value, age_ms)) = cached {
                if let Ok(mut hits) = self.hits.lock() {
                    *hits += 1;
                }
                self.note_reuse(&context_key, age_ms);
                emit(WorkflowEvent::cache_hit(&self.name, ctx, &key));
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.engine
                    .record_outcome(&strategy.name, &context_key, true, latency_ms, ctx)
                    .await;
                Ok(value)
            } else {
                if let Ok(mut misses) = self.misses.lock() {
                    *misses += 1;
                }
                emit(WorkflowEvent::cache_miss(&self.name, ctx, &key));

                let computed = self.inner.execute(input, ctx).await;
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.engine
                    .record_outcome(&strategy.name, &context_key, computed.is_ok(), latency_ms, ctx)
                    .await;

                match computed {
                    Ok(value) => {
                        self.store_value(key, value.clone(), max_size).await;
                        Ok(value)
                    }
                    Err(error) => Err(error),
                }
            };

            if outcome.is_ok() && self.engine.should_learn() {
                let incumbent = self.engine.incumbent(&context_key);
                if let Some(candidate) = self.consider_new_strategy(&context_key, &incumbent) {
                    self.engine
                        .propose(
                            candidate,
                            &context_key,
                            Some("derived from median reuse interval".to_string()),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::LearningMode;
    use crate::primitive::Lambda;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn counting() -> (
        Lambda<impl Fn(String, WorkflowContext) -> futures::future::Ready<Result<u64>> + Send + Sync>,
        Arc<AtomicU64>,
    ) {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let p = Lambda::new("expensive", move |_: String, _ctx| {
            futures::future::ready(Ok(counter.fetch_add(1, Ordering::SeqCst) + 1))
        });
        (p, calls)
    }

    fn key_fn(input: &String, _ctx: &WorkflowContext) -> String {
        input.clone()
    }

    #[tokio::test]
    async fn test_repeated_calls_hit_cache() {
        let (p, calls) = counting();
        let adaptive = AdaptiveCache::new(p, key_fn, AdaptiveConfig::new(LearningMode::Observe));
        let ctx = WorkflowContext::new();

        assert_eq!(adaptive.execute("q".into(), &ctx).await.unwrap(), 1);
        assert_eq!(adaptive.execute("q".into(), &ctx).await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = adaptive.cache_stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_distinct_keys_cached_separately() {
        let (p, calls) = counting();
        let adaptive = AdaptiveCache::new(p, key_fn, AdaptiveConfig::new(LearningMode::Observe));
        let ctx = WorkflowContext::new();

        adaptive.execute("a".into(), &ctx).await.unwrap();
        adaptive.execute("b".into(), &ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(adaptive.cache_stats().await.entry_count, 2);
    }

    #[tokio::test]
    async fn test_short_ttl_expires() {
        let (p, calls) = counting();
        let adaptive = AdaptiveCache::with_baseline(
            p,
            key_fn,
            CacheConfig::new().with_ttl(Duration::from_millis(20)),
            AdaptiveConfig::new(LearningMode::Observe),
        );
        let ctx = WorkflowContext::new();

        adaptive.execute("a".into(), &ctx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        adaptive.execute("a".into(), &ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_observe_mode_keeps_single_strategy() {
        let (p, _) = counting();
        let adaptive = AdaptiveCache::new(
            p,
            key_fn,
            AdaptiveConfig::new(LearningMode::Observe).with_min_observations(2),
        );
        let ctx = WorkflowContext::new().with_environment("production");

        for i in 0..20 {
            adaptive
                .execute(format!("k{}", i % 3), &ctx)
                .await
                .unwrap();
        }
        assert_eq!(adaptive.stats().strategies.len(), 1);
    }

    #[tokio::test]
    async fn test_active_mode_learns_ttl_from_reuse() {
        let (p, _) = counting();
        let adaptive = AdaptiveCache::new(
            p,
            key_fn,
            AdaptiveConfig::new(LearningMode::Active).with_min_observations(5),
        )
        .with_ttl_bounds(Duration::from_secs(1), Duration::from_secs(10));
        let ctx = WorkflowContext::new().with_environment("production");

        // Repeated reuse of a few keys produces reuse intervals.
        for i in 0..30 {
            adaptive
                .execute(format!("k{}", i % 2), &ctx)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let stats = adaptive.cache_stats().await;
        assert!(stats.reuse_median_ms.contains_key("production"));
        assert!(stats.adaptive.strategies.len() > 1);
        let learned_name = stats
            .adaptive
            .strategies
            .keys()
            .find(|name| name.starts_with("production_optimized"))
            .cloned()
            .expect("learned strategy exists");
        // Learned TTL is clamped to the configured bounds.
        let learned = adaptive.engine.strategy(&learned_name).unwrap();
        let ttl = learned.param_f64("ttl_seconds", 0.0);
        assert!((1.0..=10.0).contains(&ttl));
    }

    #[tokio::test]
    async fn test_clear_resets_entries() {
        let (p, calls) = counting();
        let adaptive = AdaptiveCache::new(p, key_fn, AdaptiveConfig::new(LearningMode::Observe));
        let ctx = WorkflowContext::new();

        adaptive.execute("a".into(), &ctx).await.unwrap();
        adaptive.clear().await;
        adaptive.execute("a".into(), &ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Nothing is near the baseline TTL, so eviction keeps the entry.
        adaptive.evict_expired(&ctx).await;
        assert_eq!(adaptive.cache_stats().await.entry_count, 1);
    }

    #[tokio::test]
    async fn test_baseline_parameters_present() {
        let (p, _) = counting();
        let adaptive = AdaptiveCache::new(p, key_fn, AdaptiveConfig::new(LearningMode::Validate));
        let baseline = adaptive.engine.strategy("baseline").unwrap();
        assert_eq!(baseline.param_f64("ttl_seconds", 0.0), 3600.0);
        assert_eq!(baseline.param_u64("max_cache_size", 0), 1000);
    }
}
