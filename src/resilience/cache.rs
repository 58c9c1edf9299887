//! Keyed result caching with TTL and LRU eviction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::context::WorkflowContext;
use crate::error::Result;
use crate::observability::{emit, observed, WorkflowEvent};
use crate::primitive::{Primitive, SharedPrimitive};

/// Function deriving the deterministic cache key from input and context.
pub type CacheKeyFn<I> = Arc<dyn Fn(&I, &WorkflowContext) -> String + Send + Sync>;

/// Default cache key: SHA-256 over the JSON rendering of the input.
pub fn content_key<I: Serialize>(input: &I) -> String {
    let mut hasher = Sha256::new();
    match serde_json::to_string(input) {
        Ok(json) => hasher.update(json.as_bytes()),
        Err(_) => hasher.update(b"<unserializable>"),
    }
    format!("{:x}", hasher.finalize())
}

/// Configuration for [`Cache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Per-entry time to live
    pub ttl: Duration,
    /// Maximum number of entries before LRU eviction
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_size: 1000,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size.max(1);
        self
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<O> {
    value: O,
    inserted_at: Instant,
    last_access: Instant,
    hits: u64,
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entry_count: usize,
}

impl CacheStats {
    /// Hit ratio; 0 when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Caches the wrapped primitive's results by key.
///
/// A lookup within TTL returns the stored value without invoking the child;
/// anything else computes, stores, and evicts least-recently-used entries
/// down to capacity. Values are stored only on normal return, so a failed
/// or cancelled computation never pollutes the cache.
pub struct Cache<I, O> {
    inner: SharedPrimitive<I, O>,
    key_fn: CacheKeyFn<I>,
    config: CacheConfig,
    entries: RwLock<HashMap<String, CacheEntry<O>>>,
    stats: RwLock<CacheStats>,
    name: String,
}

impl<I, O> Cache<I, O>
where
    I: Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    pub fn new<P, F>(inner: P, key_fn: F, config: CacheConfig) -> Self
    where
        P: Primitive<I, O> + 'static,
        F: Fn(&I, &WorkflowContext) -> String + Send + Sync + 'static,
    {
        let name = format!("Cache({})", inner.name());
        Self {
            inner: Arc::new(inner),
            key_fn: Arc::new(key_fn),
            config,
            entries: RwLock::new(HashMap::new()),
            stats: RwLock::new(CacheStats::default()),
            name,
        }
    }

    /// Set a custom name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Current statistics snapshot.
    pub async fn stats(&self) -> CacheStats {
        let mut stats = self.stats.read().await.clone();
        stats.entry_count = self.entries.read().await.len();
        stats
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Drop entries past their TTL.
    pub async fn evict_expired(&self) {
        let ttl = self.config.ttl;
        self.entries
            .write()
            .await
            .retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
    }

    async fn lookup(&self, key: &str) -> Option<O> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(key)?;
        if entry.inserted_at.elapsed() > self.config.ttl {
            return None;
        }
        entry.last_access = Instant::now();
        entry.hits += 1;
        Some(entry.value.clone())
    }

    async fn store(&self, key: String, value: O) {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                last_access: now,
                hits: 0,
            },
        );

        let mut evicted = 0u64;
        while entries.len() > self.config.max_size {
            let victim = entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    entries.remove(&k);
                    evicted += 1;
                }
                None => break,
            }
        }
        if evicted > 0 {
            self.stats.write().await.evictions += evicted;
        }
    }
}

#[async_trait]
impl<I, O> Primitive<I, O> for Cache<I, O>
where
    I: Send + Sync + 'static,
    O: Clone + Send + Sync + 'static,
{
    async fn execute(&self, input: I, ctx: &WorkflowContext) -> Result<O> {
        observed("Cache", &self.name, ctx, async {
            let key = (self.key_fn)(&input, ctx);

            if let Some(value) = self.lookup(&key).await {
                self.stats.write().await.hits += 1;
                tracing::debug!(primitive = %self.name, key = %key, "cache hit");
                emit(WorkflowEvent::cache_hit(&self.name, ctx, &key));
                return Ok(value);
            }

            self.stats.write().await.misses += 1;
            emit(WorkflowEvent::cache_miss(&self.name, ctx, &key));

            let value = self.inner.execute(input, ctx).await?;
            self.store(key, value.clone()).await;
            Ok(value)
        })
        .await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
