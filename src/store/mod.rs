//! Durability bridge for learned strategies.
//!
//! The store is optional: adaptive primitives run fine without one. When
//! attached, adoptions and demotions persist strategies and append to a
//! journal so learned behaviour survives the process and can be audited
//! post-mortem.

#[cfg(feature = "sqlite-store")]
mod sqlite;

#[cfg(feature = "sqlite-store")]
pub use sqlite::SqliteStrategyStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adaptive::LearningStrategy;
use crate::error::Result;

/// One append-only learning-event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    /// Which adaptive primitive wrote the entry, e.g. `AdaptiveRetry`
    pub primitive_type: String,
    /// Event kind: adopted, promoted, demoted, evicted, hydrated, ...
    pub event: String,
    pub note: String,
}

/// Abstract sink persisting learned strategies and their journal.
#[async_trait]
pub trait StrategyStore: Send + Sync {
    /// Persist (or update) a strategy for a primitive type.
    async fn save_strategy(
        &self,
        primitive_type: &str,
        strategy: &LearningStrategy,
        context_key: &str,
        notes: Option<&str>,
    ) -> Result<()>;

    /// All persisted strategies for a primitive type.
    async fn list_strategies(&self, primitive_type: &str) -> Result<Vec<LearningStrategy>>;

    /// Append a journal entry.
    async fn append_journal(&self, entry: &JournalEntry) -> Result<()>;

    /// Journal entries for a primitive type, oldest first.
    async fn journal(&self, primitive_type: &str) -> Result<Vec<JournalEntry>>;
}
