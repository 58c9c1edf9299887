//! Metrics collection for primitive executions.
//!
//! The collector interface is intentionally narrow: one record per execute
//! with name, duration, and outcome. The default collector is a no-op so
//! the runtime works without any metrics backend; [`InMemoryMetricsCollector`]
//! keeps rollups in process for stats surfaces and tests.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Abstract collector for per-primitive execution metrics.
pub trait MetricsCollector: Send + Sync {
    /// Record a single execution.
    fn record_execution(&self, primitive: &str, duration_ms: f64, success: bool);
}

/// Collector that discards everything.
pub struct NoopMetricsCollector;

impl MetricsCollector for NoopMetricsCollector {
    fn record_execution(&self, _primitive: &str, _duration_ms: f64, _success: bool) {}
}

/// Rolled-up metrics for one primitive name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveMetrics {
    /// Total executions recorded
    pub executions: u64,
    /// Successful executions
    pub successes: u64,
    /// Failed executions
    pub failures: u64,
    /// Exponentially-weighted moving average latency
    pub avg_duration_ms: f64,
    /// Largest observed latency
    pub max_duration_ms: f64,
}

impl PrimitiveMetrics {
    /// Success ratio; 0 when nothing was recorded.
    pub fn success_rate(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.successes as f64 / self.executions as f64
        }
    }
}

/// EWMA smoothing factor for latency rollups.
const LATENCY_ALPHA: f64 = 0.2;

/// In-process metrics collector with per-primitive rollups.
#[derive(Default)]
pub struct InMemoryMetricsCollector {
    inner: RwLock<HashMap<String, PrimitiveMetrics>>,
}

impl InMemoryMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all rollups.
    pub fn snapshot(&self) -> HashMap<String, PrimitiveMetrics> {
        self.inner.read().map(|m| m.clone()).unwrap_or_default()
    }

    /// Rollup for one primitive name, if anything was recorded.
    pub fn metrics_for(&self, primitive: &str) -> Option<PrimitiveMetrics> {
        self.inner.read().ok()?.get(primitive).cloned()
    }
}

impl MetricsCollector for InMemoryMetricsCollector {
    fn record_execution(&self, primitive: &str, duration_ms: f64, success: bool) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        let entry = inner.entry(primitive.to_string()).or_default();
        entry.executions += 1;
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
        entry.avg_duration_ms = if entry.executions == 1 {
            duration_ms
        } else {
            entry.avg_duration_ms * (1.0 - LATENCY_ALPHA) + duration_ms * LATENCY_ALPHA
        };
        if duration_ms > entry.max_duration_ms {
            entry.max_duration_ms = duration_ms;
        }
    }
}

static COLLECTOR: RwLock<Option<&'static dyn MetricsCollector>> = RwLock::new(None);

/// Install a process-wide metrics collector.
pub fn set_metrics_collector(collector: &'static dyn MetricsCollector) {
    if let Ok(mut slot) = COLLECTOR.write() {
        *slot = Some(collector);
    }
}

/// The installed collector, or the shared no-op when none is set.
pub fn metrics_collector() -> &'static dyn MetricsCollector {
    static NOOP: NoopMetricsCollector = NoopMetricsCollector;
    if let Ok(slot) = COLLECTOR.read() {
        if let Some(collector) = *slot {
            return collector;
        }
    }
    &NOOP
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_records_counts_and_rates() {
        let collector = InMemoryMetricsCollector::new();
        collector.record_execution("Retry", 10.0, true);
        collector.record_execution("Retry", 20.0, true);
        collector.record_execution("Retry", 30.0, false);

        let m = collector.metrics_for("Retry").unwrap();
        assert_eq!(m.executions, 3);
        assert_eq!(m.successes, 2);
        assert_eq!(m.failures, 1);
        assert!((m.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(m.max_duration_ms, 30.0);
    }

    #[test]
    fn test_ewma_seeded_by_first_sample() {
        let collector = InMemoryMetricsCollector::new();
        collector.record_execution("Cache", 100.0, true);
        let m = collector.metrics_for("Cache").unwrap();
        assert_eq!(m.avg_duration_ms, 100.0);

        collector.record_execution("Cache", 200.0, true);
        let m = collector.metrics_for("Cache").unwrap();
        assert_eq!(m.avg_duration_ms, 100.0 * 0.8 + 200.0 * 0.2);
    }

    #[test]
    fn test_empty_success_rate_is_zero() {
        assert_eq!(PrimitiveMetrics::default().success_rate(), 0.0);
    }

    #[test]
    fn test_noop_collector_never_panics() {
        NoopMetricsCollector.record_execution("anything", 1.0, false);
    }
}
