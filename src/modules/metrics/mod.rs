//! Metrics collection utilities.
//!
//! Aggregates global and per-query-kind counters (upstream calls, successes,
//! cache hits, retries per tier, terminal failures) plus latency percentiles.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::events::RetryTier;
use crate::challenges::core::QueryKind;

/// Aggregated metrics across all query kinds.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub upstream_calls: u64,
    pub successes: u64,
    pub cache_hits: u64,
    pub retries: u64,
    pub failures: u64,
    pub fatal_failures: u64,
    pub average_latency: Option<Duration>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            upstream_calls: 0,
            successes: 0,
            cache_hits: 0,
            retries: 0,
            failures: 0,
            fatal_failures: 0,
            average_latency: None,
        }
    }
}

/// Per-kind metrics snapshot.
#[derive(Debug, Clone)]
pub struct KindStats {
    pub kind: QueryKind,
    pub upstream_calls: u64,
    pub successes: u64,
    pub cache_hits: u64,
    pub retries: HashMap<RetryTier, u64>,
    pub failures: u64,
    pub fatal_failures: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

impl KindStats {
    fn from_accumulator(kind: QueryKind, acc: &KindAccumulator) -> Self {
        let (avg, p95) = acc.latency_stats();
        Self {
            kind,
            upstream_calls: acc.upstream_calls,
            successes: acc.successes,
            cache_hits: acc.cache_hits,
            retries: acc.retries.clone(),
            failures: acc.failures,
            fatal_failures: acc.fatal_failures,
            average_latency: avg,
            p95_latency: p95,
        }
    }

    pub fn retries_for(&self, tier: RetryTier) -> u64 {
        self.retries.get(&tier).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub kinds: Vec<KindStats>,
}

impl MetricsSnapshot {
    pub fn kind(&self, kind: QueryKind) -> Option<&KindStats> {
        self.kinds.iter().find(|stats| stats.kind == kind)
    }
}

#[derive(Debug)]
struct KindAccumulator {
    upstream_calls: u64,
    successes: u64,
    cache_hits: u64,
    retries: HashMap<RetryTier, u64>,
    failures: u64,
    fatal_failures: u64,
    latencies: VecDeque<Duration>,
    max_window: usize,
}

impl KindAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            upstream_calls: 0,
            successes: 0,
            cache_hits: 0,
            retries: HashMap::new(),
            failures: 0,
            fatal_failures: 0,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
        }
    }

    fn record_latency(&mut self, latency: Duration) {
        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        if self.latencies.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.latencies.iter().cloned().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        (Some(Duration::from_secs_f64(avg)), Some(samples[p95_index]))
    }
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    max_window: usize,
    kinds: HashMap<QueryKind, KindAccumulator>,
}

impl MetricsState {
    fn new(max_window: usize) -> Self {
        Self {
            global: GlobalStats::default(),
            max_window,
            kinds: HashMap::new(),
        }
    }

    fn accumulator_mut(&mut self, kind: QueryKind) -> &mut KindAccumulator {
        self.kinds
            .entry(kind)
            .or_insert_with(|| KindAccumulator::new(self.max_window))
    }
}

/// Thread-safe metrics collector shared by the orchestrator and handlers.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(128))),
        }
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16)))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record an upstream answer. Only `status == 200` counts as a success.
    pub fn record_response(&self, kind: QueryKind, status: Option<i64>, latency: Duration) {
        let success = status == Some(200);
        let mut guard = self.lock();
        guard.global.upstream_calls += 1;
        if success {
            guard.global.successes += 1;
        }
        guard.global.average_latency = Some(match guard.global.average_latency {
            Some(avg) => {
                Duration::from_secs_f64(avg.as_secs_f64() * 0.9 + latency.as_secs_f64() * 0.1)
            }
            None => latency,
        });

        let acc = guard.accumulator_mut(kind);
        acc.upstream_calls += 1;
        if success {
            acc.successes += 1;
        }
        acc.record_latency(latency);
    }

    pub fn record_cache_hit(&self, kind: QueryKind) {
        let mut guard = self.lock();
        guard.global.cache_hits += 1;
        guard.global.successes += 1;
        let acc = guard.accumulator_mut(kind);
        acc.cache_hits += 1;
        acc.successes += 1;
    }

    pub fn record_retry(&self, kind: QueryKind, tier: RetryTier) {
        let mut guard = self.lock();
        guard.global.retries += 1;
        *guard.accumulator_mut(kind).retries.entry(tier).or_default() += 1;
    }

    pub fn record_failure(&self, kind: QueryKind, fatal: bool) {
        let mut guard = self.lock();
        guard.global.failures += 1;
        if fatal {
            guard.global.fatal_failures += 1;
        }
        let acc = guard.accumulator_mut(kind);
        acc.failures += 1;
        if fatal {
            acc.fatal_failures += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.lock();
        let mut kinds: Vec<_> = guard
            .kinds
            .iter()
            .map(|(kind, acc)| KindStats::from_accumulator(*kind, acc))
            .collect();
        kinds.sort_by_key(|stats| stats.kind.code());
        MetricsSnapshot {
            global: guard.global.clone(),
            kinds,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_per_kind_counters() {
        let metrics = MetricsCollector::new();
        metrics.record_response(QueryKind::AccidentHistory, Some(200), Duration::from_millis(150));
        metrics.record_response(QueryKind::AccidentHistory, None, Duration::from_millis(800));
        metrics.record_retry(QueryKind::AccidentHistory, RetryTier::Check);
        metrics.record_retry(QueryKind::AccidentHistory, RetryTier::Relay);
        metrics.record_retry(QueryKind::AccidentHistory, RetryTier::Relay);
        metrics.record_failure(QueryKind::WantedStatus, true);

        let snapshot = metrics.snapshot();
        let accidents = snapshot.kind(QueryKind::AccidentHistory).unwrap();
        assert_eq!(accidents.upstream_calls, 2);
        assert_eq!(accidents.successes, 1);
        assert_eq!(accidents.retries_for(RetryTier::Relay), 2);
        assert_eq!(accidents.retries_for(RetryTier::Challenge), 0);
        assert_eq!(accidents.p95_latency, Some(Duration::from_millis(800)));

        assert_eq!(snapshot.global.retries, 3);
        assert_eq!(snapshot.global.fatal_failures, 1);
        assert_eq!(snapshot.kind(QueryKind::WantedStatus).unwrap().failures, 1);
    }
}
