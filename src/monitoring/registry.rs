use super::alerts::Alert;
use super::clock::Clock;
use super::distribution::{DistributionCalculator, DistributionSnapshot};
use super::window::{BucketLayout, SampleWindow};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const GLOBAL_WINDOW_KEY: &str = "__global__";

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub window_capacity: usize,
    pub max_sample_ms: f64,
    pub stats_cache_ttl: Duration,
    /// Handles older than this are treated as abandoned
    pub timing_handle_ttl: Duration,
    pub layout: Arc<BucketLayout>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            window_capacity: 10_000,
            max_sample_ms: super::window::DEFAULT_MAX_SAMPLE_MS,
            stats_cache_ttl: super::distribution::DEFAULT_STATS_CACHE_TTL,
            timing_handle_ttl: Duration::from_secs(300),
            layout: Arc::new(BucketLayout::default()),
        }
    }
}

/// Opaque handle returned by [`MetricsRegistry::start_timing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimingHandle {
    id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsSummary {
    pub total_keys: usize,
    pub total_samples: usize,
    pub total_recorded: u64,
    pub rejected_samples: u64,
    pub avg_global_latency_ms: f64,
    pub active_alert_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllStats {
    pub global: DistributionSnapshot,
    pub per_key: BTreeMap<String, DistributionSnapshot>,
    pub alerts: Vec<Alert>,
    pub summary: StatsSummary,
}

#[derive(Debug)]
struct TrackedWindow {
    window: SampleWindow,
    calculator: DistributionCalculator,
}

impl TrackedWindow {
    fn new(key: &str, config: &RegistryConfig) -> Self {
        Self {
            window: SampleWindow::with_layout(
                key,
                config.window_capacity,
                config.max_sample_ms,
                config.layout.clone(),
            ),
            calculator: DistributionCalculator::new(config.stats_cache_ttl),
        }
    }
}

/// One sample window per operation key plus a global window fed by every record.
#[derive(Debug)]
pub struct MetricsRegistry {
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    windows: DashMap<String, Arc<TrackedWindow>>,
    global: TrackedWindow,
    active_timings: DashMap<u64, Duration>,
    next_handle: AtomicU64,
    rejected: AtomicU64,
}

impl MetricsRegistry {
    pub fn new(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        let global = TrackedWindow::new(GLOBAL_WINDOW_KEY, &config);
        Self {
            config,
            clock,
            windows: DashMap::new(),
            global,
            active_timings: DashMap::new(),
            next_handle: AtomicU64::new(1),
            rejected: AtomicU64::new(0),
        }
    }

    /// Handle that is never tracked; ending it always yields `None`.
    pub fn untracked_handle(&self) -> TimingHandle {
        TimingHandle { id: 0 }
    }

    /// Forget a handle without recording anything; returns whether it was live.
    pub fn discard_timing(&self, handle: TimingHandle) -> bool {
        self.active_timings.remove(&handle.id).is_some()
    }

    pub fn start_timing(&self) -> TimingHandle {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.active_timings.insert(id, self.clock.elapsed());
        TimingHandle { id }
    }

    /// Record the time elapsed since `start_timing` under `key`.
    ///
    /// Unknown, already-ended or expired handles yield `None`.
    pub fn end_timing(&self, key: &str, handle: TimingHandle) -> Option<f64> {
        let (_, started) = self.active_timings.remove(&handle.id)?;
        let elapsed = self.clock.elapsed().saturating_sub(started);

        if elapsed > self.config.timing_handle_ttl {
            debug!(key, handle = handle.id, "Discarding expired timing handle");
            return None;
        }

        let duration_ms = elapsed.as_secs_f64() * 1000.0;
        self.record_ms(key, duration_ms).then_some(duration_ms)
    }

    /// Record a duration directly; returns whether it was accepted.
    ///
    /// Invalid values never create a window for `key`.
    pub fn record_ms(&self, key: &str, value_ms: f64) -> bool {
        let now = self.clock.now();

        if !SampleWindow::is_valid_sample(value_ms, self.config.max_sample_ms) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            // Only a window that already exists keeps a per-key rejection count.
            if let Some(tracked) = self.windows.get(key).map(|w| Arc::clone(w.value())) {
                tracked.window.record(value_ms, now);
            } else {
                debug!(key, value_ms, "Rejected invalid sample");
            }
            return false;
        }

        let tracked = self.window_for(key);
        if !tracked.window.record(value_ms, now) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.global.window.record(value_ms, now);
        true
    }

    fn window_for(&self, key: &str) -> Arc<TrackedWindow> {
        if let Some(existing) = self.windows.get(key) {
            return Arc::clone(existing.value());
        }
        self.windows
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(key, "Created sample window");
                Arc::new(TrackedWindow::new(key, &self.config))
            })
            .value()
            .clone()
    }

    /// Distribution for `key`; unknown keys yield the empty snapshot.
    pub fn stats(&self, key: &str) -> DistributionSnapshot {
        match self.windows.get(key).map(|w| Arc::clone(w.value())) {
            Some(tracked) => tracked.calculator.stats(&tracked.window, self.clock.as_ref()),
            None => DistributionSnapshot::empty(&self.config.layout, self.clock.now()),
        }
    }

    pub fn global_stats(&self) -> DistributionSnapshot {
        self.global
            .calculator
            .stats(&self.global.window, self.clock.as_ref())
    }

    pub fn per_key_stats(&self) -> BTreeMap<String, DistributionSnapshot> {
        // Collect first so no map shard stays locked while sorting samples.
        let tracked: Vec<(String, Arc<TrackedWindow>)> = self
            .windows
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        tracked
            .into_iter()
            .map(|(key, t)| {
                let stats = t.calculator.stats(&t.window, self.clock.as_ref());
                (key, stats)
            })
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.windows.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn summary(&self, active_alert_count: usize) -> StatsSummary {
        let total_samples = self.windows.iter().map(|e| e.value().window.len()).sum();
        StatsSummary {
            total_keys: self.windows.len(),
            total_samples,
            total_recorded: self.global.window.recorded_count(),
            rejected_samples: self.rejected_samples(),
            avg_global_latency_ms: self.global_stats().mean,
            active_alert_count,
        }
    }

    pub fn all_stats(&self, alerts: Vec<Alert>) -> AllStats {
        let summary = self.summary(alerts.len());
        AllStats {
            global: self.global_stats(),
            per_key: self.per_key_stats(),
            alerts,
            summary,
        }
    }

    pub fn rejected_samples(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn active_timings(&self) -> usize {
        self.active_timings.len()
    }

    /// Drop handles that were never ended; returns how many were removed.
    pub fn purge_expired_timings(&self) -> usize {
        let now = self.clock.elapsed();
        let ttl = self.config.timing_handle_ttl;
        let before = self.active_timings.len();
        self.active_timings
            .retain(|_, started| now.saturating_sub(*started) <= ttl);
        let removed = before.saturating_sub(self.active_timings.len());
        if removed > 0 {
            warn!("Cleaned up {} abandoned timing handles", removed);
        }
        removed
    }

    pub fn clear(&self) {
        self.windows.clear();
        self.active_timings.clear();
        self.global.window.clear();
        self.global.calculator.invalidate();
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::clock::ManualClock;

    fn registry(clock: Arc<ManualClock>) -> MetricsRegistry {
        MetricsRegistry::new(RegistryConfig::default(), clock)
    }

    #[test]
    fn test_timing_lifecycle() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(clock.clone());

        let handle = registry.start_timing();
        assert_eq!(registry.active_timings(), 1);
        clock.advance(Duration::from_millis(25));

        let duration = registry.end_timing("query", handle).unwrap();
        assert!((duration - 25.0).abs() < 1e-6);
        assert_eq!(registry.active_timings(), 0);
        assert_eq!(registry.stats("query").count, 1);
        assert_eq!(registry.global_stats().count, 1);
    }

    #[test]
    fn test_unknown_and_reused_handles_return_none() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(clock.clone());

        let handle = registry.start_timing();
        assert!(registry.end_timing("a", handle).is_some());
        assert!(registry.end_timing("a", handle).is_none());

        let foreign = TimingHandle { id: 9_999 };
        assert!(registry.end_timing("a", foreign).is_none());
    }

    #[test]
    fn test_expired_handle_is_dropped() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(clock.clone());

        let handle = registry.start_timing();
        clock.advance(Duration::from_secs(301));
        assert!(registry.end_timing("slow", handle).is_none());
        assert_eq!(registry.stats("slow").count, 0);
    }

    #[test]
    fn test_purge_expired_timings() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(clock.clone());

        let _stale = registry.start_timing();
        clock.advance(Duration::from_secs(400));
        let _fresh = registry.start_timing();

        assert_eq!(registry.purge_expired_timings(), 1);
        assert_eq!(registry.active_timings(), 1);
    }

    #[test]
    fn test_summary_counts_keys_and_rejections() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(clock);

        registry.record_ms("a", 10.0);
        registry.record_ms("a", 30.0);
        registry.record_ms("b", 20.0);
        registry.record_ms("b", -1.0);

        let summary = registry.summary(0);
        assert_eq!(summary.total_keys, 2);
        assert_eq!(summary.total_samples, 3);
        assert_eq!(summary.total_recorded, 3);
        assert_eq!(summary.rejected_samples, 1);
        assert!((summary.avg_global_latency_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejected_samples_create_no_windows() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(clock);

        for i in 0..100 {
            assert!(!registry.record_ms(&format!("bogus_{i}"), -1.0));
        }
        assert!(!registry.record_ms("nan", f64::NAN));

        assert_eq!(registry.window_count(), 0);
        assert!(registry.per_key_stats().is_empty());
        assert_eq!(registry.summary(0).total_keys, 0);
        assert_eq!(registry.rejected_samples(), 101);

        // An existing window still counts its own rejections
        registry.record_ms("real", 5.0);
        registry.record_ms("real", f64::INFINITY);
        assert_eq!(registry.window_count(), 1);
        assert_eq!(registry.rejected_samples(), 102);
    }

    #[test]
    fn test_discarded_and_untracked_handles() {
        let clock = Arc::new(ManualClock::new());
        let registry = registry(clock);

        let handle = registry.start_timing();
        assert!(registry.discard_timing(handle));
        assert!(!registry.discard_timing(handle));
        assert_eq!(registry.active_timings(), 0);

        let untracked = registry.untracked_handle();
        assert_eq!(registry.active_timings(), 0);
        assert!(registry.end_timing("a", untracked).is_none());
        assert_eq!(registry.window_count(), 0);
    }

    #[test]
    fn test_unknown_key_returns_empty_snapshot() {
        let registry = registry(Arc::new(ManualClock::new()));
        assert!(registry.stats("missing").is_empty());
    }

    #[test]
    fn test_clear_drops_everything() {
        let registry = registry(Arc::new(ManualClock::new()));
        registry.record_ms("a", 1.0);
        let _ = registry.start_timing();

        registry.clear();

        assert_eq!(registry.window_count(), 0);
        assert_eq!(registry.active_timings(), 0);
        assert!(registry.global_stats().is_empty());
    }
}
