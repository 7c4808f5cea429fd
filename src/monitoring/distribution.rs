use super::clock::Clock;
use super::window::{BucketLayout, HistogramBucket, SampleWindow};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_STATS_CACHE_TTL: Duration = Duration::from_millis(100);

/// Point-in-time statistics over a sample window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributionSnapshot {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub p999: f64,
    pub std_dev: f64,
    pub histogram: Vec<HistogramBucket>,
    pub last_computed: DateTime<Utc>,
}

impl DistributionSnapshot {
    /// All-zero snapshot returned for windows without samples.
    pub fn empty(layout: &BucketLayout, now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            p50: 0.0,
            p75: 0.0,
            p90: 0.0,
            p95: 0.0,
            p99: 0.0,
            p999: 0.0,
            std_dev: 0.0,
            histogram: layout.histogram(&[]),
            last_computed: now,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Upper-rank percentile: `sorted[clamp(ceil(p/100 * n) - 1, 0, n-1)]`.
///
/// `sorted` must be ascending and non-empty.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    // The epsilon absorbs representation error in p (e.g. 99.9) so exact ranks stay exact.
    let rank = (p * n as f64 / 100.0 - 1e-9).ceil() as i64 - 1;
    let index = rank.clamp(0, n as i64 - 1) as usize;
    sorted[index]
}

#[derive(Debug, Clone)]
struct CachedSnapshot {
    snapshot: DistributionSnapshot,
    generation: u64,
    computed_at: Duration,
}

/// Computes and briefly caches the distribution of one window.
#[derive(Debug)]
pub struct DistributionCalculator {
    ttl: Duration,
    cache: Mutex<Option<CachedSnapshot>>,
}

impl Default for DistributionCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_STATS_CACHE_TTL)
    }
}

impl DistributionCalculator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Cached snapshot if it is younger than the TTL and the window has not
    /// changed since; otherwise recompute from a copy of the window.
    pub fn stats(&self, window: &SampleWindow, clock: &dyn Clock) -> DistributionSnapshot {
        let now = clock.elapsed();
        let generation = window.generation();

        if let Some(cached) = self.cache.lock().as_ref() {
            if cached.generation == generation && now.saturating_sub(cached.computed_at) < self.ttl
            {
                return cached.snapshot.clone();
            }
        }

        // Sorting happens on the copy, outside the window lock.
        let copy = window.snapshot();
        let snapshot = Self::compute(&copy.values, &copy.bucket_counts, window.layout(), clock.now());

        *self.cache.lock() = Some(CachedSnapshot {
            snapshot: snapshot.clone(),
            generation: copy.generation,
            computed_at: now,
        });
        snapshot
    }

    pub fn invalidate(&self) {
        *self.cache.lock() = None;
    }

    pub fn compute(
        values: &[f64],
        bucket_counts: &[u64],
        layout: &BucketLayout,
        now: DateTime<Utc>,
    ) -> DistributionSnapshot {
        if values.is_empty() {
            return DistributionSnapshot::empty(layout, now);
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        let mean = sum / count as f64;
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

        DistributionSnapshot {
            count,
            min: sorted[0],
            max: sorted[count - 1],
            mean,
            p50: percentile(&sorted, 50.0),
            p75: percentile(&sorted, 75.0),
            p90: percentile(&sorted, 90.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
            p999: percentile(&sorted, 99.9),
            std_dev: variance.sqrt(),
            histogram: layout.histogram(bucket_counts),
            last_computed: now,
        }
    }
}
