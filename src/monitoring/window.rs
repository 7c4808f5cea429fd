use super::error::{MonitoringError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Upper bounds (exclusive) of the fixed histogram buckets, in milliseconds.
/// A final unbounded bucket collects everything at or above the last bound.
pub const DEFAULT_BUCKET_BOUNDS_MS: [f64; 8] =
    [10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0];

/// Samples above this are treated as corrupt.
pub const DEFAULT_MAX_SAMPLE_MS: f64 = 1e9;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub value_ms: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistogramBucket {
    pub label: String,
    pub lower_ms: f64,
    pub upper_ms: Option<f64>,
    pub count: u64,
    pub percentage: f64,
}

/// Contiguous, exhaustive bucket ranges shared by every window of a registry.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketLayout {
    bounds: Vec<f64>,
}

impl Default for BucketLayout {
    fn default() -> Self {
        Self {
            bounds: DEFAULT_BUCKET_BOUNDS_MS.to_vec(),
        }
    }
}

impl BucketLayout {
    pub fn new(bounds: Vec<f64>) -> Result<Self> {
        if bounds.is_empty() {
            return Err(MonitoringError::Configuration(
                "histogram needs at least one bucket bound".to_string(),
            ));
        }
        if bounds.iter().any(|b| !b.is_finite() || *b <= 0.0) {
            return Err(MonitoringError::Configuration(
                "histogram bounds must be finite and positive".to_string(),
            ));
        }
        if bounds.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(MonitoringError::Configuration(
                "histogram bounds must be strictly ascending".to_string(),
            ));
        }
        Ok(Self { bounds })
    }

    /// Number of buckets, including the unbounded tail.
    pub fn bucket_count(&self) -> usize {
        self.bounds.len() + 1
    }

    pub fn bucket_index(&self, value_ms: f64) -> usize {
        self.bounds
            .iter()
            .position(|upper| value_ms < *upper)
            .unwrap_or(self.bounds.len())
    }

    pub fn range(&self, index: usize) -> (f64, Option<f64>) {
        let lower = if index == 0 {
            0.0
        } else {
            self.bounds[index - 1]
        };
        (lower, self.bounds.get(index).copied())
    }

    pub fn label(&self, index: usize) -> String {
        match self.range(index) {
            (lower, Some(upper)) => format!("{lower}-{upper}ms"),
            (lower, None) => format!("> {lower}ms"),
        }
    }

    /// Per-bucket count and share of `total`, in layout order.
    pub fn histogram(&self, counts: &[u64]) -> Vec<HistogramBucket> {
        let total: u64 = counts.iter().sum();
        (0..self.bucket_count())
            .map(|index| {
                let count = counts.get(index).copied().unwrap_or(0);
                let (lower_ms, upper_ms) = self.range(index);
                HistogramBucket {
                    label: self.label(index),
                    lower_ms,
                    upper_ms,
                    count,
                    percentage: if total > 0 {
                        count as f64 / total as f64 * 100.0
                    } else {
                        0.0
                    },
                }
            })
            .collect()
    }
}

/// Copy of a window's contents taken under its lock.
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub key: String,
    pub values: Vec<f64>,
    pub bucket_counts: Vec<u64>,
    pub generation: u64,
}

#[derive(Debug)]
struct WindowState {
    samples: VecDeque<Sample>,
    bucket_counts: Vec<u64>,
    /// Bumped on every mutation so cached statistics can tell they are stale.
    generation: u64,
}

/// Bounded FIFO of duration samples for one operation key.
#[derive(Debug)]
pub struct SampleWindow {
    key: String,
    capacity: usize,
    max_sample_ms: f64,
    layout: Arc<BucketLayout>,
    state: Mutex<WindowState>,
    recorded: AtomicU64,
    rejected: AtomicU64,
}

impl SampleWindow {
    pub fn new(key: impl Into<String>, capacity: usize, max_sample_ms: f64) -> Self {
        Self::with_layout(key, capacity, max_sample_ms, Arc::new(BucketLayout::default()))
    }

    pub fn with_layout(
        key: impl Into<String>,
        capacity: usize,
        max_sample_ms: f64,
        layout: Arc<BucketLayout>,
    ) -> Self {
        let capacity = capacity.max(1);
        let buckets = layout.bucket_count();
        Self {
            key: key.into(),
            capacity,
            max_sample_ms,
            layout,
            state: Mutex::new(WindowState {
                samples: VecDeque::with_capacity(capacity.min(1024)),
                bucket_counts: vec![0; buckets],
                generation: 0,
            }),
            recorded: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn is_valid_sample(value_ms: f64, max_sample_ms: f64) -> bool {
        value_ms.is_finite() && value_ms >= 0.0 && value_ms <= max_sample_ms
    }

    /// Append a sample, evicting the oldest one when full.
    ///
    /// Invalid values (negative, NaN, infinite, above the hard cap) are dropped
    /// and counted; returns whether the sample was kept.
    pub fn record(&self, value_ms: f64, timestamp: DateTime<Utc>) -> bool {
        if !Self::is_valid_sample(value_ms, self.max_sample_ms) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(key = %self.key, value_ms, "Rejected invalid sample");
            return false;
        }

        let bucket = self.layout.bucket_index(value_ms);
        {
            let mut state = self.state.lock();
            if state.samples.len() >= self.capacity {
                if let Some(evicted) = state.samples.pop_front() {
                    let evicted_bucket = self.layout.bucket_index(evicted.value_ms);
                    state.bucket_counts[evicted_bucket] =
                        state.bucket_counts[evicted_bucket].saturating_sub(1);
                }
            }
            state.samples.push_back(Sample {
                value_ms,
                timestamp,
            });
            state.bucket_counts[bucket] += 1;
            state.generation = state.generation.wrapping_add(1);
        }

        self.recorded.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Copy the current contents and release the lock immediately.
    pub fn snapshot(&self) -> WindowSnapshot {
        let state = self.state.lock();
        WindowSnapshot {
            key: self.key.clone(),
            values: state.samples.iter().map(|s| s.value_ms).collect(),
            bucket_counts: state.bucket_counts.clone(),
            generation: state.generation,
        }
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.state.lock().samples.iter().copied().collect()
    }

    pub fn histogram(&self) -> Vec<HistogramBucket> {
        let counts = self.state.lock().bucket_counts.clone();
        self.layout.histogram(&counts)
    }

    pub fn bucket_counts(&self) -> Vec<u64> {
        self.state.lock().bucket_counts.clone()
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn len(&self) -> usize {
        self.state.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.samples.clear();
        state.bucket_counts.iter_mut().for_each(|c| *c = 0);
        state.generation = state.generation.wrapping_add(1);
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn layout(&self) -> &BucketLayout {
        &self.layout
    }

    /// Samples accepted over the window's lifetime, including evicted ones.
    pub fn recorded_count(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
