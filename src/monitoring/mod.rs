pub mod alerts;
pub mod clock;
pub mod distribution;
pub mod engine;
pub mod error;
pub mod health;
pub mod metrics;
pub mod probes;
pub mod registry;
pub mod report;
pub mod trends;
pub mod window;

pub use alerts::*;
pub use clock::*;
pub use distribution::*;
pub use engine::*;
pub use error::{MonitoringError, Result};
pub use health::*;
pub use metrics::*;
pub use probes::*;
pub use registry::*;
pub use report::*;
pub use trends::*;
pub use window::*;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// Metric families that thresholds can be configured against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    ExecutionTimeP95,
    ExecutionTimeP99,
    CacheMissRate,
    WeakConnectionRatio,
    MemoryUsage,
    /// Raised as `info` when a latency trend turns degrading
    LatencyTrend,
    /// Free-form informational notices raised by callers
    Notice,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::ExecutionTimeP95 => "execution_time_p95",
            MetricType::ExecutionTimeP99 => "execution_time_p99",
            MetricType::CacheMissRate => "cache_miss_rate",
            MetricType::WeakConnectionRatio => "weak_connection_ratio",
            MetricType::MemoryUsage => "memory_usage",
            MetricType::LatencyTrend => "latency_trend",
            MetricType::Notice => "notice",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStrength {
    Strong,
    Moderate,
    Weak,
}

/// Component-specific signals fed by the host application alongside latency samples.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ComponentSignals {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub connections: VecDeque<ConnectionStrength>,
    pub memory_usage_mib: Option<f64>,
}

impl ComponentSignals {
    /// Miss rate in `[0, 1]`, `None` until the component has seen a cache lookup.
    pub fn cache_miss_rate(&self) -> Option<f64> {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            None
        } else {
            Some(self.cache_misses as f64 / total as f64)
        }
    }

    pub fn cache_hit_rate(&self) -> Option<f64> {
        self.cache_miss_rate().map(|miss| 1.0 - miss)
    }

    /// Share of recorded connections classified as weak.
    pub fn weak_connection_ratio(&self) -> Option<f64> {
        if self.connections.is_empty() {
            return None;
        }
        let weak = self
            .connections
            .iter()
            .filter(|c| **c == ConnectionStrength::Weak)
            .count();
        Some(weak as f64 / self.connections.len() as f64)
    }

    pub fn push_connection(&mut self, strength: ConnectionStrength, history: usize) {
        self.connections.push_back(strength);
        while self.connections.len() > history.max(1) {
            self.connections.pop_front();
        }
    }
}
