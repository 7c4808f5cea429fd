use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Degrading,
}

impl fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrendDirection::Improving => write!(f, "improving"),
            TrendDirection::Stable => write!(f, "stable"),
            TrendDirection::Degrading => write!(f, "degrading"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    LowerIsBetter,
    HigherIsBetter,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrendMetric {
    MeanLatency,
    P95Latency,
    CacheHitRate,
    HealthScore,
}

impl TrendMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendMetric::MeanLatency => "mean_latency",
            TrendMetric::P95Latency => "p95_latency",
            TrendMetric::CacheHitRate => "cache_hit_rate",
            TrendMetric::HealthScore => "health_score",
        }
    }

    pub fn default_polarity(&self) -> Polarity {
        match self {
            TrendMetric::MeanLatency | TrendMetric::P95Latency => Polarity::LowerIsBetter,
            TrendMetric::CacheHitRate | TrendMetric::HealthScore => Polarity::HigherIsBetter,
        }
    }

    pub fn is_latency(&self) -> bool {
        matches!(self, TrendMetric::MeanLatency | TrendMetric::P95Latency)
    }
}

impl fmt::Display for TrendMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TrendPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trend {
    pub key: String,
    pub metric: TrendMetric,
    pub polarity: Polarity,
    pub points: VecDeque<TrendPoint>,
    pub direction: TrendDirection,
    /// Linear projection `lookahead` ticks ahead; a heuristic, not a forecast
    pub predicted_next: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrendSettings {
    pub history_len: usize,
    /// Points averaged on each side of the comparison
    pub window: usize,
    /// Ticks between the recent and the older window
    pub offset: usize,
    pub hysteresis: f64,
    pub lookahead: usize,
    pub polarity_overrides: BTreeMap<TrendMetric, Polarity>,
}

impl Default for TrendSettings {
    fn default() -> Self {
        Self {
            history_len: 20,
            window: 3,
            offset: 5,
            hysteresis: 0.10,
            lookahead: 3,
            polarity_overrides: BTreeMap::new(),
        }
    }
}

/// Direction change produced by a new point.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendChange {
    pub key: String,
    pub metric: TrendMetric,
    pub from: TrendDirection,
    pub to: TrendDirection,
    pub recent: f64,
}

#[derive(Debug, Default)]
pub struct TrendTracker {
    settings: TrendSettings,
    series: HashMap<(String, TrendMetric), Trend>,
}

impl TrendTracker {
    pub fn new(settings: TrendSettings) -> Self {
        Self {
            settings,
            series: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &TrendSettings {
        &self.settings
    }

    pub fn polarity(&self, metric: TrendMetric) -> Polarity {
        self.settings
            .polarity_overrides
            .get(&metric)
            .copied()
            .unwrap_or_else(|| metric.default_polarity())
    }

    /// Append one point and reclassify the series; returns the direction
    /// change, if any.
    pub fn record(
        &mut self,
        key: &str,
        metric: TrendMetric,
        value: f64,
        now: DateTime<Utc>,
    ) -> Option<TrendChange> {
        if !value.is_finite() {
            debug!(key, %metric, "Skipping non-finite trend point");
            return None;
        }

        let polarity = self.polarity(metric);
        let settings = &self.settings;
        let trend = self
            .series
            .entry((key.to_string(), metric))
            .or_insert_with(|| Trend {
                key: key.to_string(),
                metric,
                polarity,
                points: VecDeque::with_capacity(settings.history_len),
                direction: TrendDirection::Stable,
                predicted_next: None,
            });

        trend.points.push_back(TrendPoint {
            timestamp: now,
            value,
        });
        while trend.points.len() > settings.history_len.max(1) {
            trend.points.pop_front();
        }

        let values: Vec<f64> = trend.points.iter().map(|p| p.value).collect();
        let previous = trend.direction;
        let comparison = compare_windows(&values, settings.window, settings.offset);

        match comparison {
            Some((recent, older)) => {
                trend.direction = classify(recent, older, settings.hysteresis, polarity);
                trend.predicted_next =
                    Some(predict(recent, older, settings.offset, settings.lookahead));
                if trend.direction != previous {
                    info!(
                        key,
                        %metric,
                        from = %previous,
                        to = %trend.direction,
                        "Trend direction changed"
                    );
                    return Some(TrendChange {
                        key: key.to_string(),
                        metric,
                        from: previous,
                        to: trend.direction,
                        recent,
                    });
                }
                None
            }
            None => {
                trend.direction = TrendDirection::Stable;
                trend.predicted_next = None;
                None
            }
        }
    }

    pub fn trend(&self, key: &str, metric: TrendMetric) -> Option<&Trend> {
        self.series.get(&(key.to_string(), metric))
    }

    /// All trends, or those of one key, ordered by key then metric
    pub fn trends(&self, key: Option<&str>) -> Vec<Trend> {
        let mut trends: Vec<Trend> = self
            .series
            .values()
            .filter(|t| key.map_or(true, |k| t.key == k))
            .cloned()
            .collect();
        trends.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.metric.cmp(&b.metric)));
        trends
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn clear(&mut self) {
        self.series.clear();
    }
}

/// Means of the latest `window` points and of the `window` points ending
/// `offset` positions earlier. `None` until enough history exists.
pub fn compare_windows(values: &[f64], window: usize, offset: usize) -> Option<(f64, f64)> {
    let window = window.max(1);
    let n = values.len();
    if n < window + offset {
        return None;
    }
    let mean = |slice: &[f64]| slice.iter().sum::<f64>() / slice.len() as f64;
    let recent = mean(&values[n - window..]);
    let older = mean(&values[n - window - offset..n - offset]);
    Some((recent, older))
}

pub fn classify(recent: f64, older: f64, band: f64, polarity: Polarity) -> TrendDirection {
    let rose = recent > older * (1.0 + band);
    let fell = recent < older * (1.0 - band);

    match (polarity, rose, fell) {
        (Polarity::LowerIsBetter, _, true) | (Polarity::HigherIsBetter, true, _) => {
            TrendDirection::Improving
        }
        (Polarity::LowerIsBetter, true, _) | (Polarity::HigherIsBetter, _, true) => {
            TrendDirection::Degrading
        }
        _ => TrendDirection::Stable,
    }
}

/// `recent + slope * lookahead`, floored at zero since every tracked metric
/// is non-negative.
pub fn predict(recent: f64, older: f64, steps_between: usize, lookahead: usize) -> f64 {
    let slope = (recent - older) / steps_between.max(1) as f64;
    (recent + slope * lookahead as f64).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn feed(tracker: &mut TrendTracker, metric: TrendMetric, values: &[f64]) -> Vec<TrendChange> {
        let start = Utc::now();
        values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| {
                tracker.record("search", metric, *v, start + Duration::seconds(30 * i as i64))
            })
            .collect()
    }

    #[test]
    fn test_decreasing_latency_is_improving() {
        let mut tracker = TrendTracker::default();
        let series: Vec<f64> = (0..10).map(|i| 200.0 - 15.0 * i as f64).collect();
        feed(&mut tracker, TrendMetric::MeanLatency, &series);

        let trend = tracker.trend("search", TrendMetric::MeanLatency).unwrap();
        assert_eq!(trend.direction, TrendDirection::Improving);
    }

    #[test]
    fn test_increasing_latency_is_degrading() {
        let mut tracker = TrendTracker::default();
        let series: Vec<f64> = (0..10).map(|i| 100.0 + 20.0 * i as f64).collect();
        let changes = feed(&mut tracker, TrendMetric::MeanLatency, &series);

        let trend = tracker.trend("search", TrendMetric::MeanLatency).unwrap();
        assert_eq!(trend.direction, TrendDirection::Degrading);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to, TrendDirection::Degrading);
        assert!(trend.predicted_next.unwrap() > series[9]);
    }

    #[test]
    fn test_polarity_reverses_comparison() {
        let mut tracker = TrendTracker::default();
        let rising: Vec<f64> = (0..10).map(|i| 0.5 + 0.04 * i as f64).collect();
        feed(&mut tracker, TrendMetric::CacheHitRate, &rising);

        let trend = tracker.trend("search", TrendMetric::CacheHitRate).unwrap();
        assert_eq!(trend.polarity, Polarity::HigherIsBetter);
        assert_eq!(trend.direction, TrendDirection::Improving);
    }

    #[test]
    fn test_polarity_override() {
        let mut settings = TrendSettings::default();
        settings
            .polarity_overrides
            .insert(TrendMetric::MeanLatency, Polarity::HigherIsBetter);
        let mut tracker = TrendTracker::new(settings);
        let rising: Vec<f64> = (0..10).map(|i| 100.0 + 20.0 * i as f64).collect();
        feed(&mut tracker, TrendMetric::MeanLatency, &rising);

        let trend = tracker.trend("search", TrendMetric::MeanLatency).unwrap();
        assert_eq!(trend.direction, TrendDirection::Improving);
    }

    #[test]
    fn test_small_changes_stay_stable() {
        assert_eq!(
            classify(105.0, 100.0, 0.10, Polarity::LowerIsBetter),
            TrendDirection::Stable
        );
        assert_eq!(
            classify(95.0, 100.0, 0.10, Polarity::LowerIsBetter),
            TrendDirection::Stable
        );
        assert_eq!(
            classify(111.0, 100.0, 0.10, Polarity::LowerIsBetter),
            TrendDirection::Degrading
        );
    }

    #[test]
    fn test_warm_up_is_stable_without_prediction() {
        let mut tracker = TrendTracker::default();
        feed(&mut tracker, TrendMetric::P95Latency, &[10.0, 50.0, 500.0]);
        let trend = tracker.trend("search", TrendMetric::P95Latency).unwrap();
        assert_eq!(trend.direction, TrendDirection::Stable);
        assert!(trend.predicted_next.is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut tracker = TrendTracker::default();
        let series: Vec<f64> = (0..50).map(|i| i as f64).collect();
        feed(&mut tracker, TrendMetric::MeanLatency, &series);
        let trend = tracker.trend("search", TrendMetric::MeanLatency).unwrap();
        assert_eq!(trend.points.len(), 20);
        assert_eq!(trend.points[0].value, 30.0);
    }

    #[test]
    fn test_prediction_is_linear_and_floored() {
        // slope = (70 - 100) / 5 = -6, 70 - 18 = 52
        assert_eq!(predict(70.0, 100.0, 5, 3), 52.0);
        assert_eq!(predict(1.0, 100.0, 5, 3), 0.0);
    }
}
