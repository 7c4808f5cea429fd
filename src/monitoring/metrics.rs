use super::alerts::Alert;
use super::error::Result;
use super::health::HealthReport;
use super::registry::AllStats;
use super::HealthStatus;
use prometheus::{
    exponential_buckets, Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::error;

const QUANTILES: [&str; 6] = ["0.5", "0.75", "0.9", "0.95", "0.99", "0.999"];

/// Prometheus view of the engine's latest evaluation
pub struct PrometheusExporter {
    registry: Registry,

    // Latency distribution
    pub latency_ms: GaugeVec,
    pub latency_mean_ms: GaugeVec,
    pub window_samples: IntGaugeVec,
    pub samples_recorded: IntGauge,
    pub samples_rejected: IntGauge,

    // Alerts
    pub active_alerts: IntGaugeVec,

    // Health
    pub health_score: GaugeVec,
    pub system_health: Gauge,

    // Evaluation loop
    pub evaluation_ticks_total: IntCounter,
    pub skipped_ticks_total: IntCounter,
    pub evaluation_duration_seconds: Histogram,
}

impl std::fmt::Debug for PrometheusExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusExporter").finish_non_exhaustive()
    }
}

impl PrometheusExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let latency_ms = GaugeVec::new(
            Opts::new("latency_watch_latency_ms", "Latency quantiles per operation key"),
            &["key", "quantile"],
        )?;
        registry.register(Box::new(latency_ms.clone()))?;

        let latency_mean_ms = GaugeVec::new(
            Opts::new("latency_watch_latency_mean_ms", "Mean latency per operation key"),
            &["key"],
        )?;
        registry.register(Box::new(latency_mean_ms.clone()))?;

        let window_samples = IntGaugeVec::new(
            Opts::new(
                "latency_watch_window_samples",
                "Samples currently held per operation key",
            ),
            &["key"],
        )?;
        registry.register(Box::new(window_samples.clone()))?;

        let samples_recorded = IntGauge::with_opts(Opts::new(
            "latency_watch_samples_recorded",
            "Samples accepted since the engine started",
        ))?;
        registry.register(Box::new(samples_recorded.clone()))?;

        let samples_rejected = IntGauge::with_opts(Opts::new(
            "latency_watch_samples_rejected",
            "Invalid samples dropped since the engine started",
        ))?;
        registry.register(Box::new(samples_rejected.clone()))?;

        let active_alerts = IntGaugeVec::new(
            Opts::new("latency_watch_active_alerts", "Active alerts by severity"),
            &["severity"],
        )?;
        registry.register(Box::new(active_alerts.clone()))?;

        let health_score = GaugeVec::new(
            Opts::new("latency_watch_health_score", "Health score per component"),
            &["component"],
        )?;
        registry.register(Box::new(health_score.clone()))?;

        let system_health = Gauge::with_opts(Opts::new(
            "latency_watch_system_health",
            "Overall status: 0 healthy, 1 degraded, 2 critical",
        ))?;
        registry.register(Box::new(system_health.clone()))?;

        let evaluation_ticks_total = IntCounter::with_opts(Opts::new(
            "latency_watch_evaluation_ticks_total",
            "Completed evaluation ticks",
        ))?;
        registry.register(Box::new(evaluation_ticks_total.clone()))?;

        let skipped_ticks_total = IntCounter::with_opts(Opts::new(
            "latency_watch_skipped_ticks_total",
            "Ticks skipped because the previous one was still running",
        ))?;
        registry.register(Box::new(skipped_ticks_total.clone()))?;

        let evaluation_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "latency_watch_evaluation_duration_seconds",
                "Duration of evaluation ticks in seconds",
            )
            .buckets(exponential_buckets(0.0001, 2.0, 15)?),
        )?;
        registry.register(Box::new(evaluation_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            latency_ms,
            latency_mean_ms,
            window_samples,
            samples_recorded,
            samples_rejected,
            active_alerts,
            health_score,
            system_health,
            evaluation_ticks_total,
            skipped_ticks_total,
            evaluation_duration_seconds,
        })
    }

    /// Replace per-key latency gauges with the given statistics
    pub fn update_stats(&self, stats: &AllStats) {
        self.latency_ms.reset();
        self.latency_mean_ms.reset();
        self.window_samples.reset();

        for (key, snapshot) in &stats.per_key {
            let values = [
                snapshot.p50,
                snapshot.p75,
                snapshot.p90,
                snapshot.p95,
                snapshot.p99,
                snapshot.p999,
            ];
            for (quantile, value) in QUANTILES.iter().zip(values) {
                self.latency_ms
                    .with_label_values(&[key.as_str(), *quantile])
                    .set(value);
            }
            self.latency_mean_ms
                .with_label_values(&[key.as_str()])
                .set(snapshot.mean);
            self.window_samples
                .with_label_values(&[key.as_str()])
                .set(snapshot.count as i64);
        }

        self.samples_recorded.set(stats.summary.total_recorded as i64);
        self.samples_rejected.set(stats.summary.rejected_samples as i64);
    }

    pub fn update_alerts(&self, alerts: &[Alert]) {
        self.active_alerts.reset();
        for alert in alerts {
            self.active_alerts
                .with_label_values(&[alert.severity.to_string().as_str()])
                .inc();
        }
    }

    pub fn update_health(&self, report: &HealthReport) {
        self.health_score.reset();
        for record in &report.components {
            self.health_score
                .with_label_values(&[record.component_key.as_str()])
                .set(record.score);
        }
        self.system_health.set(match report.overall {
            HealthStatus::Healthy => 0.0,
            HealthStatus::Degraded => 1.0,
            HealthStatus::Critical => 2.0,
        });
    }

    pub fn record_tick(&self, duration_secs: f64) {
        self.evaluation_ticks_total.inc();
        self.evaluation_duration_seconds.observe(duration_secs);
    }

    pub fn record_skipped_tick(&self) {
        self.skipped_ticks_total.inc();
    }

    /// Drop every labelled series, used when the engine stops
    pub fn reset(&self) {
        self.latency_ms.reset();
        self.latency_mean_ms.reset();
        self.window_samples.reset();
        self.active_alerts.reset();
        self.health_score.reset();
        self.system_health.set(0.0);
        self.samples_recorded.set(0);
        self.samples_rejected.set(0);
    }

    /// Metrics in Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        Ok(encoder.encode_to_string(&self.registry.gather())?)
    }

    /// Like [`encode`](Self::encode), logging and returning an empty string on failure
    pub fn gather_metrics(&self) -> String {
        self.encode().unwrap_or_else(|e| {
            error!("Failed to encode metrics: {}", e);
            String::new()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::clock::ManualClock;
    use crate::monitoring::health::{HealthRecord, HealthSummary};
    use crate::monitoring::registry::{MetricsRegistry, RegistryConfig};
    use chrono::Utc;
    use std::sync::Arc;

    #[test]
    fn test_exporter_creation() {
        let exporter = PrometheusExporter::new().unwrap();
        assert_eq!(exporter.evaluation_ticks_total.get(), 0);
        assert!(exporter.gather_metrics().contains("latency_watch_evaluation_ticks_total"));
    }

    #[test]
    fn test_stats_update_sets_quantiles() {
        let exporter = PrometheusExporter::new().unwrap();
        let registry = MetricsRegistry::new(RegistryConfig::default(), Arc::new(ManualClock::new()));
        for v in [10.0, 20.0, 30.0] {
            registry.record_ms("search", v);
        }
        registry.record_ms("search", -1.0);

        exporter.update_stats(&registry.all_stats(vec![]));

        let p50 = exporter.latency_ms.with_label_values(&["search", "0.5"]).get();
        assert_eq!(p50, 20.0);
        assert_eq!(exporter.window_samples.with_label_values(&["search"]).get(), 3);
        assert_eq!(exporter.samples_rejected.get(), 1);

        let text = exporter.gather_metrics();
        assert!(text.contains("latency_watch_latency_ms{key=\"search\",quantile=\"0.99\"}"));
    }

    #[test]
    fn test_health_update() {
        let exporter = PrometheusExporter::new().unwrap();
        let report = HealthReport {
            overall: HealthStatus::Degraded,
            components: vec![HealthRecord {
                component_key: "db".to_string(),
                status: HealthStatus::Degraded,
                score: 65.0,
                issues: vec![],
                recommendations: vec![],
                last_checked: Utc::now(),
            }],
            summary: HealthSummary {
                total_components: 1,
                healthy: 0,
                degraded: 1,
                critical: 0,
                average_score: 65.0,
            },
            evaluated_at: Utc::now(),
        };

        exporter.update_health(&report);
        assert_eq!(exporter.health_score.with_label_values(&["db"]).get(), 65.0);
        assert_eq!(exporter.system_health.get(), 1.0);
    }

    #[test]
    fn test_tick_counters() {
        let exporter = PrometheusExporter::new().unwrap();
        exporter.record_tick(0.002);
        exporter.record_skipped_tick();
        assert_eq!(exporter.evaluation_ticks_total.get(), 1);
        assert_eq!(exporter.skipped_ticks_total.get(), 1);
        assert_eq!(exporter.evaluation_duration_seconds.get_sample_count(), 1);
    }
}
