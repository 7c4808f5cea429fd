//! Consolidated report and its two export formats.
//!
//! The flattened rows keep the column order `timestamp,type,metric,value`.
//! Downstream consumers parse that order positionally, so any change to it
//! must bump [`ROWS_FORMAT_VERSION`].

use super::alerts::Alert;
use super::error::Result;
use super::health::HealthReport;
use super::registry::AllStats;
use super::trends::{Trend, TrendDirection};
use super::AlertSeverity;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const ROWS_FORMAT_VERSION: u32 = 1;
pub const ROWS_HEADER: &str = "timestamp,type,metric,value";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineReport {
    pub generated_at: DateTime<Utc>,
    pub rows_format_version: u32,
    pub health: HealthReport,
    pub alerts: Vec<Alert>,
    pub trends: Vec<Trend>,
    pub recommendations: Vec<String>,
    pub metrics: AllStats,
    /// Sections that could not be produced; the rest of the report is still valid
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl EngineReport {
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportRow {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub metric: String,
    pub value: f64,
}

impl ExportRow {
    fn new(timestamp: DateTime<Utc>, kind: &str, metric: impl Into<String>, value: f64) -> Self {
        Self {
            timestamp,
            kind: kind.to_string(),
            metric: metric.into(),
            value,
        }
    }
}

/// Merge recommendations from health records, degrading trends and critical
/// alerts, keeping first occurrence order.
pub fn collect_recommendations(health: &HealthReport, trends: &[Trend], alerts: &[Alert]) -> Vec<String> {
    let from_health = health
        .components
        .iter()
        .flat_map(|record| record.recommendations.iter().cloned());

    let from_trends = trends
        .iter()
        .filter(|t| t.direction == TrendDirection::Degrading)
        .map(|t| format!("Investigate degrading {} for {}", t.metric, t.key));

    let from_alerts = alerts
        .iter()
        .filter(|a| !a.resolved && a.severity == AlertSeverity::Critical)
        .map(|a| format!("Resolve critical alert for {}: {}", a.key, a.message));

    let mut seen = HashSet::new();
    from_health
        .chain(from_trends)
        .chain(from_alerts)
        .filter(|r| seen.insert(r.clone()))
        .collect()
}

pub fn export_json(report: &EngineReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

/// Flatten a report into `(timestamp, type, metric, value)` rows
pub fn export_rows(report: &EngineReport) -> Vec<ExportRow> {
    let ts = report.generated_at;
    let mut rows = Vec::new();

    let global = &report.metrics.global;
    push_distribution(&mut rows, ts, "global", "", global);

    for (key, snapshot) in &report.metrics.per_key {
        push_distribution(&mut rows, ts, "latency", &format!("{key}."), snapshot);
    }

    let summary = &report.metrics.summary;
    rows.push(ExportRow::new(ts, "summary", "total_keys", summary.total_keys as f64));
    rows.push(ExportRow::new(ts, "summary", "total_samples", summary.total_samples as f64));
    rows.push(ExportRow::new(ts, "summary", "rejected_samples", summary.rejected_samples as f64));
    rows.push(ExportRow::new(ts, "summary", "avg_global_latency_ms", summary.avg_global_latency_ms));
    rows.push(ExportRow::new(ts, "summary", "active_alert_count", summary.active_alert_count as f64));

    for record in &report.health.components {
        rows.push(ExportRow::new(
            record.last_checked,
            "health",
            format!("{}.score", record.component_key),
            record.score,
        ));
    }
    rows.push(ExportRow::new(
        report.health.evaluated_at,
        "health",
        "average_score",
        report.health.summary.average_score,
    ));

    for alert in &report.alerts {
        rows.push(ExportRow::new(
            alert.created_at,
            "alert",
            format!("{}.{}.{}", alert.key, alert.threshold_type, alert.severity),
            alert.observed_value,
        ));
    }

    for trend in &report.trends {
        if let Some(last) = trend.points.back() {
            rows.push(ExportRow::new(
                last.timestamp,
                "trend",
                format!("{}.{}", trend.key, trend.metric),
                last.value,
            ));
        }
        if let Some(predicted) = trend.predicted_next {
            rows.push(ExportRow::new(
                ts,
                "trend",
                format!("{}.{}.predicted", trend.key, trend.metric),
                predicted,
            ));
        }
    }

    rows
}

fn push_distribution(
    rows: &mut Vec<ExportRow>,
    ts: DateTime<Utc>,
    kind: &str,
    prefix: &str,
    snapshot: &super::distribution::DistributionSnapshot,
) {
    let fields = [
        ("count", snapshot.count as f64),
        ("min", snapshot.min),
        ("max", snapshot.max),
        ("mean", snapshot.mean),
        ("p50", snapshot.p50),
        ("p75", snapshot.p75),
        ("p90", snapshot.p90),
        ("p95", snapshot.p95),
        ("p99", snapshot.p99),
        ("p999", snapshot.p999),
        ("std_dev", snapshot.std_dev),
    ];
    for (name, value) in fields {
        rows.push(ExportRow::new(ts, kind, format!("{prefix}{name}"), value));
    }
}

/// Render rows as CSV with a header line
pub fn export_rows_csv(rows: &[ExportRow]) -> String {
    let mut out = String::with_capacity(rows.len() * 48 + ROWS_HEADER.len() + 1);
    out.push_str(ROWS_HEADER);
    out.push('\n');
    for row in rows {
        out.push_str(&row.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true));
        out.push(',');
        out.push_str(&csv_field(&row.kind));
        out.push(',');
        out.push_str(&csv_field(&row.metric));
        out.push(',');
        out.push_str(&row.value.to_string());
        out.push('\n');
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
