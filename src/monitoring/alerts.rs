use super::{AlertSeverity, MetricType};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: Uuid,
    pub key: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub threshold_type: MetricType,
    pub observed_value: f64,
    pub limit: f64,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThresholdRule {
    pub metric: MetricType,
    pub warning_limit: f64,
    pub critical_limit: f64,
    pub enabled: bool,
}

impl ThresholdRule {
    pub fn new(metric: MetricType, warning_limit: f64, critical_limit: f64) -> Self {
        Self {
            metric,
            warning_limit,
            critical_limit,
            enabled: true,
        }
    }

    /// Highest severity whose limit `value` exceeds.
    pub fn breach(&self, value: f64) -> Option<AlertSeverity> {
        if value > self.critical_limit {
            Some(AlertSeverity::Critical)
        } else if value > self.warning_limit {
            Some(AlertSeverity::Warning)
        } else {
            None
        }
    }

    fn limit_for(&self, severity: AlertSeverity) -> f64 {
        match severity {
            AlertSeverity::Critical => self.critical_limit,
            _ => self.warning_limit,
        }
    }
}

/// Default threshold table
pub fn default_threshold_rules() -> Vec<ThresholdRule> {
    vec![
        ThresholdRule::new(MetricType::ExecutionTimeP95, 1000.0, 2000.0),
        ThresholdRule::new(MetricType::ExecutionTimeP99, 2000.0, 5000.0),
        ThresholdRule::new(MetricType::CacheMissRate, 0.30, 0.50),
        ThresholdRule::new(MetricType::WeakConnectionRatio, 0.50, 0.75),
        ThresholdRule::new(MetricType::MemoryUsage, 512.0, 1024.0),
    ]
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub dedup_window: Duration,
    pub info_ttl: Duration,
    pub history_limit: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::minutes(5),
            info_ttl: Duration::minutes(5),
            history_limit: 1000,
        }
    }
}

/// A current metric value for one key, as fed to [`AlertEngine::evaluate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub key: String,
    pub metric: MetricType,
    pub value: f64,
}

impl Observation {
    pub fn new(key: impl Into<String>, metric: MetricType, value: f64) -> Self {
        Self {
            key: key.into(),
            metric,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlertTransition {
    Raised(Alert),
    Escalated(Alert),
    Resolved(Alert),
    /// A breach coalesced into the active alert raised earlier in the dedup window
    Suppressed {
        key: String,
        metric: MetricType,
        severity: AlertSeverity,
    },
}

type AlertSlot = (String, MetricType);

/// Threshold evaluation with one active alert per `(key, metric)`.
///
/// Alerts only move Active -> Resolved. Breaches repeated while an alert is
/// active and inside its dedup window are counted as suppressed; a breach after
/// resolution always opens a new alert with a fresh id.
#[derive(Debug)]
pub struct AlertEngine {
    rules: Vec<ThresholdRule>,
    config: AlertConfig,
    active: HashMap<AlertSlot, Alert>,
    last_raised: HashMap<(String, MetricType, AlertSeverity), DateTime<Utc>>,
    history: VecDeque<Alert>,
    suppressed: u64,
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new(default_threshold_rules(), AlertConfig::default())
    }
}

impl AlertEngine {
    pub fn new(rules: Vec<ThresholdRule>, config: AlertConfig) -> Self {
        Self {
            rules,
            config,
            active: HashMap::new(),
            last_raised: HashMap::new(),
            history: VecDeque::new(),
            suppressed: 0,
        }
    }

    pub fn rules(&self) -> &[ThresholdRule] {
        &self.rules
    }

    pub fn rule(&self, metric: MetricType) -> Option<&ThresholdRule> {
        self.rules.iter().find(|r| r.metric == metric && r.enabled)
    }

    /// Add or replace the rule for a metric
    pub fn set_rule(&mut self, rule: ThresholdRule) {
        if let Some(existing) = self.rules.iter_mut().find(|r| r.metric == rule.metric) {
            *existing = rule;
            info!("Updated threshold rule: {}", existing.metric);
        } else {
            info!("Added threshold rule: {}", rule.metric);
            self.rules.push(rule);
        }
    }

    /// Evaluate observations against the configured thresholds
    pub fn evaluate(
        &mut self,
        observations: &[Observation],
        now: DateTime<Utc>,
    ) -> Vec<AlertTransition> {
        let mut transitions = Vec::new();

        for observation in observations {
            let Some(rule) = self.rule(observation.metric).cloned() else {
                continue;
            };
            if let Some(transition) = self.evaluate_one(&rule, observation, now) {
                transitions.push(transition);
            }
        }

        transitions
    }

    fn evaluate_one(
        &mut self,
        rule: &ThresholdRule,
        observation: &Observation,
        now: DateTime<Utc>,
    ) -> Option<AlertTransition> {
        let slot = (observation.key.clone(), observation.metric);
        let breach = rule.breach(observation.value);
        let active_severity = self.active.get(&slot).map(|a| a.severity);

        match (breach, active_severity) {
            (Some(AlertSeverity::Critical), Some(current)) if current < AlertSeverity::Critical => {
                let limit = rule.critical_limit;
                let alert = self.active.get_mut(&slot)?;
                alert.severity = AlertSeverity::Critical;
                alert.observed_value = observation.value;
                alert.limit = limit;
                alert.message = format_alert_message(&observation.key, observation.metric, observation.value, limit);
                alert.updated_at = now;
                let escalated = alert.clone();

                self.last_raised.insert(
                    (observation.key.clone(), observation.metric, AlertSeverity::Critical),
                    now,
                );
                self.update_history(&escalated);
                error!(key = %escalated.key, metric = %escalated.threshold_type, "ESCALATED ALERT: {}", escalated.message);
                Some(AlertTransition::Escalated(escalated))
            }
            (Some(_), Some(current)) => {
                if !self.within_dedup_window(&observation.key, observation.metric, current, now) {
                    return None;
                }
                self.suppressed += 1;
                debug!(key = %observation.key, metric = %observation.metric, severity = %current, "Suppressed duplicate breach");
                Some(AlertTransition::Suppressed {
                    key: observation.key.clone(),
                    metric: observation.metric,
                    severity: current,
                })
            }
            (Some(severity), None) => {
                let limit = rule.limit_for(severity);
                let message =
                    format_alert_message(&observation.key, observation.metric, observation.value, limit);
                let alert = self.open(
                    &observation.key,
                    observation.metric,
                    severity,
                    message,
                    observation.value,
                    limit,
                    now,
                );
                Some(AlertTransition::Raised(alert))
            }
            (None, Some(AlertSeverity::Info)) => None,
            (None, Some(_)) => self.resolve(&slot, now).map(AlertTransition::Resolved),
            (None, None) => None,
        }
    }

    /// Raise an informational alert; it resolves only on TTL expiry or clear.
    pub fn raise_info(
        &mut self,
        key: &str,
        metric: MetricType,
        message: String,
        observed_value: f64,
        now: DateTime<Utc>,
    ) -> Option<AlertTransition> {
        if let Some(current) = self.active.get(&(key.to_string(), metric)).map(|a| a.severity) {
            if !self.within_dedup_window(key, metric, current, now) {
                return None;
            }
            self.suppressed += 1;
            return Some(AlertTransition::Suppressed {
                key: key.to_string(),
                metric,
                severity: current,
            });
        }
        let alert = self.open(key, metric, AlertSeverity::Info, message, observed_value, 0.0, now);
        Some(AlertTransition::Raised(alert))
    }

    /// Resolve `info` alerts older than the configured TTL
    pub fn expire_info(&mut self, now: DateTime<Utc>) -> Vec<AlertTransition> {
        let expired: Vec<AlertSlot> = self
            .active
            .iter()
            .filter(|(_, alert)| {
                alert.severity == AlertSeverity::Info && now - alert.created_at >= self.config.info_ttl
            })
            .map(|(slot, _)| slot.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|slot| self.resolve(&slot, now))
            .map(AlertTransition::Resolved)
            .collect()
    }

    /// Explicitly clear an active alert by id
    pub fn clear(&mut self, id: Uuid, now: DateTime<Utc>) -> Option<Alert> {
        let slot = self
            .active
            .iter()
            .find(|(_, alert)| alert.id == id)
            .map(|(slot, _)| slot.clone())?;
        self.resolve(&slot, now)
    }

    #[allow(clippy::too_many_arguments)]
    fn open(
        &mut self,
        key: &str,
        metric: MetricType,
        severity: AlertSeverity,
        message: String,
        observed_value: f64,
        limit: f64,
        now: DateTime<Utc>,
    ) -> Alert {
        let alert = Alert {
            id: Uuid::new_v4(),
            key: key.to_string(),
            severity,
            message,
            created_at: now,
            updated_at: now,
            threshold_type: metric,
            observed_value,
            limit,
            resolved: false,
            resolved_at: None,
        };

        self.active.insert((key.to_string(), metric), alert.clone());
        self.last_raised
            .insert((key.to_string(), metric, severity), now);
        self.history.push_back(alert.clone());
        while self.history.len() > self.config.history_limit.max(1) {
            self.history.pop_front();
        }

        match severity {
            AlertSeverity::Critical => error!(key, %metric, "CRITICAL ALERT: {}", alert.message),
            AlertSeverity::Warning => warn!(key, %metric, "WARNING ALERT: {}", alert.message),
            AlertSeverity::Info => info!(key, %metric, "INFO ALERT: {}", alert.message),
        }
        alert
    }

    fn resolve(&mut self, slot: &AlertSlot, now: DateTime<Utc>) -> Option<Alert> {
        let mut alert = self.active.remove(slot)?;
        // The episode is over; the next breach opens a new alert.
        self.last_raised
            .retain(|(key, metric, _), _| !(key == &slot.0 && *metric == slot.1));
        alert.resolved = true;
        alert.resolved_at = Some(now);
        alert.updated_at = now;
        self.update_history(&alert);
        info!(key = %alert.key, metric = %alert.threshold_type, "RESOLVED ALERT: {}", alert.message);
        Some(alert)
    }

    fn update_history(&mut self, alert: &Alert) {
        if let Some(entry) = self.history.iter_mut().rev().find(|a| a.id == alert.id) {
            *entry = alert.clone();
        }
    }

    fn within_dedup_window(
        &self,
        key: &str,
        metric: MetricType,
        severity: AlertSeverity,
        now: DateTime<Utc>,
    ) -> bool {
        self.last_raised
            .get(&(key.to_string(), metric, severity))
            .map(|raised| now - *raised < self.config.dedup_window)
            .unwrap_or(false)
    }

    /// Active alerts, oldest first
    pub fn active_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.active.values().cloned().collect();
        alerts.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.key.cmp(&b.key))
                .then_with(|| a.threshold_type.cmp(&b.threshold_type))
        });
        alerts
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Alert history, newest first
    pub fn history(&self, limit: Option<usize>) -> Vec<Alert> {
        let newest_first = self.history.iter().rev().cloned();
        match limit {
            Some(limit) => newest_first.take(limit).collect(),
            None => newest_first.collect(),
        }
    }

    pub fn suppressed_count(&self) -> u64 {
        self.suppressed
    }

    /// Forget every alert and dedup record
    pub fn reset(&mut self) {
        self.active.clear();
        self.last_raised.clear();
        self.history.clear();
        self.suppressed = 0;
    }
}

fn format_alert_message(key: &str, metric: MetricType, value: f64, limit: f64) -> String {
    match metric {
        MetricType::ExecutionTimeP95 => {
            format!("p95 execution time for {key}: {value:.1}ms (limit: {limit:.0}ms)")
        }
        MetricType::ExecutionTimeP99 => {
            format!("p99 execution time for {key}: {value:.1}ms (limit: {limit:.0}ms)")
        }
        MetricType::CacheMissRate => format!(
            "Cache miss rate for {key}: {:.1}% (limit: {:.1}%)",
            value * 100.0,
            limit * 100.0
        ),
        MetricType::WeakConnectionRatio => format!(
            "Weak connection ratio for {key}: {:.1}% (limit: {:.1}%)",
            value * 100.0,
            limit * 100.0
        ),
        MetricType::MemoryUsage => {
            format!("Memory usage for {key}: {value:.1}MiB (limit: {limit:.0}MiB)")
        }
        MetricType::LatencyTrend | MetricType::Notice => {
            format!("{metric} for {key}: {value:.2} (limit: {limit:.2})")
        }
    }
}
