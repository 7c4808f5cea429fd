use super::distribution::DistributionSnapshot;
use super::error::{MonitoringError, Result};
use super::{ComponentSignals, HealthStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// Limits and penalties of the fixed health rule set, applied in field order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthRules {
    pub execution_p95_limit_ms: f64,
    pub execution_penalty: f64,
    pub cache_miss_limit: f64,
    pub cache_miss_penalty: f64,
    pub weak_connection_limit: f64,
    pub weak_connection_penalty: f64,
    pub memory_limit_mib: f64,
    pub memory_penalty: f64,
    pub healthy_min_score: f64,
    pub degraded_min_score: f64,
    /// System turns degraded when more than this share of components is degraded
    pub degraded_fraction: f64,
}

impl Default for HealthRules {
    fn default() -> Self {
        Self {
            execution_p95_limit_ms: 1000.0,
            execution_penalty: 20.0,
            cache_miss_limit: 0.30,
            cache_miss_penalty: 15.0,
            weak_connection_limit: 0.50,
            weak_connection_penalty: 10.0,
            memory_limit_mib: 512.0,
            memory_penalty: 25.0,
            healthy_min_score: 80.0,
            degraded_min_score: 60.0,
            degraded_fraction: 0.30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthRecord {
    pub component_key: String,
    pub status: HealthStatus,
    pub score: f64,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
    pub last_checked: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSummary {
    pub total_components: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub critical: usize,
    pub average_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub overall: HealthStatus,
    pub components: Vec<HealthRecord>,
    pub summary: HealthSummary,
    pub evaluated_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            overall: HealthStatus::Healthy,
            components: Vec::new(),
            summary: HealthSummary {
                total_components: 0,
                healthy: 0,
                degraded: 0,
                critical: 0,
                average_score: 100.0,
            },
            evaluated_at: now,
        }
    }

    pub fn component(&self, key: &str) -> Option<&HealthRecord> {
        self.components.iter().find(|r| r.component_key == key)
    }
}

/// Everything known about one component at evaluation time.
#[derive(Debug, Clone)]
pub struct ComponentInput {
    pub key: String,
    pub stats: DistributionSnapshot,
    pub signals: ComponentSignals,
    /// Set when collecting this component's inputs already failed
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HealthEvaluator {
    rules: HealthRules,
}

impl HealthEvaluator {
    pub fn new(rules: HealthRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &HealthRules {
        &self.rules
    }

    /// Score one component. Rules run in a fixed order so identical inputs
    /// always produce identical issue lists.
    pub fn evaluate_component(
        &self,
        key: &str,
        stats: &DistributionSnapshot,
        signals: &ComponentSignals,
        now: DateTime<Utc>,
    ) -> Result<HealthRecord> {
        validate_signals(key, stats, signals)?;

        let rules = &self.rules;
        let mut score = 100.0;
        let mut issues = Vec::new();
        let mut recommendations = Vec::new();

        if stats.count > 0 && stats.p95 > rules.execution_p95_limit_ms {
            score -= rules.execution_penalty;
            issues.push(format!(
                "High execution time: p95 {:.1}ms exceeds {:.0}ms",
                stats.p95, rules.execution_p95_limit_ms
            ));
            recommendations.push(format!(
                "Profile slow operations in {key} and consider caching or batching"
            ));
        }

        if let Some(miss_rate) = signals.cache_miss_rate() {
            if miss_rate > rules.cache_miss_limit {
                score -= rules.cache_miss_penalty;
                issues.push(format!(
                    "Cache miss rate {:.1}% exceeds {:.1}%",
                    miss_rate * 100.0,
                    rules.cache_miss_limit * 100.0
                ));
                recommendations.push(format!(
                    "Increase cache capacity or review cache keys for {key}"
                ));
            }
        }

        if let Some(weak_ratio) = signals.weak_connection_ratio() {
            if weak_ratio > rules.weak_connection_limit {
                score -= rules.weak_connection_penalty;
                issues.push(format!(
                    "Weak connection ratio {:.1}% exceeds {:.1}%",
                    weak_ratio * 100.0,
                    rules.weak_connection_limit * 100.0
                ));
                recommendations
                    .push("Review connection quality and retry policy for upstream calls".to_string());
            }
        }

        if let Some(memory) = signals.memory_usage_mib {
            if memory > rules.memory_limit_mib {
                score -= rules.memory_penalty;
                issues.push(format!(
                    "Memory usage {:.1}MiB exceeds {:.0}MiB",
                    memory, rules.memory_limit_mib
                ));
                recommendations.push(format!(
                    "Reduce memory footprint of {key} or raise its memory budget"
                ));
            }
        }

        let score = f64::clamp(score, 0.0, 100.0);
        Ok(HealthRecord {
            component_key: key.to_string(),
            status: self.status_for(score),
            score,
            issues,
            recommendations,
            last_checked: now,
        })
    }

    pub fn status_for(&self, score: f64) -> HealthStatus {
        if score >= self.rules.healthy_min_score {
            HealthStatus::Healthy
        } else if score >= self.rules.degraded_min_score {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        }
    }

    /// Evaluate every component; a failing component becomes a `critical`
    /// record of its own and never aborts the others.
    pub fn evaluate(&self, inputs: Vec<ComponentInput>, now: DateTime<Utc>) -> HealthReport {
        let mut components: Vec<HealthRecord> = inputs
            .into_iter()
            .map(|input| {
                let outcome = match input.failure {
                    Some(message) => Err(MonitoringError::ProbeFailed {
                        probe: input.key.clone(),
                        message,
                    }),
                    None => self.evaluate_component(&input.key, &input.stats, &input.signals, now),
                };
                outcome.unwrap_or_else(|e| failed_record(&input.key, &e, now))
            })
            .collect();
        components.sort_by(|a, b| a.component_key.cmp(&b.component_key));

        let overall = self.aggregate(&components);
        let summary = summarize(&components);
        debug!(
            %overall,
            components = summary.total_components,
            "Health evaluation completed"
        );

        HealthReport {
            overall,
            components,
            summary,
            evaluated_at: now,
        }
    }

    /// System-wide status from component records
    pub fn aggregate(&self, components: &[HealthRecord]) -> HealthStatus {
        let mut degraded = 0usize;
        let mut has_critical = false;

        for record in components {
            match record.status {
                HealthStatus::Critical => {
                    has_critical = true;
                    error!(
                        "Component {} is critical: {:?}",
                        record.component_key, record.issues
                    );
                }
                HealthStatus::Degraded => {
                    degraded += 1;
                    warn!(
                        "Component {} is degraded: {:?}",
                        record.component_key, record.issues
                    );
                }
                HealthStatus::Healthy => {
                    debug!("Component {} is healthy", record.component_key);
                }
            }
        }

        if has_critical {
            HealthStatus::Critical
        } else if !components.is_empty()
            && degraded as f64 / components.len() as f64 > self.rules.degraded_fraction
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

fn validate_signals(key: &str, stats: &DistributionSnapshot, signals: &ComponentSignals) -> Result<()> {
    if let Some(memory) = signals.memory_usage_mib {
        if !memory.is_finite() || memory < 0.0 {
            return Err(MonitoringError::InvalidSignal {
                component: key.to_string(),
                message: format!("memory usage must be a non-negative number, got {memory}"),
            });
        }
    }
    if !stats.p95.is_finite() {
        return Err(MonitoringError::InvalidSignal {
            component: key.to_string(),
            message: "latency distribution is not finite".to_string(),
        });
    }
    Ok(())
}

fn failed_record(key: &str, err: &MonitoringError, now: DateTime<Utc>) -> HealthRecord {
    error!(component = key, "Health evaluation failed: {}", err);
    HealthRecord {
        component_key: key.to_string(),
        status: HealthStatus::Critical,
        score: 0.0,
        issues: vec![format!("Health evaluation failed: {err}")],
        recommendations: vec![format!("Check the signal source for {key}")],
        last_checked: now,
    }
}

fn summarize(components: &[HealthRecord]) -> HealthSummary {
    let count = |status: HealthStatus| components.iter().filter(|r| r.status == status).count();
    let average_score = if components.is_empty() {
        100.0
    } else {
        components.iter().map(|r| r.score).sum::<f64>() / components.len() as f64
    };

    HealthSummary {
        total_components: components.len(),
        healthy: count(HealthStatus::Healthy),
        degraded: count(HealthStatus::Degraded),
        critical: count(HealthStatus::Critical),
        average_score,
    }
}
