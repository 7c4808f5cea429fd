use super::alerts::{
    default_threshold_rules, Alert, AlertConfig, AlertEngine, AlertTransition, Observation,
    ThresholdRule,
};
use super::clock::{Clock, SystemClock};
use super::distribution::DistributionSnapshot;
use super::error::{MonitoringError, Result};
use super::health::{ComponentInput, HealthEvaluator, HealthReport, HealthRules};
use super::metrics::PrometheusExporter;
use super::probes::ComponentProbe;
use super::registry::{AllStats, MetricsRegistry, RegistryConfig, TimingHandle};
use super::report::{self, collect_recommendations, EngineReport, ExportRow, ROWS_FORMAT_VERSION};
use super::trends::{Trend, TrendChange, TrendDirection, TrendMetric, TrendSettings, TrendTracker};
use super::{ComponentSignals, ConnectionStrength, HealthStatus, MetricType};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Everything the engine needs to know up front.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub registry: RegistryConfig,
    pub thresholds: Vec<ThresholdRule>,
    pub alerts: AlertConfig,
    pub health: HealthRules,
    pub trends: TrendSettings,
    pub evaluation_interval: Duration,
    /// Evaluate latency thresholds right after each accepted sample
    pub inline_evaluation: bool,
    pub connection_history: usize,
    pub event_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            thresholds: default_threshold_rules(),
            alerts: AlertConfig::default(),
            health: HealthRules::default(),
            trends: TrendSettings::default(),
            evaluation_interval: Duration::from_secs(30),
            inline_evaluation: true,
            connection_history: 100,
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    AlertRaised(Alert),
    AlertEscalated(Alert),
    AlertResolved(Alert),
    TrendChanged {
        key: String,
        metric: TrendMetric,
        from: TrendDirection,
        to: TrendDirection,
    },
    HealthEvaluated {
        overall: HealthStatus,
        evaluated_at: DateTime<Utc>,
    },
    TickSkipped {
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickSummary {
    pub alerts_raised: usize,
    pub alerts_escalated: usize,
    pub alerts_resolved: usize,
    pub trend_changes: usize,
    pub overall: HealthStatus,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TickOutcome {
    Completed(TickSummary),
    /// The previous tick was still running
    Skipped,
}

struct Runner {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Resets the reentrancy flag however the tick exits
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// In-process observability engine: latency windows, alerts, health and trends.
pub struct ObservabilityEngine {
    settings: EngineSettings,
    clock: Arc<dyn Clock>,
    registry: MetricsRegistry,
    alerts: Mutex<AlertEngine>,
    evaluator: HealthEvaluator,
    last_health: RwLock<Option<HealthReport>>,
    trends: Mutex<TrendTracker>,
    signals: DashMap<String, ComponentSignals>,
    probes: RwLock<Vec<Arc<dyn ComponentProbe>>>,
    probe_failures: Mutex<BTreeMap<String, String>>,
    exporter: PrometheusExporter,
    events: broadcast::Sender<EngineEvent>,
    ticking: AtomicBool,
    /// `true` once stopped. Held for reading by every mutation so `stop`
    /// can clear state without racing a recorder or a tick.
    lifecycle: RwLock<bool>,
    runner: Mutex<Option<Runner>>,
}

impl std::fmt::Debug for ObservabilityEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservabilityEngine")
            .field("keys", &self.registry.window_count())
            .field("running", &self.is_running())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl ObservabilityEngine {
    pub fn new(settings: EngineSettings) -> Result<Self> {
        Self::with_clock(settings, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(settings: EngineSettings, clock: Arc<dyn Clock>) -> Result<Self> {
        if settings.evaluation_interval.is_zero() {
            return Err(MonitoringError::Configuration(
                "evaluation interval must be greater than zero".to_string(),
            ));
        }
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));

        Ok(Self {
            registry: MetricsRegistry::new(settings.registry.clone(), clock.clone()),
            alerts: Mutex::new(AlertEngine::new(
                settings.thresholds.clone(),
                settings.alerts.clone(),
            )),
            evaluator: HealthEvaluator::new(settings.health.clone()),
            last_health: RwLock::new(None),
            trends: Mutex::new(TrendTracker::new(settings.trends.clone())),
            signals: DashMap::new(),
            probes: RwLock::new(Vec::new()),
            probe_failures: Mutex::new(BTreeMap::new()),
            exporter: PrometheusExporter::new()?,
            events,
            ticking: AtomicBool::new(false),
            lifecycle: RwLock::new(false),
            runner: Mutex::new(None),
            settings,
            clock,
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ---- recording ----

    /// Once stopped, the handle is untracked and ending it yields `None`.
    pub fn start_timing(&self) -> TimingHandle {
        let stopped = self.lifecycle.read();
        if *stopped {
            return self.registry.untracked_handle();
        }
        self.registry.start_timing()
    }

    /// Duration in ms, or `None` for unknown/expired handles or a stopped engine.
    pub fn end_timing(&self, key: &str, handle: TimingHandle) -> Option<f64> {
        let stopped = self.lifecycle.read();
        if *stopped {
            self.registry.discard_timing(handle);
            return None;
        }
        let duration = self.registry.end_timing(key, handle)?;
        self.evaluate_inline(key);
        Some(duration)
    }

    /// Record a duration; invalid values are counted and dropped.
    pub fn record_ms(&self, key: &str, value_ms: f64) -> bool {
        let stopped = self.lifecycle.read();
        if *stopped {
            return false;
        }
        let accepted = self.registry.record_ms(key, value_ms);
        if accepted {
            self.evaluate_inline(key);
        }
        accepted
    }

    fn evaluate_inline(&self, key: &str) {
        if !self.settings.inline_evaluation {
            return;
        }
        let stats = self.registry.stats(key);
        let observations = latency_observations(key, &stats);
        let transitions = self.alerts.lock().evaluate(&observations, self.clock.now());
        self.publish_transitions(&transitions);
    }

    pub fn record_cache_hit(&self, component: &str) {
        self.update_signals(component, |s| s.cache_hits += 1);
    }

    pub fn record_cache_miss(&self, component: &str) {
        self.update_signals(component, |s| s.cache_misses += 1);
    }

    pub fn record_connection(&self, component: &str, strength: ConnectionStrength) {
        let history = self.settings.connection_history;
        self.update_signals(component, |s| s.push_connection(strength, history));
    }

    pub fn set_memory_usage(&self, component: &str, mib: f64) -> Result<()> {
        if !mib.is_finite() || mib < 0.0 {
            return Err(MonitoringError::InvalidSignal {
                component: component.to_string(),
                message: format!("memory usage must be a non-negative number, got {mib}"),
            });
        }
        self.update_signals(component, |s| s.memory_usage_mib = Some(mib));
        Ok(())
    }

    fn update_signals(&self, component: &str, update: impl FnOnce(&mut ComponentSignals)) {
        let stopped = self.lifecycle.read();
        if *stopped {
            return;
        }
        let mut entry = self.signals.entry(component.to_string()).or_default();
        update(entry.value_mut());
    }

    pub fn signals(&self, component: &str) -> Option<ComponentSignals> {
        self.signals.get(component).map(|s| s.value().clone())
    }

    /// Returns `false` once the engine has been stopped.
    pub fn register_probe(&self, probe: Arc<dyn ComponentProbe>) -> bool {
        let stopped = self.lifecycle.read();
        if *stopped {
            debug!(component = probe.component(), "Ignoring probe registered after stop");
            return false;
        }
        info!(component = probe.component(), "Registered component probe");
        self.probes.write().push(probe);
        true
    }

    // ---- queries ----

    pub fn get_stats(&self, key: &str) -> DistributionSnapshot {
        self.registry.stats(key)
    }

    pub fn get_all_stats(&self) -> AllStats {
        self.registry.all_stats(self.get_active_alerts())
    }

    pub fn get_active_alerts(&self) -> Vec<Alert> {
        self.alerts.lock().active_alerts()
    }

    pub fn alert_history(&self, limit: Option<usize>) -> Vec<Alert> {
        self.alerts.lock().history(limit)
    }

    /// Health computed from the current windows and signals
    pub fn get_health_status(&self) -> HealthReport {
        let failures = self.probe_failures.lock().clone();
        self.evaluate_health(&self.registry.per_key_stats(), &failures, self.clock.now())
    }

    /// Report committed by the most recent tick, if any
    pub fn last_health_report(&self) -> Option<HealthReport> {
        self.last_health.read().clone()
    }

    pub fn get_trends(&self, key: Option<&str>) -> Vec<Trend> {
        self.trends.lock().trends(key)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn clear_alert(&self, id: Uuid) -> Option<Alert> {
        let stopped = self.lifecycle.read();
        if *stopped {
            return None;
        }
        let alert = self.alerts.lock().clear(id, self.clock.now())?;
        self.publish(EngineEvent::AlertResolved(alert.clone()));
        Some(alert)
    }

    /// Raise an informational notice that resolves after the info TTL
    pub fn raise_info(&self, key: &str, message: impl Into<String>) -> Option<Alert> {
        let stopped = self.lifecycle.read();
        if *stopped {
            return None;
        }
        let transition = self.alerts.lock().raise_info(
            key,
            MetricType::Notice,
            message.into(),
            0.0,
            self.clock.now(),
        )?;
        self.publish_transitions(std::slice::from_ref(&transition));
        match transition {
            AlertTransition::Raised(alert) => Some(alert),
            _ => None,
        }
    }

    pub fn generate_report(&self) -> EngineReport {
        let now = self.clock.now();
        let mut errors = Vec::new();
        if self.is_stopped() {
            errors.push(MonitoringError::Stopped.to_string());
        }

        let failures = self.probe_failures.lock().clone();
        errors.extend(
            failures
                .iter()
                .map(|(component, message)| format!("component {component}: {message}")),
        );

        let metrics = self.get_all_stats();
        let health = self.evaluate_health(&metrics.per_key, &failures, now);
        let alerts = metrics.alerts.clone();
        let trends = self.get_trends(None);
        let recommendations = collect_recommendations(&health, &trends, &alerts);

        EngineReport {
            generated_at: now,
            rows_format_version: ROWS_FORMAT_VERSION,
            health,
            alerts,
            trends,
            recommendations,
            metrics,
            errors,
        }
    }

    /// Full report as JSON. Serialization failure yields a stub carrying the error.
    pub fn export_json(&self) -> String {
        let report = self.generate_report();
        report::export_json(&report).unwrap_or_else(|e| {
            warn!("Failed to serialize report: {}", e);
            serde_json::json!({
                "generated_at": report.generated_at,
                "rows_format_version": ROWS_FORMAT_VERSION,
                "errors": [e.to_string()],
            })
            .to_string()
        })
    }

    pub fn export_rows(&self) -> Vec<ExportRow> {
        report::export_rows(&self.generate_report())
    }

    pub fn export_rows_csv(&self) -> String {
        report::export_rows_csv(&self.export_rows())
    }

    /// Current state in Prometheus text format
    pub fn export_prometheus(&self) -> Result<String> {
        let stats = self.get_all_stats();
        self.exporter.update_stats(&stats);
        self.exporter.update_alerts(&stats.alerts);
        if let Some(health) = self.last_health.read().as_ref() {
            self.exporter.update_health(health);
        }
        self.exporter.encode()
    }

    pub fn exporter(&self) -> &PrometheusExporter {
        &self.exporter
    }

    pub fn rejected_samples(&self) -> u64 {
        self.registry.rejected_samples()
    }

    // ---- lifecycle ----

    pub fn is_running(&self) -> bool {
        self.runner.lock().is_some()
    }

    pub fn is_stopped(&self) -> bool {
        *self.lifecycle.read()
    }

    /// Spawn the periodic evaluation loop on the current tokio runtime.
    #[instrument(skip(self))]
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_stopped() {
            return Err(MonitoringError::Stopped);
        }
        let mut runner = self.runner.lock();
        if runner.is_some() {
            return Err(MonitoringError::AlreadyRunning);
        }

        let period = self.settings.evaluation_interval;
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let engine: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(engine) = engine.upgrade() else {
                            break;
                        };
                        if let Err(e) = engine.tick() {
                            debug!("Evaluation loop exiting: {}", e);
                            break;
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Evaluation loop finished");
        });

        *runner = Some(Runner { shutdown, handle });
        info!(
            "Started evaluation loop with {}ms interval",
            period.as_millis()
        );
        Ok(())
    }

    /// Cancel the evaluation loop and clear every window, alert, trend and signal.
    ///
    /// Waits for an in-flight tick to finish; nothing it computed survives.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let runner = self.runner.lock().take();
        if let Some(runner) = runner {
            let _ = runner.shutdown.send(true);
            runner.handle.abort();
            if let Err(e) = runner.handle.await {
                if !e.is_cancelled() {
                    warn!("Evaluation loop ended abnormally: {}", e);
                }
            }
        }

        let mut stopped = self.lifecycle.write();
        *stopped = true;
        self.registry.clear();
        self.alerts.lock().reset();
        self.trends.lock().clear();
        self.signals.clear();
        self.probes.write().clear();
        self.probe_failures.lock().clear();
        *self.last_health.write() = None;
        self.exporter.reset();
        drop(stopped);

        info!("Observability engine stopped");
    }

    /// Run one evaluation pass: probes, alerts, health, trends, then events.
    #[instrument(skip(self))]
    pub fn tick(&self) -> Result<TickOutcome> {
        if self
            .ticking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let stopped = self.lifecycle.read();
            if *stopped {
                return Err(MonitoringError::Stopped);
            }
            debug!("Previous tick still running, skipping");
            self.exporter.record_skipped_tick();
            self.publish(EngineEvent::TickSkipped {
                at: self.clock.now(),
            });
            drop(stopped);
            return Ok(TickOutcome::Skipped);
        }
        let _guard = TickGuard(&self.ticking);

        let stopped = self.lifecycle.read();
        if *stopped {
            return Err(MonitoringError::Stopped);
        }

        let started = self.clock.elapsed();
        let now = self.clock.now();

        self.registry.purge_expired_timings();
        let failures = self.poll_probes();

        // Statistics come from window copies; no window lock is held from here on.
        let per_key = self.registry.per_key_stats();
        let signals: BTreeMap<String, ComponentSignals> = self
            .signals
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut observations = Vec::new();
        for (key, stats) in &per_key {
            observations.extend(latency_observations(key, stats));
        }
        for (component, s) in &signals {
            observations.extend(signal_observations(component, s));
        }

        let mut transitions = {
            let mut alerts = self.alerts.lock();
            let mut transitions = alerts.evaluate(&observations, now);
            transitions.extend(alerts.expire_info(now));
            transitions
        };

        let health = self.evaluate_health(&per_key, &failures, now);

        let changes = self.update_trends(&per_key, &signals, &health, now);
        {
            let mut alerts = self.alerts.lock();
            for change in changes
                .iter()
                .filter(|c| c.metric.is_latency() && c.to == TrendDirection::Degrading)
            {
                let message = format!(
                    "{} for {} is degrading (recent {:.1}ms)",
                    change.metric, change.key, change.recent
                );
                if let Some(t) =
                    alerts.raise_info(&change.key, MetricType::LatencyTrend, message, change.recent, now)
                {
                    transitions.push(t);
                }
            }
        }

        *self.last_health.write() = Some(health.clone());
        *self.probe_failures.lock() = failures;

        let active = self.alerts.lock().active_alerts();
        self.exporter
            .update_stats(&self.registry.all_stats(active.clone()));
        self.exporter.update_alerts(&active);
        self.exporter.update_health(&health);

        let duration = self.clock.elapsed().saturating_sub(started);
        self.exporter.record_tick(duration.as_secs_f64());

        let summary = TickSummary {
            alerts_raised: count(&transitions, |t| matches!(t, AlertTransition::Raised(_))),
            alerts_escalated: count(&transitions, |t| matches!(t, AlertTransition::Escalated(_))),
            alerts_resolved: count(&transitions, |t| matches!(t, AlertTransition::Resolved(_))),
            trend_changes: changes.len(),
            overall: health.overall,
            duration_ms: duration.as_secs_f64() * 1000.0,
        };

        // Published under the read guard so nothing from this tick follows a stop.
        self.publish_transitions(&transitions);
        for change in changes {
            self.publish(EngineEvent::TrendChanged {
                key: change.key,
                metric: change.metric,
                from: change.from,
                to: change.to,
            });
        }
        self.publish(EngineEvent::HealthEvaluated {
            overall: health.overall,
            evaluated_at: now,
        });
        drop(stopped);

        debug!(
            overall = %summary.overall,
            raised = summary.alerts_raised,
            resolved = summary.alerts_resolved,
            "Evaluation tick completed"
        );
        Ok(TickOutcome::Completed(summary))
    }

    fn poll_probes(&self) -> BTreeMap<String, String> {
        let probes: Vec<Arc<dyn ComponentProbe>> = self.probes.read().clone();
        let mut failures = BTreeMap::new();

        for probe in probes {
            let component = probe.component().to_string();
            match probe.sample() {
                Ok(reading) => {
                    let mut entry = self.signals.entry(component).or_default();
                    reading.apply(entry.value_mut(), self.settings.connection_history);
                }
                Err(e) => {
                    warn!(component = %component, "Probe failed: {}", e);
                    failures.insert(component, e.to_string());
                }
            }
        }
        failures
    }

    fn evaluate_health(
        &self,
        per_key: &BTreeMap<String, DistributionSnapshot>,
        failures: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> HealthReport {
        let mut components: BTreeSet<String> = per_key.keys().cloned().collect();
        components.extend(self.signals.iter().map(|e| e.key().clone()));
        components.extend(failures.keys().cloned());

        let inputs = components
            .into_iter()
            .map(|key| ComponentInput {
                stats: per_key
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| DistributionSnapshot::empty(&self.settings.registry.layout, now)),
                signals: self.signals(&key).unwrap_or_default(),
                failure: failures.get(&key).cloned(),
                key,
            })
            .collect();

        self.evaluator.evaluate(inputs, now)
    }

    fn update_trends(
        &self,
        per_key: &BTreeMap<String, DistributionSnapshot>,
        signals: &BTreeMap<String, ComponentSignals>,
        health: &HealthReport,
        now: DateTime<Utc>,
    ) -> Vec<TrendChange> {
        let mut trends = self.trends.lock();
        let mut changes = Vec::new();

        for (key, stats) in per_key.iter().filter(|(_, s)| !s.is_empty()) {
            changes.extend(trends.record(key, TrendMetric::MeanLatency, stats.mean, now));
            changes.extend(trends.record(key, TrendMetric::P95Latency, stats.p95, now));
        }
        for (component, s) in signals {
            if let Some(hit_rate) = s.cache_hit_rate() {
                changes.extend(trends.record(component, TrendMetric::CacheHitRate, hit_rate, now));
            }
        }
        for record in &health.components {
            changes.extend(trends.record(
                &record.component_key,
                TrendMetric::HealthScore,
                record.score,
                now,
            ));
        }
        changes
    }

    fn publish_transitions(&self, transitions: &[AlertTransition]) {
        for transition in transitions {
            let event = match transition {
                AlertTransition::Raised(a) => EngineEvent::AlertRaised(a.clone()),
                AlertTransition::Escalated(a) => EngineEvent::AlertEscalated(a.clone()),
                AlertTransition::Resolved(a) => EngineEvent::AlertResolved(a.clone()),
                AlertTransition::Suppressed { .. } => continue,
            };
            self.publish(event);
        }
    }

    fn publish(&self, event: EngineEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

fn latency_observations(key: &str, stats: &DistributionSnapshot) -> Vec<Observation> {
    if stats.is_empty() {
        return Vec::new();
    }
    vec![
        Observation::new(key, MetricType::ExecutionTimeP95, stats.p95),
        Observation::new(key, MetricType::ExecutionTimeP99, stats.p99),
    ]
}

fn signal_observations(component: &str, signals: &ComponentSignals) -> Vec<Observation> {
    let mut observations = Vec::new();
    if let Some(rate) = signals.cache_miss_rate() {
        observations.push(Observation::new(component, MetricType::CacheMissRate, rate));
    }
    if let Some(ratio) = signals.weak_connection_ratio() {
        observations.push(Observation::new(component, MetricType::WeakConnectionRatio, ratio));
    }
    if let Some(mib) = signals.memory_usage_mib {
        observations.push(Observation::new(component, MetricType::MemoryUsage, mib));
    }
    observations
}

fn count(transitions: &[AlertTransition], pred: impl Fn(&AlertTransition) -> bool) -> usize {
    transitions.iter().filter(|t| pred(t)).count()
}
