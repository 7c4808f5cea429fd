//! End-to-end scenarios for the observability engine
//!
//! Each test drives a [`ObservabilityEngine`] through a realistic workload on a
//! virtual clock and checks statistics, alerts, trends and lifecycle together.


use anyhow::Result;
use approx::assert_relative_eq;
use latency_watch::monitoring::{
    AlertSeverity, EngineEvent, HealthStatus, MetricType, MonitoringError, TrendDirection,
    TrendMetric,
};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{settings_with_p95_limits, settings_with_window, TestEngine};
use tracing_test::traced_test;

fn drain(events: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

/// One slow outlier among many fast calls shows up in the tail percentiles
/// and the mean but not the median.
#[tokio::test]
#[traced_test]
async fn test_outlier_skews_tail_not_median() -> Result<()> {
    let env = TestEngine::new();
    for i in 0..100 {
        assert!(env.engine.record_ms("search", i as f64 * 0.5));
    }
    assert!(env.engine.record_ms("search", 5000.0));

    let stats = env.engine.get_stats("search");
    assert_eq!(stats.count, 101);
    assert_eq!(stats.p50, 25.0);
    assert_eq!(stats.p99, 49.5);
    assert_eq!(stats.p999, 5000.0);
    assert_eq!(stats.max, 5000.0);
    assert_eq!(stats.min, 0.0);
    assert_relative_eq!(stats.mean, 7475.0 / 101.0, epsilon = 1e-9);
    assert!(stats.mean > stats.p50 * 2.0);

    let tail = stats.histogram.last().expect("histogram has a tail bucket");
    assert_eq!(tail.label, "> 5000ms");
    assert_eq!(tail.count, 1);
    let total: u64 = stats.histogram.iter().map(|b| b.count).sum();
    assert_eq!(total, 101);

    // The global window saw the same samples
    assert_eq!(env.engine.get_all_stats().global.count, 101);
    assert!(env.engine.get_active_alerts().is_empty());
    Ok(())
}

/// Sustained slow calls raise exactly one critical alert, published once.
#[tokio::test]
#[traced_test]
async fn test_sustained_breach_raises_single_critical_alert() -> Result<()> {
    let env = TestEngine::with_settings(settings_with_p95_limits(5.0, 10.0));
    let mut events = env.engine.subscribe();

    for _ in 0..3 {
        env.engine.record_ms("checkout", 15.0);
    }

    let alerts = env.engine.get_active_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    assert_eq!(alerts[0].threshold_type, MetricType::ExecutionTimeP95);
    assert_eq!(alerts[0].key, "checkout");
    assert_eq!(alerts[0].observed_value, 15.0);
    assert_eq!(alerts[0].limit, 10.0);

    let raised: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::AlertRaised(_)))
        .collect();
    assert_eq!(raised.len(), 1);
    assert!(logs_contain("CRITICAL ALERT"));

    // A tick re-evaluates the same breach without duplicating it
    env.tick();
    assert_eq!(env.engine.get_active_alerts().len(), 1);
    Ok(())
}

/// Once the window is dominated by fast calls the alert resolves.
#[tokio::test]
#[traced_test]
async fn test_alert_resolves_when_latency_recovers() -> Result<()> {
    let mut settings = settings_with_p95_limits(5.0, 10.0);
    settings.registry.window_capacity = 10;
    let env = TestEngine::with_settings(settings);

    env.engine.record_ms("checkout", 15.0);
    assert_eq!(env.engine.get_active_alerts().len(), 1);

    let mut events = env.engine.subscribe();
    for _ in 0..10 {
        env.engine.record_ms("checkout", 1.0);
    }

    assert!(env.engine.get_active_alerts().is_empty());
    let history = env.engine.alert_history(None);
    assert_eq!(history.len(), 1);
    assert!(history[0].resolved);
    assert!(history[0].resolved_at.is_some());
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, EngineEvent::AlertResolved(_))));
    Ok(())
}

/// A fresh breach after recovery raises a new alert even inside the dedup window.
#[tokio::test]
#[traced_test]
async fn test_rebreach_after_recovery_raises_again() -> Result<()> {
    let env = TestEngine::with_settings(settings_with_window(10));

    let p95_alerts = |alerts: Vec<latency_watch::Alert>| -> Vec<latency_watch::Alert> {
        alerts
            .into_iter()
            .filter(|a| a.threshold_type == MetricType::ExecutionTimeP95)
            .collect()
    };

    env.engine.record_ms("search", 3000.0);
    let first = p95_alerts(env.engine.get_active_alerts());
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].severity, AlertSeverity::Critical);

    for _ in 0..10 {
        env.engine.record_ms("search", 1.0);
    }
    assert!(env.engine.get_active_alerts().is_empty());

    env.advance(Duration::from_secs(60));
    for _ in 0..10 {
        env.engine.record_ms("search", 3000.0);
    }
    env.engine.tick()?;

    assert_eq!(env.engine.get_stats("search").p95, 3000.0);
    let active = p95_alerts(env.engine.get_active_alerts());
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].severity, AlertSeverity::Critical);
    assert_ne!(active[0].id, first[0].id);
    assert_eq!(p95_alerts(env.engine.alert_history(None)).len(), 2);
    Ok(())
}

/// Steadily falling latency is classified as improving.
#[tokio::test]
#[traced_test]
async fn test_falling_latency_trend_is_improving() -> Result<()> {
    let env = TestEngine::with_settings(settings_with_window(10));

    for t in 0..10 {
        let value = 300.0 - 25.0 * t as f64;
        for _ in 0..10 {
            env.engine.record_ms("render", value);
        }
        env.tick();
    }

    let trends = env.engine.get_trends(Some("render"));
    let mean = trends
        .iter()
        .find(|t| t.metric == TrendMetric::MeanLatency)
        .expect("mean latency is tracked");
    assert_eq!(mean.direction, TrendDirection::Improving);
    assert_eq!(mean.points.len(), 10);
    assert!(mean.predicted_next.is_some_and(|p| p < 75.0));

    assert!(env
        .engine
        .get_active_alerts()
        .iter()
        .all(|a| a.threshold_type != MetricType::LatencyTrend));
    Ok(())
}

/// Steadily rising latency is degrading and leaves an informational notice.
#[tokio::test]
#[traced_test]
async fn test_rising_latency_trend_raises_notice() -> Result<()> {
    let env = TestEngine::with_settings(settings_with_window(10));
    let mut events = env.engine.subscribe();

    for t in 0..10 {
        let value = 50.0 + 25.0 * t as f64;
        for _ in 0..10 {
            env.engine.record_ms("render", value);
        }
        env.tick();
    }

    let trends = env.engine.get_trends(Some("render"));
    for metric in [TrendMetric::MeanLatency, TrendMetric::P95Latency] {
        let trend = trends
            .iter()
            .find(|t| t.metric == metric)
            .expect("latency trend is tracked");
        assert_eq!(trend.direction, TrendDirection::Degrading);
    }

    let notices: Vec<_> = env
        .engine
        .get_active_alerts()
        .into_iter()
        .filter(|a| a.threshold_type == MetricType::LatencyTrend)
        .collect();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].severity, AlertSeverity::Info);
    assert_eq!(notices[0].key, "render");

    assert!(drain(&mut events).iter().any(|e| matches!(
        e,
        EngineEvent::TrendChanged {
            metric: TrendMetric::MeanLatency,
            to: TrendDirection::Degrading,
            ..
        }
    )));

    let report = env.engine.generate_report();
    assert!(!report.recommendations.is_empty());
    Ok(())
}

/// Stopping while another thread is ticking and recording leaves nothing behind.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_during_ticks_clears_everything() -> Result<()> {
    let env = TestEngine::new();
    for i in 0..50 {
        env.engine.record_ms("ingest", 10.0 + i as f64);
    }
    env.engine.record_cache_miss("ingest");
    env.engine.raise_info("ingest", "backfill running");

    let engine = Arc::clone(&env.engine);
    let worker = tokio::task::spawn_blocking(move || {
        let mut ticks = 0u64;
        loop {
            match engine.tick() {
                Ok(_) => {
                    ticks += 1;
                    engine.record_ms("ingest", 12.0);
                }
                Err(e) => return (ticks, e),
            }
        }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    env.engine.stop().await;
    let mut late = env.engine.subscribe();

    let (_ticks, error) = worker.await?;
    assert!(matches!(error, MonitoringError::Stopped));
    // Nothing computed by an interrupted tick reaches subscribers after stop
    assert!(matches!(
        late.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));

    assert!(env.engine.is_stopped());
    assert!(!env.engine.is_running());
    let stats = env.engine.get_all_stats();
    assert!(stats.per_key.is_empty());
    assert_eq!(stats.global.count, 0);
    assert!(env.engine.get_active_alerts().is_empty());
    assert!(env.engine.alert_history(None).is_empty());
    assert!(env.engine.get_trends(None).is_empty());
    assert!(env.engine.signals("ingest").is_none());
    assert!(env.engine.last_health_report().is_none());

    assert!(matches!(env.engine.tick(), Err(MonitoringError::Stopped)));
    assert!(!env.engine.record_ms("ingest", 5.0));
    assert!(env.engine.get_all_stats().per_key.is_empty());
    assert!(env
        .engine
        .generate_report()
        .errors
        .iter()
        .any(|e| e.contains("stopped")));
    Ok(())
}

/// The background loop ticks on its interval and refuses to start twice.
#[tokio::test(start_paused = true)]
#[traced_test]
async fn test_background_loop_lifecycle() -> Result<()> {
    let env = TestEngine::new();
    env.engine.record_ms("api", 40.0);

    env.engine.start()?;
    assert!(env.engine.is_running());
    assert!(env.engine.last_health_report().is_none());

    tokio::time::sleep(Duration::from_secs(31)).await;
    let health = env
        .engine
        .last_health_report()
        .expect("first tick committed a health report");
    assert_eq!(health.overall, HealthStatus::Healthy);
    assert!(health.component("api").is_some());

    assert!(matches!(
        env.engine.start(),
        Err(MonitoringError::AlreadyRunning)
    ));

    env.engine.stop().await;
    assert!(!env.engine.is_running());
    assert!(matches!(env.engine.start(), Err(MonitoringError::Stopped)));
    Ok(())
}

/// Info notices expire on the first tick past their TTL.
#[tokio::test]
#[traced_test]
async fn test_info_notice_lifecycle() -> Result<()> {
    let env = TestEngine::new();
    let notice = env
        .engine
        .raise_info("deploy", "canary at 10%")
        .expect("notice raised");
    assert_eq!(notice.severity, AlertSeverity::Info);

    env.tick();
    assert_eq!(env.engine.get_active_alerts().len(), 1);

    env.advance(Duration::from_secs(300));
    env.tick();
    assert!(env.engine.get_active_alerts().is_empty());
    assert!(env.engine.alert_history(Some(1))[0].resolved);
    Ok(())
}

/// Exports agree with each other and with the live statistics.
#[tokio::test]
#[traced_test]
async fn test_exports_cover_recorded_keys() -> Result<()> {
    let env = TestEngine::with_settings(settings_with_p95_limits(5.0, 10.0));
    for _ in 0..20 {
        env.engine.record_ms("billing", 12.0);
        env.engine.record_ms("profile", 2.0);
    }
    env.tick();

    let json: serde_json::Value = serde_json::from_str(&env.engine.export_json())?;
    assert_eq!(json["rows_format_version"], 1);
    assert_eq!(json["metrics"]["per_key"]["billing"]["count"], 20);
    assert_eq!(json["alerts"].as_array().map(|a| a.len()), Some(1));

    let rows = env.engine.export_rows();
    assert!(rows
        .iter()
        .any(|r| r.kind == "latency" && r.metric == "billing.p95" && r.value == 12.0));
    assert!(env
        .engine
        .export_rows_csv()
        .starts_with("timestamp,type,metric,value\n"));

    let text = env.engine.export_prometheus()?;
    assert!(text.contains("billing"));
    assert!(text.contains("profile"));
    Ok(())
}
