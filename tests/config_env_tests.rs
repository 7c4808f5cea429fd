//! Configuration loading from files and the environment
//!
//! Environment variables are process-global, so every test here runs serially
//! and removes what it sets.

use anyhow::Result;
use latency_watch::config::{Config, ENV_PREFIX};
use latency_watch::monitoring::{MetricType, ObservabilityEngine};
use serial_test::serial;
use std::env;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio_test::{assert_err, assert_ok};

const VARS: &[&str] = &[
    "WINDOW_CAPACITY",
    "STATS_CACHE_TTL_MS",
    "BUCKET_BOUNDS_MS",
    "EVALUATION_INTERVAL_SECONDS",
    "INLINE_EVALUATION",
    "DEDUP_WINDOW_SECONDS",
    "P95_WARNING_MS",
    "P95_CRITICAL_MS",
    "TREND_HYSTERESIS",
    "LOG_LEVEL",
    "LOG_JSON",
];

fn set(name: &str, value: &str) {
    env::set_var(format!("{ENV_PREFIX}{name}"), value);
}

fn clear_env() {
    for name in VARS {
        env::remove_var(format!("{ENV_PREFIX}{name}"));
    }
}

fn write_config(contents: &str) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

#[test]
#[serial]
fn test_env_overrides_defaults() -> Result<()> {
    clear_env();
    set("WINDOW_CAPACITY", "2500");
    set("STATS_CACHE_TTL_MS", "250");
    set("BUCKET_BOUNDS_MS", "5, 20, 100");
    set("INLINE_EVALUATION", "false");
    set("P95_WARNING_MS", "150");
    set("P95_CRITICAL_MS", "400");
    set("LOG_JSON", "true");

    let config = Config::from_env();
    clear_env();
    let config = config?;

    assert_eq!(config.engine.window_capacity, 2500);
    assert_eq!(config.engine.stats_cache_ttl_ms, 250);
    assert_eq!(config.engine.bucket_bounds_ms, vec![5.0, 20.0, 100.0]);
    assert!(!config.engine.inline_evaluation);
    assert_eq!(config.thresholds.p95_warning_ms, 150.0);
    assert_eq!(config.thresholds.p95_critical_ms, 400.0);
    assert!(config.logging.json);
    // Untouched values keep their defaults
    assert_eq!(config.engine.evaluation_interval_seconds, 30);
    assert_ok!(config.validate());

    let settings = config.engine_settings()?;
    assert_eq!(settings.registry.window_capacity, 2500);
    assert_eq!(settings.registry.stats_cache_ttl, Duration::from_millis(250));
    assert_eq!(settings.registry.layout.bucket_count(), 4);
    let p95 = settings
        .thresholds
        .iter()
        .find(|r| r.metric == MetricType::ExecutionTimeP95)
        .expect("p95 rule present");
    assert_eq!((p95.warning_limit, p95.critical_limit), (150.0, 400.0));
    Ok(())
}

#[test]
#[serial]
fn test_invalid_env_values_are_reported() {
    clear_env();

    set("WINDOW_CAPACITY", "lots");
    let err = assert_err!(Config::from_env());
    assert!(err.to_string().contains("LATENCY_WATCH_WINDOW_CAPACITY"));
    clear_env();

    set("BUCKET_BOUNDS_MS", "10,fast,100");
    assert_err!(Config::from_env());
    clear_env();

    // Parses, but fails validation
    set("P95_WARNING_MS", "5000");
    assert_ok!(Config::from_env());
    assert_err!(Config::load(None));
    clear_env();

    set("TREND_HYSTERESIS", "1.5");
    assert_err!(Config::load(None));
    clear_env();
}

#[test]
#[serial]
fn test_file_then_env_precedence() -> Result<()> {
    clear_env();
    let file = write_config(
        r#"
        [engine]
        window_capacity = 800
        evaluation_interval_seconds = 5
        dedup_window_seconds = 60

        [thresholds]
        p95_warning_ms = 100.0
        p95_critical_ms = 200.0

        [logging]
        level = "debug"
        "#,
    )?;

    set("WINDOW_CAPACITY", "1200");
    set("LOG_LEVEL", "warn");
    let config = Config::load(Some(file.path()));
    clear_env();
    let config = config?;

    // Environment beats the file, the file beats the defaults
    assert_eq!(config.engine.window_capacity, 1200);
    assert_eq!(config.logging.level, "warn");
    assert_eq!(config.engine.evaluation_interval_seconds, 5);
    assert_eq!(config.engine.dedup_window_seconds, 60);
    assert_eq!(config.thresholds.p95_critical_ms, 200.0);
    assert_eq!(config.engine.stats_cache_ttl_ms, 100);

    let settings = config.engine_settings()?;
    assert_eq!(settings.evaluation_interval, Duration::from_secs(5));
    assert_eq!(settings.alerts.dedup_window, chrono::Duration::seconds(60));

    // The loaded settings drive a working engine
    let engine = ObservabilityEngine::new(settings)?;
    engine.record_ms("upload", 250.0);
    assert_eq!(engine.get_active_alerts().len(), 1);
    Ok(())
}

#[test]
#[serial]
fn test_malformed_file_is_rejected() -> Result<()> {
    clear_env();
    let file = write_config("[engine]\nwindow_capacity = \"many\"\n")?;
    let err = assert_err!(Config::load(Some(file.path())));
    assert!(err.to_string().contains("Invalid config file"));

    let missing = file.path().with_extension("missing");
    assert_err!(Config::load(Some(missing.as_path())));
    Ok(())
}

#[test]
#[serial]
fn test_rendered_config_round_trips() -> Result<()> {
    clear_env();
    let mut config = Config::default();
    config.engine.window_capacity = 42;
    config.trends.hysteresis = 0.2;

    let file = write_config(&config.to_toml()?)?;
    let loaded = Config::load(Some(file.path()))?;
    assert_eq!(loaded, config);
    Ok(())
}
