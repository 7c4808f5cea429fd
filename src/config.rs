use crate::monitoring::{
    AlertConfig, BucketLayout, EngineSettings, HealthRules, MetricType, Polarity, RegistryConfig,
    ThresholdRule, TrendMetric, TrendSettings, DEFAULT_BUCKET_BOUNDS_MS, DEFAULT_MAX_SAMPLE_MS,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Prefix shared by every environment override
pub const ENV_PREFIX: &str = "LATENCY_WATCH_";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Windows, caching, evaluation loop and alert lifecycle
    pub engine: EngineConfig,

    /// Alert thresholds per metric
    pub thresholds: ThresholdConfig,

    /// Health scoring rules
    pub health: HealthRuleConfig,

    /// Trend detection
    pub trends: TrendConfig,

    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Samples kept per operation key
    pub window_capacity: usize,

    /// How long a computed distribution stays fresh
    pub stats_cache_ttl_ms: u64,

    /// Samples above this are rejected as corrupt
    pub max_sample_ms: f64,

    /// Upper bounds of the histogram buckets; a final unbounded bucket is implied
    pub bucket_bounds_ms: Vec<f64>,

    /// Timing handles not ended within this are discarded
    pub timing_handle_ttl_seconds: u64,

    /// Period of the background evaluation tick
    pub evaluation_interval_seconds: u64,

    /// Check latency thresholds right after each recorded sample
    pub inline_evaluation: bool,

    /// Repeated breaches within this window do not raise a new alert
    pub dedup_window_seconds: u64,

    /// Lifetime of info alerts
    pub info_alert_ttl_seconds: u64,

    /// Resolved and active alerts kept for history queries
    pub alert_history_limit: usize,

    /// Connection-strength samples kept per component
    pub connection_history: usize,

    /// Buffered events per subscriber
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThresholdConfig {
    pub p95_warning_ms: f64,
    pub p95_critical_ms: f64,
    pub p99_warning_ms: f64,
    pub p99_critical_ms: f64,
    pub cache_miss_warning: f64,
    pub cache_miss_critical: f64,
    pub weak_connection_warning: f64,
    pub weak_connection_critical: f64,
    pub memory_warning_mib: f64,
    pub memory_critical_mib: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthRuleConfig {
    pub execution_p95_limit_ms: f64,
    pub execution_penalty: f64,
    pub cache_miss_limit: f64,
    pub cache_miss_penalty: f64,
    pub weak_connection_limit: f64,
    pub weak_connection_penalty: f64,
    pub memory_limit_mib: f64,
    pub memory_penalty: f64,

    /// Share of degraded components above which the system is degraded
    pub degraded_fraction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrendConfig {
    /// Points kept per (key, metric)
    pub history_len: usize,

    /// Points averaged on each side of the comparison
    pub window: usize,

    /// Ticks between the recent and older windows
    pub offset: usize,

    /// Relative band inside which a change counts as stable
    pub hysteresis: f64,

    /// Ticks ahead for the linear projection
    pub lookahead: usize,

    /// Overrides of the built-in polarity per metric
    pub polarity: Vec<PolarityOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolarityOverride {
    pub metric: TrendMetric,
    pub polarity: Polarity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace), overridden by RUST_LOG
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_capacity: 10_000,
            stats_cache_ttl_ms: 100,
            max_sample_ms: DEFAULT_MAX_SAMPLE_MS,
            bucket_bounds_ms: DEFAULT_BUCKET_BOUNDS_MS.to_vec(),
            timing_handle_ttl_seconds: 300,
            evaluation_interval_seconds: 30,
            inline_evaluation: true,
            dedup_window_seconds: 300,
            info_alert_ttl_seconds: 300,
            alert_history_limit: 1000,
            connection_history: 100,
            event_capacity: 256,
        }
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            p95_warning_ms: 1000.0,
            p95_critical_ms: 2000.0,
            p99_warning_ms: 2000.0,
            p99_critical_ms: 5000.0,
            cache_miss_warning: 0.30,
            cache_miss_critical: 0.50,
            weak_connection_warning: 0.50,
            weak_connection_critical: 0.75,
            memory_warning_mib: 512.0,
            memory_critical_mib: 1024.0,
        }
    }
}

impl Default for HealthRuleConfig {
    fn default() -> Self {
        let rules = HealthRules::default();
        Self {
            execution_p95_limit_ms: rules.execution_p95_limit_ms,
            execution_penalty: rules.execution_penalty,
            cache_miss_limit: rules.cache_miss_limit,
            cache_miss_penalty: rules.cache_miss_penalty,
            weak_connection_limit: rules.weak_connection_limit,
            weak_connection_penalty: rules.weak_connection_penalty,
            memory_limit_mib: rules.memory_limit_mib,
            memory_penalty: rules.memory_penalty,
            degraded_fraction: rules.degraded_fraction,
        }
    }
}

impl Default for TrendConfig {
    fn default() -> Self {
        let settings = TrendSettings::default();
        Self {
            history_len: settings.history_len,
            window: settings.window,
            offset: settings.offset,
            hysteresis: settings.hysteresis,
            lookahead: settings.lookahead,
            polarity: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Defaults overridden by `LATENCY_WATCH_*` environment variables
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let mut config = Config::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Read a TOML file; missing fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {e}", path.display()))?;
        toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Invalid config file {}: {e}", path.display()))
    }

    /// Defaults, then the optional file, then the environment; validated last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        // Engine
        if let Some(capacity) = env_parse("WINDOW_CAPACITY")? {
            self.engine.window_capacity = capacity;
        }
        if let Some(ttl) = env_parse("STATS_CACHE_TTL_MS")? {
            self.engine.stats_cache_ttl_ms = ttl;
        }
        if let Some(cap) = env_parse("MAX_SAMPLE_MS")? {
            self.engine.max_sample_ms = cap;
        }
        if let Ok(bounds) = env::var(format!("{ENV_PREFIX}BUCKET_BOUNDS_MS")) {
            self.engine.bucket_bounds_ms = bounds
                .split(',')
                .map(|b| b.trim().parse::<f64>())
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| anyhow::anyhow!("Invalid {ENV_PREFIX}BUCKET_BOUNDS_MS: {}", e))?;
        }
        if let Some(ttl) = env_parse("TIMING_HANDLE_TTL_SECONDS")? {
            self.engine.timing_handle_ttl_seconds = ttl;
        }
        if let Some(interval) = env_parse("EVALUATION_INTERVAL_SECONDS")? {
            self.engine.evaluation_interval_seconds = interval;
        }
        if let Some(inline) = env_parse("INLINE_EVALUATION")? {
            self.engine.inline_evaluation = inline;
        }
        if let Some(window) = env_parse("DEDUP_WINDOW_SECONDS")? {
            self.engine.dedup_window_seconds = window;
        }
        if let Some(ttl) = env_parse("INFO_ALERT_TTL_SECONDS")? {
            self.engine.info_alert_ttl_seconds = ttl;
        }
        if let Some(limit) = env_parse("ALERT_HISTORY_LIMIT")? {
            self.engine.alert_history_limit = limit;
        }

        // Latency thresholds
        if let Some(limit) = env_parse("P95_WARNING_MS")? {
            self.thresholds.p95_warning_ms = limit;
        }
        if let Some(limit) = env_parse("P95_CRITICAL_MS")? {
            self.thresholds.p95_critical_ms = limit;
        }
        if let Some(limit) = env_parse("P99_WARNING_MS")? {
            self.thresholds.p99_warning_ms = limit;
        }
        if let Some(limit) = env_parse("P99_CRITICAL_MS")? {
            self.thresholds.p99_critical_ms = limit;
        }

        // Trends
        if let Some(band) = env_parse("TREND_HYSTERESIS")? {
            self.trends.hysteresis = band;
        }
        if let Some(len) = env_parse("TREND_HISTORY")? {
            self.trends.history_len = len;
        }
        if let Some(lookahead) = env_parse("TREND_LOOKAHEAD")? {
            self.trends.lookahead = lookahead;
        }

        // Logging
        if let Ok(level) = env::var(format!("{ENV_PREFIX}LOG_LEVEL")) {
            self.logging.level = level;
        }
        if let Some(json) = env_parse("LOG_JSON")? {
            self.logging.json = json;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.window_capacity == 0 {
            return Err(anyhow::anyhow!("Window capacity must be greater than 0"));
        }
        if engine.evaluation_interval_seconds == 0 {
            return Err(anyhow::anyhow!(
                "Evaluation interval must be greater than 0"
            ));
        }
        if !(engine.max_sample_ms.is_finite() && engine.max_sample_ms > 0.0) {
            return Err(anyhow::anyhow!("Max sample must be a positive number"));
        }
        if engine.event_capacity == 0 || engine.alert_history_limit == 0 {
            return Err(anyhow::anyhow!(
                "Event capacity and alert history limit must be greater than 0"
            ));
        }
        BucketLayout::new(engine.bucket_bounds_ms.clone())
            .map_err(|e| anyhow::anyhow!("Invalid bucket bounds: {e}"))?;

        let t = &self.thresholds;
        for (name, warning, critical) in [
            ("p95", t.p95_warning_ms, t.p95_critical_ms),
            ("p99", t.p99_warning_ms, t.p99_critical_ms),
            ("cache miss", t.cache_miss_warning, t.cache_miss_critical),
            ("weak connection", t.weak_connection_warning, t.weak_connection_critical),
            ("memory", t.memory_warning_mib, t.memory_critical_mib),
        ] {
            if warning > critical {
                return Err(anyhow::anyhow!(
                    "{name} warning limit ({warning}) must not exceed critical limit ({critical})"
                ));
            }
        }

        for (name, fraction) in [
            ("Cache miss warning", t.cache_miss_warning),
            ("Cache miss critical", t.cache_miss_critical),
            ("Weak connection warning", t.weak_connection_warning),
            ("Weak connection critical", t.weak_connection_critical),
            ("Health cache miss limit", self.health.cache_miss_limit),
            ("Health weak connection limit", self.health.weak_connection_limit),
            ("Degraded fraction", self.health.degraded_fraction),
        ] {
            if !(0.0..=1.0).contains(&fraction) {
                return Err(anyhow::anyhow!("{name} must be between 0.0 and 1.0"));
            }
        }

        if self.trends.history_len < self.trends.window + self.trends.offset {
            return Err(anyhow::anyhow!(
                "Trend history ({}) must hold at least window + offset ({}) points",
                self.trends.history_len,
                self.trends.window + self.trends.offset
            ));
        }
        if self.trends.window == 0 || self.trends.offset == 0 {
            return Err(anyhow::anyhow!("Trend window and offset must be greater than 0"));
        }
        if !(0.0..1.0).contains(&self.trends.hysteresis) {
            return Err(anyhow::anyhow!(
                "Trend hysteresis must be in [0.0, 1.0)"
            ));
        }

        Ok(())
    }

    /// Build the engine settings this configuration describes
    pub fn engine_settings(&self) -> Result<EngineSettings> {
        let engine = &self.engine;
        let layout = BucketLayout::new(engine.bucket_bounds_ms.clone())
            .map_err(|e| anyhow::anyhow!("Invalid bucket bounds: {e}"))?;
        let t = &self.thresholds;
        let h = &self.health;
        let defaults = HealthRules::default();

        Ok(EngineSettings {
            registry: RegistryConfig {
                window_capacity: engine.window_capacity,
                max_sample_ms: engine.max_sample_ms,
                stats_cache_ttl: Duration::from_millis(engine.stats_cache_ttl_ms),
                timing_handle_ttl: Duration::from_secs(engine.timing_handle_ttl_seconds),
                layout: Arc::new(layout),
            },
            thresholds: vec![
                ThresholdRule::new(MetricType::ExecutionTimeP95, t.p95_warning_ms, t.p95_critical_ms),
                ThresholdRule::new(MetricType::ExecutionTimeP99, t.p99_warning_ms, t.p99_critical_ms),
                ThresholdRule::new(MetricType::CacheMissRate, t.cache_miss_warning, t.cache_miss_critical),
                ThresholdRule::new(
                    MetricType::WeakConnectionRatio,
                    t.weak_connection_warning,
                    t.weak_connection_critical,
                ),
                ThresholdRule::new(MetricType::MemoryUsage, t.memory_warning_mib, t.memory_critical_mib),
            ],
            alerts: AlertConfig {
                dedup_window: chrono::Duration::seconds(engine.dedup_window_seconds as i64),
                info_ttl: chrono::Duration::seconds(engine.info_alert_ttl_seconds as i64),
                history_limit: engine.alert_history_limit,
            },
            health: HealthRules {
                execution_p95_limit_ms: h.execution_p95_limit_ms,
                execution_penalty: h.execution_penalty,
                cache_miss_limit: h.cache_miss_limit,
                cache_miss_penalty: h.cache_miss_penalty,
                weak_connection_limit: h.weak_connection_limit,
                weak_connection_penalty: h.weak_connection_penalty,
                memory_limit_mib: h.memory_limit_mib,
                memory_penalty: h.memory_penalty,
                degraded_fraction: h.degraded_fraction,
                ..defaults
            },
            trends: TrendSettings {
                history_len: self.trends.history_len,
                window: self.trends.window,
                offset: self.trends.offset,
                hysteresis: self.trends.hysteresis,
                lookahead: self.trends.lookahead,
                polarity_overrides: self
                    .trends
                    .polarity
                    .iter()
                    .map(|o| (o.metric, o.polarity))
                    .collect::<BTreeMap<_, _>>(),
            },
            evaluation_interval: Duration::from_secs(engine.evaluation_interval_seconds),
            inline_evaluation: engine.inline_evaluation,
            connection_history: engine.connection_history,
            event_capacity: engine.event_capacity,
        })
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| anyhow::anyhow!("Failed to render config: {e}"))
    }
}

/// Parse `LATENCY_WATCH_<name>` if set
fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let key = format!("{ENV_PREFIX}{name}");
    match env::var(&key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid {key}: {e}")),
        Err(_) => Ok(None),
    }
}
