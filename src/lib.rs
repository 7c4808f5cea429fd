pub mod config;
pub mod monitoring;

pub use config::Config;

// Re-export the engine surface
pub use monitoring::{
    Alert, AlertSeverity, AllStats, ComponentProbe, DistributionSnapshot, EngineEvent,
    EngineReport, EngineSettings, HealthReport, HealthStatus, MonitoringError,
    ObservabilityEngine, Trend, TrendDirection,
};
