use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitoringError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid signal for component {component}: {message}")]
    InvalidSignal { component: String, message: String },

    #[error("Probe {probe} failed: {message}")]
    ProbeFailed { probe: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Metrics registry error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Evaluation loop is already running")]
    AlreadyRunning,

    #[error("Engine has been stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, MonitoringError>;
