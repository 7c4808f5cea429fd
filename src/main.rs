use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use latency_watch::config::{Config, LoggingConfig};
use latency_watch::monitoring::{
    ConnectionStrength, EngineEvent, ManualClock, ObservabilityEngine, ProcessMemoryProbe,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "latency-watch")]
#[command(about = "In-process latency observability engine: distributions, alerts, health and trends")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "LATENCY_WATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed a synthetic workload through the engine and print the report
    Simulate {
        /// Number of operation keys
        #[arg(long, default_value = "4")]
        keys: usize,
        /// Samples recorded per key on every tick
        #[arg(long, default_value = "200")]
        samples: usize,
        /// Evaluation ticks to run
        #[arg(long, default_value = "12")]
        ticks: usize,
        /// Make the last key progressively slower
        #[arg(long)]
        degrade: bool,
        /// Seed for reproducible output
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, value_enum, default_value = "json")]
        format: OutputFormat,
    },
    /// Run the evaluation loop against this process until interrupted
    Monitor {
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the effective configuration
    Validate,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Rows,
    Prometheus,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        // Validation reports its own errors instead of failing at load time.
        Commands::Config {
            command: ConfigCommands::Validate,
        } => {
            let mut config = match &cli.config {
                Some(path) => Config::from_file(path)?,
                None => Config::default(),
            };
            dotenv::dotenv().ok();
            config.apply_env_overrides()?;
            config
        }
        _ => Config::load(cli.config.as_deref())?,
    };

    init_tracing(&config.logging);

    match cli.command {
        Commands::Simulate {
            keys,
            samples,
            ticks,
            degrade,
            seed,
            format,
        } => run_simulation(&config, keys, samples, ticks, degrade, seed, format),
        Commands::Monitor { duration } => run_monitor(&config, duration).await,
        Commands::Config { command } => handle_config_command(command, &config),
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.clone().into());

    // Logs go to stderr so reports on stdout stay machine-readable.
    let json_layer = logging
        .json
        .then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!logging.json)
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

fn handle_config_command(command: ConfigCommands, config: &Config) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        ConfigCommands::Validate => match config.validate() {
            Ok(()) => {
                println!("Configuration is valid");
                Ok(())
            }
            Err(e) => {
                eprintln!("Configuration is invalid: {e}");
                Err(e)
            }
        },
    }
}

#[allow(clippy::too_many_arguments)]
fn run_simulation(
    config: &Config,
    keys: usize,
    samples: usize,
    ticks: usize,
    degrade: bool,
    seed: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    let settings = config.engine_settings()?;
    let interval = settings.evaluation_interval;
    let clock = Arc::new(ManualClock::new());
    let engine = ObservabilityEngine::with_clock(settings, clock.clone())?;
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let keys: Vec<String> = (0..keys.max(1)).map(|i| format!("operation_{i}")).collect();
    info!(
        "Simulating {} keys, {} samples per tick, {} ticks",
        keys.len(),
        samples,
        ticks
    );

    for tick in 0..ticks {
        for (index, key) in keys.iter().enumerate() {
            let base_ms = 20.0 * (index + 1) as f64;
            let slowdown = if degrade && index == keys.len() - 1 {
                1.0 + 0.25 * tick as f64
            } else {
                1.0
            };
            for _ in 0..samples {
                let jitter: f64 = rng.gen_range(0.5..1.5);
                engine.record_ms(key, base_ms * slowdown * jitter);
            }

            if rng.gen_bool(0.8) {
                engine.record_cache_hit(key);
            } else {
                engine.record_cache_miss(key);
            }
            let strength = match rng.gen_range(0..10) {
                0 => ConnectionStrength::Weak,
                1..=3 => ConnectionStrength::Moderate,
                _ => ConnectionStrength::Strong,
            };
            engine.record_connection(key, strength);
        }

        clock.advance(interval);
        engine.tick()?;
    }

    match format {
        OutputFormat::Json => println!("{}", engine.export_json()),
        OutputFormat::Rows => print!("{}", engine.export_rows_csv()),
        OutputFormat::Prometheus => print!("{}", engine.export_prometheus()?),
    }
    Ok(())
}

async fn run_monitor(config: &Config, duration: Option<u64>) -> Result<()> {
    let engine = Arc::new(ObservabilityEngine::new(config.engine_settings()?)?);
    engine.register_probe(Arc::new(ProcessMemoryProbe::new("process")?));

    let mut events = engine.subscribe();
    engine.start()?;
    info!("Monitoring this process; press Ctrl-C to stop");

    let deadline = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(EngineEvent::HealthEvaluated { overall, .. }) => {
                    let health = engine.last_health_report();
                    let score = health.map(|h| h.summary.average_score).unwrap_or(100.0);
                    info!(%overall, score, "Health evaluated");
                }
                Ok(EngineEvent::AlertRaised(alert)) => warn!("Alert raised: {}", alert.message),
                Ok(EngineEvent::AlertResolved(alert)) => info!("Alert resolved: {}", alert.message),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => break,
                Err(e) => warn!("Event stream interrupted: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C");
                break;
            }
            _ = &mut deadline => break,
        }
    }

    engine.stop().await;
    Ok(())
}
