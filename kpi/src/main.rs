mod config;

use clap::{Args, Parser};
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use kpi_engine::cache::InMemoryResultCache;
use kpi_engine::config::ValidationError;
use kpi_engine::pool::{PoolError, ThreadedPool};
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "kpi")]
enum CliCommand {
    /// Load and validate a config file, then build the worker pool and result cache
    CheckConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long)]
    config_file: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid config: {0}")]
    Validation(#[from] ValidationError),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();

    let result = match &cli {
        CliCommand::CheckConfig(args) => check_config(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("kpi: {e}");
            ExitCode::FAILURE
        }
    }
}

fn check_config(args: &ConfigArgs) -> Result<(), CliError> {
    let config = Config::from_file(&args.config_file)?;
    config.validate()?;

    let _sentry = init_logging(config.common.logging.as_ref());
    if let Some(metrics_config) = &config.common.metrics {
        init_metrics(metrics_config)?;
    }

    let pool = ThreadedPool::new(&config.engine.pool)?;
    let _cache = InMemoryResultCache::new(&config.engine.cache);

    tracing::info!(
        threads = pool.threads(),
        queue_capacity = pool.capacity(),
        cache_capacity = config.engine.cache.max_capacity,
        project_level = config.engine.project_level,
        "Configuration is valid, engine ready"
    );

    Ok(())
}

/// Installs the log subscriber. The returned guard flushes pending Sentry
/// events when dropped.
fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let guard = logging.map(|logging| {
        sentry::init((
            logging.sentry_dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(metrics_config: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(metrics_config.statsd_host.as_str(), metrics_config.statsd_port)
        .build(Some("kpi"))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;

    shared::metrics_defs::describe_all(kpi_engine::metrics_defs::ALL_METRICS);
    Ok(())
}
