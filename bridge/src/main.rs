mod config;

use clap::{Parser, Subcommand};
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "jira-bridge", about = "Jira integration plugin server")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve the plugin and admin listeners
    Run {
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Load and validate a config file, then exit
    Validate {
        #[arg(long, short)]
        config: PathBuf,
    },
}

#[derive(thiserror::Error, Debug)]
enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error(transparent)]
    Plugin(#[from] jira_plugin::PluginError),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        CliCommand::Validate { config } => Config::from_file(&config).map(|_| {
            println!("{} is valid", config.display());
        }),
        CliCommand::Run { config } => match Config::from_file(&config) {
            Ok(config) => {
                return match run(config) {
                    Ok(()) => ExitCode::SUCCESS,
                    Err(err) => {
                        tracing::error!(error = %err, "jira-bridge exited with an error");
                        ExitCode::FAILURE
                    }
                };
            }
            Err(err) => Err(err),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> Result<(), BridgeError> {
    let logging = config.common.logging.clone().unwrap_or_default();
    let _sentry = init_logging(&logging);

    if let Some(metrics) = &config.common.metrics {
        init_metrics(metrics)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(jira_plugin::PluginError::from)?;

    tracing::info!("starting jira-bridge");
    runtime.block_on(jira_plugin::run(config.plugin))?;
    Ok(())
}

/// Installs the tracing subscriber, forwarding events to Sentry when a DSN is configured.
fn init_logging(logging: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let guard = logging.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let level = if logging.level.is_empty() {
        "info"
    } else {
        logging.level.as_str()
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(metrics: &MetricsConfig) -> Result<(), BridgeError> {
    let recorder = StatsdBuilder::from(metrics.statsd_host.as_str(), metrics.statsd_port)
        .build(Some(&metrics.prefix))
        .map_err(|e| BridgeError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| BridgeError::Metrics(e.to_string()))?;

    shared::metrics_defs::describe_all(jira_plugin::metrics_defs::ALL_METRICS);
    tracing::info!(
        host = %metrics.statsd_host,
        port = metrics.statsd_port,
        "sending metrics to statsd"
    );
    Ok(())
}
