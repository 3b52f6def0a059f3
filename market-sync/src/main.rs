mod config;

use clap::{Args, Parser};
use config::{Config, ConfigError, LoggingConfig};
use ingestor::{Ingestor, IngestorError};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(version, about = "Syncs marketplace listings into a document store")]
enum CliCommand {
    /// Sync on the configured interval until interrupted
    Run(ConfigArgs),
    /// Sync the whole catalog once and exit
    Once(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long, short)]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ingestor(#[from] IngestorError),
    #[error("admin listener failed: {0}")]
    Io(#[from] std::io::Error),
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();
    let args = match &cli {
        CliCommand::Run(args) | CliCommand::Once(args) => args,
    };

    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    let _sentry = init_logging(&config.common.logging);

    if let Some(metrics) = &config.common.metrics {
        if let Err(e) =
            shared::metrics::init_statsd(&metrics.statsd_host, metrics.statsd_port, &metrics.prefix)
        {
            tracing::error!(error = %e, "Metrics disabled");
        }
    }
    shared::metrics_defs::describe_all(ingestor::metrics_defs::ALL_METRICS);

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Could not start runtime");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run_async(cli, config)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            tracing::error!(error = %e, "market-sync failed");
            ExitCode::FAILURE
        }
    }
}

/// Installs the fmt subscriber, plus Sentry when a DSN is configured. The returned guard
/// flushes pending Sentry events when dropped.
fn init_logging(config: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let guard = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

/// Returns whether the work finished completely.
async fn run_async(cli: CliCommand, config: Config) -> Result<bool, CliError> {
    let ingestor = Arc::new(Ingestor::new(&config.ingestor).await?);
    let cancel = CancellationToken::new();

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutting down");
                cancel.cancel();
            }
        }
    });

    if let Some(listener) = config.ingestor.admin_listener.clone() {
        let ready = ingestor.ready_flag();
        let service: AdminService<_, CliError> =
            AdminService::new(move || ready.load(Ordering::Relaxed));

        tokio::spawn(async move {
            if let Err(e) = run_http_service(&listener.host, listener.port, service).await {
                tracing::error!(error = %e, "Admin listener stopped");
            }
        });
    }

    match cli {
        CliCommand::Run(_) => {
            ingestor.run(cancel).await;
            Ok(true)
        }
        CliCommand::Once(_) => {
            let report = ingestor.run_once(&cancel).await?;
            Ok(report.is_complete())
        }
    }
}
