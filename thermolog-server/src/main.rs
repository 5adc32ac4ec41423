//! Thermolog Server - ingestion daemon and HTTP API

mod api;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use thermolog_core::config::Config;
use thermolog_core::ingest::{sample_queue, Monitor, Pipeline};
use thermolog_core::Writer;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Record sensor readings and serve them over HTTP
#[derive(Parser)]
#[command(name = "thermolog", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "thermolog.yml")]
    config: PathBuf,

    /// Logging verbosity level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Override the configured listen address
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(false).init();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    let listen = cli.listen.unwrap_or(config.listen);

    info!("Starting Thermolog server...");
    info!("Database: {:?}", config.database);
    info!("HTTP server: http://{}", listen);

    // The writer is owned by the pipeline's consumer thread from here on
    let writer = Writer::open(config.store_config())
        .with_context(|| format!("opening {}", config.database.display()))?;
    let (sender, receiver) = sample_queue(config.queue_capacity);
    let monitor = Monitor::from_config(&config);
    let toggles = monitor.toggles();
    let pipeline = Pipeline::start(
        writer,
        receiver,
        sender.clone(),
        monitor,
        config.pipeline_config(),
    )?;

    let app = api::create_router(api::AppState::new(config, sender, toggles));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received SIGINT, shutting down");
            }
            shutdown.cancel();
        }
    });

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!("Thermolog server listening on {}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    // Drains the queue and flushes deferred rollups
    let writer = tokio::task::spawn_blocking(move || pipeline.shutdown()).await??;
    drop(writer);

    info!("Thermolog server stopped");
    Ok(())
}
