use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paasdeploy::config::Config;
use paasdeploy::engine::{Engine, NoGitTokens, Worker};
use paasdeploy::locker::AppLocker;
use paasdeploy::notifier::Notifier;
use paasdeploy::pki::CaHolder;
use paasdeploy::queue::DeployQueue;
use paasdeploy::runtime::DockerCli;
use paasdeploy::AppState;

#[derive(Parser, Debug)]
#[command(name = "paasdeploy")]
#[command(author, version, about = "Self-hosted PaaS control plane", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "paasdeploy.toml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;

    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting paasdeploy v{}", env!("CARGO_PKG_VERSION"));

    paasdeploy::utils::ensure_dir(&config.server.data_dir)?;

    let db = paasdeploy::db::init(&config.server.data_dir).await?;
    let ca = Arc::new(CaHolder::load_or_create(&db).await?);

    let driver = Arc::new(DockerCli::new());
    if !driver.is_available().await {
        tracing::warn!("Docker daemon is not reachable; local deploys will fail until it is");
    }

    let queue = Arc::new(DeployQueue::new(db.clone()));
    let notifier = Arc::new(Notifier::new());
    let locker = Arc::new(AppLocker::new(&config.server.data_dir)?);

    let state = Arc::new(AppState::new(
        config.clone(),
        db,
        queue.clone(),
        notifier.clone(),
        ca,
    ));

    let worker = Arc::new(Worker::new(
        config.server.data_dir.clone(),
        config.server.registry.clone(),
        config.deploy.clone(),
        queue.clone(),
        notifier.clone(),
        driver.clone(),
        Arc::new(NoGitTokens),
        state.agents.clone(),
    ));

    let engine = Engine::start(
        &config,
        queue,
        notifier,
        locker,
        driver.clone(),
        worker,
    )
    .await?;

    let app = paasdeploy::api::create_router(state);

    let api_addr = format!("{}:{}", config.server.host, config.server.api_port);
    let listener = tokio::net::TcpListener::bind(&api_addr).await?;
    tracing::info!("API server listening on http://{}", api_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
