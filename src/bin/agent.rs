use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paasdeploy::agent::{serve, AgentOptions};

#[derive(Parser, Debug)]
#[command(name = "paasdeploy-agent")]
#[command(author, version, about = "paasdeploy remote host agent", long_about = None)]
struct Cli {
    /// Control channel listen port
    #[arg(long, default_value_t = 50051)]
    port: u16,

    /// Leaf certificate presented to the control plane
    #[arg(long, default_value = "/etc/paasdeploy/agent.pem")]
    cert: PathBuf,

    /// Private key for the leaf certificate
    #[arg(long, default_value = "/etc/paasdeploy/agent.key")]
    key: PathBuf,

    /// Root CA the control plane's client certificate must chain to
    #[arg(long, default_value = "/etc/paasdeploy/ca.pem")]
    ca: PathBuf,

    /// Checkout and compose-file directory
    #[arg(long, env = "DEPLOY_DATA_DIR", default_value = "/var/lib/paasdeploy")]
    data_dir: PathBuf,

    /// Registry prefix for built images
    #[arg(long, env = "DOCKER_REGISTRY", default_value = "")]
    registry: String,

    /// Override log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let options = AgentOptions {
        port: cli.port,
        cert_path: cli.cert,
        key_path: cli.key,
        ca_path: cli.ca,
        data_dir: cli.data_dir,
        registry: cli.registry,
    };

    if let Err(e) = serve(options).await {
        tracing::error!("Agent failed: {:#}", e);
        std::process::exit(1);
    }
}
