pub mod agent;
pub mod api;
pub mod config;
pub mod crypto;
pub mod db;
pub mod engine;
pub mod error;
pub mod exec;
pub mod git;
pub mod locker;
pub mod notifier;
pub mod pki;
pub mod proto;
pub mod provision;
pub mod queue;
pub mod runtime;
pub mod utils;

pub use db::DbPool;
pub use error::Error;

use std::sync::Arc;

use agent::client::AgentPool;
use config::Config;
use notifier::Notifier;
use pki::CaHolder;
use provision::Provisioner;
use queue::DeployQueue;

pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub queue: Arc<DeployQueue>,
    pub notifier: Arc<Notifier>,
    pub ca: Arc<CaHolder>,
    pub agents: Arc<AgentPool>,
    pub provisioner: Arc<Provisioner>,
}

impl AppState {
    pub fn new(
        config: Config,
        db: DbPool,
        queue: Arc<DeployQueue>,
        notifier: Arc<Notifier>,
        ca: Arc<CaHolder>,
    ) -> Self {
        let encryption_key = config
            .server
            .encryption_key
            .as_ref()
            .map(|secret| crypto::derive_key(secret));

        let agents = Arc::new(AgentPool::new(
            db.clone(),
            ca.clone(),
            config.grpc.clone(),
            config.server.public_host.clone(),
            queue.clone(),
            notifier.clone(),
        ));

        let provisioner = Arc::new(Provisioner::new(
            db.clone(),
            ca.clone(),
            config.server.public_host.clone(),
            config.server.api_port,
            config.grpc.port,
            config.server.agent_binary_path.to_string_lossy().to_string(),
            encryption_key,
        ));

        Self {
            config,
            db,
            queue,
            notifier,
            ca,
            agents,
            provisioner,
        }
    }
}
