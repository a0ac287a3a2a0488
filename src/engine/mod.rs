//! Deploy engine: recovery at boot, a fixed pool of dispatch loops that
//! claim work from the queue under per-app locks, and the background
//! monitors.

pub mod compose;
pub mod deploy_config;
pub mod health_monitor;
pub mod stats_monitor;
mod worker;

pub use worker::{
    GitTokenProvider, NoGitTokens, RemoteDeploy, RemoteDeployOutcome, RemoteDeployer, Worker,
};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{App, Deployment};
use crate::locker::AppLocker;
use crate::notifier::Notifier;
use crate::queue::DeployQueue;
use crate::runtime::{ContainerDriver, SHARED_NETWORK};

use health_monitor::HealthMonitor;
use stats_monitor::StatsMonitor;

pub struct Engine {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    notifier: Arc<Notifier>,
}

impl Engine {
    /// Boot sequence: recover interrupted work, clean stale locks, ensure
    /// the shared network, then launch monitors and the worker pool.
    pub async fn start(
        config: &Config,
        queue: Arc<DeployQueue>,
        notifier: Arc<Notifier>,
        locker: Arc<AppLocker>,
        driver: Arc<dyn ContainerDriver>,
        worker: Arc<Worker>,
    ) -> Result<Engine> {
        let recovered = queue.recover_interrupted().await?;
        if recovered > 0 {
            warn!(count = recovered, "Marked interrupted deployments as failed");
        }
        let stale = locker.cleanup_stale()?;
        if stale > 0 {
            warn!(count = stale, "Removed stale app locks");
        }
        if let Err(e) = driver.ensure_network(SHARED_NETWORK).await {
            warn!(error = %e, "Could not ensure shared docker network; deploys may fail");
        }
        join_shared_network_if_containerized().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        let health = HealthMonitor::new(
            queue.db().clone(),
            driver.clone(),
            notifier.clone(),
            config.deploy.health_sweep_secs,
        );
        handles.push(tokio::spawn(health.run(shutdown_rx.clone())));

        let stats = StatsMonitor::new(
            queue.db().clone(),
            driver.clone(),
            notifier.clone(),
            config.deploy.stats_sweep_secs,
        );
        handles.push(tokio::spawn(stats.run(shutdown_rx.clone())));

        for worker_id in 0..config.deploy.workers {
            handles.push(tokio::spawn(dispatch_loop(
                worker_id,
                config.deploy.poll_secs,
                config.deploy.timeout_secs,
                queue.clone(),
                locker.clone(),
                worker.clone(),
                shutdown_rx.clone(),
            )));
        }

        info!(workers = config.deploy.workers, "Deploy engine started");
        Ok(Engine {
            shutdown_tx,
            handles,
            notifier,
        })
    }

    /// Stop accepting work, join every loop, then close the event bus.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        self.notifier.close();
        info!("Deploy engine stopped");
    }
}

/// When the control plane itself runs inside a container it must sit on the
/// shared bridge to reach app health endpoints. Best effort; already-joined
/// is not an error worth surfacing.
async fn join_shared_network_if_containerized() {
    if !std::path::Path::new("/.dockerenv").exists() {
        return;
    }
    let Ok(hostname) = std::env::var("HOSTNAME") else {
        return;
    };
    let argv: Vec<String> = vec![
        "docker".into(),
        "network".into(),
        "connect".into(),
        SHARED_NETWORK.into(),
        hostname,
    ];
    match crate::exec::run(std::path::Path::new("."), Duration::from_secs(30), &argv).await {
        Ok(_) => info!("Joined shared docker network"),
        Err(e) => {
            let already = e.to_string().contains("already exists");
            if !already {
                warn!(error = %e, "Could not join shared docker network");
            }
        }
    }
}

/// Claim the next eligible deployment: queue says no running sibling, the
/// lock file says no other process owns the app, and the guarded claim in
/// the database wins the row. Returns None whenever this round found
/// nothing runnable.
pub async fn next_deployment(
    queue: &DeployQueue,
    locker: &AppLocker,
) -> Result<Option<(Deployment, App)>> {
    let Some((deployment, app)) = queue.get_next_pending().await? else {
        return Ok(None);
    };

    if locker.is_locked(&app.id) {
        return Ok(None);
    }
    if !locker.acquire(&app.id)? {
        return Ok(None);
    }
    if !queue.mark_running(&deployment.id).await? {
        locker.release(&app.id);
        return Ok(None);
    }

    let claimed = queue
        .get(&deployment.id)
        .await?
        .expect("claimed deployment exists");
    Ok(Some((claimed, app)))
}

async fn dispatch_loop(
    worker_id: usize,
    poll_secs: u64,
    timeout_secs: u64,
    queue: Arc<DeployQueue>,
    locker: Arc<AppLocker>,
    worker: Arc<Worker>,
    mut shutdown: watch::Receiver<bool>,
) {
    let poll = Duration::from_secs(poll_secs);
    let deploy_timeout = Duration::from_secs(timeout_secs);

    loop {
        if *shutdown.borrow() {
            return;
        }

        match next_deployment(&queue, &locker).await {
            Ok(Some((deployment, app))) => {
                let app_id = app.id.clone();
                let deployment_id = deployment.id.clone();
                info!(worker_id, deployment_id = %deployment_id, app = %app.name, "Dispatching deployment");

                // The run is spawned so a panic inside the pipeline is
                // contained and converted into a failed deploy.
                let run_worker = worker.clone();
                let mut handle = tokio::spawn(async move {
                    run_worker.run(deployment, app).await;
                });

                tokio::select! {
                    joined = &mut handle => {
                        if let Err(join_err) = joined {
                            if join_err.is_panic() {
                                error!(deployment_id = %deployment_id, "Worker panicked");
                                let _ = queue.mark_failed(&deployment_id, "worker panic").await;
                            }
                        }
                    }
                    _ = tokio::time::sleep(deploy_timeout) => {
                        error!(deployment_id = %deployment_id, "Deploy exceeded timeout, aborting");
                        handle.abort();
                        let _ = handle.await;
                        let _ = queue
                            .mark_failed(&deployment_id, "deploy timed out")
                            .await;
                    }
                }

                // Lock release must happen on every exit path above.
                locker.release(&app_id);
            }
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    _ = shutdown.changed() => return,
                }
            }
            Err(e) => {
                error!(worker_id, error = %e, "Queue poll failed");
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    _ = shutdown.changed() => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::queue::test_support::seed_app;

    async fn setup() -> (tempfile::TempDir, Arc<DeployQueue>, Arc<AppLocker>) {
        let tmp = tempfile::tempdir().unwrap();
        let pool = db::init_in_memory().await.unwrap();
        let queue = Arc::new(DeployQueue::new(pool));
        let locker = Arc::new(AppLocker::new(tmp.path()).unwrap());
        (tmp, queue, locker)
    }

    #[tokio::test]
    async fn test_next_claims_and_locks() {
        let (_tmp, queue, locker) = setup().await;
        seed_app(queue.db(), "a1", "demo").await;
        queue.create("a1", "sha", "m").await.unwrap();

        let (deployment, app) = next_deployment(&queue, &locker).await.unwrap().unwrap();
        assert_eq!(app.id, "a1");
        assert_eq!(deployment.status, "running");
        assert!(deployment.started_at.is_some());
        assert!(locker.is_locked("a1"));

        // Nothing else eligible.
        assert!(next_deployment(&queue, &locker).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_respects_foreign_lock() {
        let (_tmp, queue, locker) = setup().await;
        seed_app(queue.db(), "a1", "demo").await;
        let d = queue.create("a1", "sha", "m").await.unwrap();

        // Someone already holds the app lock (this very process, so the pid
        // is alive from the locker's point of view).
        assert!(locker.acquire("a1").unwrap());

        assert!(next_deployment(&queue, &locker).await.unwrap().is_none());
        let d = queue.get(&d.id).await.unwrap().unwrap();
        assert_eq!(d.status, "pending");

        locker.release("a1");
        assert!(next_deployment(&queue, &locker).await.unwrap().is_some());
    }
}
