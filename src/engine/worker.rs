//! The deploy pipeline: one `Worker::run` call drives a single deployment
//! from git sync through build, compose up and health check to a terminal
//! state. Step errors fail the deploy; the run itself never returns an
//! error, so the dispatcher can always release the app lock and move on.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::DeployConfig as DeploySettings;
use crate::db::{App, CustomDomain, Deployment, EnvVar};
use crate::engine::compose;
use crate::engine::deploy_config::DeployConfig;
use crate::error::Error;
use crate::exec::sanitize_path_fragment;
use crate::git::GitDriver;
use crate::notifier::{EventKind, Notifier};
use crate::queue::DeployQueue;
use crate::runtime::{image_tag, ContainerDriver, ContainerState};

/// Source of short-lived installation tokens for private repositories.
/// Public repositories resolve to `None`.
#[async_trait]
pub trait GitTokenProvider: Send + Sync {
    async fn token_for(&self, app: &App) -> Result<Option<String>>;
}

/// Provider used when no git integration is configured.
pub struct NoGitTokens;

#[async_trait]
impl GitTokenProvider for NoGitTokens {
    async fn token_for(&self, _app: &App) -> Result<Option<String>> {
        Ok(None)
    }
}

/// What the worker hands to the control channel for an app pinned to a
/// remote server.
#[derive(Debug, Clone)]
pub struct RemoteDeploy {
    pub deployment_id: String,
    pub app_id: String,
    pub app_name: String,
    pub repository_url: String,
    pub branch: String,
    pub commit_sha: String,
    pub workdir: String,
    pub env_vars: BTreeMap<String, String>,
    pub git_token: Option<String>,
    pub domains: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct RemoteDeployOutcome {
    pub success: bool,
    pub image_tag: String,
    pub error: String,
}

/// Executes deploys on remote hosts over the control channel. The live
/// implementation dials the server's agent; tests substitute a fake.
#[async_trait]
pub trait RemoteDeployer: Send + Sync {
    async fn execute_deploy(
        &self,
        server_id: &str,
        request: RemoteDeploy,
    ) -> Result<RemoteDeployOutcome>;
}

pub struct Worker {
    data_dir: PathBuf,
    registry: String,
    settings: DeploySettings,
    queue: Arc<DeployQueue>,
    notifier: Arc<Notifier>,
    driver: Arc<dyn ContainerDriver>,
    git: GitDriver,
    tokens: Arc<dyn GitTokenProvider>,
    remote: Arc<dyn RemoteDeployer>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data_dir: PathBuf,
        registry: String,
        settings: DeploySettings,
        queue: Arc<DeployQueue>,
        notifier: Arc<Notifier>,
        driver: Arc<dyn ContainerDriver>,
        tokens: Arc<dyn GitTokenProvider>,
        remote: Arc<dyn RemoteDeployer>,
    ) -> Self {
        Self {
            data_dir,
            registry,
            settings,
            queue,
            notifier,
            driver,
            git: GitDriver::new(),
            tokens,
            remote,
        }
    }

    /// Drive one deployment to a terminal state. The deployment is already
    /// marked running and the app lock is held by the caller.
    pub async fn run(&self, deployment: Deployment, app: App) {
        self.notifier
            .deploy_event(EventKind::Running, &app.id, &deployment.id, "deploy started");
        self.log(&deployment, &format!("Deploying {} at {}", app.name, short(&deployment.commit_sha)))
            .await;

        match self.execute(&deployment, &app).await {
            Ok(tag) => {
                if let Err(e) = self.queue.mark_success(&deployment.id, &tag).await {
                    error!(deployment_id = %deployment.id, error = %e, "Failed to record success");
                }
                if let Err(e) = self.queue.update_app_last_deployed_at(&app.id).await {
                    error!(app_id = %app.id, error = %e, "Failed to update last_deployed_at");
                }
                self.log(&deployment, &format!("Deployed {} as {}", app.name, tag))
                    .await;
                self.notifier
                    .deploy_event(EventKind::Success, &app.id, &deployment.id, &tag);
                info!(app = %app.name, deployment_id = %deployment.id, "Deployment succeeded");
            }
            Err(err) => {
                let message = format!("{:#}", err);
                self.log(&deployment, &format!("Deployment failed: {}", message))
                    .await;
                self.rollback(&deployment, &app).await;
                if let Err(e) = self.queue.mark_failed(&deployment.id, &message).await {
                    error!(deployment_id = %deployment.id, error = %e, "Failed to record failure");
                }
                self.notifier
                    .deploy_event(EventKind::Failed, &app.id, &deployment.id, &message);
                error!(app = %app.name, deployment_id = %deployment.id, error = %message, "Deployment failed");
            }
        }
    }

    async fn execute(&self, deployment: &Deployment, app: &App) -> Result<String> {
        if app.is_remote() {
            return self.execute_remote(deployment, app).await;
        }
        self.execute_local(deployment, app).await
    }

    async fn execute_local(&self, deployment: &Deployment, app: &App) -> Result<String> {
        let repo_dir = self.data_dir.join(&app.id);
        let app_dir = match app.effective_workdir() {
            Some(workdir) => repo_dir.join(sanitize_path_fragment(workdir)),
            None => repo_dir.clone(),
        };

        // Step: git sync
        let token = self
            .tokens
            .token_for(app)
            .await
            .context("git token lookup failed")?;
        if !repo_dir.join(".git").exists() {
            self.log(deployment, &format!("Cloning {}", app.repository_url))
                .await;
            self.git
                .clone(&app.repository_url, &app.branch, &repo_dir, token.as_deref())
                .await
                .map_err(|e| Error::GitSyncFailed(format!("{:#}", e)))?;
        }
        self.git
            .sync(
                &repo_dir,
                &deployment.commit_sha,
                Some(&app.repository_url),
                token.as_deref(),
            )
            .await
            .map_err(|e| Error::GitSyncFailed(format!("{:#}", e)))?;

        let sha = self.git.current_sha(&repo_dir).await?;
        self.log(deployment, &format!("Checked out {}", short(&sha)))
            .await;

        // Step: load config
        let config = DeployConfig::load(&app_dir).await?;

        // Step: build
        let tag = image_tag(&self.registry, &app.name, &sha);
        self.log(deployment, &format!("Building image {}", tag)).await;
        let sink = self.line_forwarder(deployment, "[build]");
        self.driver
            .build(&app_dir, &config.dockerfile, &config.context, &tag, sink)
            .await
            .map_err(|e| Error::BuildFailed(format!("{:#}", e)))?;

        // Step: snapshot the image currently serving traffic
        if let ContainerState::Present { image, .. } = self.driver.inspect(&app.name).await? {
            if !image.is_empty() {
                self.queue
                    .set_previous_image_tag(&deployment.id, &image)
                    .await?;
            }
        }

        // Step: materialize compose file and bring the service up
        let env_vars = self.env_vars(&app.id).await?;
        let custom_domains = self.custom_domains(&app.id).await?;
        let env = compose::merge_env(&config.env, &env_vars);
        let custom_pairs: Vec<(String, String)> =
            custom_domains.iter().map(compose::domain_pair).collect();
        let domains = compose::collect_domains(&config.domains, &custom_pairs);
        let rendered = compose::render(&app.name, &tag, &config, env, &domains)?;
        tokio::fs::write(app_dir.join("docker-compose.yml"), rendered)
            .await
            .context("Failed to write docker-compose.yml")?;

        self.log(deployment, "Starting service").await;
        let sink = self.line_forwarder(deployment, "[deploy]");
        self.driver.compose_up(&app_dir, &app.id, sink).await?;

        // Step: health gate
        self.health_check(deployment, &config).await?;

        Ok(tag)
    }

    async fn execute_remote(&self, deployment: &Deployment, app: &App) -> Result<String> {
        let server_id = app.server_id.as_deref().expect("checked by caller");
        self.log(deployment, &format!("Delegating deploy to server {}", server_id))
            .await;

        let token = self
            .tokens
            .token_for(app)
            .await
            .context("git token lookup failed")?;
        let env_vars = self.env_vars(&app.id).await?;
        let custom_domains = self.custom_domains(&app.id).await?;

        let request = RemoteDeploy {
            deployment_id: deployment.id.clone(),
            app_id: app.id.clone(),
            app_name: app.name.clone(),
            repository_url: app.repository_url.clone(),
            branch: app.branch.clone(),
            commit_sha: deployment.commit_sha.clone(),
            workdir: app.workdir.clone(),
            env_vars: env_vars
                .iter()
                .map(|v| (v.key.clone(), v.value.clone()))
                .collect(),
            git_token: token,
            domains: custom_domains.iter().map(compose::domain_pair).collect(),
        };

        let outcome = self.remote.execute_deploy(server_id, request).await?;
        if !outcome.success {
            anyhow::bail!("remote deploy failed: {}", outcome.error);
        }
        Ok(outcome.image_tag)
    }

    /// Probe the app's health endpoint with exponential backoff after a
    /// short startup grace.
    async fn health_check(&self, deployment: &Deployment, config: &DeployConfig) -> Result<()> {
        let port = config.host_port.unwrap_or(config.port);
        let url = format!("http://localhost:{}{}", port, config.healthcheck_path);
        self.log(deployment, &format!("Waiting for {}", url)).await;

        tokio::time::sleep(Duration::from_secs(self.settings.health_grace_secs)).await;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.settings.health_timeout_secs))
            .build()
            .context("Failed to build health check client")?;

        let mut delay = Duration::from_secs(1);
        for attempt in 1..=self.settings.health_retries {
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    self.log(deployment, "Health check passed").await;
                    return Ok(());
                }
                Ok(resp) => {
                    self.log(
                        deployment,
                        &format!("Health check attempt {}: status {}", attempt, resp.status()),
                    )
                    .await;
                }
                Err(e) => {
                    self.log(
                        deployment,
                        &format!("Health check attempt {}: {}", attempt, e),
                    )
                    .await;
                }
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(30));
        }

        Err(Error::HealthCheckFailed(format!(
            "no successful response from {} after {} attempts",
            url, self.settings.health_retries
        ))
        .into())
    }

    /// Failure path: stop the broken release. The previous image tag stays
    /// recorded on the deployment so an explicit rollback can redeploy it;
    /// this run does not start the old version itself.
    async fn rollback(&self, deployment: &Deployment, app: &App) {
        if app.is_remote() {
            return;
        }
        let previous = match self.queue.get(&deployment.id).await {
            Ok(Some(d)) => d.previous_image_tag,
            _ => None,
        };
        if previous.is_none() {
            return;
        }

        let repo_dir = self.data_dir.join(&app.id);
        let app_dir = match app.effective_workdir() {
            Some(workdir) => repo_dir.join(sanitize_path_fragment(workdir)),
            None => repo_dir,
        };
        self.log(deployment, "Stopping failed release").await;
        if let Err(e) = self.driver.compose_down(&app_dir, &app.id).await {
            warn!(app = %app.name, error = %e, "Compose down after failure did not complete");
        }
    }

    async fn env_vars(&self, app_id: &str) -> Result<Vec<EnvVar>> {
        let vars = sqlx::query_as::<_, EnvVar>("SELECT * FROM env_vars WHERE app_id = ?")
            .bind(app_id)
            .fetch_all(self.queue.db())
            .await?;
        Ok(vars)
    }

    async fn custom_domains(&self, app_id: &str) -> Result<Vec<CustomDomain>> {
        let domains =
            sqlx::query_as::<_, CustomDomain>("SELECT * FROM custom_domains WHERE app_id = ?")
                .bind(app_id)
                .fetch_all(self.queue.db())
                .await?;
        Ok(domains)
    }

    async fn log(&self, deployment: &Deployment, line: &str) {
        if let Err(e) = self
            .queue
            .append_logs(&deployment.id, &format!("{}\n", line))
            .await
        {
            error!(deployment_id = %deployment.id, error = %e, "Failed to append deploy log");
        }
        self.notifier.log_line(&deployment.app_id, &deployment.id, line);
    }

    /// Channel whose lines are prefixed and forwarded to both the DB log
    /// and the event bus.
    fn line_forwarder(&self, deployment: &Deployment, prefix: &str) -> mpsc::Sender<String> {
        let (tx, mut rx) = mpsc::channel::<String>(256);
        let queue = self.queue.clone();
        let notifier = self.notifier.clone();
        let deployment_id = deployment.id.clone();
        let app_id = deployment.app_id.clone();
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                let line = format!("{} {}", prefix, line);
                let _ = queue.append_logs(&deployment_id, &format!("{}\n", line)).await;
                notifier.log_line(&app_id, &deployment_id, &line);
            }
        });
        tx
    }
}

fn short(sha: &str) -> &str {
    if sha.len() > 12 {
        &sha[..12]
    } else {
        sha
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::queue::test_support::seed_app;
    use crate::runtime::{
        ContainerStats, ContainerSummary, ImageSummary, LogFollower, NetworkSummary, VolumeSummary,
    };
    use parking_lot::Mutex;
    use std::path::Path;

    /// Driver that fakes docker: records calls, "builds" instantly, and
    /// reports a configurable previous container image.
    struct FakeDriver {
        previous_image: Option<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeDriver {
        fn new(previous_image: Option<&str>) -> Self {
            Self {
                previous_image: previous_image.map(|s| s.to_string()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn record(&self, call: &str) {
            self.calls.lock().push(call.to_string());
        }
    }

    #[async_trait]
    impl ContainerDriver for FakeDriver {
        async fn build(
            &self,
            _work_dir: &Path,
            _dockerfile: &str,
            _context: &str,
            tag: &str,
            sink: mpsc::Sender<String>,
        ) -> Result<()> {
            self.record(&format!("build {}", tag));
            let _ = sink.try_send("Step 1/1 : FROM scratch".to_string());
            Ok(())
        }

        async fn compose_up(
            &self,
            _dir: &Path,
            project: &str,
            _sink: mpsc::Sender<String>,
        ) -> Result<()> {
            self.record(&format!("compose_up {}", project));
            Ok(())
        }

        async fn compose_down(&self, _dir: &Path, project: &str) -> Result<()> {
            self.record(&format!("compose_down {}", project));
            Ok(())
        }

        async fn pull_image(&self, _image: &str) -> Result<()> {
            Ok(())
        }
        async fn push_image(&self, _image: &str) -> Result<()> {
            Ok(())
        }
        async fn tag_image(&self, _source: &str, _target: &str) -> Result<()> {
            Ok(())
        }
        async fn ensure_network(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn inspect(&self, _name: &str) -> Result<ContainerState> {
            Ok(match &self.previous_image {
                Some(image) => ContainerState::Present {
                    state: "running".into(),
                    health: "healthy".into(),
                    started_at: String::new(),
                    image: image.clone(),
                },
                None => ContainerState::NotFound,
            })
        }

        async fn stats(&self, _name: &str) -> Result<ContainerStats> {
            Ok(ContainerStats::default())
        }
        async fn logs(&self, _name: &str, _tail: u32) -> Result<String> {
            Ok(String::new())
        }
        async fn follow_logs(
            &self,
            _name: &str,
            _sink: mpsc::Sender<String>,
        ) -> Result<LogFollower> {
            anyhow::bail!("not supported in fake")
        }
        async fn list_containers(&self, _all: bool) -> Result<Vec<ContainerSummary>> {
            Ok(vec![])
        }
        async fn start_container(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn stop_container(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn restart_container(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn remove_container(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn list_images(&self) -> Result<Vec<ImageSummary>> {
            Ok(vec![])
        }
        async fn remove_image(&self, _image: &str) -> Result<()> {
            Ok(())
        }
        async fn prune_images(&self) -> Result<String> {
            Ok(String::new())
        }
        async fn list_networks(&self) -> Result<Vec<NetworkSummary>> {
            Ok(vec![])
        }
        async fn create_network(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn remove_network(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn list_volumes(&self) -> Result<Vec<VolumeSummary>> {
            Ok(vec![])
        }
        async fn create_volume(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn remove_volume(&self, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    struct FakeRemote {
        outcome: RemoteDeployOutcome,
    }

    #[async_trait]
    impl RemoteDeployer for FakeRemote {
        async fn execute_deploy(
            &self,
            _server_id: &str,
            _request: RemoteDeploy,
        ) -> Result<RemoteDeployOutcome> {
            Ok(self.outcome.clone())
        }
    }

    struct NoRemote;

    #[async_trait]
    impl RemoteDeployer for NoRemote {
        async fn execute_deploy(
            &self,
            _server_id: &str,
            _request: RemoteDeploy,
        ) -> Result<RemoteDeployOutcome> {
            anyhow::bail!("no remote configured")
        }
    }

    async fn run_git(dir: &Path, parts: &[&str]) {
        let args: Vec<String> = parts.iter().map(|s| s.to_string()).collect();
        crate::exec::run(dir, Duration::from_secs(60), &args)
            .await
            .unwrap();
    }

    /// Build a local git "origin" containing a Dockerfile and the given
    /// paasdeploy.json, returning (dir, head sha).
    async fn seed_repo(dir: &Path, deploy_json: &str) -> String {
        run_git(dir, &["git", "init", "--quiet", "--initial-branch=main"]).await;
        run_git(dir, &["git", "config", "user.email", "t@t"]).await;
        run_git(dir, &["git", "config", "user.name", "t"]).await;
        tokio::fs::write(dir.join("Dockerfile"), "FROM scratch\n")
            .await
            .unwrap();
        tokio::fs::write(dir.join("paasdeploy.json"), deploy_json)
            .await
            .unwrap();
        run_git(dir, &["git", "add", "."]).await;
        run_git(dir, &["git", "commit", "--quiet", "-m", "init"]).await;
        let out = crate::exec::run(
            dir,
            Duration::from_secs(60),
            &["git".to_string(), "rev-parse".to_string(), "HEAD".to_string()],
        )
        .await
        .unwrap();
        out.stdout.trim().to_string()
    }

    fn settings(retries: u32) -> DeploySettings {
        DeploySettings {
            health_grace_secs: 0,
            health_retries: retries,
            health_timeout_secs: 1,
            ..DeploySettings::default()
        }
    }

    fn worker(
        data_dir: PathBuf,
        settings_: DeploySettings,
        queue: Arc<DeployQueue>,
        notifier: Arc<Notifier>,
        driver: Arc<FakeDriver>,
        remote: Arc<dyn RemoteDeployer>,
    ) -> Worker {
        Worker::new(
            data_dir,
            String::new(),
            settings_,
            queue,
            notifier,
            driver,
            Arc::new(NoGitTokens),
            remote,
        )
    }

    #[tokio::test]
    async fn test_local_deploy_happy_path() {
        let data = tempfile::tempdir().unwrap();
        let origin = tempfile::tempdir().unwrap();

        // Serve the health endpoint ourselves on an ephemeral port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let app = axum::Router::new()
                .route("/health", axum::routing::get(|| async { "ok" }));
            axum::serve(listener, app).await.unwrap();
        });

        let deploy_json = format!(r#"{{"port": 8080, "hostPort": {port}}}"#);
        let sha = seed_repo(origin.path(), &deploy_json).await;

        let db = db::init_in_memory().await.unwrap();
        let app = seed_app(&db, "a1", "demo").await;
        sqlx::query("UPDATE apps SET repository_url = ? WHERE id = 'a1'")
            .bind(origin.path().to_string_lossy().to_string())
            .execute(&db)
            .await
            .unwrap();
        let app = App {
            repository_url: origin.path().to_string_lossy().to_string(),
            ..app
        };

        let queue = Arc::new(DeployQueue::new(db));
        let deployment = queue.create("a1", &sha, "init").await.unwrap();
        queue.mark_running(&deployment.id).await.unwrap();
        let deployment = queue.get(&deployment.id).await.unwrap().unwrap();

        let notifier = Arc::new(Notifier::new());
        let mut events = notifier.subscribe();
        let driver = Arc::new(FakeDriver::new(None));
        let w = worker(
            data.path().to_path_buf(),
            settings(3),
            queue.clone(),
            notifier.clone(),
            driver.clone(),
            Arc::new(NoRemote),
        );

        w.run(deployment.clone(), app).await;

        let done = queue.get(&deployment.id).await.unwrap().unwrap();
        assert_eq!(done.status, "success");
        let expected_tag = format!("paasdeploy/demo:{}", &sha[..12]);
        assert_eq!(done.current_image_tag.as_deref(), Some(expected_tag.as_str()));
        assert!(done.logs.contains("Checked out"));
        assert!(done.logs.contains("Health check passed"));

        // The rendered compose file landed next to the checkout.
        let compose_path = data.path().join("a1/docker-compose.yml");
        let rendered = tokio::fs::read_to_string(compose_path).await.unwrap();
        assert!(rendered.contains("container_name: demo"));

        // Ordered events: RUNNING first, then logs, then the terminal kind.
        let first = events.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::Running);
        let terminal = loop {
            let event = events.recv().await.unwrap();
            if matches!(event.kind, EventKind::Success | EventKind::Failed) {
                break event;
            }
        };
        assert_eq!(terminal.kind, EventKind::Success);

        let calls = driver.calls();
        assert!(calls.iter().any(|c| c.starts_with("build ")));
        assert!(calls.contains(&"compose_up a1".to_string()));

        // App freshness is updated on success.
        let (last_deployed,): (Option<String>,) =
            sqlx::query_as("SELECT last_deployed_at FROM apps WHERE id = 'a1'")
                .fetch_one(queue.db())
                .await
                .unwrap();
        assert!(last_deployed.is_some());
    }

    #[tokio::test]
    async fn test_health_failure_records_rollback_state() {
        let data = tempfile::tempdir().unwrap();
        let origin = tempfile::tempdir().unwrap();

        // Point the health check at a port nothing listens on.
        let deploy_json = r#"{"port": 8080, "hostPort": 1}"#;
        let sha = seed_repo(origin.path(), deploy_json).await;

        let db = db::init_in_memory().await.unwrap();
        let app = seed_app(&db, "a1", "demo").await;
        let app = App {
            repository_url: origin.path().to_string_lossy().to_string(),
            ..app
        };

        let queue = Arc::new(DeployQueue::new(db));
        let deployment = queue.create("a1", &sha, "breaks health").await.unwrap();
        queue.mark_running(&deployment.id).await.unwrap();
        let deployment = queue.get(&deployment.id).await.unwrap().unwrap();

        let driver = Arc::new(FakeDriver::new(Some("paasdeploy/demo:oldoldoldold")));
        let w = worker(
            data.path().to_path_buf(),
            settings(2),
            queue.clone(),
            Arc::new(Notifier::new()),
            driver.clone(),
            Arc::new(NoRemote),
        );

        w.run(deployment.clone(), app).await;

        let done = queue.get(&deployment.id).await.unwrap().unwrap();
        assert_eq!(done.status, "failed");
        assert!(done.error_message.unwrap().contains("health check"));
        assert_eq!(
            done.previous_image_tag.as_deref(),
            Some("paasdeploy/demo:oldoldoldold")
        );
        assert!(driver.calls().contains(&"compose_down a1".to_string()));
    }

    #[tokio::test]
    async fn test_remote_deploy_delegates() {
        let data = tempfile::tempdir().unwrap();
        let db = db::init_in_memory().await.unwrap();
        let app = seed_app(&db, "a1", "demo").await;
        let app = App {
            server_id: Some("srv-1".into()),
            ..app
        };

        let queue = Arc::new(DeployQueue::new(db));
        let deployment = queue.create("a1", "abc123def4567890", "m").await.unwrap();
        queue.mark_running(&deployment.id).await.unwrap();
        let deployment = queue.get(&deployment.id).await.unwrap().unwrap();

        let driver = Arc::new(FakeDriver::new(None));
        let remote = Arc::new(FakeRemote {
            outcome: RemoteDeployOutcome {
                success: true,
                image_tag: "paasdeploy/demo:abc123def456".into(),
                error: String::new(),
            },
        });
        let w = worker(
            data.path().to_path_buf(),
            settings(1),
            queue.clone(),
            Arc::new(Notifier::new()),
            driver.clone(),
            remote,
        );

        w.run(deployment.clone(), app).await;

        let done = queue.get(&deployment.id).await.unwrap().unwrap();
        assert_eq!(done.status, "success");
        assert_eq!(
            done.current_image_tag.as_deref(),
            Some("paasdeploy/demo:abc123def456")
        );
        // Nothing ran against the local docker.
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_remote_failure_marks_failed() {
        let data = tempfile::tempdir().unwrap();
        let db = db::init_in_memory().await.unwrap();
        let app = seed_app(&db, "a1", "demo").await;
        let app = App {
            server_id: Some("srv-1".into()),
            ..app
        };

        let queue = Arc::new(DeployQueue::new(db));
        let deployment = queue.create("a1", "abc", "m").await.unwrap();
        queue.mark_running(&deployment.id).await.unwrap();
        let deployment = queue.get(&deployment.id).await.unwrap().unwrap();

        let remote = Arc::new(FakeRemote {
            outcome: RemoteDeployOutcome {
                success: false,
                image_tag: String::new(),
                error: "agent build failed".into(),
            },
        });
        let w = worker(
            data.path().to_path_buf(),
            settings(1),
            queue.clone(),
            Arc::new(Notifier::new()),
            Arc::new(FakeDriver::new(None)),
            remote,
        );

        w.run(deployment.clone(), app).await;

        let done = queue.get(&deployment.id).await.unwrap().unwrap();
        assert_eq!(done.status, "failed");
        assert!(done.error_message.unwrap().contains("agent build failed"));
    }
}
