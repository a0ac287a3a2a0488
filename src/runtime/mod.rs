mod docker;

pub use docker::DockerCli;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

use crate::exec::LineSink;

/// Name of the user-defined bridge network every managed container joins,
/// shared with the edge proxy for east-west traffic.
pub const SHARED_NETWORK: &str = "paasdeploy";

/// Deterministic image tag: `[<registry>/]paasdeploy/<app>:<shortSha>`.
/// Commit SHAs shorter than 12 characters are used as-is.
pub fn image_tag(registry: &str, app_name: &str, commit_sha: &str) -> String {
    let short = if commit_sha.len() > 12 {
        &commit_sha[..12]
    } else {
        commit_sha
    };
    if registry.is_empty() {
        format!("paasdeploy/{}:{}", app_name, short)
    } else {
        format!("{}/paasdeploy/{}:{}", registry.trim_end_matches('/'), app_name, short)
    }
}

/// Inspect result. A missing container is a state, not an error, so callers
/// (monitors, snapshotting) don't have to pattern-match error strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    NotFound,
    Present {
        /// docker state: running, exited, restarting, ...
        state: String,
        /// health: healthy, unhealthy, starting, or "none" when the image
        /// defines no healthcheck.
        health: String,
        started_at: String,
        image: String,
    },
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Present { state, .. } if state == "running")
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub pids: u32,
}

#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct ImageSummary {
    pub id: String,
    pub repository: String,
    pub tag: String,
    pub size: String,
}

#[derive(Debug, Clone)]
pub struct NetworkSummary {
    pub id: String,
    pub name: String,
    pub driver: String,
}

#[derive(Debug, Clone)]
pub struct VolumeSummary {
    pub name: String,
    pub driver: String,
}

/// Handle for a `docker logs --follow` child. Dropping it leaves the child
/// running; call `stop` to kill it when the consumer goes away.
pub struct LogFollower {
    child: tokio::process::Child,
}

impl LogFollower {
    pub fn new(child: tokio::process::Child) -> Self {
        Self { child }
    }

    pub async fn stop(mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Build an image from a checkout, streaming build output lines.
    async fn build(
        &self,
        work_dir: &Path,
        dockerfile: &str,
        context: &str,
        tag: &str,
        sink: LineSink,
    ) -> Result<()>;

    /// `docker compose up -d` for the rendered compose file in `dir`.
    async fn compose_up(&self, dir: &Path, project: &str, sink: LineSink) -> Result<()>;

    /// `docker compose down` for a previously-started project.
    async fn compose_down(&self, dir: &Path, project: &str) -> Result<()>;

    async fn pull_image(&self, image: &str) -> Result<()>;
    async fn push_image(&self, image: &str) -> Result<()>;
    async fn tag_image(&self, source: &str, target: &str) -> Result<()>;

    /// Create the named bridge network if it does not exist yet.
    async fn ensure_network(&self, name: &str) -> Result<()>;

    async fn inspect(&self, name: &str) -> Result<ContainerState>;
    async fn stats(&self, name: &str) -> Result<ContainerStats>;

    /// Static tail of a container's log.
    async fn logs(&self, name: &str, tail: u32) -> Result<String>;

    /// Spawn `docker logs --follow`, pushing lines into `sink` until the
    /// returned follower is stopped or the container exits.
    async fn follow_logs(&self, name: &str, sink: LineSink) -> Result<LogFollower>;

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>>;
    async fn start_container(&self, name: &str) -> Result<()>;
    async fn stop_container(&self, name: &str) -> Result<()>;
    async fn restart_container(&self, name: &str) -> Result<()>;
    async fn remove_container(&self, name: &str) -> Result<()>;

    async fn list_images(&self) -> Result<Vec<ImageSummary>>;
    async fn remove_image(&self, image: &str) -> Result<()>;
    async fn prune_images(&self) -> Result<String>;

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>>;
    async fn create_network(&self, name: &str) -> Result<()>;
    async fn remove_network(&self, name: &str) -> Result<()>;

    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>>;
    async fn create_volume(&self, name: &str) -> Result<()>;
    async fn remove_volume(&self, name: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_tag_truncates_to_twelve() {
        assert_eq!(
            image_tag("", "demo", "abc123def4567890"),
            "paasdeploy/demo:abc123def456"
        );
    }

    #[test]
    fn test_image_tag_short_sha_used_as_is() {
        assert_eq!(image_tag("", "demo", "ab12"), "paasdeploy/demo:ab12");
    }

    #[test]
    fn test_image_tag_with_registry() {
        assert_eq!(
            image_tag("registry.example.com/", "demo", "abc123def4567890"),
            "registry.example.com/paasdeploy/demo:abc123def456"
        );
    }

    #[test]
    fn test_image_tag_is_pure() {
        let a = image_tag("r", "app", "deadbeefdeadbeef");
        let b = image_tag("r", "app", "deadbeefdeadbeef");
        assert_eq!(a, b);
    }
}
