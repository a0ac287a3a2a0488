//! Docker CLI driver.
//!
//! Every operation is expressed as structured argv handed to the command
//! executor, with `--format` output parsed into typed results. Compose
//! projects are driven through `docker compose` so the rendered
//! `docker-compose.yml` stays the source of truth for a running app.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::exec::{self, ExecError, LineSink};

use super::{
    ContainerDriver, ContainerState, ContainerStats, ContainerSummary, ImageSummary, LogFollower,
    NetworkSummary, VolumeSummary,
};

const QUICK_TIMEOUT: Duration = Duration::from_secs(30);
const PULL_TIMEOUT: Duration = Duration::from_secs(600);
const BUILD_TIMEOUT: Duration = Duration::from_secs(1800);
const COMPOSE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct DockerCli;

impl DockerCli {
    pub fn new() -> Self {
        Self
    }

    /// Probe the daemon once at startup.
    pub async fn is_available(&self) -> bool {
        exec::run(Path::new("."), QUICK_TIMEOUT, &argv(&["docker", "version", "--format", "{{.Server.Version}}"]))
            .await
            .is_ok()
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn is_not_found(err: &ExecError) -> bool {
    match err {
        ExecError::NonZero { stderr, .. } => {
            let lower = stderr.to_lowercase();
            lower.contains("no such container")
                || lower.contains("no such object")
                || lower.contains("no such image")
        }
        _ => false,
    }
}

/// Parse "12.34%" into 12.34; tolerates missing '%' and garbage.
fn parse_percent(raw: &str) -> f64 {
    raw.trim().trim_end_matches('%').parse().unwrap_or(0.0)
}

/// Parse docker's human sizes ("756KiB", "1.2GB", "96B") into bytes.
fn parse_size(raw: &str) -> u64 {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let (num, unit) = raw.split_at(split);
    let value: f64 = num.parse().unwrap_or(0.0);
    let multiplier: f64 = match unit.trim() {
        "B" | "" => 1.0,
        "kB" | "KB" => 1e3,
        "KiB" => 1024.0,
        "MB" => 1e6,
        "MiB" => 1024.0 * 1024.0,
        "GB" => 1e9,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TB" => 1e12,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    (value * multiplier) as u64
}

/// Parse "10MiB / 1GiB" style pairs; short or malformed input yields zeros.
fn parse_size_pair(raw: &str) -> (u64, u64) {
    let mut parts = raw.split('/');
    let first = parts.next().map(parse_size).unwrap_or(0);
    let second = parts.next().map(parse_size).unwrap_or(0);
    (first, second)
}

/// One line of `docker stats --format '{{.CPUPerc}}|{{.MemUsage}}|{{.NetIO}}|{{.PIDs}}'`.
/// Short lines are tolerated; absent fields come back zeroed.
fn parse_stats_line(line: &str) -> ContainerStats {
    let mut fields = line.trim().split('|');
    let cpu_percent = fields.next().map(parse_percent).unwrap_or(0.0);
    let (memory_usage, memory_limit) = fields.next().map(parse_size_pair).unwrap_or((0, 0));
    let (network_rx, network_tx) = fields.next().map(parse_size_pair).unwrap_or((0, 0));
    let pids = fields
        .next()
        .and_then(|f| f.trim().parse().ok())
        .unwrap_or(0);
    ContainerStats {
        cpu_percent,
        memory_usage,
        memory_limit,
        network_rx,
        network_tx,
        pids,
    }
}

/// One line of the inspect format below. The health block is optional.
fn parse_inspect_line(line: &str) -> ContainerState {
    let mut fields = line.trim().split('|');
    let state = fields.next().unwrap_or("unknown").to_string();
    let health = fields.next().unwrap_or("none").to_string();
    let started_at = fields.next().unwrap_or("").to_string();
    let image = fields.next().unwrap_or("").to_string();
    ContainerState::Present {
        state,
        health: if health.is_empty() {
            "none".to_string()
        } else {
            health
        },
        started_at,
        image,
    }
}

fn split_fields(line: &str, n: usize) -> Vec<String> {
    let mut fields: Vec<String> = line.trim().splitn(n, '|').map(|s| s.to_string()).collect();
    fields.resize(n, String::new());
    fields
}

#[async_trait]
impl ContainerDriver for DockerCli {
    async fn build(
        &self,
        work_dir: &Path,
        dockerfile: &str,
        context: &str,
        tag: &str,
        sink: LineSink,
    ) -> Result<()> {
        let args = argv(&[
            "docker", "build", "--file", dockerfile, "--tag", tag, "--progress", "plain", context,
        ]);
        exec::run_streaming(work_dir, BUILD_TIMEOUT, &args, sink)
            .await
            .context("docker build failed")?;
        Ok(())
    }

    async fn compose_up(&self, dir: &Path, project: &str, sink: LineSink) -> Result<()> {
        let args = argv(&[
            "docker",
            "compose",
            "--project-name",
            project,
            "up",
            "--detach",
            "--remove-orphans",
        ]);
        exec::run_streaming(dir, COMPOSE_TIMEOUT, &args, sink)
            .await
            .context("docker compose up failed")?;
        Ok(())
    }

    async fn compose_down(&self, dir: &Path, project: &str) -> Result<()> {
        let args = argv(&["docker", "compose", "--project-name", project, "down"]);
        exec::run(dir, COMPOSE_TIMEOUT, &args)
            .await
            .context("docker compose down failed")?;
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        exec::run(Path::new("."), PULL_TIMEOUT, &argv(&["docker", "pull", image]))
            .await
            .context("docker pull failed")?;
        Ok(())
    }

    async fn push_image(&self, image: &str) -> Result<()> {
        exec::run(Path::new("."), PULL_TIMEOUT, &argv(&["docker", "push", image]))
            .await
            .context("docker push failed")?;
        Ok(())
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<()> {
        exec::run(
            Path::new("."),
            QUICK_TIMEOUT,
            &argv(&["docker", "tag", source, target]),
        )
        .await
        .context("docker tag failed")?;
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        let existing = exec::run(
            Path::new("."),
            QUICK_TIMEOUT,
            &argv(&[
                "docker", "network", "ls", "--filter", &format!("name=^{}$", name), "--format",
                "{{.Name}}",
            ]),
        )
        .await
        .context("docker network ls failed")?;

        if existing.stdout.lines().any(|l| l.trim() == name) {
            return Ok(());
        }

        debug!(network = %name, "Creating shared docker network");
        exec::run(
            Path::new("."),
            QUICK_TIMEOUT,
            &argv(&["docker", "network", "create", name]),
        )
        .await
        .context("docker network create failed")?;
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<ContainerState> {
        let format = "{{.State.Status}}|{{if .State.Health}}{{.State.Health.Status}}{{else}}none{{end}}|{{.State.StartedAt}}|{{.Config.Image}}";
        match exec::run(
            Path::new("."),
            QUICK_TIMEOUT,
            &argv(&["docker", "inspect", "--format", format, name]),
        )
        .await
        {
            Ok(out) => Ok(parse_inspect_line(&out.stdout)),
            Err(err) if is_not_found(&err) => Ok(ContainerState::NotFound),
            Err(err) => Err(err).context("docker inspect failed"),
        }
    }

    async fn stats(&self, name: &str) -> Result<ContainerStats> {
        let format = "{{.CPUPerc}}|{{.MemUsage}}|{{.NetIO}}|{{.PIDs}}";
        match exec::run(
            Path::new("."),
            QUICK_TIMEOUT,
            &argv(&["docker", "stats", "--no-stream", "--format", format, name]),
        )
        .await
        {
            Ok(out) => Ok(parse_stats_line(&out.stdout)),
            Err(err) if is_not_found(&err) => Ok(ContainerStats::default()),
            Err(err) => Err(err).context("docker stats failed"),
        }
    }

    async fn logs(&self, name: &str, tail: u32) -> Result<String> {
        let tail = if tail == 0 { 100 } else { tail };
        let tail_arg = tail.to_string();
        let out = exec::run(
            Path::new("."),
            QUICK_TIMEOUT,
            &argv(&["docker", "logs", "--timestamps", "--tail", &tail_arg, name]),
        )
        .await
        .context("docker logs failed")?;
        // docker writes container output to both streams
        let mut combined = out.stdout;
        combined.push_str(&out.stderr);
        Ok(combined)
    }

    async fn follow_logs(&self, name: &str, sink: LineSink) -> Result<LogFollower> {
        let mut child = Command::new("docker")
            .args(["logs", "--timestamps", "--follow", "--tail", "100", name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn docker logs --follow")?;

        let stdout = child.stdout.take().expect("stdout requested above");
        let stderr = child.stderr.take().expect("stderr requested above");

        tokio::spawn(pump_lines(stdout, sink.clone()));
        tokio::spawn(pump_lines(stderr, sink));

        Ok(LogFollower::new(child))
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let mut args = argv(&["docker", "ps", "--no-trunc", "--format", "{{.ID}}|{{.Names}}|{{.Image}}|{{.State}}|{{.Status}}"]);
        if all {
            args.push("--all".to_string());
        }
        let out = exec::run(Path::new("."), QUICK_TIMEOUT, &args)
            .await
            .context("docker ps failed")?;

        Ok(out
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                let f = split_fields(line, 5);
                ContainerSummary {
                    id: f[0].clone(),
                    name: f[1].clone(),
                    image: f[2].clone(),
                    state: f[3].clone(),
                    status: f[4].clone(),
                }
            })
            .collect())
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        exec::run(Path::new("."), QUICK_TIMEOUT, &argv(&["docker", "start", name]))
            .await
            .context("docker start failed")?;
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        exec::run(Path::new("."), Duration::from_secs(60), &argv(&["docker", "stop", name]))
            .await
            .context("docker stop failed")?;
        Ok(())
    }

    async fn restart_container(&self, name: &str) -> Result<()> {
        exec::run(
            Path::new("."),
            Duration::from_secs(60),
            &argv(&["docker", "restart", name]),
        )
        .await
        .context("docker restart failed")?;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        exec::run(
            Path::new("."),
            Duration::from_secs(60),
            &argv(&["docker", "rm", "--force", name]),
        )
        .await
        .context("docker rm failed")?;
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        let out = exec::run(
            Path::new("."),
            QUICK_TIMEOUT,
            &argv(&["docker", "images", "--format", "{{.ID}}|{{.Repository}}|{{.Tag}}|{{.Size}}"]),
        )
        .await
        .context("docker images failed")?;

        Ok(out
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                let f = split_fields(line, 4);
                ImageSummary {
                    id: f[0].clone(),
                    repository: f[1].clone(),
                    tag: f[2].clone(),
                    size: f[3].clone(),
                }
            })
            .collect())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        exec::run(
            Path::new("."),
            Duration::from_secs(60),
            &argv(&["docker", "rmi", image]),
        )
        .await
        .context("docker rmi failed")?;
        Ok(())
    }

    async fn prune_images(&self) -> Result<String> {
        let out = exec::run(
            Path::new("."),
            Duration::from_secs(300),
            &argv(&["docker", "image", "prune", "--force"]),
        )
        .await
        .context("docker image prune failed")?;
        Ok(out.stdout.trim().to_string())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>> {
        let out = exec::run(
            Path::new("."),
            QUICK_TIMEOUT,
            &argv(&["docker", "network", "ls", "--format", "{{.ID}}|{{.Name}}|{{.Driver}}"]),
        )
        .await
        .context("docker network ls failed")?;

        Ok(out
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                let f = split_fields(line, 3);
                NetworkSummary {
                    id: f[0].clone(),
                    name: f[1].clone(),
                    driver: f[2].clone(),
                }
            })
            .collect())
    }

    async fn create_network(&self, name: &str) -> Result<()> {
        exec::run(
            Path::new("."),
            QUICK_TIMEOUT,
            &argv(&["docker", "network", "create", name]),
        )
        .await
        .context("docker network create failed")?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        exec::run(
            Path::new("."),
            QUICK_TIMEOUT,
            &argv(&["docker", "network", "rm", name]),
        )
        .await
        .context("docker network rm failed")?;
        Ok(())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>> {
        let out = exec::run(
            Path::new("."),
            QUICK_TIMEOUT,
            &argv(&["docker", "volume", "ls", "--format", "{{.Name}}|{{.Driver}}"]),
        )
        .await
        .context("docker volume ls failed")?;

        Ok(out
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                let f = split_fields(line, 2);
                VolumeSummary {
                    name: f[0].clone(),
                    driver: f[1].clone(),
                }
            })
            .collect())
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        exec::run(
            Path::new("."),
            QUICK_TIMEOUT,
            &argv(&["docker", "volume", "create", name]),
        )
        .await
        .context("docker volume create failed")?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        exec::run(
            Path::new("."),
            QUICK_TIMEOUT,
            &argv(&["docker", "volume", "rm", name]),
        )
        .await
        .context("docker volume rm failed")?;
        Ok(())
    }
}

async fn pump_lines<R>(reader: R, sink: LineSink)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if sink.try_send(line).is_err() {
            debug!("Log follower sink full, dropping line");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_percent() {
        assert_eq!(parse_percent("12.34%"), 12.34);
        assert_eq!(parse_percent(" 0.00% "), 0.0);
        assert_eq!(parse_percent("garbage"), 0.0);
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("96B"), 96);
        assert_eq!(parse_size("1kB"), 1000);
        assert_eq!(parse_size("1KiB"), 1024);
        assert_eq!(parse_size("1.5MiB"), 1572864);
        assert_eq!(parse_size("2GB"), 2_000_000_000);
    }

    #[test]
    fn test_parse_stats_line_full() {
        let stats = parse_stats_line("0.50%|10MiB / 1GiB|1.2kB / 3MB|12");
        assert_eq!(stats.cpu_percent, 0.5);
        assert_eq!(stats.memory_usage, 10 * 1024 * 1024);
        assert_eq!(stats.memory_limit, 1024 * 1024 * 1024);
        assert_eq!(stats.network_rx, 1200);
        assert_eq!(stats.network_tx, 3_000_000);
        assert_eq!(stats.pids, 12);
    }

    #[test]
    fn test_parse_stats_line_short() {
        // A line missing trailing fields must not panic.
        let stats = parse_stats_line("3.2%|5MiB / 100MiB");
        assert_eq!(stats.cpu_percent, 3.2);
        assert_eq!(stats.memory_usage, 5 * 1024 * 1024);
        assert_eq!(stats.network_rx, 0);
        assert_eq!(stats.pids, 0);
    }

    #[test]
    fn test_parse_inspect_line_with_health() {
        let state = parse_inspect_line("running|healthy|2024-01-01T00:00:00Z|paasdeploy/demo:abc");
        match state {
            ContainerState::Present {
                state,
                health,
                image,
                ..
            } => {
                assert_eq!(state, "running");
                assert_eq!(health, "healthy");
                assert_eq!(image, "paasdeploy/demo:abc");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_inspect_line_without_health() {
        let state = parse_inspect_line("exited|none|2024-01-01T00:00:00Z|img");
        assert!(!state.is_running());
    }

    #[test]
    fn test_not_found_detection() {
        let err = ExecError::NonZero {
            program: "docker".into(),
            code: 1,
            stderr: "Error: No such container: demo".into(),
        };
        assert!(is_not_found(&err));

        let err = ExecError::NonZero {
            program: "docker".into(),
            code: 1,
            stderr: "permission denied".into(),
        };
        assert!(!is_not_found(&err));
    }
}
