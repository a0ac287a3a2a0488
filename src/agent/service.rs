//! gRPC service the agent exposes to the control plane.
//!
//! Business failures (a container that does not exist, a build that broke)
//! travel in-band as `{success, message}` so the server can show the reason;
//! gRPC status codes are reserved for malformed requests and transport
//! faults. Long-lived streams end when the client's context is cancelled:
//! every send into a closed stream unwinds the producing loop.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info, warn};

use crate::engine::RemoteDeploy;
use crate::proto::agent::{
    agent_server::Agent, exec_input, exec_output, ContainerLogLine, ContainerLogsRequest,
    ContainerRequest, ContainerStatsRequest, ContainerStatsSample, ContainerSummary,
    DeployLogLine, DeployLogsRequest, DeployRequest, DeployResponse, ExecInput, ExecOutput,
    ImageRequest, ImageSummary, ListContainersRequest, ListContainersResponse, ListImagesRequest,
    ListImagesResponse, ListNetworksRequest, ListNetworksResponse, ListVolumesRequest,
    ListVolumesResponse, NetworkRequest, NetworkSummary, OpResult, PruneRequest,
    SystemInfoRequest, SystemInfoResponse, SystemMetricsRequest, SystemMetricsResponse,
    UpdateChunk, UpdateDomainsRequest, UpdateResult, VolumeRequest, VolumeSummary,
};
use crate::runtime::ContainerDriver;

use super::deploy::{self, DeployEnv};
use super::logbus::LogBus;
use super::pty::PtySession;
use super::update;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

const STATS_STREAM_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);
const LOG_STREAM_CAPACITY: usize = 512;

pub struct AgentService {
    env: DeployEnv,
    driver: Arc<dyn ContainerDriver>,
    bus: Arc<LogBus>,
}

impl AgentService {
    pub fn new(env: DeployEnv, driver: Arc<dyn ContainerDriver>, bus: Arc<LogBus>) -> Self {
        Self { env, driver, bus }
    }
}

fn ok_result(message: impl Into<String>) -> Response<OpResult> {
    Response::new(OpResult {
        success: true,
        message: message.into(),
    })
}

fn failed_result(err: impl std::fmt::Display) -> Response<OpResult> {
    Response::new(OpResult {
        success: false,
        message: err.to_string(),
    })
}

/// Split an optional RFC3339(-nano) timestamp prefix off a docker log line.
pub fn split_log_line(line: &str) -> (String, String) {
    if let Some((head, rest)) = line.split_once(' ') {
        if chrono::DateTime::parse_from_rfc3339(head).is_ok() {
            return (head.to_string(), rest.to_string());
        }
    }
    (String::new(), line.to_string())
}

#[tonic::async_trait]
impl Agent for AgentService {
    async fn execute_deploy(
        &self,
        request: Request<DeployRequest>,
    ) -> Result<Response<DeployResponse>, Status> {
        let req = request.into_inner();
        if req.deployment_id.is_empty() || req.app_id.is_empty() {
            return Err(Status::invalid_argument("deployment_id and app_id required"));
        }

        info!(deployment_id = %req.deployment_id, app = %req.app_name, "Executing remote deploy");

        let remote = RemoteDeploy {
            deployment_id: req.deployment_id.clone(),
            app_id: req.app_id,
            app_name: req.app_name,
            repository_url: req.repository_url,
            branch: req.branch,
            commit_sha: req.commit_sha,
            workdir: req.workdir,
            env_vars: req.env_vars.into_iter().collect(),
            git_token: if req.git_token.is_empty() {
                None
            } else {
                Some(req.git_token)
            },
            domains: req
                .domains
                .into_iter()
                .map(|d| (d.domain, d.path_prefix))
                .collect(),
        };

        let result = deploy::run(&self.env, &self.driver, &self.bus, &remote).await;
        self.bus.close(&req.deployment_id);

        let response = match result {
            Ok(image_tag) => DeployResponse {
                success: true,
                image_tag,
                error: String::new(),
            },
            Err(e) => {
                error!(deployment_id = %req.deployment_id, error = %e, "Remote deploy failed");
                DeployResponse {
                    success: false,
                    image_tag: String::new(),
                    error: format!("{:#}", e),
                }
            }
        };
        Ok(Response::new(response))
    }

    type StreamDeployLogsStream = ReceiverStream<Result<DeployLogLine, Status>>;

    async fn stream_deploy_logs(
        &self,
        request: Request<DeployLogsRequest>,
    ) -> Result<Response<Self::StreamDeployLogsStream>, Status> {
        let deployment_id = request.into_inner().deployment_id;
        let mut lines = self.bus.subscribe(&deployment_id);

        let (tx, rx) = mpsc::channel(LOG_STREAM_CAPACITY);
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                if tx.send(Ok(DeployLogLine { line })).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_system_info(
        &self,
        _request: Request<SystemInfoRequest>,
    ) -> Result<Response<SystemInfoResponse>, Status> {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        sys.refresh_cpu_all();

        Ok(Response::new(SystemInfoResponse {
            hostname: sysinfo::System::host_name().unwrap_or_default(),
            os: sysinfo::System::long_os_version().unwrap_or_default(),
            kernel_version: sysinfo::System::kernel_version().unwrap_or_default(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_count: sys.cpus().len() as u32,
            total_memory_bytes: sys.total_memory(),
            agent_version: AGENT_VERSION.to_string(),
        }))
    }

    async fn get_system_metrics(
        &self,
        _request: Request<SystemMetricsRequest>,
    ) -> Result<Response<SystemMetricsResponse>, Status> {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        sys.refresh_cpu_all();

        let disks = sysinfo::Disks::new_with_refreshed_list();
        let (mut total_disk, mut available_disk) = (0u64, 0u64);
        for disk in disks.list() {
            total_disk += disk.total_space();
            available_disk += disk.available_space();
        }
        let load = sysinfo::System::load_average();

        Ok(Response::new(SystemMetricsResponse {
            cpu_usage_percent: sys.global_cpu_usage() as f64,
            used_memory_bytes: sys.used_memory(),
            total_memory_bytes: sys.total_memory(),
            used_disk_bytes: total_disk.saturating_sub(available_disk),
            total_disk_bytes: total_disk,
            load_avg_one: load.one,
            load_avg_five: load.five,
            load_avg_fifteen: load.fifteen,
        }))
    }

    async fn list_containers(
        &self,
        request: Request<ListContainersRequest>,
    ) -> Result<Response<ListContainersResponse>, Status> {
        let containers = self
            .driver
            .list_containers(request.into_inner().all)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        Ok(Response::new(ListContainersResponse {
            containers: containers
                .into_iter()
                .map(|c| ContainerSummary {
                    id: c.id,
                    name: c.name,
                    image: c.image,
                    state: c.state,
                    status: c.status,
                })
                .collect(),
        }))
    }

    async fn start_container(
        &self,
        request: Request<ContainerRequest>,
    ) -> Result<Response<OpResult>, Status> {
        let id = request.into_inner().container_id;
        Ok(match self.driver.start_container(&id).await {
            Ok(()) => ok_result(format!("container {} started", id)),
            Err(e) => failed_result(e),
        })
    }

    async fn stop_container(
        &self,
        request: Request<ContainerRequest>,
    ) -> Result<Response<OpResult>, Status> {
        let id = request.into_inner().container_id;
        Ok(match self.driver.stop_container(&id).await {
            Ok(()) => ok_result(format!("container {} stopped", id)),
            Err(e) => failed_result(e),
        })
    }

    async fn restart_container(
        &self,
        request: Request<ContainerRequest>,
    ) -> Result<Response<OpResult>, Status> {
        let id = request.into_inner().container_id;
        Ok(match self.driver.restart_container(&id).await {
            Ok(()) => ok_result(format!("container {} restarted", id)),
            Err(e) => failed_result(e),
        })
    }

    async fn remove_container(
        &self,
        request: Request<ContainerRequest>,
    ) -> Result<Response<OpResult>, Status> {
        let id = request.into_inner().container_id;
        Ok(match self.driver.remove_container(&id).await {
            Ok(()) => ok_result(format!("container {} removed", id)),
            Err(e) => failed_result(e),
        })
    }

    async fn list_images(
        &self,
        _request: Request<ListImagesRequest>,
    ) -> Result<Response<ListImagesResponse>, Status> {
        let images = self
            .driver
            .list_images()
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        Ok(Response::new(ListImagesResponse {
            images: images
                .into_iter()
                .map(|i| ImageSummary {
                    id: i.id,
                    repository: i.repository,
                    tag: i.tag,
                    size: i.size,
                })
                .collect(),
        }))
    }

    async fn remove_image(
        &self,
        request: Request<ImageRequest>,
    ) -> Result<Response<OpResult>, Status> {
        let image = request.into_inner().image;
        Ok(match self.driver.remove_image(&image).await {
            Ok(()) => ok_result(format!("image {} removed", image)),
            Err(e) => failed_result(e),
        })
    }

    async fn prune_images(
        &self,
        _request: Request<PruneRequest>,
    ) -> Result<Response<OpResult>, Status> {
        Ok(match self.driver.prune_images().await {
            Ok(report) => ok_result(report),
            Err(e) => failed_result(e),
        })
    }

    async fn list_networks(
        &self,
        _request: Request<ListNetworksRequest>,
    ) -> Result<Response<ListNetworksResponse>, Status> {
        let networks = self
            .driver
            .list_networks()
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        Ok(Response::new(ListNetworksResponse {
            networks: networks
                .into_iter()
                .map(|n| NetworkSummary {
                    id: n.id,
                    name: n.name,
                    driver: n.driver,
                })
                .collect(),
        }))
    }

    async fn create_network(
        &self,
        request: Request<NetworkRequest>,
    ) -> Result<Response<OpResult>, Status> {
        let name = request.into_inner().name;
        Ok(match self.driver.create_network(&name).await {
            Ok(()) => ok_result(format!("network {} created", name)),
            Err(e) => failed_result(e),
        })
    }

    async fn remove_network(
        &self,
        request: Request<NetworkRequest>,
    ) -> Result<Response<OpResult>, Status> {
        let name = request.into_inner().name;
        Ok(match self.driver.remove_network(&name).await {
            Ok(()) => ok_result(format!("network {} removed", name)),
            Err(e) => failed_result(e),
        })
    }

    async fn list_volumes(
        &self,
        _request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        let volumes = self
            .driver
            .list_volumes()
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        Ok(Response::new(ListVolumesResponse {
            volumes: volumes
                .into_iter()
                .map(|v| VolumeSummary {
                    name: v.name,
                    driver: v.driver,
                })
                .collect(),
        }))
    }

    async fn create_volume(
        &self,
        request: Request<VolumeRequest>,
    ) -> Result<Response<OpResult>, Status> {
        let name = request.into_inner().name;
        Ok(match self.driver.create_volume(&name).await {
            Ok(()) => ok_result(format!("volume {} created", name)),
            Err(e) => failed_result(e),
        })
    }

    async fn remove_volume(
        &self,
        request: Request<VolumeRequest>,
    ) -> Result<Response<OpResult>, Status> {
        let name = request.into_inner().name;
        Ok(match self.driver.remove_volume(&name).await {
            Ok(()) => ok_result(format!("volume {} removed", name)),
            Err(e) => failed_result(e),
        })
    }

    async fn update_domains(
        &self,
        request: Request<UpdateDomainsRequest>,
    ) -> Result<Response<OpResult>, Status> {
        let req = request.into_inner();
        let app_dir = self.env.data_dir.join(&req.app_id);
        let compose_path = app_dir.join("docker-compose.yml");

        let existing = match tokio::fs::read_to_string(&compose_path).await {
            Ok(contents) => contents,
            Err(_) => return Ok(failed_result("app has not been deployed on this host")),
        };

        let domains: Vec<(String, String)> = req
            .domains
            .into_iter()
            .map(|d| (d.domain, d.path_prefix))
            .collect();

        let patched = match crate::engine::compose::patch_labels(&existing, &req.app_name, &domains)
        {
            Ok(patched) => patched,
            Err(e) => return Ok(failed_result(e)),
        };

        if let Err(e) = tokio::fs::write(&compose_path, patched).await {
            return Ok(failed_result(e));
        }

        let (sink, _drain) = mpsc::channel(64);
        Ok(match self.driver.compose_up(&app_dir, &req.app_id, sink).await {
            Ok(()) => ok_result("domains updated"),
            Err(e) => failed_result(e),
        })
    }

    type GetContainerLogsStream = ReceiverStream<Result<ContainerLogLine, Status>>;

    async fn get_container_logs(
        &self,
        request: Request<ContainerLogsRequest>,
    ) -> Result<Response<Self::GetContainerLogsStream>, Status> {
        let req = request.into_inner();
        let (tx, rx) = mpsc::channel(LOG_STREAM_CAPACITY);

        if req.follow {
            let (raw_tx, mut raw_rx) = mpsc::channel::<String>(LOG_STREAM_CAPACITY);
            let follower = self
                .driver
                .follow_logs(&req.container_id, raw_tx)
                .await
                .map_err(|e| Status::internal(e.to_string()))?;

            tokio::spawn(async move {
                while let Some(line) = raw_rx.recv().await {
                    let (timestamp, message) = split_log_line(&line);
                    if tx
                        .send(Ok(ContainerLogLine { timestamp, message }))
                        .await
                        .is_err()
                    {
                        // Client cancelled; kill the docker logs child.
                        break;
                    }
                }
                follower.stop().await;
                debug!("Log follow stream closed");
            });
        } else {
            let text = self
                .driver
                .logs(&req.container_id, req.tail)
                .await
                .map_err(|e| Status::internal(e.to_string()))?;

            tokio::spawn(async move {
                for line in text.lines() {
                    let (timestamp, message) = split_log_line(line);
                    if tx
                        .send(Ok(ContainerLogLine { timestamp, message }))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type GetContainerStatsStream = ReceiverStream<Result<ContainerStatsSample, Status>>;

    async fn get_container_stats(
        &self,
        request: Request<ContainerStatsRequest>,
    ) -> Result<Response<Self::GetContainerStatsStream>, Status> {
        let req = request.into_inner();
        let driver = self.driver.clone();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                let sample = match driver.stats(&req.container_id).await {
                    Ok(stats) => ContainerStatsSample {
                        cpu_percent: stats.cpu_percent,
                        memory_usage_bytes: stats.memory_usage,
                        memory_limit_bytes: stats.memory_limit,
                        network_rx_bytes: stats.network_rx,
                        network_tx_bytes: stats.network_tx,
                        pids: stats.pids,
                    },
                    Err(e) => {
                        let _ = tx.send(Err(Status::internal(e.to_string()))).await;
                        return;
                    }
                };
                if tx.send(Ok(sample)).await.is_err() {
                    return;
                }
                if !req.stream {
                    return;
                }
                tokio::time::sleep(STATS_STREAM_INTERVAL).await;
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type ExecContainerStream = ReceiverStream<Result<ExecOutput, Status>>;

    async fn exec_container(
        &self,
        request: Request<Streaming<ExecInput>>,
    ) -> Result<Response<Self::ExecContainerStream>, Status> {
        let mut in_stream = request.into_inner();

        let start = match in_stream.message().await? {
            Some(ExecInput {
                input: Some(exec_input::Input::Start(start)),
            }) => start,
            _ => {
                return Err(Status::invalid_argument(
                    "first exec message must be a start request",
                ))
            }
        };

        let shell = if start.shell.is_empty() {
            "sh".to_string()
        } else {
            start.shell
        };
        let cols = if start.cols == 0 { 80 } else { start.cols as u16 };
        let rows = if start.rows == 0 { 24 } else { start.rows as u16 };

        let mut session = PtySession::spawn(&start.container_id, &shell, cols, rows)
            .map_err(|e| Status::internal(format!("failed to open exec session: {e:#}")))?;

        let mut output = session
            .take_output()
            .ok_or_else(|| Status::internal("exec output already taken"))?;
        let exit = session
            .take_exit()
            .ok_or_else(|| Status::internal("exec exit already taken"))?;
        let stdin = session.input();

        let (tx, rx) = mpsc::channel::<Result<ExecOutput, Status>>(64);

        // One task owns the outbound sender, serializing Data frames and the
        // final ExitCode.
        let out_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(chunk) = output.recv().await {
                let frame = ExecOutput {
                    output: Some(exec_output::Output::Data(chunk)),
                };
                if out_tx.send(Ok(frame)).await.is_err() {
                    return;
                }
            }
            if let Ok(code) = exit.await {
                let _ = out_tx
                    .send(Ok(ExecOutput {
                        output: Some(exec_output::Output::ExitCode(code)),
                    }))
                    .await;
            }
        });

        // Inbound pump: stdin bytes and resizes until the client goes away,
        // then make sure the child unwinds.
        tokio::spawn(async move {
            loop {
                match in_stream.message().await {
                    Ok(Some(ExecInput {
                        input: Some(exec_input::Input::Data(data)),
                    })) => {
                        if stdin.send(data).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(ExecInput {
                        input: Some(exec_input::Input::Resize(resize)),
                    })) => {
                        if let Err(e) = session.resize(resize.cols as u16, resize.rows as u16) {
                            warn!(error = %e, "PTY resize failed");
                        }
                    }
                    Ok(Some(ExecInput {
                        input: Some(exec_input::Input::Start(_)),
                    })) => {}
                    Ok(Some(ExecInput { input: None })) => {}
                    Ok(None) | Err(_) => break,
                }
            }
            session.kill();
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn push_update(
        &self,
        request: Request<Streaming<UpdateChunk>>,
    ) -> Result<Response<UpdateResult>, Status> {
        let mut stream = request.into_inner();

        let staged = update::staged_path().map_err(|e| Status::internal(e.to_string()))?;
        let mut file = tokio::fs::File::create(&staged)
            .await
            .map_err(|e| Status::internal(format!("cannot stage update: {e}")))?;

        let mut version = String::new();
        let mut declared: Option<u64> = None;
        let mut received: u64 = 0;
        let mut first = true;

        let write_result: Result<(), String> = loop {
            match stream.message().await {
                Ok(Some(chunk)) => {
                    if first {
                        version = chunk.version.clone();
                        if chunk.total_size > 0 {
                            declared = Some(chunk.total_size);
                        }
                        first = false;
                    }
                    received += chunk.data.len() as u64;
                    if received > update::MAX_UPDATE_BYTES {
                        break Err(format!(
                            "update payload exceeds the {} byte limit",
                            update::MAX_UPDATE_BYTES
                        ));
                    }
                    if let Err(e) = file.write_all(&chunk.data).await {
                        break Err(format!("failed writing staged update: {e}"));
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(format!("update stream aborted: {e}")),
            }
        };

        let validation = match write_result {
            Ok(()) => match file.flush().await {
                Ok(()) => update::validate_size(received, declared),
                Err(e) => Err(format!("failed flushing staged update: {e}")),
            },
            Err(message) => Err(message),
        };
        drop(file);

        if let Err(message) = validation {
            let _ = tokio::fs::remove_file(&staged).await;
            warn!(error = %message, "Rejected pushed update");
            return Ok(Response::new(UpdateResult {
                success: false,
                message,
            }));
        }

        if let Err(e) = update::apply(&staged).await {
            let _ = tokio::fs::remove_file(&staged).await;
            error!(error = %e, "Failed to apply pushed update");
            return Ok(Response::new(UpdateResult {
                success: false,
                message: format!("{:#}", e),
            }));
        }

        info!(version = %version, bytes = received, "Agent updated, restarting shortly");
        update::schedule_reexec();

        Ok(Response::new(UpdateResult {
            success: true,
            message: format!("updated to {} ({} bytes), restarting", version, received),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_log_line_with_timestamp() {
        let (ts, msg) =
            split_log_line("2024-03-01T12:00:00.123456789Z listening on port 8080");
        assert_eq!(ts, "2024-03-01T12:00:00.123456789Z");
        assert_eq!(msg, "listening on port 8080");
    }

    #[test]
    fn test_split_log_line_without_timestamp() {
        let (ts, msg) = split_log_line("plain output line");
        assert_eq!(ts, "");
        assert_eq!(msg, "plain output line");
    }

    #[test]
    fn test_split_log_line_first_word_not_a_date() {
        let (ts, msg) = split_log_line("error: something broke");
        assert_eq!(ts, "");
        assert_eq!(msg, "error: something broke");
    }
}
