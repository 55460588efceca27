//! `bollard`-backed [`ContainerRuntime`] implementation.
//!
//! Both Docker and Podman are reached through this same struct: Podman's
//! libpod exposes a Docker-API-compatible unix socket
//! (typically `/run/podman/podman.sock`), so `bollard::Docker` talks to
//! either daemon unmodified — only [`BollardRuntime::backend`] and
//! [`checkpoint`](super::checkpoint) differ. This directly generalises the
//! teacher's `src/runs.rs`/`src/runner.rs`, which thread one
//! `bollard::Docker` handle through `create_container`/`start_container`/
//! `wait_container`/`logs`/`remove_container`/`build_image`.

use std::time::Duration;

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
        RemoveContainerOptions, StatsOptions, StopContainerOptions, WaitContainerOptions,
    },
    image::CreateImageOptions,
    network::CreateNetworkOptions,
    Docker,
};
use futures::{StreamExt, TryStreamExt};
use tokio::{io::AsyncWriteExt, process::Command};

use crate::error::RuntimeError;

use super::{
    checkpoint::{CheckpointSupport, RestoreOptions},
    normalize_image_ref, ContainerSpec, ContainerRuntime, ExitStatus, ImagePullPolicy,
    RuntimeBackend, StatsSnapshot,
};

/// A container runtime backed by a single `bollard::Docker` client.
pub struct BollardRuntime {
    docker: Docker,
    backend: RuntimeBackend,
}

impl BollardRuntime {
    /// Connects to the local Docker daemon using the standard
    /// `DOCKER_HOST`/default-socket resolution.
    pub fn connect_docker() -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(RuntimeError::Backend)
            .map_err(anyhow::Error::from)?;
        Ok(Self {
            docker,
            backend: RuntimeBackend::Docker,
        })
    }

    /// Connects to a Podman socket (libpod's Docker-API-compatible
    /// endpoint).
    pub fn connect_podman(socket_path: &str) -> anyhow::Result<Self> {
        let docker = Docker::connect_with_unix(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(RuntimeError::Backend)
            .map_err(anyhow::Error::from)?;
        Ok(Self {
            docker,
            backend: RuntimeBackend::Podman,
        })
    }

    fn to_host_config(resources: &crate::model::ResourceLimits) -> bollard::service::HostConfig {
        let mut host_config = bollard::service::HostConfig::default();
        host_config.cpuset_cpus = resources.cpuset.clone();
        host_config.memory = resources.memory_bytes.map(|b| b as i64);
        if resources.swap_disabled {
            host_config.memory_swap = resources.memory_bytes.map(|b| b as i64);
        }
        if !resources.block_io.is_empty() {
            host_config.blkio_device_read_bps = Some(
                resources
                    .block_io
                    .iter()
                    .filter_map(|t| {
                        t.read_bps.map(|rate| bollard::service::ThrottleDevice {
                            path: Some(t.device.clone()),
                            rate: Some(rate),
                        })
                    })
                    .collect(),
            );
            host_config.blkio_device_write_bps = Some(
                resources
                    .block_io
                    .iter()
                    .filter_map(|t| {
                        t.write_bps.map(|rate| bollard::service::ThrottleDevice {
                            path: Some(t.device.clone()),
                            rate: Some(rate),
                        })
                    })
                    .collect(),
            );
        }
        host_config
    }
}

#[async_trait]
impl ContainerRuntime for BollardRuntime {
    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        if self.docker.inspect_network::<String>(name, None).await.is_ok() {
            log::debug!("network {name} already exists");
            return Ok(());
        }
        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await?;
        log::info!("created bridge network {name}");
        Ok(())
    }

    async fn pull_image(&self, image: &str, policy: ImagePullPolicy) -> Result<(), RuntimeError> {
        let image = normalize_image_ref(image);
        if policy == ImagePullPolicy::Never {
            log::debug!("[{image}] pull policy is never, skipping pull");
            return Ok(());
        }
        if policy == ImagePullPolicy::IfMissing && self.docker.inspect_image(&image).await.is_ok() {
            log::debug!("[{image}] already present locally, skipping pull");
            return Ok(());
        }

        log::info!("[{image}] pulling image...");
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        log::trace!("[{image}] {status}");
                    }
                }
                Err(err) => return Err(RuntimeError::Backend(err)),
            }
        }
        log::info!("[{image}] pulled image");
        Ok(())
    }

    async fn get_image_digest(&self, image: &str) -> Result<Option<String>, RuntimeError> {
        let image = normalize_image_ref(image);
        let inspect = self.docker.inspect_image(&image).await?;
        Ok(inspect
            .repo_digests
            .and_then(|digests| digests.into_iter().next())
            .and_then(|d| d.split('@').nth(1).map(str::to_string)))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let mut host_config = Self::to_host_config(&spec.resources);
        host_config.binds = Some(
            spec.binds
                .iter()
                .map(|(host, container, ro)| {
                    if *ro {
                        format!("{host}:{container}:ro")
                    } else {
                        format!("{host}:{container}")
                    }
                })
                .collect(),
        );
        if let Some((volume, path)) = &spec.volume {
            let mut binds = host_config.binds.take().unwrap_or_default();
            binds.push(format!("{volume}:{path}"));
            host_config.binds = Some(binds);
        }
        if let Some(network) = &spec.network {
            host_config.network_mode = Some(network.clone());
        }

        let config = Config {
            image: Some(normalize_image_ref(&spec.image)),
            entrypoint: spec.entrypoint.clone(),
            cmd: spec.cmd.clone(),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;
        log::debug!("[{}] created container ({})", spec.name, response.id);
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker.start_container::<String>(id, None).await?;
        log::debug!("[{id}] started container");
        Ok(())
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: timeout.as_secs() as i64,
                }),
            )
            .await?;
        log::debug!("[{id}] stopped container");
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                log::debug!("[{id}] removed container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                log::debug!("[{id}] already gone, treating removal as a no-op");
                Ok(())
            }
            Err(err) => Err(RuntimeError::Backend(err)),
        }
    }

    async fn get_container_ip(&self, id: &str, network: &str) -> Result<String, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        inspect
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|networks| networks.get(network).cloned())
            .and_then(|net| net.ip_address)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| RuntimeError::NoSuchContainer(id.to_string()))
    }

    async fn run_init_container(
        &self,
        spec: &ContainerSpec,
        stdout: &mut (dyn tokio::io::AsyncWrite + Unpin + Send),
        stderr: &mut (dyn tokio::io::AsyncWrite + Unpin + Send),
    ) -> Result<i64, RuntimeError> {
        let id = self.create_container(spec).await?;
        let result: Result<i64, RuntimeError> = async {
            self.start(&id).await?;
            let cancel = tokio_util::sync::CancellationToken::new();
            self.stream_logs(&id, stdout, stderr, cancel).await?;
            let exit = self.wait_for_exit(&id).await?;
            Ok(exit.exit_code)
        }
        .await;
        if let Err(err) = self.remove(&id).await {
            log::warn!("[{id}] could not remove init container: {err}");
        }
        result
    }

    async fn stream_logs(
        &self,
        id: &str,
        stdout: &mut (dyn tokio::io::AsyncWrite + Unpin + Send),
        stderr: &mut (dyn tokio::io::AsyncWrite + Unpin + Send),
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<(), RuntimeError> {
        // Bollard's log stream returns EOF immediately for a not-yet-running
        // container; poll inspect until it reports running first (§4.1).
        for _ in 0..50 {
            match self
                .docker
                .inspect_container(id, None::<InspectContainerOptions>)
                .await
            {
                Ok(inspect) if inspect.state.and_then(|s| s.running).unwrap_or(false) => break,
                _ => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }

        let mut stream = self.docker.logs::<String>(
            id,
            Some(LogsOptions {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("[{id}] log stream cancelled");
                    return Ok(());
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(LogOutput::StdOut { message })) => {
                            let _ = stdout.write_all(&message).await;
                        }
                        Some(Ok(LogOutput::StdErr { message })) => {
                            let _ = stderr.write_all(&message).await;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(RuntimeError::Backend(err)),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn wait_for_exit(&self, id: &str) -> Result<ExitStatus, RuntimeError> {
        let wait = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>)
            .try_collect::<Vec<_>>()
            .await;

        let exit_code = match wait {
            Ok(responses) => responses.last().map(|r| r.status_code).unwrap_or(0),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                log::debug!("[{id}] container already removed while waiting, treating as exited");
                0
            }
            Err(err) => return Err(RuntimeError::Backend(err)),
        };

        let oom_killed = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .ok()
            .and_then(|inspect| inspect.state)
            .and_then(|state| state.oom_killed)
            .unwrap_or(false);

        Ok(ExitStatus {
            exit_code,
            oom_killed,
        })
    }

    async fn stats_snapshot(&self, id: &str) -> Result<StatsSnapshot, RuntimeError> {
        let mut stream = self.docker.stats(
            id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        let stats = stream
            .next()
            .await
            .ok_or_else(|| RuntimeError::NoSuchContainer(id.to_string()))??;

        let memory_bytes = stats.memory_stats.usage.unwrap_or(0);
        let cpu_usec = stats.cpu_stats.cpu_usage.total_usage / 1000;
        let (mut disk_read_bytes, mut disk_write_bytes) = (0, 0);
        let (mut disk_read_ops, mut disk_write_ops) = (0, 0);
        if let Some(io) = stats.blkio_stats.io_service_bytes_recursive {
            for entry in io {
                match entry.op.to_lowercase().as_str() {
                    "read" => disk_read_bytes += entry.value,
                    "write" => disk_write_bytes += entry.value,
                    _ => {}
                }
            }
        }
        if let Some(io) = stats.blkio_stats.io_serviced_recursive {
            for entry in io {
                match entry.op.to_lowercase().as_str() {
                    "read" => disk_read_ops += entry.value,
                    "write" => disk_write_ops += entry.value,
                    _ => {}
                }
            }
        }

        Ok(StatsSnapshot {
            memory_bytes,
            cpu_usec,
            disk_read_bytes,
            disk_write_bytes,
            disk_read_ops,
            disk_write_ops,
        })
    }

    fn backend(&self) -> RuntimeBackend {
        self.backend
    }

    fn checkpoint_support(&self) -> Option<&dyn CheckpointSupport> {
        match self.backend {
            RuntimeBackend::Podman => Some(self),
            RuntimeBackend::Docker => None,
        }
    }
}

#[async_trait]
impl CheckpointSupport for BollardRuntime {
    async fn validate(&self) -> Result<(), RuntimeError> {
        let output = Command::new("podman")
            .args(["info", "--format", "{{.Host.OCIRuntime.Name}}"])
            .output()
            .await
            .map_err(|err| RuntimeError::CriuUnavailable(err.to_string()))?;
        if !output.status.success() {
            return Err(RuntimeError::CriuUnavailable(
                String::from_utf8_lossy(&output.stderr).to_string(),
            ));
        }
        let criu = Command::new("criu")
            .arg("--version")
            .output()
            .await
            .map_err(|err| RuntimeError::CriuUnavailable(err.to_string()))?;
        if !criu.status.success() {
            return Err(RuntimeError::CriuUnavailable(
                "criu binary not usable on this host".to_string(),
            ));
        }
        Ok(())
    }

    async fn checkpoint(
        &self,
        id: &str,
        export_path: &std::path::Path,
        wait_after_drop: Duration,
    ) -> Result<(), RuntimeError> {
        super::checkpoint::quiesce_sockets(id).await?;
        tokio::time::sleep(wait_after_drop).await;

        let output = Command::new("podman")
            .args(["container", "checkpoint"])
            .arg("--export")
            .arg(export_path)
            .arg("--tcp-established")
            .arg(id)
            .output()
            .await
            .map_err(|err| RuntimeError::SubprocessFailed {
                command: "podman container checkpoint".to_string(),
                status: -1,
                stderr: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(RuntimeError::SubprocessFailed {
                command: "podman container checkpoint".to_string(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        log::info!("[{id}] checkpointed to {}", export_path.display());
        Ok(())
    }

    async fn restore(
        &self,
        export_path: &std::path::Path,
        opts: &RestoreOptions,
    ) -> Result<String, RuntimeError> {
        let mut cmd = Command::new("podman");
        cmd.args(["container", "restore"]).arg("--import").arg(export_path);
        if let Some(name) = &opts.name {
            cmd.arg("--name").arg(name);
        }
        let output = cmd
            .output()
            .await
            .map_err(|err| RuntimeError::SubprocessFailed {
                command: "podman container restore".to_string(),
                status: -1,
                stderr: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(RuntimeError::SubprocessFailed {
                command: "podman container restore".to_string(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        log::info!("restored container {id} from {}", export_path.display());
        Ok(id)
    }

    async fn read_file_from_image(
        &self,
        id: &str,
        path_in_container: &str,
    ) -> Result<Vec<u8>, RuntimeError> {
        let output = Command::new("podman")
            .args(["cp", &format!("{id}:{path_in_container}"), "-"])
            .output()
            .await
            .map_err(|err| RuntimeError::SubprocessFailed {
                command: "podman cp".to_string(),
                status: -1,
                stderr: err.to_string(),
            })?;
        if !output.status.success() {
            return Err(RuntimeError::SubprocessFailed {
                command: "podman cp".to_string(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(output.stdout)
    }
}
