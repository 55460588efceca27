//! An in-memory [`ContainerRuntime`] fake, used by unit tests across the
//! crate so they don't need a real Docker/Podman daemon.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::RuntimeError;

use super::{
    ContainerRuntime, ContainerSpec, ExitStatus, ImagePullPolicy, RuntimeBackend, StatsSnapshot,
};

#[derive(Debug, Clone)]
struct FakeContainer {
    spec: ContainerSpec,
    running: bool,
    exit_status: Option<ExitStatus>,
}

/// An in-memory container runtime: `create`/`start`/`stop`/`remove` just
/// mutate a table, `wait_for_exit` returns whatever
/// [`FakeRuntime::set_exit_status`] was told to return (defaulting to a
/// clean exit), and logs/stats are empty. Enough surface for supervisor and
/// rollback unit tests to exercise their control flow without a daemon.
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    next_id: AtomicU64,
    pending_exit: Mutex<HashMap<String, ExitStatus>>,
}

impl FakeRuntime {
    /// Creates an empty fake runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arranges for the next `wait_for_exit(name)` to return `status`
    /// instead of the default clean exit.
    pub fn set_exit_status(&self, name: &str, status: ExitStatus) {
        self.pending_exit
            .lock()
            .unwrap()
            .insert(name.to_string(), status);
    }

    /// Returns whether a container with this name currently exists.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.containers.lock().unwrap().contains_key(name)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ensure_network(&self, _name: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn pull_image(&self, _image: &str, _policy: ImagePullPolicy) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn get_image_digest(&self, _image: &str) -> Result<Option<String>, RuntimeError> {
        Ok(Some("sha256:fake".to_string()))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().unwrap().insert(
            spec.name.clone(),
            FakeContainer {
                spec: spec.clone(),
                running: false,
                exit_status: None,
            },
        );
        let _ = id;
        Ok(spec.name.clone())
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NoSuchContainer(id.to_string()))?;
        container.running = true;
        Ok(())
    }

    async fn stop(&self, id: &str, _timeout: std::time::Duration) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        if let Some(container) = containers.get_mut(id) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.containers.lock().unwrap().remove(id);
        Ok(())
    }

    async fn get_container_ip(&self, id: &str, _network: &str) -> Result<String, RuntimeError> {
        if self.containers.lock().unwrap().contains_key(id) {
            Ok("127.0.0.1".to_string())
        } else {
            Err(RuntimeError::NoSuchContainer(id.to_string()))
        }
    }

    async fn run_init_container(
        &self,
        spec: &ContainerSpec,
        _stdout: &mut (dyn tokio::io::AsyncWrite + Unpin + Send),
        _stderr: &mut (dyn tokio::io::AsyncWrite + Unpin + Send),
    ) -> Result<i64, RuntimeError> {
        self.create_container(spec).await?;
        self.start(&spec.name).await?;
        self.remove(&spec.name).await?;
        Ok(0)
    }

    async fn stream_logs(
        &self,
        _id: &str,
        stdout: &mut (dyn tokio::io::AsyncWrite + Unpin + Send),
        _stderr: &mut (dyn tokio::io::AsyncWrite + Unpin + Send),
        _cancel: tokio_util::sync::CancellationToken,
    ) -> Result<(), RuntimeError> {
        let _ = stdout.write_all(b"").await;
        Ok(())
    }

    async fn wait_for_exit(&self, id: &str) -> Result<ExitStatus, RuntimeError> {
        if let Some(status) = self.pending_exit.lock().unwrap().remove(id) {
            return Ok(status);
        }
        Ok(ExitStatus {
            exit_code: 0,
            oom_killed: false,
        })
    }

    async fn stats_snapshot(&self, _id: &str) -> Result<StatsSnapshot, RuntimeError> {
        Ok(StatsSnapshot::default())
    }

    fn backend(&self) -> RuntimeBackend {
        RuntimeBackend::Docker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "geth:stable".to_string(),
            entrypoint: None,
            cmd: None,
            env: Map::new(),
            binds: vec![],
            volume: None,
            network: None,
            resources: crate::model::ResourceLimits::default(),
            labels: Map::new(),
        }
    }

    #[tokio::test]
    async fn create_start_stop_remove_round_trip() {
        let runtime = FakeRuntime::new();
        let id = runtime.create_container(&spec("a")).await.unwrap();
        assert!(runtime.exists(&id));
        runtime.start(&id).await.unwrap();
        runtime.stop(&id, std::time::Duration::from_secs(1)).await.unwrap();
        runtime.remove(&id).await.unwrap();
        assert!(!runtime.exists(&id));
    }

    #[tokio::test]
    async fn wait_for_exit_reports_injected_oom() {
        let runtime = FakeRuntime::new();
        runtime.create_container(&spec("b")).await.unwrap();
        runtime.set_exit_status(
            "b",
            ExitStatus {
                exit_code: 137,
                oom_killed: true,
            },
        );
        let status = runtime.wait_for_exit("b").await.unwrap();
        assert_eq!(status.exit_code, 137);
        assert!(status.oom_killed);
    }
}
