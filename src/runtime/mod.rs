//! Polymorphic container runtime driver (C1, §4.1).
//!
//! `benchmarkoor` talks to Docker and Podman through the same
//! [`ContainerRuntime`] trait: both expose a Docker-API-compatible unix
//! socket, so a single [`bollard::Docker`] client handles both — the
//! `RuntimeBackend` a caller chose only changes the connection string and
//! which capabilities ([`CheckpointSupport`]) are queried successfully. One
//! `bollard::Docker` handle is threaded through every container operation,
//! the same handle used for both pulling images and running them.
//!
//! The trait is `async-trait`-based so it stays object-safe: the supervisor
//! holds a `Arc<dyn ContainerRuntime>` and tests substitute
//! [`fake::FakeRuntime`].

pub mod checkpoint;
pub mod docker;
#[cfg(test)]
pub mod fake;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::error::RuntimeError;

/// Which daemon a [`ContainerRuntime`] is configured to talk to.
///
/// Affects only which optional capabilities ([`CheckpointSupport`]) are
/// available and how image references get normalised; the wire protocol is
/// identical (§4.1 "present as a single capability set + tagged variant").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeBackend {
    /// The Docker daemon's API.
    Docker,
    /// Podman's libpod, reached through its Docker-compatible socket.
    Podman,
}

/// How aggressively [`ContainerRuntime::pull_image`] should re-fetch an
/// image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImagePullPolicy {
    /// Always pull, even if the image already exists locally.
    Always,
    /// Pull only if the image is not already present locally.
    IfMissing,
    /// Never pull; fail if the image is not present locally.
    Never,
}

/// Minimal container creation spec — just what the supervisor needs to
/// assemble for a client container (§4.4 step 6).
#[derive(Clone, Debug)]
pub struct ContainerSpec {
    /// The container's name (must be unique on the host).
    pub name: String,
    /// Fully-qualified image reference.
    pub image: String,
    /// Entrypoint override.
    pub entrypoint: Option<Vec<String>>,
    /// Command/args override.
    pub cmd: Option<Vec<String>>,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Bind mounts: `(host_path, container_path, read_only)`.
    pub binds: Vec<(String, String, bool)>,
    /// Named volume to mount at a path, if any.
    pub volume: Option<(String, String)>,
    /// Network to attach to.
    pub network: Option<String>,
    /// Resource limits to apply.
    pub resources: crate::model::ResourceLimits,
    /// Labels to attach (see [`crate::labels`]).
    pub labels: HashMap<String, String>,
}

/// The outcome of waiting for a container to exit (§4.1 `waitForExit`).
#[derive(Clone, Copy, Debug)]
pub struct ExitStatus {
    /// The process exit code, if known.
    pub exit_code: i64,
    /// Whether the kernel OOM-killed the container's main process.
    pub oom_killed: bool,
}

/// A point-in-time resource usage snapshot, used as the §4.6 fallback when
/// cgroup paths cannot be probed directly.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatsSnapshot {
    /// Resident memory, in bytes.
    pub memory_bytes: u64,
    /// Cumulative CPU usage, in microseconds.
    pub cpu_usec: u64,
    /// Cumulative bytes read from block devices.
    pub disk_read_bytes: u64,
    /// Cumulative bytes written to block devices.
    pub disk_write_bytes: u64,
    /// Cumulative read I/O operations.
    pub disk_read_ops: u64,
    /// Cumulative write I/O operations.
    pub disk_write_ops: u64,
}

/// The uniform capability set a container backend exposes (§4.1).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Idempotently ensures a bridge network with the given name exists.
    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError>;

    /// Pulls `image` according to `policy`.
    async fn pull_image(&self, image: &str, policy: ImagePullPolicy) -> Result<(), RuntimeError>;

    /// Returns the resolved digest (`sha256:...`) of a local image, if
    /// known.
    async fn get_image_digest(&self, image: &str) -> Result<Option<String>, RuntimeError>;

    /// Creates a container from `spec`. Does not start it.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Starts a previously created container.
    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Stops a running container, giving it `timeout` to exit cleanly.
    async fn stop(&self, id: &str, timeout: std::time::Duration) -> Result<(), RuntimeError>;

    /// Removes a container. A "no such container" result is treated as
    /// success by callers, not surfaced as an error here, matching
    /// §4.1 "races against container removal benignly".
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    /// Returns the container's IP address on the given network.
    async fn get_container_ip(&self, id: &str, network: &str) -> Result<String, RuntimeError>;

    /// Creates, starts, streams logs for, and waits on a short-lived init
    /// container, always removing it afterwards regardless of outcome
    /// (§4.1 `runInitContainer`).
    async fn run_init_container(
        &self,
        spec: &ContainerSpec,
        stdout: &mut (dyn AsyncWrite + Unpin + Send),
        stderr: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<i64, RuntimeError>;

    /// Streams a container's stdout/stderr until it is cancelled or the
    /// container stops producing output. For backends whose log API
    /// returns EOF before the container is running, implementations poll
    /// `inspect` until `state == running` first (§4.1).
    async fn stream_logs(
        &self,
        id: &str,
        stdout: &mut (dyn AsyncWrite + Unpin + Send),
        stderr: &mut (dyn AsyncWrite + Unpin + Send),
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<(), RuntimeError>;

    /// Blocks until the container exits, returning its exit status.
    async fn wait_for_exit(&self, id: &str) -> Result<ExitStatus, RuntimeError>;

    /// Takes a one-shot resource usage snapshot for `id` (§4.6 fallback
    /// path).
    async fn stats_snapshot(&self, id: &str) -> Result<StatsSnapshot, RuntimeError>;

    /// The backend this runtime is configured to talk to.
    fn backend(&self) -> RuntimeBackend;

    /// Returns this runtime's checkpoint/restore capability, if the
    /// backend supports it (§4.1 "Optional CheckpointSupport").
    fn checkpoint_support(&self) -> Option<&dyn checkpoint::CheckpointSupport> {
        None
    }
}

/// Normalises an image reference to the fully-qualified registry form a
/// backend expects, prepending `docker.io/` when the first path segment
/// contains no dot (§4.1 "Image names are normalised...") — a host
/// (`registry.example.com/repo`) is distinguished from a Docker Hub
/// namespace (`nethermind/nethermind`) by that dot, not by the mere
/// presence of a `/`, since Podman requires fully-qualified names.
#[must_use]
pub fn normalize_image_ref(image: &str) -> String {
    let first_segment = image.split('/').next().unwrap_or(image);
    let is_host_qualified =
        first_segment.contains('.') || first_segment.contains(':') || first_segment == "localhost";
    if is_host_qualified {
        image.to_string()
    } else if image.contains('/') {
        format!("docker.io/{image}")
    } else {
        format!("docker.io/library/{image}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bare_image_names() {
        assert_eq!(normalize_image_ref("geth"), "docker.io/library/geth");
    }

    #[test]
    fn leaves_registry_qualified_images_alone() {
        assert_eq!(
            normalize_image_ref("ghcr.io/ethereum/geth:stable"),
            "ghcr.io/ethereum/geth:stable"
        );
    }

    #[test]
    fn qualifies_namespaced_dockerhub_images() {
        assert_eq!(
            normalize_image_ref("nethermind/nethermind"),
            "docker.io/nethermind/nethermind"
        );
    }

    #[test]
    fn leaves_localhost_registry_images_alone() {
        assert_eq!(normalize_image_ref("localhost:5000/geth"), "localhost:5000/geth");
    }
}
