//! Optional CRIU-based checkpoint/restore capability (§4.1).
//!
//! Only the Podman backend implements this (`bollard` has no checkpoint API
//! of its own, and Docker does not support CRIU checkpoint/restore at all),
//! so it is exposed as a capability queried at runtime
//! (`ContainerRuntime::checkpoint_support`) rather than a second trait
//! hierarchy, matching §9's "optional capability... not a separate type
//! hierarchy".

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::RuntimeError;

/// Options controlling a restore operation.
#[derive(Clone, Debug, Default)]
pub struct RestoreOptions {
    /// Name to give the restored container; defaults to the original name
    /// when unset.
    pub name: Option<String>,
}

/// CRIU-backed checkpoint/restore, and the pre-checkpoint socket quiescing
/// CRIU requires (§4.1).
#[async_trait]
pub trait CheckpointSupport: Send + Sync {
    /// Verifies the host has a working CRIU installation, returning an
    /// error describing what is missing otherwise.
    async fn validate(&self) -> Result<(), RuntimeError>;

    /// Quiesces the container's network namespace so CRIU can checkpoint
    /// it, then takes a checkpoint and exports it to `export_path`.
    ///
    /// Per §4.1, the socket-drop sequence is: insert a `REJECT` rule for
    /// new outbound TCP SYN, a `DROP` rule for UDP, then destroy all
    /// non-listening TCP and all UDP sockets, then wait `wait_after_drop`
    /// for the application's event loop to close file descriptors. This
    /// ordering exists because CRIU cannot restore sockets bound to the
    /// pre-restore container IP.
    async fn checkpoint(
        &self,
        id: &str,
        export_path: &std::path::Path,
        wait_after_drop: std::time::Duration,
    ) -> Result<(), RuntimeError>;

    /// Restores a container from a checkpoint export, returning the new
    /// container ID.
    async fn restore(
        &self,
        export_path: &std::path::Path,
        opts: &RestoreOptions,
    ) -> Result<String, RuntimeError>;

    /// Reads a file out of a (possibly stopped) container's image, used by
    /// rollback to patch config files without starting the container.
    async fn read_file_from_image(
        &self,
        id: &str,
        path_in_container: &str,
    ) -> Result<Vec<u8>, RuntimeError>;
}

/// Runs the socket-quiescing sequence inside `id`'s network namespace via
/// `podman exec` + `nft`/`ss`, as a free function so both the production
/// `PodmanCheckpoint` and any future backend can share it.
pub(crate) async fn quiesce_sockets(id: &str) -> Result<(), RuntimeError> {
    run_in_container(
        id,
        &[
            "nft", "add", "table", "inet", "benchmarkoor",
        ],
    )
    .await?;
    run_in_container(
        id,
        &[
            "nft", "add", "chain", "inet", "benchmarkoor", "output",
            "{", "type", "filter", "hook", "output", "priority", "0", ";", "}",
        ],
    )
    .await?;
    run_in_container(
        id,
        &[
            "nft", "add", "rule", "inet", "benchmarkoor", "output",
            "tcp", "flags", "syn", "reject",
        ],
    )
    .await?;
    run_in_container(
        id,
        &["nft", "add", "rule", "inet", "benchmarkoor", "output", "udp", "drop"],
    )
    .await?;
    run_in_container(id, &["ss", "-K", "state", "established"]).await?;
    run_in_container(id, &["ss", "-K", "state", "syn-sent"]).await?;
    Ok(())
}

async fn run_in_container(id: &str, cmd: &[&str]) -> Result<(), RuntimeError> {
    let output = Command::new("podman")
        .arg("exec")
        .arg(id)
        .args(cmd)
        .output()
        .await
        .map_err(|err| RuntimeError::SubprocessFailed {
            command: format!("podman exec {id} {}", cmd.join(" ")),
            status: -1,
            stderr: err.to_string(),
        })?;
    if !output.status.success() {
        log::warn!(
            "[{id}] socket-quiesce command `{}` failed (continuing): {}",
            cmd.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}
