//! Container/volume label constants (§6 "Container labels") and the
//! orphan-marker naming conventions cleanup relies on (§6 "Cleanup orphan
//! markers").
//!
//! Every container, volume, overlay mount, or CoW clone created by a run
//! carries these so a later `cleanup-orphans` pass can find them even if the
//! process that created them was killed (§3 "Lifecycle and ownership", §9
//! "Long-lived goroutine control").

use std::collections::HashMap;

use crate::model::{ClientKind, InstanceId, RunId};

/// Marks a resource as owned by this tool.
pub const MANAGED_BY: &str = "benchmarkoor.managed-by";
/// Value of [`MANAGED_BY`] for every resource we create.
pub const MANAGED_BY_VALUE: &str = "benchmarkoor";
/// The run ID that created this resource.
pub const RUN_ID: &str = "benchmarkoor.run-id";
/// The instance ID this resource belongs to.
pub const INSTANCE_ID: &str = "benchmarkoor.instance";
/// The client kind of the instance.
pub const CLIENT: &str = "benchmarkoor.client";
/// Whether this is an `init` or `main` container.
pub const CONTAINER_TYPE: &str = "benchmarkoor.type";

/// Distinguishes a client's init container from its long-running main
/// container, per §6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerRole {
    /// A short-lived container run once to initialise a data directory.
    Init,
    /// The long-running client container that serves the Engine API.
    Main,
}

impl ContainerRole {
    fn as_str(self) -> &'static str {
        match self {
            ContainerRole::Init => "init",
            ContainerRole::Main => "main",
        }
    }
}

/// Builds the full label map for a container created as part of `run_id`.
#[must_use]
pub fn container_labels(
    run_id: &RunId,
    instance_id: &InstanceId,
    client: ClientKind,
    role: ContainerRole,
) -> HashMap<String, String> {
    HashMap::from([
        (MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
        (RUN_ID.to_string(), run_id.to_string()),
        (INSTANCE_ID.to_string(), instance_id.to_string()),
        (CLIENT.to_string(), client.to_string()),
        (CONTAINER_TYPE.to_string(), role.as_str().to_string()),
    ])
}

/// Prefix used for native-overlay provisioning temp directories.
pub const OVERLAY_TMP_PREFIX: &str = "benchmarkoor-overlay-";
/// Prefix used for FUSE-overlay provisioning temp directories.
pub const FUSE_OVERLAY_TMP_PREFIX: &str = "benchmarkoor-fuse-overlay-";
/// Prefix used for the plain bulk-copy provisioner's temp directories.
pub const COPY_TMP_PREFIX: &str = "benchmarkoor-datadir-";
/// Substring marking a CoW clone dataset as ours.
pub const COW_CLONE_MARKER: &str = "/benchmarkoor-clone-";
/// Substring marking a CoW snapshot as ours.
pub const COW_SNAPSHOT_MARKER: &str = "@benchmarkoor-";

/// Returns the directory (under `$HOME/.cache`) where CPU governor
/// crash-safe state files are written, per §6.
#[must_use]
pub fn cpu_governor_state_dir() -> std::path::PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    std::path::PathBuf::from(home)
        .join(".cache")
        .join("benchmarkoor")
}
