//! Data-directory provisioning (C2, §4.2).
//!
//! Every variant shares the same `{mount_path, release}` contract: a
//! [`PreparedDatadir`] is a mount path plus a boxed release closure that
//! captures whatever provider-specific teardown is needed (unmount, destroy
//! snapshot, delete tree). This keeps `InstanceSupervisor` free of a vtable
//! or an enum match at the call site, per §9 "removing the need for a
//! virtual table at higher layers".

pub mod copy;
pub mod overlay;
pub mod zfs;

use std::path::{Path, PathBuf};

use crate::{error::DatadirError, model::DatadirSpec};

/// A provisioned, writable data directory and the means to release it.
pub struct PreparedDatadir {
    /// The path a container should bind-mount as its data directory.
    pub mount_path: PathBuf,
    release: Box<dyn FnOnce() -> Result<(), DatadirError> + Send>,
}

impl PreparedDatadir {
    fn new(mount_path: PathBuf, release: impl FnOnce() -> Result<(), DatadirError> + Send + 'static) -> Self {
        Self {
            mount_path,
            release: Box::new(release),
        }
    }

    /// Releases the provisioned directory, running the provider-specific
    /// teardown exactly once.
    pub fn release(self) -> Result<(), DatadirError> {
        (self.release)()
    }
}

/// Materialises a writable data directory from `source_dir` for
/// `instance_id`, using `tmp_dir` as scratch space, according to `spec`.
pub async fn prepare(
    spec: &DatadirSpec,
    source_dir: &Path,
    instance_id: &str,
    tmp_dir: &Path,
) -> Result<PreparedDatadir, DatadirError> {
    match spec {
        DatadirSpec::Copy => copy::prepare(source_dir, instance_id, tmp_dir).await,
        DatadirSpec::OverlayNative => overlay::prepare_native(source_dir, instance_id, tmp_dir).await,
        DatadirSpec::OverlayFuse => overlay::prepare_fuse(source_dir, instance_id, tmp_dir).await,
        DatadirSpec::CowSnapshot => zfs::prepare(source_dir, instance_id).await,
    }
}

pub(crate) fn run_status_to_result(
    command: String,
    output: &std::process::Output,
) -> Result<(), DatadirError> {
    if output.status.success() {
        Ok(())
    } else {
        Err(DatadirError::SubprocessFailed {
            command,
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
