//! CRIU checkpoint/restore rollback (§4.3 CheckpointRestore, §9 "Ambiguity
//! to flag, not guess").
//!
//! Resolved as: checkpoint once after the node
//! first becomes ready, then restore the container *and* roll the data
//! directory back to a pristine copy before every subsequent test — rather
//! than relying on CRIU to preserve mount state across restores. The
//! checkpointed container's export stays fixed for the whole run; only the
//! data directory needs a fresh rollback each time.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{
    engine_api::EngineApiClient,
    error::RollbackError,
    runtime::{checkpoint::RestoreOptions, ContainerRuntime},
};

use super::{CapturedState, RollbackStrategy};

/// Rolls back by restoring a CRIU checkpoint and a pristine data directory
/// copy before every test.
pub struct CheckpointRestoreRollback {
    runtime: Arc<dyn ContainerRuntime>,
    export_path: PathBuf,
    datadir_path: PathBuf,
    datadir_backup_path: PathBuf,
    current_container_id: Mutex<String>,
}

impl CheckpointRestoreRollback {
    /// Takes the one-time checkpoint of `container_id` and backs up the
    /// data directory, establishing the baseline every subsequent test
    /// restores to.
    pub async fn establish(
        runtime: Arc<dyn ContainerRuntime>,
        container_id: &str,
        export_path: PathBuf,
        datadir_path: PathBuf,
        datadir_backup_path: PathBuf,
        wait_after_drop: Duration,
    ) -> anyhow::Result<Self> {
        let support = runtime
            .checkpoint_support()
            .ok_or_else(|| anyhow::anyhow!("backend does not support checkpoint/restore"))?;
        support.validate().await?;
        support.checkpoint(container_id, &export_path, wait_after_drop).await?;

        tokio::task::spawn_blocking({
            let src = datadir_path.clone();
            let dst = datadir_backup_path.clone();
            move || backup_tree(&src, &dst)
        })
        .await??;

        log::info!(
            "established checkpoint baseline for {container_id} at {}",
            export_path.display()
        );

        Ok(Self {
            runtime,
            export_path,
            datadir_path,
            datadir_backup_path,
            current_container_id: Mutex::new(container_id.to_string()),
        })
    }
}

#[async_trait]
impl RollbackStrategy for CheckpointRestoreRollback {
    async fn capture(&self, _client: &EngineApiClient) -> Result<CapturedState, RollbackError> {
        Ok(CapturedState::None)
    }

    async fn restore(&self, _client: &EngineApiClient, _captured: &CapturedState) -> Result<(), RollbackError> {
        let mut current_id = self.current_container_id.lock().await;

        let _ = self.runtime.stop(&current_id, Duration::from_secs(5)).await;
        let _ = self.runtime.remove(&current_id).await;

        let datadir_path = self.datadir_path.clone();
        let backup_path = self.datadir_backup_path.clone();
        tokio::task::spawn_blocking(move || restore_tree(&datadir_path, &backup_path))
            .await
            .map_err(|err| RollbackError::RpcFailed(anyhow::anyhow!(err)))?
            .map_err(RollbackError::RpcFailed)?;

        let support = self
            .runtime
            .checkpoint_support()
            .ok_or_else(|| RollbackError::RpcFailed(anyhow::anyhow!("backend lost checkpoint support")))?;
        let new_id = support
            .restore(&self.export_path, &RestoreOptions::default())
            .await
            .map_err(|err| RollbackError::RpcFailed(anyhow::Error::new(err).context("restoring checkpoint")))?;

        *current_id = new_id;
        Ok(())
    }
}

fn backup_tree(src: &Path, dst: &Path) -> anyhow::Result<()> {
    if dst.exists() {
        std::fs::remove_dir_all(dst)?;
    }
    copy_tree(src, dst)?;
    Ok(())
}

fn restore_tree(datadir: &Path, backup: &Path) -> anyhow::Result<()> {
    if datadir.exists() {
        std::fs::remove_dir_all(datadir)?;
    }
    copy_tree(backup, datadir)?;
    Ok(())
}

fn copy_tree(src: &Path, dst: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let dst_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &dst_path)?;
        } else {
            std::fs::copy(entry.path(), &dst_path)?;
        }
    }
    Ok(())
}
