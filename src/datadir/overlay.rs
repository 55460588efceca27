//! Overlay-filesystem datadir provisioners (§4.2 Overlay variants).
//!
//! Both variants lay out `upperdir`/`workdir`/`merged` under a fresh scratch
//! directory and differ only in which tool performs the mount: the kernel's
//! native `overlay` filesystem (needs privileged `mount`), or
//! `fuse-overlayfs` for hosts where that isn't available.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::{
    error::DatadirError,
    labels::{FUSE_OVERLAY_TMP_PREFIX, OVERLAY_TMP_PREFIX},
};

use super::{run_status_to_result, PreparedDatadir};

struct OverlayLayout {
    root: PathBuf,
    upper: PathBuf,
    work: PathBuf,
    merged: PathBuf,
}

async fn layout(tmp_dir: &Path, prefix: &str, instance_id: &str) -> std::io::Result<OverlayLayout> {
    let root = tmp_dir.join(format!("{prefix}{instance_id}-{}", uuid::Uuid::new_v4()));
    let upper = root.join("upper");
    let work = root.join("work");
    let merged = root.join("merged");
    for dir in [&upper, &work, &merged] {
        tokio::fs::create_dir_all(dir).await?;
    }
    Ok(OverlayLayout {
        root,
        upper,
        work,
        merged,
    })
}

/// Provisions a native kernel `overlay` mount over `source_dir`.
pub async fn prepare_native(
    source_dir: &Path,
    instance_id: &str,
    tmp_dir: &Path,
) -> Result<PreparedDatadir, DatadirError> {
    let layout = layout(tmp_dir, OVERLAY_TMP_PREFIX, instance_id).await?;

    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        source_dir.display(),
        layout.upper.display(),
        layout.work.display()
    );
    let output = Command::new("mount")
        .args(["-t", "overlay", "overlay", "-o", &options])
        .arg(&layout.merged)
        .output()
        .await?;
    run_status_to_result(format!("mount -t overlay -o {options}"), &output)?;

    log::info!(
        "provisioned native overlay datadir for instance {instance_id} at {}",
        layout.merged.display()
    );

    let merged = layout.merged.clone();
    let root = layout.root.clone();
    Ok(PreparedDatadir::new(merged.clone(), move || {
        unmount_and_remove(&merged, &root, "umount")
    }))
}

/// Provisions a `fuse-overlayfs` mount over `source_dir`, for hosts without
/// privileged mount access.
pub async fn prepare_fuse(
    source_dir: &Path,
    instance_id: &str,
    tmp_dir: &Path,
) -> Result<PreparedDatadir, DatadirError> {
    let layout = layout(tmp_dir, FUSE_OVERLAY_TMP_PREFIX, instance_id).await?;

    let options = format!(
        "lowerdir={},upperdir={},workdir={},allow_root,squash_to_uid=0,squash_to_gid=0",
        source_dir.display(),
        layout.upper.display(),
        layout.work.display()
    );
    let output = Command::new("fuse-overlayfs")
        .args(["-o", &options])
        .arg(&layout.merged)
        .output()
        .await?;
    run_status_to_result(format!("fuse-overlayfs -o {options}"), &output)?;

    log::info!(
        "provisioned fuse-overlayfs datadir for instance {instance_id} at {}",
        layout.merged.display()
    );

    let merged = layout.merged.clone();
    let root = layout.root.clone();
    Ok(PreparedDatadir::new(merged.clone(), move || {
        unmount_and_remove(&merged, &root, "fusermount")
    }))
}

fn unmount_and_remove(merged: &Path, root: &Path, unmount_cmd: &str) -> Result<(), DatadirError> {
    let args: Vec<&str> = if unmount_cmd == "fusermount" {
        vec!["-u"]
    } else {
        vec![]
    };
    let status = std::process::Command::new(unmount_cmd)
        .args(&args)
        .arg(merged)
        .status()?;
    if !status.success() {
        log::warn!(
            "{unmount_cmd} {} exited with {status}, attempting removal anyway",
            merged.display()
        );
    }
    if root.exists() {
        std::fs::remove_dir_all(root)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn layout_creates_expected_subdirectories() {
        let tmp = tempfile::tempdir().unwrap();
        let l = layout(tmp.path(), OVERLAY_TMP_PREFIX, "inst").await.unwrap();
        assert!(l.upper.is_dir());
        assert!(l.work.is_dir());
        assert!(l.merged.is_dir());
        assert!(l.root.starts_with(tmp.path()));
    }
}
