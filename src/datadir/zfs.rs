//! Copy-on-write snapshot datadir provisioner (§4.2 CoW snapshot variant).
//!
//! Auto-detects the ZFS dataset enclosing the source path by scanning
//! `zfs list -H -o name,mountpoint` and picking the longest mountpoint that
//! is either an exact match of the (canonicalised) source path or a proper
//! ancestor of it — never a bare substring match, since e.g. `/data/foo`
//! must not match a dataset mounted at `/data/foobar`.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::{error::DatadirError, labels::COW_CLONE_MARKER, labels::COW_SNAPSHOT_MARKER};

use super::{run_status_to_result, PreparedDatadir};

struct Dataset {
    name: String,
    mountpoint: PathBuf,
}

async fn list_datasets() -> Result<Vec<Dataset>, DatadirError> {
    let output = Command::new("zfs")
        .args(["list", "-H", "-o", "name,mountpoint"])
        .output()
        .await?;
    run_status_to_result("zfs list -H -o name,mountpoint".to_string(), &output)?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(2, '\t');
            let name = parts.next()?.to_string();
            let mountpoint = parts.next()?.trim();
            if mountpoint == "-" || mountpoint == "none" {
                return None;
            }
            Some(Dataset {
                name,
                mountpoint: PathBuf::from(mountpoint),
            })
        })
        .collect())
}

/// Finds the dataset whose mountpoint is the longest prefix of
/// `source_path` — an exact match, or a match immediately followed by a
/// path separator (never a raw substring match).
fn find_enclosing_dataset<'a>(datasets: &'a [Dataset], source_path: &Path) -> Option<&'a Dataset> {
    datasets
        .iter()
        .filter(|ds| {
            source_path == ds.mountpoint.as_path() || source_path.starts_with(&ds.mountpoint)
        })
        .max_by_key(|ds| ds.mountpoint.as_os_str().len())
}

/// Provisions a CoW clone of the dataset enclosing `source_dir`.
pub async fn prepare(source_dir: &Path, instance_id: &str) -> Result<PreparedDatadir, DatadirError> {
    let source_path = source_dir
        .canonicalize()
        .map_err(DatadirError::Io)?;

    let datasets = list_datasets().await?;
    let dataset = find_enclosing_dataset(&datasets, &source_path).ok_or_else(|| {
        crate::error::DatadirError::NoEnclosingDataset(source_path.display().to_string())
    })?;

    let relative = source_path
        .strip_prefix(&dataset.mountpoint)
        .unwrap_or(Path::new(""));

    let snapshot_name = format!("{}{COW_SNAPSHOT_MARKER}{instance_id}", dataset.name);
    let clone_name = format!(
        "{}{COW_CLONE_MARKER}{instance_id}",
        dataset.name.trim_end_matches('/')
    );

    // Each step is rolled back on failure, per §4.2 "Failure at any step
    // rolls back all prior successful steps."
    let snapshot_result = run(&["zfs", "snapshot", &snapshot_name]).await;
    if let Err(err) = snapshot_result {
        return Err(err);
    }

    let clone_result = run(&["zfs", "clone", &snapshot_name, &clone_name]).await;
    if let Err(err) = clone_result {
        let _ = run(&["zfs", "destroy", &snapshot_name]).await;
        return Err(err);
    }

    let clone_mountpoint = match get_mountpoint(&clone_name).await {
        Ok(mp) => mp,
        Err(err) => {
            let _ = run(&["zfs", "destroy", &clone_name]).await;
            let _ = run(&["zfs", "destroy", &snapshot_name]).await;
            return Err(err);
        }
    };

    let mount_path = clone_mountpoint.join(relative);
    log::info!(
        "provisioned CoW clone {clone_name} for instance {instance_id} at {}",
        mount_path.display()
    );

    let snapshot_for_release = snapshot_name.clone();
    let clone_for_release = clone_name.clone();
    Ok(PreparedDatadir::new(mount_path, move || {
        destroy_clone_and_snapshot(&clone_for_release, &snapshot_for_release)
    }))
}

async fn run(args: &[&str]) -> Result<(), DatadirError> {
    let output = Command::new(args[0]).args(&args[1..]).output().await?;
    run_status_to_result(args.join(" "), &output)
}

async fn get_mountpoint(dataset: &str) -> Result<PathBuf, DatadirError> {
    let output = Command::new("zfs")
        .args(["get", "-H", "-o", "value", "mountpoint", dataset])
        .output()
        .await?;
    run_status_to_result(format!("zfs get mountpoint {dataset}"), &output)?;
    Ok(PathBuf::from(
        String::from_utf8_lossy(&output.stdout).trim().to_string(),
    ))
}

fn destroy_clone_and_snapshot(clone_name: &str, snapshot_name: &str) -> Result<(), DatadirError> {
    let clone_status = std::process::Command::new("zfs")
        .args(["destroy", clone_name])
        .status()?;
    if !clone_status.success() {
        log::warn!("zfs destroy {clone_name} exited with {clone_status}");
    }
    let snapshot_status = std::process::Command::new("zfs")
        .args(["destroy", snapshot_name])
        .status()?;
    if !snapshot_status.success() {
        log::warn!("zfs destroy {snapshot_name} exited with {snapshot_status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ds(name: &str, mountpoint: &str) -> Dataset {
        Dataset {
            name: name.to_string(),
            mountpoint: PathBuf::from(mountpoint),
        }
    }

    #[test]
    fn picks_the_longest_enclosing_mountpoint() {
        let datasets = vec![ds("tank", "/"), ds("tank/data", "/data")];
        let found = find_enclosing_dataset(&datasets, Path::new("/data/chains/mainnet")).unwrap();
        assert_eq!(found.name, "tank/data");
    }

    #[test]
    fn does_not_match_sibling_with_shared_prefix() {
        let datasets = vec![ds("tank/data", "/data"), ds("tank/data-other", "/data-other")];
        let found = find_enclosing_dataset(&datasets, Path::new("/data-other/chains")).unwrap();
        assert_eq!(found.name, "tank/data-other");
    }

    #[test]
    fn exact_match_is_found() {
        let datasets = vec![ds("tank/data", "/data")];
        let found = find_enclosing_dataset(&datasets, Path::new("/data")).unwrap();
        assert_eq!(found.name, "tank/data");
    }

    #[test]
    fn no_match_returns_none() {
        let datasets = vec![ds("tank/data", "/data")];
        assert!(find_enclosing_dataset(&datasets, Path::new("/other")).is_none());
    }
}
