//! cgroup-backed resource sampling (C4, §4.6).
//!
//! Prefers reading cgroup v2 counters directly (cheap, no runtime round
//! trip); falls back to the container runtime's own stats call when no
//! valid cgroup path can be found (rootless Podman on some distros, or a
//! runtime this sampler hasn't learned the cgroup layout of yet).

use std::{path::PathBuf, sync::Arc};

use crate::{
    model::ResourceTotals,
    runtime::{ContainerRuntime, StatsSnapshot},
};

/// One point-in-time reading, before deltas are computed.
#[derive(Clone, Copy, Debug, Default)]
struct Sample {
    memory_bytes: u64,
    cpu_usec: u64,
    disk_read_bytes: u64,
    disk_write_bytes: u64,
    disk_read_ops: u64,
    disk_write_ops: u64,
}

/// Samples resource counters for one container, either from its cgroup v2
/// hierarchy or from the runtime's stats API.
pub struct ResourceSampler {
    runtime: Arc<dyn ContainerRuntime>,
    cgroup_path: Option<PathBuf>,
}

impl ResourceSampler {
    /// Builds a sampler for `container_id`, probing for a usable cgroup v2
    /// path up front.
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>, container_id: &str) -> Self {
        let cgroup_path = find_cgroup_path(container_id);
        if let Some(path) = &cgroup_path {
            log::debug!("resource sampler using cgroup path {}", path.display());
        } else {
            log::debug!("no cgroup v2 path found for {container_id}, falling back to runtime stats");
        }
        Self { runtime, cgroup_path }
    }

    /// Takes one sample now.
    pub async fn sample(&self, container_id: &str) -> anyhow::Result<()> {
        let _ = self.read(container_id).await?;
        Ok(())
    }

    async fn read(&self, container_id: &str) -> anyhow::Result<Sample> {
        if let Some(path) = &self.cgroup_path {
            if let Ok(sample) = read_cgroup_sample(path) {
                return Ok(sample);
            }
            log::warn!("cgroup read failed for {container_id}, falling back to runtime stats");
        }
        let snapshot = self.runtime.stats_snapshot(container_id).await?;
        Ok(snapshot_to_sample(&snapshot))
    }

    /// Samples before and after a timed window, returning the non-negative
    /// deltas attributable to it (§4.6: memory delta preserves sign,
    /// cumulative counters clamp to zero on any observed decrease).
    pub async fn delta_over<F, Fut>(&self, container_id: &str, window: F) -> anyhow::Result<ResourceTotals>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        let before = self.read(container_id).await?;
        window().await?;
        let after = self.read(container_id).await?;
        Ok(diff(&before, &after))
    }
}

fn diff(before: &Sample, after: &Sample) -> ResourceTotals {
    ResourceTotals {
        memory_delta_bytes: after.memory_bytes as i64 - before.memory_bytes as i64,
        cpu_usec: after.cpu_usec.saturating_sub(before.cpu_usec),
        disk_read_bytes: after.disk_read_bytes.saturating_sub(before.disk_read_bytes),
        disk_write_bytes: after.disk_write_bytes.saturating_sub(before.disk_write_bytes),
        disk_read_ops: after.disk_read_ops.saturating_sub(before.disk_read_ops),
        disk_write_ops: after.disk_write_ops.saturating_sub(before.disk_write_ops),
    }
}

fn snapshot_to_sample(snapshot: &StatsSnapshot) -> Sample {
    Sample {
        memory_bytes: snapshot.memory_bytes,
        cpu_usec: snapshot.cpu_usec,
        disk_read_bytes: snapshot.disk_read_bytes,
        disk_write_bytes: snapshot.disk_write_bytes,
        disk_read_ops: snapshot.disk_read_ops,
        disk_write_ops: snapshot.disk_write_ops,
    }
}

/// Candidate cgroup v2 paths for a container ID, probed in order (§4.6).
fn candidate_paths(container_id: &str) -> Vec<PathBuf> {
    let mut ids = vec![container_id.to_string()];
    if container_id.len() > 12 {
        ids.push(container_id[..12].to_string());
    }
    let mut paths = Vec::new();
    for id in &ids {
        paths.push(PathBuf::from(format!(
            "/sys/fs/cgroup/system.slice/docker-{id}.scope"
        )));
        paths.push(PathBuf::from(format!("/sys/fs/cgroup/docker/{id}")));
        paths.push(PathBuf::from(format!(
            "/sys/fs/cgroup/machine.slice/libpod-{id}.scope/container"
        )));
        paths.push(PathBuf::from(format!(
            "/sys/fs/cgroup/machine.slice/libpod-{id}.scope"
        )));
        paths.push(PathBuf::from(format!("/sys/fs/cgroup/libpod_parent/libpod-{id}")));
    }
    paths
}

fn find_cgroup_path(container_id: &str) -> Option<PathBuf> {
    candidate_paths(container_id).into_iter().find(|path| is_valid_cgroup(path))
}

fn is_valid_cgroup(path: &PathBuf) -> bool {
    if !path.is_dir() {
        return false;
    }
    ["memory.current", "cpu.stat", "cgroup.controllers"]
        .iter()
        .any(|marker| path.join(marker).exists())
}

fn read_cgroup_sample(path: &PathBuf) -> anyhow::Result<Sample> {
    let memory_bytes = read_u64_file(&path.join("memory.current")).unwrap_or(0);
    let cpu_usec = read_cpu_stat_usec(&path.join("cpu.stat")).unwrap_or(0);
    let (disk_read_bytes, disk_write_bytes, disk_read_ops, disk_write_ops) =
        read_io_stat(&path.join("io.stat")).unwrap_or((0, 0, 0, 0));
    Ok(Sample {
        memory_bytes,
        cpu_usec,
        disk_read_bytes,
        disk_write_bytes,
        disk_read_ops,
        disk_write_ops,
    })
}

fn read_u64_file(path: &PathBuf) -> anyhow::Result<u64> {
    Ok(std::fs::read_to_string(path)?.trim().parse()?)
}

fn read_cpu_stat_usec(path: &PathBuf) -> anyhow::Result<u64> {
    let contents = std::fs::read_to_string(path)?;
    for line in contents.lines() {
        if let Some(value) = line.strip_prefix("usage_usec ") {
            return Ok(value.trim().parse()?);
        }
    }
    anyhow::bail!("usage_usec not found in {}", path.display())
}

fn read_io_stat(path: &PathBuf) -> anyhow::Result<(u64, u64, u64, u64)> {
    let contents = std::fs::read_to_string(path)?;
    let mut read_bytes = 0u64;
    let mut write_bytes = 0u64;
    let mut read_ops = 0u64;
    let mut write_ops = 0u64;
    for line in contents.lines() {
        for field in line.split_whitespace().skip(1) {
            if let Some(value) = field.strip_prefix("rbytes=") {
                read_bytes = read_bytes.saturating_add(value.parse().unwrap_or(0));
            } else if let Some(value) = field.strip_prefix("wbytes=") {
                write_bytes = write_bytes.saturating_add(value.parse().unwrap_or(0));
            } else if let Some(value) = field.strip_prefix("rios=") {
                read_ops = read_ops.saturating_add(value.parse().unwrap_or(0));
            } else if let Some(value) = field.strip_prefix("wios=") {
                write_ops = write_ops.saturating_add(value.parse().unwrap_or(0));
            }
        }
    }
    Ok((read_bytes, write_bytes, read_ops, write_ops))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_clamps_decreasing_cumulative_counters_to_zero() {
        let before = Sample {
            memory_bytes: 100,
            cpu_usec: 500,
            disk_read_bytes: 1000,
            disk_write_bytes: 1000,
            disk_read_ops: 10,
            disk_write_ops: 10,
        };
        let after = Sample {
            memory_bytes: 50,
            cpu_usec: 400,
            disk_read_bytes: 1000,
            disk_write_bytes: 1500,
            disk_read_ops: 5,
            disk_write_ops: 20,
        };
        let totals = diff(&before, &after);
        assert_eq!(totals.memory_delta_bytes, -50);
        assert_eq!(totals.cpu_usec, 0);
        assert_eq!(totals.disk_read_bytes, 0);
        assert_eq!(totals.disk_write_bytes, 500);
        assert_eq!(totals.disk_read_ops, 0);
        assert_eq!(totals.disk_write_ops, 10);
    }

    #[test]
    fn parses_io_stat_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("io.stat");
        std::fs::write(&path, "8:0 rbytes=2048 wbytes=4096 rios=2 wios=4\n").unwrap();
        let (rb, wb, rio, wio) = read_io_stat(&path).unwrap();
        assert_eq!((rb, wb, rio, wio), (2048, 4096, 2, 4));
    }
}
