//! Orphan cleanup sweep (§6 "Cleanup orphan markers", §8 "Cleanup
//! completeness").
//!
//! A run killed mid-flight (`SIGKILL`, host crash, OOM-killer on the
//! supervisor process itself) leaves host-global state behind that
//! [`crate::supervisor::InstanceSupervisor`]'s own teardown never runs for:
//! the CPU governor settings captured by [`crate::cpugov::apply`] before the
//! run mutated anything. This sweep finds every such leftover state file and
//! puts the host back the way `apply` found it.
//!
//! Containers, networks, and datadir clones/mounts all carry the
//! `benchmarkoor.managed-by` label (§6), but putting those back requires a
//! runtime-side "list resources by label" call that [`crate::runtime::ContainerRuntime`]
//! does not currently expose (only per-ID operations); sweeping those is
//! left for a future pass (see DESIGN.md).

use crate::cpugov;

/// One orphaned run found by [`sweep`].
#[derive(Debug)]
pub struct OrphanedRun {
    /// The run ID the leftover state belongs to.
    pub run_id: String,
    /// Whether the governor state was restored (always true unless
    /// `dry_run` was set).
    pub restored: bool,
}

/// Finds every run ID with a leftover CPU-governor state file and restores
/// its prior settings, unless `dry_run` is set.
pub async fn sweep(dry_run: bool) -> anyhow::Result<Vec<OrphanedRun>> {
    let mut cleaned = Vec::new();
    for run_id in cpugov::list_orphaned_run_ids()? {
        let Some(state) = cpugov::load_state(&run_id)? else {
            continue;
        };

        if dry_run {
            log::info!("would restore orphaned CPU governor state for run {run_id}");
        } else {
            cpugov::restore(&run_id, &state).await?;
            log::info!("restored orphaned CPU governor state for run {run_id}");
        }

        cleaned.push(OrphanedRun {
            run_id,
            restored: !dry_run,
        });
    }
    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sweep_with_no_state_files_returns_empty() {
        let orphans = sweep(true).await.unwrap_or_default();
        assert!(orphans.iter().all(|o| !o.run_id.is_empty()));
    }
}
