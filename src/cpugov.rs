//! CPU governor control (C3, §4.4 step 3, §9 "Global host state").
//!
//! Pins a cpuset, locks CPU frequency, and disables turbo boost for the
//! duration of a run, recording the prior settings to a crash-safe JSON
//! state file *before* mutating anything, so a killed process leaves behind
//! enough information for `cleanup-orphans` to put the host back the way it
//! found it.

use std::{fs, path::PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::labels::cpu_governor_state_dir;

const INTEL_NO_TURBO_PATH: &str = "/sys/devices/system/cpu/intel_pstate/no_turbo";
const CPUFREQ_GLOB: &str = "/sys/devices/system/cpu/cpu*/cpufreq/scaling_governor";

/// Prior host settings captured before [`apply`] mutates anything, so they
/// can be put back by [`restore`] or by a later orphan-cleanup sweep reading
/// the same state file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GovernorState {
    /// Run ID that owns this state file, for orphan-cleanup attribution.
    pub run_id: String,
    /// Per-CPU `scaling_governor` value before we touched it, keyed by CPU
    /// index.
    pub prior_governors: Vec<(u32, String)>,
    /// Contents of `intel_pstate/no_turbo` before we touched it, if present.
    pub prior_no_turbo: Option<String>,
}

fn state_file_path(run_id: &str) -> PathBuf {
    cpu_governor_state_dir().join(format!("{run_id}.json"))
}

/// Pins `cpuset` (if given) and locks the governor/turbo state, persisting
/// the prior settings under `run_id` before making any change.
pub async fn apply(run_id: &str, cpuset: Option<&str>) -> anyhow::Result<GovernorState> {
    let state = capture_prior_state().await?;
    persist_state(run_id, &state)?;

    if let Some(cpuset) = cpuset {
        for cpu in parse_cpuset(cpuset) {
            set_governor(cpu, "performance").await.unwrap_or_else(|err| {
                log::warn!("failed to set governor for cpu{cpu}: {err:#}");
            });
        }
    }

    set_no_turbo(true).await.unwrap_or_else(|err| {
        log::warn!("failed to disable turbo boost: {err:#}");
    });

    Ok(state)
}

/// Restores the settings captured by [`apply`] and removes the state file.
pub async fn restore(run_id: &str, state: &GovernorState) -> anyhow::Result<()> {
    for (cpu, governor) in &state.prior_governors {
        set_governor(*cpu, governor).await.unwrap_or_else(|err| {
            log::warn!("failed to restore governor for cpu{cpu}: {err:#}");
        });
    }
    if let Some(no_turbo) = &state.prior_no_turbo {
        let enabled = no_turbo.trim() == "1";
        set_no_turbo(enabled).await.unwrap_or_else(|err| {
            log::warn!("failed to restore turbo boost state: {err:#}");
        });
    }

    let path = state_file_path(run_id);
    if path.exists() {
        fs::remove_file(&path)?;
    }
    Ok(())
}

/// Reads back a previously persisted state file, for orphan cleanup to
/// reconcile a run whose process was killed before it called [`restore`].
pub fn load_state(run_id: &str) -> anyhow::Result<Option<GovernorState>> {
    let path = state_file_path(run_id);
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&contents)?))
}

/// Lists every CPU-governor state file left on disk, for `cleanup-orphans`.
pub fn list_orphaned_run_ids() -> anyhow::Result<Vec<String>> {
    let dir = cpu_governor_state_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut run_ids = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
            if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                run_ids.push(stem.to_string());
            }
        }
    }
    Ok(run_ids)
}

async fn capture_prior_state() -> anyhow::Result<GovernorState> {
    let mut prior_governors = Vec::new();
    for cpu in discover_cpus() {
        if let Ok(governor) = read_governor(cpu).await {
            prior_governors.push((cpu, governor));
        }
    }
    let prior_no_turbo = tokio::fs::read_to_string(INTEL_NO_TURBO_PATH).await.ok();
    Ok(GovernorState {
        run_id: String::new(),
        prior_governors,
        prior_no_turbo,
    })
}

fn persist_state(run_id: &str, state: &GovernorState) -> anyhow::Result<()> {
    let dir = cpu_governor_state_dir();
    fs::create_dir_all(&dir)?;
    let mut with_run_id = state.clone();
    with_run_id.run_id = run_id.to_string();
    let path = state_file_path(run_id);
    fs::write(&path, serde_json::to_vec_pretty(&with_run_id)?)?;
    Ok(())
}

fn discover_cpus() -> Vec<u32> {
    glob::glob(CPUFREQ_GLOB)
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .filter_map(|path| {
            let name = path.parent()?.parent()?.file_name()?.to_str()?.to_string();
            name.strip_prefix("cpu")?.parse().ok()
        })
        .collect()
}

fn parse_cpuset(cpuset: &str) -> Vec<u32> {
    let mut cpus = Vec::new();
    for part in cpuset.split(',') {
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse::<u32>(), end.parse::<u32>()) {
                cpus.extend(start..=end);
            }
        } else if let Ok(cpu) = part.parse::<u32>() {
            cpus.push(cpu);
        }
    }
    cpus
}

async fn read_governor(cpu: u32) -> anyhow::Result<String> {
    let path = format!("/sys/devices/system/cpu/cpu{cpu}/cpufreq/scaling_governor");
    Ok(tokio::fs::read_to_string(path).await?.trim().to_string())
}

async fn set_governor(cpu: u32, governor: &str) -> anyhow::Result<()> {
    let path = format!("/sys/devices/system/cpu/cpu{cpu}/cpufreq/scaling_governor");
    tokio::fs::write(&path, governor).await?;
    log::debug!("set cpu{cpu} governor to {governor}");
    Ok(())
}

async fn set_no_turbo(disabled: bool) -> anyhow::Result<()> {
    let value = if disabled { "1" } else { "0" };
    if tokio::fs::metadata(INTEL_NO_TURBO_PATH).await.is_ok() {
        tokio::fs::write(INTEL_NO_TURBO_PATH, value).await?;
        return Ok(());
    }
    // AMD hosts expose turbo control via cpupower rather than a sysfs knob.
    let output = Command::new("cpupower")
        .args(["frequency-set", "--turbo-boost", if disabled { "0" } else { "1" }])
        .output()
        .await?;
    if !output.status.success() {
        anyhow::bail!(
            "cpupower frequency-set exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ranges_and_singletons() {
        assert_eq!(parse_cpuset("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpuset("0,2,4"), vec![0, 2, 4]);
        assert_eq!(parse_cpuset("0-1,4"), vec![0, 1, 4]);
    }

    #[test]
    fn empty_cpuset_parses_to_empty() {
        assert!(parse_cpuset("").is_empty());
    }
}
