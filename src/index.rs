//! Index and suite-stats generation (C10, §4.8).
//!
//! Both operations read straight off a run directory tree (or, via
//! [`crate::upload::Uploader`], an object store laid out identically) and
//! skip any run directory missing `result.json` — a run still mid-flight
//! (§4.8 "skip partially written runs").

use std::{collections::HashMap, path::Path};

use crate::model::{IndexEntry, RunConfig, RunResult, SuiteStats, SuiteStatsEntry, TestStatus};

/// Scans every run under `runs_root`, projecting each into an
/// [`IndexEntry`], sorted by timestamp descending.
pub async fn generate_index(runs_root: &Path) -> anyhow::Result<Vec<IndexEntry>> {
    let mut entries = Vec::new();
    for run_dir in list_run_dirs(runs_root).await? {
        let Some((config, result)) = read_run(&run_dir).await? else {
            continue;
        };
        entries.push(project_entry(&config, &result));
    }
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(entries)
}

/// Scans every run under `runs_root`, grouping per-test execution records
/// by suite hash, sorted descending by `time_ns` within each test.
pub async fn generate_suite_stats(runs_root: &Path) -> anyhow::Result<HashMap<String, SuiteStats>> {
    let mut by_suite: HashMap<String, SuiteStats> = HashMap::new();

    for run_dir in list_run_dirs(runs_root).await? {
        let Some((config, result)) = read_run(&run_dir).await? else {
            continue;
        };
        let suite = by_suite.entry(config.suite_hash.clone()).or_default();
        for record in &result.tests {
            suite.tests.entry(record.dir.clone()).or_default().push(SuiteStatsEntry {
                run_id: config.run_id.clone(),
                time_ns: record.steps.test.aggregated.time_total_ns,
                gas_used_time_ns: record.steps.test.aggregated.gas_used_time_total_ns,
                gas_used_total: record.steps.test.aggregated.gas_used_total,
            });
        }
    }

    for suite in by_suite.values_mut() {
        for entries in suite.tests.values_mut() {
            entries.sort_by(|a, b| b.time_ns.cmp(&a.time_ns));
        }
    }

    Ok(by_suite)
}

async fn list_run_dirs(runs_root: &Path) -> anyhow::Result<Vec<std::path::PathBuf>> {
    if !runs_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    let mut entries = tokio::fs::read_dir(runs_root).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

async fn read_run(run_dir: &Path) -> anyhow::Result<Option<(RunConfig, RunResult)>> {
    let result_path = run_dir.join("result.json");
    if !result_path.is_file() {
        return Ok(None);
    }
    let config: RunConfig = serde_json::from_slice(&tokio::fs::read(run_dir.join("config.json")).await?)?;
    let result: RunResult = serde_json::from_slice(&tokio::fs::read(result_path).await?)?;
    Ok(Some((config, result)))
}

fn project_entry(config: &RunConfig, result: &RunResult) -> IndexEntry {
    let mut tests_passed = 0u64;
    let mut tests_cancelled = 0u64;
    let mut tests_failed = 0u64;
    let mut total_test_time_ns = 0u128;
    let mut total_gas_used = 0u64;

    for record in &result.tests {
        total_test_time_ns += record.steps.test.aggregated.time_total_ns;
        total_gas_used += record.steps.test.aggregated.gas_used_total;
        match record.status {
            TestStatus::Cancelled => tests_cancelled += 1,
            TestStatus::Completed if record.steps.test.aggregated.fail > 0 => tests_failed += 1,
            TestStatus::Completed => tests_passed += 1,
        }
    }

    IndexEntry {
        run_id: config.run_id.clone(),
        timestamp: config.timestamp,
        client_kind: config.instance.client_kind,
        image: config.instance.image.clone(),
        image_sha256: config.image_digest.clone(),
        suite_hash: config.suite_hash.clone(),
        tests_total: result.tests.len() as u64,
        tests_passed,
        tests_cancelled,
        tests_failed,
        total_test_time_ns,
        total_gas_used,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ClientKind, HostInfo, Instance, ResourceLimits, RollbackKind, RunId, RunStatus, TestRecord, TestSteps,
    };

    fn sample_run(run_id: &str, suite_hash: &str, test_time_ns: u128) -> (RunConfig, RunResult) {
        let config = RunConfig {
            run_id: RunId(run_id.to_string()),
            instance: Instance {
                id: "geth-1".into(),
                client_kind: ClientKind::Geth,
                image: "geth:stable".to_string(),
                entrypoint: None,
                command: None,
                env: Default::default(),
                resource_limits: ResourceLimits::default(),
                rollback: RollbackKind::None,
                datadir: None,
                datadir_source: None,
                post_test_rpc_calls: Vec::new(),
                drop_caches: false,
                bootstrap_fcu: false,
            },
            image_digest: Some("sha256:abc".to_string()),
            host_info: HostInfo {
                hostname: "h".to_string(),
                kernel: "6.1.0".to_string(),
                arch: "x86_64".to_string(),
                cpu_model: "generic".to_string(),
                cpu_cores: 4,
                cpu_mhz: 3000,
                total_memory_bytes: 1,
            },
            suite_hash: suite_hash.to_string(),
            test_count: 1,
            timestamp: chrono::Utc::now(),
            timestamp_end: Some(chrono::Utc::now()),
            status: RunStatus::Completed,
            exit_code: Some(0),
            oom_killed: false,
        };

        let mut test_record = TestRecord {
            dir: "t1".to_string(),
            status: TestStatus::Completed,
            steps: TestSteps::default(),
        };
        test_record.steps.test.aggregated.time_total_ns = test_time_ns;

        let result = RunResult {
            tests: vec![test_record],
        };
        (config, result)
    }

    #[tokio::test]
    async fn generate_index_skips_runs_without_result_json() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("incomplete-run")).await.unwrap();
        tokio::fs::write(dir.path().join("incomplete-run/config.json"), b"{}")
            .await
            .unwrap();

        let entries = generate_index(dir.path()).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn generate_index_projects_completed_run() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("run-a");
        tokio::fs::create_dir_all(&run_dir).await.unwrap();
        let (config, result) = sample_run("run-a", "suite1", 1_000_000);
        tokio::fs::write(run_dir.join("config.json"), serde_json::to_vec(&config).unwrap())
            .await
            .unwrap();
        tokio::fs::write(run_dir.join("result.json"), serde_json::to_vec(&result).unwrap())
            .await
            .unwrap();

        let entries = generate_index(dir.path()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tests_total, 1);
        assert_eq!(entries[0].tests_passed, 1);
        assert_eq!(entries[0].total_test_time_ns, 1_000_000);
    }

    #[tokio::test]
    async fn generate_suite_stats_groups_and_sorts_by_time_desc() {
        let dir = tempfile::tempdir().unwrap();
        for (name, time) in [("run-a", 500u128), ("run-b", 1500)] {
            let run_dir = dir.path().join(name);
            tokio::fs::create_dir_all(&run_dir).await.unwrap();
            let (config, result) = sample_run(name, "suite1", time);
            tokio::fs::write(run_dir.join("config.json"), serde_json::to_vec(&config).unwrap())
                .await
                .unwrap();
            tokio::fs::write(run_dir.join("result.json"), serde_json::to_vec(&result).unwrap())
                .await
                .unwrap();
        }

        let stats = generate_suite_stats(dir.path()).await.unwrap();
        let suite = stats.get("suite1").unwrap();
        let entries = suite.tests.get("t1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].time_ns, 1500);
        assert_eq!(entries[1].time_ns, 500);
    }
}
