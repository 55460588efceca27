//! Result persistence (C9, §4.7, §3 "Lifecycle and ownership").
//!
//! Every file is written then `chown`ed to the configured `(uid, gid)`
//! override on close, so result trees produced by a root-run container
//! engine end up owned by the invoking user rather than root.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::model::{RunConfig, RunResult};

/// Writes `config.json`/`result.json`/post-test-RPC dumps under one run
/// directory.
pub struct ResultWriter {
    run_dir: PathBuf,
    owner: Option<(u32, u32)>,
}

impl ResultWriter {
    /// Builds a writer rooted at `run_dir`, optionally chown-ing every file
    /// it writes to `owner = (uid, gid)`.
    #[must_use]
    pub fn new(run_dir: PathBuf, owner: Option<(u32, u32)>) -> Self {
        Self { run_dir, owner }
    }

    /// Creates the run directory tree, if it does not already exist.
    pub async fn prepare_run_dir(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.run_dir).await?;
        self.chown(&self.run_dir)?;
        Ok(())
    }

    /// Writes (or overwrites) `config.json`.
    pub async fn write_config(&self, config: &RunConfig) -> anyhow::Result<()> {
        self.write_json(&self.run_dir.join("config.json"), config).await
    }

    /// Writes `result.json`.
    pub async fn write_result(&self, result: &RunResult) -> anyhow::Result<()> {
        self.write_json(&self.run_dir.join("result.json"), result).await
    }

    /// Dumps a post-test RPC call's raw response to
    /// `{testName}/post_test_rpc_calls/{label}.json` (§4.4 step 10).
    pub async fn write_post_test_rpc_dump(
        &self,
        test_name: &str,
        label: &str,
        value: &serde_json::Value,
    ) -> anyhow::Result<()> {
        let dir = self.run_dir.join(test_name).join("post_test_rpc_calls");
        tokio::fs::create_dir_all(&dir).await?;
        self.chown(&dir)?;
        self.write_json(&dir.join(format!("{label}.json")), value).await
    }

    /// Returns the path client logs for `test_name` should be appended to
    /// (`{testName}/client.log`).
    #[must_use]
    pub fn client_log_path(&self, test_name: &str) -> PathBuf {
        self.run_dir.join(test_name).join("client.log")
    }

    async fn write_json(&self, path: &Path, value: &impl Serialize) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(path, bytes).await?;
        self.chown(path)?;
        Ok(())
    }

    fn chown(&self, path: &Path) -> anyhow::Result<()> {
        if let Some((uid, gid)) = self.owner {
            std::os::unix::fs::chown(path, Some(uid), Some(gid))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClientKind, HostInfo, Instance, ResourceLimits, RunId, RunStatus};

    fn sample_config() -> RunConfig {
        RunConfig {
            run_id: RunId("20260101T000000.000-abc".to_string()),
            instance: Instance {
                id: "geth-1".into(),
                client_kind: ClientKind::Geth,
                image: "geth:stable".to_string(),
                entrypoint: None,
                command: None,
                env: Default::default(),
                resource_limits: ResourceLimits::default(),
                rollback: crate::model::RollbackKind::None,
                datadir: None,
                datadir_source: None,
                post_test_rpc_calls: Vec::new(),
                drop_caches: false,
                bootstrap_fcu: false,
            },
            image_digest: None,
            host_info: HostInfo {
                hostname: "host".to_string(),
                kernel: "6.1.0".to_string(),
                arch: "x86_64".to_string(),
                cpu_model: "generic".to_string(),
                cpu_cores: 4,
                cpu_mhz: 3000,
                total_memory_bytes: 16_000_000_000,
            },
            suite_hash: "abc123".to_string(),
            test_count: 0,
            timestamp: chrono::Utc::now(),
            timestamp_end: None,
            status: RunStatus::Running,
            exit_code: None,
            oom_killed: false,
        }
    }

    #[tokio::test]
    async fn writes_config_json_readable_back() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ResultWriter::new(dir.path().to_path_buf(), None);
        writer.prepare_run_dir().await.unwrap();
        writer.write_config(&sample_config()).await.unwrap();

        let contents = tokio::fs::read_to_string(dir.path().join("config.json")).await.unwrap();
        let parsed: RunConfig = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.suite_hash, "abc123");
    }

    #[tokio::test]
    async fn writes_post_test_rpc_dump_under_test_directory() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ResultWriter::new(dir.path().to_path_buf(), None);
        writer
            .write_post_test_rpc_dump("bn128", "trace", &serde_json::json!({"ok": true}))
            .await
            .unwrap();

        let path = dir.path().join("bn128/post_test_rpc_calls/trace.json");
        assert!(path.exists());
    }
}
