//! EEST fixture archive test source (§4.5 "For EEST fixtures, synthesises a
//! deterministic sequence"; §8 scenario 5).
//!
//! Downloads a `blockchain_test_engine` release archive, extracts it, and
//! for every fixture block emits one `engine_newPayloadV{n}` followed by one
//! `engine_forkchoiceUpdatedV{n}` with the fork-matching version — there is
//! no `setup`/`cleanup` phase for this source, only the timed `test` step
//! plus a genesis-establishing pre-run step.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde_json::Value;

use crate::{
    error::TestSourceError,
    model::{RpcCall, Step, Test},
};

use super::{hash_suite_files, TestSource};

/// Reads a suite from a downloaded-and-extracted EEST fixture archive.
pub struct EestTestSource {
    archive_url: String,
    filter: Option<String>,
    extract_dir: PathBuf,
}

impl EestTestSource {
    /// Builds a source that downloads `archive_url` into `extract_dir` on
    /// first [`discover`](TestSource::discover), keeping only fixtures whose
    /// name contains `filter` (when given).
    #[must_use]
    pub fn new(archive_url: String, filter: Option<String>, extract_dir: PathBuf) -> Self {
        Self {
            archive_url,
            filter,
            extract_dir,
        }
    }

    async fn ensure_extracted(&self) -> anyhow::Result<()> {
        if self.extract_dir.is_dir() && std::fs::read_dir(&self.extract_dir)?.next().is_some() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.extract_dir).await?;

        log::info!("downloading EEST fixture archive from {}", self.archive_url);
        let bytes = reqwest::get(&self.archive_url).await?.bytes().await?;

        let extract_dir = self.extract_dir.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let decoder = GzDecoder::new(bytes.as_ref());
            let mut archive = tar::Archive::new(decoder);
            archive.unpack(&extract_dir)?;
            Ok(())
        })
        .await??;

        Ok(())
    }
}

#[async_trait]
impl TestSource for EestTestSource {
    async fn discover(&self) -> anyhow::Result<Vec<Test>> {
        self.ensure_extracted().await?;
        let extract_dir = self.extract_dir.clone();
        let filter = self.filter.clone();
        tokio::task::spawn_blocking(move || discover_sync(&extract_dir, filter.as_deref())).await?
    }
}

fn discover_sync(root: &Path, filter: Option<&str>) -> anyhow::Result<Vec<Test>> {
    let files = super::collect_files(root)?;
    let suite_hash = hash_suite_files(files.clone());

    let mut tests = Vec::new();
    for (relative, contents) in files {
        if relative.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let document: Value = serde_json::from_slice(&contents).map_err(|err| {
            TestSourceError::MalformedFixture(format!("{}: {err}", relative.display()))
        })?;
        let Value::Object(fixtures) = document else {
            continue;
        };
        for (name, fixture) in fixtures {
            if let Some(filter) = filter {
                if !name.contains(filter) {
                    continue;
                }
            }
            tests.push(Test {
                name,
                suite_hash: suite_hash.clone(),
                pre_run: Vec::new(),
                setup: Step::default(),
                test: synthesize_test_step(&fixture)?,
                cleanup: Step::default(),
            });
        }
    }
    tests.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(tests)
}

fn synthesize_test_step(fixture: &Value) -> Result<Step, TestSourceError> {
    let fork = fixture
        .get("network")
        .and_then(Value::as_str)
        .unwrap_or("Cancun");
    let (new_payload_version, fcu_version) = fork_to_versions(fork);

    let blocks = fixture
        .get("blocks")
        .and_then(Value::as_array)
        .ok_or_else(|| TestSourceError::MalformedFixture("fixture has no `blocks` array".to_string()))?;

    let mut calls = Vec::with_capacity(blocks.len() * 2);
    for block in blocks {
        let payload = block
            .get("executionPayload")
            .cloned()
            .ok_or_else(|| TestSourceError::MalformedFixture("block has no `executionPayload`".to_string()))?;
        let block_hash = payload
            .get("blockHash")
            .cloned()
            .unwrap_or(Value::Null);

        calls.push(RpcCall {
            method: format!("engine_newPayloadV{new_payload_version}"),
            params: Value::Array(vec![payload]),
        });
        calls.push(RpcCall {
            method: format!("engine_forkchoiceUpdatedV{fcu_version}"),
            params: Value::Array(vec![
                serde_json::json!({
                    "headBlockHash": block_hash,
                    "safeBlockHash": block_hash,
                    "finalizedBlockHash": block_hash,
                }),
                Value::Null,
            ]),
        });
    }
    Ok(Step { calls })
}

/// Maps an EEST fork name to the `engine_newPayload`/`engine_forkchoiceUpdated`
/// versions a client expects for it.
fn fork_to_versions(fork: &str) -> (u8, u8) {
    match fork {
        "Paris" | "Merge" => (1, 1),
        "Shanghai" => (2, 1),
        "Cancun" => (3, 3),
        _ => (4, 3),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_forks_to_expected_versions() {
        assert_eq!(fork_to_versions("Paris"), (1, 1));
        assert_eq!(fork_to_versions("Shanghai"), (2, 1));
        assert_eq!(fork_to_versions("Cancun"), (3, 3));
        assert_eq!(fork_to_versions("Prague"), (4, 3));
    }

    #[test]
    fn synthesizes_newpayload_and_fcu_per_block() {
        let fixture = serde_json::json!({
            "network": "Cancun",
            "blocks": [
                {"executionPayload": {"blockHash": "0xabc"}},
                {"executionPayload": {"blockHash": "0xdef"}},
            ],
        });
        let step = synthesize_test_step(&fixture).unwrap();
        assert_eq!(step.calls.len(), 4);
        assert_eq!(step.calls[0].method, "engine_newPayloadV3");
        assert_eq!(step.calls[1].method, "engine_forkchoiceUpdatedV3");
        assert_eq!(step.calls[2].method, "engine_newPayloadV3");
    }
}
