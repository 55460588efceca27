//! Local filesystem test source (§4.4 step 9, §6 on-disk suite layout).
//!
//! Expects a suite root laid out as:
//!
//! ```text
//! <root>/warmup/<stepfile>         // shared pre-run steps, applied once
//! <root>/tests/<name>/setup        // optional; empty step if absent
//! <root>/tests/<name>/test         // required
//! <root>/tests/<name>/cleanup      // optional; empty step if absent
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::model::{Step, Test};

use super::{collect_files, hash_suite_files, step::parse_step_file, TestSource};

/// Reads a suite from an already-materialised directory tree.
pub struct LocalTestSource {
    root: PathBuf,
}

impl LocalTestSource {
    /// Builds a source reading from `root`.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl TestSource for LocalTestSource {
    async fn discover(&self) -> anyhow::Result<Vec<Test>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || discover_sync(&root)).await?
    }
}

fn discover_sync(root: &Path) -> anyhow::Result<Vec<Test>> {
    let suite_hash = hash_suite_files(collect_files(root)?);

    let pre_run = read_pre_run_steps(&root.join("warmup"))?;

    let tests_dir = root.join("tests");
    let mut names: Vec<String> = Vec::new();
    if tests_dir.is_dir() {
        for entry in std::fs::read_dir(&tests_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }
    names.sort();

    let mut tests = Vec::with_capacity(names.len());
    for name in names {
        let dir = tests_dir.join(&name);
        tests.push(Test {
            name,
            suite_hash: suite_hash.clone(),
            pre_run: pre_run.clone(),
            setup: read_step_or_empty(&dir.join("setup"))?,
            test: parse_step_file(&dir.join("test"))?,
            cleanup: read_step_or_empty(&dir.join("cleanup"))?,
        });
    }
    Ok(tests)
}

fn read_pre_run_steps(warmup_dir: &Path) -> anyhow::Result<Vec<Step>> {
    if !warmup_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut entries: Vec<PathBuf> = std::fs::read_dir(warmup_dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    entries.sort();

    let mut steps = Vec::with_capacity(entries.len());
    for path in entries {
        steps.push(parse_step_file(&path)?);
    }
    Ok(steps)
}

fn read_step_or_empty(path: &Path) -> anyhow::Result<Step> {
    if path.is_file() {
        Ok(parse_step_file(path)?)
    } else {
        Ok(Step::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[tokio::test]
    async fn discovers_tests_sorted_with_shared_pre_run() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            &root.join("warmup/001"),
            "{\"method\": \"eth_blockNumber\", \"params\": []}\n",
        );
        write(
            &root.join("tests/bn128/test"),
            "{\"method\": \"engine_newPayloadV3\", \"params\": []}\n",
        );
        write(
            &root.join("tests/bn128/setup"),
            "{\"method\": \"engine_forkchoiceUpdatedV3\", \"params\": []}\n",
        );
        write(
            &root.join("tests/aaa/test"),
            "{\"method\": \"engine_newPayloadV3\", \"params\": []}\n",
        );

        let source = LocalTestSource::new(root.to_path_buf());
        let tests = source.discover().await.unwrap();

        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].name, "aaa");
        assert_eq!(tests[1].name, "bn128");
        assert_eq!(tests[0].pre_run.len(), 1);
        assert_eq!(tests[0].suite_hash, tests[1].suite_hash);
        assert!(tests[1].cleanup.calls.is_empty());
        assert_eq!(tests[1].setup.calls.len(), 1);
    }
}
