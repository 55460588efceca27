//! Test suite discovery (C5, §3 "Test"/"Step", §4.4 step 9, §6).
//!
//! A [`TestSource`] produces the ordered list of [`Test`]s a run should
//! execute, each carrying its suite hash — identical sets of suite files
//! hash identically regardless of where they were fetched from (§8
//! "Suite-hash stability"), which is why hashing lives here rather than in
//! each individual backend.

pub mod eest;
pub mod git;
pub mod local;
pub mod step;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::model::Test;

/// Where a run's test suite should be read from.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestSourceSpec {
    /// A directory already present on the local filesystem.
    Local {
        /// Root of the suite tree.
        path: PathBuf,
    },
    /// A git repository to clone, then read as a [`TestSourceSpec::Local`]
    /// tree.
    Git {
        /// Repository URL.
        url: String,
        /// Branch, tag, or commit to check out.
        reference: String,
        /// Subdirectory within the clone containing the suite, if not the
        /// repository root.
        subpath: Option<PathBuf>,
    },
    /// An EEST fixture release archive to download and extract.
    Eest {
        /// URL of the `.tar.gz` fixture archive.
        archive_url: String,
        /// Only fixtures whose name contains this substring are included.
        filter: Option<String>,
    },
}

/// Produces the ordered test list for a run.
#[async_trait]
pub trait TestSource: Send + Sync {
    /// Discovers every test in the suite, in execution order.
    async fn discover(&self) -> anyhow::Result<Vec<Test>>;
}

/// Builds a content hash over a suite's files: sorted by relative path so
/// the result only depends on file names and contents, never on traversal
/// order or absolute location (§8 "Suite-hash stability").
#[must_use]
pub fn hash_suite_files(mut files: Vec<(PathBuf, Vec<u8>)>) -> String {
    files.sort_by(|a, b| a.0.cmp(&b.0));
    let mut hasher = Sha256::new();
    for (path, contents) in &files {
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(contents);
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Recursively collects `(relative_path, contents)` for every regular file
/// under `root`, for hashing or archival.
pub(crate) fn collect_files(root: &Path) -> std::io::Result<Vec<(PathBuf, Vec<u8>)>> {
    let mut out = Vec::new();
    collect_files_into(root, root, &mut out)?;
    Ok(out)
}

fn collect_files_into(root: &Path, dir: &Path, out: &mut Vec<(PathBuf, Vec<u8>)>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files_into(root, &path, out)?;
        } else {
            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            out.push((relative, std::fs::read(&path)?));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_order_independent() {
        let a = vec![
            (PathBuf::from("b"), b"two".to_vec()),
            (PathBuf::from("a"), b"one".to_vec()),
        ];
        let b = vec![
            (PathBuf::from("a"), b"one".to_vec()),
            (PathBuf::from("b"), b"two".to_vec()),
        ];
        assert_eq!(hash_suite_files(a), hash_suite_files(b));
    }

    #[test]
    fn hash_changes_with_content() {
        let a = vec![(PathBuf::from("a"), b"one".to_vec())];
        let b = vec![(PathBuf::from("a"), b"two".to_vec())];
        assert_ne!(hash_suite_files(a), hash_suite_files(b));
    }
}
