//! Command-line surface (§1A "CLI").
//!
//! Argument plumbing and config-file *merging* are out of scope (§1): `run`
//! takes a single JSON document describing the instances and test source to
//! drive, deserialised directly with `serde` rather than layered over
//! defaults/env/flags.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::{
    model::Instance,
    testsource::{EestTestSource, GitTestSource, LocalTestSource, TestSourceSpec},
    upload::{FilesystemUploader, HttpUploader, Uploader},
};

/// `benchmarkoor` — a benchmarking harness for Ethereum execution-layer
/// clients.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level subcommands (§1A).
#[derive(Subcommand)]
pub enum Command {
    /// Runs every configured instance against its test suite, sequentially.
    Run {
        /// Path to a JSON run manifest (see [`RunManifest`]).
        #[arg(short, long)]
        manifest: PathBuf,
        /// Directory under which `runs/<runID>/` trees are written.
        #[arg(short, long, default_value = "results")]
        results_dir: PathBuf,
        /// Scratch space for datadir provisioning and checkpoint exports.
        #[arg(long, default_value = "/tmp/benchmarkoor")]
        tmp_dir: PathBuf,
        /// `uid:gid` to chown result files to after writing.
        #[arg(long)]
        chown: Option<String>,
    },
    /// Regenerates `index.json` from every run under `--results-dir`.
    Index {
        /// Directory containing `runs/<runID>/` trees.
        #[arg(short, long, default_value = "results")]
        results_dir: PathBuf,
        /// Where to write the generated `index.json`.
        #[arg(short, long, default_value = "results/index.json")]
        output: PathBuf,
    },
    /// Regenerates per-suite `stats.json` documents from every run under
    /// `--results-dir`.
    SuiteStats {
        /// Directory containing `runs/<runID>/` trees.
        #[arg(short, long, default_value = "results")]
        results_dir: PathBuf,
        /// Directory under which `suites/<hash>/stats.json` is written.
        #[arg(short, long, default_value = "results/suites")]
        output_dir: PathBuf,
    },
    /// Sweeps for resources left behind by a killed run: CPU-governor state
    /// files, and any container/volume still carrying a `managed-by`
    /// label with no corresponding live run (§6 "Cleanup orphan markers").
    CleanupOrphans {
        /// Only report what would be cleaned up; don't touch anything.
        #[arg(long)]
        dry_run: bool,
    },
}

/// The JSON document a `run` invocation is driven from: one test source
/// shared by every instance, plus the instances themselves.
#[derive(Deserialize)]
pub struct RunManifest {
    /// Where to read the test suite from.
    pub test_source: TestSourceSpec,
    /// The instances to benchmark, run sequentially in listed order (§5
    /// "no cross-instance parallelism by design").
    pub instances: Vec<Instance>,
    /// Optional object-store prefix results are uploaded to after each run.
    pub upload_url: Option<String>,
}

/// Builds the concrete [`TestSource`](crate::testsource::TestSource) for a
/// manifest's `test_source` entry.
pub fn build_test_source(
    spec: &TestSourceSpec,
    checkout_dir: PathBuf,
) -> anyhow::Result<std::sync::Arc<dyn crate::testsource::TestSource>> {
    Ok(match spec {
        TestSourceSpec::Local { path } => std::sync::Arc::new(LocalTestSource::new(path.clone())),
        TestSourceSpec::Git { url, reference, subpath } => {
            std::sync::Arc::new(GitTestSource::new(url.clone(), reference.clone(), subpath.clone(), checkout_dir))
        }
        TestSourceSpec::Eest { archive_url, filter } => {
            std::sync::Arc::new(EestTestSource::new(archive_url.clone(), filter.clone(), checkout_dir))
        }
    })
}

/// Builds the uploader a manifest's `upload_url` selects, if any.
#[must_use]
pub fn build_uploader(upload_url: Option<&str>, results_dir: &std::path::Path) -> Option<std::sync::Arc<dyn Uploader>> {
    match upload_url {
        Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
            Some(std::sync::Arc::new(HttpUploader::new(url.to_string())))
        }
        Some(path) => Some(std::sync::Arc::new(FilesystemUploader::new(PathBuf::from(path)))),
        None => {
            let _ = results_dir;
            None
        }
    }
}

/// Parses a `uid:gid` CLI argument into `(uid, gid)`.
pub fn parse_chown(value: &str) -> anyhow::Result<(u32, u32)> {
    let (uid, gid) = value
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected `uid:gid`, got `{value}`"))?;
    Ok((uid.parse()?, gid.parse()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_chown_spec() {
        assert_eq!(parse_chown("1000:1000").unwrap(), (1000, 1000));
    }

    #[test]
    fn rejects_chown_spec_without_colon() {
        assert!(parse_chown("1000").is_err());
    }

    #[test]
    fn build_uploader_picks_http_for_url_schemes() {
        let dir = tempfile::tempdir().unwrap();
        assert!(build_uploader(Some("https://example.com/results"), dir.path()).is_some());
        assert!(build_uploader(Some(dir.path().to_str().unwrap()), dir.path()).is_some());
        assert!(build_uploader(None, dir.path()).is_none());
    }
}
