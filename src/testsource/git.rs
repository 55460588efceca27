//! Git-backed test source: clones a repository once, then delegates to
//! [`LocalTestSource`] over the (optionally nested) checkout.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use crate::model::Test;

use super::{local::LocalTestSource, TestSource};

/// Clones `url` at `reference` into `checkout_dir` on first [`discover`],
/// then reads the suite from `checkout_dir/subpath`.
///
/// [`discover`]: TestSource::discover
pub struct GitTestSource {
    url: String,
    reference: String,
    subpath: Option<PathBuf>,
    checkout_dir: PathBuf,
}

impl GitTestSource {
    /// Builds a source that will clone `url` into `checkout_dir`.
    #[must_use]
    pub fn new(url: String, reference: String, subpath: Option<PathBuf>, checkout_dir: PathBuf) -> Self {
        Self {
            url,
            reference,
            subpath,
            checkout_dir,
        }
    }

    async fn ensure_checkout(&self) -> anyhow::Result<PathBuf> {
        if !self.checkout_dir.join(".git").exists() {
            tokio::fs::create_dir_all(&self.checkout_dir).await?;
            let output = Command::new("git")
                .args([
                    "clone",
                    "--depth",
                    "1",
                    "--branch",
                    &self.reference,
                    &self.url,
                ])
                .arg(&self.checkout_dir)
                .output()
                .await?;
            if !output.status.success() {
                anyhow::bail!(
                    "git clone {} ({}) failed: {}",
                    self.url,
                    self.reference,
                    String::from_utf8_lossy(&output.stderr)
                );
            }
            log::info!("cloned {} at {} into {}", self.url, self.reference, self.checkout_dir.display());
        }
        Ok(match &self.subpath {
            Some(subpath) => self.checkout_dir.join(subpath),
            None => self.checkout_dir.clone(),
        })
    }
}

#[async_trait]
impl TestSource for GitTestSource {
    async fn discover(&self) -> anyhow::Result<Vec<Test>> {
        let root = self.ensure_checkout().await?;
        LocalTestSource::new(root).discover().await
    }
}
