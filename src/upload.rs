//! Object-storage upload (§4.7 "Uploader contract").
//!
//! Only the `put`/`get`/`list` contract is implemented — the actual S3 wire
//! protocol is explicitly out of scope (§1) — so [`HttpUploader`] is a thin
//! PUT-based client against anything that speaks that contract over HTTP,
//! and [`FilesystemUploader`] lets [`crate::index`] run identically over a
//! local results directory when no object-store prefix is configured.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use futures::{stream, StreamExt};

/// Default bound on concurrent uploads (§4.7 `parallelUploads`, default 50).
pub const DEFAULT_PARALLEL_UPLOADS: usize = 50;

/// The put/get/list contract a result tree is persisted through.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Uploads `bytes` at `key` with the given content type.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> anyhow::Result<()>;

    /// Downloads the object at `key`.
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>>;

    /// Lists every key under `prefix`.
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
}

/// Uploads a batch of `(key, bytes, content_type)` triples with bounded
/// concurrency, logging (not failing the batch on) individual errors —
/// results upload at the end of a run "including on failure, to preserve
/// partial results" (§4.7), so one object failing to upload must not lose
/// the rest.
pub async fn upload_all(
    uploader: Arc<dyn Uploader>,
    objects: Vec<(String, Vec<u8>, String)>,
    parallelism: usize,
) {
    stream::iter(objects)
        .for_each_concurrent(parallelism.max(1), |(key, bytes, content_type)| {
            let uploader = uploader.clone();
            async move {
                if let Err(err) = uploader.put(&key, bytes, &content_type).await {
                    log::warn!("failed to upload {key}: {err:#}");
                }
            }
        })
        .await;
}

/// Uploads over plain HTTP PUT, satisfying the put/get/list contract
/// against a compatible object-storage gateway.
pub struct HttpUploader {
    http: reqwest::Client,
    base_url: String,
}

impl HttpUploader {
    /// Builds an uploader rooted at `base_url` (keys are appended as path
    /// segments).
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), key.trim_start_matches('/'))
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> anyhow::Result<()> {
        let response = self
            .http
            .put(self.url_for(key))
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await?;
        response.error_for_status()?;
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let response = self.http.get(self.url_for(key)).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let response = self
            .http
            .get(self.url_for(&format!("{prefix}?list")))
            .send()
            .await?
            .error_for_status()?;
        let keys: Vec<String> = response.json().await?;
        Ok(keys)
    }
}

/// Uploads to a local directory tree, used when no object-store prefix is
/// configured so runs always have somewhere durable to land.
pub struct FilesystemUploader {
    root: PathBuf,
}

impl FilesystemUploader {
    /// Builds an uploader rooted at `root`.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Uploader for FilesystemUploader {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> anyhow::Result<()> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        Ok(tokio::fs::read(self.root.join(key)).await?)
    }

    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let dir = self.root.join(prefix);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        collect_keys(&self.root, &dir, &mut keys)?;
        Ok(keys)
    }
}

fn collect_keys(root: &std::path::Path, dir: &std::path::Path, out: &mut Vec<String>) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_keys(root, &path, out)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            out.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn filesystem_uploader_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = FilesystemUploader::new(dir.path().to_path_buf());
        uploader
            .put("runs/r1/config.json", b"{}".to_vec(), "application/json")
            .await
            .unwrap();

        let fetched = uploader.get("runs/r1/config.json").await.unwrap();
        assert_eq!(fetched, b"{}".to_vec());

        let keys = uploader.list("runs/r1").await.unwrap();
        assert_eq!(keys, vec!["runs/r1/config.json".to_string()]);
    }

    #[tokio::test]
    async fn upload_all_continues_past_individual_failures() {
        struct FailingUploader;
        #[async_trait]
        impl Uploader for FailingUploader {
            async fn put(&self, key: &str, _bytes: Vec<u8>, _content_type: &str) -> anyhow::Result<()> {
                if key == "bad" {
                    anyhow::bail!("boom");
                }
                Ok(())
            }
            async fn get(&self, _key: &str) -> anyhow::Result<Vec<u8>> {
                unimplemented!()
            }
            async fn list(&self, _prefix: &str) -> anyhow::Result<Vec<String>> {
                unimplemented!()
            }
        }

        let objects = vec![
            ("bad".to_string(), vec![], "text/plain".to_string()),
            ("good".to_string(), vec![], "text/plain".to_string()),
        ];
        upload_all(Arc::new(FailingUploader), objects, 2).await;
    }
}
