//! Snapshot document storage.

use crate::config::{Blob, Config};
use crate::error::ApiError;
use crate::http::{send, with_retry, RetryPolicy};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::debug;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()>;
    async fn get(&self, path: &str) -> Result<Vec<u8>>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
}

pub fn open(cfg: &Config) -> Result<Arc<dyn BlobStore>> {
    match &cfg.blob {
        Blob::Fs { root } => Ok(Arc::new(FsBlobStore::new(root))),
        Blob::Http {
            base_url,
            bucket,
            token,
        } => Ok(Arc::new(HttpBlobStore::new(
            base_url,
            bucket,
            token,
            cfg.request_timeout(),
            RetryPolicy::from_config(&cfg.platform),
        )?)),
    }
}

/// Stores blobs as files under a root directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a relative blob path, refusing anything that escapes the root.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        if path.is_empty() || rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            bail!("invalid blob path {path:?}");
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Write then rename so readers never observe a partial document.
        let tmp = target.with_extension("partial");
        fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &target).await?;
        debug!(path, size = bytes.len(), "blob stored");
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve(path)?;
        fs::read(&target)
            .await
            .with_context(|| format!("failed to read {}", target.display()))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let target = self.resolve(path)?;
        Ok(fs::try_exists(&target).await?)
    }
}

/// Stores blobs in a bucket of an HTTP object storage service.
#[derive(Clone)]
pub struct HttpBlobStore {
    http: Client,
    base: Url,
    bucket: String,
    token: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl fmt::Debug for HttpBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpBlobStore")
            .field("base", &self.base)
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl HttpBlobStore {
    pub fn new(base_url: &str, bucket: &str, token: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let raw = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let http = Client::builder()
            .user_agent("snapshot-relay/0.1")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base: Url::parse(&raw).context("invalid blob.base_url")?,
            bucket: bucket.to_string(),
            token: token.to_string(),
            timeout,
            retry,
        })
    }

    fn object_url(&self, path: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("invalid blob path {path:?}: base cannot hold a path"))?
            .pop_if_empty()
            .push("object")
            .push(&self.bucket)
            .extend(path.split('/').filter(|s| !s.is_empty()));
        Ok(url)
    }

    async fn call(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<reqwest::Response, ApiError> {
        let url = self
            .object_url(path)
            .map_err(|e| ApiError::new(crate::error::ApiErrorKind::Client(400), e.to_string()))?;
        let timeout = self.timeout;
        with_retry(&self.retry, "blob", || {
            let mut req = self
                .http
                .request(method.clone(), url.clone())
                .bearer_auth(&self.token);
            if let Some(bytes) = &body {
                req = req
                    .header("Content-Type", "application/json")
                    .header("x-upsert", "true")
                    .body(bytes.clone());
            }
            async move { send(req, timeout, "blob").await }
        })
        .await
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        self.call(Method::POST, path, Some(bytes)).await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let response = self.call(Method::GET, path, None).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match self.call(Method::DELETE, path, None).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.call(Method::HEAD, path, None).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
