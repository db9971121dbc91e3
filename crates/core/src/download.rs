//! Artifact downloads into a host staging cache.

use async_trait::async_trait;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::lock::KeyedLocks;
use crate::plan::artifact_file_name;
use crate::retry::{AttemptError, retry_with_backoff};

/// A source of downloadable artifacts.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Make the artifact at `url` available on the host and return its path.
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<PathBuf>;
}

/// Downloads artifacts over HTTP(S) with bounded retries.
///
/// Each URL is staged under `<staging_dir>/<hash>/<file name>` and reused
/// once complete.
pub struct HttpDownloader {
    client: reqwest::Client,
    retry: RetryConfig,
    staging_dir: PathBuf,
    locks: KeyedLocks,
}

impl HttpDownloader {
    /// Create a downloader staging files under `staging_dir`.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when the HTTP client cannot be built.
    pub fn new(retry: RetryConfig, staging_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("kubetools/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(retry.connect_timeout_secs))
            .danger_accept_invalid_certs(retry.accept_invalid_certs)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| Error::configuration(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            retry,
            staging_dir: staging_dir.into(),
            locks: KeyedLocks::new(),
        })
    }

    /// Where the artifact for `url` is staged.
    #[must_use]
    pub fn staging_path(&self, url: &str) -> PathBuf {
        self.staging_dir
            .join(url_key(url))
            .join(artifact_file_name(url))
    }

    async fn attempt(&self, url: &str, part: &Path) -> std::result::Result<usize, AttemptError> {
        let response = self.client.get(url).send().await.map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        let bytes = response.bytes().await.map_err(classify_transport)?;
        tokio::fs::write(part, &bytes)
            .await
            .map_err(|e| AttemptError::Fatal(format!("Failed to write {}: {e}", part.display())))?;
        Ok(bytes.len())
    }
}

#[async_trait]
impl ArtifactSource for HttpDownloader {
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<PathBuf> {
        let dest = self.staging_path(url);
        let _guard = self.locks.lock(&url_key(url)).await;

        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            debug!(%url, path = %dest.display(), "Artifact already staged");
            return Ok(dest);
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }

        let part = dest.with_file_name(format!("{}.part", artifact_file_name(url)));
        info!(%url, "Downloading artifact");
        let size = retry_with_backoff(&self.retry, url, cancel, || self.attempt(url, &part)).await?;

        tokio::fs::rename(&part, &dest)
            .await
            .map_err(|e| Error::io(&dest, e))?;
        debug!(%url, size, path = %dest.display(), "Artifact downloaded");
        Ok(dest)
    }
}

fn url_key(url: &str) -> String {
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    digest[..16].to_string()
}

fn classify_status(status: StatusCode) -> AttemptError {
    let message = format!("HTTP {status}");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AttemptError::Retryable(message)
    } else {
        AttemptError::Fatal(message)
    }
}

fn classify_transport(err: reqwest::Error) -> AttemptError {
    if err.is_builder() {
        AttemptError::Fatal(err.to_string())
    } else {
        AttemptError::Retryable(err.to_string())
    }
}
