// Release archive download

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::time::Duration;

use super::files;

/// Fetches a release archive and unpacks it into a document root.
#[async_trait]
pub trait ArchiveDownloader: Send + Sync {
    /// Returns the number of files written under `dest`.
    async fn fetch_and_unpack(&self, url: &str, dest: &Path) -> Result<usize>;
}

pub struct HttpArchiveDownloader {
    client: reqwest::Client,
    scratch_dir: PathBuf,
}

impl HttpArchiveDownloader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("whmcs-provisioner/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            scratch_dir: std::env::temp_dir(),
        })
    }

    async fn download_to(&self, url: &str, target: &Path) -> Result<u64> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;
        if !resp.status().is_success() {
            anyhow::bail!("GET {} returned HTTP {}", url, resp.status());
        }

        let mut out = tokio::fs::File::create(target)
            .await
            .with_context(|| format!("create failed: {:?}", target))?;
        let mut total: u64 = 0;
        while let Some(chunk) = resp.chunk().await.context("download interrupted")? {
            out.write_all(&chunk).await?;
            total = total.saturating_add(chunk.len() as u64);
        }
        out.flush().await?;
        Ok(total)
    }
}

#[async_trait]
impl ArchiveDownloader for HttpArchiveDownloader {
    async fn fetch_and_unpack(&self, url: &str, dest: &Path) -> Result<usize> {
        let started = Instant::now();
        let scratch = self
            .scratch_dir
            .join(format!("whmcs-release-{}.zip", uuid::Uuid::new_v4()));
        info!(
            "[PHASE: install] [STEP: download] Downloading release (url={}, dest={:?})",
            url, dest
        );

        let result = async {
            let bytes = self.download_to(url, &scratch).await?;
            info!(
                "[PHASE: install] [STEP: download] Archive fetched (bytes={}, duration_ms={})",
                bytes,
                started.elapsed().as_millis()
            );
            files::unpack_zip(&scratch, dest).await
        }
        .await;

        if let Err(e) = tokio::fs::remove_file(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "[PHASE: install] [STEP: download] Failed to remove scratch archive {:?}: {}",
                    scratch, e
                );
            }
        }
        result
    }
}
