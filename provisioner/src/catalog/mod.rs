// Release catalog
//
// Remote JSON listing installable releases, cached process-wide under `whmcs.versions`.
// A failed or unparseable fetch yields an empty catalog that is NOT cached, so the next call
// retries the endpoint.

pub mod cache;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{ProvisionError, ProvisionResult};
use cache::TtlCache;

pub const CATALOG_CACHE_KEY: &str = "whmcs.versions";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub version: String,
    pub download_url: String,
    pub release_notes_url: Option<String>,
}

/// Release version ordered by numeric dotted components (`8.10.1` > `8.9.3`).
///
/// A pre-release suffix (`8.11.0-rc.1`) sorts before the plain release.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version(String);

impl Version {
    pub fn new(v: impl Into<String>) -> Self {
        Version(v.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn parts(&self) -> (Vec<u64>, Option<&str>) {
        let (numeric, suffix) = match self.0.split_once('-') {
            Some((n, s)) => (n, Some(s)),
            None => (self.0.as_str(), None),
        };
        let nums = numeric
            .split('.')
            .map(|p| p.trim().parse::<u64>().unwrap_or(0))
            .collect();
        (nums, suffix)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, a_suffix) = self.parts();
        let (b, b_suffix) = other.parts();
        let len = a.len().max(b.len());
        for i in 0..len {
            let x = a.get(i).copied().unwrap_or(0);
            let y = b.get(i).copied().unwrap_or(0);
            match x.cmp(&y) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        let by_suffix = match (a_suffix, b_suffix) {
            (None, None) => Ordering::Equal,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(y),
        };
        // Keep Ord consistent with Eq for spellings like "8.10" vs "8.10.0".
        by_suffix.then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Releases keyed (uniquely) by version, ascending.
pub type Releases = BTreeMap<Version, Release>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRelease {
    version: String,
    #[serde(default)]
    release_notes_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCatalog {
    Listing {
        #[serde(rename = "latestVersion")]
        latest_version: RawRelease,
        #[serde(rename = "ltsReleases", default)]
        lts_releases: Vec<RawRelease>,
    },
    Flat(RawRelease),
}

pub fn download_url_for(template: &str, version: &str) -> String {
    template.replace("{VERSION}", version)
}

/// Parse either catalog response shape into a release map.
pub fn parse_catalog(body: &str, download_url_template: &str) -> Result<Releases> {
    let raw: RawCatalog =
        serde_json::from_str(body).context("Catalog response is not the expected JSON")?;
    let raws = match raw {
        RawCatalog::Listing {
            latest_version,
            lts_releases,
        } => {
            let mut all = vec![latest_version];
            all.extend(lts_releases);
            all
        }
        RawCatalog::Flat(r) => vec![r],
    };

    let mut releases = Releases::new();
    for r in raws {
        let version = r.version.trim().to_string();
        if version.is_empty() {
            continue;
        }
        releases.insert(
            Version::new(version.clone()),
            Release {
                download_url: download_url_for(download_url_template, &version),
                version,
                release_notes_url: r.release_notes_url.filter(|u| !u.trim().is_empty()),
            },
        );
    }
    if releases.is_empty() {
        anyhow::bail!("Catalog response lists no releases");
    }
    Ok(releases)
}

/// Fetches the raw catalog body.
#[async_trait]
pub trait CatalogFetcher: Send + Sync {
    async fn fetch(&self) -> Result<String>;
}

pub struct HttpCatalogFetcher {
    client: reqwest::Client,
    url: String,
}

impl HttpCatalogFetcher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("whmcs-provisioner/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CatalogFetcher for HttpCatalogFetcher {
    async fn fetch(&self) -> Result<String> {
        let attempt = || async {
            let resp = self.client.get(&self.url).send().await?;
            if !resp.status().is_success() {
                return Err(anyhow::anyhow!("HTTP {}", resp.status()));
            }
            Ok(resp.text().await?)
        };

        let retry_strategy = ExponentialBackoff::from_millis(150)
            .factor(2)
            .max_delay(Duration::from_secs(2))
            .take(3)
            .map(jitter);

        RetryIf::spawn(retry_strategy, attempt, |e: &anyhow::Error| {
            let msg = format!("{:#}", e).to_ascii_lowercase();
            msg.contains("timeout")
                || msg.contains("timed out")
                || msg.contains("connection")
                || msg.contains("http 5")
        })
        .await
        .with_context(|| format!("GET {} failed", self.url))
    }
}

pub struct ReleaseCatalog {
    fetcher: Arc<dyn CatalogFetcher>,
    cache: Arc<TtlCache<Releases>>,
    ttl: Duration,
    download_url_template: String,
}

impl ReleaseCatalog {
    pub fn new(
        fetcher: Arc<dyn CatalogFetcher>,
        cache: Arc<TtlCache<Releases>>,
        ttl: Duration,
        download_url_template: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            cache,
            ttl,
            download_url_template: download_url_template.into(),
        }
    }

    pub async fn get_releases(&self) -> Arc<Releases> {
        if let Some(cached) = self.cache.get(CATALOG_CACHE_KEY).await {
            debug!(
                "[PHASE: catalog] [STEP: cache] hit (releases={})",
                cached.len()
            );
            return cached;
        }

        let parsed = match self.fetcher.fetch().await {
            Ok(body) => parse_catalog(&body, &self.download_url_template),
            Err(e) => Err(e),
        };

        match parsed {
            Ok(releases) => {
                info!(
                    "[PHASE: catalog] [STEP: fetch] Catalog refreshed (releases={}, ttl_secs={})",
                    releases.len(),
                    self.ttl.as_secs()
                );
                self.cache.set(CATALOG_CACHE_KEY, releases, self.ttl).await
            }
            Err(e) => {
                warn!(
                    "[PHASE: catalog] [STEP: fetch] Release catalog unavailable; treating as empty: {:#}",
                    e
                );
                Arc::new(Releases::new())
            }
        }
    }

    pub async fn get_latest(&self) -> ProvisionResult<Release> {
        self.get_releases()
            .await
            .values()
            .next_back()
            .cloned()
            .ok_or_else(|| ProvisionError::VersionNotFound("latest".to_string()))
    }

    /// Version strings, newest first.
    pub async fn get_versions(&self) -> Vec<String> {
        self.get_releases()
            .await
            .keys()
            .rev()
            .map(|v| v.as_str().to_string())
            .collect()
    }

    /// Exact version, or latest when `None`.
    pub async fn resolve(&self, version: Option<&str>) -> ProvisionResult<Release> {
        match version {
            None => self.get_latest().await,
            Some(v) => self
                .get_releases()
                .await
                .get(&Version::new(v))
                .cloned()
                .ok_or_else(|| ProvisionError::VersionNotFound(v.to_string())),
        }
    }
}
