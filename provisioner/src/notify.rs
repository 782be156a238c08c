// Installed-notification delivery
//
// Rendering the operator-facing message is the panel's job; this module only hands over the
// event. Delivery failures never undo an install.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use serde::Serialize;
use tokio::time::Duration;

use crate::utils::logging::mask_sensitive;

/// Admin panel path under the install URL.
pub const ADMIN_PATH: &str = "/admin";

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledNotification {
    pub app_name: String,
    pub hostname: String,
    pub path: String,
    pub admin_username: String,
    pub admin_password: String,
    pub access_url: String,
    pub fortification: String,
}

impl std::fmt::Debug for InstalledNotification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstalledNotification")
            .field("hostname", &self.hostname)
            .field("path", &self.path)
            .field("admin_username", &self.admin_username)
            .field("admin_password", &"***")
            .field("access_url", &self.access_url)
            .finish()
    }
}

/// `https://billing.example.com/portal/admin`
pub fn access_url(scheme: &str, hostname: &str, path: &str) -> String {
    let path = path.trim_matches('/');
    if path.is_empty() {
        format!("{}://{}{}", scheme, hostname, ADMIN_PATH)
    } else {
        format!("{}://{}/{}{}", scheme, hostname, path, ADMIN_PATH)
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_installed(&self, event: &InstalledNotification) -> Result<()>;
}

/// Writes the event to the log with the password masked.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_installed(&self, event: &InstalledNotification) -> Result<()> {
        info!(
            "[PHASE: notify] [STEP: log] {} installed on {}{} (admin={}, password={}, url={})",
            event.app_name,
            event.hostname,
            event.path,
            event.admin_username,
            mask_sensitive(&event.admin_password),
            event.access_url
        );
        Ok(())
    }
}

/// POSTs the event as JSON to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(12))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_installed(&self, event: &InstalledNotification) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .context("notification webhook request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("notification webhook returned HTTP {}", resp.status());
        }
        info!(
            "[PHASE: notify] [STEP: webhook] Delivered installed notification for {}",
            event.hostname
        );
        Ok(())
    }
}
