// Operation result models (rendered by the CLI as JSON)

use serde::Serialize;
use std::path::PathBuf;

use super::instance::InstanceMeta;
use super::state::ProvisioningState;

// =========================
// Generic wrapper
// =========================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

// =========================
// Install / uninstall
// =========================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallReport {
    pub correlation_id: String,
    pub document_root: PathBuf,
    pub version: String,
    pub admin_username: String,
    pub admin_password: String,
    pub access_url: String,
    pub final_state: ProvisioningState,
    pub states: Vec<ProvisioningState>,
    /// False when the notification step failed or was skipped; the install itself still succeeded.
    pub notified: bool,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallReport {
    pub document_root: PathBuf,
    pub cron_jobs_removed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

// =========================
// Status
// =========================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub document_root: PathBuf,
    pub installed: bool,
    pub version: Option<String>,
    pub latest_version: Option<String>,
    pub upgrade_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<InstanceMeta>,
}
