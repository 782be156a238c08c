// Installed-instance models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use super::requests::{FortificationLevel, InstallOptions};
use crate::utils::logging::mask_sensitive;

/// Application type recorded in instance metadata.
pub const APP_TYPE: &str = "whmcs";

/// Credentials for one instance's isolated database.
///
/// Owned by a single install attempt; the database behind them is dropped only on uninstall.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseCredentials {
    pub host: String,
    pub username: String,
    pub password: String,
    pub database: String,
    pub connection_limit: u32,
    /// Table prefix reported by the installed configuration (always empty for WHMCS).
    #[serde(default)]
    pub prefix: String,
}

impl fmt::Debug for DatabaseCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseCredentials")
            .field("host", &self.host)
            .field("username", &mask_sensitive(&self.username))
            .field("password", &"***")
            .field("database", &self.database)
            .field("connection_limit", &self.connection_limit)
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// One installed copy of the application at a document root.
#[derive(Debug, Clone)]
pub struct InstalledInstance {
    pub document_root: PathBuf,
    pub version: Option<String>,
    pub database_credentials: Option<DatabaseCredentials>,
    pub fortification_level: FortificationLevel,
}

/// Persisted per-document-root metadata, read back by status/upgrade logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceMeta {
    #[serde(rename = "type")]
    pub app_type: String,
    pub version: Option<String>,
    pub hostname: String,
    pub path: String,
    pub install_options: InstallOptions,
    pub fortification: FortificationLevel,
    pub installed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}
