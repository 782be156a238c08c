// Provisioner configuration
//
// Layering (later wins):
// 1. Built-in defaults (`Settings::default()`)
// 2. TOML file (`--config <file>` or the per-user default config file, if present)
// 3. Environment variables prefixed `WHMCS_PROVISIONER_` (e.g. `WHMCS_PROVISIONER_CATALOG_URL`)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::logging::{mask_database_url, mask_sensitive};
use crate::utils::path_resolver;

pub const ENV_PREFIX: &str = "WHMCS_PROVISIONER";

pub const DEFAULT_CATALOG_URL: &str = "https://download.whmcs.com/assets/scripts/get-downloads.php";
pub const DEFAULT_DOWNLOAD_URL_TEMPLATE: &str =
    "https://s3.amazonaws.com/releases.whmcs.com/v2/pkgs/whmcs-{VERSION}-release.1.zip";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Remote release catalog (JSON).
    pub catalog_url: String,
    /// Release archive URL; `{VERSION}` is substituted.
    pub download_url_template: String,
    pub catalog_ttl_secs: u64,

    /// PHP CLI used for the installer and config extraction; bare names are looked up on PATH.
    pub php_binary: String,
    /// `mysqli.default_socket` passed to PHP during config extraction.
    pub mysql_socket: Option<String>,
    pub installer_timeout_secs: u64,
    pub extraction_timeout_secs: u64,
    pub download_timeout_secs: u64,
    /// Run installer/extraction subprocesses as the docroot owner.
    pub run_as_owner: bool,

    /// Base directory holding one folder per hostname.
    pub web_root: PathBuf,
    /// Owning hosting account; defaults to the invoking user.
    pub account: Option<String>,
    /// Group the web server runs as; fortification re-groups writable paths to it.
    pub web_group_gid: Option<u32>,
    pub metadata_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,

    /// Admin connection used to create per-instance databases.
    pub mysql_admin_url: String,
    /// Host the application itself connects to.
    pub db_host: String,
    /// Account default connection limit (raised to the install floor when lower).
    pub db_connection_limit: u32,

    pub cron_schedule: String,

    pub notify_webhook_url: Option<String>,
    /// Scheme used when building the admin access URL.
    pub access_scheme: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            catalog_url: DEFAULT_CATALOG_URL.to_string(),
            download_url_template: DEFAULT_DOWNLOAD_URL_TEMPLATE.to_string(),
            catalog_ttl_secs: 12 * 60 * 60,
            php_binary: "php".to_string(),
            mysql_socket: None,
            installer_timeout_secs: 600,
            extraction_timeout_secs: 60,
            download_timeout_secs: 300,
            run_as_owner: true,
            web_root: PathBuf::from("/var/www"),
            account: None,
            web_group_gid: None,
            metadata_dir: None,
            log_dir: None,
            mysql_admin_url: "mysql://root@localhost:3306".to_string(),
            db_host: "localhost".to_string(),
            db_connection_limit: 10,
            cron_schedule: crate::cron::MAINTENANCE_SCHEDULE.to_string(),
            notify_webhook_url: None,
            access_scheme: "https".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from defaults, an optional TOML file, and the environment.
    ///
    /// An explicitly passed file must exist; the per-user default file is optional.
    pub fn load(explicit_file: Option<&Path>) -> Result<Settings> {
        let mut builder = config::Config::builder();

        match explicit_file {
            Some(path) => {
                builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
            }
            None => {
                if let Some(default_file) = path_resolver::default_config_file() {
                    builder = builder.add_source(config::File::from(default_file).required(false));
                }
            }
        }

        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        let cfg = builder.build().context("Failed to read provisioner configuration")?;
        let settings: Settings = cfg
            .try_deserialize()
            .context("Invalid provisioner configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.catalog_url)
            .with_context(|| format!("catalog_url is not a valid URL: {}", self.catalog_url))?;
        if !self.download_url_template.contains("{VERSION}") {
            anyhow::bail!("download_url_template must contain {{VERSION}}");
        }
        url::Url::parse(&self.download_url_template.replace("{VERSION}", "0.0.0"))
            .context("download_url_template is not a valid URL")?;
        if let Some(hook) = &self.notify_webhook_url {
            url::Url::parse(hook).context("notify_webhook_url is not a valid URL")?;
        }
        if !matches!(self.access_scheme.as_str(), "http" | "https") {
            anyhow::bail!("access_scheme must be http or https");
        }
        if self.installer_timeout_secs == 0 || self.extraction_timeout_secs == 0 {
            anyhow::bail!("subprocess timeouts must be greater than zero");
        }
        Ok(())
    }

    pub fn catalog_ttl(&self) -> Duration {
        Duration::from_secs(self.catalog_ttl_secs)
    }

    pub fn installer_timeout(&self) -> Duration {
        Duration::from_secs(self.installer_timeout_secs)
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn metadata_folder(&self) -> PathBuf {
        self.metadata_dir
            .clone()
            .unwrap_or_else(path_resolver::default_metadata_folder)
    }

    /// Resolve the PHP binary to an absolute path (PATH lookup for bare names).
    pub fn resolve_php_binary(&self) -> Result<PathBuf> {
        let candidate = Path::new(&self.php_binary);
        if candidate.is_absolute() {
            return Ok(candidate.to_path_buf());
        }
        which::which(&self.php_binary)
            .with_context(|| format!("PHP binary '{}' not found on PATH", self.php_binary))
    }

    /// Effective settings as TOML with credentials masked (for `print-config`).
    pub fn to_masked_toml(&self) -> Result<String> {
        let mut masked = self.clone();
        masked.mysql_admin_url = mask_database_url(&masked.mysql_admin_url);
        masked.notify_webhook_url = masked.notify_webhook_url.as_deref().map(mask_sensitive);
        toml::to_string_pretty(&masked).context("Failed to render settings as TOML")
    }
}
