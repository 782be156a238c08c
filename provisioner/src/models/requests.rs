// Operator-supplied request models
//
// Everything here is validated before any side effect happens.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{ProvisionError, ProvisionResult};
use crate::utils::validation;

pub const DEFAULT_ADMIN_USERNAME: &str = "admin";

/// Filesystem hardening tier applied after install.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FortificationLevel {
    Min,
    #[default]
    Max,
    Write,
}

impl FortificationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            FortificationLevel::Min => "min",
            FortificationLevel::Max => "max",
            FortificationLevel::Write => "write",
        }
    }
}

impl fmt::Display for FortificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FortificationLevel {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "min" => Ok(FortificationLevel::Min),
            "max" => Ok(FortificationLevel::Max),
            "write" => Ok(FortificationLevel::Write),
            other => Err(ProvisionError::ValidationFailed(format!(
                "Unknown fortification level '{}' (expected min, max or write)",
                other
            ))),
        }
    }
}

/// Where an instance lives: either an absolute filesystem path, or a hostname + URI path pair
/// that the hosting account resolves to a document root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteLocation {
    Path(PathBuf),
    Site { hostname: String, path: String },
}

impl SiteLocation {
    pub fn site(hostname: impl Into<String>, path: impl Into<String>) -> Self {
        SiteLocation::Site {
            hostname: hostname.into(),
            path: path.into(),
        }
    }

    /// Parse the CLI/panel form: a leading `/` means a filesystem path, anything else a hostname.
    pub fn parse(mixed: &str, path: &str) -> Self {
        if mixed.starts_with('/') {
            SiteLocation::Path(PathBuf::from(mixed))
        } else {
            SiteLocation::site(mixed, path)
        }
    }
}

impl fmt::Display for SiteLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SiteLocation::Path(p) => write!(f, "{}", p.display()),
            SiteLocation::Site { hostname, path } => {
                let path = path.trim_matches('/');
                if path.is_empty() {
                    write!(f, "{}", hostname)
                } else {
                    write!(f, "{}/{}", hostname, path)
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct InstallOptions {
    /// Target release; `None` installs the latest catalog entry.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub license_key: Option<String>,
    #[serde(default = "default_admin_username")]
    pub admin_username: String,
    /// Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,
    #[serde(default)]
    pub fortification_level: FortificationLevel,
    #[serde(default = "default_true")]
    pub notify: bool,
}

fn default_admin_username() -> String {
    DEFAULT_ADMIN_USERNAME.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            version: None,
            license_key: None,
            admin_username: default_admin_username(),
            admin_password: None,
            fortification_level: FortificationLevel::default(),
            notify: true,
        }
    }
}

/// Install options after validation; the license key is guaranteed present.
#[derive(Debug, Clone)]
pub struct ValidatedOptions {
    pub version: Option<String>,
    pub license_key: String,
    pub admin_username: String,
    pub admin_password: Option<String>,
    pub fortification_level: FortificationLevel,
    pub notify: bool,
}

impl InstallOptions {
    pub fn validate(&self) -> ProvisionResult<ValidatedOptions> {
        let license_key = self
            .license_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ProvisionError::ValidationFailed("A WHMCS License Key is required.".to_string())
            })?;
        validation::validate_license_key(license_key)
            .map_err(|e| ProvisionError::ValidationFailed(e.to_string()))?;

        let admin_username = self.admin_username.trim();
        if admin_username.is_empty() {
            return Err(ProvisionError::ValidationFailed(
                "A WHMCS Admin Username is required.".to_string(),
            ));
        }
        validation::validate_admin_username(admin_username)
            .map_err(|e| ProvisionError::ValidationFailed(e.to_string()))?;

        if let Some(password) = self.admin_password.as_deref() {
            validation::validate_admin_password(password)
                .map_err(|e| ProvisionError::ValidationFailed(e.to_string()))?;
        }

        let version = match self.version.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(v) => {
                validation::validate_version_string(v)
                    .map_err(|e| ProvisionError::ValidationFailed(e.to_string()))?;
                Some(v.to_string())
            }
        };

        Ok(ValidatedOptions {
            version,
            license_key: license_key.to_string(),
            admin_username: admin_username.to_string(),
            admin_password: self.admin_password.clone(),
            fortification_level: self.fortification_level,
            notify: self.notify,
        })
    }

    /// Copy suitable for persisting: the admin password never leaves the install run.
    pub fn redacted(&self) -> InstallOptions {
        InstallOptions {
            admin_password: None,
            ..self.clone()
        }
    }
}

/// How much the generic teardown removes on uninstall.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UninstallScope {
    #[default]
    All,
    /// Drop database + metadata, keep files on disk.
    KeepFiles,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(license: Option<&str>) -> InstallOptions {
        InstallOptions {
            license_key: license.map(|s| s.to_string()),
            ..InstallOptions::default()
        }
    }

    #[test]
    fn missing_license_key_is_rejected() {
        let err = options(None).validate().unwrap_err();
        assert!(matches!(err, ProvisionError::ValidationFailed(_)));
        assert!(err.to_string().contains("License Key"));
    }

    #[test]
    fn blank_license_key_is_rejected() {
        assert!(options(Some("   ")).validate().is_err());
    }

    #[test]
    fn defaults_apply_admin_and_max_fortification() {
        let validated = options(Some("ABC123")).validate().expect("valid");
        assert_eq!(validated.admin_username, "admin");
        assert_eq!(validated.fortification_level, FortificationLevel::Max);
        assert!(validated.admin_password.is_none());
        assert!(validated.notify);
        assert_eq!(validated.version, None);
    }

    #[test]
    fn deserializes_from_sparse_json() {
        let opts: InstallOptions =
            serde_json::from_str(r#"{"version":"8.10.1","license_key":"ABC123"}"#).unwrap();
        assert_eq!(opts.admin_username, "admin");
        assert_eq!(opts.fortification_level, FortificationLevel::Max);
        let validated = opts.validate().unwrap();
        assert_eq!(validated.version.as_deref(), Some("8.10.1"));
    }

    #[test]
    fn short_supplied_password_is_rejected() {
        let opts = InstallOptions {
            admin_password: Some("short".to_string()),
            ..options(Some("ABC123"))
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn redacted_drops_password_only() {
        let opts = InstallOptions {
            admin_password: Some("correct horse battery".to_string()),
            ..options(Some("ABC123"))
        };
        let redacted = opts.redacted();
        assert!(redacted.admin_password.is_none());
        assert_eq!(redacted.license_key.as_deref(), Some("ABC123"));
    }

    #[test]
    fn fortification_level_parses_case_insensitively() {
        assert_eq!("MIN".parse::<FortificationLevel>().unwrap(), FortificationLevel::Min);
        assert_eq!("write".parse::<FortificationLevel>().unwrap(), FortificationLevel::Write);
        assert!("loose".parse::<FortificationLevel>().is_err());
    }

    #[test]
    fn site_location_parse_distinguishes_paths_from_hostnames() {
        assert_eq!(
            SiteLocation::parse("/var/www/html", ""),
            SiteLocation::Path(PathBuf::from("/var/www/html"))
        );
        assert_eq!(
            SiteLocation::parse("billing.example.com", "/portal"),
            SiteLocation::site("billing.example.com", "/portal")
        );
        assert_eq!(
            SiteLocation::site("example.com", "/portal/").to_string(),
            "example.com/portal"
        );
    }
}
