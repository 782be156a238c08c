// Hosting account seam
//
// The control panel owns hostname -> document root mapping and account identity. The local
// implementation maps `<web_root>/<hostname>/<path>` and reads ownership from the filesystem.

use async_trait::async_trait;
use log::debug;
use std::path::{Path, PathBuf};

use crate::error::{ProvisionError, ProvisionResult};
use crate::models::requests::SiteLocation;
use crate::utils::{path_resolver, validation};

#[async_trait]
pub trait HostingAccount: Send + Sync {
    /// Resolve a hostname + URI path to an absolute document root.
    async fn document_root(&self, hostname: &str, path: &str) -> ProvisionResult<PathBuf>;

    /// Account that owns files under `root`; subprocesses and cron jobs run as this user.
    async fn docroot_owner(&self, root: &Path) -> ProvisionResult<String>;

    /// Hostname + path a document root is served under, for notifications and metadata.
    async fn site_for(&self, root: &Path) -> Option<(String, String)>;

    async fn resolve(&self, location: &SiteLocation) -> ProvisionResult<PathBuf> {
        match location {
            SiteLocation::Path(p) => {
                if !p.is_absolute() {
                    return Err(ProvisionError::PreconditionFailed(format!(
                        "Document root must be an absolute path: {}",
                        p.display()
                    )));
                }
                Ok(p.clone())
            }
            SiteLocation::Site { hostname, path } => self.document_root(hostname, path).await,
        }
    }
}

/// Single-host account rooted at a web directory.
#[derive(Debug, Clone)]
pub struct LocalAccount {
    web_root: PathBuf,
    account: Option<String>,
    passwd_file: PathBuf,
}

impl LocalAccount {
    pub fn new(web_root: impl Into<PathBuf>, account: Option<String>) -> Self {
        Self {
            web_root: web_root.into(),
            account,
            passwd_file: PathBuf::from("/etc/passwd"),
        }
    }

    #[cfg(test)]
    fn with_passwd_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.passwd_file = file.into();
        self
    }

    async fn user_for_uid(&self, uid: u32) -> Option<String> {
        let contents = tokio::fs::read_to_string(&self.passwd_file).await.ok()?;
        lookup_passwd_uid(&contents, uid)
    }
}

/// Find the login name for `uid` in passwd(5) formatted text.
pub fn lookup_passwd_uid(passwd: &str, uid: u32) -> Option<String> {
    passwd.lines().find_map(|line| {
        let mut fields = line.split(':');
        let name = fields.next()?;
        let _password = fields.next()?;
        let line_uid: u32 = fields.next()?.parse().ok()?;
        (line_uid == uid && !name.is_empty()).then(|| name.to_string())
    })
}

fn current_user() -> Option<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .ok()
        .filter(|u| !u.is_empty())
}

#[async_trait]
impl HostingAccount for LocalAccount {
    async fn document_root(&self, hostname: &str, path: &str) -> ProvisionResult<PathBuf> {
        validation::validate_hostname(hostname)
            .map_err(|e| ProvisionError::PreconditionFailed(format!("failed to detect document root for `{}': {}", hostname, e)))?;
        validation::validate_uri_path(path)
            .map_err(|e| ProvisionError::PreconditionFailed(e.to_string()))?;

        let host_dir = self.web_root.join(hostname.trim_end_matches('.').to_ascii_lowercase());
        let root = path_resolver::join_uri_path(&host_dir, path);
        debug!(
            "[PHASE: account] [STEP: resolve] {}{} -> {:?}",
            hostname, path, root
        );
        Ok(root)
    }

    async fn docroot_owner(&self, root: &Path) -> ProvisionResult<String> {
        if let Some(account) = &self.account {
            return Ok(account.clone());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            // Walk up to the nearest existing ancestor (the root may not exist before install).
            let mut probe = Some(root);
            while let Some(p) = probe {
                if let Ok(meta) = tokio::fs::metadata(p).await {
                    if let Some(name) = self.user_for_uid(meta.uid()).await {
                        return Ok(name);
                    }
                    break;
                }
                probe = p.parent();
            }
        }

        current_user().ok_or_else(|| {
            ProvisionError::PreconditionFailed(format!(
                "Unable to determine the account owning {}",
                root.display()
            ))
        })
    }

    async fn site_for(&self, root: &Path) -> Option<(String, String)> {
        let rel = root.strip_prefix(&self.web_root).ok()?;
        let mut comps = rel.components();
        let hostname = comps.next()?.as_os_str().to_string_lossy().to_string();
        let rest: Vec<String> = comps
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        let path = if rest.is_empty() {
            String::new()
        } else {
            format!("/{}", rest.join("/"))
        };
        Some((hostname, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_hostname_and_path_under_web_root() {
        let account = LocalAccount::new("/srv/www", Some("acct".to_string()));
        let root = account
            .resolve(&SiteLocation::site("Billing.Example.com", "/portal/"))
            .await
            .unwrap();
        assert_eq!(root, PathBuf::from("/srv/www/billing.example.com/portal"));
        assert_eq!(
            account.site_for(&root).await,
            Some(("billing.example.com".to_string(), "/portal".to_string()))
        );
    }

    #[tokio::test]
    async fn rejects_bad_hostnames_and_relative_paths() {
        let account = LocalAccount::new("/srv/www", None);
        assert!(account.resolve(&SiteLocation::site("../etc", "")).await.is_err());
        assert!(account
            .resolve(&SiteLocation::Path(PathBuf::from("relative/dir")))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn configured_account_wins() {
        let account = LocalAccount::new("/srv/www", Some("acct".to_string()));
        assert_eq!(account.docroot_owner(Path::new("/nowhere")).await.unwrap(), "acct");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn owner_is_read_from_passwd_by_uid() {
        use std::os::unix::fs::MetadataExt;
        let tmp = tempfile::tempdir().unwrap();
        let uid = std::fs::metadata(tmp.path()).unwrap().uid();
        let passwd = tmp.path().join("passwd");
        std::fs::write(&passwd, format!("siteowner:x:{}:{}::/home/siteowner:/bin/sh\n", uid, uid)).unwrap();

        let account = LocalAccount::new(tmp.path(), None).with_passwd_file(&passwd);
        let owner = account.docroot_owner(&tmp.path().join("not-yet-created")).await.unwrap();
        assert_eq!(owner, "siteowner");
    }

    #[test]
    fn passwd_lookup() {
        let passwd = "root:x:0:0:root:/root:/bin/bash\nwww-data:x:33:33::/var/www:/usr/sbin/nologin\n";
        assert_eq!(lookup_passwd_uid(passwd, 33).as_deref(), Some("www-data"));
        assert_eq!(lookup_passwd_uid(passwd, 1000), None);
    }
}
