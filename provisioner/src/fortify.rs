// Fortification
//
// Files become 0644 and directories 0755. Paths in the level's writable set (recursively) are
// group-writable (0664/0775) and, when a web group is configured, re-grouped to it. `write`
// opens the whole tree. The configuration file holds the database password and is never
// world-readable at any level (0640, or 0660 under `write`). Symlinks are never followed or
// modified.

use log::info;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::{ProvisionError, ProvisionResult};
use crate::extractor::CONFIG_FILE;
use crate::installation::files::{self, EntryKind};
use crate::models::requests::FortificationLevel;

const FILE_MODE: u32 = 0o644;
const DIR_MODE: u32 = 0o755;
const WRITABLE_FILE_MODE: u32 = 0o664;
const WRITABLE_DIR_MODE: u32 = 0o775;
const SECRET_FILE_MODE: u32 = 0o640;
const WRITABLE_SECRET_FILE_MODE: u32 = 0o660;

const MIN_WRITABLE: &[&str] = &["attachments", "downloads", "templates_c", ".htaccess"];
const MAX_WRITABLE: &[&str] = &["attachments", "downloads", "templates_c"];

/// Paths (relative to the document root) left writable by the web server. `None` means all.
pub fn writable_exceptions(level: FortificationLevel) -> Option<&'static [&'static str]> {
    match level {
        FortificationLevel::Min => Some(MIN_WRITABLE),
        FortificationLevel::Max => Some(MAX_WRITABLE),
        FortificationLevel::Write => None,
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FortifyReport {
    pub level: Option<FortificationLevel>,
    pub files: usize,
    pub directories: usize,
    pub writable: usize,
    pub symlinks_skipped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FortificationPolicy {
    web_group_gid: Option<u32>,
}

impl FortificationPolicy {
    pub fn new(web_group_gid: Option<u32>) -> Self {
        Self { web_group_gid }
    }

    pub async fn apply(&self, root: &Path, level: FortificationLevel) -> ProvisionResult<FortifyReport> {
        let exceptions: Option<Vec<PathBuf>> =
            writable_exceptions(level).map(|list| list.iter().map(|p| root.join(p)).collect());

        let secret = root.join(CONFIG_FILE);

        let entries = files::walk_tree(root)
            .await
            .map_err(|e| ProvisionError::FortificationFailed(format!("{:#}", e)))?;

        let mut report = FortifyReport {
            level: Some(level),
            ..FortifyReport::default()
        };
        for entry in entries {
            let writable = match &exceptions {
                None => true,
                Some(list) => list.iter().any(|exc| entry.path.starts_with(exc)),
            };
            let is_secret = entry.kind == EntryKind::File && entry.path == secret;
            let mode = match (entry.kind, writable) {
                (EntryKind::Symlink, _) => {
                    report.symlinks_skipped += 1;
                    continue;
                }
                (EntryKind::Dir, false) => DIR_MODE,
                (EntryKind::Dir, true) => WRITABLE_DIR_MODE,
                (EntryKind::File, false) if is_secret => SECRET_FILE_MODE,
                (EntryKind::File, true) if is_secret => WRITABLE_SECRET_FILE_MODE,
                (EntryKind::File, false) => FILE_MODE,
                (EntryKind::File, true) => WRITABLE_FILE_MODE,
            };
            self.set_mode(&entry.path, mode).await?;
            // The web server reads the configuration through its group.
            if is_secret && !writable {
                self.regroup(&entry.path)?;
            }
            if writable {
                self.regroup(&entry.path)?;
                report.writable += 1;
            }
            match entry.kind {
                EntryKind::Dir => report.directories += 1,
                _ => report.files += 1,
            }
        }

        info!(
            "[PHASE: fortify] [STEP: apply] Applied {} to {:?} (files={}, dirs={}, writable={}, symlinks_skipped={})",
            level, root, report.files, report.directories, report.writable, report.symlinks_skipped
        );
        Ok(report)
    }

    async fn set_mode(&self, path: &Path, mode: u32) -> ProvisionResult<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(|e| {
                    ProvisionError::FortificationFailed(format!("chmod {:o} {:?}: {}", mode, path, e))
                })?;
        }
        #[cfg(not(unix))]
        {
            let _ = (path, mode);
        }
        Ok(())
    }

    fn regroup(&self, path: &Path) -> ProvisionResult<()> {
        let Some(gid) = self.web_group_gid else {
            return Ok(());
        };
        #[cfg(unix)]
        {
            std::os::unix::fs::lchown(path, None, Some(gid)).map_err(|e| {
                ProvisionError::FortificationFailed(format!("chgrp {} {:?}: {}", gid, path, e))
            })?;
        }
        #[cfg(not(unix))]
        {
            log::warn!(
                "[PHASE: fortify] [STEP: chgrp] Group ownership is not supported here (gid={}, path={:?})",
                gid, path
            );
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    fn mode(path: &Path) -> u32 {
        std::fs::symlink_metadata(path).unwrap().permissions().mode() & 0o777
    }

    fn site() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        for dir in ["attachments/sub", "templates_c", "admin", "vendor/whmcs"] {
            std::fs::create_dir_all(root.join(dir)).unwrap();
        }
        for file in ["index.php", ".htaccess", "attachments/sub/a.txt", "admin/index.php"] {
            std::fs::write(root.join(file), b"x").unwrap();
        }
        tmp
    }

    #[tokio::test]
    async fn max_leaves_only_exception_dirs_writable() {
        let tmp = site();
        let root = tmp.path();
        std::fs::set_permissions(root.join("index.php"), std::fs::Permissions::from_mode(0o666)).unwrap();

        FortificationPolicy::new(None).apply(root, FortificationLevel::Max).await.unwrap();

        assert_eq!(mode(&root.join("index.php")), 0o644);
        assert_eq!(mode(&root.join(".htaccess")), 0o644);
        assert_eq!(mode(&root.join("admin")), 0o755);
        assert_eq!(mode(&root.join("attachments")), 0o775);
        assert_eq!(mode(&root.join("attachments/sub")), 0o775);
        assert_eq!(mode(&root.join("attachments/sub/a.txt")), 0o664);
        assert_eq!(mode(&root.join("templates_c")), 0o775);
    }

    #[tokio::test]
    async fn min_also_opens_htaccess_and_skips_missing_paths() {
        let tmp = site();
        let root = tmp.path();
        // `downloads` does not exist; it is simply skipped.
        FortificationPolicy::new(None).apply(root, FortificationLevel::Min).await.unwrap();
        assert_eq!(mode(&root.join(".htaccess")), 0o664);
        assert_eq!(mode(&root.join("index.php")), 0o644);
        assert!(!root.join("downloads").exists());
    }

    #[tokio::test]
    async fn write_opens_everything() {
        let tmp = site();
        let root = tmp.path();
        let report = FortificationPolicy::new(None)
            .apply(root, FortificationLevel::Write)
            .await
            .unwrap();
        assert_eq!(mode(&root.join("admin/index.php")), 0o664);
        assert_eq!(mode(&root.join("vendor/whmcs")), 0o775);
        assert_eq!(report.writable, report.files + report.directories);
    }

    #[tokio::test]
    async fn symlinks_are_not_followed() {
        let tmp = site();
        let root = tmp.path().join("site");
        std::fs::create_dir_all(&root).unwrap();
        let outside = tmp.path().join("outside.txt");
        std::fs::write(&outside, b"x").unwrap();
        std::fs::set_permissions(&outside, std::fs::Permissions::from_mode(0o600)).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("templates_c")).unwrap();

        let report = FortificationPolicy::new(None)
            .apply(&root, FortificationLevel::Write)
            .await
            .unwrap();
        assert_eq!(report.symlinks_skipped, 1);
        assert_eq!(mode(&outside), 0o600);
    }

    #[tokio::test]
    async fn regroups_writable_paths_to_own_group() {
        let tmp = site();
        let root = tmp.path();
        // Re-grouping to our own primary group is always permitted.
        let gid = std::fs::metadata(root).unwrap().gid();
        FortificationPolicy::new(Some(gid))
            .apply(root, FortificationLevel::Max)
            .await
            .unwrap();
        assert_eq!(std::fs::metadata(root.join("templates_c")).unwrap().gid(), gid);
    }

    #[tokio::test]
    async fn configuration_file_is_never_world_readable() {
        for level in [FortificationLevel::Max, FortificationLevel::Min, FortificationLevel::Write] {
            let tmp = site();
            let root = tmp.path();
            let config = root.join(CONFIG_FILE);
            std::fs::write(&config, b"<?php $db_password = 's3cret';").unwrap();
            std::fs::set_permissions(&config, std::fs::Permissions::from_mode(0o600)).unwrap();

            FortificationPolicy::new(None).apply(root, level).await.unwrap();

            let m = mode(&config);
            assert_eq!(m & 0o004, 0, "{} left configuration.php at {:o}", level, m);
            assert_eq!(m & 0o400, 0o400);
        }
        let tmp = site();
        std::fs::write(tmp.path().join(CONFIG_FILE), b"<?php").unwrap();
        FortificationPolicy::new(None)
            .apply(tmp.path(), FortificationLevel::Max)
            .await
            .unwrap();
        assert_eq!(mode(&tmp.path().join(CONFIG_FILE)), 0o640);
    }

    #[tokio::test]
    async fn missing_root_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let err = FortificationPolicy::new(None)
            .apply(&tmp.path().join("absent"), FortificationLevel::Max)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::FortificationFailed(_)));
    }
}
