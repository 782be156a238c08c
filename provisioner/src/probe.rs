// Installation probe
//
// Detects an installed instance and reads its recorded version.

use anyhow::Context;
use std::io;
use std::path::{Path, PathBuf};

/// File that only exists once the application's vendor tree is in place.
pub const INSTALLED_MARKER: &str = "vendor/whmcs/whmcs-foundation/lib/License.php";

/// Version marker written by the provisioner after a successful install.
pub const VERSION_MARKER: &str = ".whmcs-version";

pub fn version_marker_path(root: &Path) -> PathBuf {
    root.join(VERSION_MARKER)
}

pub async fn is_installed(root: &Path) -> bool {
    tokio::fs::try_exists(root.join(INSTALLED_MARKER))
        .await
        .unwrap_or(false)
}

/// `Ok(None)` when the marker is absent, `Ok(Some(""))` when it is empty, otherwise its first
/// whitespace-delimited token.
pub async fn installed_version(root: &Path) -> anyhow::Result<Option<String>> {
    let marker = version_marker_path(root);
    match tokio::fs::read_to_string(&marker).await {
        Ok(contents) => Ok(Some(
            contents
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string(),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::Error::new(e))
            .with_context(|| format!("Failed to read version marker {:?}", marker)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detects_installed_marker() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!is_installed(tmp.path()).await);
        let marker = tmp.path().join(INSTALLED_MARKER);
        std::fs::create_dir_all(marker.parent().unwrap()).unwrap();
        std::fs::write(&marker, b"<?php").unwrap();
        assert!(is_installed(tmp.path()).await);
    }

    #[tokio::test]
    async fn version_marker_states() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(installed_version(tmp.path()).await.unwrap(), None);

        std::fs::write(version_marker_path(tmp.path()), b"").unwrap();
        assert_eq!(installed_version(tmp.path()).await.unwrap().as_deref(), Some(""));

        std::fs::write(version_marker_path(tmp.path()), b"8.10.1 installed 2026-10-18\n").unwrap();
        assert_eq!(installed_version(tmp.path()).await.unwrap().as_deref(), Some("8.10.1"));
    }

    #[tokio::test]
    async fn unreadable_marker_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        // A directory where the file should be cannot be read as text.
        std::fs::create_dir_all(version_marker_path(tmp.path())).unwrap();
        assert!(installed_version(tmp.path()).await.is_err());
    }
}
