use anyhow::Result;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "whmcs-provisioner";

/// Base folder for provisioner-owned state (metadata, logs).
///
/// Prefers the XDG data dir; falls back to the current working directory.
pub fn resolve_data_folder() -> PathBuf {
    if let Some(dir) = dirs::data_local_dir() {
        return dir.join(APP_DIR);
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(APP_DIR)
}

/// Resolve log folder (absolute path), creating it if needed.
pub fn resolve_log_folder(configured: Option<&Path>) -> Result<PathBuf> {
    let log_dir = match configured {
        Some(p) => p.to_path_buf(),
        None => resolve_data_folder().join("logs"),
    };
    std::fs::create_dir_all(&log_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create log folder {:?}: {}", log_dir, e))?;
    Ok(log_dir)
}

/// Default location of the instance metadata store.
pub fn default_metadata_folder() -> PathBuf {
    resolve_data_folder().join("instances")
}

/// Default config file consulted when `--config` is not given.
pub fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR).join("config.toml"))
}

/// Join a URI path (e.g. `/portal/`) under a base directory without allowing it to escape.
pub fn join_uri_path(base: &Path, uri_path: &str) -> PathBuf {
    let mut out = base.to_path_buf();
    for seg in uri_path.split('/') {
        if seg.is_empty() || seg == "." || seg == ".." {
            continue;
        }
        out.push(seg);
    }
    out
}
