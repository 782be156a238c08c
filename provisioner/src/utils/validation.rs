// Input validation utilities
//
// Everything validated here eventually flows into subprocess argv, SQL identifiers, or file
// paths, so the rules are deliberately narrow.

use anyhow::Result;
use regex::Regex;

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| anyhow::anyhow!("Internal error: failed to compile validation regex: {}", e))
}

/// License keys are opaque but must be a single printable token.
pub fn validate_license_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(anyhow::anyhow!("A WHMCS License Key is required."));
    }
    if key.len() > 256 {
        return Err(anyhow::anyhow!(
            "License key cannot exceed 256 characters"
        ));
    }
    if key.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(anyhow::anyhow!(
            "License key contains whitespace or control characters"
        ));
    }
    Ok(())
}

/// Admin usernames: 1-64 chars of letters, digits, `.`, `_`, `@`, `-`.
pub fn validate_admin_username(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow::anyhow!("A WHMCS Admin Username is required."));
    }
    if name.len() > 64 {
        return Err(anyhow::anyhow!(
            "Admin username cannot exceed 64 characters"
        ));
    }
    let re = compile(r"^[A-Za-z0-9._@-]+$")?;
    if !re.is_match(name) {
        return Err(anyhow::anyhow!(
            "Admin username may only contain letters, numbers, '.', '_', '@' and '-'"
        ));
    }
    Ok(())
}

pub fn validate_admin_password(password: &str) -> Result<()> {
    if password.chars().count() < 8 {
        return Err(anyhow::anyhow!(
            "Admin password must be at least 8 characters"
        ));
    }
    if password.chars().any(|c| c.is_control()) {
        return Err(anyhow::anyhow!(
            "Admin password contains control characters"
        ));
    }
    Ok(())
}

/// Dotted numeric release versions, optionally with a suffix (`8.10.1`, `8.11.0-rc.1`).
pub fn validate_version_string(version: &str) -> Result<()> {
    let re = compile(r"^\d+(\.\d+)*(-[A-Za-z0-9.]+)?$")?;
    if !re.is_match(version) {
        return Err(anyhow::anyhow!("Invalid version string: '{}'", version));
    }
    Ok(())
}

/// DNS hostname (labels of letters, digits, hyphens; no leading/trailing hyphen).
pub fn validate_hostname(hostname: &str) -> Result<()> {
    let h = hostname.trim_end_matches('.');
    if h.is_empty() || h.len() > 253 {
        return Err(anyhow::anyhow!("Invalid hostname: '{}'", hostname));
    }
    let label = compile(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$")?;
    if !h.split('.').all(|l| label.is_match(l)) {
        return Err(anyhow::anyhow!("Invalid hostname: '{}'", hostname));
    }
    Ok(())
}

/// URI path under a hostname. No parent traversal, no NUL bytes.
pub fn validate_uri_path(path: &str) -> Result<()> {
    if path.contains('\0') {
        return Err(anyhow::anyhow!("Path cannot contain null bytes"));
    }
    if path.split('/').any(|seg| seg == "..") {
        return Err(anyhow::anyhow!(
            "Path cannot contain parent directory references"
        ));
    }
    Ok(())
}
