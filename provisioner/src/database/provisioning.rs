// MySQL naming + statement generation for per-instance databases
//
// Key design decisions:
// - Names are derived deterministically from the account and document root, so re-running an
//   install reuses the same database and user
// - DDL cannot be parameterized in MySQL; identifiers are backtick-quoted, string literals are
//   escaped, and names are validated before any statement is built
// - Every statement is idempotent (IF [NOT] EXISTS, ALTER USER to reset the password)

use regex::Regex;
use std::path::Path;

use crate::security::crypto;

/// MySQL identifier length limits.
pub const MAX_DB_NAME_LEN: usize = 64;
pub const MAX_DB_USER_LEN: usize = 32;

// =============================================================================
// Validation
// =============================================================================

fn name_pattern() -> Result<Regex, String> {
    Regex::new(r"^[A-Za-z0-9_]+$").map_err(|e| format!("Internal error: {}", e))
}

/// Validate database name (letters, numbers, underscore only; 1-64 chars)
pub fn validate_db_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Database name is required.".to_string());
    }
    if name.len() > MAX_DB_NAME_LEN {
        return Err(format!(
            "Database name must be {} characters or fewer.",
            MAX_DB_NAME_LEN
        ));
    }
    if !name_pattern()?.is_match(name) {
        return Err(
            "Database name may only contain letters, numbers, and underscores.".to_string(),
        );
    }
    let reserved = ["mysql", "information_schema", "performance_schema", "sys"];
    if reserved.iter().any(|r| r.eq_ignore_ascii_case(name)) {
        return Err(format!("'{}' is a reserved database name.", name));
    }
    Ok(())
}

/// Validate database user name (letters, numbers, underscore only; 1-32 chars)
pub fn validate_db_user(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Database user is required.".to_string());
    }
    if name.len() > MAX_DB_USER_LEN {
        return Err(format!(
            "Database user must be {} characters or fewer.",
            MAX_DB_USER_LEN
        ));
    }
    if !name_pattern()?.is_match(name) {
        return Err("Database user may only contain letters, numbers, and underscores.".to_string());
    }
    if name.eq_ignore_ascii_case("root") {
        return Err("'root' is a reserved database user.".to_string());
    }
    Ok(())
}

// =============================================================================
// Naming
// =============================================================================

fn sanitize(fragment: &str) -> String {
    fragment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

fn bounded(prefix: &str, hint: &str, suffix: &str, max: usize) -> String {
    // prefix_hint_suffix, shrinking the hint first.
    let fixed = prefix.len() + suffix.len() + 2;
    let room = max.saturating_sub(fixed);
    let hint: String = hint.chars().take(room).collect();
    let hint = hint.trim_end_matches('_');
    let joined = if hint.is_empty() {
        format!("{}_{}", prefix, suffix)
    } else {
        format!("{}_{}_{}", prefix, hint, suffix)
    };
    joined.chars().take(max).collect()
}

/// Database and user names for the instance at `root` owned by `account`.
///
/// `billing.example.com` at `/var/www/billing.example.com` for account `acct` becomes
/// `acct_billing_example_com_<hash6>` (database) and a shorter user name with the same hash.
pub fn names_for(account: &str, hostname: &str, root: &Path) -> (String, String) {
    let account = sanitize(account);
    let account = if account.is_empty() { "site".to_string() } else { account };
    let account: String = account.chars().take(16).collect();
    let hint = sanitize(hostname.split('.').next().unwrap_or(hostname));
    let full_hint = sanitize(hostname);
    let hash: String = crypto::sha256_hex(root.to_string_lossy().as_bytes())
        .chars()
        .take(6)
        .collect();

    let db = bounded(&account, &full_hint, &hash, MAX_DB_NAME_LEN);
    let user = bounded(&account, &hint, &hash, MAX_DB_USER_LEN);
    (db, user)
}

// =============================================================================
// MySQL statement generation (identifiers backtick-quoted, literals escaped)
// =============================================================================

fn backtick_quote(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

fn account_ref(user: &str, host: &str) -> String {
    format!("{}@{}", quote_literal(user), quote_literal(host))
}

pub fn mysql_create_db_stmt(db_name: &str) -> String {
    format!(
        "CREATE DATABASE IF NOT EXISTS {} CHARACTER SET utf8 COLLATE utf8_unicode_ci",
        backtick_quote(db_name)
    )
}

pub fn mysql_create_user_stmt(user: &str, host: &str, password: &str, max_connections: u32) -> String {
    format!(
        "CREATE USER IF NOT EXISTS {} IDENTIFIED BY {} WITH MAX_USER_CONNECTIONS {}",
        account_ref(user, host),
        quote_literal(password),
        max_connections
    )
}

/// Resets the password and limit of an existing user (the CREATE above is a no-op then).
pub fn mysql_alter_user_stmt(user: &str, host: &str, password: &str, max_connections: u32) -> String {
    format!(
        "ALTER USER {} IDENTIFIED BY {} WITH MAX_USER_CONNECTIONS {}",
        account_ref(user, host),
        quote_literal(password),
        max_connections
    )
}

pub fn mysql_grant_stmt(db_name: &str, user: &str, host: &str) -> String {
    format!(
        "GRANT ALL PRIVILEGES ON {}.* TO {}",
        backtick_quote(db_name),
        account_ref(user, host)
    )
}

pub fn mysql_drop_db_stmt(db_name: &str) -> String {
    format!("DROP DATABASE IF EXISTS {}", backtick_quote(db_name))
}

pub fn mysql_drop_user_stmt(user: &str, host: &str) -> String {
    format!("DROP USER IF EXISTS {}", account_ref(user, host))
}
