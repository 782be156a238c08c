// Per-instance database provisioning

pub mod mysql;
pub mod provisioning;

use async_trait::async_trait;

use crate::error::ProvisionResult;
use crate::models::instance::DatabaseCredentials;

/// Installs never get fewer concurrent connections than this, whatever the account default.
pub const MIN_CONNECTION_LIMIT: u32 = 15;

pub fn effective_connection_limit(account_default: u32) -> u32 {
    account_default.max(MIN_CONNECTION_LIMIT)
}

/// What to create for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseRequest {
    pub database: String,
    pub username: String,
    /// Host the application connects from/to (also the MySQL account host).
    pub host: String,
    pub connection_limit: u32,
}

#[async_trait]
pub trait DatabaseProvisioner: Send + Sync {
    /// Whether the database engine is enabled and reachable for this account.
    async fn is_available(&self) -> bool;

    /// Create (or reuse) the database and user and return credentials with a fresh password.
    async fn create(&self, request: &DatabaseRequest) -> ProvisionResult<DatabaseCredentials>;

    /// Drop the database and user. Missing objects are not an error.
    async fn destroy(&self, credentials: &DatabaseCredentials) -> ProvisionResult<()>;
}
