// MySQL provisioner (sqlx)
//
// Connects with an administrative account and issues the idempotent DDL built in
// `provisioning`. Statements go over the text protocol (`raw_sql`) because MySQL cannot
// prepare every account-management statement.

use async_trait::async_trait;
use log::{info, warn};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use std::time::Duration;

use super::provisioning::{self, validate_db_name, validate_db_user};
use super::{DatabaseProvisioner, DatabaseRequest};
use crate::error::{ProvisionError, ProvisionResult};
use crate::models::instance::DatabaseCredentials;
use crate::security::crypto;
use crate::utils::logging::mask_database_url;

const GENERATED_PASSWORD_LEN: usize = 24;

pub struct MySqlProvisioner {
    admin_url: String,
    acquire_timeout: Duration,
}

impl MySqlProvisioner {
    pub fn new(admin_url: impl Into<String>) -> Self {
        Self {
            admin_url: admin_url.into(),
            acquire_timeout: Duration::from_secs(10),
        }
    }

    async fn pool(&self) -> ProvisionResult<MySqlPool> {
        MySqlPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(self.acquire_timeout)
            .connect(&self.admin_url)
            .await
            .map_err(|e| {
                ProvisionError::DatabaseProvisioningFailed(format!(
                    "Unable to connect to {}: {}",
                    mask_database_url(&self.admin_url),
                    e
                ))
            })
    }

    /// Execute statements in order; `label`s (never the SQL, which may hold passwords) go to errors.
    async fn execute_all(&self, pool: &MySqlPool, statements: &[(&str, String)]) -> ProvisionResult<()> {
        for (label, sql) in statements {
            sqlx::raw_sql(sql).execute(pool).await.map_err(|e| {
                ProvisionError::DatabaseProvisioningFailed(format!("{} failed: {}", label, e))
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseProvisioner for MySqlProvisioner {
    async fn is_available(&self) -> bool {
        let pool = match self.pool().await {
            Ok(p) => p,
            Err(e) => {
                warn!("[PHASE: database] [STEP: ping] {}", e);
                return false;
            }
        };
        let ok = sqlx::raw_sql("SELECT 1").execute(&pool).await.is_ok();
        pool.close().await;
        ok
    }

    async fn create(&self, request: &DatabaseRequest) -> ProvisionResult<DatabaseCredentials> {
        validate_db_name(&request.database).map_err(ProvisionError::DatabaseProvisioningFailed)?;
        validate_db_user(&request.username).map_err(ProvisionError::DatabaseProvisioningFailed)?;

        let password = crypto::generate_password(GENERATED_PASSWORD_LEN)
            .map_err(|e| ProvisionError::DatabaseProvisioningFailed(e.to_string()))?;

        let statements = [
            ("create database", provisioning::mysql_create_db_stmt(&request.database)),
            (
                "create user",
                provisioning::mysql_create_user_stmt(
                    &request.username,
                    &request.host,
                    &password,
                    request.connection_limit,
                ),
            ),
            (
                "reset user",
                provisioning::mysql_alter_user_stmt(
                    &request.username,
                    &request.host,
                    &password,
                    request.connection_limit,
                ),
            ),
            (
                "grant privileges",
                provisioning::mysql_grant_stmt(&request.database, &request.username, &request.host),
            ),
        ];

        let pool = self.pool().await?;
        let result = self.execute_all(&pool, &statements).await;
        pool.close().await;
        result?;

        info!(
            "[PHASE: database] [STEP: create] Database ready (db={}, user={}, host={}, connection_limit={})",
            request.database, request.username, request.host, request.connection_limit
        );
        Ok(DatabaseCredentials {
            host: request.host.clone(),
            username: request.username.clone(),
            password,
            database: request.database.clone(),
            connection_limit: request.connection_limit,
            prefix: String::new(),
        })
    }

    async fn destroy(&self, credentials: &DatabaseCredentials) -> ProvisionResult<()> {
        validate_db_name(&credentials.database).map_err(ProvisionError::DatabaseProvisioningFailed)?;
        validate_db_user(&credentials.username).map_err(ProvisionError::DatabaseProvisioningFailed)?;

        let statements = [
            ("drop database", provisioning::mysql_drop_db_stmt(&credentials.database)),
            (
                "drop user",
                provisioning::mysql_drop_user_stmt(&credentials.username, &credentials.host),
            ),
        ];
        let pool = self.pool().await?;
        let result = self.execute_all(&pool, &statements).await;
        pool.close().await;
        result?;

        info!(
            "[PHASE: database] [STEP: drop] Dropped db={} user={}",
            credentials.database, credentials.username
        );
        Ok(())
    }
}
