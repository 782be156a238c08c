// Provisioning engine
//
// Drives one install through its states in order, stopping at the first failure. Nothing is
// rolled back; every step is safe to repeat.

use chrono::Utc;
use log::{error, info, warn};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::Duration;

use crate::account::HostingAccount;
use crate::catalog::{ReleaseCatalog, Version};
use crate::cron::{self, CronJobManager};
use crate::database::{self, provisioning, DatabaseProvisioner, DatabaseRequest};
use crate::error::{ProvisionError, ProvisionResult, WorkflowFailure};
use crate::extractor::ConfigExtractor;
use crate::fortify::{FortificationPolicy, FortifyReport};
use crate::installation::download::ArchiveDownloader;
use crate::installation::{files, CommandRunner, CommandSpec};
use crate::metadata::MetaStore;
use crate::models::instance::{DatabaseCredentials, InstalledInstance, InstanceMeta, APP_TYPE};
use crate::models::requests::{FortificationLevel, InstallOptions, SiteLocation, UninstallScope};
use crate::models::responses::{InstallReport, InstanceStatus, UninstallReport};
use crate::models::state::{ProgressEmitter, ProgressPayload, ProvisioningState};
use crate::notify::{self, InstalledNotification, Notifier};
use crate::probe;
use crate::security::crypto;
use crate::settings::Settings;
use crate::teardown::SiteTeardown;

pub const APP_NAME: &str = "WHMCS";

const ADMIN_PASSWORD_LEN: usize = 16;
const CC_ENCRYPTION_HASH_LEN: usize = 64;
const MYSQL_CHARSET: &str = "utf8";

/// Installer entry point, relative to the document root.
pub const INSTALLER_SCRIPT: &str = "install/bin/installer.php";
const INSTALLER_DIR: &str = "install";

/// Engine tunables (subset of `Settings`).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub php_binary: String,
    pub installer_timeout: Duration,
    pub cron_schedule: String,
    pub db_host: String,
    pub db_connection_limit: u32,
    pub access_scheme: String,
    pub run_as_owner: bool,
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            php_binary: settings.php_binary.clone(),
            installer_timeout: settings.installer_timeout(),
            cron_schedule: settings.cron_schedule.clone(),
            db_host: settings.db_host.clone(),
            db_connection_limit: settings.db_connection_limit,
            access_scheme: settings.access_scheme.clone(),
            run_as_owner: settings.run_as_owner,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Everything the engine talks to.
pub struct Collaborators {
    pub account: Arc<dyn HostingAccount>,
    pub catalog: Arc<ReleaseCatalog>,
    pub downloader: Arc<dyn ArchiveDownloader>,
    pub database: Arc<dyn DatabaseProvisioner>,
    pub runner: Arc<dyn CommandRunner>,
    pub cron: Arc<CronJobManager>,
    pub extractor: Arc<ConfigExtractor>,
    pub fortification: FortificationPolicy,
    pub meta: Arc<dyn MetaStore>,
    pub notifier: Arc<dyn Notifier>,
    pub teardown: Arc<dyn SiteTeardown>,
}

pub struct ProvisioningEngine {
    config: EngineConfig,
    deps: Collaborators,
    emitter: ProgressEmitter,
}

/// Bookkeeping for one install run.
struct Run {
    correlation_id: String,
    started: Instant,
    states: Vec<ProvisioningState>,
    emitter: ProgressEmitter,
}

impl Run {
    fn new(emitter: ProgressEmitter) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            started: Instant::now(),
            states: Vec::new(),
            emitter,
        }
    }

    fn current(&self) -> ProvisioningState {
        self.states
            .last()
            .copied()
            .unwrap_or(ProvisioningState::Validating)
    }

    fn enter(&mut self, state: ProvisioningState, message: impl Into<String>) {
        let message = message.into();
        info!(
            "[PHASE: install] [STEP: {}] {} (correlation_id={})",
            state, message, self.correlation_id
        );
        self.states.push(state);
        self.emit(state, "info", message);
    }

    fn emit(&self, state: ProvisioningState, severity: &str, message: String) {
        (self.emitter)(ProgressPayload {
            correlation_id: self.correlation_id.clone(),
            state,
            severity: severity.to_string(),
            percent: state.percent(),
            message,
            elapsed_ms: Some(self.started.elapsed().as_millis()),
        });
    }

    fn fail(&mut self, source: ProvisionError) -> WorkflowFailure {
        let state = self.current();
        error!(
            "[PHASE: install] [STEP: {}] Failed (correlation_id={}): {}",
            state, self.correlation_id, source
        );
        self.emit(ProvisioningState::Failed, "error", format!("{} failed: {}", state, source));
        self.states.push(ProvisioningState::Failed);
        WorkflowFailure::new(state, source)
    }
}

impl ProvisioningEngine {
    pub fn new(config: EngineConfig, deps: Collaborators, emitter: ProgressEmitter) -> Self {
        Self {
            config,
            deps,
            emitter,
        }
    }

    fn run_as(&self, owner: &str) -> Option<String> {
        self.config.run_as_owner.then(|| owner.to_string())
    }

    async fn site_names(&self, location: &SiteLocation, root: &Path) -> (String, String) {
        match location {
            SiteLocation::Site { hostname, path } => (hostname.clone(), path.clone()),
            SiteLocation::Path(_) => match self.deps.account.site_for(root).await {
                Some(site) => site,
                None => (
                    root.file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| "site".to_string()),
                    String::new(),
                ),
            },
        }
    }

    // =========================================================================
    // Install
    // =========================================================================

    pub async fn install(
        &self,
        location: &SiteLocation,
        options: &InstallOptions,
    ) -> Result<InstallReport, WorkflowFailure> {
        let mut run = Run::new(self.emitter.clone());
        match self.install_steps(&mut run, location, options).await {
            Ok(report) => Ok(report),
            Err(e) => Err(run.fail(e)),
        }
    }

    async fn install_steps(
        &self,
        run: &mut Run,
        location: &SiteLocation,
        options: &InstallOptions,
    ) -> ProvisionResult<InstallReport> {
        // ---- Validating -----------------------------------------------------
        run.enter(ProvisioningState::Validating, format!("Validating install of {} on {}", APP_NAME, location));
        let validated = options.validate()?;
        info!(
            "[PHASE: install] [STEP: validate] Options accepted (version={}, admin={}, license_fingerprint={}, fortify={})",
            validated.version.as_deref().unwrap_or("latest"),
            validated.admin_username,
            crypto::secret_fingerprint(&validated.license_key),
            validated.fortification_level
        );

        if !self.deps.database.is_available().await {
            return Err(ProvisionError::PreconditionFailed(format!(
                "MySQL must be enabled to install {}",
                APP_NAME
            )));
        }
        let root = self.deps.account.resolve(location).await?;
        let owner = self.deps.account.docroot_owner(&root).await?;
        self.deps.cron.ensure_scheduling(&owner).await?;
        let (hostname, uri_path) = self.site_names(location, &root).await;

        // ---- Downloading ----------------------------------------------------
        run.enter(ProvisioningState::Downloading, "Resolving release");
        let release = self.deps.catalog.resolve(validated.version.as_deref()).await?;
        info!(
            "[PHASE: install] [STEP: download] Installing {} {} into {:?}",
            APP_NAME, release.version, root
        );
        self.deps
            .downloader
            .fetch_and_unpack(&release.download_url, &root)
            .await
            .map_err(|e| ProvisionError::DownloadFailed(format!("{}: {:#}", release.download_url, e)))?;

        // ---- ProvisioningDatabase -------------------------------------------
        run.enter(ProvisioningState::ProvisioningDatabase, "Creating database");
        let (db_name, db_user) = provisioning::names_for(&owner, &hostname, &root);
        let creds = self
            .deps
            .database
            .create(&DatabaseRequest {
                database: db_name,
                username: db_user,
                host: self.config.db_host.clone(),
                connection_limit: database::effective_connection_limit(self.config.db_connection_limit),
            })
            .await?;

        // ---- RunningInstaller -----------------------------------------------
        run.enter(ProvisioningState::RunningInstaller, "Running application installer");
        let admin_password = match validated.admin_password.clone() {
            Some(p) => p,
            None => crypto::generate_password(ADMIN_PASSWORD_LEN)
                .map_err(|e| ProvisionError::PreconditionFailed(e.to_string()))?,
        };
        self.run_installer(
            &root,
            &owner,
            &validated.admin_username,
            &admin_password,
            &validated.license_key,
            &creds,
        )
        .await?;

        // ---- SchedulingMaintenance ------------------------------------------
        run.enter(ProvisioningState::SchedulingMaintenance, "Registering maintenance task");
        self.deps
            .cron
            .ensure_job(
                &root,
                &self.config.cron_schedule,
                &cron::maintenance_command(&root),
                &owner,
            )
            .await?;

        // ---- PersistingMetadata ---------------------------------------------
        run.enter(ProvisioningState::PersistingMetadata, "Recording instance metadata");
        self.persist_metadata(&root, &hostname, &uri_path, &release.version, options, validated.fortification_level)
            .await?;

        // ---- Fortifying -----------------------------------------------------
        run.enter(
            ProvisioningState::Fortifying,
            format!("Applying {} fortification", validated.fortification_level),
        );
        self.deps
            .fortification
            .apply(&root, validated.fortification_level)
            .await?;

        // ---- Notifying ------------------------------------------------------
        run.enter(ProvisioningState::Notifying, "Sending installed notification");
        let access_url = notify::access_url(&self.config.access_scheme, &hostname, &uri_path);
        let notified = if validated.notify {
            let event = InstalledNotification {
                app_name: APP_NAME.to_string(),
                hostname: hostname.clone(),
                path: uri_path.clone(),
                admin_username: validated.admin_username.clone(),
                admin_password: admin_password.clone(),
                access_url: access_url.clone(),
                fortification: validated.fortification_level.to_string(),
            };
            match self.deps.notifier.notify_installed(&event).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        "[PHASE: install] [STEP: notify] Notification failed; install is complete: {:#}",
                        e
                    );
                    run.emit(ProvisioningState::Notifying, "warn", format!("Notification failed: {}", e));
                    false
                }
            }
        } else {
            info!("[PHASE: install] [STEP: notify] Notification disabled");
            false
        };

        run.enter(ProvisioningState::Done, format!("{} {} installed", APP_NAME, release.version));
        Ok(InstallReport {
            correlation_id: run.correlation_id.clone(),
            document_root: root,
            version: release.version,
            admin_username: validated.admin_username,
            admin_password,
            access_url,
            final_state: ProvisioningState::Done,
            states: run.states.clone(),
            notified,
            duration_ms: run.started.elapsed().as_millis(),
        })
    }

    async fn run_installer(
        &self,
        root: &Path,
        owner: &str,
        admin_username: &str,
        admin_password: &str,
        license_key: &str,
        creds: &DatabaseCredentials,
    ) -> ProvisionResult<()> {
        let cc_encryption_hash = crypto::generate_secret(CC_ENCRYPTION_HASH_LEN)
            .map_err(|e| ProvisionError::PreconditionFailed(e.to_string()))?;
        let payload = json!({
            "admin": {
                "username": admin_username,
                "password": admin_password,
            },
            "configuration": {
                "license": license_key,
                "db_host": creds.host,
                "db_username": creds.username,
                "db_password": creds.password,
                "db_name": creds.database,
                "cc_encryption_hash": cc_encryption_hash,
                "mysql_charset": MYSQL_CHARSET,
            },
        });
        let stdin = serde_json::to_vec(&payload)
            .map_err(|e| ProvisionError::PreconditionFailed(e.to_string()))?;

        let script = root.join(INSTALLER_SCRIPT);
        let spec = CommandSpec::new(
            self.config.php_binary.clone(),
            vec![
                "-f".to_string(),
                script.to_string_lossy().to_string(),
                "--".to_string(),
                "-i".to_string(),
                "-n".to_string(),
                "-c".to_string(),
            ],
            "whmcs_installer",
        )
        .cwd(root)
        .stdin(stdin)
        .timeout(self.config.installer_timeout)
        .run_as(self.run_as(owner));

        let out = self.deps.runner.run(spec).await.map_err(|e| {
            ProvisionError::InstallerSubprocessFailed {
                message: "could not run installer".to_string(),
                diagnostics: format!("{:#}", e),
            }
        })?;
        if !out.success() || !out.stderr.trim().is_empty() {
            return Err(ProvisionError::InstallerSubprocessFailed {
                message: match out.exit_code {
                    Some(code) => format!("exit code {}", code),
                    None => "terminated by signal".to_string(),
                },
                diagnostics: out.diagnostics(),
            });
        }

        let installer_dir = root.join(INSTALLER_DIR);
        files::remove_dir_if_exists(&installer_dir).await.map_err(|e| {
            ProvisionError::InstallerSubprocessFailed {
                message: format!("could not remove {}", installer_dir.display()),
                diagnostics: format!("{:#}", e),
            }
        })?;
        info!(
            "[PHASE: install] [STEP: installer] Installer finished in {}ms; removed {:?}",
            out.duration_ms, installer_dir
        );
        Ok(())
    }

    async fn persist_metadata(
        &self,
        root: &Path,
        hostname: &str,
        uri_path: &str,
        version: &str,
        options: &InstallOptions,
        level: FortificationLevel,
    ) -> ProvisionResult<()> {
        let now = Utc::now();
        let previous = self.deps.meta.load(root).await?;
        let meta = InstanceMeta {
            app_type: APP_TYPE.to_string(),
            version: Some(version.to_string()),
            hostname: hostname.to_string(),
            path: uri_path.to_string(),
            install_options: options.redacted(),
            fortification: level,
            installed_at: previous.as_ref().map(|m| m.installed_at).unwrap_or(now),
            updated_at: previous.map(|_| now),
        };
        self.deps.meta.save(root, &meta).await?;

        files::write_file_atomic(
            &probe::version_marker_path(root),
            format!("{}\n", version).as_bytes(),
            "write_version_marker",
        )
        .await
        .map_err(|e| ProvisionError::MetadataFailed(format!("{:#}", e)))
    }

    // =========================================================================
    // Other operations
    // =========================================================================

    async fn installed_root(&self, location: &SiteLocation) -> ProvisionResult<PathBuf> {
        let root = self.deps.account.resolve(location).await?;
        if !probe::is_installed(&root).await {
            return Err(ProvisionError::NotInstalled(root));
        }
        Ok(root)
    }

    /// Remove scheduled tasks, then hand over to the generic teardown.
    pub async fn uninstall(
        &self,
        location: &SiteLocation,
        scope: UninstallScope,
    ) -> ProvisionResult<UninstallReport> {
        let root = self.deps.account.resolve(location).await?;
        let has_meta = self.deps.meta.load(&root).await?.is_some();
        if !has_meta && !probe::is_installed(&root).await {
            return Err(ProvisionError::NotInstalled(root));
        }
        let owner = self.deps.account.docroot_owner(&root).await?;

        info!("[PHASE: uninstall] [STEP: start] Removing {} at {:?}", APP_NAME, root);
        let cron_jobs_removed = self.deps.cron.remove_jobs(&root).await;
        let warnings = self.deps.teardown.teardown(&root, &owner, scope).await?;

        Ok(UninstallReport {
            document_root: root,
            cron_jobs_removed,
            warnings,
        })
    }

    /// Re-apply a fortification level to an installed instance and record it.
    pub async fn fortify(
        &self,
        location: &SiteLocation,
        level: FortificationLevel,
    ) -> ProvisionResult<FortifyReport> {
        let root = self.installed_root(location).await?;
        let report = self.deps.fortification.apply(&root, level).await?;

        if let Some(mut meta) = self.deps.meta.load(&root).await? {
            meta.fortification = level;
            meta.updated_at = Some(Utc::now());
            self.deps.meta.save(&root, &meta).await?;
        }
        Ok(report)
    }

    pub async fn db_config(&self, location: &SiteLocation) -> ProvisionResult<DatabaseCredentials> {
        let root = self.deps.account.resolve(location).await?;
        let owner = self.deps.account.docroot_owner(&root).await?;
        self.deps
            .extractor
            .extract_database_config(&root, self.run_as(&owner).as_deref())
            .await
    }

    /// The installed instance at `location`. Credentials are `None` when the configuration
    /// cannot be read; the fortification level comes from metadata (default max).
    pub async fn instance(&self, location: &SiteLocation) -> ProvisionResult<InstalledInstance> {
        let root = self.installed_root(location).await?;
        let version = probe::installed_version(&root)
            .await
            .map_err(|e| ProvisionError::MetadataFailed(format!("{:#}", e)))?;
        let owner = self.deps.account.docroot_owner(&root).await?;
        let database_credentials = match self
            .deps
            .extractor
            .extract_database_config(&root, self.run_as(&owner).as_deref())
            .await
        {
            Ok(creds) => Some(creds),
            Err(e) => {
                warn!("[PHASE: status] [STEP: db_config] {}", e);
                None
            }
        };
        let fortification_level = self
            .deps
            .meta
            .load(&root)
            .await?
            .map(|m| m.fortification)
            .unwrap_or_default();

        Ok(InstalledInstance {
            document_root: root,
            version,
            database_credentials,
            fortification_level,
        })
    }

    pub async fn versions(&self) -> Vec<String> {
        self.deps.catalog.get_versions().await
    }

    pub async fn installed_version(&self, location: &SiteLocation) -> ProvisionResult<Option<String>> {
        let root = self.deps.account.resolve(location).await?;
        probe::installed_version(&root)
            .await
            .map_err(|e| ProvisionError::MetadataFailed(format!("{:#}", e)))
    }

    pub async fn is_installed(&self, location: &SiteLocation) -> ProvisionResult<bool> {
        let root = self.deps.account.resolve(location).await?;
        Ok(probe::is_installed(&root).await)
    }

    pub async fn status(&self, location: &SiteLocation) -> ProvisionResult<InstanceStatus> {
        let root = self.deps.account.resolve(location).await?;
        let installed = probe::is_installed(&root).await;
        let version = probe::installed_version(&root)
            .await
            .map_err(|e| ProvisionError::MetadataFailed(format!("{:#}", e)))?
            .filter(|v| !v.is_empty());
        let meta = self.deps.meta.load(&root).await?;
        let latest_version = self.deps.catalog.get_latest().await.ok().map(|r| r.version);

        let upgrade_available = match (&version, &latest_version) {
            (Some(current), Some(latest)) if installed => {
                Version::new(latest.as_str()) > Version::new(current.as_str())
            }
            _ => false,
        };

        Ok(InstanceStatus {
            document_root: root,
            installed,
            version,
            latest_version,
            upgrade_available,
            meta,
        })
    }
}
